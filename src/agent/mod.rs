//! Offline cache agent: install, activate and fetch handlers over one
//! versioned bucket.
//!
//! - Install stores the shell assets, all or nothing.
//! - Activate deletes every bucket except the current version's.
//! - Fetch is always network-first; the bucket is only a fallback when the
//!   network fails.

mod lifecycle;

use color_eyre::{
  eyre::{eyre, WrapErr},
  Result,
};
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheResult, CacheStorage, RequestKey};
use crate::config::{CacheWriteMode, Config, DEFAULT_SHELL_ASSETS};
use crate::net::{Network, Request, Response};

use lifecycle::Lifecycle;
pub use lifecycle::Phase;

/// Everything an agent needs to know about the version it serves.
#[derive(Debug, Clone)]
pub struct AgentSettings {
  /// Name of the current bucket
  pub cache_name: String,
  /// Base URL shell assets resolve against
  pub scope: Url,
  pub shell_assets: Vec<String>,
  pub cache_write: CacheWriteMode,
}

impl AgentSettings {
  pub fn new(cache_name: impl Into<String>, scope: Url) -> Self {
    Self {
      cache_name: cache_name.into(),
      scope,
      shell_assets: DEFAULT_SHELL_ASSETS.iter().map(|s| s.to_string()).collect(),
      cache_write: CacheWriteMode::default(),
    }
  }

  pub fn from_config(config: &Config) -> Result<Self> {
    Ok(
      Self::new(config.cache_name.clone(), config.scope_url()?)
        .with_shell_assets(config.shell_assets.clone())
        .with_cache_write(config.cache_write),
    )
  }

  pub fn with_shell_assets<I, S>(mut self, assets: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.shell_assets = assets.into_iter().map(Into::into).collect();
    self
  }

  pub fn with_cache_write(mut self, mode: CacheWriteMode) -> Self {
    self.cache_write = mode;
    self
  }

  /// Resolve a path or URL against the scope.
  pub fn resolve(&self, target: &str) -> Result<Url> {
    self
      .scope
      .join(target)
      .map_err(|e| eyre!("Cannot resolve '{}' against {}: {}", target, self.scope, e))
  }

  /// GET requests for every shell asset, in list order.
  pub fn shell_requests(&self) -> Result<Vec<Request>> {
    self
      .shell_assets
      .iter()
      .map(|asset| self.resolve(asset).map(Request::get))
      .collect()
  }
}

/// What a successful install reports back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
  /// Number of shell entries written
  pub cached: usize,
  /// Activate right away instead of waiting for old clients to go away
  pub skip_waiting: bool,
}

/// What a successful activation reports back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
  /// Stale buckets that were deleted
  pub deleted: Vec<String>,
  /// Already-open clients are now controlled by this version
  pub clients_claimed: bool,
}

/// The offline cache agent.
///
/// Clones share storage, network and lifecycle state.
pub struct OfflineAgent<S: CacheStorage, N: Network> {
  storage: Arc<S>,
  network: Arc<N>,
  settings: Arc<AgentSettings>,
  lifecycle: Arc<Lifecycle>,
}

impl<S: CacheStorage, N: Network> OfflineAgent<S, N> {
  pub fn new(storage: S, network: N, settings: AgentSettings) -> Self {
    Self {
      storage: Arc::new(storage),
      network: Arc::new(network),
      settings: Arc::new(settings),
      lifecycle: Arc::new(Lifecycle::new()),
    }
  }

  pub fn settings(&self) -> &AgentSettings {
    &self.settings
  }

  #[cfg(test)]
  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn phase(&self) -> Result<Phase> {
    self.lifecycle.phase()
  }

  pub fn clients_claimed(&self) -> Result<bool> {
    self.lifecycle.clients_claimed()
  }

  /// Store every shell asset in the current bucket.
  ///
  /// All assets are fetched concurrently. A network error or a non-2xx
  /// status for any one of them fails the whole install and nothing is
  /// written. On failure a fresh agent becomes redundant; calling `install`
  /// again retries. An activated agent stays activated whatever the
  /// outcome, and keeps serving from the bucket it already has.
  pub async fn install(&self) -> Result<InstallOutcome> {
    self.lifecycle.begin_install()?;
    info!(cache = %self.settings.cache_name, "installing");

    match self.populate_shell().await {
      Ok(cached) => {
        let phase = self.lifecycle.finish_install(true)?;
        info!(cache = %self.settings.cache_name, cached, %phase, "installed");
        Ok(InstallOutcome {
          cached,
          skip_waiting: true,
        })
      }
      Err(e) => {
        let phase = self.lifecycle.finish_install(false)?;
        warn!(cache = %self.settings.cache_name, %phase, error = %e, "install failed");
        Err(e)
      }
    }
  }

  async fn populate_shell(&self) -> Result<usize> {
    let requests = self.settings.shell_requests()?;

    let responses = try_join_all(requests.iter().map(|r| self.fetch_shell_asset(r))).await?;

    let entries = requests
      .iter()
      .zip(responses)
      .map(|(request, response)| {
        let key = RequestKey::for_request(request)
          .ok_or_else(|| eyre!("Shell asset {} is not cacheable", request.url))?;
        Ok((key, response))
      })
      .collect::<Result<Vec<_>>>()?;

    self
      .storage
      .put_all(&self.settings.cache_name, &entries)
      .wrap_err("Failed to store shell assets")?;

    Ok(entries.len())
  }

  async fn fetch_shell_asset(&self, request: &Request) -> Result<Response> {
    let response = self
      .network
      .fetch(request)
      .await
      .wrap_err_with(|| format!("Failed to fetch shell asset {}", request.url))?;

    if !response.is_ok() {
      return Err(eyre!(
        "Shell asset {} returned status {}",
        request.url,
        response.status
      ));
    }

    Ok(response)
  }

  /// Take control: delete every bucket but the current one.
  pub async fn activate(&self) -> Result<ActivateOutcome> {
    self
      .lifecycle
      .begin("activate", |p| p == Phase::Installed, Phase::Activating)?;

    let deleted = match self.purge_stale_buckets() {
      Ok(deleted) => deleted,
      Err(e) => {
        self.lifecycle.set(Phase::Installed)?;
        return Err(e);
      }
    };

    self.lifecycle.set(Phase::Activated)?;
    self.lifecycle.claim_clients()?;
    info!(cache = %self.settings.cache_name, deleted = deleted.len(), "activated");

    Ok(ActivateOutcome {
      deleted,
      clients_claimed: true,
    })
  }

  fn purge_stale_buckets(&self) -> Result<Vec<String>> {
    let stale: Vec<String> = self
      .storage
      .keys()?
      .into_iter()
      .filter(|name| name != &self.settings.cache_name)
      .collect();

    for name in &stale {
      self.storage.delete(name)?;
      debug!(bucket = %name, "deleted stale bucket");
    }

    Ok(stale)
  }

  /// Install, then activate immediately if install asks to skip waiting.
  pub async fn start(&self) -> Result<(InstallOutcome, Option<ActivateOutcome>)> {
    let installed = self.install().await?;
    let activated = if installed.skip_waiting {
      Some(self.activate().await?)
    } else {
      None
    };
    Ok((installed, activated))
  }

  /// Pick up a version that was installed and activated by an earlier
  /// process.
  ///
  /// Activation leaves the current bucket as the only one, so that is what
  /// is checked for. Returns false if the current bucket is missing or stale
  /// buckets remain, meaning the version was installed but never activated.
  pub fn resume(&self) -> Result<bool> {
    if self.phase()? == Phase::Activated {
      return Ok(true);
    }
    let buckets = self.storage.keys()?;
    if buckets.len() != 1 || buckets[0] != self.settings.cache_name {
      debug!(cache = %self.settings.cache_name, ?buckets, "nothing to resume");
      return Ok(false);
    }

    self
      .lifecycle
      .begin("resume", |p| p == Phase::Parsed, Phase::Activated)?;
    self.lifecycle.claim_clients()?;
    debug!(cache = %self.settings.cache_name, "resumed");
    Ok(true)
  }

  /// Pick up a version that was installed by an earlier process so it can
  /// be activated. Returns false if the current bucket doesn't exist.
  pub fn restore_installed(&self) -> Result<bool> {
    if !self.storage.has(&self.settings.cache_name)? {
      return Ok(false);
    }

    self
      .lifecycle
      .begin("restore", |p| p == Phase::Parsed, Phase::Installed)?;
    Ok(true)
  }

  /// Handle an intercepted request, network first.
  ///
  /// A network response of any status is returned and a copy is written to
  /// the current bucket. If the network fails for any reason the stored
  /// response for the request is returned instead; if there is none the
  /// network error is returned.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    self
      .lifecycle
      .require("fetch", |p| p.can_intercept_fetch())?;

    let key = RequestKey::for_request(request);

    match self.network.fetch(request).await {
      Ok(response) => {
        match key {
          Some(key) if !response.is_partial() => self.store(key, response.clone()).await,
          Some(key) => debug!(%key, "not caching partial response"),
          None => debug!(method = %request.method, url = %request.url, "not caching non-GET response"),
        }
        Ok(CacheResult::from_network(response))
      }
      Err(network_error) => {
        debug!(url = %request.url, error = %network_error, "network failed, trying cache");

        let cached = match &key {
          Some(key) => self.storage.match_entry(&self.settings.cache_name, key)?,
          None => None,
        };

        match cached {
          Some(entry) => {
            info!(url = %request.url, "serving cached response");
            Ok(CacheResult::offline(entry.response, entry.stored_at))
          }
          None => Err(network_error.wrap_err(format!(
            "No cached response for {} {}",
            request.method, request.url
          ))),
        }
      }
    }
  }

  /// Write a network response to the current bucket.
  ///
  /// In detached mode this returns before the write finishes.
  async fn store(&self, key: RequestKey, response: Response) {
    let storage = Arc::clone(&self.storage);
    let bucket = self.settings.cache_name.clone();

    let write = tokio::task::spawn_blocking(move || {
      if let Err(e) = storage.put(&bucket, &key, &response) {
        warn!(%key, error = %e, "failed to cache response");
      }
    });

    if self.settings.cache_write == CacheWriteMode::Awaited {
      if let Err(e) = write.await {
        warn!(error = %e, "cache write task failed");
      }
    }
  }
}

impl<S: CacheStorage, N: Network> Clone for OfflineAgent<S, N> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      settings: Arc::clone(&self.settings),
      lifecycle: Arc::clone(&self.lifecycle),
    }
  }
}
