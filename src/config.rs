use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Bucket name for the current version of the shell.
pub const DEFAULT_CACHE_NAME: &str = "scheer-playbooks-v2";

/// Resources stored at install time, relative to the scope.
pub const DEFAULT_SHELL_ASSETS: &[&str] = &["./", "./index.html", "./manifest.json"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Name of the current bucket; bump it to ship a new version
  pub cache_name: String,
  /// Base URL the shell is served from
  pub scope: Option<String>,
  pub shell_assets: Vec<String>,
  pub cache_write: CacheWriteMode,
  /// SQLite database path (defaults to $XDG_DATA_HOME/shellcache/cache.db)
  pub database: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      cache_name: DEFAULT_CACHE_NAME.to_string(),
      scope: None,
      shell_assets: DEFAULT_SHELL_ASSETS.iter().map(|s| s.to_string()).collect(),
      cache_write: CacheWriteMode::default(),
      database: None,
    }
  }
}

/// When a response fetched from the network is written to the bucket.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheWriteMode {
  /// Return the response right away and write in the background.
  /// A crash before the write completes loses the update.
  #[default]
  Detached,
  /// Finish the write before returning the response
  Awaited,
}

impl Config {
  /// Load configuration from file, falling back to built-in defaults.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./shellcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/shellcache/config.yaml
  ///
  /// Environment overrides (SHELLCACHE_SCOPE, SHELLCACHE_CACHE_NAME) are
  /// applied on top.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    Ok(config.with_env_overrides(|name| std::env::var(name).ok()))
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("shellcache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("shellcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  fn with_env_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
    if let Some(scope) = var("SHELLCACHE_SCOPE") {
      self.scope = Some(scope);
    }
    if let Some(name) = var("SHELLCACHE_CACHE_NAME") {
      self.cache_name = name;
    }
    self
  }

  /// The scope as a URL.
  ///
  /// Relative asset paths like `./index.html` resolve against it, so a scope
  /// without a trailing slash gets one.
  pub fn scope_url(&self) -> Result<url::Url> {
    let raw = self.scope.as_deref().ok_or_else(|| {
      eyre!("No scope configured. Pass --scope, set SHELLCACHE_SCOPE, or add `scope:` to the config file.")
    })?;

    let mut url =
      url::Url::parse(raw).map_err(|e| eyre!("Invalid scope URL '{}': {}", raw, e))?;
    if !url.path().ends_with('/') {
      let path = format!("{}/", url.path());
      url.set_path(&path);
    }

    Ok(url)
  }

  /// Path of the SQLite database.
  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => crate::cache::SqliteStorage::default_path(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.cache_name, "scheer-playbooks-v2");
    assert_eq!(config.shell_assets, vec!["./", "./index.html", "./manifest.json"]);
    assert_eq!(config.cache_write, CacheWriteMode::Detached);
    assert!(config.scope.is_none());
  }

  #[test]
  fn test_parse_partial_file_keeps_defaults() {
    let config = Config::parse("scope: https://playbooks.test/app/\ncache_write: awaited\n").unwrap();
    assert_eq!(config.scope.as_deref(), Some("https://playbooks.test/app/"));
    assert_eq!(config.cache_write, CacheWriteMode::Awaited);
    assert_eq!(config.cache_name, DEFAULT_CACHE_NAME);
    assert_eq!(config.shell_assets.len(), 3);
  }

  #[test]
  fn test_parse_full_file() {
    let yaml = r#"
cache_name: scheer-playbooks-v3
scope: https://playbooks.test/
shell_assets:
  - ./
  - ./app.js
database: /tmp/shellcache-test.db
"#;
    let config = Config::parse(yaml).unwrap();
    assert_eq!(config.cache_name, "scheer-playbooks-v3");
    assert_eq!(config.shell_assets, vec!["./", "./app.js"]);
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/shellcache-test.db"));
  }

  #[test]
  fn test_parse_rejects_unknown_write_mode() {
    assert!(Config::parse("cache_write: sometimes\n").is_err());
  }

  #[test]
  fn test_env_overrides() {
    let env: HashMap<&str, &str> = [
      ("SHELLCACHE_SCOPE", "https://env.test/"),
      ("SHELLCACHE_CACHE_NAME", "from-env"),
    ]
    .into_iter()
    .collect();

    let config = Config::default().with_env_overrides(|name| env.get(name).map(|v| v.to_string()));
    assert_eq!(config.scope.as_deref(), Some("https://env.test/"));
    assert_eq!(config.cache_name, "from-env");
  }

  #[test]
  fn test_scope_url_adds_trailing_slash() {
    let config = Config {
      scope: Some("https://playbooks.test/app".to_string()),
      ..Config::default()
    };
    assert_eq!(config.scope_url().unwrap().as_str(), "https://playbooks.test/app/");
  }

  #[test]
  fn test_scope_url_required() {
    assert!(Config::default().scope_url().is_err());
  }

  #[test]
  fn test_load_explicit_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "cache_name: from-file\n").unwrap();

    let config = Config::load(Some(&path)).unwrap();
    assert_eq!(config.cache_name, "from-file");
  }

  #[test]
  fn test_load_missing_explicit_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    assert!(Config::load(Some(&dir.path().join("nope.yaml"))).is_err());
  }
}
