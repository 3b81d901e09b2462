mod agent;
mod cache;
mod config;
mod net;

use clap::{ArgAction, Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use agent::{AgentSettings, OfflineAgent};
use cache::{CacheResult, CacheSource, CacheStorage, SqliteStorage};
use config::{CacheWriteMode, Config};
use net::{HttpNetwork, Request, Response};

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Network-first offline cache for a web application shell")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./shellcache.yaml or $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Base URL the shell is served from
  #[arg(short, long, global = true)]
  scope: Option<String>,

  /// Path to the cache database
  #[arg(long, global = true)]
  database: Option<PathBuf>,

  /// Increase log verbosity (-v info, -vv debug)
  #[arg(short, long, action = ArgAction::Count, global = true)]
  verbose: u8,

  /// Write logs to this file instead of stderr
  #[arg(long, global = true)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the shell and take control right away
  Start,
  /// Fetch the shell assets into the current bucket
  Install,
  /// Delete every bucket except the current one
  Activate,
  /// Fetch a resource, falling back to the cache when offline
  Fetch(FetchArgs),
  /// List buckets and their entries
  Buckets,
}

#[derive(clap::Args, Debug)]
struct FetchArgs {
  /// Path relative to the scope, or an absolute URL
  target: String,

  /// Request method
  #[arg(short = 'X', long, default_value = "GET")]
  method: String,

  /// Request header as "name: value" (repeatable)
  #[arg(short = 'H', long = "header")]
  headers: Vec<String>,

  /// Request body
  #[arg(short, long)]
  data: Option<String>,

  /// Write the body to a file instead of stdout
  #[arg(short, long)]
  output: Option<PathBuf>,

  /// Finish the cache write before exiting
  #[arg(long)]
  await_write: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.verbose, args.log_file.as_deref())?;

  // Command line overrides config file and environment
  let mut config = Config::load(args.config.as_deref())?;
  if let Some(scope) = args.scope {
    config.scope = Some(scope);
  }
  if let Some(database) = args.database {
    config.database = Some(database);
  }

  let storage = SqliteStorage::open_at(&config.database_path()?)?;

  match args.command {
    Command::Buckets => list_buckets(&storage, &config.cache_name),
    Command::Start => {
      let agent = build_agent(&config, storage, false)?;
      let (installed, activated) = agent.start().await?;
      println!("installed {} shell assets into {}", installed.cached, agent.settings().cache_name);
      if let Some(activated) = activated {
        print_activation(&activated);
      }
      log_done(&agent)
    }
    Command::Install => {
      let agent = build_agent(&config, storage, false)?;
      let installed = agent.install().await?;
      println!("installed {} shell assets into {}", installed.cached, agent.settings().cache_name);
      log_done(&agent)
    }
    Command::Activate => {
      let agent = build_agent(&config, storage, false)?;
      if !agent.restore_installed()? {
        return Err(eyre!(
          "{} is not installed. Run `shellcache install` first.",
          agent.settings().cache_name
        ));
      }
      let activated = agent.activate().await?;
      print_activation(&activated);
      log_done(&agent)
    }
    Command::Fetch(fetch_args) => {
      let agent = build_agent(&config, storage, fetch_args.await_write)?;
      fetch(&agent, fetch_args).await?;
      log_done(&agent)
    }
  }
}

type Agent = OfflineAgent<SqliteStorage, HttpNetwork>;

fn build_agent(config: &Config, storage: SqliteStorage, await_write: bool) -> Result<Agent> {
  let mut settings = AgentSettings::from_config(config)?;
  if await_write {
    settings = settings.with_cache_write(CacheWriteMode::Awaited);
  }
  Ok(OfflineAgent::new(storage, HttpNetwork::new()?, settings))
}

fn log_done(agent: &Agent) -> Result<()> {
  info!(phase = %agent.phase()?, clients_claimed = agent.clients_claimed()?, "done");
  Ok(())
}

/// Set up logging: 0 = warn, 1 = info, 2+ = debug. RUST_LOG wins when set.
fn init_tracing(verbose: u8, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  let default = match verbose {
    0 => "shellcache=warn",
    1 => "shellcache=info",
    _ => "shellcache=debug",
  };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

  match log_file {
    Some(path) => {
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
      Ok(None)
    }
  }
}

fn print_activation(activated: &agent::ActivateOutcome) {
  if activated.deleted.is_empty() {
    println!("activated, no stale buckets");
  } else {
    println!("activated, deleted {}", activated.deleted.join(", "));
  }
}

async fn fetch(agent: &Agent, args: FetchArgs) -> Result<()> {
  if !agent.resume()? {
    return Err(eyre!(
      "{} is not active. Run `shellcache start` first.",
      agent.settings().cache_name
    ));
  }

  let request = build_request(agent.settings(), &args)?;
  let result = agent.fetch(&request).await?;

  eprintln!("{}", status_line(&request, &result));

  match args.output {
    Some(path) => std::fs::write(&path, &result.data.body)
      .map_err(|e| eyre!("Failed to write {}: {}", path.display(), e))?,
    None => std::io::stdout()
      .write_all(&result.data.body)
      .map_err(|e| eyre!("Failed to write response body: {}", e))?,
  }

  Ok(())
}

/// One-line summary of a fetch for stderr.
fn status_line(request: &Request, result: &CacheResult<Response>) -> String {
  let source = match (result.source, result.cached_at) {
    (CacheSource::Offline, Some(stored_at)) => format!("cache, stored {}", stored_at.to_rfc3339()),
    (CacheSource::Offline, None) => "cache".to_string(),
    (CacheSource::Network, _) => "network".to_string(),
  };
  match result.data.header("content-type") {
    Some(content_type) => format!("{} {} ({}, {})", result.data.status, request.url, source, content_type),
    None => format!("{} {} ({})", result.data.status, request.url, source),
  }
}

fn build_request(settings: &AgentSettings, args: &FetchArgs) -> Result<Request> {
  let url = settings.resolve(&args.target)?;
  let method = reqwest::Method::from_bytes(args.method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", args.method, e))?;

  let mut request = Request::new(method, url);
  for header in &args.headers {
    let (name, value) = header
      .split_once(':')
      .ok_or_else(|| eyre!("Invalid header '{}', expected \"name: value\"", header))?;
    request = request.with_header(name.trim(), value.trim());
  }
  if let Some(data) = &args.data {
    request = request.with_body(data.clone().into_bytes());
  }

  Ok(request)
}

fn list_buckets(storage: &SqliteStorage, current: &str) -> Result<()> {
  let names = storage.keys()?;
  if names.is_empty() {
    println!("no buckets");
    return Ok(());
  }

  for name in names {
    let entries = storage.entry_keys(&name)?;
    let marker = if name == current { "*" } else { " " };
    println!("{} {} ({} entries)", marker, name, entries.len());
    for key in entries {
      println!("    {}", key);
    }
  }

  Ok(())
}
