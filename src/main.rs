mod cache;
mod config;
mod logging;
mod network;
mod server;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use cache::{CacheStorage, OfflineWorker, RequestKey, SqliteStorage};
use network::HttpNetwork;

#[derive(Parser, Debug)]
#[command(name = "caseificio")]
#[command(about = "Offline asset cache for the caseificio web app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/caseificio/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Origin server to fetch from (overrides config and CASEIFICIO_ORIGIN)
  #[arg(long, global = true)]
  origin: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Seed the current cache generation from the asset manifest
  Install,
  /// Delete every cache generation except the current one
  Activate,
  /// Install if needed, activate, then intercept requests
  Serve,
  /// Show a stored entry without touching the network
  Lookup {
    /// Request path, e.g. /formaggi
    path: String,
    #[arg(short, long, default_value = "GET")]
    method: String,
  },
  /// List cache generations
  Caches,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    config::Config { origin, ..config }
  } else {
    config
  };
  config.validate()?;

  let _log_guard = logging::init(config::Config::log_dir().as_deref());

  let storage = SqliteStorage::open(&config.database_path()?)?;
  let network = HttpNetwork::new(config.origin_url()?, config.request_timeout())?;
  let worker = OfflineWorker::new(
    storage,
    network,
    config.cache_name(),
    config.manifest.clone(),
  );

  match args.command {
    Command::Install => {
      let count = worker.install().await?;
      println!("Installed {} ({} entries)", worker.cache_name(), count);
    }
    Command::Activate => {
      if !worker.resume()? {
        return Err(eyre!(
          "Cache {} is not installed; run `caseificio install` first",
          worker.cache_name()
        ));
      }
      for name in worker.activate()? {
        println!("Deleted {}", name);
      }
      println!("Active: {}", worker.cache_name());
    }
    Command::Serve => {
      if !worker.resume()? {
        worker.install().await?;
      }
      worker.activate()?;
      info!(origin = %config.origin, "Starting interception");
      server::run_server(Arc::new(worker), config.listen).await?;
    }
    Command::Lookup { path, method } => {
      let key = RequestKey::new(&method, &path);
      match worker.lookup(&key)? {
        Some(entry) => {
          println!(
            "{} -> {} {} ({} bytes, cached {})",
            key,
            entry.response.status,
            entry.response.header("content-type").unwrap_or("-"),
            entry.response.body.len(),
            entry.cached_at.format("%Y-%m-%d %H:%M:%S")
          );
          for (name, value) in &entry.response.headers {
            println!("  {}: {}", name, value);
          }
        }
        None => println!("{} is not cached in {}", key, worker.cache_name()),
      }
    }
    Command::Caches => {
      let caches = worker.storage().cache_names()?;
      if caches.is_empty() {
        println!("No caches");
      }
      for cache in caches {
        let marker = if cache.name == worker.cache_name() { "*" } else { " " };
        println!(
          "{} {} ({} entries, created {})",
          marker,
          cache.name,
          cache.entries,
          cache.created_at.format("%Y-%m-%d %H:%M:%S")
        );
      }
    }
  }

  Ok(())
}
