use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::SqliteStorage;

/// Environment variable that overrides `origin`.
pub const ORIGIN_ENV: &str = "CASEIFICIO_ORIGIN";

/// Routes and static assets available offline.
const DEFAULT_MANIFEST: &[&str] = &[
  "/",
  "/calendario",
  "/formaggi",
  "/produzioni",
  "/statistiche",
  "/frog-logo.svg",
  "/manifest.json",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Prefix of the cache name
  pub app_name: String,
  /// Bumping this forces clients to re-seed into a new cache generation
  pub cache_version: u32,
  /// Upstream server the app is served from
  pub origin: String,
  /// Paths seeded into the cache on install, in order
  pub manifest: Vec<String>,
  /// Address the intercepting listener binds to
  pub listen: SocketAddr,
  pub request_timeout_secs: u64,
  /// Cache database location (defaults to the data directory)
  pub database: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      app_name: "caseificio".to_string(),
      cache_version: 1,
      origin: "http://127.0.0.1:5173".to_string(),
      manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      listen: SocketAddr::from(([127, 0, 0, 1], 8080)),
      request_timeout_secs: 30,
      database: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./caseificio.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/caseificio/config.yaml
  ///
  /// Falls back to the built-in defaults when no file is found.
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

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    if let Ok(origin) = std::env::var(ORIGIN_ENV) {
      config.origin = origin;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("caseificio.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("caseificio").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn validate(&self) -> Result<()> {
    if self.app_name.trim().is_empty() {
      return Err(eyre!("app_name must not be empty"));
    }

    if let Some(entry) = self.manifest.iter().find(|entry| !entry.starts_with('/')) {
      return Err(eyre!(
        "Manifest entry '{}' must be an absolute path starting with '/'",
        entry
      ));
    }

    if self.request_timeout_secs == 0 {
      return Err(eyre!("request_timeout_secs must be greater than zero"));
    }

    self.origin_url()?;
    Ok(())
  }

  /// Name of the current cache generation, `<app-name>-v<N>`.
  pub fn cache_name(&self) -> String {
    format!("{}-v{}", self.app_name, self.cache_version)
  }

  pub fn origin_url(&self) -> Result<Url> {
    let url = Url::parse(&self.origin)
      .map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))?;

    match url.scheme() {
      "http" | "https" => Ok(url),
      other => Err(eyre!(
        "Invalid origin '{}': unsupported scheme {}",
        self.origin,
        other
      )),
    }
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.database {
      Some(path) => Ok(path.clone()),
      None => SqliteStorage::default_path(),
    }
  }

  /// Directory for rolling log files, next to the default database.
  pub fn log_dir() -> Option<PathBuf> {
    SqliteStorage::default_path()
      .ok()
      .and_then(|p| p.parent().map(|dir| dir.join("logs")))
  }
}
