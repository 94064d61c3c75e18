use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Site origin; relative paths below are resolved against it
  pub origin: Url,
  pub cache: CacheConfig,
  pub sync: SyncConfig,
  pub push: PushConfig,
  /// Where the queue and cache databases live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  /// Write logs to a daily rolling file in this directory instead of stderr
  pub log_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:8000/").expect("static url"),
      cache: CacheConfig::default(),
      sync: SyncConfig::default(),
      push: PushConfig::default(),
      data_dir: None,
      log_dir: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Generation names are `prefix + version`
  pub prefix: String,
  pub version: String,
  /// Document served when a navigation fails with nothing cached
  pub offline_page: String,
  /// Assets fetched at install time; paths or absolute allow-listed URLs
  pub precache: Vec<String>,
  /// Cross-origin origins (scheme, host and port) the cache layer may intercept
  pub allowed_origins: Vec<String>,
  /// URL substrings that are never intercepted or cached
  pub excluded_patterns: Vec<String>,
  /// Activate straight after a successful install
  pub skip_waiting: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "kingspark-cpf-".to_string(),
      version: "v1".to_string(),
      offline_page: "/offline.html".to_string(),
      precache: [
        "/",
        "/offline.html",
        "/static/css/style.css",
        "/static/css/optimize.css",
        "/static/js/main.js",
        "/static/js/performance.js",
        "/static/images/kingsapark_logo_official.png",
        "/static/manifest.json",
        "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/css/bootstrap.min.css",
        "https://cdn.jsdelivr.net/npm/bootstrap@5.3.2/dist/js/bootstrap.bundle.min.js",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      allowed_origins: vec![
        "https://cdn.jsdelivr.net".to_string(),
        "https://cdnjs.cloudflare.com".to_string(),
      ],
      excluded_patterns: vec![
        "/api/".to_string(),
        "analytics".to_string(),
        "socket.io".to_string(),
      ],
      skip_waiting: true,
    }
  }
}

impl CacheConfig {
  /// Name of the generation this build installs.
  pub fn generation(&self) -> String {
    format!("{}{}", self.prefix, self.version)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  /// Deferred-sync registration tag
  pub tag: String,
  /// Replay endpoint, relative to the origin
  pub endpoint: String,
  /// Path requested to decide whether we are online
  pub probe_path: String,
  pub probe_timeout_secs: u64,
  /// How often `watch` checks connectivity
  pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      tag: "crime-report-sync".to_string(),
      endpoint: "/api/reports/submit/".to_string(),
      probe_path: "/".to_string(),
      probe_timeout_secs: 5,
      poll_interval_secs: 15,
    }
  }
}

impl SyncConfig {
  pub fn probe_timeout(&self) -> Duration {
    Duration::from_secs(self.probe_timeout_secs)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PushConfig {
  pub default_title: String,
  pub default_message: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
}

impl Default for PushConfig {
  fn default() -> Self {
    Self {
      default_title: "Kings Park CPF Update".to_string(),
      default_message: "New notification from Kings Park CPF".to_string(),
      icon: "/static/images/icons/icon-192x192.png".to_string(),
      badge: "/static/images/icons/badge-72x72.png".to_string(),
      vibrate: vec![100, 50, 100],
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./cpf-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/cpf-offline/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found. The origin can be
  /// overridden with CPF_OFFLINE_ORIGIN.
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
      None => Config::default(),
    };

    if let Ok(origin) = std::env::var("CPF_OFFLINE_ORIGIN") {
      config.origin = Url::parse(&origin)
        .map_err(|e| eyre!("Invalid CPF_OFFLINE_ORIGIN '{}': {}", origin, e))?;
    }

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("cpf-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("cpf-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  /// Resolve a site-relative path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }

  /// Directory holding the queue and cache databases.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("cpf-offline"))
  }
}
