use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Static configuration for the offline layer. Every key is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Base URL of the slideshow backend, used for relative paths and the API
  pub origin: String,
  /// Where the SQLite stores and log files live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub images: ImagesConfig,
  pub queue: QueueConfig,
  pub connectivity: ConnectivityConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:3000".to_string(),
      data_dir: None,
      cache: CacheConfig::default(),
      images: ImagesConfig::default(),
      queue: QueueConfig::default(),
      connectivity: ConnectivityConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version suffix of every namespace name. Bumping it condemns the old namespaces.
  pub version: String,
  pub prefix: String,
  pub budgets: BudgetConfig,
  /// Assumed size of one cached response when estimating namespace occupancy
  pub average_entry_bytes: u64,
  pub sweep_interval_secs: u64,
  /// Critical assets stored in the static namespace on install
  pub precache: Vec<String>,
  /// Paths always treated as static assets
  pub static_paths: Vec<String>,
  pub api_prefixes: Vec<String>,
  pub offline_page: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      prefix: "slideshow".to_string(),
      budgets: BudgetConfig::default(),
      average_entry_bytes: 50 * 1024,
      sweep_interval_secs: 300,
      precache: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/offline.html".to_string(),
      ],
      static_paths: vec![
        "/".to_string(),
        "/index.html".to_string(),
        "/manifest.json".to_string(),
        "/offline.html".to_string(),
        "/favicon.ico".to_string(),
      ],
      api_prefixes: vec![
        "/api/playlists".to_string(),
        "/api/images".to_string(),
        "/api/albums".to_string(),
        "/api/settings".to_string(),
        "/api/feedback".to_string(),
      ],
      offline_page: "/offline.html".to_string(),
    }
  }
}

impl CacheConfig {
  pub fn sweep_interval(&self) -> Duration {
    Duration::from_secs(self.sweep_interval_secs)
  }
}

/// Byte ceilings for the three namespace tiers.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
  #[serde(rename = "static")]
  pub static_assets: u64,
  pub dynamic: u64,
  pub images: u64,
}

impl Default for BudgetConfig {
  fn default() -> Self {
    Self {
      static_assets: 50 * 1024 * 1024,
      dynamic: 20 * 1024 * 1024,
      images: 200 * 1024 * 1024,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImagesConfig {
  /// When disabled the image store always misses and every image goes through the generic cache
  pub enabled: bool,
  /// Expiry applied by the prefetcher when no explicit TTL is given
  pub default_ttl_secs: Option<u64>,
}

impl Default for ImagesConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      default_ttl_secs: Some(7 * 24 * 60 * 60),
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
  /// Same delay before every retry
  Fixed,
  /// Delay doubles with each retry
  #[default]
  Exponential,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub max_retries: u32,
  pub retry_delay_ms: u64,
  pub backoff: Backoff,
  /// How long a completed action lingers before it is removed
  pub completed_ttl_ms: u64,
  pub auto_process_on_reconnect: bool,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      retry_delay_ms: 1000,
      backoff: Backoff::Exponential,
      completed_ttl_ms: 3000,
      auto_process_on_reconnect: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  /// Interval of the reachability probe. `None` disables probing.
  pub probe_interval_secs: Option<u64>,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: Some(30),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./slidecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/slidecache/config.yaml
  ///
  /// Falls back to the built-in defaults when no file exists.
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

    if let Ok(origin) = std::env::var("SLIDECACHE_ORIGIN") {
      config.origin = origin;
    }
    config.origin_url()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("slidecache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("slidecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Parsed form of `origin`.
  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Directory holding the databases and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("slidecache"))
  }

  /// Optional bearer token for queued mutations.
  ///
  /// Reads SLIDECACHE_API_TOKEN.
  pub fn api_token() -> Option<String> {
    std::env::var("SLIDECACHE_API_TOKEN").ok().filter(|t| !t.is_empty())
  }
}
