use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming a config file to load.
pub const CONFIG_PATH_ENV: &str = "QUERY_CACHE_CONFIG";

const LOCAL_CONFIG_FILE: &str = "query-cache.yaml";
const CONFIG_DIR_NAME: &str = "query-cache";

/// Fully resolved cache policy for one request.
///
/// Every field except `wait_timeout` takes part in the cache key, so the same
/// request under two different policies occupies two cache slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
  /// How long a settled entry stays fresh
  #[serde(with = "humantime_serde")]
  pub cache_expiry: Duration,
  /// Always issue a network call, even when fresh or already loading
  pub ignore_cache: bool,
  /// Refetch an entry holding an error even if it has not expired
  pub ignore_cache_on_errors: bool,
  /// Reserved: delay between retries of a failed request
  #[serde(with = "humantime_serde")]
  pub error_retry_delay: Duration,
  /// Reserved: how often a failed request would be retried
  pub error_retry_count: u32,
  /// Longest a caller waits for its outcome (no limit if unset). Not part of
  /// the cache key.
  #[serde(with = "humantime_serde")]
  pub wait_timeout: Option<Duration>,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      cache_expiry: Duration::from_secs(5 * 60),
      ignore_cache: false,
      ignore_cache_on_errors: false,
      error_retry_delay: Duration::from_secs(1),
      error_retry_count: 3,
      wait_timeout: None,
    }
  }
}

impl QueryConfig {
  /// Lay `overrides` over this config; set fields in `overrides` win.
  pub fn merge(&self, overrides: &QueryOverrides) -> Self {
    Self {
      cache_expiry: overrides.cache_expiry.unwrap_or(self.cache_expiry),
      ignore_cache: overrides.ignore_cache.unwrap_or(self.ignore_cache),
      ignore_cache_on_errors: overrides
        .ignore_cache_on_errors
        .unwrap_or(self.ignore_cache_on_errors),
      error_retry_delay: overrides.error_retry_delay.unwrap_or(self.error_retry_delay),
      error_retry_count: overrides.error_retry_count.unwrap_or(self.error_retry_count),
      wait_timeout: overrides.wait_timeout.or(self.wait_timeout),
    }
  }
}

/// Partial [`QueryConfig`], as given to the client constructor, per call, or
/// in a config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueryOverrides {
  #[serde(with = "humantime_serde")]
  pub cache_expiry: Option<Duration>,
  pub ignore_cache: Option<bool>,
  pub ignore_cache_on_errors: Option<bool>,
  #[serde(with = "humantime_serde")]
  pub error_retry_delay: Option<Duration>,
  pub error_retry_count: Option<u32>,
  #[serde(with = "humantime_serde")]
  pub wait_timeout: Option<Duration>,
}

impl QueryOverrides {
  pub fn with_cache_expiry(mut self, cache_expiry: Duration) -> Self {
    self.cache_expiry = Some(cache_expiry);
    self
  }

  pub fn with_ignore_cache(mut self, ignore_cache: bool) -> Self {
    self.ignore_cache = Some(ignore_cache);
    self
  }

  pub fn with_ignore_cache_on_errors(mut self, ignore_cache_on_errors: bool) -> Self {
    self.ignore_cache_on_errors = Some(ignore_cache_on_errors);
    self
  }

  pub fn with_error_retry(mut self, delay: Duration, count: u32) -> Self {
    self.error_retry_delay = Some(delay);
    self.error_retry_count = Some(count);
    self
  }

  pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
    self.wait_timeout = Some(wait_timeout);
    self
  }

  /// Load overrides from a config file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. $QUERY_CACHE_CONFIG
  /// 3. ./query-cache.yaml (current directory)
  /// 4. $XDG_CONFIG_HOME/query-cache/config.yaml
  ///
  /// An explicit or environment-provided path must exist. When nothing is
  /// found, the overrides are empty.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
    let required = explicit_path.map(Path::to_path_buf).or(env_path);

    let path = if let Some(p) = required {
      if p.exists() {
        Some(p)
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::debug!("No query cache config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from(LOCAL_CONFIG_FILE);
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(CONFIG_DIR_NAME).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let overrides = Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    tracing::debug!(path = %path.display(), "Loaded query cache config");
    Ok(overrides)
  }

  /// Parse overrides from YAML text. Blank text yields empty overrides.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    Self::parse(contents).map_err(|e| eyre!("Invalid query cache config: {}", e))
  }

  fn parse(contents: &str) -> std::result::Result<Self, serde_yaml::Error> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    serde_yaml::from_str(contents)
  }
}
