use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{DataType, StalenessPolicy};
use crate::migration::{BuildIdentity, DEFAULT_RETRY_THRESHOLD};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  /// Profile whose downloads are managed
  pub profile_id: Option<String>,
  /// Where the replica, migration state and logs live
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub migration: MigrationConfig,
  /// Staleness window overrides in seconds, keyed by data type
  #[serde(default)]
  pub staleness: HashMap<DataType, u64>,
  /// Default tracing filter when RUST_LOG is unset
  pub log_filter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  pub url: Url,
  #[serde(default = "default_schema")]
  pub schema: String,
  /// Request timeout in seconds
  #[serde(default = "default_timeout")]
  pub timeout_secs: u64,
}

fn default_schema() -> String {
  "public".to_string()
}

fn default_timeout() -> u64 {
  15
}

#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
  #[serde(default = "default_threshold")]
  pub retry_threshold: u32,
  /// Defaults to the crate version
  pub app_version: Option<String>,
  /// Hot-patch id; absent for the embedded build
  pub update_id: Option<String>,
}

fn default_threshold() -> u32 {
  DEFAULT_RETRY_THRESHOLD
}

impl Default for MigrationConfig {
  fn default() -> Self {
    Self {
      retry_threshold: DEFAULT_RETRY_THRESHOLD,
      app_version: None,
      update_id: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./questsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/questsync/config.yaml
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/questsync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("questsync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("questsync").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    dirs::data_dir()
      .map(|d| d.join("questsync"))
      .ok_or_else(|| eyre!("No data directory available. Set data_dir in the config file."))
  }

  pub fn staleness_policy(&self) -> StalenessPolicy {
    self
      .staleness
      .iter()
      .fold(StalenessPolicy::default(), |policy, (data_type, secs)| {
        policy.with_window(*data_type, Duration::from_secs(*secs))
      })
  }

  pub fn build_identity(&self, schema_version: i64) -> BuildIdentity {
    let app_version = self
      .migration
      .app_version
      .clone()
      .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());
    BuildIdentity::new(self.migration.update_id.clone(), app_version, schema_version)
  }

  pub fn remote_timeout(&self) -> Duration {
    Duration::from_secs(self.remote.timeout_secs)
  }

  /// Get the remote API key from environment variables.
  ///
  /// Checks QUESTSYNC_API_KEY first, then SUPABASE_ANON_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("QUESTSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_ANON_KEY"))
      .map_err(|_| {
        eyre!("Remote API key not found. Set QUESTSYNC_API_KEY or SUPABASE_ANON_KEY environment variable.")
      })
  }

  /// Signed-in user's token, if any.
  pub fn get_access_token() -> Option<String> {
    std::env::var("QUESTSYNC_ACCESS_TOKEN").ok()
  }
}
