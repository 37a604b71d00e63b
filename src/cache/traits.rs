//! Core traits and types for the hybrid query cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

/// Kind of data a query returns. Each kind has its own staleness window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
  /// Languages, languoids, regions. Rarely changes.
  LanguageReference,
  ProjectList,
  DownloadStatus,
  Membership,
  Default,
}

impl DataType {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::LanguageReference => "language_reference",
      Self::ProjectList => "project_list",
      Self::DownloadStatus => "download_status",
      Self::Membership => "membership",
      Self::Default => "default",
    }
  }
}

/// Trait for query descriptors that can be cached.
pub trait QueryKey {
  fn data_type(&self) -> DataType;

  /// Human-readable description, also the input of the cache hash.
  fn description(&self) -> String;

  /// Stable, fixed-length cache key.
  fn cache_hash(&self) -> String {
    let input = format!("{}:{}", self.data_type().as_str(), self.description());
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// Where a hybrid result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
  /// The live authoritative store
  Cloud,
  /// The device-local replica
  Local,
}

impl DataSource {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Cloud => "cloud",
      Self::Local => "local",
    }
  }
}

/// Result of a hybrid query, including provenance.
#[derive(Debug, Clone)]
pub struct HybridResult<T> {
  pub data: T,
  pub source: DataSource,
  /// Set when the result was served from the cache
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> HybridResult<T> {
  pub fn from_cloud(data: T) -> Self {
    Self {
      data,
      source: DataSource::Cloud,
      cached_at: None,
    }
  }

  pub fn from_local(data: T) -> Self {
    Self {
      data,
      source: DataSource::Local,
      cached_at: None,
    }
  }

  pub fn from_cache(data: T, source: DataSource, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source,
      cached_at: Some(cached_at),
    }
  }

  pub fn is_cached(&self) -> bool {
    self.cached_at.is_some()
  }
}

/// Staleness window per data type.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
  windows: HashMap<DataType, Duration>,
}

impl Default for StalenessPolicy {
  fn default() -> Self {
    let windows = HashMap::from([
      (DataType::LanguageReference, Duration::from_secs(60 * 60)),
      (DataType::ProjectList, Duration::from_secs(5 * 60)),
      (DataType::DownloadStatus, Duration::from_secs(60)),
      (DataType::Membership, Duration::from_secs(2 * 60)),
      (DataType::Default, Duration::from_secs(30)),
    ]);
    Self { windows }
  }
}

impl StalenessPolicy {
  pub fn with_window(mut self, data_type: DataType, window: Duration) -> Self {
    self.windows.insert(data_type, window);
    self
  }

  pub fn window(&self, data_type: DataType) -> Duration {
    self
      .windows
      .get(&data_type)
      .or_else(|| self.windows.get(&DataType::Default))
      .copied()
      .unwrap_or(Duration::ZERO)
  }

  /// Whether an entry cached at `cached_at` is still fresh.
  pub fn is_fresh(&self, data_type: DataType, cached_at: DateTime<Utc>) -> bool {
    let window = chrono::Duration::from_std(self.window(data_type))
      .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
    Utc::now() - cached_at < window
  }
}
