//! Query keys used by the lifecycle components.

use super::traits::{DataType, QueryKey};
use crate::model::{RecordKey, TableName};

/// Cacheable queries issued through the resolver.
#[derive(Clone, Debug)]
pub enum LifecycleQueryKey {
  /// Whether a profile is in a row's `download_profiles`
  DownloadStatus {
    table: TableName,
    key: RecordKey,
    profile_id: String,
  },
  /// Free-form query with an explicit data type
  Custom {
    data_type: DataType,
    description: String,
  },
}

impl LifecycleQueryKey {
  pub fn download_status(table: TableName, key: &RecordKey, profile_id: &str) -> Self {
    Self::DownloadStatus {
      table,
      key: key.clone(),
      profile_id: profile_id.to_string(),
    }
  }

  pub fn custom(data_type: DataType, description: impl Into<String>) -> Self {
    Self::Custom {
      data_type,
      description: description.into(),
    }
  }
}

impl QueryKey for LifecycleQueryKey {
  fn data_type(&self) -> DataType {
    match self {
      Self::DownloadStatus { .. } => DataType::DownloadStatus,
      Self::Custom { data_type, .. } => *data_type,
    }
  }

  fn description(&self) -> String {
    match self {
      Self::DownloadStatus {
        table,
        key,
        profile_id,
      } => format!("{}:{}:{}", table, key, profile_id),
      Self::Custom { description, .. } => normalize(description),
    }
  }
}

/// Collapse whitespace so equivalent descriptions share a cache entry.
fn normalize(description: &str) -> String {
  description.split_whitespace().collect::<Vec<_>>().join(" ")
}
