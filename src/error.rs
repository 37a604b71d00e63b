//! Error taxonomy shared by the lifecycle components.

use thiserror::Error;

/// Failure kinds surfaced by the data lifecycle.
///
/// Application-level code wraps these in `color_eyre::Report`; callers that
/// need to branch on the kind use `Report::downcast_ref::<LifecycleError>()`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
  /// The online path could not be reached. Silent when an offline fallback exists.
  #[error("Network unavailable: {0}")]
  Network(String),

  /// The local replica query failed. There is no further fallback.
  #[error("Offline query failed: {0}")]
  OfflineQuery(String),

  /// A single record could not be updated during a cascade.
  #[error("Failed to update {table} {key}: {reason}")]
  PartialCascade {
    table: String,
    key: String,
    reason: String,
  },

  /// A local transaction was rolled back; local state is unchanged.
  #[error("Local transaction rolled back: {0}")]
  Transaction(String),

  /// A schema migration failed on this launch.
  #[error("Migration failed: {0}")]
  MigrationFailure(String),

  /// The root record of a cascade does not exist remotely.
  #[error("Root record {0} not found in remote store")]
  RootNotFound(String),

  /// Local writes for the closure have not been uploaded yet.
  #[error("{0} pending uploads must finish before offloading")]
  PendingUploads(usize),

  /// A record key did not match the table's key shape.
  #[error("Invalid record key: {0}")]
  InvalidRecordKey(String),
}
