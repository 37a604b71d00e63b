//! Cache storage trait and in-memory implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;

use super::traits::{DataSource, DataType};

/// A single cached query result, stored as serialized JSON.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub value: Value,
  pub source: DataSource,
  pub data_type: DataType,
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// Storage instances are injected into the resolver so each test, and each
/// process, owns its cache state explicitly.
pub trait CacheStorage: Send + Sync {
  /// Get a cached entry by key.
  fn get(&self, key: &str) -> Result<Option<CachedEntry>>;

  /// Store or replace an entry.
  fn put(&self, key: &str, entry: CachedEntry) -> Result<()>;

  /// Drop one entry.
  fn invalidate(&self, key: &str) -> Result<()>;

  /// Drop every entry of a data type.
  fn invalidate_data_type(&self, data_type: DataType) -> Result<()>;

  /// Drop everything.
  fn reset(&self) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<CachedEntry>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &str, _entry: CachedEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn invalidate(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn invalidate_data_type(&self, _data_type: DataType) -> Result<()> {
    Ok(())
  }

  fn reset(&self) -> Result<()> {
    Ok(())
  }
}

/// Process-local keyed cache.
#[derive(Default)]
pub struct MemoryStorage {
  entries: Mutex<HashMap<String, CachedEntry>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CachedEntry>>> {
    self
      .entries
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<CachedEntry>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn put(&self, key: &str, entry: CachedEntry) -> Result<()> {
    self.lock()?.insert(key.to_string(), entry);
    Ok(())
  }

  fn invalidate(&self, key: &str) -> Result<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn invalidate_data_type(&self, data_type: DataType) -> Result<()> {
    self.lock()?.retain(|_, e| e.data_type != data_type);
    Ok(())
  }

  fn reset(&self) -> Result<()> {
    self.lock()?.clear();
    Ok(())
  }
}
