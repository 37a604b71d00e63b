//! Persistent key-value stores that survive restarts and app updates.

use color_eyre::{eyre::eyre, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;
  fn set(&self, key: &str, value: &str) -> Result<()>;
  fn remove(&self, key: &str) -> Result<()>;
}

/// JSON object on disk. Every write goes to a synced temp file that is then
/// renamed over the store, so a crash mid-write never leaves a torn file.
///
/// A file that does not parse reads as empty and is replaced by the next write.
pub struct FileKvStore {
  path: PathBuf,
  lock: Mutex<()>,
}

impl FileKvStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      lock: Mutex::new(()),
    }
  }

  /// Store location inside the data directory.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state.json")
  }

  fn read(&self) -> Result<BTreeMap<String, String>> {
    if !self.path.exists() {
      return Ok(BTreeMap::new());
    }
    let content = std::fs::read_to_string(&self.path)
      .map_err(|e| eyre!("Failed to read {}: {}", self.path.display(), e))?;
    if content.trim().is_empty() {
      return Ok(BTreeMap::new());
    }
    match serde_json::from_str(&content) {
      Ok(entries) => Ok(entries),
      Err(e) => {
        warn!(path = %self.path.display(), error = %e, "Ignoring unparsable key-value file");
        Ok(BTreeMap::new())
      }
    }
  }

  fn write(&self, entries: &BTreeMap<String, String>) -> Result<()> {
    if let Some(parent) = self.path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create state directory: {}", e))?;
    }
    let tmp = self.path.with_extension("json.tmp");
    let content = serde_json::to_string_pretty(entries)?;
    let mut file = std::fs::File::create(&tmp)
      .map_err(|e| eyre!("Failed to create {}: {}", tmp.display(), e))?;
    file
      .write_all(content.as_bytes())
      .and_then(|_| file.sync_all())
      .map_err(|e| eyre!("Failed to write {}: {}", tmp.display(), e))?;
    drop(file);
    std::fs::rename(&tmp, &self.path)
      .map_err(|e| eyre!("Failed to replace {}: {}", self.path.display(), e))
  }

  fn update(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut entries = self.read()?;
    f(&mut entries);
    self.write(&entries)
  }
}

impl KeyValueStore for FileKvStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let _guard = self.lock.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(self.read()?.remove(key))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.update(|entries| {
      entries.insert(key.to_string(), value.to_string());
    })
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.update(|entries| {
      entries.remove(key);
    })
  }
}

#[derive(Default)]
pub struct MemoryKvStore {
  entries: Mutex<HashMap<String, String>>,
}

impl MemoryKvStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryKvStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let entries = self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut entries = self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut entries = self.entries.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }
}
