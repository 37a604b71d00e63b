//! Startup gate deciding whether local schema migrations may run.
//!
//! A migration that failed against a given build will fail the same way on
//! the next launch of that build. After `threshold` failures the guard enters
//! degraded mode and refuses further attempts until the build identity
//! changes.

pub mod build;
pub mod kv;

pub use build::{BuildIdentity, EMBEDDED_UPDATE_ID};
pub use kv::{FileKvStore, KeyValueStore, MemoryKvStore};

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::error::LifecycleError;
use crate::local::LocalStore;

const STATE_KEY: &str = "migration_state";

pub const DEFAULT_RETRY_THRESHOLD: u32 = 1;

/// Persisted guard state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationState {
  pub is_degraded: bool,
  /// Failures recorded against the build in `last_update_id`/`last_app_version`
  pub retry_count: u32,
  pub last_update_id: Option<String>,
  pub last_app_version: Option<String>,
  pub last_schema_version: Option<i64>,
  pub last_error: Option<String>,
  pub updated_at: Option<DateTime<Utc>>,
}

impl MigrationState {
  fn has_baseline(&self) -> bool {
    self.last_update_id.is_some() || self.last_app_version.is_some()
  }

  fn matches(&self, build: &BuildIdentity) -> bool {
    self.last_update_id.as_deref() == Some(build.current_update_id())
      && self.last_app_version.as_deref() == Some(build.app_version.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StartupMode {
  Normal,
  /// The local store must not be used this run
  Degraded,
}

impl fmt::Display for StartupMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StartupMode::Normal => write!(f, "normal"),
      StartupMode::Degraded => write!(f, "degraded"),
    }
  }
}

pub struct MigrationGuard {
  kv: Arc<dyn KeyValueStore>,
  build: BuildIdentity,
  threshold: u32,
}

impl MigrationGuard {
  pub fn new(kv: Arc<dyn KeyValueStore>, build: BuildIdentity) -> Self {
    Self {
      kv,
      build,
      threshold: DEFAULT_RETRY_THRESHOLD,
    }
  }

  pub fn with_threshold(mut self, threshold: u32) -> Self {
    self.threshold = threshold.max(1);
    self
  }

  pub fn build(&self) -> &BuildIdentity {
    &self.build
  }

  /// Current persisted state. Unreadable state counts as a fresh install.
  pub fn state(&self) -> Result<MigrationState> {
    let raw = match self.kv.get(STATE_KEY) {
      Ok(Some(raw)) => raw,
      Ok(None) => return Ok(MigrationState::default()),
      Err(e) => {
        warn!(error = %e, "Migration state store unreadable, starting fresh");
        return Ok(MigrationState::default());
      }
    };
    match serde_json::from_str(&raw) {
      Ok(state) => Ok(state),
      Err(e) => {
        warn!(error = %e, "Discarding unreadable migration state");
        self.kv.remove(STATE_KEY)?;
        Ok(MigrationState::default())
      }
    }
  }

  fn save(&self, mut state: MigrationState) -> Result<MigrationState> {
    state.updated_at = Some(Utc::now());
    self.kv.set(STATE_KEY, &serde_json::to_string(&state)?)?;
    Ok(state)
  }

  pub fn is_degraded_mode(&self) -> Result<bool> {
    Ok(self.state()?.is_degraded)
  }

  /// True when the running build differs from the one recorded last.
  ///
  /// Always false on a first run since there is nothing to compare against.
  pub fn is_update_detected(&self) -> Result<bool> {
    let state = self.state()?;
    Ok(state.has_baseline() && !state.matches(&self.build))
  }

  pub fn should_retry_migration(&self) -> Result<bool> {
    let state = self.state()?;
    if !state.is_degraded {
      return Ok(true);
    }
    Ok(state.has_baseline() && !state.matches(&self.build))
  }

  /// Count a failed attempt against the running build.
  pub fn record_failure(&self, reason: &str) -> Result<MigrationState> {
    let mut state = self.state()?;
    state.retry_count = if state.matches(&self.build) {
      state.retry_count + 1
    } else {
      1
    };
    state.last_update_id = Some(self.build.current_update_id().to_string());
    state.last_app_version = Some(self.build.app_version.clone());
    state.last_error = Some(reason.to_string());

    if state.retry_count >= self.threshold && !state.is_degraded {
      warn!(
        retry_count = state.retry_count,
        update_id = self.build.current_update_id(),
        app_version = %self.build.app_version,
        "Entering degraded mode"
      );
    }
    state.is_degraded = state.retry_count >= self.threshold;
    self.save(state)
  }

  /// Leave degraded mode and record the running build as the new baseline.
  pub fn record_success(&self, schema_version: i64) -> Result<MigrationState> {
    let state = MigrationState {
      is_degraded: false,
      retry_count: 0,
      last_update_id: Some(self.build.current_update_id().to_string()),
      last_app_version: Some(self.build.app_version.clone()),
      last_schema_version: Some(schema_version),
      last_error: None,
      updated_at: None,
    };
    self.save(state)
  }

  /// Manual escape hatch. Keeps the recorded build so detection still works.
  pub fn clear_degraded_mode(&self) -> Result<MigrationState> {
    let mut state = self.state()?;
    state.is_degraded = false;
    state.retry_count = 0;
    state.last_error = None;
    info!("Degraded mode cleared");
    self.save(state)
  }
}

/// Run the schema migrations if the guard allows it.
///
/// Must resolve before anything else touches `store`. A failed attempt never
/// propagates; the caller gets [`StartupMode::Degraded`] and keeps running
/// without the local store.
pub fn run_startup_migrations<F>(guard: &MigrationGuard, store: &LocalStore, migrate: F) -> Result<StartupMode>
where
  F: FnOnce(&LocalStore) -> Result<i64>,
{
  if !guard.should_retry_migration()? {
    warn!(
      update_id = guard.build().current_update_id(),
      app_version = %guard.build().app_version,
      "Skipping migrations for a build that already failed"
    );
    return Ok(StartupMode::Degraded);
  }

  match migrate(store) {
    Ok(version) => {
      guard.record_success(version)?;
      info!(schema_version = version, "Local store ready");
      Ok(StartupMode::Normal)
    }
    Err(e) => {
      let failure = LifecycleError::MigrationFailure(format!("{:#}", e));
      let state = guard.record_failure(&failure.to_string())?;
      error!(
        error = %failure,
        retry_count = state.retry_count,
        degraded = state.is_degraded,
        "Schema migration failed"
      );
      Ok(StartupMode::Degraded)
    }
  }
}
