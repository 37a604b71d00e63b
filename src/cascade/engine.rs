//! Applies ledger membership changes across a discovered closure.

use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{CascadeSummary, Direction, TableUpdate, DOWNLOAD_ORDER, UNDOWNLOAD_ORDER};
use crate::error::LifecycleError;
use crate::ledger::DownloadProfileLedger;
use crate::model::{RecordClosure, RecordKey, TableName};

/// Best-effort cascade over the ledger.
///
/// Tables are processed sequentially in dependency order. Within a table all
/// records are updated in parallel and awaited together. A failing record is
/// reported and left in its prior state; it never stops the cascade.
pub struct CascadeEngine {
  ledger: Arc<DownloadProfileLedger>,
}

impl CascadeEngine {
  pub fn new(ledger: Arc<DownloadProfileLedger>) -> Self {
    Self { ledger }
  }

  /// Add `profile_id` to every record of the closure, children first.
  pub async fn download(&self, closure: &RecordClosure, profile_id: &str) -> CascadeSummary {
    self
      .apply(Direction::Download, &DOWNLOAD_ORDER, closure, profile_id)
      .await
  }

  /// Remove `profile_id` from the closure in strict reverse dependency order.
  ///
  /// Tags and languages are left untouched.
  pub async fn undownload(&self, closure: &RecordClosure, profile_id: &str) -> CascadeSummary {
    self
      .apply(Direction::Undownload, &UNDOWNLOAD_ORDER, closure, profile_id)
      .await
  }

  async fn apply(
    &self,
    direction: Direction,
    order: &[TableName],
    closure: &RecordClosure,
    profile_id: &str,
  ) -> CascadeSummary {
    info!(?direction, profile_id, records = closure.total(), "Starting cascade");
    let mut tables = Vec::new();

    for &table in order {
      let ids = closure.get(table);
      if ids.is_empty() {
        debug!(table = %table, "Skipping table with no records");
        continue;
      }

      let outcomes = join_all(
        ids
          .iter()
          .map(|id| self.apply_one(direction, table, id, profile_id)),
      )
      .await;

      let mut update = TableUpdate::new(table);
      for outcome in outcomes {
        match outcome {
          Ok(true) => update.records_updated += 1,
          Ok(false) => update.records_unchanged += 1,
          Err(e) => {
            warn!(error = %e, "Cascade record failed");
            update.errors.push(e);
          }
        }
      }

      info!(
        table = %table,
        updated = update.records_updated,
        unchanged = update.records_unchanged,
        failed = update.records_failed(),
        "Cascade table done"
      );
      tables.push(update);
    }

    CascadeSummary { direction, tables }
  }

  async fn apply_one(
    &self,
    direction: Direction,
    table: TableName,
    id: &str,
    profile_id: &str,
  ) -> Result<bool, LifecycleError> {
    let partial = |reason: String| LifecycleError::PartialCascade {
      table: table.to_string(),
      key: id.to_string(),
      reason,
    };

    let key = RecordKey::parse(table, id).map_err(|e| partial(e.to_string()))?;
    let result = match direction {
      Direction::Download => self.ledger.add_profile(table, &key, profile_id).await,
      Direction::Undownload => self.ledger.remove_profile(table, &key, profile_id).await,
    };
    result.map_err(|e| partial(e.to_string()))
  }
}
