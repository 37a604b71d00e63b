//! Per-record `download_profiles` membership.
//!
//! Writes go straight to the remote's atomic set operations so they are safe
//! to issue concurrently and repeatedly. Reads go through the hybrid resolver.

use color_eyre::Result;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{HybridQuery, HybridResolver, HybridResult, LifecycleQueryKey};
use crate::error::LifecycleError;
use crate::local::LocalStore;
use crate::model::{RecordKey, TableName};
use crate::remote::{RemoteQuery, RemoteStore};

pub struct DownloadProfileLedger {
  remote: Arc<dyn RemoteStore>,
  local: Arc<LocalStore>,
  resolver: HybridResolver,
}

impl DownloadProfileLedger {
  pub fn new(remote: Arc<dyn RemoteStore>, local: Arc<LocalStore>, resolver: HybridResolver) -> Self {
    Self {
      remote,
      local,
      resolver,
    }
  }

  /// Add `profile_id` to the row's set. `false` when it was already present.
  pub async fn add_profile(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError> {
    let changed = self
      .remote
      .add_to_download_profiles(table, key, profile_id)
      .await?;
    debug!(table = %table, key = %key, changed, "add_profile");
    self.forget_status(table, key, profile_id);
    Ok(changed)
  }

  /// Remove `profile_id` from the row's set. `false` when it was absent.
  pub async fn remove_profile(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError> {
    let changed = self
      .remote
      .remove_from_download_profiles(table, key, profile_id)
      .await?;
    debug!(table = %table, key = %key, changed, "remove_profile");
    self.forget_status(table, key, profile_id);
    Ok(changed)
  }

  /// Whether `profile_id` wants the row cached.
  ///
  /// Online this reads the remote set. Offline, presence of the row in the
  /// local replica stands in for membership.
  pub async fn download_status(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<HybridResult<bool>> {
    let mut query = RemoteQuery::new(table)
      .select(&["download_profiles"])
      .contains("download_profiles", profile_id)
      .limit(1);
    for (column, value) in key_filters(table, key)? {
      query = query.eq(column, value);
    }

    let remote = Arc::clone(&self.remote);
    let local = Arc::clone(&self.local);
    let (sql, params) = local_presence_sql(table, key)?;

    self
      .resolver
      .resolve(
        HybridQuery::new(LifecycleQueryKey::download_status(table, key, profile_id))
          .online(move || async move { remote.select(&query).await.map(|rows| !rows.is_empty()) })
          .offline(move || {
            local.with_conn(|conn| {
              conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
                row.get::<_, bool>(0)
              })
            })
          }),
      )
      .await
  }

  fn forget_status(&self, table: TableName, key: &RecordKey, profile_id: &str) {
    let query_key = LifecycleQueryKey::download_status(table, key, profile_id);
    if let Err(e) = self.resolver.invalidate(&query_key) {
      warn!(error = %e, "Failed to invalidate cached download status");
    }
  }
}

/// Column/value pairs identifying `key` in `table`.
fn key_filters(table: TableName, key: &RecordKey) -> Result<Vec<(&'static str, String)>, LifecycleError> {
  match (key, table.link_columns()) {
    (RecordKey::Single(id), None) => Ok(vec![("id", id.clone())]),
    (RecordKey::Composite(k1, k2), Some((c1, c2))) => Ok(vec![(c1, k1.clone()), (c2, k2.clone())]),
    _ => Err(LifecycleError::InvalidRecordKey(format!(
      "{} does not match key shape of {}",
      key, table
    ))),
  }
}

fn local_presence_sql(table: TableName, key: &RecordKey) -> Result<(String, Vec<String>), LifecycleError> {
  let filters = key_filters(table, key)?;
  let clause = filters
    .iter()
    .enumerate()
    .map(|(i, (column, _))| format!("{} = ?{}", column, i + 1))
    .collect::<Vec<_>>()
    .join(" AND ");
  let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE {})", table.as_str(), clause);
  Ok((sql, filters.into_iter().map(|(_, v)| v).collect()))
}
