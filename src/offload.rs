//! Local eviction of a downloaded quest.
//!
//! Offload removes a quest's rows from this device only. The server-side
//! `download_profiles` sets are handled by the undownload cascade.

use color_eyre::Result;
use rusqlite::{Connection, OptionalExtension, ToSql, Transaction};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::attachments::AttachmentState;
use crate::error::LifecycleError;
use crate::local::{placeholders, query_strings, query_strings_in, LocalStore};
use crate::model::{RecordClosure, TableName};
use crate::remote::RemoteStore;

/// Verified deletion set for one quest, read from the local replica.
#[derive(Debug, Clone, Serialize)]
pub struct OffloadPlan {
  pub quest_id: String,
  pub closure: RecordClosure,
  /// Assets also linked from another local quest; kept
  pub shared_assets: Vec<String>,
  pub attachment_ids: Vec<String>,
  pub pending_uploads: usize,
  pub estimated_bytes: u64,
}

/// Rows deleted per table by one offload.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OffloadReport {
  pub quest_id: String,
  pub deleted: Vec<(String, usize)>,
  /// Whether the profile's wanted-quest list was updated
  pub remote_updated: bool,
}

impl OffloadReport {
  pub fn deleted(&self, table: &str) -> usize {
    self
      .deleted
      .iter()
      .find(|(t, _)| t == table)
      .map(|(_, n)| *n)
      .unwrap_or(0)
  }
}

pub struct QuestOffloader {
  local: Arc<LocalStore>,
  remote: Arc<dyn RemoteStore>,
}

impl QuestOffloader {
  pub fn new(local: Arc<LocalStore>, remote: Arc<dyn RemoteStore>) -> Self {
    Self { local, remote }
  }

  /// Build the deletion set for `quest_id`.
  pub fn verify(&self, quest_id: &str) -> Result<OffloadPlan> {
    let plan = self.local.with_conn(|conn| build_plan(conn, quest_id))?;
    let plan = plan.ok_or_else(|| LifecycleError::RootNotFound(quest_id.to_string()))?;
    info!(
      quest_id,
      records = plan.closure.total(),
      shared_assets = plan.shared_assets.len(),
      attachments = plan.attachment_ids.len(),
      pending_uploads = plan.pending_uploads,
      estimated_bytes = plan.estimated_bytes,
      "Offload verified"
    );
    Ok(plan)
  }

  /// Delete the plan's rows in one transaction, then drop the quest from the
  /// profile's remote wanted list.
  ///
  /// Pending uploads block the offload unless `force` is set.
  pub async fn offload(
    &self,
    plan: &OffloadPlan,
    profile_id: &str,
    force: bool,
    on_progress: &(dyn Fn(u8, &str) + Sync),
  ) -> Result<OffloadReport> {
    if plan.pending_uploads > 0 && !force {
      return Err(LifecycleError::PendingUploads(plan.pending_uploads).into());
    }

    on_progress(0, "Deleting local records");
    let deleted = self.local.transaction(|tx| delete_plan(tx, plan, on_progress))?;
    info!(quest_id = %plan.quest_id, "Local offload committed");

    on_progress(90, "Updating download list");
    let remote_updated = match self
      .remote
      .remove_downloaded_quest(profile_id, &plan.quest_id)
      .await
    {
      Ok(_) => true,
      Err(e) => {
        // Re-downloading later heals this; local data is already gone
        warn!(quest_id = %plan.quest_id, error = %e, "Failed to update remote download list");
        false
      }
    };

    on_progress(100, "Offload complete");
    Ok(OffloadReport {
      quest_id: plan.quest_id.clone(),
      deleted,
      remote_updated,
    })
  }
}

fn build_plan(conn: &Connection, quest_id: &str) -> rusqlite::Result<Option<OffloadPlan>> {
  let exists = conn
    .query_row("SELECT id FROM quest WHERE id = ?1", [quest_id], |row| row.get::<_, String>(0))
    .optional()?;
  if exists.is_none() {
    return Ok(None);
  }

  let mut closure = RecordClosure::new();
  closure.insert(TableName::Quest, quest_id);

  let asset_ids = query_strings(
    conn,
    "SELECT asset_id FROM quest_asset_link WHERE quest_id = ?1",
    &[&quest_id],
  )?;
  closure.extend(
    TableName::QuestAssetLink,
    asset_ids.iter().map(|a| format!("{}|{}", quest_id, a)),
  );

  let shared_assets = query_strings_in(
    conn,
    "SELECT DISTINCT asset_id FROM quest_asset_link WHERE quest_id != ? AND asset_id IN",
    &[&quest_id],
    &asset_ids,
  )?;
  let owned: Vec<String> = asset_ids
    .into_iter()
    .filter(|a| !shared_assets.contains(a))
    .collect();
  closure.extend(TableName::Asset, owned.iter().cloned());

  let content_links = query_strings_in(conn, "SELECT id FROM asset_content_link WHERE asset_id IN", &[], &owned)?;
  closure.extend(TableName::AssetContentLink, content_links.iter().cloned());
  closure.extend(
    TableName::Vote,
    query_strings_in(conn, "SELECT id FROM vote WHERE asset_id IN", &[], &owned)?,
  );
  closure.extend(
    TableName::AssetTagLink,
    query_strings_in(
      conn,
      "SELECT asset_id || '|' || tag_id FROM asset_tag_link WHERE asset_id IN",
      &[],
      &owned,
    )?,
  );
  closure.extend(
    TableName::QuestTagLink,
    query_strings(
      conn,
      "SELECT quest_id || '|' || tag_id FROM quest_tag_link WHERE quest_id = ?1",
      &[&quest_id],
    )?,
  );

  let attachment_ids = owned_attachments(conn, &content_links)?;
  let pending_uploads = count_pending(conn, &closure, &attachment_ids)?;
  let estimated_bytes = estimate_bytes(conn, &content_links, &attachment_ids)?;

  Ok(Some(OffloadPlan {
    quest_id: quest_id.to_string(),
    closure,
    shared_assets,
    attachment_ids,
    pending_uploads,
    estimated_bytes,
  }))
}

/// Attachment ids referenced by `content_links` and by no other content link.
fn owned_attachments(conn: &Connection, content_links: &[String]) -> rusqlite::Result<Vec<String>> {
  let audio = query_strings_in(
    conn,
    "SELECT audio FROM asset_content_link WHERE audio IS NOT NULL AND id IN",
    &[],
    content_links,
  )?;

  let mut ids: Vec<String> = Vec::new();
  for raw in audio {
    match serde_json::from_str::<Vec<String>>(&raw) {
      Ok(entries) => {
        for id in entries {
          if !ids.contains(&id) {
            ids.push(id);
          }
        }
      }
      Err(e) => debug!(error = %e, "Skipping unreadable audio array"),
    }
  }

  let mut owned = Vec::with_capacity(ids.len());
  for id in ids {
    if !referenced_elsewhere(conn, &id, content_links)? {
      owned.push(id);
    }
  }
  Ok(owned)
}

/// Whether a content link outside `content_links` lists `id` in its audio.
///
/// `instr` only narrows the candidates; membership is decided on the parsed
/// array. An unreadable array counts as a reference.
fn referenced_elsewhere(conn: &Connection, id: &str, content_links: &[String]) -> rusqlite::Result<bool> {
  let mut params: Vec<&dyn ToSql> = Vec::with_capacity(content_links.len() + 1);
  params.push(&id);
  params.extend(content_links.iter().map(|c| c as &dyn ToSql));
  let candidates = query_strings(
    conn,
    &format!(
      "SELECT audio FROM asset_content_link WHERE instr(COALESCE(audio, ''), ?) > 0 AND id NOT IN ({})",
      placeholders(content_links.len())
    ),
    params.as_slice(),
  )?;

  Ok(candidates.iter().any(|raw| {
    serde_json::from_str::<Vec<String>>(raw)
      .map(|entries| entries.iter().any(|entry| entry == id))
      .unwrap_or(true)
  }))
}

fn count_pending(conn: &Connection, closure: &RecordClosure, attachment_ids: &[String]) -> rusqlite::Result<usize> {
  let mut pending = 0;
  for (table, ids) in closure.tables() {
    let table_name = table.as_str();
    pending += query_strings_in(
      conn,
      "SELECT record_id FROM crud_queue WHERE table_name = ? AND record_id IN",
      &[&table_name],
      ids,
    )?
    .len();
  }

  let upload_state = AttachmentState::QueuedUpload.code();
  pending += query_strings_in(
    conn,
    "SELECT id FROM attachments WHERE state = ? AND id IN",
    &[&upload_state],
    attachment_ids,
  )?
  .len();
  Ok(pending)
}

fn estimate_bytes(conn: &Connection, content_links: &[String], attachment_ids: &[String]) -> rusqlite::Result<u64> {
  let sum = |sql: &str, ids: &[String]| -> rusqlite::Result<i64> {
    if ids.is_empty() {
      return Ok(0);
    }
    let params: Vec<&dyn ToSql> = ids.iter().map(|s| s as &dyn ToSql).collect();
    conn.query_row(
      &format!("{} ({})", sql, placeholders(ids.len())),
      params.as_slice(),
      |row| row.get(0),
    )
  };

  let text = sum(
    "SELECT COALESCE(SUM(length(COALESCE(text, '')) + length(COALESCE(audio, ''))), 0) FROM asset_content_link WHERE id IN",
    content_links,
  )?;
  let files = sum(
    "SELECT COALESCE(SUM(COALESCE(size, 0)), 0) FROM attachments WHERE id IN",
    attachment_ids,
  )?;
  Ok(u64::try_from(text + files).unwrap_or(0))
}

/// Leaf-to-root deletion of the plan.
fn delete_plan(
  tx: &Transaction<'_>,
  plan: &OffloadPlan,
  on_progress: &(dyn Fn(u8, &str) + Sync),
) -> Result<Vec<(String, usize)>> {
  let closure = &plan.closure;
  let mut deleted = Vec::new();

  on_progress(10, "Deleting votes");
  deleted.push(("vote".to_string(), delete_in(tx, "vote", "id", closure.get(TableName::Vote))?));

  on_progress(20, "Deleting tag links");
  deleted.push((
    "asset_tag_link".to_string(),
    delete_pairs(tx, TableName::AssetTagLink, closure.get(TableName::AssetTagLink))?,
  ));
  deleted.push((
    "quest_tag_link".to_string(),
    delete_pairs(tx, TableName::QuestTagLink, closure.get(TableName::QuestTagLink))?,
  ));

  on_progress(35, "Deleting content links");
  deleted.push((
    "asset_content_link".to_string(),
    delete_in(tx, "asset_content_link", "id", closure.get(TableName::AssetContentLink))?,
  ));

  on_progress(50, "Deleting attachments");
  deleted.push((
    "attachments".to_string(),
    delete_in(tx, "attachments", "id", &plan.attachment_ids)?,
  ));

  on_progress(65, "Deleting assets");
  deleted.push(("asset".to_string(), delete_in(tx, "asset", "id", closure.get(TableName::Asset))?));

  on_progress(75, "Deleting quest");
  deleted.push((
    "quest_asset_link".to_string(),
    tx.execute("DELETE FROM quest_asset_link WHERE quest_id = ?1", [&plan.quest_id])?,
  ));
  deleted.push((
    "quest".to_string(),
    tx.execute("DELETE FROM quest WHERE id = ?1", [&plan.quest_id])?,
  ));

  debug!(?deleted, "Offload deletions staged");
  Ok(deleted)
}

fn delete_in(tx: &Transaction<'_>, table: &str, column: &str, ids: &[String]) -> rusqlite::Result<usize> {
  if ids.is_empty() {
    return Ok(0);
  }
  let params: Vec<&dyn ToSql> = ids.iter().map(|s| s as &dyn ToSql).collect();
  tx.execute(
    &format!("DELETE FROM {} WHERE {} IN ({})", table, column, placeholders(ids.len())),
    params.as_slice(),
  )
}

fn delete_pairs(tx: &Transaction<'_>, table: TableName, keys: &[String]) -> Result<usize> {
  let Some((c1, c2)) = table.link_columns() else {
    return Ok(0);
  };
  let mut stmt = tx.prepare(&format!(
    "DELETE FROM {} WHERE {} = ?1 AND {} = ?2",
    table.as_str(),
    c1,
    c2
  ))?;

  let mut count = 0;
  for key in keys {
    let (k1, k2) = key
      .split_once('|')
      .ok_or_else(|| LifecycleError::InvalidRecordKey(key.clone()))?;
    count += stmt.execute([k1, k2])?;
  }
  Ok(count)
}
