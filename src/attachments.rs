//! Detection and repair of corrupted attachment references.
//!
//! An attachment whose id, uri or filename holds a process-local `blob:` URL
//! can never be resolved again. Such records are removed from the queue and
//! from every content link's audio array.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{OptionalExtension, Row};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::local::LocalStore;

/// Scheme of URLs that only live as long as the process that created them.
pub const EPHEMERAL_MARKER: &str = "blob:";

/// Sync state of a queued attachment, as stored in `attachments.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
  QueuedSync,
  QueuedUpload,
  QueuedDownload,
  Synced,
  Archived,
}

impl AttachmentState {
  pub fn from_code(code: i64) -> Option<Self> {
    match code {
      0 => Some(Self::QueuedSync),
      1 => Some(Self::QueuedUpload),
      2 => Some(Self::QueuedDownload),
      3 => Some(Self::Synced),
      4 => Some(Self::Archived),
      _ => None,
    }
  }

  pub fn code(&self) -> i64 {
    match self {
      Self::QueuedSync => 0,
      Self::QueuedUpload => 1,
      Self::QueuedDownload => 2,
      Self::Synced => 3,
      Self::Archived => 4,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentRecord {
  pub id: String,
  pub filename: Option<String>,
  pub local_uri: Option<String>,
  pub state: Option<AttachmentState>,
  pub size: Option<i64>,
}

impl AttachmentRecord {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      filename: row.get(1)?,
      local_uri: row.get(2)?,
      state: row.get::<_, Option<i64>>(3)?.and_then(AttachmentState::from_code),
      size: row.get(4)?,
    })
  }

  pub fn is_corrupted(&self) -> bool {
    [Some(&self.id), self.filename.as_ref(), self.local_uri.as_ref()]
      .into_iter()
      .flatten()
      .any(|v| v.contains(EPHEMERAL_MARKER))
  }
}

/// A content link that references an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContentLinkRef {
  pub id: String,
  pub asset_id: String,
  pub asset_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptedAttachment {
  pub attachment: AttachmentRecord,
  pub content_links: Vec<ContentLinkRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
  pub cleaned: usize,
  pub errors: Vec<String>,
}

/// Truncate an id for log lines; corrupted ids can be very long URLs.
pub fn short_id(id: &str) -> &str {
  id.char_indices().nth(20).map(|(i, _)| &id[..i]).unwrap_or(id)
}

const CORRUPTED_FILTER: &str = "instr(id, ?1) > 0 \
  OR instr(COALESCE(local_uri, ''), ?1) > 0 \
  OR instr(COALESCE(filename, ''), ?1) > 0";

pub struct AttachmentIntegrityService {
  local: Arc<LocalStore>,
}

impl AttachmentIntegrityService {
  pub fn new(local: Arc<LocalStore>) -> Self {
    Self { local }
  }

  /// Every corrupted attachment with the content links and assets that reference it.
  pub fn scan_corrupted(&self) -> Result<Vec<CorruptedAttachment>> {
    self.local.with_conn(|conn| {
      let mut stmt = conn.prepare(&format!(
        "SELECT id, filename, local_uri, state, size FROM attachments WHERE {}",
        CORRUPTED_FILTER
      ))?;
      let records = stmt
        .query_map([EPHEMERAL_MARKER], AttachmentRecord::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

      let mut links = conn.prepare(
        "SELECT acl.id, acl.asset_id, a.name FROM asset_content_link acl \
         LEFT JOIN asset a ON a.id = acl.asset_id \
         WHERE instr(COALESCE(acl.audio, ''), ?1) > 0",
      )?;

      let mut corrupted = Vec::with_capacity(records.len());
      for attachment in records {
        let content_links = links
          .query_map([&attachment.id], |row| {
            Ok(ContentLinkRef {
              id: row.get(0)?,
              asset_id: row.get(1)?,
              asset_name: row.get(2)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        corrupted.push(CorruptedAttachment {
          attachment,
          content_links,
        });
      }
      Ok(corrupted)
    })
  }

  /// Count-only variant of [`Self::scan_corrupted`].
  pub fn corrupted_count(&self) -> Result<usize> {
    self.local.with_conn(|conn| {
      conn.query_row(
        &format!("SELECT COUNT(*) FROM attachments WHERE {}", CORRUPTED_FILTER),
        [EPHEMERAL_MARKER],
        |row| row.get::<_, i64>(0),
      )
    })
    .map(|n| n as usize)
  }

  /// Strip `attachment_id` from every audio array and delete its queue row,
  /// in one transaction. Returns whether anything changed.
  pub fn cleanup_one(&self, attachment_id: &str) -> Result<bool> {
    let changed = self.local.transaction(|tx| {
      let referencing: Vec<(String, String)> = {
        let mut stmt = tx.prepare(
          "SELECT id, audio FROM asset_content_link WHERE instr(COALESCE(audio, ''), ?1) > 0",
        )?;
        let rows = stmt.query_map([attachment_id], |row| {
          Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        rows.collect::<rusqlite::Result<_>>()?
      };

      let mut rewritten = 0;
      for (link_id, audio) in referencing {
        let entries: Vec<String> = serde_json::from_str(&audio)
          .map_err(|e| eyre!("Content link {} has unreadable audio: {}", link_id, e))?;
        let kept: Vec<&String> = entries.iter().filter(|a| *a != attachment_id).collect();
        // Substring hit on a different id, nothing to rewrite
        if kept.len() == entries.len() {
          continue;
        }
        tx.execute(
          "UPDATE asset_content_link SET audio = ?1 WHERE id = ?2",
          (serde_json::to_string(&kept)?, &link_id),
        )?;
        rewritten += 1;
      }

      let deleted = tx.execute("DELETE FROM attachments WHERE id = ?1", [attachment_id])?;
      Ok(rewritten > 0 || deleted > 0)
    })?;

    if changed {
      info!(attachment_id = short_id(attachment_id), "Removed corrupted attachment");
    } else {
      debug!(attachment_id = short_id(attachment_id), "Attachment already clean");
    }
    Ok(changed)
  }

  /// Clean every corrupted attachment. One failure never stops the rest.
  pub fn cleanup_all(&self) -> Result<CleanupReport> {
    let corrupted = self.scan_corrupted()?;
    let mut report = CleanupReport::default();

    for item in corrupted {
      let id = &item.attachment.id;
      match self.cleanup_one(id) {
        Ok(_) => report.cleaned += 1,
        Err(e) => {
          warn!(attachment_id = short_id(id), error = %e, "Attachment cleanup failed");
          report.errors.push(format!("{}: {:#}", short_id(id), e));
        }
      }
    }

    info!(cleaned = report.cleaned, failed = report.errors.len(), "Attachment cleanup finished");
    Ok(report)
  }

  /// Look up one attachment record.
  pub fn get(&self, attachment_id: &str) -> Result<Option<AttachmentRecord>> {
    self.local.with_conn(|conn| {
      conn
        .query_row(
          "SELECT id, filename, local_uri, state, size FROM attachments WHERE id = ?1",
          [attachment_id],
          AttachmentRecord::from_row,
        )
        .optional()
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::{local_count, local_store};
  use serde_json::json;

  fn service() -> (Arc<LocalStore>, AttachmentIntegrityService) {
    let local = Arc::new(local_store());
    (Arc::clone(&local), AttachmentIntegrityService::new(local))
  }

  fn insert_link(local: &LocalStore, id: &str, asset_id: &str, audio: &str) {
    local
      .with_conn(|conn| {
        conn.execute(
          "INSERT INTO asset_content_link (id, asset_id, audio) VALUES (?1, ?2, ?3)",
          (id, asset_id, audio),
        )
      })
      .unwrap();
  }

  fn insert_attachment(local: &LocalStore, id: &str, local_uri: &str) {
    local
      .with_conn(|conn| {
        conn.execute(
          "INSERT INTO attachments (id, filename, local_uri, state) VALUES (?1, ?1, ?2, 1)",
          (id, local_uri),
        )
      })
      .unwrap();
  }

  fn audio(local: &LocalStore, id: &str) -> Vec<String> {
    let raw: String = local
      .with_conn(|conn| {
        conn.query_row("SELECT audio FROM asset_content_link WHERE id = ?1", [id], |r| r.get(0))
      })
      .unwrap();
    serde_json::from_str(&raw).unwrap()
  }

  #[test]
  fn test_cleanup_one_strips_reference_and_row() {
    let (local, service) = service();
    insert_link(&local, "c1", "a1", &json!(["a", "corrupt:xyz", "b"]).to_string());
    insert_attachment(&local, "corrupt:xyz", "blob:http://localhost/123");

    assert!(service.cleanup_one("corrupt:xyz").unwrap());
    assert_eq!(audio(&local, "c1"), vec!["a", "b"]);
    assert!(service.get("corrupt:xyz").unwrap().is_none());

    // Already clean
    assert!(!service.cleanup_one("corrupt:xyz").unwrap());
    assert_eq!(audio(&local, "c1"), vec!["a", "b"]);
  }

  #[test]
  fn test_cleanup_ignores_substring_matches_of_other_ids() {
    let (local, service) = service();
    insert_link(&local, "c1", "a1", &json!(["att-10", "att-1"]).to_string());

    service.cleanup_one("att-1").unwrap();
    assert_eq!(audio(&local, "c1"), vec!["att-10"]);
  }

  #[test]
  fn test_scan_reports_owning_links_and_assets() {
    let (local, service) = service();
    local
      .with_conn(|conn| conn.execute("INSERT INTO asset (id, name) VALUES ('a1', 'Genesis 1')", []))
      .unwrap();
    insert_link(&local, "c1", "a1", &json!(["att-ok", "att-bad"]).to_string());
    insert_attachment(&local, "att-ok", "file:///data/att-ok.m4a");
    insert_attachment(&local, "att-bad", "blob:http://localhost/abc");

    let corrupted = service.scan_corrupted().unwrap();
    assert_eq!(corrupted.len(), 1);
    assert_eq!(corrupted[0].attachment.id, "att-bad");
    assert_eq!(corrupted[0].attachment.state, Some(AttachmentState::QueuedUpload));
    assert_eq!(
      corrupted[0].content_links,
      vec![ContentLinkRef {
        id: "c1".into(),
        asset_id: "a1".into(),
        asset_name: Some("Genesis 1".into()),
      }]
    );
    assert_eq!(service.corrupted_count().unwrap(), 1);
  }

  #[test]
  fn test_cleanup_all_continues_past_failures() {
    let (local, service) = service();
    insert_attachment(&local, "blob:one", "file:///x");
    insert_attachment(&local, "blob:two", "file:///y");
    insert_link(&local, "c1", "a1", &json!(["blob:one", "ok"]).to_string());
    // Unparseable audio makes the second cleanup roll back
    insert_link(&local, "c2", "a2", "[blob:two");

    let report = service.cleanup_all().unwrap();
    assert_eq!(report.cleaned, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("blob:two"));

    assert_eq!(audio(&local, "c1"), vec!["ok"]);
    assert!(service.get("blob:two").unwrap().is_some());
    assert_eq!(local_count(&local, "attachments"), 1);
  }

  #[test]
  fn test_short_id_truncates_on_char_boundary() {
    assert_eq!(short_id("short"), "short");
    assert_eq!(short_id("blob:http://localhost:8081/aaaa"), "blob:http://localhos");
    assert_eq!(short_id(&"é".repeat(30)).chars().count(), 20);
  }

  #[test]
  fn test_state_codes() {
    for code in 0..5 {
      assert_eq!(AttachmentState::from_code(code).unwrap().code(), code);
    }
    assert!(AttachmentState::from_code(9).is_none());
    let record = AttachmentRecord {
      id: "x".into(),
      filename: None,
      local_uri: Some("blob:abc".into()),
      state: None,
      size: None,
    };
    assert!(record.is_corrupted());
  }
}
