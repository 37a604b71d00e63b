//! Device-local SQLite replica.

pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::{Connection, ToSql, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::LifecycleError;

/// Connection wrapper for the local replica.
///
/// Opening does not migrate. Schema migrations run only through the
/// migration gate, which must resolve before anything else reads the store.
pub struct LocalStore {
  conn: Mutex<Connection>,
}

impl LocalStore {
  /// Open or create the replica at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Open a throwaway replica, used by tests and dry runs.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Replica location inside the data directory.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("replica.db")
  }

  /// Current `user_version` of the replica.
  pub fn schema_version(&self) -> Result<i64> {
    self.with_conn(|conn| conn.query_row("PRAGMA user_version", [], |row| row.get(0)))
  }

  /// Apply every pending schema step. Returns the resulting version.
  ///
  /// Each step commits on its own, so a failure leaves the replica at the
  /// last fully applied version.
  pub fn run_migrations(&self) -> Result<i64> {
    let mut conn = self.lock()?;
    let mut version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    if version > schema::SCHEMA_VERSION {
      warn!(
        version,
        supported = schema::SCHEMA_VERSION,
        "Replica schema is newer than this build"
      );
      return Err(eyre!(
        "Replica schema version {} is newer than supported version {}",
        version,
        schema::SCHEMA_VERSION
      ));
    }

    for (target, sql) in schema::STEPS {
      if version >= target {
        continue;
      }

      let tx = conn
        .transaction()
        .map_err(|e| eyre!("Failed to begin migration transaction: {}", e))?;
      tx.execute_batch(sql)
        .map_err(|e| eyre!("Failed to apply schema v{}: {}", target, e))?;
      tx.execute_batch(&format!("PRAGMA user_version = {};", target))
        .map_err(|e| eyre!("Failed to record schema v{}: {}", target, e))?;
      tx.commit()
        .map_err(|e| eyre!("Failed to commit schema v{}: {}", target, e))?;

      info!(from = version, to = target, "Applied local schema step");
      version = target;
    }

    Ok(version)
  }

  /// Run a read or single-statement write against the connection.
  pub fn with_conn<R>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<R>) -> Result<R> {
    let conn = self.lock()?;
    f(&conn).map_err(|e| eyre!("Local query failed: {}", e))
  }

  /// Run `f` inside one atomic transaction.
  ///
  /// Commits when `f` returns `Ok`; otherwise rolls back and reports
  /// [`LifecycleError::Transaction`].
  pub fn transaction<R>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<R>) -> Result<R> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| LifecycleError::Transaction(format!("begin: {}", e)))?;

    match f(&tx) {
      Ok(value) => {
        tx.commit()
          .map_err(|e| LifecycleError::Transaction(format!("commit: {}", e)))?;
        Ok(value)
      }
      Err(e) => {
        if let Err(rollback) = tx.rollback() {
          warn!(error = %rollback, "Rollback reported an error");
        }
        debug!(error = %e, "Local transaction rolled back");
        Err(LifecycleError::Transaction(format!("{:#}", e)).into())
      }
    }
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// `?, ?, ?` for an `IN (...)` clause of `n` values.
pub(crate) fn placeholders(n: usize) -> String {
  vec!["?"; n].join(", ")
}

/// Collect the first column of every row as a string.
pub(crate) fn query_strings(
  conn: &Connection,
  sql: &str,
  params: &[&dyn ToSql],
) -> rusqlite::Result<Vec<String>> {
  let mut stmt = conn.prepare(sql)?;
  let rows = stmt.query_map(params, |row| row.get::<_, String>(0))?;
  rows.collect()
}

/// Like [`query_strings`] with an `IN` list bound after the leading params.
pub(crate) fn query_strings_in(
  conn: &Connection,
  sql_prefix: &str,
  leading: &[&dyn ToSql],
  list: &[String],
) -> rusqlite::Result<Vec<String>> {
  if list.is_empty() {
    return Ok(Vec::new());
  }
  let sql = format!("{} ({})", sql_prefix, placeholders(list.len()));
  let mut params: Vec<&dyn ToSql> = leading.to_vec();
  params.extend(list.iter().map(|s| s as &dyn ToSql));
  query_strings(conn, &sql, &params)
}
