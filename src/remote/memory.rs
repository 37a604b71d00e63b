//! In-memory [`RemoteStore`] with call recording and failure injection.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{row_key, row_str, Filter, RemoteQuery, RemoteStore, Row};
use crate::error::LifecycleError;
use crate::model::{RecordKey, TableName};

/// A membership call observed by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
  Add(TableName, String),
  Remove(TableName, String),
}

impl Call {
  pub fn table(&self) -> TableName {
    match self {
      Self::Add(t, _) | Self::Remove(t, _) => *t,
    }
  }
}

#[derive(Default)]
pub struct MemoryRemoteStore {
  tables: Mutex<HashMap<TableName, Vec<Row>>>,
  calls: Mutex<Vec<Call>>,
  failing: Mutex<HashSet<(TableName, String)>>,
  failing_selects: Mutex<HashSet<TableName>>,
  wanted_quests: Mutex<HashMap<String, BTreeSet<String>>>,
  unreachable: AtomicBool,
}

impl MemoryRemoteStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Insert a row; `active` and `download_profiles` get defaults when absent.
  pub fn insert(&self, table: TableName, row: Value) {
    let mut row = row.as_object().cloned().unwrap_or_default();
    row.entry("active").or_insert(json!(true));
    row.entry("download_profiles").or_insert(json!([]));
    self.tables.lock().unwrap().entry(table).or_default().push(row);
  }

  /// Make every membership call for `key` on `table` fail.
  pub fn fail_on(&self, table: TableName, key: &str) {
    self.failing.lock().unwrap().insert((table, key.to_string()));
  }

  /// Make every select on `table` fail.
  pub fn fail_select(&self, table: TableName) {
    self.failing_selects.lock().unwrap().insert(table);
  }

  pub fn set_unreachable(&self, unreachable: bool) {
    self.unreachable.store(unreachable, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<Call> {
    self.calls.lock().unwrap().clone()
  }

  pub fn set_wanted_quests(&self, profile_id: &str, quests: &[&str]) {
    self.wanted_quests.lock().unwrap().insert(
      profile_id.to_string(),
      quests.iter().map(|q| q.to_string()).collect(),
    );
  }

  pub fn wanted_quests(&self, profile_id: &str) -> BTreeSet<String> {
    self
      .wanted_quests
      .lock()
      .unwrap()
      .get(profile_id)
      .cloned()
      .unwrap_or_default()
  }

  /// Current `download_profiles` of a row, if the row exists.
  pub fn profiles(&self, table: TableName, key: &str) -> Option<Vec<String>> {
    let tables = self.tables.lock().unwrap();
    let row = tables
      .get(&table)?
      .iter()
      .find(|r| row_key(table, r).as_deref() == Some(key))?;
    Some(profiles_of(row))
  }

  /// Number of rows across all tables whose `download_profiles` contain `profile_id`.
  pub fn rows_with_profile(&self, profile_id: &str) -> usize {
    self
      .tables
      .lock()
      .unwrap()
      .values()
      .flatten()
      .filter(|r| profiles_of(r).iter().any(|p| p == profile_id))
      .count()
  }

  fn check_reachable(&self) -> Result<(), LifecycleError> {
    if self.unreachable.load(Ordering::SeqCst) {
      Err(LifecycleError::Network("remote unreachable".to_string()))
    } else {
      Ok(())
    }
  }

  fn mutate(
    &self,
    call: Call,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
    add: bool,
  ) -> Result<bool, LifecycleError> {
    self.calls.lock().unwrap().push(call);
    self.check_reachable()?;

    let key = key.to_string();
    if self.failing.lock().unwrap().contains(&(table, key.clone())) {
      return Err(LifecycleError::Network(format!("injected failure on {} {}", table, key)));
    }

    let mut tables = self.tables.lock().unwrap();
    let row = tables
      .get_mut(&table)
      .and_then(|rows| {
        rows
          .iter_mut()
          .find(|r| row_key(table, r).as_deref() == Some(key.as_str()))
      })
      .ok_or_else(|| LifecycleError::Network(format!("{} {} not found", table, key)))?;

    let mut profiles = profiles_of(row);
    let present = profiles.iter().any(|p| p == profile_id);
    let changed = if add && !present {
      profiles.push(profile_id.to_string());
      true
    } else if !add && present {
      profiles.retain(|p| p != profile_id);
      true
    } else {
      false
    };
    row.insert("download_profiles".to_string(), json!(profiles));
    Ok(changed)
  }
}

fn profiles_of(row: &Row) -> Vec<String> {
  row
    .get("download_profiles")
    .and_then(Value::as_array)
    .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
    .unwrap_or_default()
}

fn matches(row: &Row, filter: &Filter) -> bool {
  match filter {
    Filter::Eq(column, value) => match row.get(column) {
      Some(Value::Bool(b)) => b.to_string() == *value,
      _ => row_str(row, column).as_deref() == Some(value.as_str()),
    },
    Filter::In(column, values) => row_str(row, column).is_some_and(|v| values.contains(&v)),
    Filter::NotNull(column) => !matches!(row.get(column), None | Some(Value::Null)),
    Filter::Contains(column, value) => row
      .get(column)
      .and_then(Value::as_array)
      .is_some_and(|a| a.iter().any(|v| v.as_str() == Some(value.as_str()))),
  }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
  async fn select(&self, query: &RemoteQuery) -> Result<Vec<Row>, LifecycleError> {
    self.check_reachable()?;
    if self.failing_selects.lock().unwrap().contains(&query.table) {
      return Err(LifecycleError::Network(format!("injected select failure on {}", query.table)));
    }

    let tables = self.tables.lock().unwrap();
    let rows = tables.get(&query.table).map(Vec::as_slice).unwrap_or(&[]);
    let mut out: Vec<Row> = rows
      .iter()
      .filter(|r| query.filters.iter().all(|f| matches(r, f)))
      .cloned()
      .collect();
    if let Some(limit) = query.limit {
      out.truncate(limit);
    }
    Ok(out)
  }

  async fn add_to_download_profiles(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError> {
    self.mutate(Call::Add(table, key.to_string()), table, key, profile_id, true)
  }

  async fn remove_from_download_profiles(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError> {
    self.mutate(Call::Remove(table, key.to_string()), table, key, profile_id, false)
  }

  async fn remove_downloaded_quest(
    &self,
    profile_id: &str,
    quest_id: &str,
  ) -> Result<bool, LifecycleError> {
    self.check_reachable()?;
    Ok(
      self
        .wanted_quests
        .lock()
        .unwrap()
        .entry(profile_id.to_string())
        .or_default()
        .remove(quest_id),
    )
  }
}
