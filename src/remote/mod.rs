//! Authoritative remote store surface.
//!
//! Discovery issues plain row selects; membership changes go through atomic
//! add/remove RPCs on the `download_profiles` array column.

#[cfg(test)]
pub mod memory;
pub mod rest;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::LifecycleError;
use crate::model::{RecordKey, TableName};

pub use rest::RestRemoteStore;

/// One row returned by a remote select.
pub type Row = serde_json::Map<String, Value>;

/// A single column predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
  Eq(String, String),
  In(String, Vec<String>),
  NotNull(String),
  /// Array column contains the value.
  Contains(String, String),
}

/// Row select against one remote table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteQuery {
  pub table: TableName,
  pub columns: Vec<String>,
  pub filters: Vec<Filter>,
  pub limit: Option<usize>,
}

impl RemoteQuery {
  pub fn new(table: TableName) -> Self {
    Self {
      table,
      columns: Vec::new(),
      filters: Vec::new(),
      limit: None,
    }
  }

  pub fn select(mut self, columns: &[&str]) -> Self {
    self.columns = columns.iter().map(|c| c.to_string()).collect();
    self
  }

  pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
    self.filters.push(Filter::Eq(column.to_string(), value.into()));
    self
  }

  pub fn in_list(mut self, column: &str, values: &[String]) -> Self {
    self
      .filters
      .push(Filter::In(column.to_string(), values.to_vec()));
    self
  }

  pub fn not_null(mut self, column: &str) -> Self {
    self.filters.push(Filter::NotNull(column.to_string()));
    self
  }

  pub fn contains(mut self, column: &str, value: impl Into<String>) -> Self {
    self
      .filters
      .push(Filter::Contains(column.to_string(), value.into()));
    self
  }

  /// Only rows with `active = true`.
  pub fn active(self) -> Self {
    self.eq("active", "true")
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }
}

/// Remote relational store used for discovery and membership changes.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Select rows matching `query`.
  async fn select(&self, query: &RemoteQuery) -> Result<Vec<Row>, LifecycleError>;

  /// Atomic set-union of `profile_id` into the row's `download_profiles`.
  ///
  /// Returns `false` when the profile was already present.
  async fn add_to_download_profiles(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError>;

  /// Atomic set-difference of `profile_id` from the row's `download_profiles`.
  ///
  /// Returns `false` when the profile was not present.
  async fn remove_from_download_profiles(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError>;

  /// Remove `quest_id` from the profile's list of wanted quests.
  async fn remove_downloaded_quest(
    &self,
    profile_id: &str,
    quest_id: &str,
  ) -> Result<bool, LifecycleError>;
}

/// Read a column as a string, accepting string or numeric JSON values.
pub fn row_str(row: &Row, column: &str) -> Option<String> {
  match row.get(column)? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Collect a column across rows, skipping nulls.
pub fn column_values(rows: &[Row], column: &str) -> Vec<String> {
  rows.iter().filter_map(|r| row_str(r, column)).collect()
}

/// Serialize the key of a row of `table` (`a|b` for link tables).
pub fn row_key(table: TableName, row: &Row) -> Option<String> {
  match table.link_columns() {
    Some((k1, k2)) => Some(format!("{}|{}", row_str(row, k1)?, row_str(row, k2)?)),
    None => row_str(row, "id"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_query_builder_collects_filters() {
    let query = RemoteQuery::new(TableName::Vote)
      .select(&["id"])
      .in_list("asset_id", &["a1".to_string()])
      .active()
      .limit(10);

    assert_eq!(query.columns, vec!["id".to_string()]);
    assert_eq!(query.filters.len(), 2);
    assert_eq!(query.filters[1], Filter::Eq("active".into(), "true".into()));
    assert_eq!(query.limit, Some(10));
  }

  #[test]
  fn test_row_key_for_link_table() {
    let r = row(json!({"quest_id": "q1", "asset_id": "a1"}));
    assert_eq!(row_key(TableName::QuestAssetLink, &r), Some("q1|a1".to_string()));
    assert_eq!(row_key(TableName::Asset, &r), None);
  }

  #[test]
  fn test_column_values_skip_nulls() {
    let rows = vec![
      row(json!({"languoid_id": "l1"})),
      row(json!({"languoid_id": null})),
      row(json!({"languoid_id": 7})),
    ];
    assert_eq!(column_values(&rows, "languoid_id"), vec!["l1", "7"]);
  }
}
