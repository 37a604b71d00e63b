//! Entity kinds, record keys and id closures.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::LifecycleError;

/// Remote tables read by discovery or tracked through `download_profiles`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableName {
  Project,
  Quest,
  QuestAssetLink,
  Asset,
  AssetContentLink,
  Vote,
  QuestTagLink,
  AssetTagLink,
  Tag,
  Language,
  Languoid,
  LanguoidAlias,
  LanguoidSource,
  LanguoidProperty,
  LanguoidRegion,
  Region,
  RegionAlias,
  RegionSource,
  RegionProperty,
  /// Read during discovery only, never tracked
  ProjectLanguageLink,
}

impl TableName {
  pub const ALL: [TableName; 20] = [
    TableName::Project,
    TableName::Quest,
    TableName::QuestAssetLink,
    TableName::Asset,
    TableName::AssetContentLink,
    TableName::Vote,
    TableName::QuestTagLink,
    TableName::AssetTagLink,
    TableName::Tag,
    TableName::Language,
    TableName::Languoid,
    TableName::LanguoidAlias,
    TableName::LanguoidSource,
    TableName::LanguoidProperty,
    TableName::LanguoidRegion,
    TableName::Region,
    TableName::RegionAlias,
    TableName::RegionSource,
    TableName::RegionProperty,
    TableName::ProjectLanguageLink,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Project => "project",
      Self::Quest => "quest",
      Self::QuestAssetLink => "quest_asset_link",
      Self::Asset => "asset",
      Self::AssetContentLink => "asset_content_link",
      Self::Vote => "vote",
      Self::QuestTagLink => "quest_tag_link",
      Self::AssetTagLink => "asset_tag_link",
      Self::Tag => "tag",
      Self::Language => "language",
      Self::Languoid => "languoid",
      Self::LanguoidAlias => "languoid_alias",
      Self::LanguoidSource => "languoid_source",
      Self::LanguoidProperty => "languoid_property",
      Self::LanguoidRegion => "languoid_region",
      Self::Region => "region",
      Self::RegionAlias => "region_alias",
      Self::RegionSource => "region_source",
      Self::RegionProperty => "region_property",
      Self::ProjectLanguageLink => "project_language_link",
    }
  }

  /// Key columns of a link table keyed by two foreign keys.
  pub fn link_columns(&self) -> Option<(&'static str, &'static str)> {
    match self {
      Self::QuestAssetLink => Some(("quest_id", "asset_id")),
      Self::QuestTagLink => Some(("quest_id", "tag_id")),
      Self::AssetTagLink => Some(("asset_id", "tag_id")),
      _ => None,
    }
  }

  pub fn is_link(&self) -> bool {
    self.link_columns().is_some()
  }
}

impl FromStr for TableName {
  type Err = LifecycleError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::ALL
      .into_iter()
      .find(|t| t.as_str() == s)
      .ok_or_else(|| LifecycleError::InvalidRecordKey(format!("unknown table '{}'", s)))
  }
}

impl fmt::Display for TableName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Primary key of a syncable row.
///
/// Link tables use a composite key serialized as `"{key1}|{key2}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
  Single(String),
  Composite(String, String),
}

impl RecordKey {
  /// Parse a serialized key against the key shape of `table`.
  pub fn parse(table: TableName, raw: &str) -> Result<Self, LifecycleError> {
    if table.is_link() {
      match raw.split_once('|') {
        Some((a, b)) if !a.is_empty() && !b.is_empty() && !b.contains('|') => {
          Ok(Self::Composite(a.to_string(), b.to_string()))
        }
        _ => Err(LifecycleError::InvalidRecordKey(format!(
          "{} expects a composite key, got '{}'",
          table, raw
        ))),
      }
    } else if raw.is_empty() || raw.contains('|') {
      Err(LifecycleError::InvalidRecordKey(format!(
        "{} expects a single key, got '{}'",
        table, raw
      )))
    } else {
      Ok(Self::Single(raw.to_string()))
    }
  }

  pub fn composite(key1: impl Into<String>, key2: impl Into<String>) -> Self {
    Self::Composite(key1.into(), key2.into())
  }
}

impl fmt::Display for RecordKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Single(id) => f.write_str(id),
      Self::Composite(a, b) => write!(f, "{}|{}", a, b),
    }
  }
}

/// Ids of a cascade's dependency closure, grouped by table.
///
/// Ids are kept in their serialized form (composite keys as `a|b`) and
/// deduplicated on insert while preserving discovery order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordClosure {
  ids: BTreeMap<TableName, Vec<String>>,
}

impl RecordClosure {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, table: TableName) -> &[String] {
    self.ids.get(&table).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn insert(&mut self, table: TableName, id: impl Into<String>) {
    let id = id.into();
    let entry = self.ids.entry(table).or_default();
    if !entry.contains(&id) {
      entry.push(id);
    }
  }

  pub fn extend<I, S>(&mut self, table: TableName, ids: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    for id in ids {
      self.insert(table, id);
    }
  }

  /// Replace the ids of one table wholesale.
  pub fn set(&mut self, table: TableName, ids: Vec<String>) {
    self.ids.remove(&table);
    self.extend(table, ids);
  }

  pub fn clear(&mut self, table: TableName) {
    self.ids.remove(&table);
  }

  pub fn count(&self, table: TableName) -> usize {
    self.get(table).len()
  }

  pub fn total(&self) -> usize {
    self.ids.values().map(Vec::len).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.total() == 0
  }

  pub fn tables(&self) -> impl Iterator<Item = (TableName, &[String])> {
    self.ids.iter().map(|(t, ids)| (*t, ids.as_slice()))
  }

  pub fn contains(&self, table: TableName, id: &str) -> bool {
    self.get(table).iter().any(|i| i == id)
  }
}
