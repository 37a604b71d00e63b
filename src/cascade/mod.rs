//! Cascading download and undownload of a quest's dependency closure.
//!
//! Discovery enumerates the closure from the remote store. The engine then
//! applies membership changes table by table in dependency order, with the
//! records of one table updated in parallel.

mod discovery;
mod engine;

pub use discovery::{discover_quest, Category, CategoryProgress, DiscoveryOutcome, DiscoveryProgress};
pub use engine::CascadeEngine;

use serde::Serialize;

use crate::error::LifecycleError;
use crate::model::TableName;

/// Children before parents, so a crash never leaves a parent marked wanted
/// while its children are not.
pub const DOWNLOAD_ORDER: [TableName; 19] = [
  TableName::RegionProperty,
  TableName::RegionSource,
  TableName::RegionAlias,
  TableName::LanguoidRegion,
  TableName::Region,
  TableName::LanguoidProperty,
  TableName::LanguoidSource,
  TableName::LanguoidAlias,
  TableName::Languoid,
  TableName::Language,
  TableName::Tag,
  TableName::Vote,
  TableName::AssetTagLink,
  TableName::QuestTagLink,
  TableName::AssetContentLink,
  TableName::Asset,
  TableName::QuestAssetLink,
  TableName::Project,
  TableName::Quest,
];

/// Strict reverse dependency order. Tags and languages are never released:
/// they are assumed shared with other quests.
pub const UNDOWNLOAD_ORDER: [TableName; 17] = [
  TableName::RegionProperty,
  TableName::RegionSource,
  TableName::RegionAlias,
  TableName::LanguoidRegion,
  TableName::Region,
  TableName::LanguoidProperty,
  TableName::LanguoidSource,
  TableName::LanguoidAlias,
  TableName::Languoid,
  TableName::Vote,
  TableName::AssetTagLink,
  TableName::QuestTagLink,
  TableName::AssetContentLink,
  TableName::Asset,
  TableName::QuestAssetLink,
  TableName::Project,
  TableName::Quest,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Download,
  Undownload,
}

/// Outcome of applying one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableUpdate {
  pub table_name: TableName,
  /// Records whose membership actually changed
  pub records_updated: usize,
  /// Records already in the target state
  pub records_unchanged: usize,
  /// Records left in their prior state
  #[serde(skip)]
  pub errors: Vec<LifecycleError>,
}

impl TableUpdate {
  pub fn new(table_name: TableName) -> Self {
    Self {
      table_name,
      records_updated: 0,
      records_unchanged: 0,
      errors: Vec::new(),
    }
  }

  pub fn records_failed(&self) -> usize {
    self.errors.len()
  }
}

/// Per-table results of one cascade, in application order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CascadeSummary {
  pub direction: Direction,
  pub tables: Vec<TableUpdate>,
}

impl CascadeSummary {
  pub fn table(&self, table: TableName) -> Option<&TableUpdate> {
    self.tables.iter().find(|t| t.table_name == table)
  }

  pub fn total_updated(&self) -> usize {
    self.tables.iter().map(|t| t.records_updated).sum()
  }

  pub fn total_failed(&self) -> usize {
    self.tables.iter().map(TableUpdate::records_failed).sum()
  }

  /// Every record reached its target state.
  pub fn is_complete(&self) -> bool {
    self.total_failed() == 0
  }

  pub fn errors(&self) -> impl Iterator<Item = &LifecycleError> {
    self.tables.iter().flat_map(|t| t.errors.iter())
  }
}
