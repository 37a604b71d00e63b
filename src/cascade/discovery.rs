//! Read-only discovery pass over a quest's dependency closure.

use futures::join;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::LifecycleError;
use crate::model::{RecordClosure, TableName};
use crate::remote::{column_values, row_key, row_str, RemoteQuery, RemoteStore, Row};

/// Progress slot shown to the user while discovery runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
  Quest,
  Project,
  QuestAssetLinks,
  Assets,
  AssetContentLinks,
  Votes,
  QuestTagLinks,
  AssetTagLinks,
  Tags,
  Languages,
}

impl Category {
  pub const ALL: [Category; 10] = [
    Category::Quest,
    Category::Project,
    Category::QuestAssetLinks,
    Category::Assets,
    Category::AssetContentLinks,
    Category::Votes,
    Category::QuestTagLinks,
    Category::AssetTagLinks,
    Category::Tags,
    Category::Languages,
  ];

  pub fn label(&self) -> &'static str {
    match self {
      Self::Quest => "Quest",
      Self::Project => "Project",
      Self::QuestAssetLinks => "Quest-asset links",
      Self::Assets => "Assets",
      Self::AssetContentLinks => "Content links",
      Self::Votes => "Votes",
      Self::QuestTagLinks => "Quest-tag links",
      Self::AssetTagLinks => "Asset-tag links",
      Self::Tags => "Tags",
      Self::Languages => "Languages",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryProgress {
  pub count: usize,
  pub is_loading: bool,
  pub has_error: bool,
}

impl CategoryProgress {
  fn loading() -> Self {
    Self {
      count: 0,
      is_loading: true,
      has_error: false,
    }
  }

  fn done(count: usize) -> Self {
    Self {
      count,
      is_loading: false,
      has_error: false,
    }
  }

  fn failed() -> Self {
    Self {
      count: 0,
      is_loading: false,
      has_error: true,
    }
  }
}

/// One counter and status per category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryProgress {
  slots: BTreeMap<Category, CategoryProgress>,
}

impl Default for DiscoveryProgress {
  fn default() -> Self {
    Self {
      slots: Category::ALL
        .into_iter()
        .map(|c| (c, CategoryProgress::loading()))
        .collect(),
    }
  }
}

impl DiscoveryProgress {
  pub fn get(&self, category: Category) -> CategoryProgress {
    self
      .slots
      .get(&category)
      .copied()
      .unwrap_or_else(CategoryProgress::loading)
  }

  pub fn total(&self) -> usize {
    self.slots.values().map(|s| s.count).sum()
  }

  pub fn has_error(&self) -> bool {
    self.slots.values().any(|s| s.has_error)
  }

  pub fn is_loading(&self) -> bool {
    self.slots.values().any(|s| s.is_loading)
  }

  fn set(&mut self, category: Category, progress: CategoryProgress) {
    self.slots.insert(category, progress);
  }
}

impl fmt::Display for DiscoveryProgress {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let parts: Vec<String> = self
      .slots
      .iter()
      .map(|(category, slot)| {
        let marker = if slot.has_error {
          " (error)"
        } else if slot.is_loading {
          "…"
        } else {
          ""
        };
        format!("{}: {}{}", category.label(), slot.count, marker)
      })
      .collect();
    f.write_str(&parts.join(", "))
  }
}

/// Result of a discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryOutcome {
  pub ids: RecordClosure,
  pub progress: DiscoveryProgress,
  pub has_error: bool,
  pub total: usize,
  /// False when the root quest itself could not be found
  pub should_proceed: bool,
}

/// Shared progress state for the concurrent queries of one pass.
struct Tracker<'a> {
  progress: Mutex<DiscoveryProgress>,
  on_progress: &'a (dyn Fn(&DiscoveryProgress) + Sync),
}

impl Tracker<'_> {
  fn update(&self, updates: &[(Category, CategoryProgress)]) {
    if let Ok(mut progress) = self.progress.lock() {
      for (category, slot) in updates {
        progress.set(*category, *slot);
      }
      (self.on_progress)(&progress);
    }
  }

  fn record<T>(&self, category: Category, result: &Result<Vec<T>, LifecycleError>) {
    match result {
      Ok(items) => self.update(&[(category, CategoryProgress::done(items.len()))]),
      Err(e) => {
        warn!(category = category.label(), error = %e, "Discovery query failed");
        self.update(&[(category, CategoryProgress::failed())]);
      }
    }
  }

  fn snapshot(&self) -> DiscoveryProgress {
    self
      .progress
      .lock()
      .map(|p| p.clone())
      .unwrap_or_default()
  }
}

async fn select(remote: &dyn RemoteStore, query: RemoteQuery) -> Result<Vec<Row>, LifecycleError> {
  remote.select(&query).await
}

/// `select` that short-circuits to an empty result for an empty id list.
async fn select_in(
  remote: &dyn RemoteStore,
  table: TableName,
  columns: &[&str],
  column: &str,
  ids: &[String],
) -> Result<Vec<Row>, LifecycleError> {
  if ids.is_empty() {
    return Ok(Vec::new());
  }
  select(
    remote,
    RemoteQuery::new(table).select(columns).in_list(column, ids).active(),
  )
  .await
}

fn keys(table: TableName, rows: &[Row]) -> Vec<String> {
  rows.iter().filter_map(|r| row_key(table, r)).collect()
}

fn dedup(values: impl IntoIterator<Item = String>) -> Vec<String> {
  let mut out: Vec<String> = Vec::new();
  for value in values {
    if !out.contains(&value) {
      out.push(value);
    }
  }
  out
}

/// Enumerate the closure of `quest_id` in three waves of parallel queries.
///
/// A failing category is recorded in the progress and the pass continues.
/// A missing root quest aborts after the first wave with nothing discovered.
pub async fn discover_quest(
  remote: &dyn RemoteStore,
  quest_id: &str,
  on_progress: &(dyn Fn(&DiscoveryProgress) + Sync),
) -> DiscoveryOutcome {
  info!(quest_id, "Starting discovery");
  let tracker = Tracker {
    progress: Mutex::new(DiscoveryProgress::default()),
    on_progress,
  };
  let mut ids = RecordClosure::new();

  // Wave 1: the quest and everything keyed by quest_id
  let (quest, quest_asset_links, quest_tag_links) = join!(
    async {
      select(
        remote,
        RemoteQuery::new(TableName::Quest)
          .select(&["id", "project_id"])
          .eq("id", quest_id)
          .active()
          .limit(1),
      )
      .await
      .and_then(|rows| {
        rows
          .into_iter()
          .next()
          .ok_or_else(|| LifecycleError::RootNotFound(quest_id.to_string()))
      })
    },
    select(
      remote,
      RemoteQuery::new(TableName::QuestAssetLink)
        .select(&["quest_id", "asset_id"])
        .eq("quest_id", quest_id)
        .active(),
    ),
    select(
      remote,
      RemoteQuery::new(TableName::QuestTagLink)
        .select(&["quest_id", "tag_id"])
        .eq("quest_id", quest_id)
        .active(),
    ),
  );

  let quest = match quest {
    Ok(row) => row,
    Err(e) => {
      warn!(quest_id, error = %e, "Root quest not found, aborting discovery");
      tracker.update(
        &Category::ALL
          .into_iter()
          .map(|c| {
            let slot = if matches!(c, Category::Quest | Category::Project) {
              CategoryProgress::failed()
            } else {
              CategoryProgress::done(0)
            };
            (c, slot)
          })
          .collect::<Vec<_>>(),
      );
      let progress = tracker.snapshot();
      return DiscoveryOutcome {
        ids: RecordClosure::new(),
        progress,
        has_error: true,
        total: 0,
        should_proceed: false,
      };
    }
  };

  let project_id = row_str(&quest, "project_id");
  ids.insert(TableName::Quest, quest_id);
  if let Some(project_id) = &project_id {
    ids.insert(TableName::Project, project_id.clone());
  }
  tracker.update(&[
    (Category::Quest, CategoryProgress::done(1)),
    (Category::Project, CategoryProgress::done(usize::from(project_id.is_some()))),
  ]);

  tracker.record(Category::QuestAssetLinks, &quest_asset_links);
  tracker.record(Category::QuestTagLinks, &quest_tag_links);
  let quest_asset_links = quest_asset_links.unwrap_or_default();
  let quest_tag_links = quest_tag_links.unwrap_or_default();
  ids.extend(TableName::QuestAssetLink, keys(TableName::QuestAssetLink, &quest_asset_links));
  ids.extend(TableName::QuestTagLink, keys(TableName::QuestTagLink, &quest_tag_links));

  let asset_ids = dedup(column_values(&quest_asset_links, "asset_id"));

  // Wave 2: everything keyed by asset_id
  let (assets, content_links, asset_tag_links) = join!(
    select_in(remote, TableName::Asset, &["id", "source_language_id"], "id", &asset_ids),
    select_in(
      remote,
      TableName::AssetContentLink,
      &["id", "asset_id", "source_language_id", "languoid_id"],
      "asset_id",
      &asset_ids,
    ),
    select_in(remote, TableName::AssetTagLink, &["asset_id", "tag_id"], "asset_id", &asset_ids),
  );

  tracker.record(Category::Assets, &assets);
  tracker.record(Category::AssetContentLinks, &content_links);
  tracker.record(Category::AssetTagLinks, &asset_tag_links);
  let assets = assets.unwrap_or_default();
  let content_links = content_links.unwrap_or_default();
  let asset_tag_links = asset_tag_links.unwrap_or_default();
  ids.extend(TableName::Asset, keys(TableName::Asset, &assets));
  ids.extend(TableName::AssetContentLink, keys(TableName::AssetContentLink, &content_links));
  ids.extend(TableName::AssetTagLink, keys(TableName::AssetTagLink, &asset_tag_links));

  // Languages referenced by the project, assets and content links
  let mut language_ids = Vec::new();
  if let Some(project_id) = &project_id {
    match select(
      remote,
      RemoteQuery::new(TableName::Project)
        .select(&["source_language_id", "target_language_id"])
        .eq("id", project_id.clone())
        .limit(1),
    )
    .await
    {
      Ok(rows) => {
        language_ids.extend(column_values(&rows, "source_language_id"));
        language_ids.extend(column_values(&rows, "target_language_id"));
      }
      Err(e) => warn!(error = %e, "Failed to read project languages"),
    }
  }
  language_ids.extend(column_values(&assets, "source_language_id"));
  language_ids.extend(column_values(&content_links, "source_language_id"));
  let language_ids = dedup(language_ids);
  ids.extend(TableName::Language, language_ids.iter().cloned());
  tracker.update(&[(Category::Languages, CategoryProgress::done(language_ids.len()))]);

  discover_languoids(remote, project_id.as_deref(), &content_links, &mut ids).await;

  // Wave 3: votes and the tags behind both kinds of tag link
  let tag_ids = dedup(
    column_values(&quest_tag_links, "tag_id")
      .into_iter()
      .chain(column_values(&asset_tag_links, "tag_id")),
  );
  let (votes, tags) = join!(
    select_in(remote, TableName::Vote, &["id"], "asset_id", &asset_ids),
    select_in(remote, TableName::Tag, &["id"], "id", &tag_ids),
  );
  tracker.record(Category::Votes, &votes);
  tracker.record(Category::Tags, &tags);
  ids.extend(TableName::Vote, keys(TableName::Vote, &votes.unwrap_or_default()));
  ids.extend(TableName::Tag, keys(TableName::Tag, &tags.unwrap_or_default()));

  let progress = tracker.snapshot();
  let total = progress.total();
  let has_error = progress.has_error();
  info!(quest_id, total, has_error, "Discovery finished");

  DiscoveryOutcome {
    ids,
    progress,
    has_error,
    total,
    should_proceed: total > 0,
  }
}

/// Languoid and region reference data. Failures here never fail the pass.
async fn discover_languoids(
  remote: &dyn RemoteStore,
  project_id: Option<&str>,
  content_links: &[Row],
  ids: &mut RecordClosure,
) {
  let mut languoid_ids = column_values(content_links, "languoid_id");
  if let Some(project_id) = project_id {
    match select(
      remote,
      RemoteQuery::new(TableName::ProjectLanguageLink)
        .select(&["languoid_id"])
        .eq("project_id", project_id)
        .not_null("languoid_id")
        .active(),
    )
    .await
    {
      Ok(rows) => languoid_ids.extend(column_values(&rows, "languoid_id")),
      Err(e) => warn!(error = %e, "Failed to read project language links"),
    }
  }
  let languoid_ids = dedup(languoid_ids);
  if languoid_ids.is_empty() {
    return;
  }
  ids.extend(TableName::Languoid, languoid_ids.iter().cloned());

  let (aliases, sources, properties, regions) = join!(
    select_in(remote, TableName::LanguoidAlias, &["id"], "subject_languoid_id", &languoid_ids),
    select_in(remote, TableName::LanguoidSource, &["id"], "languoid_id", &languoid_ids),
    select_in(remote, TableName::LanguoidProperty, &["id"], "languoid_id", &languoid_ids),
    select_in(remote, TableName::LanguoidRegion, &["id", "region_id"], "languoid_id", &languoid_ids),
  );

  for (table, result) in [
    (TableName::LanguoidAlias, &aliases),
    (TableName::LanguoidSource, &sources),
    (TableName::LanguoidProperty, &properties),
    (TableName::LanguoidRegion, &regions),
  ] {
    match result {
      Ok(rows) => ids.extend(table, keys(table, rows)),
      Err(e) => warn!(table = %table, error = %e, "Languoid discovery query failed"),
    }
  }

  let region_ids = dedup(column_values(regions.as_deref().unwrap_or_default(), "region_id"));
  if region_ids.is_empty() {
    debug!(languoids = languoid_ids.len(), "No regions linked to languoids");
    return;
  }
  ids.extend(TableName::Region, region_ids.iter().cloned());

  let (region_aliases, region_sources, region_properties) = join!(
    select_in(remote, TableName::RegionAlias, &["id"], "subject_region_id", &region_ids),
    select_in(remote, TableName::RegionSource, &["id"], "region_id", &region_ids),
    select_in(remote, TableName::RegionProperty, &["id"], "region_id", &region_ids),
  );

  for (table, result) in [
    (TableName::RegionAlias, region_aliases),
    (TableName::RegionSource, region_sources),
    (TableName::RegionProperty, region_properties),
  ] {
    match result {
      Ok(rows) => ids.extend(table, keys(table, &rows)),
      Err(e) => warn!(table = %table, error = %e, "Region discovery query failed"),
    }
  }

  debug!(
    languoids = languoid_ids.len(),
    regions = region_ids.len(),
    "Languoid subtree discovered"
  );
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::memory::MemoryRemoteStore;
  use crate::testing::{seed_remote_quest, seed_remote_tags_and_language, QUEST};
  use serde_json::json;
  use std::sync::Mutex as StdMutex;

  #[tokio::test]
  async fn test_discovers_full_closure() {
    let remote = MemoryRemoteStore::new();
    seed_remote_quest(&remote);

    let outcome = discover_quest(&remote, QUEST, &|_| {}).await;
    assert!(outcome.should_proceed);
    assert!(!outcome.has_error);
    assert_eq!(outcome.ids.get(TableName::Quest), ["q1"]);
    assert_eq!(outcome.ids.get(TableName::Project), ["proj1"]);
    assert_eq!(outcome.ids.count(TableName::QuestAssetLink), 3);
    assert!(outcome.ids.contains(TableName::QuestAssetLink, "q1|a2"));
    assert_eq!(outcome.ids.count(TableName::Asset), 3);
    assert_eq!(outcome.ids.count(TableName::AssetContentLink), 3);
    assert_eq!(outcome.ids.count(TableName::Vote), 6);
    assert_eq!(outcome.total, 17);
    assert_eq!(outcome.ids.total(), 17);
  }

  #[tokio::test]
  async fn test_progress_is_reported_incrementally() {
    let remote = MemoryRemoteStore::new();
    seed_remote_quest(&remote);
    seed_remote_tags_and_language(&remote);

    let seen = StdMutex::new(Vec::new());
    let outcome = discover_quest(&remote, QUEST, &|p: &DiscoveryProgress| {
      seen.lock().unwrap().push(p.clone());
    })
    .await;

    let seen = seen.into_inner().unwrap();
    assert!(seen.len() > 3);
    assert!(seen.first().unwrap().is_loading());
    assert!(!seen.last().unwrap().is_loading());
    assert_eq!(outcome.progress.get(Category::Tags).count, 1);
    assert_eq!(outcome.progress.get(Category::QuestTagLinks).count, 1);
    assert!(outcome.ids.contains(TableName::AssetTagLink, "a1|t1"));
    assert!(outcome.progress.to_string().contains("Votes: 6"));
  }

  #[tokio::test]
  async fn test_missing_root_is_fatal() {
    let remote = MemoryRemoteStore::new();
    seed_remote_quest(&remote);

    let outcome = discover_quest(&remote, "nope", &|_| {}).await;
    assert!(!outcome.should_proceed);
    assert!(outcome.has_error);
    assert_eq!(outcome.total, 0);
    assert!(outcome.ids.is_empty());
  }

  #[tokio::test]
  async fn test_category_failure_does_not_abort() {
    let remote = MemoryRemoteStore::new();
    seed_remote_quest(&remote);
    remote.fail_select(TableName::Vote);

    let outcome = discover_quest(&remote, QUEST, &|_| {}).await;
    assert!(outcome.has_error);
    assert!(outcome.should_proceed);
    assert!(outcome.progress.get(Category::Votes).has_error);
    assert_eq!(outcome.ids.count(TableName::Asset), 3);
    assert_eq!(outcome.ids.count(TableName::Vote), 0);
  }

  #[tokio::test]
  async fn test_languoid_subtree_is_collected() {
    let remote = MemoryRemoteStore::new();
    seed_remote_quest(&remote);
    remote.insert(
      TableName::ProjectLanguageLink,
      json!({ "project_id": "proj1", "languoid_id": "lg1" }),
    );
    remote.insert(TableName::LanguoidAlias, json!({ "id": "la1", "subject_languoid_id": "lg1" }));
    remote.insert(
      TableName::LanguoidRegion,
      json!({ "id": "lr1", "languoid_id": "lg1", "region_id": "r1" }),
    );
    remote.insert(TableName::RegionSource, json!({ "id": "rs1", "region_id": "r1" }));

    let outcome = discover_quest(&remote, QUEST, &|_| {}).await;
    assert_eq!(outcome.ids.get(TableName::Languoid), ["lg1"]);
    assert_eq!(outcome.ids.get(TableName::LanguoidAlias), ["la1"]);
    assert_eq!(outcome.ids.get(TableName::LanguoidRegion), ["lr1"]);
    assert_eq!(outcome.ids.get(TableName::Region), ["r1"]);
    assert_eq!(outcome.ids.get(TableName::RegionSource), ["rs1"]);
    // Reference data is tracked but not counted in a progress slot
    assert_eq!(outcome.total, 17);
  }
}
