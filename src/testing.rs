//! Fixtures shared by unit tests.

use serde_json::json;
use std::sync::Arc;

use crate::cache::{HybridResolver, MemoryStorage};
use crate::local::LocalStore;
use crate::model::TableName;
use crate::network::StaticReachability;
use crate::remote::memory::MemoryRemoteStore;

pub const PROFILE: &str = "p1";
pub const PROJECT: &str = "proj1";
pub const QUEST: &str = "q1";

/// Migrated in-memory replica.
pub fn local_store() -> LocalStore {
  let store = LocalStore::open_in_memory().unwrap();
  store.run_migrations().unwrap();
  store
}

pub fn resolver(online: bool) -> HybridResolver {
  HybridResolver::new(
    Arc::new(MemoryStorage::new()),
    Arc::new(StaticReachability::new(online)),
  )
}

/// Quest `q1` in project `proj1` with assets `a1..a3`.
///
/// Each asset has one content link `c{n}` and two votes `v{n}a`, `v{n}b`,
/// 17 rows in total.
pub fn seed_remote_quest(remote: &MemoryRemoteStore) {
  remote.insert(TableName::Project, json!({ "id": PROJECT, "name": "Project" }));
  remote.insert(TableName::Quest, json!({ "id": QUEST, "project_id": PROJECT }));
  for n in 1..=3 {
    let asset = format!("a{}", n);
    remote.insert(
      TableName::QuestAssetLink,
      json!({ "quest_id": QUEST, "asset_id": asset }),
    );
    remote.insert(
      TableName::Asset,
      json!({ "id": asset, "name": format!("Asset {}", n) }),
    );
    remote.insert(
      TableName::AssetContentLink,
      json!({ "id": format!("c{}", n), "asset_id": asset, "audio": [] }),
    );
    for side in ["a", "b"] {
      remote.insert(
        TableName::Vote,
        json!({ "id": format!("v{}{}", n, side), "asset_id": asset }),
      );
    }
  }
}

/// Tag `t1` on `q1` and `a1`, plus a source language on the project.
pub fn seed_remote_tags_and_language(remote: &MemoryRemoteStore) {
  remote.insert(TableName::Tag, json!({ "id": "t1", "key": "book", "value": "gen" }));
  remote.insert(TableName::QuestTagLink, json!({ "quest_id": QUEST, "tag_id": "t1" }));
  remote.insert(TableName::AssetTagLink, json!({ "asset_id": "a1", "tag_id": "t1" }));
  remote.insert(TableName::Language, json!({ "id": "en", "native_name": "English" }));
}

/// The local mirror of [`seed_remote_quest`] plus tags, a language and one
/// attachment per content link (`att-c{n}`, 100 bytes each).
pub fn seed_local_quest(local: &LocalStore) {
  local
    .with_conn(|conn| {
      conn.execute_batch(
        r#"
        INSERT INTO project (id, name, source_language_id) VALUES ('proj1', 'Project', 'en');
        INSERT INTO quest (id, project_id, name) VALUES ('q1', 'proj1', 'Quest');
        INSERT INTO language (id, native_name) VALUES ('en', 'English');
        INSERT INTO tag (id, key, value) VALUES ('t1', 'book', 'gen');
        INSERT INTO quest_tag_link (quest_id, tag_id) VALUES ('q1', 't1');
        INSERT INTO asset_tag_link (asset_id, tag_id) VALUES ('a1', 't1');
        "#,
      )?;
      for n in 1..=3 {
        conn.execute(
          "INSERT INTO asset (id, name) VALUES (?1, ?2)",
          (format!("a{}", n), format!("Asset {}", n)),
        )?;
        conn.execute(
          "INSERT INTO quest_asset_link (quest_id, asset_id) VALUES ('q1', ?1)",
          [format!("a{}", n)],
        )?;
        conn.execute(
          "INSERT INTO asset_content_link (id, asset_id, text, audio) VALUES (?1, ?2, 'hello', ?3)",
          (
            format!("c{}", n),
            format!("a{}", n),
            json!([format!("att-c{}", n)]).to_string(),
          ),
        )?;
        conn.execute(
          "INSERT INTO attachments (id, filename, local_uri, state, size) VALUES (?1, ?2, ?3, 3, 100)",
          (
            format!("att-c{}", n),
            format!("att-c{}.m4a", n),
            format!("file:///shared/att-c{}.m4a", n),
          ),
        )?;
        for side in ["a", "b"] {
          conn.execute(
            "INSERT INTO vote (id, asset_id) VALUES (?1, ?2)",
            (format!("v{}{}", n, side), format!("a{}", n)),
          )?;
        }
      }
      Ok(())
    })
    .unwrap();
}

/// Number of rows in a local table.
pub fn local_count(local: &LocalStore, table: &str) -> i64 {
  local
    .with_conn(|conn| {
      conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
    })
    .unwrap()
}
