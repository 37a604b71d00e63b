//! Stepwise schema for the local replica.
//!
//! Each step is applied once and bumps `PRAGMA user_version`.

/// Latest schema version understood by this build.
pub const SCHEMA_VERSION: i64 = 2;

/// v1: replicated content tables plus the attachment queue.
pub const SCHEMA_V1: &str = r#"
CREATE TABLE IF NOT EXISTS project (
    id TEXT PRIMARY KEY,
    name TEXT,
    source_language_id TEXT,
    target_language_id TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS quest (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    name TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS asset (
    id TEXT PRIMARY KEY,
    name TEXT,
    source_language_id TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS quest_asset_link (
    quest_id TEXT NOT NULL,
    asset_id TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (quest_id, asset_id)
);

CREATE INDEX IF NOT EXISTS idx_quest_asset_link_asset ON quest_asset_link(asset_id);

-- audio holds a JSON array of attachment ids
CREATE TABLE IF NOT EXISTS asset_content_link (
    id TEXT PRIMARY KEY,
    asset_id TEXT NOT NULL,
    text TEXT,
    audio TEXT,
    source_language_id TEXT,
    languoid_id TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_asset_content_link_asset ON asset_content_link(asset_id);

CREATE TABLE IF NOT EXISTS vote (
    id TEXT PRIMARY KEY,
    asset_id TEXT NOT NULL,
    polarity TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_vote_asset ON vote(asset_id);

CREATE TABLE IF NOT EXISTS tag (
    id TEXT PRIMARY KEY,
    key TEXT,
    value TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS quest_tag_link (
    quest_id TEXT NOT NULL,
    tag_id TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (quest_id, tag_id)
);

CREATE TABLE IF NOT EXISTS asset_tag_link (
    asset_id TEXT NOT NULL,
    tag_id TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (asset_id, tag_id)
);

CREATE TABLE IF NOT EXISTS language (
    id TEXT PRIMARY KEY,
    native_name TEXT,
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS attachments (
    id TEXT PRIMARY KEY,
    filename TEXT,
    local_uri TEXT,
    media_type TEXT,
    state INTEGER NOT NULL DEFAULT 0,
    timestamp INTEGER NOT NULL DEFAULT 0,
    size INTEGER
);
"#;

/// v2: queue of local writes that have not been uploaded yet.
pub const SCHEMA_V2: &str = r#"
CREATE TABLE IF NOT EXISTS crud_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    op TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_crud_queue_record ON crud_queue(table_name, record_id);
"#;

/// Migration steps in application order, paired with the version they produce.
pub const STEPS: [(i64, &str); 2] = [(1, SCHEMA_V1), (2, SCHEMA_V2)];
