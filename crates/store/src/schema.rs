//! SQLite schema for the persistence layer
//!
//! One table per object store. Each schema version has its own SQL block,
//! applied in order by [`crate::migration::MigrationManager`].

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

/// Object store names, used in errors and logs
pub const CHAPTER_CONTENTS: &str = "chapter_contents";
pub const MEMORIES: &str = "memories";
pub const FULL_TEXT_INDEXES: &str = "full_text_indexes";

/// SQL to create the schema version table
pub const SCHEMA_VERSION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Version 1: chapter contents and memories
///
/// `idx_memories_book_id` is the `by-bookId` secondary index.
pub const V1_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS chapter_contents (
    chapter_id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    last_modified TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    book_id TEXT NOT NULL,
    content TEXT NOT NULL,
    summary TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_accessed_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_memories_book_id
ON memories(book_id);
"#;

/// Version 2: persisted full-text indexes, one row per book
pub const V2_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS full_text_indexes (
    book_id TEXT PRIMARY KEY,
    index_data TEXT NOT NULL,
    last_updated TEXT NOT NULL
);
"#;
