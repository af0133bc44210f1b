//! Transactional key/value access over SQLite
//!
//! [`Database`] exposes one set of operations per object store
//! (`chapter_contents`, `memories`, `full_text_indexes`). Multi-key reads and
//! writes run inside a single SQLite transaction. Caching lives above this
//! layer; every call here is a round trip to the connection thread.

use crate::error::{Error, Result};
use crate::migration::MigrationManager;
use crate::schema::{self, CHAPTER_CONTENTS, FULL_TEXT_INDEXES, MEMORIES};

use chrono::{DateTime, Utc};
use folio_core::{Memory, StoreConfig};
use rusqlite::{OptionalExtension, Row, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_rusqlite::Connection;
use tracing::instrument;

/// Persisted chapter paragraphs; `content` is the canonical JSON string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterContentRecord {
    pub chapter_id: String,
    pub content: String,
    pub last_modified: DateTime<Utc>,
}

/// Persisted full-text index documents for one book
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FullTextIndexRecord {
    pub book_id: String,
    pub index_data: String,
    pub last_updated: DateTime<Utc>,
}

/// Counts of store round trips, for observing cache effectiveness
#[derive(Debug, Default)]
pub struct OpCounters {
    content_reads: AtomicUsize,
    content_writes: AtomicUsize,
    content_deletes: AtomicUsize,
    memory_key_reads: AtomicUsize,
    memory_index_reads: AtomicUsize,
    memory_writes: AtomicUsize,
    index_reads: AtomicUsize,
    index_writes: AtomicUsize,
}

impl OpCounters {
    fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    /// Chapter content records read (one per key)
    pub fn content_reads(&self) -> usize {
        self.content_reads.load(Ordering::Relaxed)
    }

    /// Chapter content records written
    pub fn content_writes(&self) -> usize {
        self.content_writes.load(Ordering::Relaxed)
    }

    /// Chapter content delete calls
    pub fn content_deletes(&self) -> usize {
        self.content_deletes.load(Ordering::Relaxed)
    }

    /// Memory lookups by primary key
    pub fn memory_key_reads(&self) -> usize {
        self.memory_key_reads.load(Ordering::Relaxed)
    }

    /// Memory reads through the `by-bookId` index
    pub fn memory_index_reads(&self) -> usize {
        self.memory_index_reads.load(Ordering::Relaxed)
    }

    /// Memory inserts, updates, deletes and access-time touches
    pub fn memory_writes(&self) -> usize {
        self.memory_writes.load(Ordering::Relaxed)
    }

    pub fn index_reads(&self) -> usize {
        self.index_reads.load(Ordering::Relaxed)
    }

    pub fn index_writes(&self) -> usize {
        self.index_writes.load(Ordering::Relaxed)
    }
}

/// A handle to the SQLite-backed object stores
#[derive(Clone)]
pub struct Database {
    conn: Arc<Connection>,
    counters: Arc<OpCounters>,
}

impl Database {
    /// Open or create a database at the given path and migrate it
    #[instrument(skip_all, fields(db_path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_config(&StoreConfig { path: db_path.to_path_buf(), ..StoreConfig::default() }).await
    }

    /// Open the database described by `[store]`
    pub async fn open_with_config(config: &StoreConfig) -> Result<Self> {
        tracing::info!("Opening database at {}", config.path.display());

        let conn = Connection::open(&config.path)
            .await
            .map_err(|e| Error::database(format!("Failed to open database: {e}")))?;

        Self::init(conn, Duration::from_millis(config.busy_timeout_ms), schema::SCHEMA_VERSION).await
    }

    /// Open a private in-memory database
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| Error::database(format!("Failed to open database: {e}")))?;

        Self::init(conn, Duration::from_secs(5), schema::SCHEMA_VERSION).await
    }

    /// Open a database migrated only up to `version`
    ///
    /// Lets callers run against a schema that predates some object stores.
    pub async fn open_at_version(db_path: &Path, version: i32) -> Result<Self> {
        let conn = Connection::open(db_path)
            .await
            .map_err(|e| Error::database(format!("Failed to open database: {e}")))?;

        Self::init(conn, Duration::from_secs(5), version).await
    }

    async fn init(conn: Connection, busy_timeout: Duration, version: i32) -> Result<Self> {
        conn.call(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            tracing::debug!("Running migrations");
            MigrationManager::migrate_to(conn, version)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(e.to_string().into()))?;
            tracing::trace!("Migrations complete");
            Ok::<(), rusqlite::Error>(())
        })
        .await
        .map_err(|e| Error::database(format!("Migration failed: {e}")))?;

        tracing::info!("Database opened successfully");
        Ok(Self { conn: Arc::new(conn), counters: Arc::new(OpCounters::default()) })
    }

    /// Store round-trip counters
    pub fn counters(&self) -> &OpCounters {
        &self.counters
    }

    /// Read one chapter content record
    #[instrument(skip(self))]
    pub async fn get_chapter_content(&self, chapter_id: &str) -> Result<Option<ChapterContentRecord>> {
        OpCounters::bump(&self.counters.content_reads, 1);
        let chapter_id = chapter_id.to_owned();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT chapter_id, content, last_modified FROM chapter_contents WHERE chapter_id = ?1",
                )?;
                let record = stmt.query_row(params![&chapter_id], row_to_content).optional()?;
                Ok::<_, rusqlite::Error>(record)
            })
            .await
            .map_err(|e| Error::from(e).classify(CHAPTER_CONTENTS))
    }

    /// Read many chapter content records in one transaction
    ///
    /// The result is positionally aligned with `chapter_ids`.
    #[instrument(skip(self, chapter_ids), fields(count = chapter_ids.len()))]
    pub async fn get_chapter_contents(&self, chapter_ids: Vec<String>) -> Result<Vec<Option<ChapterContentRecord>>> {
        OpCounters::bump(&self.counters.content_reads, chapter_ids.len());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut records = Vec::with_capacity(chapter_ids.len());
                {
                    let mut stmt = tx.prepare_cached(
                        "SELECT chapter_id, content, last_modified FROM chapter_contents WHERE chapter_id = ?1",
                    )?;
                    for chapter_id in &chapter_ids {
                        records.push(stmt.query_row(params![chapter_id], row_to_content).optional()?);
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(records)
            })
            .await
            .map_err(|e| Error::from(e).classify(CHAPTER_CONTENTS))
    }

    /// Insert or replace a chapter content record
    #[instrument(skip(self, record), fields(chapter_id = %record.chapter_id, bytes = record.content.len()))]
    pub async fn put_chapter_content(&self, record: ChapterContentRecord) -> Result<()> {
        OpCounters::bump(&self.counters.content_writes, 1);

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r#"
                    INSERT INTO chapter_contents (chapter_id, content, last_modified)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT (chapter_id) DO UPDATE SET
                        content = excluded.content,
                        last_modified = excluded.last_modified
                    "#,
                )?;
                stmt.execute(params![&record.chapter_id, &record.content, record.last_modified.to_rfc3339()])?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| Error::from(e).classify(CHAPTER_CONTENTS))
    }

    /// Delete one chapter content record
    #[instrument(skip(self))]
    pub async fn delete_chapter_content(&self, chapter_id: &str) -> Result<bool> {
        self.delete_chapter_contents(vec![chapter_id.to_owned()])
            .await
            .map(|n| n > 0)
    }

    /// Delete many chapter content records in one transaction
    #[instrument(skip(self, chapter_ids), fields(count = chapter_ids.len()))]
    pub async fn delete_chapter_contents(&self, chapter_ids: Vec<String>) -> Result<usize> {
        OpCounters::bump(&self.counters.content_deletes, 1);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut deleted = 0;
                {
                    let mut stmt = tx.prepare_cached("DELETE FROM chapter_contents WHERE chapter_id = ?1")?;
                    for chapter_id in &chapter_ids {
                        deleted += stmt.execute(params![chapter_id])?;
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(deleted)
            })
            .await
            .map_err(|e| Error::from(e).classify(CHAPTER_CONTENTS))
    }

    /// Delete every chapter content record
    #[instrument(skip(self))]
    pub async fn clear_chapter_contents(&self) -> Result<usize> {
        OpCounters::bump(&self.counters.content_deletes, 1);

        self.conn
            .call(|conn| Ok::<_, rusqlite::Error>(conn.execute("DELETE FROM chapter_contents", [])?))
            .await
            .map_err(|e| Error::from(e).classify(CHAPTER_CONTENTS))
    }

    /// Read one memory by primary key
    #[instrument(skip(self))]
    pub async fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        OpCounters::bump(&self.counters.memory_key_reads, 1);
        let id = id.to_owned();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, book_id, content, summary, created_at, last_accessed_at FROM memories WHERE id = ?1",
                )?;
                let memory = stmt.query_row(params![&id], row_to_memory).optional()?;
                Ok::<_, rusqlite::Error>(memory)
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// Read memories by primary key in one transaction, skipping absent ids
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn get_memories_by_ids(&self, ids: Vec<String>) -> Result<Vec<Memory>> {
        OpCounters::bump(&self.counters.memory_key_reads, ids.len());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut memories = Vec::with_capacity(ids.len());
                {
                    let mut stmt = tx.prepare_cached(
                        "SELECT id, book_id, content, summary, created_at, last_accessed_at FROM memories WHERE id = ?1",
                    )?;
                    for id in &ids {
                        if let Some(memory) = stmt.query_row(params![id], row_to_memory).optional()? {
                            memories.push(memory);
                        }
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(memories)
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// Insert or replace a memory
    #[instrument(skip(self, memory), fields(id = %memory.id, book_id = %memory.book_id))]
    pub async fn put_memory(&self, memory: Memory) -> Result<()> {
        OpCounters::bump(&self.counters.memory_writes, 1);

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r#"
                    INSERT INTO memories (id, book_id, content, summary, created_at, last_accessed_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT (id) DO UPDATE SET
                        book_id = excluded.book_id,
                        content = excluded.content,
                        summary = excluded.summary,
                        created_at = excluded.created_at,
                        last_accessed_at = excluded.last_accessed_at
                    "#,
                )?;
                stmt.execute(params![
                    &memory.id,
                    &memory.book_id,
                    &memory.content,
                    &memory.summary,
                    memory.created_at,
                    memory.last_accessed_at
                ])?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// Delete one memory
    #[instrument(skip(self))]
    pub async fn delete_memory(&self, id: &str) -> Result<bool> {
        OpCounters::bump(&self.counters.memory_writes, 1);
        let id = id.to_owned();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached("DELETE FROM memories WHERE id = ?1")?;
                Ok::<_, rusqlite::Error>(stmt.execute(params![&id])? > 0)
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// Delete every memory of a book, returning the deleted ids
    #[instrument(skip(self))]
    pub async fn delete_memories_for_book(&self, book_id: &str) -> Result<Vec<String>> {
        OpCounters::bump(&self.counters.memory_writes, 1);
        let book_id = book_id.to_owned();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let ids = {
                    let mut stmt = tx.prepare_cached("SELECT id FROM memories WHERE book_id = ?1")?;
                    stmt.query_map(params![&book_id], |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                };
                tx.execute("DELETE FROM memories WHERE book_id = ?1", params![&book_id])?;
                tx.commit()?;
                Ok::<_, rusqlite::Error>(ids)
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// Count memories through the `by-bookId` index
    #[instrument(skip(self))]
    pub async fn count_memories(&self, book_id: &str) -> Result<usize> {
        let book_id = book_id.to_owned();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached("SELECT COUNT(*) FROM memories WHERE book_id = ?1")?;
                let count: i64 = stmt.query_row(params![&book_id], |row| row.get(0))?;
                Ok::<_, rusqlite::Error>(count as usize)
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// All memories of one book, read through the `by-bookId` index
    #[instrument(skip(self))]
    pub async fn get_memories_by_book(&self, book_id: &str) -> Result<Vec<Memory>> {
        OpCounters::bump(&self.counters.memory_index_reads, 1);
        let book_id = book_id.to_owned();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, book_id, content, summary, created_at, last_accessed_at FROM memories WHERE book_id = ?1",
                )?;
                let memories = stmt
                    .query_map(params![&book_id], row_to_memory)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok::<_, rusqlite::Error>(memories)
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// Memories of several books in one transaction
    #[instrument(skip(self, book_ids), fields(count = book_ids.len()))]
    pub async fn get_memories_by_books(&self, book_ids: Vec<String>) -> Result<HashMap<String, Vec<Memory>>> {
        OpCounters::bump(&self.counters.memory_index_reads, book_ids.len());

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut by_book = HashMap::with_capacity(book_ids.len());
                {
                    let mut stmt = tx.prepare_cached(
                        "SELECT id, book_id, content, summary, created_at, last_accessed_at FROM memories WHERE book_id = ?1",
                    )?;
                    for book_id in &book_ids {
                        let memories = stmt
                            .query_map(params![book_id], row_to_memory)?
                            .collect::<std::result::Result<Vec<_>, _>>()?;
                        by_book.insert(book_id.clone(), memories);
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(by_book)
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// Set `last_accessed_at` on many memories in one transaction
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn touch_memories(&self, ids: Vec<String>, accessed_at: i64) -> Result<usize> {
        OpCounters::bump(&self.counters.memory_writes, 1);

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut updated = 0;
                {
                    let mut stmt = tx.prepare_cached("UPDATE memories SET last_accessed_at = ?1 WHERE id = ?2")?;
                    for id in &ids {
                        updated += stmt.execute(params![accessed_at, id])?;
                    }
                }
                tx.commit()?;
                Ok::<_, rusqlite::Error>(updated)
            })
            .await
            .map_err(|e| Error::from(e).classify(MEMORIES))
    }

    /// Read the persisted index for a book
    #[instrument(skip(self))]
    pub async fn get_full_text_index(&self, book_id: &str) -> Result<Option<FullTextIndexRecord>> {
        OpCounters::bump(&self.counters.index_reads, 1);
        let book_id = book_id.to_owned();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT book_id, index_data, last_updated FROM full_text_indexes WHERE book_id = ?1",
                )?;
                let record = stmt
                    .query_row(params![&book_id], |row| {
                        let last_updated: String = row.get(2)?;
                        Ok(FullTextIndexRecord {
                            book_id: row.get(0)?,
                            index_data: row.get(1)?,
                            last_updated: parse_timestamp(&last_updated),
                        })
                    })
                    .optional()?;
                Ok::<_, rusqlite::Error>(record)
            })
            .await
            .map_err(|e| Error::from(e).classify(FULL_TEXT_INDEXES))
    }

    /// Insert or replace the persisted index for a book
    #[instrument(skip(self, record), fields(book_id = %record.book_id, bytes = record.index_data.len()))]
    pub async fn put_full_text_index(&self, record: FullTextIndexRecord) -> Result<()> {
        OpCounters::bump(&self.counters.index_writes, 1);

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    r#"
                    INSERT INTO full_text_indexes (book_id, index_data, last_updated)
                    VALUES (?1, ?2, ?3)
                    ON CONFLICT (book_id) DO UPDATE SET
                        index_data = excluded.index_data,
                        last_updated = excluded.last_updated
                    "#,
                )?;
                stmt.execute(params![&record.book_id, &record.index_data, record.last_updated.to_rfc3339()])?;
                Ok::<_, rusqlite::Error>(())
            })
            .await
            .map_err(|e| Error::from(e).classify(FULL_TEXT_INDEXES))
    }

    /// Delete the persisted index for a book
    #[instrument(skip(self))]
    pub async fn delete_full_text_index(&self, book_id: &str) -> Result<bool> {
        OpCounters::bump(&self.counters.index_writes, 1);
        let book_id = book_id.to_owned();

        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare_cached("DELETE FROM full_text_indexes WHERE book_id = ?1")?;
                Ok::<_, rusqlite::Error>(stmt.execute(params![&book_id])? > 0)
            })
            .await
            .map_err(|e| Error::from(e).classify(FULL_TEXT_INDEXES))
    }

    /// Delete every persisted index
    #[instrument(skip(self))]
    pub async fn clear_full_text_indexes(&self) -> Result<usize> {
        OpCounters::bump(&self.counters.index_writes, 1);

        self.conn
            .call(|conn| Ok::<_, rusqlite::Error>(conn.execute("DELETE FROM full_text_indexes", [])?))
            .await
            .map_err(|e| Error::from(e).classify(FULL_TEXT_INDEXES))
    }
}

fn row_to_content(row: &Row<'_>) -> rusqlite::Result<ChapterContentRecord> {
    let last_modified: String = row.get(2)?;
    Ok(ChapterContentRecord {
        chapter_id: row.get(0)?,
        content: row.get(1)?,
        last_modified: parse_timestamp(&last_modified),
    })
}

fn row_to_memory(row: &Row<'_>) -> rusqlite::Result<Memory> {
    Ok(Memory {
        id: row.get(0)?,
        book_id: row.get(1)?,
        content: row.get(2)?,
        summary: row.get(3)?,
        created_at: row.get(4)?,
        last_accessed_at: row.get(5)?,
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory(id: &str, book_id: &str, accessed: i64) -> Memory {
        Memory {
            id: id.to_string(),
            book_id: book_id.to_string(),
            content: format!("content of {id}"),
            summary: format!("summary of {id}"),
            created_at: accessed,
            last_accessed_at: accessed,
        }
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::open(&db_path).await;
        assert!(db.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_chapter_content_put_get_delete() {
        let db = Database::open_in_memory().await.unwrap();
        let record = ChapterContentRecord {
            chapter_id: "c1".to_string(),
            content: "[]".to_string(),
            last_modified: Utc::now(),
        };

        db.put_chapter_content(record.clone()).await.unwrap();
        let loaded = db.get_chapter_content("c1").await.unwrap().unwrap();
        assert_eq!(loaded.content, "[]");
        assert_eq!(loaded.last_modified.timestamp(), record.last_modified.timestamp());

        assert!(db.delete_chapter_content("c1").await.unwrap());
        assert!(!db.delete_chapter_content("c1").await.unwrap());
        assert!(db.get_chapter_content("c1").await.unwrap().is_none());
        assert_eq!(db.counters().content_writes(), 1);
    }

    #[tokio::test]
    async fn test_chapter_contents_batch_is_aligned() {
        let db = Database::open_in_memory().await.unwrap();
        for id in ["a", "c"] {
            db.put_chapter_content(ChapterContentRecord {
                chapter_id: id.to_string(),
                content: format!("[\"{id}\"]"),
                last_modified: Utc::now(),
            })
            .await
            .unwrap();
        }

        let records = db
            .get_chapter_contents(vec!["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].as_ref().unwrap().chapter_id, "a");
        assert!(records[1].is_none());
        assert_eq!(records[2].as_ref().unwrap().chapter_id, "c");
        assert_eq!(db.counters().content_reads(), 3);

        assert_eq!(db.clear_chapter_contents().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_memories_by_book_index() {
        let db = Database::open_in_memory().await.unwrap();
        db.put_memory(memory("m1", "b1", 1)).await.unwrap();
        db.put_memory(memory("m2", "b1", 2)).await.unwrap();
        db.put_memory(memory("m3", "b2", 3)).await.unwrap();

        assert_eq!(db.count_memories("b1").await.unwrap(), 2);
        assert_eq!(db.count_memories("missing").await.unwrap(), 0);

        let b1 = db.get_memories_by_book("b1").await.unwrap();
        assert_eq!(b1.len(), 2);
        assert!(b1.iter().all(|m| m.book_id == "b1"));
        assert_eq!(db.counters().memory_index_reads(), 1);

        let grouped = db
            .get_memories_by_books(vec!["b1".to_string(), "b2".to_string(), "b3".to_string()])
            .await
            .unwrap();
        assert_eq!(grouped["b1"].len(), 2);
        assert_eq!(grouped["b2"].len(), 1);
        assert!(grouped["b3"].is_empty());
    }

    #[tokio::test]
    async fn test_touch_memories() {
        let db = Database::open_in_memory().await.unwrap();
        db.put_memory(memory("m1", "b1", 1)).await.unwrap();
        db.put_memory(memory("m2", "b1", 1)).await.unwrap();

        let updated = db
            .touch_memories(vec!["m1".to_string(), "m2".to_string(), "gone".to_string()], 99)
            .await
            .unwrap();
        assert_eq!(updated, 2);
        assert_eq!(db.get_memory("m2").await.unwrap().unwrap().last_accessed_at, 99);
    }

    #[tokio::test]
    async fn test_delete_memories_for_book() {
        let db = Database::open_in_memory().await.unwrap();
        db.put_memory(memory("m1", "b1", 1)).await.unwrap();
        db.put_memory(memory("m2", "b2", 1)).await.unwrap();

        let deleted = db.delete_memories_for_book("b1").await.unwrap();
        assert_eq!(deleted, vec!["m1".to_string()]);
        assert!(db.get_memory("m1").await.unwrap().is_none());
        assert!(db.get_memory("m2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_text_index_round_trip() {
        let db = Database::open_in_memory().await.unwrap();
        let record =
            FullTextIndexRecord { book_id: "b1".to_string(), index_data: "[]".to_string(), last_updated: Utc::now() };
        db.put_full_text_index(record).await.unwrap();
        assert!(db.get_full_text_index("b1").await.unwrap().is_some());
        assert!(db.delete_full_text_index("b1").await.unwrap());
        assert!(db.get_full_text_index("b1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_object_store_is_not_migrated() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("old.db");
        let db = Database::open_at_version(&db_path, 1).await.unwrap();

        let err = db.get_full_text_index("b1").await.unwrap_err();
        assert!(matches!(err, Error::StoreNotMigrated(ref s) if s == FULL_TEXT_INDEXES));
    }
}
