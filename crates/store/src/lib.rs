//! Persistence caching and search for the folio translation workbench
//!
//! Three independent components share one SQLite-backed [`Database`]:
//!
//! - [`ChapterContentCache`]: lazy, LRU-cached chapter paragraphs with
//!   fingerprint-based "unchanged" detection
//! - [`MemoryStore`]: per-book memories capped at a fixed count, with cached
//!   keyword search
//! - [`SearchIndex`]: persisted fuzzy index per book, dropped whenever the
//!   book's content changes
//!
//! # Example
//!
//! ```ignore
//! use folio_core::Config;
//! use folio_store::{ChapterContentCache, Database, MemoryStore, SearchIndex, SearchOptions};
//!
//! let config = Config::from_file(&path)?;
//! let db = Database::open_with_config(&config.store).await?;
//!
//! let content = ChapterContentCache::new(db.clone(), config.content_cache.clone());
//! let index = SearchIndex::new(db.clone(), content.clone(), config.search_index.clone());
//! index.spawn_invalidation_listener(content.subscribe());
//!
//! let memories = MemoryStore::new(db, config.memory.clone());
//! memories.create_memory("book-1", "Hero is called Lin", "hero name lin").await?;
//!
//! let hits = index.search("book-1", &mut novel, &["dragon"], &SearchOptions::default()).await?;
//! ```

mod cache;
mod content_cache;
mod db;
mod error;
mod memory_store;
mod migration;
mod schema;
mod search_index;

pub use cache::{BoundedLru, CacheEntry, Fingerprint, TtlCache};
pub use content_cache::{ChapterContentCache, ContentEvent, SaveOptions};
pub use db::{ChapterContentRecord, Database, FullTextIndexRecord, OpCounters};
pub use error::{Error, Result};
pub use memory_store::{MemoryAction, MemoryChange, MemoryStore, MemoryTimestamps, RecentSort};
pub use migration::MigrationManager;
pub use schema::SCHEMA_VERSION;
pub use search_index::{
    BookCatalog, FuzzyIndex, IndexDocument, MatchMode, SearchIndex, SearchOptions, SearchResult, flatten_novel,
};
