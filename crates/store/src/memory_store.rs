//! Bounded per-book memory store with keyword search
//!
//! Memories are short AI-authored context notes scoped to one book. Each book
//! holds at most `max_per_book` of them; creating one past the cap first
//! evicts the least recently accessed record of that book. Keyword searches
//! are cached for a short TTL and invalidated by any write to the book.
use crate::cache::{BoundedLru, CacheEntry, Fingerprint, TtlCache};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::schema::MEMORIES;

use folio_core::logging::truncate_for_log;
use folio_core::{Memory, MemoryConfig, now_millis};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::instrument;

/// What happened to a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryAction {
    Created,
    Updated,
    Deleted,
    /// Every memory of the book was removed
    Cleared,
}

/// Change notification for UI observers; carries no persistence guarantee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryChange {
    pub book_id: String,
    pub memory_id: Option<String>,
    pub action: MemoryAction,
}

/// Ordering for [`MemoryStore::get_recent_memories`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecentSort {
    #[default]
    CreatedAt,
    LastAccessedAt,
}

/// Timestamps supplied when importing a memory from another device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryTimestamps {
    pub created_at: Option<i64>,
    pub last_accessed_at: Option<i64>,
}

type MemoryKey = (String, String);
type SearchKey = (String, String);

/// A handle to the memory store
///
/// Cloning is cheap; clones share caches and the change channel.
#[derive(Clone)]
pub struct MemoryStore {
    db: Database,
    cache: Arc<Mutex<BoundedLru<MemoryKey, CacheEntry<Memory>>>>,
    search_cache: Arc<Mutex<TtlCache<SearchKey, Vec<String>>>>,
    events: broadcast::Sender<MemoryChange>,
    config: MemoryConfig,
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::validation(format!("{field} is required")));
    }
    Ok(())
}

fn memory_key(book_id: &str, id: &str) -> MemoryKey {
    (book_id.to_owned(), id.to_owned())
}

/// Trimmed, lower-cased, de-duplicated keywords in sorted order
fn normalize_keywords<S: AsRef<str>>(keywords: &[S]) -> Vec<String> {
    keywords
        .iter()
        .map(|k| k.as_ref().trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// AND semantics: every keyword must occur in the summary
fn summary_matches(summary: &str, keywords: &[String]) -> bool {
    let summary = summary.to_lowercase();
    keywords.iter().all(|k| summary.contains(k.as_str()))
}

fn sort_by_recent_access(memories: &mut [Memory]) {
    memories.sort_by(|a, b| b.last_accessed_at.cmp(&a.last_accessed_at).then_with(|| a.id.cmp(&b.id)));
}

impl MemoryStore {
    pub fn new(db: Database, config: MemoryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            db,
            cache: Arc::new(Mutex::new(BoundedLru::new(config.cache_capacity))),
            search_cache: Arc::new(Mutex::new(TtlCache::new(
                config.search_cache_capacity,
                config.search_cache_ttl(),
            ))),
            events,
            config,
        }
    }

    /// Receive a [`MemoryChange`] for every create, update and delete
    pub fn subscribe(&self) -> broadcast::Receiver<MemoryChange> {
        self.events.subscribe()
    }

    fn cache(&self) -> MutexGuard<'_, BoundedLru<MemoryKey, CacheEntry<Memory>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn search_cache(&self) -> MutexGuard<'_, TtlCache<SearchKey, Vec<String>>> {
        self.search_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remember(&self, memory: &Memory) -> Result<()> {
        let entry = CacheEntry::new(memory.clone(), Fingerprint::of(memory)?);
        self.cache().insert(memory_key(&memory.book_id, &memory.id), entry);
        Ok(())
    }

    fn forget(&self, book_id: &str, id: &str) {
        self.cache().remove(&memory_key(book_id, id));
    }

    /// Set the cached copy's access time, if cached, without reordering
    fn mark_cached_access(&self, book_id: &str, ids: &[String], accessed_at: i64) {
        let mut cache = self.cache();
        for id in ids {
            if let Some(entry) = cache.peek_mut(&memory_key(book_id, id)) {
                entry.value.last_accessed_at = accessed_at;
                if let Ok(fingerprint) = Fingerprint::of(&entry.value) {
                    entry.fingerprint = fingerprint;
                }
            }
        }
    }

    fn invalidate_search_cache(&self, book_id: &str) {
        let removed = self.search_cache().remove_where(|(book, _)| book == book_id);
        if removed > 0 {
            tracing::trace!("Dropped {} cached searches for book {}", removed, book_id);
        }
    }

    fn publish(&self, book_id: &str, memory_id: Option<&str>, action: MemoryAction) {
        let change = MemoryChange { book_id: book_id.to_owned(), memory_id: memory_id.map(str::to_owned), action };
        if self.events.send(change).is_err() {
            tracing::trace!("No memory change subscribers");
        }
    }

    /// Update access times in the background; failures are only logged
    fn schedule_touch(&self, ids: Vec<String>, accessed_at: i64) {
        if ids.is_empty() {
            return;
        }
        let db = self.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.touch_memories(ids, accessed_at).await {
                tracing::warn!("Failed to update memory access time: {}", e);
            }
        });
    }

    fn candidate_id(&self) -> String {
        let mut id = uuid::Uuid::new_v4().simple().to_string();
        id.truncate(self.config.id_length);
        id
    }

    /// Probe for a free id, retrying on the rare collision
    async fn generate_unique_id(&self) -> Result<String> {
        for attempt in 1..=self.config.id_retry_limit {
            let candidate = self.candidate_id();
            if self.db.get_memory(&candidate).await?.is_none() {
                return Ok(candidate);
            }
            tracing::debug!("Memory id collision on attempt {}", attempt);
        }
        Err(Error::IdExhausted { attempts: self.config.id_retry_limit })
    }

    /// Evict least recently accessed memories until one more fits
    async fn make_room(&self, book_id: &str) -> Result<()> {
        let count = match self.db.count_memories(book_id).await {
            Ok(count) => count,
            Err(e) => {
                tracing::warn!("Failed to count memories for book {}: {}", book_id, e);
                0
            }
        };

        if count < self.config.max_per_book {
            return Ok(());
        }

        let mut memories = self.db.get_memories_by_book(book_id).await?;
        memories.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });

        let excess = count + 1 - self.config.max_per_book;
        for victim in memories.iter().take(excess) {
            tracing::debug!(
                "Book {} at capacity, evicting memory {} (last accessed {})",
                book_id,
                victim.id,
                victim.last_accessed_at
            );
            self.db.delete_memory(&victim.id).await?;
            self.forget(book_id, &victim.id);
            self.publish(book_id, Some(&victim.id), MemoryAction::Deleted);
        }

        Ok(())
    }

    async fn insert_new(&self, memory: Memory) -> Result<Memory> {
        self.db.put_memory(memory.clone()).await?;
        self.remember(&memory)?;
        self.invalidate_search_cache(&memory.book_id);
        self.publish(&memory.book_id, Some(&memory.id), MemoryAction::Created);
        Ok(memory)
    }

    /// Create a memory with a generated id
    #[instrument(skip(self, content, summary))]
    pub async fn create_memory(&self, book_id: &str, content: &str, summary: &str) -> Result<Memory> {
        require("bookId", book_id)?;
        require("content", content)?;
        require("summary", summary)?;

        self.make_room(book_id).await?;
        let id = self.generate_unique_id().await?;
        let now = now_millis();

        tracing::debug!("Creating memory {}: {}", id, truncate_for_log(summary, 80));
        self.insert_new(Memory {
            id,
            book_id: book_id.to_owned(),
            content: content.to_owned(),
            summary: summary.to_owned(),
            created_at: now,
            last_accessed_at: now,
        })
        .await
    }

    /// Create or merge a memory under a caller-supplied id
    ///
    /// An existing record of the same book is updated in place, keeping the
    /// earliest `created_at` and the latest `last_accessed_at`. The id being
    /// owned by a different book is an error.
    #[instrument(skip(self, content, summary, timestamps))]
    pub async fn create_memory_with_id(
        &self, book_id: &str, id: &str, content: &str, summary: &str, timestamps: Option<MemoryTimestamps>,
    ) -> Result<Memory> {
        require("bookId", book_id)?;
        require("id", id)?;
        require("content", content)?;
        require("summary", summary)?;

        let now = now_millis();
        let timestamps = timestamps.unwrap_or_default();
        let created_at = timestamps.created_at.unwrap_or(now);
        let last_accessed_at = timestamps.last_accessed_at.unwrap_or(now);

        match self.db.get_memory(id).await? {
            Some(existing) if existing.book_id != book_id => {
                Err(Error::ownership_mismatch(id, book_id, existing.book_id))
            }
            Some(existing) => {
                let merged = Memory {
                    id: id.to_owned(),
                    book_id: book_id.to_owned(),
                    content: content.to_owned(),
                    summary: summary.to_owned(),
                    created_at: existing.created_at.min(created_at),
                    last_accessed_at: existing.last_accessed_at.max(last_accessed_at),
                };

                if Fingerprint::of(&merged)? == Fingerprint::of(&existing)? {
                    tracing::debug!("Imported memory {} is unchanged", id);
                    self.remember(&merged)?;
                    return Ok(merged);
                }

                self.db.put_memory(merged.clone()).await?;
                self.remember(&merged)?;
                self.invalidate_search_cache(book_id);
                self.publish(book_id, Some(id), MemoryAction::Updated);
                Ok(merged)
            }
            None => {
                self.make_room(book_id).await?;
                self.insert_new(Memory {
                    id: id.to_owned(),
                    book_id: book_id.to_owned(),
                    content: content.to_owned(),
                    summary: summary.to_owned(),
                    created_at,
                    last_accessed_at,
                })
                .await
            }
        }
    }

    /// Fetch one memory and mark it accessed
    ///
    /// A cache hit updates the persisted access time in the background; a
    /// miss updates it before returning.
    #[instrument(skip(self))]
    pub async fn get_memory(&self, book_id: &str, id: &str) -> Result<Option<Memory>> {
        require("bookId", book_id)?;
        require("id", id)?;

        let now = now_millis();
        let hit = {
            let mut cache = self.cache();
            cache.get_mut(&memory_key(book_id, id)).map(|entry| {
                entry.value.last_accessed_at = now;
                entry.value.clone()
            })
        };

        if let Some(memory) = hit {
            self.remember(&memory)?;
            self.schedule_touch(vec![id.to_owned()], now);
            return Ok(Some(memory));
        }

        let mut memory = match self.db.get_memory(id).await {
            Ok(Some(memory)) if memory.book_id == book_id => memory,
            Ok(_) => return Ok(None),
            Err(e) => {
                tracing::warn!("Failed to read memory {}: {}", id, e);
                return Ok(None);
            }
        };

        match self.db.touch_memories(vec![id.to_owned()], now).await {
            Ok(_) => memory.last_accessed_at = now,
            Err(e) => tracing::warn!("Failed to update access time for memory {}: {}", id, e),
        }

        self.remember(&memory)?;
        Ok(Some(memory))
    }

    /// Memories whose summary contains every keyword, most recently accessed first
    ///
    /// Matching is a case-insensitive substring test. Results are cached per
    /// book and keyword set; either way the access time of every match is
    /// refreshed in one background transaction.
    #[instrument(skip(self, keywords), fields(keywords = keywords.len()))]
    pub async fn search_memories_by_keywords<S: AsRef<str>>(&self, book_id: &str, keywords: &[S]) -> Result<Vec<Memory>> {
        require("bookId", book_id)?;

        let keywords = normalize_keywords(keywords);
        if keywords.is_empty() {
            return Ok(Vec::new());
        }

        let key: SearchKey = (book_id.to_owned(), keywords.join("\u{1f}"));
        let now = now_millis();
        let cached_ids = self.search_cache().get(&key).cloned();

        let memories = match cached_ids {
            Some(ids) => {
                tracing::debug!("Keyword search cache hit ({} ids)", ids.len());
                self.resolve_ids(book_id, &ids).await
            }
            None => {
                let all = match self.db.get_memories_by_book(book_id).await {
                    Ok(all) => all,
                    Err(e) => {
                        tracing::warn!("Keyword search failed for book {}: {}", book_id, e);
                        return Ok(Vec::new());
                    }
                };

                let mut matched: Vec<Memory> =
                    all.into_iter().filter(|m| summary_matches(&m.summary, &keywords)).collect();
                sort_by_recent_access(&mut matched);

                self.search_cache()
                    .insert(key, matched.iter().map(|m| m.id.clone()).collect());
                tracing::debug!("Keyword search matched {} memories", matched.len());
                matched
            }
        };

        let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
        self.mark_cached_access(book_id, &ids, now);
        self.schedule_touch(ids, now);

        Ok(memories
            .into_iter()
            .map(|mut m| {
                m.last_accessed_at = now;
                m
            })
            .collect())
    }

    /// Memories for cached ids, preferring the memory cache, in the given order
    async fn resolve_ids(&self, book_id: &str, ids: &[String]) -> Vec<Memory> {
        let mut found: HashMap<String, Memory> = HashMap::with_capacity(ids.len());
        let mut missing = Vec::new();

        {
            let cache = self.cache();
            for id in ids {
                match cache.peek(&memory_key(book_id, id)) {
                    Some(entry) => {
                        found.insert(id.clone(), entry.value.clone());
                    }
                    None => missing.push(id.clone()),
                }
            }
        }

        if !missing.is_empty() {
            match self.db.get_memories_by_ids(missing).await {
                Ok(memories) => {
                    for memory in memories.into_iter().filter(|m| m.book_id == book_id) {
                        found.insert(memory.id.clone(), memory);
                    }
                }
                Err(e) => tracing::warn!("Failed to resolve cached search results: {}", e),
            }
        }

        ids.iter().filter_map(|id| found.remove(id)).collect()
    }

    /// Load a memory that must exist and belong to `book_id`
    async fn load_owned(&self, book_id: &str, id: &str) -> Result<Memory> {
        match self.db.get_memory(id).await? {
            Some(memory) if memory.book_id == book_id => Ok(memory),
            Some(memory) => Err(Error::ownership_mismatch(id, book_id, memory.book_id)),
            None => Err(Error::not_found(MEMORIES, id)),
        }
    }

    /// Replace a memory's content and summary
    #[instrument(skip(self, content, summary))]
    pub async fn update_memory(&self, book_id: &str, id: &str, content: &str, summary: &str) -> Result<Memory> {
        require("bookId", book_id)?;
        require("id", id)?;
        require("content", content)?;
        require("summary", summary)?;

        let mut memory = self.load_owned(book_id, id).await?;
        memory.content = content.to_owned();
        memory.summary = summary.to_owned();
        memory.last_accessed_at = now_millis();

        self.db.put_memory(memory.clone()).await?;
        self.remember(&memory)?;
        self.invalidate_search_cache(book_id);
        self.publish(book_id, Some(id), MemoryAction::Updated);

        tracing::debug!("Memory updated");
        Ok(memory)
    }

    /// Delete a memory owned by `book_id`
    #[instrument(skip(self))]
    pub async fn delete_memory(&self, book_id: &str, id: &str) -> Result<()> {
        require("bookId", book_id)?;
        require("id", id)?;

        self.load_owned(book_id, id).await?;
        self.db.delete_memory(id).await?;
        self.forget(book_id, id);
        self.invalidate_search_cache(book_id);
        self.publish(book_id, Some(id), MemoryAction::Deleted);

        tracing::debug!("Memory deleted");
        Ok(())
    }

    /// Every memory of a book, oldest first
    #[instrument(skip(self))]
    pub async fn get_all_memories(&self, book_id: &str) -> Result<Vec<Memory>> {
        require("bookId", book_id)?;

        match self.db.get_memories_by_book(book_id).await {
            Ok(mut memories) => {
                memories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
                Ok(memories)
            }
            Err(e) => {
                tracing::warn!("Failed to load memories for book {}: {}", book_id, e);
                Ok(Vec::new())
            }
        }
    }

    /// Every memory of several books, read in one transaction
    #[instrument(skip(self, book_ids), fields(count = book_ids.len()))]
    pub async fn get_all_memories_for_books(&self, book_ids: &[String]) -> Result<HashMap<String, Vec<Memory>>> {
        for book_id in book_ids {
            require("bookId", book_id)?;
        }

        match self.db.get_memories_by_books(book_ids.to_vec()).await {
            Ok(mut by_book) => {
                for memories in by_book.values_mut() {
                    memories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
                }
                Ok(by_book)
            }
            Err(e) => {
                tracing::warn!("Failed to load memories for {} books: {}", book_ids.len(), e);
                Ok(book_ids.iter().map(|b| (b.clone(), Vec::new())).collect())
            }
        }
    }

    /// The `limit` newest memories by creation or access time
    ///
    /// With `update_access_time`, the returned memories are marked accessed
    /// in a single transaction before returning.
    #[instrument(skip(self))]
    pub async fn get_recent_memories(
        &self, book_id: &str, limit: usize, sort_by: RecentSort, update_access_time: bool,
    ) -> Result<Vec<Memory>> {
        let mut memories = self.get_all_memories(book_id).await?;

        match sort_by {
            RecentSort::CreatedAt => {
                memories.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)))
            }
            RecentSort::LastAccessedAt => sort_by_recent_access(&mut memories),
        }
        memories.truncate(limit);

        if update_access_time && !memories.is_empty() {
            let now = now_millis();
            let ids: Vec<String> = memories.iter().map(|m| m.id.clone()).collect();
            match self.db.touch_memories(ids.clone(), now).await {
                Ok(_) => {
                    self.mark_cached_access(book_id, &ids, now);
                    for memory in &mut memories {
                        memory.last_accessed_at = now;
                    }
                }
                Err(e) => tracing::warn!("Failed to update access times: {}", e),
            }
        }

        Ok(memories)
    }

    /// Number of memories stored for a book; 0 if the count cannot be read
    pub async fn get_memory_count(&self, book_id: &str) -> usize {
        self.db.count_memories(book_id).await.unwrap_or_else(|e| {
            tracing::warn!("Failed to count memories for book {}: {}", book_id, e);
            0
        })
    }

    /// Remove every memory of a book, e.g. when the book is deleted
    #[instrument(skip(self))]
    pub async fn delete_all_memories_for_book(&self, book_id: &str) -> Result<usize> {
        require("bookId", book_id)?;

        let deleted = self.db.delete_memories_for_book(book_id).await?;
        self.cache().remove_where(|(book, _)| book == book_id);
        self.invalidate_search_cache(book_id);
        self.publish(book_id, None, MemoryAction::Cleared);

        tracing::info!("Deleted {} memories for book {}", deleted.len(), book_id);
        Ok(deleted.len())
    }

    /// Drop cached memories and searches; the store is untouched
    pub fn clear_cache(&self) {
        self.cache().clear();
        self.search_cache().clear();
    }
}
