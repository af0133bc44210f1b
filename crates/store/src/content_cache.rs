//! Lazy, LRU-cached access to chapter paragraphs
//!
//! Chapter content is persisted apart from chapter metadata as a canonical
//! JSON string. The cache keeps the parsed paragraphs next to that string so
//! "unchanged" checks compare snapshots taken at write time rather than a
//! value the caller may since have edited in place.

use crate::cache::{BoundedLru, CacheEntry, Fingerprint};
use crate::db::{ChapterContentRecord, Database};
use crate::error::{Error, Result};

use chrono::Utc;
use folio_core::{Chapter, ContentCacheConfig, Novel, Paragraph};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::instrument;

/// Change notifications published after successful content writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEvent {
    ChapterChanged(String),
    ChaptersRemoved(Vec<String>),
    AllCleared,
}

/// Options for [`ChapterContentCache::save_chapter_content`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// Skip the write when the canonical serialization matches what is stored
    pub skip_if_unchanged: bool,
}

impl SaveOptions {
    pub fn skip_if_unchanged() -> Self {
        Self { skip_if_unchanged: true }
    }
}

#[derive(Debug, Clone)]
enum CachedContent {
    Present(CacheEntry<Vec<Paragraph>>),
    /// The store has no (readable) record for this chapter
    Absent,
}

impl CachedContent {
    fn paragraphs(&self) -> Option<Vec<Paragraph>> {
        match self {
            CachedContent::Present(entry) => Some(entry.value.clone()),
            CachedContent::Absent => None,
        }
    }
}

/// Per-chapter content cache layered over the `chapter_contents` store
#[derive(Clone)]
pub struct ChapterContentCache {
    db: Database,
    cache: Arc<Mutex<BoundedLru<String, CachedContent>>>,
    events: broadcast::Sender<ContentEvent>,
    config: ContentCacheConfig,
}

impl ChapterContentCache {
    pub fn new(db: Database, config: ContentCacheConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { db, cache: Arc::new(Mutex::new(BoundedLru::new(config.capacity))), events, config }
    }

    /// Receive a [`ContentEvent`] for every write that reached the store
    pub fn subscribe(&self) -> broadcast::Receiver<ContentEvent> {
        self.events.subscribe()
    }

    fn cache(&self) -> MutexGuard<'_, BoundedLru<String, CachedContent>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached(&self, chapter_id: &str) -> Option<CachedContent> {
        self.cache().get(&chapter_id.to_owned()).cloned()
    }

    fn remember(&self, chapter_id: &str, content: CachedContent) {
        let evicted = self.cache().insert(chapter_id.to_owned(), content);
        if !evicted.is_empty() {
            tracing::trace!("Evicted {} chapters from content cache", evicted.len());
        }
    }

    fn publish(&self, event: ContentEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("No content event subscribers");
        }
    }

    /// Parse a persisted record, treating corrupt JSON as absent
    fn decode(record: Option<ChapterContentRecord>) -> CachedContent {
        let Some(record) = record else {
            return CachedContent::Absent;
        };

        match serde_json::from_str::<Vec<Paragraph>>(&record.content) {
            Ok(paragraphs) => CachedContent::Present(CacheEntry::new(
                paragraphs,
                Fingerprint::from_serialized(record.content),
            )),
            Err(e) => {
                tracing::warn!("Corrupt content for chapter {}: {}", record.chapter_id, e);
                CachedContent::Absent
            }
        }
    }

    /// Load a chapter's paragraphs, cache first
    ///
    /// A store miss is remembered, so repeated lookups of a chapter with no
    /// content do not go back to the store. Read failures degrade to `None`.
    #[instrument(skip(self))]
    pub async fn load_chapter_content(&self, chapter_id: &str) -> Option<Vec<Paragraph>> {
        if let Some(cached) = self.cached(chapter_id) {
            tracing::trace!("Content cache hit");
            return cached.paragraphs();
        }

        match self.db.get_chapter_content(chapter_id).await {
            Ok(record) => {
                let content = Self::decode(record);
                let paragraphs = content.paragraphs();
                self.remember(chapter_id, content);
                paragraphs
            }
            Err(e) => {
                tracing::warn!("Failed to load content for chapter {}: {}", chapter_id, e);
                None
            }
        }
    }

    /// Load many chapters, reading uncached ids in bounded chunks
    ///
    /// Each chunk is one store transaction. If a chunk fails, the remaining
    /// ids fall back to one-by-one loads.
    #[instrument(skip(self, chapter_ids), fields(count = chapter_ids.len()))]
    pub async fn load_chapter_contents_batch(&self, chapter_ids: &[String]) -> HashMap<String, Option<Vec<Paragraph>>> {
        let mut results = HashMap::with_capacity(chapter_ids.len());
        let mut uncached = Vec::new();
        let mut seen = HashSet::new();

        for chapter_id in chapter_ids {
            if !seen.insert(chapter_id.as_str()) {
                continue;
            }
            match self.cached(chapter_id) {
                Some(cached) => {
                    results.insert(chapter_id.clone(), cached.paragraphs());
                }
                None => uncached.push(chapter_id.clone()),
            }
        }

        tracing::debug!("{} cached, {} to read", results.len(), uncached.len());

        let chunk_size = self.config.batch_chunk_size.max(1);
        let mut pending = uncached.as_slice();

        while !pending.is_empty() {
            let (chunk, rest) = pending.split_at(chunk_size.min(pending.len()));

            match self.db.get_chapter_contents(chunk.to_vec()).await {
                Ok(records) => {
                    for (chapter_id, record) in chunk.iter().zip(records) {
                        let content = Self::decode(record);
                        results.insert(chapter_id.clone(), content.paragraphs());
                        self.remember(chapter_id, content);
                    }
                    pending = rest;
                }
                Err(e) => {
                    tracing::warn!("Batch content load failed, falling back to single loads: {}", e);
                    for chapter_id in pending {
                        let paragraphs = self.load_chapter_content(chapter_id).await;
                        results.insert(chapter_id.clone(), paragraphs);
                    }
                    break;
                }
            }
        }

        results
    }

    /// Persist a chapter's paragraphs
    ///
    /// Returns `true` iff a write reached the store. The content is serialized
    /// before any comparison; with `skip_if_unchanged` the write happens only
    /// when that snapshot differs from the cached or persisted one.
    #[instrument(skip(self, content, options), fields(paragraphs = content.len()))]
    pub async fn save_chapter_content(
        &self, chapter_id: &str, content: &[Paragraph], options: SaveOptions,
    ) -> Result<bool> {
        if chapter_id.trim().is_empty() {
            return Err(Error::validation("chapterId is required"));
        }

        let fingerprint = Fingerprint::of(content)?;

        if options.skip_if_unchanged && self.stored_fingerprint(chapter_id).await.as_ref() == Some(&fingerprint) {
            tracing::debug!("Content unchanged, skipping write");
            return Ok(false);
        }

        let record = ChapterContentRecord {
            chapter_id: chapter_id.to_owned(),
            content: fingerprint.as_str().to_owned(),
            last_modified: Utc::now(),
        };

        if let Err(e) = self.db.put_chapter_content(record).await {
            tracing::warn!("Failed to save content for chapter {}: {}", chapter_id, e);
            return Err(e);
        }

        self.remember(chapter_id, CachedContent::Present(CacheEntry::new(content.to_vec(), fingerprint)));
        self.publish(ContentEvent::ChapterChanged(chapter_id.to_owned()));

        tracing::debug!("Chapter content saved");
        Ok(true)
    }

    /// Fingerprint currently cached or persisted for a chapter, if any
    async fn stored_fingerprint(&self, chapter_id: &str) -> Option<Fingerprint> {
        if let Some(cached) = self.cached(chapter_id) {
            return match cached {
                CachedContent::Present(entry) => Some(entry.fingerprint),
                CachedContent::Absent => None,
            };
        }

        match self.db.get_chapter_content(chapter_id).await {
            Ok(record) => record.map(|r| Fingerprint::from_serialized(r.content)),
            Err(e) => {
                tracing::warn!("Could not read stored content for comparison: {}", e);
                None
            }
        }
    }

    /// Delete one chapter's persisted content and evict it
    #[instrument(skip(self))]
    pub async fn delete_chapter_content(&self, chapter_id: &str) -> Result<()> {
        self.bulk_delete_chapter_content(&[chapter_id.to_owned()]).await.map(|_| ())
    }

    /// Delete many chapters' persisted content in one transaction and evict them
    #[instrument(skip(self, chapter_ids), fields(count = chapter_ids.len()))]
    pub async fn bulk_delete_chapter_content(&self, chapter_ids: &[String]) -> Result<usize> {
        if chapter_ids.is_empty() {
            return Ok(0);
        }

        let deleted = self
            .db
            .delete_chapter_contents(chapter_ids.to_vec())
            .await
            .inspect_err(|e| tracing::warn!("Failed to delete chapter content: {}", e))?;

        {
            let mut cache = self.cache();
            for chapter_id in chapter_ids {
                cache.remove(chapter_id);
            }
        }

        self.publish(ContentEvent::ChaptersRemoved(chapter_ids.to_vec()));
        tracing::debug!("Deleted content for {} chapters", deleted);
        Ok(deleted)
    }

    /// Delete all persisted chapter content and empty the cache
    #[instrument(skip(self))]
    pub async fn clear_all_chapter_content(&self) -> Result<usize> {
        let deleted = self
            .db
            .clear_chapter_contents()
            .await
            .inspect_err(|e| tracing::warn!("Failed to clear chapter content: {}", e))?;

        self.cache().clear();
        self.publish(ContentEvent::AllCleared);
        tracing::info!("Cleared content for {} chapters", deleted);
        Ok(deleted)
    }

    /// Whether any content exists for the chapter
    pub async fn has_chapter_content(&self, chapter_id: &str) -> bool {
        self.load_chapter_content(chapter_id).await.is_some()
    }

    /// Load a chapter's paragraphs into it if they are not loaded yet
    ///
    /// A chapter with nothing persisted ends up loaded with no paragraphs.
    pub async fn ensure_chapter_content_loaded(&self, chapter: &mut Chapter) {
        if chapter.is_content_loaded() {
            return;
        }
        let content = self.load_chapter_content(&chapter.id).await.unwrap_or_default();
        chapter.set_content(content);
    }

    /// Load every unloaded chapter of a novel in one batch
    #[instrument(skip(self, novel), fields(book_id = %novel.id))]
    pub async fn ensure_novel_content_loaded(&self, novel: &mut Novel) {
        let missing: Vec<String> = novel
            .chapters()
            .filter(|c| !c.is_content_loaded())
            .map(|c| c.id.clone())
            .collect();

        if missing.is_empty() {
            return;
        }

        let mut loaded = self.load_chapter_contents_batch(&missing).await;
        for chapter in novel.chapters_mut().filter(|c| !c.is_content_loaded()) {
            let content = loaded.remove(&chapter.id).flatten().unwrap_or_default();
            chapter.set_content(content);
        }
    }

    /// Drop every cached chapter; the store is untouched
    pub fn clear_cache(&self) {
        self.cache().clear();
    }

    /// Number of cached chapters, including known-absent ones
    pub fn cached_len(&self) -> usize {
        self.cache().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::Volume;

    async fn setup() -> (Database, ChapterContentCache) {
        setup_with(ContentCacheConfig::default()).await
    }

    async fn setup_with(config: ContentCacheConfig) -> (Database, ChapterContentCache) {
        let db = Database::open_in_memory().await.unwrap();
        let cache = ChapterContentCache::new(db.clone(), config);
        (db, cache)
    }

    fn paragraphs(prefix: &str, n: usize) -> Vec<Paragraph> {
        (0..n)
            .map(|i| Paragraph::new(format!("{prefix}-p{i}"), format!("{prefix} text {i}")))
            .collect()
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let (_db, cache) = setup().await;
        let content = vec![Paragraph::new("p1", "原文").with_translation("t1", "translated")];

        assert!(cache.save_chapter_content("c1", &content, SaveOptions::default()).await.unwrap());

        cache.clear_cache();
        let loaded = cache.load_chapter_content("c1").await.unwrap();
        assert_eq!(
            serde_json::to_string(&loaded).unwrap(),
            serde_json::to_string(&content).unwrap()
        );
    }

    #[tokio::test]
    async fn test_skip_if_unchanged_writes_once() {
        let (db, cache) = setup().await;
        let content = paragraphs("c1", 3);

        assert!(cache.save_chapter_content("c1", &content, SaveOptions::skip_if_unchanged()).await.unwrap());
        assert!(!cache.save_chapter_content("c1", &content, SaveOptions::skip_if_unchanged()).await.unwrap());
        assert_eq!(db.counters().content_writes(), 1);
    }

    #[tokio::test]
    async fn test_skip_if_unchanged_compares_against_persisted() {
        let (db, cache) = setup().await;
        let content = paragraphs("c1", 2);
        cache.save_chapter_content("c1", &content, SaveOptions::default()).await.unwrap();

        cache.clear_cache();
        assert!(!cache.save_chapter_content("c1", &content, SaveOptions::skip_if_unchanged()).await.unwrap());
        assert_eq!(db.counters().content_writes(), 1);
    }

    #[tokio::test]
    async fn test_in_place_edit_is_detected() {
        let (db, cache) = setup().await;
        let mut content = paragraphs("c1", 2);
        cache.save_chapter_content("c1", &content, SaveOptions::skip_if_unchanged()).await.unwrap();

        content[0].text = "edited".to_string();
        assert!(cache.save_chapter_content("c1", &content, SaveOptions::skip_if_unchanged()).await.unwrap());
        assert_eq!(db.counters().content_writes(), 2);

        assert_eq!(cache.load_chapter_content("c1").await.unwrap()[0].text, "edited");
    }

    #[tokio::test]
    async fn test_without_skip_always_writes() {
        let (db, cache) = setup().await;
        let content = paragraphs("c1", 1);
        cache.save_chapter_content("c1", &content, SaveOptions::default()).await.unwrap();
        cache.save_chapter_content("c1", &content, SaveOptions::default()).await.unwrap();
        assert_eq!(db.counters().content_writes(), 2);
    }

    #[tokio::test]
    async fn test_missing_chapter_is_remembered() {
        let (db, cache) = setup().await;

        assert!(cache.load_chapter_content("nope").await.is_none());
        assert!(cache.load_chapter_content("nope").await.is_none());
        assert!(!cache.has_chapter_content("nope").await);
        assert_eq!(db.counters().content_reads(), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_store() {
        let (db, cache) = setup().await;
        cache.save_chapter_content("c1", &paragraphs("c1", 1), SaveOptions::default()).await.unwrap();

        assert!(cache.load_chapter_content("c1").await.is_some());
        assert!(cache.has_chapter_content("c1").await);
        assert_eq!(db.counters().content_reads(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_as_absent_and_is_overwritten() {
        let (db, cache) = setup().await;
        db.put_chapter_content(ChapterContentRecord {
            chapter_id: "c1".to_string(),
            content: "{not json".to_string(),
            last_modified: Utc::now(),
        })
        .await
        .unwrap();

        assert!(cache.load_chapter_content("c1").await.is_none());

        let content = paragraphs("c1", 1);
        assert!(cache.save_chapter_content("c1", &content, SaveOptions::skip_if_unchanged()).await.unwrap());
        cache.clear_cache();
        assert_eq!(cache.load_chapter_content("c1").await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_batch_load_chunks_and_caches() {
        let (db, cache) =
            setup_with(ContentCacheConfig { capacity: 100, batch_chunk_size: 2 }).await;

        for i in 0..4 {
            let id = format!("c{i}");
            cache.save_chapter_content(&id, &paragraphs(&id, 1), SaveOptions::default()).await.unwrap();
        }
        cache.clear_cache();

        let ids: Vec<String> = (0..5).map(|i| format!("c{i}")).collect();
        let results = cache.load_chapter_contents_batch(&ids).await;

        assert_eq!(results.len(), 5);
        assert!(results["c0"].is_some());
        assert!(results["c3"].is_some());
        assert!(results["c4"].is_none());
        assert_eq!(db.counters().content_reads(), 5);

        let again = cache.load_chapter_contents_batch(&ids).await;
        assert_eq!(again.len(), 5);
        assert_eq!(db.counters().content_reads(), 5);
    }

    #[tokio::test]
    async fn test_batch_load_deduplicates_ids() {
        let (db, cache) = setup().await;
        let ids = vec!["c1".to_string(), "c1".to_string()];
        let results = cache.load_chapter_contents_batch(&ids).await;
        assert_eq!(results.len(), 1);
        assert_eq!(db.counters().content_reads(), 1);
    }

    #[tokio::test]
    async fn test_delete_evicts_and_publishes() {
        let (_db, cache) = setup().await;
        let mut events = cache.subscribe();

        cache.save_chapter_content("c1", &paragraphs("c1", 1), SaveOptions::default()).await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ContentEvent::ChapterChanged("c1".to_string()));

        cache.delete_chapter_content("c1").await.unwrap();
        assert_eq!(events.recv().await.unwrap(), ContentEvent::ChaptersRemoved(vec!["c1".to_string()]));
        assert!(cache.load_chapter_content("c1").await.is_none());
    }

    #[tokio::test]
    async fn test_skipped_save_publishes_nothing() {
        let (_db, cache) = setup().await;
        let content = paragraphs("c1", 1);
        cache.save_chapter_content("c1", &content, SaveOptions::default()).await.unwrap();

        let mut events = cache.subscribe();
        cache.save_chapter_content("c1", &content, SaveOptions::skip_if_unchanged()).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_bulk_delete_and_clear() {
        let (_db, cache) = setup().await;
        for id in ["a", "b", "c"] {
            cache.save_chapter_content(id, &paragraphs(id, 1), SaveOptions::default()).await.unwrap();
        }

        let deleted = cache
            .bulk_delete_chapter_content(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 2);
        assert!(!cache.has_chapter_content("a").await);
        assert!(cache.has_chapter_content("c").await);

        let mut events = cache.subscribe();
        assert_eq!(cache.clear_all_chapter_content().await.unwrap(), 1);
        assert_eq!(events.recv().await.unwrap(), ContentEvent::AllCleared);
        assert!(!cache.has_chapter_content("c").await);
    }

    #[tokio::test]
    async fn test_rejects_empty_chapter_id() {
        let (_db, cache) = setup().await;
        let err = cache.save_chapter_content(" ", &[], SaveOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_capacity_eviction() {
        let (_db, cache) = setup_with(ContentCacheConfig { capacity: 5, batch_chunk_size: 50 }).await;
        for i in 0..6 {
            let id = format!("c{i}");
            cache.save_chapter_content(&id, &paragraphs(&id, 1), SaveOptions::default()).await.unwrap();
        }
        assert_eq!(cache.cached_len(), 5);
    }

    #[tokio::test]
    async fn test_ensure_novel_content_loaded() {
        let (_db, cache) = setup().await;
        cache.save_chapter_content("c1", &paragraphs("c1", 2), SaveOptions::default()).await.unwrap();

        let mut novel = Novel {
            id: "b1".to_string(),
            title: "Book".to_string(),
            volumes: vec![Volume {
                id: "v1".to_string(),
                title: String::new(),
                chapters: vec![Chapter::new("c1", "One"), Chapter::new("c2", "Two")],
            }],
        };

        cache.ensure_novel_content_loaded(&mut novel).await;
        let chapters = &novel.volumes[0].chapters;
        assert_eq!(chapters[0].content.as_ref().unwrap().len(), 2);
        assert!(chapters[1].is_content_loaded());
        assert!(chapters[1].content.as_ref().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ensure_chapter_content_loaded_keeps_loaded_content() {
        let (_db, cache) = setup().await;
        let mut chapter = Chapter::new("c1", "One");
        chapter.set_content(paragraphs("local", 1));

        cache.ensure_chapter_content_loaded(&mut chapter).await;
        assert_eq!(chapter.content.unwrap()[0].id, "local-p0");
    }

    #[tokio::test]
    async fn test_batch_failure_falls_back_to_single_loads() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open_at_version(&dir.path().join("empty.db"), 0).await.unwrap();
        let cache = ChapterContentCache::new(db.clone(), ContentCacheConfig::default());
        let ids: Vec<String> = ["c1", "c2", "c3"].iter().map(|s| s.to_string()).collect();

        let loaded = cache.load_chapter_contents_batch(&ids).await;

        assert_eq!(loaded.len(), 3);
        assert!(loaded.values().all(Option::is_none));
        assert_eq!(cache.cached_len(), 0);
        assert_eq!(db.counters().content_reads(), 6);
    }
}
