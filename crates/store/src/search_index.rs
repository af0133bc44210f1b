//! Fuzzy full-text search over a book's paragraphs
//!
//! An index is a flat list of [`IndexDocument`]s, one per paragraph, scored
//! with `nucleo-matcher` at query time. Indexes are built lazily, persisted in
//! the `full_text_indexes` store, and kept live for the most recently used
//! books. There is no incremental update: any content change drops the
//! book's index and the next search rebuilds it.
//!
//! Stored positions can go stale between rebuilds (chapters get reordered,
//! paragraphs inserted). Hits are therefore resolved against the live
//! [`Novel`] by position first, verified by id, and by id scan otherwise.

use crate::cache::BoundedLru;
use crate::content_cache::{ChapterContentCache, ContentEvent};
use crate::db::{Database, FullTextIndexRecord};
use crate::error::{Error, Result};

use chrono::Utc;
use folio_core::{ChapterTitle, Novel, Paragraph, SearchIndexConfig};
use nucleo_matcher::pattern::{AtomKind, CaseMatching, Normalization, Pattern};
use nucleo_matcher::{Config, Matcher, Utf32Str};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::instrument;

/// Flattened projection of one paragraph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub paragraph_id: String,
    pub chapter_id: String,
    pub volume_index: usize,
    pub chapter_index: usize,
    pub paragraph_index: usize,
    pub original_text: String,
    pub translations: Vec<String>,
    pub chapter_title_original: String,
    pub chapter_title_translation: String,
}

/// How several keywords combine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchMode {
    /// A paragraph matching any keyword is a hit
    #[default]
    Any,
    /// A paragraph must match every keyword
    All,
}

/// Filters and limits for [`SearchIndex::search`]
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Only return hits from this chapter
    pub chapter_id: Option<String>,
    pub only_with_translation: bool,
    /// Defaults to `default_max_results` from the config
    pub max_results: Option<usize>,
    pub search_in_original: bool,
    pub search_in_translations: bool,
    pub match_mode: MatchMode,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            chapter_id: None,
            only_with_translation: false,
            max_results: None,
            search_in_original: true,
            search_in_translations: true,
            match_mode: MatchMode::default(),
        }
    }
}

/// A hit resolved against the live novel
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub paragraph: Paragraph,
    pub chapter_id: String,
    pub chapter_title: ChapterTitle,
    pub volume_index: usize,
    pub chapter_index: usize,
    pub paragraph_index: usize,
    pub score: f64,
}

/// Resolves which book a chapter belongs to
///
/// Consulted for content changes to chapters the index has not seen yet.
pub trait BookCatalog: Send + Sync {
    fn book_for_chapter(&self, chapter_id: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy)]
struct IndexHit {
    doc: usize,
    score: f64,
}

/// Searchable documents of one book plus the field weights to score them with
#[derive(Debug)]
pub struct FuzzyIndex {
    documents: Vec<IndexDocument>,
    original_weight: f64,
    translation_weight: f64,
    title_weight: f64,
    min_score_per_char: u32,
}

impl FuzzyIndex {
    pub fn new(documents: Vec<IndexDocument>, config: &SearchIndexConfig) -> Self {
        Self {
            documents,
            original_weight: config.original_weight,
            translation_weight: config.translation_weight,
            title_weight: config.title_weight,
            min_score_per_char: config.min_score_per_char,
        }
    }

    pub fn documents(&self) -> &[IndexDocument] {
        &self.documents
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Score of `pattern` against `haystack`, if it clears the match threshold
    fn field_score(
        &self, pattern: &Pattern, threshold: u32, haystack: &str, matcher: &mut Matcher, buf: &mut Vec<char>,
    ) -> Option<f64> {
        if haystack.is_empty() {
            return None;
        }
        pattern
            .score(Utf32Str::new(haystack, buf), matcher)
            .filter(|score| *score >= threshold)
            .map(f64::from)
    }

    /// Weighted score of one keyword against one document
    ///
    /// Only the requested body fields can make a match. A matching title adds
    /// to the score of a body match but is never a hit on its own.
    fn keyword_score(
        &self, doc: &IndexDocument, pattern: &Pattern, threshold: u32, options: &SearchOptions,
        matcher: &mut Matcher, buf: &mut Vec<char>,
    ) -> Option<f64> {
        let mut body = None::<f64>;

        if options.search_in_original
            && let Some(score) = self.field_score(pattern, threshold, &doc.original_text, matcher, buf)
        {
            body = Some(score * self.original_weight);
        }

        if options.search_in_translations {
            for translation in &doc.translations {
                if let Some(score) = self.field_score(pattern, threshold, translation, matcher, buf) {
                    let weighted = score * self.translation_weight;
                    body = Some(body.map_or(weighted, |b| b.max(weighted)));
                }
            }
        }

        let body = body?;
        let title = [&doc.chapter_title_original, &doc.chapter_title_translation]
            .into_iter()
            .filter_map(|t| self.field_score(pattern, threshold, t, matcher, buf))
            .fold(0.0_f64, f64::max);

        Some(body + title * self.title_weight)
    }

    /// Matching documents, best first, one hit per paragraph id
    fn query(&self, keywords: &[String], options: &SearchOptions) -> Vec<IndexHit> {
        let patterns: Vec<(Pattern, u32)> = keywords
            .iter()
            .map(|k| {
                let pattern = Pattern::new(k, CaseMatching::Ignore, Normalization::Smart, AtomKind::Fuzzy);
                let threshold = self.min_score_per_char.saturating_mul(k.chars().count() as u32);
                (pattern, threshold)
            })
            .collect();

        let mut matcher = Matcher::new(Config::DEFAULT);
        let mut buf = Vec::new();
        let mut best: HashMap<&str, IndexHit> = HashMap::new();

        for (i, doc) in self.documents.iter().enumerate() {
            let scores: Vec<Option<f64>> = patterns
                .iter()
                .map(|(pattern, threshold)| self.keyword_score(doc, pattern, *threshold, options, &mut matcher, &mut buf))
                .collect();

            let matched = match options.match_mode {
                MatchMode::Any => scores.iter().any(Option::is_some),
                MatchMode::All => scores.iter().all(Option::is_some),
            };
            if !matched {
                continue;
            }

            let hit = IndexHit { doc: i, score: scores.into_iter().flatten().sum() };
            best.entry(doc.paragraph_id.as_str())
                .and_modify(|existing| {
                    if hit.score > existing.score {
                        *existing = hit;
                    }
                })
                .or_insert(hit);
        }

        let mut hits: Vec<IndexHit> = best.into_values().collect();
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.doc.cmp(&b.doc)));
        hits
    }
}

/// Flatten every loaded paragraph of a novel, in reading order
pub fn flatten_novel(novel: &Novel) -> Vec<IndexDocument> {
    let mut documents = Vec::new();

    for (volume_index, volume) in novel.volumes.iter().enumerate() {
        for (chapter_index, chapter) in volume.chapters.iter().enumerate() {
            let Some(paragraphs) = chapter.content.as_deref() else {
                continue;
            };
            for (paragraph_index, paragraph) in paragraphs.iter().enumerate() {
                documents.push(IndexDocument {
                    paragraph_id: paragraph.id.clone(),
                    chapter_id: chapter.id.clone(),
                    volume_index,
                    chapter_index,
                    paragraph_index,
                    original_text: paragraph.text.clone(),
                    translations: paragraph.translations.iter().map(|t| t.translation.clone()).collect(),
                    chapter_title_original: chapter.title.original.clone(),
                    chapter_title_translation: chapter.title.translation.clone(),
                });
            }
        }
    }

    documents
}

/// Live position of an indexed paragraph's chapter
///
/// The stored position wins when the chapter id there still matches.
fn resolve_chapter(novel: &Novel, doc: &IndexDocument) -> Option<(usize, usize)> {
    let at_stored = novel
        .volumes
        .get(doc.volume_index)
        .and_then(|v| v.chapters.get(doc.chapter_index))
        .is_some_and(|c| c.id == doc.chapter_id);

    if at_stored {
        Some((doc.volume_index, doc.chapter_index))
    } else {
        novel.find_chapter(&doc.chapter_id)
    }
}

fn resolve_paragraph(paragraphs: &[Paragraph], doc: &IndexDocument) -> Option<usize> {
    match paragraphs.get(doc.paragraph_index) {
        Some(p) if p.id == doc.paragraph_id => Some(doc.paragraph_index),
        _ => paragraphs.iter().position(|p| p.id == doc.paragraph_id),
    }
}

/// Per-book fuzzy indexes over chapter content
#[derive(Clone)]
pub struct SearchIndex {
    db: Database,
    content: ChapterContentCache,
    catalog: Option<Arc<dyn BookCatalog>>,
    live: Arc<Mutex<BoundedLru<String, Arc<FuzzyIndex>>>>,
    chapter_books: Arc<Mutex<HashMap<String, String>>>,
    rebuilds: Arc<AtomicUsize>,
    config: SearchIndexConfig,
}

impl SearchIndex {
    pub fn new(db: Database, content: ChapterContentCache, config: SearchIndexConfig) -> Self {
        Self {
            db,
            content,
            catalog: None,
            live: Arc::new(Mutex::new(BoundedLru::new(config.cache_capacity))),
            chapter_books: Arc::new(Mutex::new(HashMap::new())),
            rebuilds: Arc::new(AtomicUsize::new(0)),
            config,
        }
    }

    /// Use `catalog` to find the book of chapters no index has covered yet
    pub fn with_catalog(mut self, catalog: Arc<dyn BookCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    fn live(&self) -> MutexGuard<'_, BoundedLru<String, Arc<FuzzyIndex>>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn chapter_books(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.chapter_books.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of full index builds so far
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Whether a live index for the book is held in memory
    pub fn is_cached(&self, book_id: &str) -> bool {
        self.live().contains(&book_id.to_owned())
    }

    /// Map each chapter to `book_id`, replacing any earlier owner
    fn register_chapters<'a>(&self, book_id: &str, chapter_ids: impl IntoIterator<Item = &'a str>) {
        let mut map = self.chapter_books();
        for chapter_id in chapter_ids {
            map.insert(chapter_id.to_owned(), book_id.to_owned());
        }
    }

    /// Replace the book's chapter mapping with exactly the chapters of `novel`
    fn reset_chapters(&self, book_id: &str, novel: &Novel) {
        self.chapter_books().retain(|_, book| book != book_id);
        self.register_chapters(book_id, novel.chapters().map(|c| c.id.as_str()));
    }

    fn cache_index(&self, book_id: &str, index: Arc<FuzzyIndex>) {
        let evicted = self.live().insert(book_id.to_owned(), index);
        for (book, _) in evicted {
            tracing::debug!("Evicted live search index for book {}", book);
        }
    }

    /// Flatten, persist and cache a fresh index for the book
    ///
    /// Unloaded chapters are loaded into `novel` first. Persisting is best
    /// effort: the live index is usable even when the write fails.
    #[instrument(skip(self, novel))]
    pub async fn build_index(&self, book_id: &str, novel: &mut Novel) -> Result<usize> {
        Ok(self.build(book_id, novel).await?.len())
    }

    async fn build(&self, book_id: &str, novel: &mut Novel) -> Result<Arc<FuzzyIndex>> {
        if book_id.trim().is_empty() {
            return Err(Error::validation("bookId is required"));
        }

        self.content.ensure_novel_content_loaded(novel).await;
        let documents = flatten_novel(novel);
        self.reset_chapters(book_id, novel);

        let record = FullTextIndexRecord {
            book_id: book_id.to_owned(),
            index_data: serde_json::to_string(&documents)?,
            last_updated: Utc::now(),
        };
        match self.db.put_full_text_index(record).await {
            Ok(()) => {}
            Err(e) if e.is_store_not_migrated() => {
                tracing::debug!("Index store not migrated, keeping index for book {} in memory", book_id)
            }
            Err(e) => tracing::warn!("Failed to persist search index for book {}: {}", book_id, e),
        }

        let index = Arc::new(FuzzyIndex::new(documents, &self.config));
        self.cache_index(book_id, index.clone());
        self.rebuilds.fetch_add(1, Ordering::Relaxed);

        tracing::info!("Built search index for book {} ({} paragraphs)", book_id, index.len());
        Ok(index)
    }

    /// Live or persisted index for the book, without building
    async fn cached_or_persisted(&self, book_id: &str) -> Option<Arc<FuzzyIndex>> {
        if let Some(index) = self.live().get(&book_id.to_owned()) {
            return Some(index.clone());
        }

        let record = match self.db.get_full_text_index(book_id).await {
            Ok(record) => record?,
            Err(e) if e.is_store_not_migrated() => return None,
            Err(e) => {
                tracing::warn!("Failed to read persisted index for book {}: {}", book_id, e);
                return None;
            }
        };

        let documents: Vec<IndexDocument> = match serde_json::from_str(&record.index_data) {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!("Discarding corrupt persisted index for book {}: {}", book_id, e);
                return None;
            }
        };

        tracing::debug!("Loaded persisted index for book {} ({} paragraphs)", book_id, documents.len());
        self.register_chapters(book_id, documents.iter().map(|d| d.chapter_id.as_str()));
        let index = Arc::new(FuzzyIndex::new(documents, &self.config));
        self.cache_index(book_id, index.clone());
        Some(index)
    }

    /// The book's index from memory, else from the store, else freshly built
    ///
    /// Every chapter of `novel` is recorded as belonging to `book_id`, so a
    /// later write to a chapter that had no paragraphs still invalidates.
    #[instrument(skip(self, novel))]
    pub async fn load_index(&self, book_id: &str, novel: &mut Novel) -> Result<Arc<FuzzyIndex>> {
        match self.cached_or_persisted(book_id).await {
            Some(index) => {
                self.register_chapters(book_id, novel.chapters().map(|c| c.id.as_str()));
                Ok(index)
            }
            None => self.build(book_id, novel).await,
        }
    }

    /// Fuzzy search a book, resolving hits against the live `novel`
    ///
    /// Chapters a hit lands in are loaded into `novel` on demand, so the
    /// returned paragraphs mirror what the caller holds.
    #[instrument(skip(self, novel, keywords, options), fields(keywords = keywords.len()))]
    pub async fn search<S: AsRef<str>>(
        &self, book_id: &str, novel: &mut Novel, keywords: &[S], options: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if book_id.trim().is_empty() {
            return Err(Error::validation("bookId is required"));
        }

        let keywords: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim().to_owned())
            .filter(|k| !k.is_empty())
            .collect();
        if keywords.is_empty() || !(options.search_in_original || options.search_in_translations) {
            return Ok(Vec::new());
        }

        let index = self.load_index(book_id, novel).await?;
        let max_results = options.max_results.unwrap_or(self.config.default_max_results);
        let hits = index.query(&keywords, options);
        tracing::debug!("{} index hits for {:?}", hits.len(), keywords);

        let mut results = Vec::new();
        for hit in hits {
            if results.len() >= max_results {
                break;
            }

            let doc = &index.documents()[hit.doc];
            if options.chapter_id.as_deref().is_some_and(|id| id != doc.chapter_id) {
                continue;
            }

            let Some((vi, ci)) = resolve_chapter(novel, doc) else {
                tracing::trace!("Chapter {} no longer in book", doc.chapter_id);
                continue;
            };

            let Some(chapter) = novel.chapter_mut(vi, ci) else {
                continue;
            };
            if !chapter.is_content_loaded() {
                self.content.ensure_chapter_content_loaded(chapter).await;
            }

            let paragraphs = chapter.content.as_deref().unwrap_or_default();
            let Some(pi) = resolve_paragraph(paragraphs, doc) else {
                tracing::trace!("Paragraph {} no longer in chapter {}", doc.paragraph_id, doc.chapter_id);
                continue;
            };

            let paragraph = &paragraphs[pi];
            if options.only_with_translation && !paragraph.has_translation() {
                continue;
            }

            results.push(SearchResult {
                paragraph: paragraph.clone(),
                chapter_id: chapter.id.clone(),
                chapter_title: chapter.title.clone(),
                volume_index: vi,
                chapter_index: ci,
                paragraph_index: pi,
                score: hit.score,
            });
        }

        Ok(results)
    }

    /// Drop the live and persisted index; the next search rebuilds it
    #[instrument(skip(self))]
    pub async fn invalidate_index(&self, book_id: &str) -> Result<()> {
        self.live().remove(&book_id.to_owned());

        match self.db.delete_full_text_index(book_id).await {
            Ok(_) => {}
            Err(e) if e.is_store_not_migrated() => {}
            Err(e) => return Err(e),
        }

        tracing::debug!("Invalidated search index for book {}", book_id);
        Ok(())
    }

    /// Same as [`SearchIndex::invalidate_index`]
    pub async fn update_index_for_chapter(&self, book_id: &str, _chapter_id: &str) -> Result<()> {
        self.invalidate_index(book_id).await
    }

    /// Same as [`SearchIndex::invalidate_index`]
    pub async fn update_index_for_paragraph(&self, book_id: &str, _chapter_id: &str, _paragraph_id: &str) -> Result<()> {
        self.invalidate_index(book_id).await
    }

    /// Remove everything known about a book's index, e.g. when the book is deleted
    #[instrument(skip(self))]
    pub async fn clear_index(&self, book_id: &str) -> Result<()> {
        self.invalidate_index(book_id).await?;
        self.chapter_books().retain(|_, book| book != book_id);
        Ok(())
    }

    /// Drop every live index; persisted indexes are reloaded on demand
    pub fn clear_all_cache(&self) {
        self.live().clear();
    }

    fn book_for_chapter(&self, chapter_id: &str) -> Option<String> {
        if let Some(book) = self.chapter_books().get(chapter_id) {
            return Some(book.clone());
        }
        self.catalog.as_ref().and_then(|c| c.book_for_chapter(chapter_id))
    }

    async fn invalidate_everything(&self) -> Result<()> {
        self.live().clear();
        match self.db.clear_full_text_indexes().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_store_not_migrated() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Invalidate the index of every book touched by a content change
    ///
    /// Returns the number of books invalidated. Failures are logged, never
    /// returned: a stale index is tolerated until the next rebuild.
    #[instrument(skip(self))]
    pub async fn handle_content_event(&self, event: &ContentEvent) -> usize {
        let chapter_ids: Vec<&str> = match event {
            ContentEvent::ChapterChanged(id) => vec![id.as_str()],
            ContentEvent::ChaptersRemoved(ids) => ids.iter().map(String::as_str).collect(),
            ContentEvent::AllCleared => {
                let books = self.live().len();
                if let Err(e) = self.invalidate_everything().await {
                    tracing::warn!("Failed to clear search indexes: {}", e);
                }
                return books;
            }
        };

        let books: HashSet<String> = chapter_ids.into_iter().filter_map(|id| self.book_for_chapter(id)).collect();
        let mut invalidated = 0;
        for book_id in &books {
            match self.invalidate_index(book_id).await {
                Ok(()) => invalidated += 1,
                Err(e) => tracing::warn!("Failed to invalidate search index for book {}: {}", book_id, e),
            }
        }
        invalidated
    }

    /// Invalidate indexes in the background as content events arrive
    ///
    /// If the listener falls behind and misses events, every index is
    /// dropped. The task ends when the sending side is gone.
    pub fn spawn_invalidation_listener(&self, mut events: broadcast::Receiver<ContentEvent>) -> JoinHandle<()> {
        let index = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        index.handle_content_event(&event).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!("Search index listener missed {} content events, dropping all indexes", missed);
                        if let Err(e) = index.invalidate_everything().await {
                            tracing::warn!("Failed to clear search indexes: {}", e);
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!("Search index listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content_cache::SaveOptions;
    use folio_core::{Chapter, ContentCacheConfig, Volume};
    use tempfile::TempDir;

    struct Fixture {
        content: ChapterContentCache,
        index: SearchIndex,
    }

    async fn setup() -> Fixture {
        let db = Database::open_in_memory().await.unwrap();
        let content = ChapterContentCache::new(db.clone(), ContentCacheConfig::default());
        let index = SearchIndex::new(db, content.clone(), SearchIndexConfig::default());
        Fixture { content, index }
    }

    fn chapter(id: &str, title: &str) -> Chapter {
        Chapter::new(id, title)
    }

    /// Two chapters in one volume; content lives only in the store
    async fn seeded_novel(content: &ChapterContentCache) -> Novel {
        content
            .save_chapter_content(
                "c1",
                &[
                    Paragraph::new("p1", "The dragon sleeps"),
                    Paragraph::new("p2", "A quiet village wakes"),
                ],
                SaveOptions::default(),
            )
            .await
            .unwrap();
        content
            .save_chapter_content(
                "c2",
                &[
                    Paragraph::new("p3", "Alpha and beta walk together").with_translation("t3", "Alfa y beta caminan"),
                    Paragraph::new("p4", "Only alpha remains"),
                ],
                SaveOptions::default(),
            )
            .await
            .unwrap();

        Novel {
            id: "book".into(),
            title: "Book".into(),
            volumes: vec![Volume {
                id: "v1".into(),
                title: "Volume 1".into(),
                chapters: vec![chapter("c1", "Opening"), chapter("c2", "Journey")],
            }],
        }
    }

    fn unloaded(novel: &Novel) -> Novel {
        let mut copy = novel.clone();
        for chapter in copy.chapters_mut() {
            chapter.unload_content();
        }
        copy
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(|r| r.paragraph.id.as_str()).collect()
    }

    #[test]
    fn test_flatten_skips_unloaded_chapters() {
        let mut novel = Novel {
            id: "b".into(),
            title: "B".into(),
            volumes: vec![Volume { id: "v".into(), title: "V".into(), chapters: vec![chapter("c1", "T"), chapter("c2", "U")] }],
        };
        novel.volumes[0].chapters[1].set_content(vec![Paragraph::new("p1", "text").with_translation("t", "texto")]);

        let docs = flatten_novel(&novel);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].chapter_id, "c2");
        assert_eq!(docs[0].chapter_index, 1);
        assert_eq!(docs[0].translations, vec!["texto"]);
        assert_eq!(docs[0].chapter_title_original, "U");
    }

    #[test]
    fn test_index_document_uses_camel_case() {
        let doc = IndexDocument {
            paragraph_id: "p".into(),
            chapter_id: "c".into(),
            volume_index: 0,
            chapter_index: 1,
            paragraph_index: 2,
            original_text: "x".into(),
            translations: vec![],
            chapter_title_original: "t".into(),
            chapter_title_translation: String::new(),
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"paragraphId\""));
        assert!(json.contains("\"chapterTitleOriginal\""));
    }

    #[tokio::test]
    async fn test_search_finds_fuzzy_matches() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;

        let results = fx.index.search("book", &mut novel, &["dragon"], &SearchOptions::default()).await.unwrap();
        assert_eq!(ids(&results), vec!["p1"]);
        assert_eq!(results[0].chapter_title.original, "Opening");

        let results = fx.index.search("book", &mut novel, &["drgn"], &SearchOptions::default()).await.unwrap();
        assert_eq!(ids(&results), vec!["p1"]);

        let results = fx.index.search("book", &mut novel, &["zebra"], &SearchOptions::default()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_title_alone_is_not_a_hit() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;

        let results = fx.index.search("book", &mut novel, &["journey"], &SearchOptions::default()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_match_modes() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;

        let any = fx.index.search("book", &mut novel, &["alpha", "beta"], &SearchOptions::default()).await.unwrap();
        assert_eq!(any.len(), 2);
        assert_eq!(any[0].paragraph.id, "p3");

        let options = SearchOptions { match_mode: MatchMode::All, ..SearchOptions::default() };
        let all = fx.index.search("book", &mut novel, &["alpha", "beta"], &options).await.unwrap();
        assert_eq!(ids(&all), vec!["p3"]);
    }

    #[tokio::test]
    async fn test_field_restriction() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;

        let options = SearchOptions { search_in_original: false, ..SearchOptions::default() };
        let results = fx.index.search("book", &mut novel, &["caminan"], &options).await.unwrap();
        assert_eq!(ids(&results), vec!["p3"]);

        let results = fx.index.search("book", &mut novel, &["dragon"], &options).await.unwrap();
        assert!(results.is_empty());

        let options = SearchOptions { search_in_translations: false, ..SearchOptions::default() };
        let results = fx.index.search("book", &mut novel, &["caminan"], &options).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_filters_and_limit() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;

        let options = SearchOptions { only_with_translation: true, ..SearchOptions::default() };
        let results = fx.index.search("book", &mut novel, &["alpha"], &options).await.unwrap();
        assert_eq!(ids(&results), vec!["p3"]);

        let options = SearchOptions { chapter_id: Some("c1".into()), ..SearchOptions::default() };
        let results = fx.index.search("book", &mut novel, &["alpha", "dragon"], &options).await.unwrap();
        assert_eq!(ids(&results), vec!["p1"]);

        let options = SearchOptions { max_results: Some(1), ..SearchOptions::default() };
        let results = fx.index.search("book", &mut novel, &["alpha"], &options).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_positions_resolve_by_id() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;
        fx.index.build_index("book", &mut novel).await.unwrap();

        novel.volumes[0].chapters.swap(0, 1);
        if let Some(content) = novel.volumes[0].chapters[0].content.as_mut() {
            content.insert(0, Paragraph::new("p-new", "inserted first"));
        }

        let results = fx.index.search("book", &mut novel, &["dragon"], &SearchOptions::default()).await.unwrap();
        assert_eq!(ids(&results), vec!["p1"]);
        assert_eq!((results[0].chapter_index, results[0].paragraph_index), (1, 0));

        let results = fx.index.search("book", &mut novel, &["beta"], &SearchOptions::default()).await.unwrap();
        assert_eq!(ids(&results), vec!["p3"]);
        assert_eq!((results[0].chapter_index, results[0].paragraph_index), (0, 1));
        assert_eq!(fx.index.rebuild_count(), 1);
    }

    #[tokio::test]
    async fn test_search_loads_chapters_into_novel() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;
        fx.index.build_index("book", &mut novel).await.unwrap();

        let mut fresh = unloaded(&novel);
        let results = fx.index.search("book", &mut fresh, &["dragon"], &SearchOptions::default()).await.unwrap();

        assert_eq!(results.len(), 1);
        assert!(fresh.volumes[0].chapters[0].is_content_loaded());
        assert!(!fresh.volumes[0].chapters[1].is_content_loaded());
        assert_eq!(fresh.volumes[0].chapters[0].content.as_ref().unwrap()[0], results[0].paragraph);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;

        fx.index.search("book", &mut novel, &["dragon"], &SearchOptions::default()).await.unwrap();
        fx.index.search("book", &mut novel, &["dragon"], &SearchOptions::default()).await.unwrap();
        assert_eq!(fx.index.rebuild_count(), 1);

        fx.index.invalidate_index("book").await.unwrap();
        assert!(!fx.index.is_cached("book"));

        fx.index.search("book", &mut novel, &["dragon"], &SearchOptions::default()).await.unwrap();
        assert_eq!(fx.index.rebuild_count(), 2);
    }

    #[tokio::test]
    async fn test_persisted_index_is_reused() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;
        fx.index.build_index("book", &mut novel).await.unwrap();

        fx.index.clear_all_cache();
        let results = fx.index.search("book", &mut novel, &["village"], &SearchOptions::default()).await.unwrap();

        assert_eq!(ids(&results), vec!["p2"]);
        assert_eq!(fx.index.rebuild_count(), 1);
    }

    #[tokio::test]
    async fn test_content_events_invalidate_owning_book() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;
        fx.index.build_index("book", &mut novel).await.unwrap();

        let unknown = ContentEvent::ChapterChanged("elsewhere".into());
        assert_eq!(fx.index.handle_content_event(&unknown).await, 0);
        assert!(fx.index.is_cached("book"));

        let changed = ContentEvent::ChapterChanged("c2".into());
        assert_eq!(fx.index.handle_content_event(&changed).await, 1);
        assert!(!fx.index.is_cached("book"));

        fx.index.search("book", &mut novel, &["dragon"], &SearchOptions::default()).await.unwrap();
        assert_eq!(fx.index.rebuild_count(), 2);
    }

    struct OneBook;

    impl BookCatalog for OneBook {
        fn book_for_chapter(&self, _chapter_id: &str) -> Option<String> {
            Some("book".into())
        }
    }

    #[tokio::test]
    async fn test_catalog_resolves_unseen_chapters() {
        let fx = setup().await;
        let index = fx.index.clone().with_catalog(Arc::new(OneBook));
        let mut novel = seeded_novel(&fx.content).await;
        index.build_index("book", &mut novel).await.unwrap();

        let event = ContentEvent::ChaptersRemoved(vec!["c-new".into()]);
        assert_eq!(index.handle_content_event(&event).await, 1);
        assert!(!index.is_cached("book"));
    }

    #[tokio::test]
    async fn test_unmigrated_store_is_no_index() {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at_version(&dir.path().join("old.db"), 1).await.unwrap();
        let content = ChapterContentCache::new(db.clone(), ContentCacheConfig::default());
        let index = SearchIndex::new(db, content.clone(), SearchIndexConfig::default());
        let mut novel = seeded_novel(&content).await;

        let results = index.search("book", &mut novel, &["dragon"], &SearchOptions::default()).await.unwrap();
        assert_eq!(ids(&results), vec!["p1"]);

        index.invalidate_index("book").await.unwrap();
        index.clear_all_cache();
        index.search("book", &mut novel, &["dragon"], &SearchOptions::default()).await.unwrap();
        assert_eq!(index.rebuild_count(), 2);
    }

    #[tokio::test]
    async fn test_live_indexes_are_bounded() {
        let db = Database::open_in_memory().await.unwrap();
        let content = ChapterContentCache::new(db.clone(), ContentCacheConfig::default());
        let config = SearchIndexConfig { cache_capacity: 2, ..SearchIndexConfig::default() };
        let index = SearchIndex::new(db, content, config);

        for book in ["a", "b", "c"] {
            let mut novel = Novel { id: book.into(), title: book.into(), volumes: vec![] };
            index.build_index(book, &mut novel).await.unwrap();
        }

        assert!(!index.is_cached("a"));
        assert!(index.is_cached("b"));
        assert!(index.is_cached("c"));
    }

    #[tokio::test]
    async fn test_blank_keywords_return_nothing() {
        let fx = setup().await;
        let mut novel = seeded_novel(&fx.content).await;

        let results = fx.index.search("book", &mut novel, &["  "], &SearchOptions::default()).await.unwrap();
        assert!(results.is_empty());
        assert_eq!(fx.index.rebuild_count(), 0);
        assert!(matches!(
            fx.index.search("", &mut novel, &["x"], &SearchOptions::default()).await,
            Err(Error::Validation(_))
        ));
    }

    fn novel_of(id: &str, chapter_ids: &[&str]) -> Novel {
        Novel {
            id: id.into(),
            title: id.into(),
            volumes: vec![Volume {
                id: format!("{id}-v1"),
                title: "Volume 1".into(),
                chapters: chapter_ids.iter().map(|c| chapter(c, c)).collect(),
            }],
        }
    }

    #[tokio::test]
    async fn test_write_to_empty_chapter_invalidates() {
        let fx = setup().await;
        let lighthouse = [Paragraph::new("p1", "An old lighthouse")];
        fx.content.save_chapter_content("c1", &lighthouse, SaveOptions::default()).await.unwrap();

        let mut novel = novel_of("book", &["c1", "c2"]);
        assert_eq!(fx.index.build_index("book", &mut novel).await.unwrap(), 1);

        let windmill = [Paragraph::new("p2", "A windmill turns")];
        fx.content.save_chapter_content("c2", &windmill, SaveOptions::default()).await.unwrap();
        let event = ContentEvent::ChapterChanged("c2".into());
        assert_eq!(fx.index.handle_content_event(&event).await, 1);
        assert!(!fx.index.is_cached("book"));

        let mut novel = novel_of("book", &["c1", "c2"]);
        let results = fx.index.search("book", &mut novel, &["windmill"], &SearchOptions::default()).await.unwrap();
        assert_eq!(ids(&results), vec!["p2"]);
        assert_eq!(fx.index.rebuild_count(), 2);
    }

    #[tokio::test]
    async fn test_reloaded_index_tracks_empty_chapters() {
        let db = Database::open_in_memory().await.unwrap();
        let content = ChapterContentCache::new(db.clone(), ContentCacheConfig::default());
        let lighthouse = [Paragraph::new("p1", "An old lighthouse")];
        content.save_chapter_content("c1", &lighthouse, SaveOptions::default()).await.unwrap();

        let first = SearchIndex::new(db.clone(), content.clone(), SearchIndexConfig::default());
        first.build_index("book", &mut novel_of("book", &["c1", "c2"])).await.unwrap();

        let index = SearchIndex::new(db, content.clone(), SearchIndexConfig::default());
        let mut novel = novel_of("book", &["c1", "c2"]);
        let results = index.search("book", &mut novel, &["lighthouse"], &SearchOptions::default()).await.unwrap();
        assert_eq!(ids(&results), vec!["p1"]);
        assert_eq!(index.rebuild_count(), 0);

        let windmill = [Paragraph::new("p2", "A windmill turns")];
        content.save_chapter_content("c2", &windmill, SaveOptions::default()).await.unwrap();
        assert_eq!(index.handle_content_event(&ContentEvent::ChapterChanged("c2".into())).await, 1);

        let mut novel = novel_of("book", &["c1", "c2"]);
        let results = index.search("book", &mut novel, &["windmill"], &SearchOptions::default()).await.unwrap();
        assert_eq!(ids(&results), vec!["p2"]);
        assert_eq!(index.rebuild_count(), 1);
    }

    #[tokio::test]
    async fn test_chapter_moved_to_other_book_follows_it() {
        let fx = setup().await;
        fx.index.build_index("a", &mut novel_of("a", &["c1", "c2"])).await.unwrap();
        fx.index.build_index("b", &mut novel_of("b", &["c1"])).await.unwrap();

        let event = ContentEvent::ChapterChanged("c1".into());
        assert_eq!(fx.index.handle_content_event(&event).await, 1);
        assert!(fx.index.is_cached("a"));
        assert!(!fx.index.is_cached("b"));
    }

    #[tokio::test]
    async fn test_rebuild_forgets_removed_chapters() {
        let fx = setup().await;
        fx.index.build_index("a", &mut novel_of("a", &["c1", "c2"])).await.unwrap();

        fx.index.invalidate_index("a").await.unwrap();
        fx.index.build_index("a", &mut novel_of("a", &["c1"])).await.unwrap();

        let event = ContentEvent::ChaptersRemoved(vec!["c2".into()]);
        assert_eq!(fx.index.handle_content_event(&event).await, 0);
        assert!(fx.index.is_cached("a"));
    }
}
