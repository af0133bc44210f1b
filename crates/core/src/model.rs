//! Domain model for books, chapters, paragraphs and AI-authored memories.
//!
//! Paragraph arrays serialize to the canonical JSON persisted by the store
//! (camelCase field names, declaration order), so a value serialized here is
//! byte-for-byte comparable with the stored record.

use serde::{Deserialize, Serialize};

/// One candidate translation of a paragraph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Translation {
    pub id: String,
    pub translation: String,
    #[serde(default)]
    pub ai_model_id: String,
}

/// A paragraph of original text plus its translations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Paragraph {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub translations: Vec<Translation>,
    #[serde(default)]
    pub selected_translation_id: Option<String>,
}

impl Paragraph {
    /// Create a paragraph with no translations
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self { id: id.into(), text: text.into(), translations: Vec::new(), selected_translation_id: None }
    }

    /// Add a translation and select it
    pub fn with_translation(mut self, id: impl Into<String>, translation: impl Into<String>) -> Self {
        let id = id.into();
        self.translations
            .push(Translation { id: id.clone(), translation: translation.into(), ai_model_id: String::new() });
        self.selected_translation_id = Some(id);
        self
    }

    /// The selected translation text, falling back to the first translation
    pub fn selected_translation(&self) -> Option<&str> {
        let selected = self
            .selected_translation_id
            .as_deref()
            .and_then(|id| self.translations.iter().find(|t| t.id == id));

        selected
            .or_else(|| self.translations.first())
            .map(|t| t.translation.as_str())
    }

    /// Whether any non-blank translation exists
    pub fn has_translation(&self) -> bool {
        self.translations.iter().any(|t| !t.translation.trim().is_empty())
    }
}

/// Original and translated chapter title
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterTitle {
    pub original: String,
    #[serde(default)]
    pub translation: String,
}

/// A chapter. `content` is `None` while the paragraphs are unloaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    pub title: ChapterTitle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<Paragraph>>,
    #[serde(default)]
    pub content_loaded: bool,
}

impl Chapter {
    /// Create a chapter with unloaded content
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: ChapterTitle { original: title.into(), translation: String::new() },
            content: None,
            content_loaded: false,
        }
    }

    /// Install loaded paragraphs
    pub fn set_content(&mut self, content: Vec<Paragraph>) {
        self.content = Some(content);
        self.content_loaded = true;
    }

    /// Drop paragraphs from memory; they stay persisted
    pub fn unload_content(&mut self) {
        self.content = None;
        self.content_loaded = false;
    }

    pub fn is_content_loaded(&self) -> bool {
        self.content_loaded && self.content.is_some()
    }
}

/// A volume groups chapters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

/// A book: volumes of chapters of paragraphs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Novel {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub volumes: Vec<Volume>,
}

impl Novel {
    /// Position `(volume_index, chapter_index)` of a chapter by id
    pub fn find_chapter(&self, chapter_id: &str) -> Option<(usize, usize)> {
        self.volumes.iter().enumerate().find_map(|(vi, volume)| {
            volume
                .chapters
                .iter()
                .position(|c| c.id == chapter_id)
                .map(|ci| (vi, ci))
        })
    }

    pub fn contains_chapter(&self, chapter_id: &str) -> bool {
        self.find_chapter(chapter_id).is_some()
    }

    /// All chapter ids in reading order
    pub fn chapter_ids(&self) -> Vec<String> {
        self.chapters().map(|c| c.id.clone()).collect()
    }

    pub fn chapters(&self) -> impl Iterator<Item = &Chapter> {
        self.volumes.iter().flat_map(|v| v.chapters.iter())
    }

    pub fn chapters_mut(&mut self) -> impl Iterator<Item = &mut Chapter> {
        self.volumes.iter_mut().flat_map(|v| v.chapters.iter_mut())
    }

    pub fn chapter_mut(&mut self, volume_index: usize, chapter_index: usize) -> Option<&mut Chapter> {
        self.volumes
            .get_mut(volume_index)
            .and_then(|v| v.chapters.get_mut(chapter_index))
    }
}

/// An AI-authored context note scoped to one book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub id: String,
    pub book_id: String,
    pub content: String,
    pub summary: String,
    /// Unix epoch milliseconds
    pub created_at: i64,
    /// Unix epoch milliseconds
    pub last_accessed_at: i64,
}

/// Current time as Unix epoch milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
