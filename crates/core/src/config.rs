use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Database location and connection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// How long a writer waits on a locked database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("folio.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path(), busy_timeout_ms: default_busy_timeout_ms() }
    }
}

/// Chapter content cache sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentCacheConfig {
    /// Cached chapters before the oldest 20% are evicted
    #[serde(default = "default_content_capacity")]
    pub capacity: usize,

    /// Uncached ids read per transaction in a batch load
    #[serde(default = "default_batch_chunk_size")]
    pub batch_chunk_size: usize,
}

fn default_content_capacity() -> usize {
    100
}

fn default_batch_chunk_size() -> usize {
    50
}

impl Default for ContentCacheConfig {
    fn default() -> Self {
        Self { capacity: default_content_capacity(), batch_chunk_size: default_batch_chunk_size() }
    }
}

/// Per-book memory store limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Hard cap on memories per book; the least recently accessed is evicted
    #[serde(default = "default_max_per_book")]
    pub max_per_book: usize,

    /// Cached memory records across all books
    #[serde(default = "default_memory_cache_capacity")]
    pub cache_capacity: usize,

    /// Lifetime of a cached keyword search
    #[serde(default = "default_search_cache_ttl_secs")]
    pub search_cache_ttl_secs: u64,

    /// Cached keyword searches before the oldest is evicted
    #[serde(default = "default_search_cache_capacity")]
    pub search_cache_capacity: usize,

    /// Attempts at generating a free id before giving up
    #[serde(default = "default_id_retry_limit")]
    pub id_retry_limit: usize,

    /// Length of generated memory ids
    #[serde(default = "default_id_length")]
    pub id_length: usize,
}

fn default_max_per_book() -> usize {
    500
}

fn default_memory_cache_capacity() -> usize {
    1_000
}

fn default_search_cache_ttl_secs() -> u64 {
    120
}

fn default_search_cache_capacity() -> usize {
    100
}

fn default_id_retry_limit() -> usize {
    10
}

fn default_id_length() -> usize {
    8
}

impl MemoryConfig {
    pub fn search_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.search_cache_ttl_secs)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_per_book: default_max_per_book(),
            cache_capacity: default_memory_cache_capacity(),
            search_cache_ttl_secs: default_search_cache_ttl_secs(),
            search_cache_capacity: default_search_cache_capacity(),
            id_retry_limit: default_id_retry_limit(),
            id_length: default_id_length(),
        }
    }
}

/// Full-text index weighting and caching
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchIndexConfig {
    /// Live indexes kept in memory (one per book)
    #[serde(default = "default_index_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_original_weight")]
    pub original_weight: f64,

    #[serde(default = "default_translation_weight")]
    pub translation_weight: f64,

    #[serde(default = "default_title_weight")]
    pub title_weight: f64,

    /// Minimum fuzzy score per keyword character for a field to count as a match
    #[serde(default = "default_min_score_per_char")]
    pub min_score_per_char: u32,

    /// Result cap when the caller does not give one
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
}

fn default_index_cache_capacity() -> usize {
    10
}

fn default_original_weight() -> f64 {
    1.0
}

fn default_translation_weight() -> f64 {
    0.8
}

fn default_title_weight() -> f64 {
    0.3
}

fn default_min_score_per_char() -> u32 {
    12
}

fn default_max_results() -> usize {
    100
}

impl Default for SearchIndexConfig {
    fn default() -> Self {
        Self {
            cache_capacity: default_index_cache_capacity(),
            original_weight: default_original_weight(),
            translation_weight: default_translation_weight(),
            title_weight: default_title_weight(),
            min_score_per_char: default_min_score_per_char(),
            default_max_results: default_max_results(),
        }
    }
}

/// `[logging]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty`, `json` or `compact`
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default)]
    pub file: FileLoggingConfig,
}

fn default_log_level() -> String {
    "warn".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format(), file: FileLoggingConfig::default() }
    }
}

/// `[logging.file]` section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileLoggingConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_file_log_level")]
    pub level: String,
}

fn default_file_log_level() -> String {
    "debug".to_string()
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self { enabled: false, level: default_file_log_level() }
    }
}

/// Root configuration structure for folio.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub content_cache: ContentCacheConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub search_index: SearchIndexConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML string
    pub fn from_toml_str(toml_str: &str) -> Result<Self> {
        let config: Config = toml::from_str(toml_str).map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("content_cache.capacity", self.content_cache.capacity),
            ("content_cache.batch_chunk_size", self.content_cache.batch_chunk_size),
            ("memory.max_per_book", self.memory.max_per_book),
            ("memory.cache_capacity", self.memory.cache_capacity),
            ("memory.search_cache_capacity", self.memory.search_cache_capacity),
            ("memory.id_retry_limit", self.memory.id_retry_limit),
            ("memory.id_length", self.memory.id_length),
            ("search_index.cache_capacity", self.search_index.cache_capacity),
            ("search_index.default_max_results", self.search_index.default_max_results),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::MustBePositive(name.to_string()).into());
            }
        }

        if self.memory.search_cache_ttl_secs == 0 {
            return Err(ConfigError::MustBePositive("memory.search_cache_ttl_secs".to_string()).into());
        }

        if self.memory.id_length > 32 {
            return Err(ConfigError::OutOfRange("memory.id_length".to_string(), "at most 32".to_string()).into());
        }

        let weights = [
            ("search_index.original_weight", self.search_index.original_weight),
            ("search_index.translation_weight", self.search_index.translation_weight),
            ("search_index.title_weight", self.search_index.title_weight),
        ];

        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(ConfigError::OutOfRange(name.to_string(), "finite and non-negative".to_string()).into());
            }
        }

        Ok(())
    }

    /// Get example configuration (as a string)
    pub fn example() -> &'static str {
        r#"# Folio Configuration Example

[store]
# SQLite database file
path = "folio.db"
busy_timeout_ms = 5000

[content_cache]
# Chapters kept parsed in memory
capacity = 100
# Ids read per transaction when loading many chapters
batch_chunk_size = 50

[memory]
max_per_book = 500
cache_capacity = 1000
search_cache_ttl_secs = 120
search_cache_capacity = 100
id_retry_limit = 10
id_length = 8

[search_index]
cache_capacity = 10
original_weight = 1.0
translation_weight = 0.8
title_weight = 0.3
min_score_per_char = 12
default_max_results = 100

[logging]
level = "warn"
format = "pretty"

[logging.file]
enabled = false
level = "debug"
"#
    }
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err.to_string())
    }
}

/// Configuration-specific errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    MustBePositive(String),

    #[error("{0} out of range: {1}")]
    OutOfRange(String, String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlParse(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlParse(err.to_string())
    }
}
