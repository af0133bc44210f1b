pub mod config;
pub mod error;
pub mod logging;
pub mod model;

pub use config::{Config, ContentCacheConfig, MemoryConfig, SearchIndexConfig, StoreConfig};
pub use error::{Error, Result};
pub use model::{Chapter, ChapterTitle, Memory, Novel, Paragraph, Translation, Volume, now_millis};
