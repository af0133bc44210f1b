//! Error types for the persistence layer

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite database error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// A record that must exist is absent
    #[error("Record not found: store={store}, key={key}")]
    NotFound { store: String, key: String },

    /// The object store has not been created by a migration yet
    #[error("Object store not migrated: {0}")]
    StoreNotMigrated(String),

    /// Stored payload could not be decoded
    #[error("Corrupt stored value: {0}")]
    Serialization(String),

    /// Missing or empty required field
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A memory id is already owned by another book
    #[error("Memory {id} belongs to book {actual_book}, not {expected_book}")]
    OwnershipMismatch { id: String, expected_book: String, actual_book: String },

    /// Could not find a free id within the retry budget
    #[error("Failed to generate a unique id after {attempts} attempts")]
    IdExhausted { attempts: usize },

    /// Database corruption or schema mismatch
    #[error("Database error: {0}")]
    Database(String),
}

impl Error {
    /// Create a database error with a message
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not found error
    pub fn not_found(store: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound { store: store.into(), key: key.into() }
    }

    /// Create an ownership mismatch error
    pub fn ownership_mismatch(
        id: impl Into<String>, expected_book: impl Into<String>, actual_book: impl Into<String>,
    ) -> Self {
        Self::OwnershipMismatch { id: id.into(), expected_book: expected_book.into(), actual_book: actual_book.into() }
    }

    /// True when the failure is a missing object store rather than a real fault
    pub fn is_store_not_migrated(&self) -> bool {
        match self {
            Self::StoreNotMigrated(_) => true,
            Self::Sqlite(e) => is_missing_table(e),
            Self::Connection(e) => e.to_string().contains("no such table"),
            _ => false,
        }
    }

    /// Reclassify "no such table" failures as [`Error::StoreNotMigrated`]
    pub(crate) fn classify(self, store: &str) -> Self {
        if self.is_store_not_migrated() { Self::StoreNotMigrated(store.to_string()) } else { self }
    }
}

fn is_missing_table(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.contains("no such table"),
        _ => false,
    }
}

impl From<folio_core::Error> for Error {
    fn from(err: folio_core::Error) -> Self {
        match err {
            folio_core::Error::Io(e) => Self::Io(e),
            folio_core::Error::Validation(msg) => Self::Validation(msg),
            other => Self::Database(other.to_string()),
        }
    }
}
