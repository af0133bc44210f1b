//! Schema migration logic
//!
//! Tracks applied migrations and applies pending ones up to a target version.

use crate::error::{Error, Result};
use crate::schema::{SCHEMA_VERSION, SCHEMA_VERSION_SQL, V1_SQL, V2_SQL};
use rusqlite::{Connection, params};
use tracing::{debug, info, trace};

/// Manages schema migrations
pub struct MigrationManager;

impl MigrationManager {
    /// Get the current schema version from the database
    ///
    /// Returns 0 if the schema_version table doesn't exist or is empty.
    pub fn get_current_version(conn: &Connection) -> Result<i32> {
        let table_exists: bool = conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
                [],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(format!("Failed to check schema_version table: {e}")))?;

        if !table_exists {
            trace!("schema_version table does not exist, returning version 0");
            return Ok(0);
        }

        let version: Option<i32> = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .map_err(|e| Error::database(format!("Failed to query schema version: {e}")))?;

        Ok(version.unwrap_or(0))
    }

    /// Apply pending migrations up to SCHEMA_VERSION
    ///
    /// This is idempotent - running it multiple times is safe.
    pub fn migrate(conn: &Connection) -> Result<()> {
        Self::migrate_to(conn, SCHEMA_VERSION)
    }

    /// Apply pending migrations up to `target`
    pub fn migrate_to(conn: &Connection, target: i32) -> Result<()> {
        let current_version = Self::get_current_version(conn)?;
        debug!("Current schema version: {}, target: {}", current_version, target);

        if current_version >= target {
            trace!("Schema is up to date, no migration needed");
            return Ok(());
        }

        info!("Migrating schema from version {} to {}", current_version, target);

        for version in (current_version + 1)..=target {
            match version {
                1 => Self::apply(conn, 1, V1_SQL)?,
                2 => Self::apply(conn, 2, V2_SQL)?,
                other => return Err(Error::database(format!("Unknown schema version {other}"))),
            }
        }

        info!("Schema migration complete");
        Ok(())
    }

    fn apply(conn: &Connection, version: i32, sql: &str) -> Result<()> {
        debug!("Applying v{} migration", version);

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(SCHEMA_VERSION_SQL)
            .and_then(|_| tx.execute_batch(sql))
            .and_then(|_| tx.execute("INSERT INTO schema_version (version) VALUES (?1)", params![version]))
            .map_err(|e| Error::database(format!("Failed to apply v{version} schema: {e}")))?;
        tx.commit()?;

        trace!("v{} migration applied successfully", version);
        Ok(())
    }
}
