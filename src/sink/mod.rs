//! Persistent log sink.
//!
//! This module contains:
//! - `LogSink` trait: append-only log storage with a most-recent-first read
//! - `LogRecord` and `RecentLogs`: the stored record and a read result
//! - Sink configuration types and the `init_sink` factory
//! - Implementations: in-memory, SQLite, MongoDB

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongodb;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryLogSink;
#[cfg(feature = "mongodb")]
pub use self::mongodb::MongoLogSink;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLogSink;

/// Upper bound on records returned by a single `recent` call.
pub const MAX_RECENT: usize = 100;

/// Result type for sink operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during sink operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed record: {0}")]
    Malformed(String),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[cfg(feature = "mongodb")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] ::mongodb::error::Error),
}

/// A persisted log line. Insertion order is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub message: String,
}

impl LogRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The tail of the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecentLogs {
    /// Most recently appended first.
    pub records: Vec<LogRecord>,
    /// Records stored in total, not just the ones returned.
    pub total_count: u64,
}

/// Append-only log storage.
///
/// Implementations:
/// - `MemoryLogSink`: in-process, for standalone mode and tests
/// - `SqliteLogSink`: SQLite table with an autoincrement id
/// - `MongoLogSink`: MongoDB collection in natural order
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Append a record.
    async fn append(&self, record: LogRecord) -> Result<()>;

    /// Return up to `limit` records, newest first, plus the total count.
    ///
    /// `limit` is capped at [`MAX_RECENT`].
    async fn recent(&self, limit: usize) -> Result<RecentLogs>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Sink type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    #[default]
    Memory,
    Sqlite,
    Mongodb,
}

/// SQLite sink settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteSinkConfig {
    /// Database file, created if missing.
    pub path: String,
}

impl Default for SqliteSinkConfig {
    fn default() -> Self {
        Self {
            path: "./data/courier.db".to_string(),
        }
    }
}

/// MongoDB sink settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MongoSinkConfig {
    /// Connection URI, credentials included.
    pub uri: String,
    pub database: String,
    pub collection: String,
}

impl Default for MongoSinkConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "courier".to_string(),
            collection: "gologger".to_string(),
        }
    }
}

/// Sink configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    #[serde(rename = "type")]
    pub sink_type: SinkType,
    pub sqlite: SqliteSinkConfig,
    pub mongodb: MongoSinkConfig,
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a sink based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - SQLite: `--features sqlite`
/// - MongoDB: `--features mongodb`
/// - Memory: always available
pub async fn init_sink(
    config: &SinkConfig,
) -> std::result::Result<Arc<dyn LogSink>, Box<dyn std::error::Error + Send + Sync>> {
    match config.sink_type {
        SinkType::Memory => {
            info!(sink_type = "memory", "Sink initialized");
            Ok(Arc::new(MemoryLogSink::new()))
        }
        SinkType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                let path = &config.sqlite.path;
                if let Some(parent) = std::path::Path::new(path).parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let pool =
                    sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path)).await?;
                let sink = SqliteLogSink::new(pool);
                sink.init().await?;
                info!(sink_type = "sqlite", path = %path, "Sink initialized");
                Ok(Arc::new(sink))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err(
                    "SQLite sink requires the 'sqlite' feature. Rebuild with --features sqlite"
                        .into(),
                )
            }
        }
        SinkType::Mongodb => {
            #[cfg(feature = "mongodb")]
            {
                let mongo = &config.mongodb;
                let client = ::mongodb::Client::with_uri_str(&mongo.uri).await?;
                let sink = MongoLogSink::new(&client, &mongo.database, &mongo.collection);
                info!(
                    sink_type = "mongodb",
                    database = %mongo.database,
                    collection = %mongo.collection,
                    "Sink initialized"
                );
                Ok(Arc::new(sink))
            }

            #[cfg(not(feature = "mongodb"))]
            {
                Err(
                    "MongoDB sink requires the 'mongodb' feature. Rebuild with --features mongodb"
                        .into(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests;
