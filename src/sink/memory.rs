//! In-memory log sink.

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{LogRecord, LogSink, RecentLogs, Result, StoreError, MAX_RECENT};

/// Keeps every record in a vector. Nothing survives the process.
#[derive(Default)]
pub struct MemoryLogSink {
    records: RwLock<Vec<LogRecord>>,
    fail: RwLock<bool>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent operations fail with `StoreError::Unavailable`.
    pub async fn set_fail(&self, fail: bool) {
        *self.fail.write().await = fail;
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    async fn check(&self) -> Result<()> {
        if *self.fail.read().await {
            return Err(StoreError::Unavailable("memory sink set to fail".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn append(&self, record: LogRecord) -> Result<()> {
        self.check().await?;
        self.records.write().await.push(record);
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<RecentLogs> {
        self.check().await?;
        let records = self.records.read().await;
        Ok(RecentLogs {
            records: records
                .iter()
                .rev()
                .take(limit.min(MAX_RECENT))
                .cloned()
                .collect(),
            total_count: records.len() as u64,
        })
    }
}
