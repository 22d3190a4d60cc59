//! MongoDB log sink.
//!
//! Records live in a single collection without an explicit ordering field;
//! reads sort by `$natural` descending, i.e. reverse insertion order.

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::options::FindOptions;
use mongodb::{Client, Collection};

use super::{LogRecord, LogSink, RecentLogs, Result, StoreError, MAX_RECENT};

/// MongoDB implementation of LogSink.
pub struct MongoLogSink {
    records: Collection<Document>,
}

impl MongoLogSink {
    pub fn new(client: &Client, database_name: &str, collection_name: &str) -> Self {
        Self {
            records: client.database(database_name).collection(collection_name),
        }
    }
}

#[async_trait]
impl LogSink for MongoLogSink {
    async fn append(&self, record: LogRecord) -> Result<()> {
        self.records
            .insert_one(doc! { "message": record.message })
            .await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<RecentLogs> {
        let options = FindOptions::builder()
            .sort(doc! { "$natural": -1 })
            .limit(limit.min(MAX_RECENT) as i64)
            .build();

        let mut cursor = self.records.find(doc! {}).with_options(options).await?;

        let mut records = Vec::new();
        while cursor.advance().await? {
            let doc = cursor.deserialize_current()?;
            let message = doc
                .get_str("message")
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            records.push(LogRecord::new(message));
        }

        let total_count = self.records.count_documents(doc! {}).await?;

        Ok(RecentLogs {
            records,
            total_count,
        })
    }
}
