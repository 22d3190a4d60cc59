//! SQLite log sink.

use async_trait::async_trait;
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqlitePool};

use super::schema::{LogRecords, CREATE_LOG_RECORDS_TABLE};
use super::{LogRecord, LogSink, RecentLogs, Result, MAX_RECENT};

/// SQLite implementation of LogSink.
///
/// Records are ordered by an autoincrement id, so "most recent" is
/// highest id first.
pub struct SqliteLogSink {
    pool: SqlitePool,
}

impl SqliteLogSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_LOG_RECORDS_TABLE)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LogSink for SqliteLogSink {
    async fn append(&self, record: LogRecord) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(LogRecords::Table)
            .columns([LogRecords::Message])
            .values_panic([record.message.into()])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<RecentLogs> {
        let (sql, values) = Query::select()
            .column(LogRecords::Message)
            .from(LogRecords::Table)
            .order_by(LogRecords::Id, Order::Desc)
            .limit(limit.min(MAX_RECENT) as u64)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&sql, values)
            .fetch_all(&self.pool)
            .await?;
        let records = rows
            .iter()
            .map(|row| row.try_get::<String, _>("message").map(LogRecord::new))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let (sql, values) = Query::select()
            .expr(Expr::col(LogRecords::Id).count())
            .from(LogRecords::Table)
            .build_sqlx(SqliteQueryBuilder);
        let row = sqlx::query_with(&sql, values)
            .fetch_one(&self.pool)
            .await?;
        let total: i64 = row.try_get(0)?;

        Ok(RecentLogs {
            records,
            total_count: total as u64,
        })
    }
}
