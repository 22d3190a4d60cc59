//! Log table schema using sea-query.

use sea_query::Iden;

/// Log records table schema.
#[derive(Iden)]
pub enum LogRecords {
    #[iden = "log_records"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "message"]
    Message,
}

/// SQL for creating the log records table.
pub const CREATE_LOG_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS log_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    message TEXT NOT NULL
);
"#;
