use super::*;

async fn fill(sink: &dyn LogSink, count: usize) {
    for i in 0..count {
        sink.append(LogRecord::new(format!("message-{}", i)))
            .await
            .unwrap();
    }
}

async fn assert_newest_first(sink: &dyn LogSink) {
    fill(sink, 3).await;

    let recent = sink.recent(10).await.unwrap();

    let messages: Vec<&str> = recent.records.iter().map(|r| r.message.as_str()).collect();
    assert_eq!(messages, vec!["message-2", "message-1", "message-0"]);
    assert_eq!(recent.total_count, 3);
}

async fn assert_limit_capped(sink: &dyn LogSink) {
    fill(sink, MAX_RECENT + 20).await;

    let recent = sink.recent(1_000).await.unwrap();

    assert_eq!(recent.records.len(), MAX_RECENT);
    assert_eq!(recent.total_count, (MAX_RECENT + 20) as u64);
    assert_eq!(
        recent.records[0].message,
        format!("message-{}", MAX_RECENT + 19)
    );
}

#[test]
fn test_sink_config_default() {
    let config = SinkConfig::default();
    assert_eq!(config.sink_type, SinkType::Memory);
    assert_eq!(config.mongodb.collection, "gologger");
}

#[tokio::test]
async fn test_memory_recent_is_newest_first() {
    assert_newest_first(&MemoryLogSink::new()).await;
}

#[tokio::test]
async fn test_memory_recent_caps_limit() {
    assert_limit_capped(&MemoryLogSink::new()).await;
}

#[tokio::test]
async fn test_memory_recent_on_empty_sink() {
    let recent = MemoryLogSink::new().recent(MAX_RECENT).await.unwrap();
    assert!(recent.records.is_empty());
    assert_eq!(recent.total_count, 0);
}

#[tokio::test]
async fn test_memory_recent_zero_limit_still_counts() {
    let sink = MemoryLogSink::new();
    fill(&sink, 2).await;

    let recent = sink.recent(0).await.unwrap();

    assert!(recent.records.is_empty());
    assert_eq!(recent.total_count, 2);
}

#[tokio::test]
async fn test_memory_failure_surfaces_store_error() {
    let sink = MemoryLogSink::new();
    sink.set_fail(true).await;

    let result = sink.append(LogRecord::new("lost")).await;

    assert!(matches!(result, Err(StoreError::Unavailable(_))));
    assert!(sink.is_empty().await);
}

#[tokio::test]
async fn test_init_sink_defaults_to_memory() {
    let sink = init_sink(&SinkConfig::default()).await.unwrap();
    sink.append(LogRecord::new("hello-world")).await.unwrap();

    let recent = sink.recent(1).await.unwrap();

    assert_eq!(recent.records, vec![LogRecord::new("hello-world")]);
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn sink() -> SqliteLogSink {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let sink = SqliteLogSink::new(pool);
        sink.init().await.unwrap();
        sink
    }

    #[tokio::test]
    async fn test_sqlite_recent_is_newest_first() {
        assert_newest_first(&sink().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_recent_caps_limit() {
        assert_limit_capped(&sink().await).await;
    }

    #[tokio::test]
    async fn test_sqlite_init_is_idempotent() {
        let sink = sink().await;
        sink.append(LogRecord::new("kept")).await.unwrap();

        sink.init().await.unwrap();

        assert_eq!(sink.recent(1).await.unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn test_sqlite_stores_quotes_verbatim() {
        let sink = sink().await;
        let message = "it's a \"quoted\" line; DROP TABLE log_records;";
        sink.append(LogRecord::new(message)).await.unwrap();

        let recent = sink.recent(1).await.unwrap();

        assert_eq!(recent.records[0].message, message);
    }
}
