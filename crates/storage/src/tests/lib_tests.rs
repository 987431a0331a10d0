use super::*;
use shared::error::ErrorCode;

fn log() -> LogId {
    LogId::from("favorites")
}

fn id(value: &str) -> EntryId {
    EntryId::from(value)
}

#[tokio::test]
async fn missing_log_reads_as_empty_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let order = storage.get(&log()).await.expect("get");
    assert!(order.is_empty());
    assert_eq!(order.seq(), 0);
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let suffix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let temp_root = std::env::temp_dir().join(format!("watchlog_storage_test_{suffix}"));
    let db_path = temp_root.join("nested").join("storage.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    std::fs::remove_dir_all(temp_root).expect("cleanup");
}

#[tokio::test]
async fn merge_stamps_each_write_with_next_sequence() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");

    let first = storage
        .merge(&log(), &RankPatch::upsert(id("alien"), 0))
        .await
        .expect("first write");
    let second = storage
        .merge(&log(), &RankPatch::upsert(id("heat"), 1))
        .await
        .expect("second write");
    assert_eq!((first, second), (1, 2));

    let order = storage.get(&log()).await.expect("get");
    assert_eq!(order.seq(), 2);
    assert_eq!(order.sorted_ids(), vec![id("alien"), id("heat")]);
    assert_eq!(
        order.slot(&id("alien")),
        Some(RankSlot::Live { rank: 0, seq: 1 })
    );
}

#[tokio::test]
async fn merge_removal_leaves_tombstone() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .set(&log(), &OrderMap::from_ranks([("alien", 0), ("heat", 1)], 0))
        .await
        .expect("seed");

    let seq = storage
        .merge(&log(), &RankPatch::removal(id("alien")))
        .await
        .expect("remove");

    let order = storage.get(&log()).await.expect("get");
    assert_eq!(order.sorted_ids(), vec![id("heat")]);
    assert_eq!(order.slot(&id("alien")), Some(RankSlot::Removed { seq }));
}

#[tokio::test]
async fn set_tombstones_entries_missing_from_new_order() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .set(
            &log(),
            &OrderMap::from_ranks([("alien", 0), ("heat", 1), ("ran", 2)], 0),
        )
        .await
        .expect("seed");

    storage
        .set(&log(), &OrderMap::from_ranks([("ran", 0), ("alien", 1)], 0))
        .await
        .expect("overwrite");

    let order = storage.get(&log()).await.expect("get");
    assert_eq!(order.sorted_ids(), vec![id("ran"), id("alien")]);
    assert!(!order.contains(&id("heat")));
    assert_eq!(order.seq(), 2);
}

#[tokio::test]
async fn lists_logs_with_live_entry_counts() {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    storage
        .describe_log(&log(), "Favorites", Visibility::Shared)
        .await
        .expect("describe");
    storage
        .set(&log(), &OrderMap::from_ranks([("alien", 0), ("heat", 1)], 0))
        .await
        .expect("seed");
    storage
        .merge(&log(), &RankPatch::removal(id("heat")))
        .await
        .expect("remove");

    let logs = storage.list_logs().await.expect("list");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].name, "Favorites");
    assert_eq!(logs[0].visibility, Visibility::Shared);
    assert_eq!(logs[0].entry_count, 1);
    assert_eq!(logs[0].seq, 2);
}

#[tokio::test]
async fn memory_store_matches_sqlite_sequencing() {
    let store = MemoryStore::new();
    store
        .set(&log(), &OrderMap::from_ranks([("alien", 0), ("heat", 1)], 0))
        .await
        .expect("seed");
    let seq = store
        .merge(&log(), &RankPatch::upsert(id("alien"), 2))
        .await
        .expect("merge");

    assert_eq!(seq, 2);
    assert_eq!(store.committed_writes().await, 2);
    assert_eq!(
        store.snapshot(&log()).await.sorted_ids(),
        vec![id("heat"), id("alien")]
    );
}

#[tokio::test]
async fn memory_store_consumes_injected_failures_in_order() {
    let store = MemoryStore::new();
    store
        .fail_next_writes(1, StoreError::unavailable("offline"))
        .await;
    store
        .fail_next_reads(1, StoreError::rejected("permission denied"))
        .await;

    let write = store.merge(&log(), &RankPatch::upsert(id("alien"), 0)).await;
    assert_eq!(write.expect_err("first write fails").code, ErrorCode::Unavailable);
    store
        .merge(&log(), &RankPatch::upsert(id("alien"), 0))
        .await
        .expect("second write succeeds");

    let read = store.get(&log()).await;
    assert_eq!(read.expect_err("first read fails").code, ErrorCode::Rejected);
    assert_eq!(store.get(&log()).await.expect("read").len(), 1);
    assert_eq!(store.committed_writes().await, 1);
}

#[test]
fn in_memory_urls_have_no_parent_directory() {
    assert!(sqlite_path("sqlite::memory:").is_none());
    assert_eq!(
        sqlite_path("sqlite://./data/logs.db?mode=rwc"),
        Some(PathBuf::from("./data/logs.db"))
    );
}
