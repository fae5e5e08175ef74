use super::*;

#[tokio::test]
async fn fresh_store_has_no_identity() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    assert!(!store.has_identity().await.expect("query"));
    assert!(store.load_identity().await.expect("query").is_none());
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn saved_identity_is_replaced_not_duplicated() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    store.save_identity(b"first").await.expect("save first");
    store.save_identity(b"second").await.expect("save second");

    let loaded = store
        .load_identity()
        .await
        .expect("load")
        .expect("identity present");
    assert_eq!(loaded.identity_blob, b"second");

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM device_identity")
        .fetch_one(store.pool())
        .await
        .expect("count");
    assert_eq!(rows, 1);
}

#[tokio::test]
async fn clearing_identity_reports_whether_one_existed() {
    let store = DeviceStore::new("sqlite::memory:").await.expect("db");
    assert!(!store.clear_identity().await.expect("clear empty"));

    store.save_identity(b"paired").await.expect("save");
    assert!(store.clear_identity().await.expect("clear"));
    assert!(!store.has_identity().await.expect("query"));
}

#[tokio::test]
async fn creates_database_file_without_extension_in_nested_dir() {
    let temp_root = tempfile::tempdir().expect("tempdir");
    let db_path = temp_root
        .path()
        .join("nested")
        .join("session_alice_20240101_120000");

    let store = DeviceStore::open_path(&db_path).await.expect("db");
    store.save_identity(b"identity").await.expect("save");
    store.close().await;

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );

    let reopened = DeviceStore::open_path(&db_path).await.expect("reopen");
    assert!(reopened.has_identity().await.expect("query"));
    reopened.close().await;
}

#[test]
fn sqlite_path_ignores_memory_urls() {
    assert!(sqlite_path("sqlite::memory:").is_none());
    assert_eq!(
        sqlite_path("sqlite://./data/session_a_20240101_000000?mode=rwc"),
        Some(PathBuf::from("./data/session_a_20240101_000000"))
    );
}
