//! Tests for SQLite pool setup.

use serde::{Deserialize, Serialize};

use crate::StorageConfig;
use crate::db::{Record, Repository, SqliteDatabase, StorageError};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Entry {
    id: i64,
    body: String,
}

impl Record for Entry {}

async fn create_table(db: &SqliteDatabase) {
    sqlx::query("CREATE TABLE entry (id INTEGER PRIMARY KEY, body TEXT NOT NULL)")
        .execute(db.pool())
        .await
        .expect("Create table should succeed");
}

#[tokio::test(flavor = "multi_thread")]
async fn in_memory_database_keeps_state_across_calls() {
    let db = SqliteDatabase::in_memory()
        .await
        .expect("Failed to create in-memory database");
    create_table(&db).await;

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(db.pool())
            .await
            .expect("Query should succeed");
    assert!(tables.iter().any(|t| t == "entry"));
}

#[tokio::test(flavor = "multi_thread")]
async fn on_disk_database_persists_between_pools() {
    let dir = tempfile::tempdir().expect("Temp dir");
    let path = dir.path().join("store.db");

    {
        let db = SqliteDatabase::open(&path).await.expect("Open should succeed");
        create_table(&db).await;
        let repo = db.repository::<Entry>("entry").unwrap();
        repo.create(&Entry {
            id: 0,
            body: "persisted".to_string(),
        })
        .await
        .expect("Create should succeed");
        db.close().await;
    }

    let db = SqliteDatabase::open(&path).await.expect("Reopen should succeed");
    let repo = db.repository::<Entry>("entry").unwrap();
    let entry = repo.find_by_id(1).await.expect("Row should survive reopen");
    assert_eq!(entry.body, "persisted");
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_uses_config_url() {
    let dir = tempfile::tempdir().expect("Temp dir");
    let config = StorageConfig {
        database_url: format!("sqlite://{}", dir.path().join("cfg.db").display()),
        ..StorageConfig::default()
    };
    let db = SqliteDatabase::connect(&config)
        .await
        .expect("Connect should succeed");
    create_table(&db).await;
    assert!(db.pool().size() >= 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_database_path_is_connection_error() {
    let config = StorageConfig {
        database_url: "sqlite:///definitely/missing/dir/store.db".to_string(),
        ..StorageConfig::default()
    };
    let result = SqliteDatabase::connect(&config).await;
    assert!(matches!(result, Err(StorageError::Connection { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn repository_requires_a_table_name() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let result = db.repository::<Entry>("");
    assert!(matches!(result, Err(StorageError::InvalidQuery { .. })));
}
