//! Tests for SqlRepository CRUD, lookup and search.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::db::{
    ErrorKind, Filter, FilterOp, Record, Repository, SearchOptions, SqlRepository, SqliteDatabase,
    StorageError, Timestamp,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct User {
    id: i64,
    name: String,
    email: String,
    age: u32,
    active: bool,
    nickname: Option<String>,
    created_at: Timestamp,
    tags: Vec<String>,
}

impl Record for User {
    fn key_overrides() -> &'static [(&'static str, &'static str)] {
        &[("email", "email_address")]
    }
}

const CREATE_USERS: &str = "CREATE TABLE users (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    email_address TEXT NOT NULL UNIQUE,
    age INTEGER NOT NULL,
    active BOOLEAN NOT NULL,
    nickname TEXT,
    created_at TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]'
)";

async fn setup() -> (SqliteDatabase, SqlRepository<User>) {
    let db = SqliteDatabase::in_memory()
        .await
        .expect("Failed to create in-memory database");
    sqlx::query(CREATE_USERS)
        .execute(db.pool())
        .await
        .expect("Create table should succeed");
    let repo = db.repository::<User>("users").expect("Repository should bind");
    (db, repo)
}

fn user(name: &str, age: u32) -> User {
    User {
        id: 0,
        name: name.to_string(),
        email: format!("{}@example.com", name.to_lowercase()),
        age,
        active: true,
        nickname: None,
        created_at: Timestamp(Utc.with_ymd_and_hms(2025, 1, 1, 12, 30, 0).unwrap()),
        tags: vec!["a".to_string(), "b".to_string()],
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn create_and_find_by_id_round_trip() {
    let (_db, repo) = setup().await;

    let mut input = user("Alice", 30);
    input.nickname = Some("ally".to_string());
    let created = repo.create(&input).await.expect("Create should succeed");

    assert!(created.id > 0, "database assigns the identifier");
    let fetched = repo
        .find_by_id(created.id)
        .await
        .expect("Find should succeed");
    assert_eq!(fetched, created);
    assert_eq!(fetched.name, input.name);
    assert_eq!(fetched.email, input.email);
    assert_eq!(fetched.nickname.as_deref(), Some("ally"));
    assert_eq!(fetched.tags, input.tags);
    assert_eq!(fetched.created_at, input.created_at);
    assert!(fetched.active);
}

#[tokio::test(flavor = "multi_thread")]
async fn create_keeps_explicit_identifier() {
    let (_db, repo) = setup().await;

    let mut input = user("Bob", 41);
    input.id = 77;
    let created = repo.create(&input).await.unwrap();
    assert_eq!(created.id, 77);
    assert!(repo.exists(77).await.unwrap());
    assert!(!repo.exists(78).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn find_missing_id_is_not_found() {
    let (_db, repo) = setup().await;

    let err = repo.find_by_id(999).await.unwrap_err();
    assert!(err.is_not_found());
    match err {
        StorageError::RecordNotFound { id, target } => {
            assert_eq!(id, "999");
            assert_eq!(target, "users");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn find_one_uses_mapped_column_names() {
    let (_db, repo) = setup().await;
    repo.create(&user("Carol", 25)).await.unwrap();
    repo.create(&user("Dave", 35)).await.unwrap();

    let found = repo
        .find_one(&[Filter::eq("email", "dave@example.com")])
        .await
        .expect("Find one should succeed");
    assert_eq!(found.name, "Dave");

    let err = repo
        .find_one(&[Filter::eq("email", "nobody@example.com")])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_rewrites_every_field() {
    let (_db, repo) = setup().await;
    let created = repo.create(&user("Erin", 22)).await.unwrap();

    let mut changed = created.clone();
    changed.name = "Erin B".to_string();
    changed.age = 23;
    changed.active = false;
    changed.tags = vec![];

    let updated = repo
        .update(created.id, &changed)
        .await
        .expect("Update should succeed");
    assert_eq!(updated, changed);

    let fetched = repo.find_by_id(created.id).await.unwrap();
    assert_eq!(fetched, changed);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_missing_id_is_not_found() {
    let (_db, repo) = setup().await;
    let err = repo.update(404, &user("Ghost", 1)).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_twice_reports_not_found() {
    let (_db, repo) = setup().await;
    let created = repo.create(&user("Frank", 50)).await.unwrap();

    repo.delete(created.id).await.expect("First delete should succeed");
    let err = repo.delete(created.id).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn search_without_fields_is_invalid_before_any_query() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    // No table exists: any statement would fail with a backend error instead.
    let repo = db.repository::<User>("users").unwrap();

    let err = repo
        .search("alice", &SearchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuery);
}

#[tokio::test(flavor = "multi_thread")]
async fn search_is_case_insensitive_across_fields() {
    let (_db, repo) = setup().await;
    repo.create(&user("Alice", 30)).await.unwrap();
    repo.create(&user("Malice", 31)).await.unwrap();
    let mut bob = user("Bob", 40);
    bob.email = "bob@ALICE.org".to_string();
    repo.create(&bob).await.unwrap();
    repo.create(&user("Zed", 50)).await.unwrap();

    let found = repo
        .search("ALICE", &SearchOptions::in_fields(["name", "email"]))
        .await
        .expect("Search should succeed");
    let names: Vec<_> = found.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["Alice", "Malice", "Bob"]);

    let paged = repo
        .search("alice", &SearchOptions::in_fields(["name"]).limit(1).offset(1))
        .await
        .unwrap();
    assert_eq!(paged.len(), 1);
    assert_eq!(paged[0].name, "Malice");
}

#[tokio::test(flavor = "multi_thread")]
async fn search_treats_wildcards_literally() {
    let (_db, repo) = setup().await;
    repo.create(&user("Percent", 1)).await.unwrap();
    let mut odd = user("Odd", 2);
    odd.nickname = Some("100%".to_string());
    repo.create(&odd).await.unwrap();

    let found = repo
        .search("%", &SearchOptions::in_fields(["nickname"]))
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "Odd");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_fields_are_rejected() {
    let (_db, repo) = setup().await;

    let err = repo
        .find_one(&[Filter::eq("password", "x")])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuery);

    let err = repo
        .search("x", &SearchOptions::in_fields(["name; DROP TABLE users"]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuery);
}

#[tokio::test(flavor = "multi_thread")]
async fn comparison_and_null_filters() {
    let (_db, repo) = setup().await;
    for (name, age) in [("A", 10), ("B", 20), ("C", 30), ("D", 40)] {
        repo.create(&user(name, age)).await.unwrap();
    }
    let mut named = user("E", 50);
    named.nickname = Some("e".to_string());
    repo.create(&named).await.unwrap();

    assert_eq!(
        repo.count(&[Filter::new("age", FilterOp::Gte, 30)])
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        repo.count(&[
            Filter::new("age", FilterOp::Gt, 10),
            Filter::new("age", FilterOp::Lt, 40),
        ])
        .await
        .unwrap(),
        2
    );
    assert_eq!(
        repo.count(&[Filter::is_in("name", ["A", "D", "Z"])])
            .await
            .unwrap(),
        2
    );
    assert_eq!(
        repo.count(&[Filter::is_in("name", Vec::<String>::new())])
            .await
            .unwrap(),
        0
    );
    assert_eq!(
        repo.count(&[Filter::eq("nickname", crate::db::Value::Null)])
            .await
            .unwrap(),
        4
    );
    assert_eq!(
        repo.count(&[Filter::new("nickname", FilterOp::Ne, crate::db::Value::Null)])
            .await
            .unwrap(),
        1
    );
    assert_eq!(repo.count(&[]).await.unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn text_columns_coerce_into_typed_fields() {
    let (db, repo) = setup().await;
    sqlx::query(
        "INSERT INTO users (id, name, email_address, age, active, created_at, tags)
         VALUES (5, 'Raw', 'raw@example.com', '42', 'true', '2024-03-05 08:09:10', '[\"x\"]')",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let fetched = repo.find_by_id(5).await.expect("Coercion should succeed");
    assert_eq!(fetched.age, 42);
    assert!(fetched.active);
    assert_eq!(fetched.tags, vec!["x".to_string()]);
    assert_eq!(
        fetched.created_at.0,
        Utc.with_ymd_and_hms(2024, 3, 5, 8, 9, 10).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn unconvertible_column_is_conversion_error() {
    let (db, repo) = setup().await;
    sqlx::query(
        "INSERT INTO users (id, name, email_address, age, active, created_at)
         VALUES (6, 'Bad', 'bad@example.com', 'not a number', 1, '2024-01-01')",
    )
    .execute(db.pool())
    .await
    .unwrap();

    let err = repo.find_by_id(6).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conversion);
    assert!(matches!(err, StorageError::ScanFailed { .. }));
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Setting {
    code: String,
    value: String,
}

impl Record for Setting {}

#[tokio::test(flavor = "multi_thread")]
async fn custom_identifier_field() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    sqlx::query("CREATE TABLE settings (code TEXT PRIMARY KEY, value TEXT NOT NULL)")
        .execute(db.pool())
        .await
        .unwrap();
    let repo = db
        .repository_keyed_by::<Setting>("settings", "code")
        .expect("code is a mapped field");

    repo.create(&Setting {
        code: "theme".to_string(),
        value: "dark".to_string(),
    })
    .await
    .unwrap();

    let theme = repo.find_by_id("theme").await.unwrap();
    assert_eq!(theme.value, "dark");
    repo.delete("theme").await.unwrap();
    assert!(!repo.exists("theme").await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn default_identifier_must_be_mapped() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let result = db.repository::<Setting>("settings");
    assert!(matches!(result, Err(StorageError::InvalidQuery { .. })));
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Attachment {
    id: i64,
    data: Vec<u8>,
}

impl Record for Attachment {}

#[tokio::test(flavor = "multi_thread")]
async fn byte_fields_are_stored_as_blobs_and_read_from_text() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    sqlx::query("CREATE TABLE attachments (id INTEGER PRIMARY KEY, data BLOB)")
        .execute(db.pool())
        .await
        .unwrap();
    let repo = db.repository::<Attachment>("attachments").unwrap();

    let created = repo
        .create(&Attachment {
            id: 1,
            data: b"hi".to_vec(),
        })
        .await
        .expect("Create should succeed");
    assert_eq!(created.data, b"hi".to_vec());

    let storage: String = sqlx::query_scalar("SELECT typeof(data) FROM attachments WHERE id = 1")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(storage, "blob");

    sqlx::query("INSERT INTO attachments (id, data) VALUES (2, 'hello')")
        .execute(db.pool())
        .await
        .unwrap();

    let from_blob = repo.find_by_id(1).await.unwrap();
    assert_eq!(from_blob.data, b"hi".to_vec());
    let from_text = repo.find_by_id(2).await.expect("Text should read as bytes");
    assert_eq!(from_text.data, b"hello".to_vec());
}
