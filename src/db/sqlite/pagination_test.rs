//! Tests for SQL pagination.

use serde::{Deserialize, Serialize};

use crate::db::{
    ErrorKind, Filter, PaginationOptions, QueryBuilder, Record, Repository, SortOrder,
    SqlRepository, SqliteDatabase,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Item {
    id: i64,
    label: String,
    bucket: String,
    rank: i64,
}

impl Record for Item {}

/// 25 items; bucket alternates "even"/"odd", rank counts down.
async fn seeded() -> (SqliteDatabase, SqlRepository<Item>) {
    let db = SqliteDatabase::in_memory()
        .await
        .expect("Failed to create in-memory database");
    sqlx::query(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, label TEXT NOT NULL, bucket TEXT NOT NULL, rank INTEGER NOT NULL)",
    )
    .execute(db.pool())
    .await
    .expect("Create table should succeed");

    let repo = db.repository::<Item>("items").unwrap();
    let items: Vec<Item> = (1..=25)
        .map(|n| Item {
            id: n,
            label: format!("item-{:02}", n),
            bucket: if n % 2 == 0 { "even" } else { "odd" }.to_string(),
            rank: 100 - n,
        })
        .collect();
    repo.bulk_insert(&items).await.expect("Seed should succeed");
    (db, repo)
}

#[tokio::test(flavor = "multi_thread")]
async fn last_page_of_25_by_10() {
    let (_db, repo) = seeded().await;

    let page = repo
        .paginate(&PaginationOptions::new(3, 10))
        .await
        .expect("Paginate should succeed");
    assert_eq!(page.page.total, 25);
    assert_eq!(page.page.pages, 3);
    assert!(!page.page.has_next);
    assert!(page.page.has_previous);
    assert_eq!(page.data.len(), 5);
    assert_eq!(page.data[0].id, 21);
}

#[tokio::test(flavor = "multi_thread")]
async fn first_page_defaults_to_identifier_order() {
    let (_db, repo) = seeded().await;

    let page = repo.paginate(&PaginationOptions::new(1, 10)).await.unwrap();
    let ids: Vec<i64> = page.data.iter().map(|i| i.id).collect();
    assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    assert!(page.page.has_next);
    assert!(!page.page.has_previous);
    assert!(!page.empty);
}

#[tokio::test(flavor = "multi_thread")]
async fn page_past_the_end_is_empty_not_an_error() {
    let (_db, repo) = seeded().await;

    let page = repo
        .paginate(&PaginationOptions::new(9, 10))
        .await
        .expect("Out of range page should succeed");
    assert!(page.data.is_empty());
    assert!(page.empty);
    assert_eq!(page.page.total, 25);
    assert_eq!(page.page.pages, 3);
    assert!(!page.page.has_next);
}

#[tokio::test(flavor = "multi_thread")]
async fn zero_page_size_reports_zero_pages() {
    let (_db, repo) = seeded().await;

    let page = repo.paginate(&PaginationOptions::new(1, 0)).await.unwrap();
    assert_eq!(page.page.pages, 0);
    assert_eq!(page.page.total, 25);
    assert!(page.data.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn filters_apply_to_count_and_rows() {
    let (_db, repo) = seeded().await;

    let options = PaginationOptions::new(1, 5).filter(Filter::eq("bucket", "even"));
    let page = repo.paginate(&options).await.unwrap();
    assert_eq!(page.page.total, 12);
    assert_eq!(page.page.pages, 3);
    assert!(page.data.iter().all(|i| i.bucket == "even"));
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_key_sort_from_query_builder() {
    let (_db, repo) = seeded().await;

    let options = QueryBuilder::new()
        .order_by("bucket", SortOrder::Desc)
        .order_by("rank", SortOrder::Asc)
        .limit(3)
        .to_pagination_options();
    let page = repo.paginate(&options).await.unwrap();

    // "odd" sorts after "even", so descending puts odd first; lowest rank is the highest id.
    let ids: Vec<i64> = page.data.iter().map(|i| i.id).collect();
    assert_eq!(ids, vec![25, 23, 21]);
}

#[tokio::test(flavor = "multi_thread")]
async fn query_builder_offset_selects_page() {
    let (_db, repo) = seeded().await;

    let options = QueryBuilder::new().limit(10).offset(10).to_pagination_options();
    let page = repo.paginate(&options).await.unwrap();
    assert_eq!(page.page.number, 2);
    assert_eq!(page.data.first().map(|i| i.id), Some(11));
}

#[tokio::test(flavor = "multi_thread")]
async fn projection_leaves_unselected_fields_at_zero() {
    let (_db, repo) = seeded().await;

    let options = PaginationOptions::new(1, 2).select(["id", "label"]);
    let page = repo.paginate(&options).await.unwrap();
    assert_eq!(page.data[0].label, "item-01");
    assert_eq!(page.data[0].bucket, "");
    assert_eq!(page.data[0].rank, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_sort_field_is_invalid_query() {
    let (_db, repo) = seeded().await;

    let options = PaginationOptions::new(1, 10).order_by("id; DROP TABLE items", SortOrder::Asc);
    let err = repo.paginate(&options).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuery);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_table_is_count_failure() {
    let db = SqliteDatabase::in_memory().await.unwrap();
    let repo = db.repository::<Item>("missing").unwrap();

    let err = repo.paginate(&PaginationOptions::default()).await.unwrap_err();
    assert!(matches!(err, crate::db::StorageError::CountFailed { .. }));
    assert_eq!(err.kind(), ErrorKind::Backend);
}
