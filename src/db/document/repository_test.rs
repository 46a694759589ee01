//! Tests for DocumentRepository.

use serde::{Deserialize, Serialize};

use super::{DocumentRepository, MemoryCollection};
use crate::db::{
    ErrorKind, Filter, FilterOp, ObjectId, PaginationOptions, QueryBuilder, Record, Repository,
    SearchOptions, SkipReason, SortOrder, StorageError, Timestamp, Value,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Article {
    #[serde(rename = "_id")]
    id: Option<ObjectId>,
    title: String,
    author: String,
    views: u64,
    tags: Vec<String>,
    published: Option<Timestamp>,
}

impl Record for Article {}

fn article(title: &str, author: &str, views: u64) -> Article {
    Article {
        id: None,
        title: title.to_string(),
        author: author.to_string(),
        views,
        tags: vec!["news".to_string()],
        published: None,
    }
}

fn repo() -> DocumentRepository<Article, MemoryCollection> {
    let collection = MemoryCollection::new("articles")
        .with_unique_index("title")
        .with_text_index(["title", "tags"]);
    DocumentRepository::new(collection).expect("Repository should bind")
}

#[tokio::test(flavor = "multi_thread")]
async fn create_refetches_with_assigned_id() {
    let repo = repo();

    let created = repo
        .create(&article("Hello", "ann", 3))
        .await
        .expect("Create should succeed");
    let id = created.id.expect("store assigns an id");

    let fetched = repo.find_by_id(id).await.expect("Find should succeed");
    assert_eq!(fetched, created);
    assert_eq!(fetched.tags, vec!["news".to_string()]);
}

#[tokio::test(flavor = "multi_thread")]
async fn string_ids_convert_to_object_ids() {
    let repo = repo();
    let created = repo.create(&article("Hex", "ann", 0)).await.unwrap();
    let hex = created.id.unwrap().to_hex();

    let fetched = repo.find_by_id(hex.as_str()).await.unwrap();
    assert_eq!(fetched.title, "Hex");

    let err = repo.find_by_id("not-hex").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuery);

    let err = repo
        .find_by_id(ObjectId::new().to_hex())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test(flavor = "multi_thread")]
async fn update_replace_and_delete() {
    let repo = repo();
    let created = repo.create(&article("Draft", "ann", 1)).await.unwrap();
    let id = created.id.unwrap();

    let mut changed = created.clone();
    changed.views = 10;
    changed.published = Some(Timestamp::now());
    let updated = repo.update(id, &changed).await.expect("Update should succeed");
    assert_eq!(updated.views, 10);
    assert_eq!(updated.id, Some(id));

    let mut replacement = article("Final", "bob", 0);
    replacement.tags.clear();
    let replaced = repo.replace(id, &replacement).await.unwrap();
    assert_eq!(replaced.title, "Final");
    assert_eq!(replaced.id, Some(id));
    assert!(replaced.tags.is_empty());

    repo.delete(id).await.expect("First delete should succeed");
    assert!(repo.delete(id).await.unwrap_err().is_not_found());
    assert!(repo.update(id, &changed).await.unwrap_err().is_not_found());
    assert!(!repo.exists(id).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_key_is_exec_failure() {
    let repo = repo();
    repo.create(&article("Same", "ann", 0)).await.unwrap();
    let err = repo.create(&article("Same", "bob", 0)).await.unwrap_err();
    assert!(matches!(err, StorageError::ExecFailed { ref target, .. } if target == "articles"));
    assert_eq!(err.kind(), ErrorKind::Backend);
}

#[tokio::test(flavor = "multi_thread")]
async fn paginate_matches_sql_semantics() {
    let repo = repo();
    for i in 0..25 {
        repo.create(&article(&format!("a-{:02}", i), "ann", i)).await.unwrap();
    }

    let page = repo
        .paginate(&PaginationOptions::new(3, 10).order_by("views", SortOrder::Asc))
        .await
        .unwrap();
    assert_eq!(page.page.total, 25);
    assert_eq!(page.page.pages, 3);
    assert!(!page.page.has_next);
    assert!(page.page.has_previous);
    assert_eq!(page.data.len(), 5);
    assert_eq!(page.data[0].views, 20);

    let beyond = repo.paginate(&PaginationOptions::new(7, 10)).await.unwrap();
    assert!(beyond.empty);
    assert_eq!(beyond.page.total, 25);
    assert_eq!(beyond.page.pages, 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn paginate_with_query_builder_filters_and_projection() {
    let repo = repo();
    for (i, author) in ["ann", "bob", "ann", "cat", "ann"].iter().enumerate() {
        repo.create(&article(&format!("t{}", i), author, i as u64))
            .await
            .unwrap();
    }

    let options = QueryBuilder::new()
        .where_eq("author", "ann")
        .where_op("views", FilterOp::Gt, 0)
        .order_by("views", SortOrder::Desc)
        .select(["title"])
        .limit(10)
        .to_pagination_options();
    let page = repo.paginate(&options).await.unwrap();

    let titles: Vec<_> = page.data.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(titles, vec!["t4", "t2"]);
    assert!(page.data.iter().all(|a| a.author.is_empty() && a.id.is_some()));
}

#[tokio::test(flavor = "multi_thread")]
async fn find_one_and_count_use_filters() {
    let repo = repo();
    repo.create(&article("One", "ann", 5)).await.unwrap();
    repo.create(&article("Two", "bob", 7)).await.unwrap();

    let found = repo.find_one(&[Filter::eq("author", "bob")]).await.unwrap();
    assert_eq!(found.title, "Two");
    assert_eq!(
        repo.count(&[Filter::is_in("author", ["ann", "bob"])])
            .await
            .unwrap(),
        2
    );
    assert!(
        repo.find_one(&[Filter::eq("author", "zed")])
            .await
            .unwrap_err()
            .is_not_found()
    );
    assert_eq!(
        repo.count(&[Filter::eq("password", "x")])
            .await
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidQuery
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_insert_is_partial_on_failure() {
    let repo = repo();
    let items = vec![
        article("b1", "ann", 0),
        article("b2", "ann", 0),
        article("b1", "ann", 0),
        article("b4", "ann", 0),
    ];

    let err = repo.bulk_insert(&items).await.unwrap_err();
    match err {
        StorageError::BulkOperationFailed {
            index,
            applied,
            rolled_back,
            ..
        } => {
            assert_eq!(index, 2);
            assert_eq!(applied, 2);
            assert!(!rolled_back);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(repo.count(&[]).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_update_and_delete_report_skips() {
    let repo = repo();
    let a = repo.create(&article("u1", "ann", 1)).await.unwrap();
    let b = repo.create(&article("u2", "ann", 2)).await.unwrap();

    let mut a2 = a.clone();
    a2.views = 100;
    let mut ghost = article("ghost", "x", 0);
    ghost.id = Some(ObjectId::new());
    let response = repo
        .bulk_update(&[article("no-id", "x", 0), a2, ghost])
        .await
        .unwrap();
    assert_eq!(response.applied, vec![1]);
    assert_eq!(response.skipped[0].index, 0);
    assert_eq!(response.skipped[0].reason, SkipReason::MissingIdentifier);
    assert_eq!(response.skipped[1].index, 2);
    assert_eq!(response.skipped[1].reason, SkipReason::NotFound);
    assert_eq!(repo.find_by_id(a.id.unwrap()).await.unwrap().views, 100);

    let response = repo
        .bulk_delete(&[
            Value::from(b.id.unwrap()),
            Value::Null,
            Value::from(b.id.unwrap().to_hex()),
        ])
        .await
        .unwrap();
    assert_eq!(response.applied, vec![0]);
    assert_eq!(response.skipped.len(), 2);
    assert_eq!(response.skipped[1].reason, SkipReason::NotFound);
    assert_eq!(repo.count(&[]).await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn search_uses_text_index_with_bounds() {
    let repo = repo();
    let mut a = article("Rust async runtimes", "ann", 0);
    a.tags = vec!["rust".to_string(), "tokio".to_string()];
    repo.create(&a).await.unwrap();
    repo.create(&article("Gardening in rust-belt towns", "bob", 0))
        .await
        .unwrap();
    repo.create(&article("Baking", "cat", 0)).await.unwrap();

    let found = repo
        .search("rust", &SearchOptions::in_fields(["title", "tags"]))
        .await
        .expect("Search should succeed");
    let titles: Vec<_> = found.iter().map(|a| a.title.as_str()).collect();
    assert_eq!(titles, vec!["Rust async runtimes", "Gardening in rust-belt towns"]);

    let second = repo
        .search(
            "rust",
            &SearchOptions::in_fields(["title"]).offset(1).limit(1),
        )
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].author, "bob");
}

#[tokio::test(flavor = "multi_thread")]
async fn search_without_fields_is_invalid_query() {
    let repo = repo();
    repo.create(&article("Rust async runtimes", "ann", 0))
        .await
        .unwrap();

    let err = repo
        .search("rust", &SearchOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidQuery);

    let err = repo
        .search("rust", &SearchOptions::in_fields(["nope"]))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::InvalidQuery { .. }));

    // Plain collections fail the field check before reaching the driver.
    let plain: DocumentRepository<Article, _> =
        DocumentRepository::new(MemoryCollection::new("plain")).unwrap();
    let err = plain
        .search("x", &SearchOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_caller_error());
}

#[tokio::test(flavor = "multi_thread")]
async fn search_without_text_index_is_query_failure() {
    let repo: DocumentRepository<Article, _> =
        DocumentRepository::new(MemoryCollection::new("plain")).unwrap();
    let err = repo
        .search("x", &SearchOptions::in_fields(["title"]))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::QueryFailed { .. }));
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Sku {
    code: String,
    stock: i64,
}

impl Record for Sku {}

#[tokio::test(flavor = "multi_thread")]
async fn custom_identifier_passes_through_verbatim() {
    let repo: DocumentRepository<Sku, _> =
        DocumentRepository::keyed_by(MemoryCollection::new("skus"), "code").unwrap();

    repo.create(&Sku {
        code: "abc".to_string(),
        stock: 3,
    })
    .await
    .unwrap();
    repo.create(&Sku {
        code: "abd".to_string(),
        stock: 1,
    })
    .await
    .unwrap();

    assert_eq!(repo.find_by_id("abc").await.unwrap().stock, 3);
    let page = repo.paginate(&PaginationOptions::default()).await.unwrap();
    let codes: Vec<_> = page.data.iter().map(|s| s.code.as_str()).collect();
    assert_eq!(codes, vec!["abc", "abd"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn unmapped_default_identifier_is_rejected() {
    let result: Result<DocumentRepository<Sku, _>, _> =
        DocumentRepository::new(MemoryCollection::new("skus"));
    assert!(matches!(result, Err(StorageError::InvalidQuery { .. })));
}
