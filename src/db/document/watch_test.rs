//! Tests for typed change feeds.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::{DocumentRepository, MemoryCollection};
use crate::StorageConfig;
use crate::db::{Filter, ObjectId, OperationKind, Record, Repository, StorageError};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
struct Job {
    #[serde(rename = "_id")]
    id: Option<ObjectId>,
    queue: String,
    attempts: u32,
}

impl Record for Job {}

fn job(queue: &str) -> Job {
    Job {
        id: None,
        queue: queue.to_string(),
        attempts: 0,
    }
}

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread")]
async fn feed_decodes_typed_events() {
    let repo: DocumentRepository<Job, _> =
        DocumentRepository::new(MemoryCollection::new("jobs")).unwrap();
    let cancel = CancellationToken::new();
    let mut feed = repo.watch(&[], cancel.clone()).await.unwrap();

    let created = repo.create(&job("email")).await.unwrap();
    let id = created.id.unwrap();
    let mut retried = created.clone();
    retried.attempts = 1;
    repo.update(id, &retried).await.unwrap();
    repo.replace(id, &job("sms")).await.unwrap();
    repo.delete(id).await.unwrap();

    let insert = timeout(WAIT, feed.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(insert.operation, OperationKind::Insert);
    assert!(insert.previous.is_none());
    assert_eq!(insert.current.as_ref(), Some(&created));

    let update = timeout(WAIT, feed.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(update.operation, OperationKind::Update);
    assert_eq!(update.previous.map(|j| j.attempts), Some(0));
    assert_eq!(update.current.map(|j| j.attempts), Some(1));

    let replace = timeout(WAIT, feed.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(replace.operation, OperationKind::Replace);
    assert!(replace.previous.is_none());
    assert_eq!(replace.current.map(|j| j.queue), Some("sms".to_string()));

    let delete = timeout(WAIT, feed.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(delete.operation, OperationKind::Delete);
    assert_eq!(delete.previous.and_then(|j| j.id), Some(id));
    assert!(delete.current.is_none());

    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn feed_respects_filters() {
    let repo: DocumentRepository<Job, _> =
        DocumentRepository::new(MemoryCollection::new("jobs")).unwrap();
    let cancel = CancellationToken::new();
    let mut feed = repo
        .watch(&[Filter::eq("queue", "sms")], cancel.clone())
        .await
        .unwrap();

    repo.create(&job("email")).await.unwrap();
    repo.create(&job("sms")).await.unwrap();

    let event = timeout(WAIT, feed.recv()).await.unwrap().unwrap().unwrap();
    assert_eq!(event.current.unwrap().queue, "sms");
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn cancellation_ends_the_feed() {
    let repo: DocumentRepository<Job, _> =
        DocumentRepository::new(MemoryCollection::new("jobs")).unwrap();
    let cancel = CancellationToken::new();
    let mut feed = repo.watch(&[], cancel.clone()).await.unwrap();

    cancel.cancel();
    let end = timeout(WAIT, feed.recv()).await.expect("feed should close");
    assert!(end.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn dropping_the_feed_stops_the_task_without_further_changes() {
    let repo: DocumentRepository<Job, _> =
        DocumentRepository::new(MemoryCollection::new("jobs")).unwrap();
    let feed = repo.watch(&[], CancellationToken::new()).await.unwrap();
    assert_eq!(repo.collection().watchers(), 1);

    drop(feed);
    timeout(WAIT, async {
        while repo.collection().watchers() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("driver stream should be released");
}

#[tokio::test(flavor = "multi_thread")]
async fn slow_consumer_blocks_instead_of_dropping() {
    let config = StorageConfig {
        watch_buffer: 1,
        ..StorageConfig::default()
    };
    let repo: DocumentRepository<Job, _> =
        DocumentRepository::new(MemoryCollection::with_config("jobs", &config))
            .unwrap()
            .with_config(&config);
    let cancel = CancellationToken::new();
    let feed = repo.watch(&[], cancel.clone()).await.unwrap();

    for i in 0..10 {
        repo.create(&job(&format!("q{}", i))).await.unwrap();
    }

    let queues: Vec<String> = timeout(
        WAIT,
        feed.take(10)
            .map(|event| event.unwrap().current.unwrap().queue)
            .collect(),
    )
    .await
    .unwrap();
    let expected: Vec<String> = (0..10).map(|i| format!("q{}", i)).collect();
    assert_eq!(queues, expected);
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread")]
async fn lagging_driver_stream_surfaces_terminal_error() {
    let config = StorageConfig {
        change_log_capacity: 1,
        watch_buffer: 1,
        ..StorageConfig::default()
    };
    let collection = MemoryCollection::with_config("jobs", &config);
    let repo: DocumentRepository<Job, _> =
        DocumentRepository::new(collection).unwrap().with_config(&config);
    let cancel = CancellationToken::new();
    let mut feed = repo.watch(&[], cancel.clone()).await.unwrap();

    // The decode task forwards at most one event into the full channel; the change log
    // holds one more, so the rest overflow it.
    for i in 0..20 {
        repo.create(&job(&format!("q{}", i))).await.unwrap();
    }

    let mut saw_error = false;
    while let Some(item) = timeout(WAIT, feed.recv()).await.unwrap() {
        if let Err(err) = item {
            assert!(matches!(err, StorageError::QueryFailed { .. }));
            saw_error = true;
        }
    }
    assert!(saw_error, "feed ends with the driver error");
}
