//! Document-store driver contract.
//!
//! [`DocumentRepository`](super::DocumentRepository) talks to a store only through the
//! [`Collection`] trait. Documents, filters and change notifications are expressed in
//! backend keys; mapping to records happens in the repository.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures_util::Stream;
use thiserror::Error;

use super::filter::Query;
use crate::db::models::{OperationKind, SortOrder};
use crate::db::value::{Document, Value};

/// Native identifier key of the document store.
pub const NATIVE_ID_KEY: &str = "_id";

/// Failure reported by a document-store driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DocumentError {
    #[error("duplicate key on '{key}': {value}")]
    DuplicateKey { key: String, value: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("collection '{collection}' has no text index")]
    NoTextIndex { collection: String },

    #[error("change stream fell behind by {0} notifications")]
    Lagged(u64),

    #[error("change stream closed")]
    Closed,
}

/// Bounds, ordering and projection of a `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
    /// Sort keys applied in order.
    pub sort: Vec<(String, SortOrder)>,
    /// Keys to return; empty returns whole documents. The identifier key is always kept.
    pub projection: Vec<String>,
}

/// One operation of a batched write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne { document: Document },
    /// Set the given keys on the first match.
    UpdateOne { query: Query, set: Document },
    ReplaceOne { query: Query, replacement: Document },
    DeleteOne { query: Query },
}

/// How a batched write is applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BulkWriteOptions {
    /// Apply every model or none of them.
    pub atomic: bool,
}

/// Result of one write model, positioned like the request.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult {
    Inserted(Value),
    /// Number of documents matched by an update, replace or delete.
    Matched(u64),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteOutcome {
    pub results: Vec<WriteResult>,
}

/// A batched write stopped at `index`. `outcome` holds what was applied before it, which
/// is empty for an atomic write.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("bulk write failed at model {index}: {error}")]
pub struct BulkWriteFailure {
    pub outcome: BulkWriteOutcome,
    pub index: usize,
    #[source]
    pub error: DocumentError,
}

/// A change reported by a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub operation: OperationKind,
    pub document_key: Value,
    /// Document after the change; absent for deletes.
    pub full_document: Option<Document>,
    /// Document before the change; absent for inserts.
    pub full_document_before_change: Option<Document>,
    pub cluster_time: DateTime<Utc>,
}

/// Live feed of [`ChangeNotification`]s. Dropping it closes the underlying cursor.
pub struct ChangeStream {
    inner: Pin<Box<dyn Stream<Item = Result<ChangeNotification, DocumentError>> + Send>>,
}

impl ChangeStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<ChangeNotification, DocumentError>> + Send + 'static,
    {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for ChangeStream {
    type Item = Result<ChangeNotification, DocumentError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// A named collection of documents.
pub trait Collection: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn count_documents(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<usize, DocumentError>> + Send;

    fn find(
        &self,
        query: &Query,
        options: &FindOptions,
    ) -> impl Future<Output = Result<Vec<Document>, DocumentError>> + Send;

    fn find_one(
        &self,
        query: &Query,
    ) -> impl Future<Output = Result<Option<Document>, DocumentError>> + Send;

    /// Insert and return the identifier, assigning a native one when the document has none.
    fn insert_one(
        &self,
        document: Document,
    ) -> impl Future<Output = Result<Value, DocumentError>> + Send;

    /// Replace the first match; returns the number matched.
    fn replace_one(
        &self,
        query: &Query,
        replacement: Document,
    ) -> impl Future<Output = Result<u64, DocumentError>> + Send;

    /// Set keys on the first match; returns the number matched.
    fn update_one(
        &self,
        query: &Query,
        set: Document,
    ) -> impl Future<Output = Result<u64, DocumentError>> + Send;

    fn delete_one(&self, query: &Query) -> impl Future<Output = Result<u64, DocumentError>> + Send;

    /// Apply `models` in order, stopping at the first failure.
    fn bulk_write(
        &self,
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
    ) -> impl Future<Output = Result<BulkWriteOutcome, BulkWriteFailure>> + Send;

    /// Documents matching `text` in the text index with their relevance score, best first.
    fn text_search(
        &self,
        text: &str,
    ) -> impl Future<Output = Result<Vec<(Document, f64)>, DocumentError>> + Send;

    /// Open a change stream restricted to documents matching `query`.
    fn watch(&self, query: &Query) -> impl Future<Output = Result<ChangeStream, DocumentError>> + Send;
}
