//! Repository traits for data access abstraction.
//!
//! These traits are the outbound contract of the storage layer. Callers depend on them
//! and never on backend types, so the SQL and document implementations are swappable.

use std::future::Future;

use futures_util::future::BoxFuture;

use crate::db::{
    StorageResult,
    mapper::Record,
    models::{BulkResponse, Filter, Paginated, PaginationOptions, SearchOptions},
    value::Value,
};

/// Typed CRUD, pagination, bulk writes and search over one table or collection.
pub trait Repository<T: Record>: Send + Sync {
    /// Table or collection name, used in error context.
    fn target(&self) -> &str;

    /// Insert a record and return it as stored, backend defaults included.
    fn create(&self, item: &T) -> impl Future<Output = StorageResult<T>> + Send;

    /// Point lookup by identifier. No match is [`StorageError::RecordNotFound`](crate::db::StorageError::RecordNotFound).
    fn find_by_id<I>(&self, id: I) -> impl Future<Output = StorageResult<T>> + Send
    where
        I: Into<Value> + Send;

    /// First record matching every filter; same not-found semantics as `find_by_id`.
    fn find_one(&self, filters: &[Filter]) -> impl Future<Output = StorageResult<T>> + Send;

    /// Rewrite every mapped field of the record with this identifier.
    fn update<I>(&self, id: I, item: &T) -> impl Future<Output = StorageResult<T>> + Send
    where
        I: Into<Value> + Send;

    /// Delete by identifier; deleting a missing record is an error.
    fn delete<I>(&self, id: I) -> impl Future<Output = StorageResult<()>> + Send
    where
        I: Into<Value> + Send;

    /// One page of matching records. A page past the end is empty, not an error.
    fn paginate(
        &self,
        options: &PaginationOptions,
    ) -> impl Future<Output = StorageResult<Paginated<T>>> + Send;

    fn bulk_insert(&self, items: &[T]) -> impl Future<Output = StorageResult<BulkResponse>> + Send;

    /// Update each item keyed by its identifier field. Items without an identifier, or
    /// whose identifier matches nothing, are reported in [`BulkResponse::skipped`].
    fn bulk_update(&self, items: &[T]) -> impl Future<Output = StorageResult<BulkResponse>> + Send;

    fn bulk_delete(&self, ids: &[Value]) -> impl Future<Output = StorageResult<BulkResponse>> + Send;

    fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> impl Future<Output = StorageResult<Vec<T>>> + Send;

    fn count(&self, filters: &[Filter]) -> impl Future<Output = StorageResult<usize>> + Send;

    fn exists<I>(&self, id: I) -> impl Future<Output = StorageResult<bool>> + Send
    where
        I: Into<Value> + Send;
}

/// Repositories that can run a block of work atomically.
pub trait Transactional<T: Record>: Repository<T> {
    /// Handle passed to the block; its operations join the transaction.
    type Scope: Send;

    /// Run `f` inside a transaction: commit when it returns `Ok`, roll back and propagate
    /// when it or the commit fails.
    fn with_transaction<F, R>(&self, f: F) -> impl Future<Output = StorageResult<R>> + Send
    where
        F: for<'s> FnOnce(&'s mut Self::Scope) -> BoxFuture<'s, StorageResult<R>> + Send,
        R: Send;
}
