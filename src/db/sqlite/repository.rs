//! SQLite typed repository.

use std::marker::PhantomData;

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{instrument, warn};

use super::statements::{Table, check_search};
use super::transaction::SqlTransaction;
use crate::db::mapper::{Record, RecordSchema};
use crate::db::models::{
    BulkResponse, Filter, Paginated, PaginationOptions, SearchOptions, SkipReason,
};
use crate::db::repository::{Repository, Transactional};
use crate::db::value::Value;
use crate::db::{StorageError, StorageResult};

/// Default identifier field of SQL records.
pub const DEFAULT_ID_FIELD: &str = "id";

/// SQLx-backed repository for records of type `T` stored in one table.
///
/// Columns are the record's backend keys. Bulk writes run in a single transaction and are
/// all-or-nothing.
pub struct SqlRepository<T> {
    pool: SqlitePool,
    table: Table,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for SqlRepository<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            table: self.table.clone(),
            _record: PhantomData,
        }
    }
}

impl<T: Record> SqlRepository<T> {
    /// Repository keyed by the `id` field.
    pub fn new(pool: SqlitePool, table: &str) -> StorageResult<Self> {
        Self::keyed_by(pool, table, DEFAULT_ID_FIELD)
    }

    /// Repository whose lookups, updates, deletes and default ordering use `id_field`.
    pub fn keyed_by(pool: SqlitePool, table: &str, id_field: &str) -> StorageResult<Self> {
        Ok(Self {
            pool,
            table: Table::new::<T>(table, id_field)?,
            _record: PhantomData,
        })
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.table.schema
    }

    pub fn id_key(&self) -> &str {
        &self.table.id_key
    }

    async fn acquire(&self) -> StorageResult<PoolConnection<Sqlite>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| StorageError::query_failed(&self.table.name, e))
    }

    async fn begin(&self) -> StorageResult<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(|e| StorageError::tx_begin_failed(&self.table.name, e))
    }

    async fn commit(&self, tx: Transaction<'static, Sqlite>) -> StorageResult<()> {
        tx.commit()
            .await
            .map_err(|e| StorageError::tx_commit_failed(&self.table.name, e))
    }

    /// Roll back a failed batch and describe where it stopped.
    async fn abort(
        &self,
        tx: Transaction<'static, Sqlite>,
        index: usize,
        source: StorageError,
    ) -> StorageError {
        warn!(table = %self.table.name, index, error = %source, "Bulk operation failed, rolling back");
        match tx.rollback().await {
            Ok(()) => StorageError::bulk_failed(&self.table.name, index, 0, true, source),
            Err(e) => StorageError::tx_rollback_failed(&self.table.name, e),
        }
    }
}

impl<T: Record> Repository<T> for SqlRepository<T> {
    fn target(&self) -> &str {
        &self.table.name
    }

    #[instrument(skip_all, fields(table = %self.table.name))]
    async fn create(&self, item: &T) -> StorageResult<T> {
        let mut conn = self.acquire().await?;
        self.table.insert(&mut conn, item).await
    }

    #[instrument(skip_all, fields(table = %self.table.name))]
    async fn find_by_id<I>(&self, id: I) -> StorageResult<T>
    where
        I: Into<Value> + Send,
    {
        let mut conn = self.acquire().await?;
        self.table.find_by_id(&mut conn, id.into()).await
    }

    #[instrument(skip_all, fields(table = %self.table.name))]
    async fn find_one(&self, filters: &[Filter]) -> StorageResult<T> {
        let mut conn = self.acquire().await?;
        self.table.find_one(&mut conn, filters).await
    }

    #[instrument(skip_all, fields(table = %self.table.name))]
    async fn update<I>(&self, id: I, item: &T) -> StorageResult<T>
    where
        I: Into<Value> + Send,
    {
        let mut conn = self.acquire().await?;
        self.table.update_existing(&mut conn, id.into(), item).await
    }

    #[instrument(skip_all, fields(table = %self.table.name))]
    async fn delete<I>(&self, id: I) -> StorageResult<()>
    where
        I: Into<Value> + Send,
    {
        let mut conn = self.acquire().await?;
        self.table.delete_existing(&mut conn, id.into()).await
    }

    #[instrument(skip_all, fields(table = %self.table.name, page = options.page, page_size = options.page_size))]
    async fn paginate(&self, options: &PaginationOptions) -> StorageResult<Paginated<T>> {
        let mut conn = self.acquire().await?;
        self.table.paginate(&mut conn, options).await
    }

    #[instrument(skip_all, fields(table = %self.table.name, items = items.len()))]
    async fn bulk_insert(&self, items: &[T]) -> StorageResult<BulkResponse> {
        let mut response = BulkResponse::new(items.len());
        let mut tx = self.begin().await?;
        for (index, item) in items.iter().enumerate() {
            if let Err(e) = self.table.insert::<T>(&mut tx, item).await {
                return Err(self.abort(tx, index, e).await);
            }
            response.applied.push(index);
        }
        self.commit(tx).await?;
        Ok(response)
    }

    #[instrument(skip_all, fields(table = %self.table.name, items = items.len()))]
    async fn bulk_update(&self, items: &[T]) -> StorageResult<BulkResponse> {
        let mut response = BulkResponse::new(items.len());
        let mut tx = self.begin().await?;
        for (index, item) in items.iter().enumerate() {
            let id = match self.table.encode(item) {
                Ok((_, id)) => id,
                Err(e) => return Err(self.abort(tx, index, e).await),
            };
            if id.is_unset_id() {
                warn!(table = %self.table.name, index, "Skipping bulk update item without identifier");
                response.skip(index, SkipReason::MissingIdentifier);
                continue;
            }
            match self.table.update::<T>(&mut tx, id, item).await {
                Ok(Some(_)) => response.applied.push(index),
                Ok(None) => {
                    warn!(table = %self.table.name, index, "Skipping bulk update item with unknown identifier");
                    response.skip(index, SkipReason::NotFound);
                }
                Err(e) => return Err(self.abort(tx, index, e).await),
            }
        }
        self.commit(tx).await?;
        Ok(response)
    }

    #[instrument(skip_all, fields(table = %self.table.name, items = ids.len()))]
    async fn bulk_delete(&self, ids: &[Value]) -> StorageResult<BulkResponse> {
        let mut response = BulkResponse::new(ids.len());
        let mut tx = self.begin().await?;
        for (index, id) in ids.iter().enumerate() {
            if id.is_null() {
                warn!(table = %self.table.name, index, "Skipping bulk delete of null identifier");
                response.skip(index, SkipReason::MissingIdentifier);
                continue;
            }
            match self.table.delete(&mut tx, id.clone()).await {
                Ok(0) => response.skip(index, SkipReason::NotFound),
                Ok(_) => response.applied.push(index),
                Err(e) => return Err(self.abort(tx, index, e).await),
            }
        }
        self.commit(tx).await?;
        Ok(response)
    }

    #[instrument(skip_all, fields(table = %self.table.name, query = %query))]
    async fn search(&self, query: &str, options: &SearchOptions) -> StorageResult<Vec<T>> {
        check_search(&self.table, options)?;
        let mut conn = self.acquire().await?;
        self.table.search(&mut conn, query, options).await
    }

    #[instrument(skip_all, fields(table = %self.table.name))]
    async fn count(&self, filters: &[Filter]) -> StorageResult<usize> {
        let mut conn = self.acquire().await?;
        self.table.count(&mut conn, filters).await
    }

    #[instrument(skip_all, fields(table = %self.table.name))]
    async fn exists<I>(&self, id: I) -> StorageResult<bool>
    where
        I: Into<Value> + Send,
    {
        let mut conn = self.acquire().await?;
        self.table.exists(&mut conn, id.into()).await
    }
}

impl<T: Record> Transactional<T> for SqlRepository<T> {
    type Scope = SqlTransaction<T>;

    #[instrument(skip_all, fields(table = %self.table.name))]
    async fn with_transaction<F, R>(&self, f: F) -> StorageResult<R>
    where
        F: for<'s> FnOnce(&'s mut Self::Scope) -> futures_util::future::BoxFuture<'s, StorageResult<R>>
            + Send,
        R: Send,
    {
        let tx = self.begin().await?;
        let mut scope = SqlTransaction::new(tx, self.table.clone());
        match f(&mut scope).await {
            Ok(value) => {
                scope.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = scope.rollback().await {
                    warn!(table = %self.table.name, error = %rollback, "Rollback after failed transaction block failed");
                }
                Err(e)
            }
        }
    }
}
