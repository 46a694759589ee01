//! Transaction-scoped SQL operations.

use std::marker::PhantomData;

use sqlx::{Sqlite, SqliteConnection, Transaction};

use super::statements::{Table, check_search};
use crate::db::mapper::Record;
use crate::db::models::{Filter, Paginated, PaginationOptions, SearchOptions};
use crate::db::value::Value;
use crate::db::{StorageError, StorageResult};

/// Handle given to a [`with_transaction`](crate::db::Transactional::with_transaction)
/// block. Everything done through it commits or rolls back together.
pub struct SqlTransaction<T> {
    tx: Transaction<'static, Sqlite>,
    table: Table,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record> SqlTransaction<T> {
    pub(crate) fn new(tx: Transaction<'static, Sqlite>, table: Table) -> Self {
        Self {
            tx,
            table,
            _record: PhantomData,
        }
    }

    pub async fn create(&mut self, item: &T) -> StorageResult<T> {
        self.table.insert(&mut self.tx, item).await
    }

    pub async fn find_by_id(&mut self, id: impl Into<Value>) -> StorageResult<T> {
        self.table.find_by_id(&mut self.tx, id.into()).await
    }

    pub async fn find_one(&mut self, filters: &[Filter]) -> StorageResult<T> {
        self.table.find_one(&mut self.tx, filters).await
    }

    pub async fn update(&mut self, id: impl Into<Value>, item: &T) -> StorageResult<T> {
        self.table
            .update_existing(&mut self.tx, id.into(), item)
            .await
    }

    pub async fn delete(&mut self, id: impl Into<Value>) -> StorageResult<()> {
        self.table.delete_existing(&mut self.tx, id.into()).await
    }

    pub async fn paginate(&mut self, options: &PaginationOptions) -> StorageResult<Paginated<T>> {
        self.table.paginate(&mut self.tx, options).await
    }

    pub async fn search(&mut self, query: &str, options: &SearchOptions) -> StorageResult<Vec<T>> {
        check_search(&self.table, options)?;
        self.table.search(&mut self.tx, query, options).await
    }

    pub async fn count(&mut self, filters: &[Filter]) -> StorageResult<usize> {
        self.table.count(&mut self.tx, filters).await
    }

    /// Raw connection for statements outside the record mapping.
    pub fn connection(&mut self) -> &mut SqliteConnection {
        &mut self.tx
    }

    pub(crate) async fn commit(self) -> StorageResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| StorageError::tx_commit_failed(&self.table.name, e))
    }

    pub(crate) async fn rollback(self) -> StorageResult<()> {
        self.tx
            .rollback()
            .await
            .map_err(|e| StorageError::tx_rollback_failed(&self.table.name, e))
    }
}
