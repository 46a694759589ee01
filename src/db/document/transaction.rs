//! Transaction scope for document repositories.

use std::marker::PhantomData;

use tracing::debug;

use super::binding::Binding;
use super::collection::{BulkWriteOptions, Collection, NATIVE_ID_KEY, WriteModel};
use super::filter::Query;
use crate::db::mapper::Record;
use crate::db::models::{Filter, Paginated, PaginationOptions};
use crate::db::value::{ObjectId, Value};
use crate::db::{StorageError, StorageResult};

/// Handle given to a document [`with_transaction`](crate::db::Transactional::with_transaction)
/// block.
///
/// Writes are staged and applied together when the block succeeds. Reads see committed
/// state only, so a record created in the scope is not visible to `find_by_id` until commit.
pub struct DocumentTransaction<T, C> {
    binding: Binding<C>,
    staged: Vec<WriteModel>,
    _record: PhantomData<fn() -> T>,
}

impl<T: Record, C: Collection> DocumentTransaction<T, C> {
    pub(crate) fn new(binding: Binding<C>) -> Self {
        Self {
            binding,
            staged: Vec::new(),
            _record: PhantomData,
        }
    }

    /// Number of writes waiting for commit.
    pub fn staged(&self) -> usize {
        self.staged.len()
    }

    /// Stage an insert. An unset native identifier is assigned here, so the returned
    /// record carries the identifier it will be stored under.
    pub fn create(&mut self, item: &T) -> StorageResult<T> {
        let (mut document, _) = self.binding.encode(item)?;
        if self.binding.id_key == NATIVE_ID_KEY && !document.contains_key(NATIVE_ID_KEY) {
            document.insert(
                NATIVE_ID_KEY.to_string(),
                Value::ObjectId(ObjectId::new()),
            );
        }
        let staged = self.binding.decode(document.clone())?;
        self.staged.push(WriteModel::InsertOne { document });
        Ok(staged)
    }

    /// Stage an update of every mapped field. The record must exist when staged.
    pub async fn update(&mut self, id: impl Into<Value>, item: &T) -> StorageResult<()> {
        let query = self.require(id.into()).await?;
        let set = self.binding.encode_body(item)?;
        self.staged.push(WriteModel::UpdateOne { query, set });
        Ok(())
    }

    /// Stage a full replacement. The record must exist when staged.
    pub async fn replace(&mut self, id: impl Into<Value>, item: &T) -> StorageResult<()> {
        let query = self.require(id.into()).await?;
        let replacement = self.binding.encode_body(item)?;
        self.staged.push(WriteModel::ReplaceOne { query, replacement });
        Ok(())
    }

    /// Stage a delete. The record must exist when staged.
    pub async fn delete(&mut self, id: impl Into<Value>) -> StorageResult<()> {
        let query = self.require(id.into()).await?;
        self.staged.push(WriteModel::DeleteOne { query });
        Ok(())
    }

    pub async fn find_by_id(&self, id: impl Into<Value>) -> StorageResult<T> {
        self.binding.find_by_id(id.into()).await
    }

    pub async fn find_one(&self, filters: &[Filter]) -> StorageResult<T> {
        self.binding.find_one(filters).await
    }

    pub async fn paginate(&self, options: &PaginationOptions) -> StorageResult<Paginated<T>> {
        self.binding.paginate(options).await
    }

    pub async fn count(&self, filters: &[Filter]) -> StorageResult<usize> {
        self.binding.count(filters).await
    }

    async fn require(&self, id: Value) -> StorageResult<Query> {
        let query = self.binding.id_query(id.clone())?;
        let found = self
            .binding
            .collection
            .count_documents(&query)
            .await
            .map_err(|e| StorageError::count_failed(self.binding.name(), e))?;
        if found == 0 {
            return Err(StorageError::not_found(self.binding.name(), &id));
        }
        Ok(query)
    }

    pub(crate) async fn commit(self) -> StorageResult<()> {
        if self.staged.is_empty() {
            return Ok(());
        }
        debug!(collection = %self.binding.name(), writes = self.staged.len(), "Committing staged writes");
        self.binding
            .collection
            .bulk_write(self.staged, BulkWriteOptions { atomic: true })
            .await
            .map(|_| ())
            .map_err(|failure| StorageError::tx_commit_failed(self.binding.name(), failure.error))
    }
}
