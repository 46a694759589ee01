//! Document-store typed repository.

use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::binding::Binding;
use super::collection::{
    BulkWriteFailure, BulkWriteOptions, ChangeNotification, Collection, NATIVE_ID_KEY, WriteModel,
    WriteResult,
};
use super::filter::Query;
use super::transaction::DocumentTransaction;
use super::watch::ChangeFeed;
use crate::config::StorageConfig;
use crate::db::mapper::{Record, RecordSchema};
use crate::db::models::{
    BulkResponse, ChangeEvent, Filter, OperationKind, Paginated, PaginationOptions, SearchOptions,
    SkipReason,
};
use crate::db::repository::{Repository, Transactional};
use crate::db::value::Value;
use crate::db::{StorageError, StorageResult};

/// Repository for records of type `T` stored in collection `C`.
///
/// Records are keyed by the native `_id` unless built with [`DocumentRepository::keyed_by`].
/// Bulk writes are ordered batches that are not rolled back: a failure leaves the items
/// before it applied and reports how many in [`StorageError::BulkOperationFailed`].
pub struct DocumentRepository<T, C> {
    binding: Binding<C>,
    watch_buffer: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T, C> Clone for DocumentRepository<T, C> {
    fn clone(&self) -> Self {
        Self {
            binding: self.binding.clone(),
            watch_buffer: self.watch_buffer,
            _record: PhantomData,
        }
    }
}

impl<T: Record, C: Collection> DocumentRepository<T, C> {
    /// Repository keyed by the native `_id` field.
    pub fn new(collection: C) -> StorageResult<Self> {
        Self::keyed_by(collection, NATIVE_ID_KEY)
    }

    /// Repository whose lookups and default ordering use `id_field`. Identifiers are passed
    /// to the store verbatim unless `id_field` maps to `_id`.
    pub fn keyed_by(collection: C, id_field: &str) -> StorageResult<Self> {
        Ok(Self {
            binding: Binding::new::<T>(Arc::new(collection), id_field)?,
            watch_buffer: StorageConfig::default().watch_buffer,
            _record: PhantomData,
        })
    }

    /// Size change-feed channels from `config.watch_buffer`.
    pub fn with_config(mut self, config: &StorageConfig) -> Self {
        self.watch_buffer = config.watch_buffer.max(1);
        self
    }

    pub fn collection(&self) -> &C {
        &self.binding.collection
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.binding.schema
    }

    pub fn id_key(&self) -> &str {
        &self.binding.id_key
    }

    /// Replace the whole stored document with `item`, keeping its identifier.
    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    pub async fn replace<I>(&self, id: I, item: &T) -> StorageResult<T>
    where
        I: Into<Value> + Send,
    {
        let id = id.into();
        let query = self.binding.id_query(id.clone())?;
        let body = self.binding.encode_body(item)?;
        let matched = self
            .binding
            .collection
            .replace_one(&query, body)
            .await
            .map_err(|e| self.binding.exec_failed(e))?;
        if matched == 0 {
            return Err(StorageError::not_found(self.binding.name(), &id));
        }
        self.binding.find_by_id(id).await
    }

    /// Open a typed change feed over records matching `filters`.
    ///
    /// A background task decodes notifications into the feed until `cancel` fires, the
    /// driver stream ends or fails, or the feed is dropped. When the consumer falls behind
    /// the task waits for room in the channel; nothing is dropped.
    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    pub async fn watch(
        &self,
        filters: &[Filter],
        cancel: CancellationToken,
    ) -> StorageResult<ChangeFeed<T>> {
        let query = self.binding.query(filters)?;
        let mut stream = self
            .binding
            .collection
            .watch(&query)
            .await
            .map_err(|e| self.binding.query_failed(e))?;

        let (tx, rx) = mpsc::channel::<StorageResult<ChangeEvent<T>>>(self.watch_buffer);
        let binding = self.binding.clone();
        info!(collection = %binding.name(), "Change feed opened");

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    next = stream.next() => next,
                };
                let Some(next) = next else {
                    break;
                };
                let (event, terminal) = match next {
                    Ok(notification) => (decode_change(&binding, notification), false),
                    Err(e) => {
                        warn!(collection = %binding.name(), error = %e, "Change stream failed");
                        (Err(binding.query_failed(e)), true)
                    }
                };
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    sent = tx.send(event) => sent,
                };
                if sent.is_err() || terminal {
                    break;
                }
            }
            info!(collection = %binding.name(), "Change feed closed");
        });

        Ok(ChangeFeed::new(rx))
    }
}

fn decode_change<T: Record, C: Collection>(
    binding: &Binding<C>,
    notification: ChangeNotification,
) -> StorageResult<ChangeEvent<T>> {
    let operation = notification.operation;
    let previous = match operation {
        OperationKind::Update | OperationKind::Delete => notification
            .full_document_before_change
            .map(|doc| binding.decode(doc))
            .transpose()?,
        OperationKind::Insert | OperationKind::Replace => None,
    };
    let current = match operation {
        OperationKind::Delete => None,
        _ => notification
            .full_document
            .map(|doc| binding.decode(doc))
            .transpose()?,
    };
    Ok(ChangeEvent {
        operation,
        previous,
        current,
        timestamp: notification.cluster_time,
    })
}

/// Map a failed batch onto the bulk error, translating the model position back to the
/// request position.
fn bulk_failure(
    target: &str,
    failure: BulkWriteFailure,
    positions: &[usize],
) -> StorageError {
    let applied = failure
        .outcome
        .results
        .iter()
        .filter(|r| !matches!(r, WriteResult::Matched(0)))
        .count();
    let index = positions.get(failure.index).copied().unwrap_or(failure.index);
    warn!(collection = %target, index, applied, error = %failure.error, "Bulk write stopped part way");
    StorageError::bulk_failed(
        target,
        index,
        applied,
        false,
        StorageError::exec_failed(target, failure.error),
    )
}

/// Record applied and not-found positions from per-model results.
fn collect_matches(response: &mut BulkResponse, results: &[WriteResult], positions: &[usize]) {
    for (result, &index) in results.iter().zip(positions) {
        match result {
            WriteResult::Matched(0) => response.skip(index, SkipReason::NotFound),
            _ => response.applied.push(index),
        }
    }
}

impl<T: Record, C: Collection> Repository<T> for DocumentRepository<T, C> {
    fn target(&self) -> &str {
        self.binding.name()
    }

    /// Inserts, then re-reads the stored document by the identifier the store reports.
    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    async fn create(&self, item: &T) -> StorageResult<T> {
        let (doc, _) = self.binding.encode(item)?;
        let id = self
            .binding
            .collection
            .insert_one(doc)
            .await
            .map_err(|e| self.binding.exec_failed(e))?;
        let query = Query::by_key(NATIVE_ID_KEY, id.clone());
        self.binding
            .fetch(&query)
            .await?
            .ok_or_else(|| StorageError::not_found(self.binding.name(), &id))
    }

    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    async fn find_by_id<I>(&self, id: I) -> StorageResult<T>
    where
        I: Into<Value> + Send,
    {
        self.binding.find_by_id(id.into()).await
    }

    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    async fn find_one(&self, filters: &[Filter]) -> StorageResult<T> {
        self.binding.find_one(filters).await
    }

    /// Sets every mapped field except the identifier.
    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    async fn update<I>(&self, id: I, item: &T) -> StorageResult<T>
    where
        I: Into<Value> + Send,
    {
        let id = id.into();
        let query = self.binding.id_query(id.clone())?;
        let set = self.binding.encode_body(item)?;
        let matched = self
            .binding
            .collection
            .update_one(&query, set)
            .await
            .map_err(|e| self.binding.exec_failed(e))?;
        if matched == 0 {
            return Err(StorageError::not_found(self.binding.name(), &id));
        }
        self.binding.find_by_id(id).await
    }

    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    async fn delete<I>(&self, id: I) -> StorageResult<()>
    where
        I: Into<Value> + Send,
    {
        let id = id.into();
        let query = self.binding.id_query(id.clone())?;
        let deleted = self
            .binding
            .collection
            .delete_one(&query)
            .await
            .map_err(|e| self.binding.exec_failed(e))?;
        match deleted {
            0 => Err(StorageError::not_found(self.binding.name(), &id)),
            _ => Ok(()),
        }
    }

    #[instrument(skip_all, fields(collection = %self.binding.name(), page = options.page, page_size = options.page_size))]
    async fn paginate(&self, options: &PaginationOptions) -> StorageResult<Paginated<T>> {
        self.binding.paginate(options).await
    }

    #[instrument(skip_all, fields(collection = %self.binding.name(), items = items.len()))]
    async fn bulk_insert(&self, items: &[T]) -> StorageResult<BulkResponse> {
        let mut response = BulkResponse::new(items.len());
        let models = items
            .iter()
            .map(|item| {
                self.binding
                    .encode(item)
                    .map(|(document, _)| WriteModel::InsertOne { document })
            })
            .collect::<StorageResult<Vec<_>>>()?;
        let positions: Vec<usize> = (0..items.len()).collect();

        let outcome = self
            .binding
            .collection
            .bulk_write(models, BulkWriteOptions::default())
            .await
            .map_err(|f| bulk_failure(self.binding.name(), f, &positions))?;
        response.applied.extend(positions.iter().take(outcome.results.len()));
        Ok(response)
    }

    #[instrument(skip_all, fields(collection = %self.binding.name(), items = items.len()))]
    async fn bulk_update(&self, items: &[T]) -> StorageResult<BulkResponse> {
        let mut response = BulkResponse::new(items.len());
        let mut models = Vec::with_capacity(items.len());
        let mut positions = Vec::with_capacity(items.len());
        for (index, item) in items.iter().enumerate() {
            let (mut set, id) = self.binding.encode(item)?;
            if id.is_unset_id() {
                warn!(collection = %self.binding.name(), index, "Skipping bulk update item without identifier");
                response.skip(index, SkipReason::MissingIdentifier);
                continue;
            }
            set.remove(&self.binding.id_key);
            models.push(WriteModel::UpdateOne {
                query: self.binding.id_query(id)?,
                set,
            });
            positions.push(index);
        }

        let outcome = self
            .binding
            .collection
            .bulk_write(models, BulkWriteOptions::default())
            .await
            .map_err(|f| bulk_failure(self.binding.name(), f, &positions))?;
        collect_matches(&mut response, &outcome.results, &positions);
        response.skipped.sort_by_key(|s| s.index);
        Ok(response)
    }

    #[instrument(skip_all, fields(collection = %self.binding.name(), items = ids.len()))]
    async fn bulk_delete(&self, ids: &[Value]) -> StorageResult<BulkResponse> {
        let mut response = BulkResponse::new(ids.len());
        let mut models = Vec::with_capacity(ids.len());
        let mut positions = Vec::with_capacity(ids.len());
        for (index, id) in ids.iter().enumerate() {
            if id.is_null() {
                warn!(collection = %self.binding.name(), index, "Skipping bulk delete of null identifier");
                response.skip(index, SkipReason::MissingIdentifier);
                continue;
            }
            models.push(WriteModel::DeleteOne {
                query: self.binding.id_query(id.clone())?,
            });
            positions.push(index);
        }

        let outcome = self
            .binding
            .collection
            .bulk_write(models, BulkWriteOptions::default())
            .await
            .map_err(|f| bulk_failure(self.binding.name(), f, &positions))?;
        collect_matches(&mut response, &outcome.results, &positions);
        response.skipped.sort_by_key(|s| s.index);
        Ok(response)
    }

    /// Text-index search ordered by relevance. `options.fields` must name at least one
    /// mapped field, but the index decides which keys are matched.
    #[instrument(skip_all, fields(collection = %self.binding.name(), query = %query))]
    async fn search(&self, query: &str, options: &SearchOptions) -> StorageResult<Vec<T>> {
        self.binding.check_search(options)?;
        let hits = self
            .binding
            .collection
            .text_search(query)
            .await
            .map_err(|e| self.binding.query_failed(e))?;
        debug!(collection = %self.binding.name(), hits = hits.len(), "Text search finished");
        hits.into_iter()
            .skip(options.offset)
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|(doc, _score)| self.binding.decode(doc))
            .collect()
    }

    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    async fn count(&self, filters: &[Filter]) -> StorageResult<usize> {
        self.binding.count(filters).await
    }

    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    async fn exists<I>(&self, id: I) -> StorageResult<bool>
    where
        I: Into<Value> + Send,
    {
        let query = self.binding.id_query(id.into())?;
        let count = self
            .binding
            .collection
            .count_documents(&query)
            .await
            .map_err(|e| StorageError::count_failed(self.binding.name(), e))?;
        Ok(count > 0)
    }
}

impl<T: Record, C: Collection> Transactional<T> for DocumentRepository<T, C> {
    type Scope = DocumentTransaction<T, C>;

    /// Writes made through the scope are staged and applied as one atomic batch after the
    /// block returns `Ok`. A failed commit is [`StorageError::TxCommitFailed`].
    #[instrument(skip_all, fields(collection = %self.binding.name()))]
    async fn with_transaction<F, R>(&self, f: F) -> StorageResult<R>
    where
        F: for<'s> FnOnce(&'s mut Self::Scope) -> futures_util::future::BoxFuture<'s, StorageResult<R>>
            + Send,
        R: Send,
    {
        let mut scope = DocumentTransaction::new(self.binding.clone());
        match f(&mut scope).await {
            Ok(value) => {
                scope.commit().await?;
                Ok(value)
            }
            Err(e) => {
                debug!(collection = %self.binding.name(), staged = scope.staged(), "Discarding staged writes");
                Err(e)
            }
        }
    }
}
