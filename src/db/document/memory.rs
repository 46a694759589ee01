//! In-process document collection.
//!
//! `MemoryCollection` implements [`Collection`] over a vector of documents guarded by a
//! tokio `RwLock`. Writes publish [`ChangeNotification`]s on a broadcast channel while the
//! write lock is held, so every watcher sees changes in commit order.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use super::collection::{
    BulkWriteFailure, BulkWriteOptions, BulkWriteOutcome, ChangeNotification, ChangeStream,
    Collection, DocumentError, FindOptions, NATIVE_ID_KEY, WriteModel, WriteResult,
};
use super::filter::{Query, project, sort_documents};
use crate::config::StorageConfig;
use crate::db::models::OperationKind;
use crate::db::value::{Document, ObjectId, Value};

#[derive(Debug, Clone, Default)]
struct Indexes {
    unique: Vec<String>,
    text: Vec<String>,
}

/// A collection kept in memory, with optional unique and text indexes.
#[derive(Debug, Clone)]
pub struct MemoryCollection {
    name: Arc<str>,
    indexes: Arc<Indexes>,
    docs: Arc<RwLock<Vec<Document>>>,
    changes: broadcast::Sender<ChangeNotification>,
}

impl MemoryCollection {
    pub fn new(name: &str) -> Self {
        Self::with_config(name, &StorageConfig::default())
    }

    /// Collection whose change log retains `config.change_log_capacity` notifications.
    pub fn with_config(name: &str, config: &StorageConfig) -> Self {
        let (changes, _) = broadcast::channel(config.change_log_capacity.max(1));
        Self {
            name: Arc::from(name),
            indexes: Arc::new(Indexes::default()),
            docs: Arc::new(RwLock::new(Vec::new())),
            changes,
        }
    }

    /// Reject writes that would store two documents with the same non-null `key`.
    pub fn with_unique_index(mut self, key: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.indexes).unique.push(key.into());
        self
    }

    /// Declare the text index used by [`Collection::text_search`].
    pub fn with_text_index<S: Into<String>>(mut self, keys: impl IntoIterator<Item = S>) -> Self {
        Arc::make_mut(&mut self.indexes)
            .text
            .extend(keys.into_iter().map(Into::into));
        self
    }

    /// Number of open change streams.
    pub fn watchers(&self) -> usize {
        self.changes.receiver_count()
    }

    /// Copy of every stored document in insertion order.
    pub async fn snapshot(&self) -> Vec<Document> {
        self.docs.read().await.clone()
    }

    fn notify(&self, notification: ChangeNotification) {
        // No receivers is fine: nobody is watching.
        let _ = self.changes.send(notification);
    }

    fn check_unique(
        &self,
        docs: &[Document],
        candidate: &Document,
        skip: Option<usize>,
    ) -> Result<(), DocumentError> {
        let keys = std::iter::once(NATIVE_ID_KEY).chain(self.indexes.unique.iter().map(String::as_str));
        for key in keys {
            let Some(value) = candidate.get(key).filter(|v| !v.is_null()) else {
                continue;
            };
            let clash = docs
                .iter()
                .enumerate()
                .any(|(i, doc)| Some(i) != skip && doc.get(key) == Some(value));
            if clash {
                return Err(DocumentError::DuplicateKey {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    fn insert(
        &self,
        docs: &mut Vec<Document>,
        mut document: Document,
    ) -> Result<(Value, ChangeNotification), DocumentError> {
        let id = match document.get(NATIVE_ID_KEY) {
            Some(id) if !id.is_null() => id.clone(),
            _ => {
                let id = Value::ObjectId(ObjectId::new());
                document.insert(NATIVE_ID_KEY.to_string(), id.clone());
                id
            }
        };
        self.check_unique(docs, &document, None)?;
        docs.push(document.clone());
        Ok((
            id.clone(),
            change(OperationKind::Insert, id, None, Some(document)),
        ))
    }

    fn update(
        &self,
        docs: &mut [Document],
        query: &Query,
        set: Document,
    ) -> Result<Option<ChangeNotification>, DocumentError> {
        query.validate()?;
        let Some(pos) = docs.iter().position(|d| query.matches(d)) else {
            return Ok(None);
        };
        let before = docs[pos].clone();
        let id = before.get(NATIVE_ID_KEY).cloned().unwrap_or_default();
        let mut after = before.clone();
        for (key, value) in set {
            if key == NATIVE_ID_KEY && value != id {
                return Err(DocumentError::InvalidDocument(
                    "the _id of a document is immutable".to_string(),
                ));
            }
            after.insert(key, value);
        }
        self.check_unique(docs, &after, Some(pos))?;
        docs[pos] = after.clone();
        Ok(Some(change(
            OperationKind::Update,
            id,
            Some(before),
            Some(after),
        )))
    }

    fn replace(
        &self,
        docs: &mut [Document],
        query: &Query,
        mut replacement: Document,
    ) -> Result<Option<ChangeNotification>, DocumentError> {
        query.validate()?;
        let Some(pos) = docs.iter().position(|d| query.matches(d)) else {
            return Ok(None);
        };
        let before = docs[pos].clone();
        let id = before.get(NATIVE_ID_KEY).cloned().unwrap_or_default();
        match replacement.get(NATIVE_ID_KEY) {
            Some(new_id) if !new_id.is_null() && *new_id != id => {
                return Err(DocumentError::InvalidDocument(
                    "the _id of a document is immutable".to_string(),
                ));
            }
            _ => {
                replacement.insert(NATIVE_ID_KEY.to_string(), id.clone());
            }
        }
        self.check_unique(docs, &replacement, Some(pos))?;
        docs[pos] = replacement.clone();
        Ok(Some(change(
            OperationKind::Replace,
            id,
            Some(before),
            Some(replacement),
        )))
    }

    fn delete(
        &self,
        docs: &mut Vec<Document>,
        query: &Query,
    ) -> Result<Option<ChangeNotification>, DocumentError> {
        query.validate()?;
        let Some(pos) = docs.iter().position(|d| query.matches(d)) else {
            return Ok(None);
        };
        let before = docs.remove(pos);
        let id = before.get(NATIVE_ID_KEY).cloned().unwrap_or_default();
        Ok(Some(change(OperationKind::Delete, id, Some(before), None)))
    }

    fn apply(
        &self,
        docs: &mut Vec<Document>,
        model: WriteModel,
    ) -> Result<(WriteResult, Option<ChangeNotification>), DocumentError> {
        match model {
            WriteModel::InsertOne { document } => {
                let (id, notification) = self.insert(docs, document)?;
                Ok((WriteResult::Inserted(id), Some(notification)))
            }
            WriteModel::UpdateOne { query, set } => matched(self.update(docs, &query, set)?),
            WriteModel::ReplaceOne { query, replacement } => {
                matched(self.replace(docs, &query, replacement)?)
            }
            WriteModel::DeleteOne { query } => matched(self.delete(docs, &query)?),
        }
    }
}

fn matched(
    notification: Option<ChangeNotification>,
) -> Result<(WriteResult, Option<ChangeNotification>), DocumentError> {
    let count = u64::from(notification.is_some());
    Ok((WriteResult::Matched(count), notification))
}

fn change(
    operation: OperationKind,
    document_key: Value,
    before: Option<Document>,
    after: Option<Document>,
) -> ChangeNotification {
    ChangeNotification {
        operation,
        document_key,
        full_document: after,
        full_document_before_change: before,
        cluster_time: Utc::now(),
    }
}

/// Lower-cased alphanumeric words of a text value.
fn tokens(value: &Value) -> Vec<String> {
    match value {
        Value::Text(s) => s
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect(),
        Value::Array(items) => items.iter().flat_map(tokens).collect(),
        _ => Vec::new(),
    }
}

/// A notification is visible to a watcher when the document it reports matches.
fn visible(query: &Query, notification: &ChangeNotification) -> bool {
    notification
        .full_document
        .as_ref()
        .or(notification.full_document_before_change.as_ref())
        .is_some_and(|doc| query.matches(doc))
}

impl Collection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn count_documents(&self, query: &Query) -> Result<usize, DocumentError> {
        query.validate()?;
        let docs = self.docs.read().await;
        Ok(docs.iter().filter(|d| query.matches(d)).count())
    }

    async fn find(&self, query: &Query, options: &FindOptions) -> Result<Vec<Document>, DocumentError> {
        query.validate()?;
        let mut found: Vec<Document> = {
            let docs = self.docs.read().await;
            docs.iter().filter(|d| query.matches(d)).cloned().collect()
        };
        sort_documents(&mut found, &options.sort);
        Ok(found
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|doc| project(doc, &options.projection))
            .collect())
    }

    async fn find_one(&self, query: &Query) -> Result<Option<Document>, DocumentError> {
        query.validate()?;
        let docs = self.docs.read().await;
        Ok(docs.iter().find(|d| query.matches(d)).cloned())
    }

    async fn insert_one(&self, document: Document) -> Result<Value, DocumentError> {
        let mut docs = self.docs.write().await;
        let (id, notification) = self.insert(&mut docs, document)?;
        self.notify(notification);
        Ok(id)
    }

    async fn replace_one(&self, query: &Query, replacement: Document) -> Result<u64, DocumentError> {
        let mut docs = self.docs.write().await;
        let notification = self.replace(&mut docs, query, replacement)?;
        let count = u64::from(notification.is_some());
        notification.into_iter().for_each(|n| self.notify(n));
        Ok(count)
    }

    async fn update_one(&self, query: &Query, set: Document) -> Result<u64, DocumentError> {
        let mut docs = self.docs.write().await;
        let notification = self.update(&mut docs, query, set)?;
        let count = u64::from(notification.is_some());
        notification.into_iter().for_each(|n| self.notify(n));
        Ok(count)
    }

    async fn delete_one(&self, query: &Query) -> Result<u64, DocumentError> {
        let mut docs = self.docs.write().await;
        let notification = self.delete(&mut docs, query)?;
        let count = u64::from(notification.is_some());
        notification.into_iter().for_each(|n| self.notify(n));
        Ok(count)
    }

    async fn bulk_write(
        &self,
        models: Vec<WriteModel>,
        options: BulkWriteOptions,
    ) -> Result<BulkWriteOutcome, BulkWriteFailure> {
        let mut guard = self.docs.write().await;
        // Atomic batches work on a copy that only replaces the live documents on success.
        let mut staged = if options.atomic { Some(guard.clone()) } else { None };
        let mut outcome = BulkWriteOutcome::default();
        let mut notifications = Vec::new();

        for (index, model) in models.into_iter().enumerate() {
            let docs = match staged.as_mut() {
                Some(copy) => copy,
                None => &mut *guard,
            };
            match self.apply(docs, model) {
                Ok((result, notification)) => {
                    outcome.results.push(result);
                    notifications.extend(notification);
                }
                Err(error) => {
                    debug!(collection = %self.name, index, error = %error, "Bulk write stopped");
                    if options.atomic {
                        return Err(BulkWriteFailure {
                            outcome: BulkWriteOutcome::default(),
                            index,
                            error,
                        });
                    }
                    notifications.into_iter().for_each(|n| self.notify(n));
                    return Err(BulkWriteFailure {
                        outcome,
                        index,
                        error,
                    });
                }
            }
        }

        if let Some(copy) = staged {
            *guard = copy;
        }
        notifications.into_iter().for_each(|n| self.notify(n));
        Ok(outcome)
    }

    /// Scores are the share of indexed words matching a query term.
    async fn text_search(&self, text: &str) -> Result<Vec<(Document, f64)>, DocumentError> {
        if self.indexes.text.is_empty() {
            return Err(DocumentError::NoTextIndex {
                collection: self.name.to_string(),
            });
        }
        let terms = tokens(&Value::from(text));
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let docs = self.docs.read().await;
        let mut scored: Vec<(Document, f64)> = docs
            .iter()
            .filter_map(|doc| {
                let words: Vec<String> = self
                    .indexes
                    .text
                    .iter()
                    .filter_map(|key| doc.get(key))
                    .flat_map(tokens)
                    .collect();
                let hits = terms
                    .iter()
                    .map(|term| words.iter().filter(|w| *w == term).count())
                    .sum::<usize>();
                (hits > 0).then(|| (doc.clone(), hits as f64 / words.len() as f64))
            })
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(scored)
    }

    async fn watch(&self, query: &Query) -> Result<ChangeStream, DocumentError> {
        query.validate()?;
        let query = query.clone();
        let mut rx = self.changes.subscribe();

        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(notification) => {
                        if visible(&query, &notification) {
                            yield Ok(notification);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        yield Err(DocumentError::Lagged(missed));
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };
        Ok(ChangeStream::new(stream))
    }
}
