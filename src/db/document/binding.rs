//! Record mapping shared by the document repository and its transaction scope.

use std::sync::Arc;

use super::collection::{Collection, DocumentError, FindOptions, NATIVE_ID_KEY};
use super::filter::Query;
use crate::db::coerce::decode_record;
use crate::db::encode::encode_document;
use crate::db::mapper::{Record, RecordSchema, describe};
use crate::db::models::{
    Filter, Paginated, PaginationOptions, SearchOptions, SortOrder, describe_filters,
};
use crate::db::value::{Document, ObjectId, Value};
use crate::db::{StorageError, StorageResult};

/// A record type bound to a collection.
pub(crate) struct Binding<C> {
    pub(crate) collection: Arc<C>,
    pub(crate) schema: Arc<RecordSchema>,
    pub(crate) id_key: String,
}

impl<C> Clone for Binding<C> {
    fn clone(&self) -> Self {
        Self {
            collection: Arc::clone(&self.collection),
            schema: Arc::clone(&self.schema),
            id_key: self.id_key.clone(),
        }
    }
}

impl<C: Collection> Binding<C> {
    pub(crate) fn new<T: Record>(collection: Arc<C>, id_field: &str) -> StorageResult<Self> {
        if collection.name().is_empty() {
            return Err(StorageError::invalid_query(
                "no collection bound to the repository",
            ));
        }
        let schema = describe::<T>()?;
        let id_key = schema.key_of(id_field)?.to_string();
        Ok(Self {
            collection,
            schema,
            id_key,
        })
    }

    pub(crate) fn name(&self) -> &str {
        self.collection.name()
    }

    fn uses_native_id(&self) -> bool {
        self.id_key == NATIVE_ID_KEY
    }

    /// Convert a caller identifier to the stored representation.
    ///
    /// Strings become object ids when the record is keyed by the native identifier.
    pub(crate) fn native_id(&self, id: Value) -> StorageResult<Value> {
        match id {
            Value::Text(hex) if self.uses_native_id() => ObjectId::parse_str(&hex)
                .map(Value::ObjectId)
                .map_err(|e| StorageError::invalid_query(e.to_string())),
            other => Ok(other),
        }
    }

    pub(crate) fn id_query(&self, id: Value) -> StorageResult<Query> {
        Ok(Query::by_key(self.id_key.clone(), self.native_id(id)?))
    }

    /// Lower logical filters to a query over backend keys.
    pub(crate) fn query(&self, filters: &[Filter]) -> StorageResult<Query> {
        filters.iter().try_fold(Query::all(), |query, filter| {
            let key = self.schema.key_of(&filter.field)?;
            let value = if key == self.id_key {
                match filter.value.clone() {
                    Value::Array(ids) => Value::Array(
                        ids.into_iter()
                            .map(|id| self.native_id(id))
                            .collect::<StorageResult<_>>()?,
                    ),
                    id => self.native_id(id)?,
                }
            } else {
                filter.value.clone()
            };
            Ok(query.and(key, filter.op, value))
        })
    }

    /// Encode `item` and split off its identifier.
    ///
    /// An unset native identifier is dropped so the store assigns one.
    pub(crate) fn encode<T: Record>(&self, item: &T) -> StorageResult<(Document, Value)> {
        let mut doc = encode_document(&self.schema, item)?;
        let id = doc.get(&self.id_key).cloned().unwrap_or_default();
        if self.uses_native_id() && id.is_unset_id() {
            doc.remove(&self.id_key);
        }
        Ok((doc, id))
    }

    /// Encoded fields of `item` without its identifier, for updates and replacements.
    pub(crate) fn encode_body<T: Record>(&self, item: &T) -> StorageResult<Document> {
        let mut doc = encode_document(&self.schema, item)?;
        doc.remove(&self.id_key);
        Ok(doc)
    }

    pub(crate) fn decode<T: Record>(&self, doc: Document) -> StorageResult<T> {
        decode_record(&self.schema, doc).map_err(|e| StorageError::scan_failed(self.name(), e))
    }

    /// Search needs at least one mapped field, as on the SQL backend.
    pub(crate) fn check_search(&self, options: &SearchOptions) -> StorageResult<()> {
        if options.fields.is_empty() {
            return Err(StorageError::invalid_query(format!(
                "search on {} needs at least one field",
                self.name()
            )));
        }
        for field in &options.fields {
            self.schema.key_of(field)?;
        }
        Ok(())
    }

    pub(crate) fn query_failed(&self, e: DocumentError) -> StorageError {
        StorageError::query_failed(self.name(), e)
    }

    pub(crate) fn exec_failed(&self, e: DocumentError) -> StorageError {
        StorageError::exec_failed(self.name(), e)
    }

    pub(crate) async fn fetch<T: Record>(&self, query: &Query) -> StorageResult<Option<T>> {
        self.collection
            .find_one(query)
            .await
            .map_err(|e| self.query_failed(e))?
            .map(|doc| self.decode(doc))
            .transpose()
    }

    pub(crate) async fn find_by_id<T: Record>(&self, id: Value) -> StorageResult<T> {
        let query = self.id_query(id.clone())?;
        self.fetch(&query)
            .await?
            .ok_or_else(|| StorageError::not_found(self.name(), &id))
    }

    pub(crate) async fn find_one<T: Record>(&self, filters: &[Filter]) -> StorageResult<T> {
        let query = self.query(filters)?;
        self.fetch(&query)
            .await?
            .ok_or_else(|| StorageError::not_found(self.name(), describe_filters(filters)))
    }

    pub(crate) async fn count(&self, filters: &[Filter]) -> StorageResult<usize> {
        let query = self.query(filters)?;
        self.collection
            .count_documents(&query)
            .await
            .map_err(|e| StorageError::count_failed(self.name(), e))
    }

    /// Count, then fetch one page sorted by the sort keys or the identifier.
    pub(crate) async fn paginate<T: Record>(
        &self,
        options: &PaginationOptions,
    ) -> StorageResult<Paginated<T>> {
        let query = self.query(&options.filters)?;
        let total = self
            .collection
            .count_documents(&query)
            .await
            .map_err(|e| StorageError::count_failed(self.name(), e))?;

        let sort = if options.sort.is_empty() {
            vec![(self.id_key.clone(), SortOrder::Asc)]
        } else {
            options
                .sort
                .iter()
                .map(|key| Ok((self.schema.key_of(&key.field)?.to_string(), key.order)))
                .collect::<StorageResult<Vec<_>>>()?
        };
        let projection = options
            .fields
            .iter()
            .map(|f| self.schema.key_of(f).map(str::to_string))
            .collect::<StorageResult<Vec<_>>>()?;
        let find = FindOptions {
            skip: options.offset(),
            limit: Some(options.page_size),
            sort,
            projection,
        };

        let docs = self
            .collection
            .find(&query, &find)
            .await
            .map_err(|e| self.query_failed(e))?;
        let data = docs
            .into_iter()
            .map(|doc| self.decode(doc))
            .collect::<StorageResult<Vec<T>>>()?;

        Ok(Paginated::new(
            data,
            options.page_number(),
            options.page_size,
            total,
        ))
    }
}
