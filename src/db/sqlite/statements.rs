//! Statements shared by the pooled repository and the transaction scope.
//!
//! Every function takes a plain `&mut SqliteConnection`, so the same code runs on a pool
//! connection or inside a `sqlx::Transaction`.

use std::sync::Arc;

use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::debug;

use super::helpers::{
    column, decode_row, escape_like, push_filters, push_limit_offset, push_order, push_value,
    quote_ident, select_list,
};
use crate::db::encode::encode_record;
use crate::db::mapper::{Record, RecordSchema, describe};
use crate::db::models::{Filter, Paginated, PaginationOptions, SearchOptions, describe_filters};
use crate::db::value::Value;
use crate::db::{StorageError, StorageResult};

/// A record type bound to a table.
#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub(crate) name: String,
    quoted: String,
    pub(crate) schema: Arc<RecordSchema>,
    pub(crate) id_key: String,
    id_column: String,
}

impl Table {
    pub(crate) fn new<T: Record>(table: &str, id_field: &str) -> StorageResult<Self> {
        if table.is_empty() {
            return Err(StorageError::invalid_query("no table bound to the repository"));
        }
        let schema = describe::<T>()?;
        let id_key = schema.key_of(id_field)?.to_string();
        Ok(Self {
            name: table.to_string(),
            quoted: quote_ident(table)?,
            id_column: quote_ident(&id_key)?,
            id_key,
            schema,
        })
    }

    /// Encoded `(key, value)` pairs of a record plus its identifier value.
    pub(crate) fn encode<T: Record>(&self, item: &T) -> StorageResult<(Vec<(String, Value)>, Value)> {
        let columns = encode_record(&self.schema, item)?;
        let id = columns
            .iter()
            .find(|(key, _)| *key == self.id_key)
            .map(|(_, value)| value.clone())
            .unwrap_or_default();
        Ok((columns, id))
    }

    fn log(&self, qb: &QueryBuilder<'_, Sqlite>) {
        debug!(table = %self.name, sql = %qb.sql(), "Executing statement");
    }

    /// `INSERT ... RETURNING *`. An unset identifier is left for the database to assign.
    pub(crate) async fn insert<T: Record>(&self, conn: &mut SqliteConnection, item: &T) -> StorageResult<T> {
        let (columns, _) = self.encode(item)?;
        let columns = columns
            .into_iter()
            .filter(|(key, value)| !(*key == self.id_key && value.is_unset_id()))
            .collect::<Vec<_>>();

        let mut qb = QueryBuilder::<Sqlite>::new("INSERT INTO ");
        qb.push(&self.quoted);
        if columns.is_empty() {
            qb.push(" DEFAULT VALUES");
        } else {
            qb.push(" (");
            for (i, (key, _)) in columns.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                qb.push(quote_ident(key)?);
            }
            qb.push(") VALUES (");
            for (i, (_, value)) in columns.into_iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(&mut qb, value);
            }
            qb.push(")");
        }
        qb.push(" RETURNING *");
        self.log(&qb);

        let row = qb
            .build()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StorageError::exec_failed(&self.name, e))?;
        decode_row(&self.name, &self.schema, &row)
    }

    pub(crate) async fn select_one<T: Record>(
        &self,
        conn: &mut SqliteConnection,
        filters: &[Filter],
    ) -> StorageResult<Option<T>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM ");
        qb.push(&self.quoted);
        push_filters(&mut qb, &self.schema, filters)?;
        push_order(&mut qb, &self.schema, &[], &self.id_column)?;
        qb.push(" LIMIT 1");
        self.log(&qb);

        let row = qb
            .build()
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StorageError::query_failed(&self.name, e))?;
        row.map(|row| decode_row(&self.name, &self.schema, &row))
            .transpose()
    }

    pub(crate) async fn select_by_id<T: Record>(
        &self,
        conn: &mut SqliteConnection,
        id: Value,
    ) -> StorageResult<Option<T>> {
        self.select_one(conn, &[Filter::eq(self.id_key.clone(), id)])
            .await
    }

    pub(crate) async fn find_by_id<T: Record>(&self, conn: &mut SqliteConnection, id: Value) -> StorageResult<T> {
        self.select_by_id(conn, id.clone())
            .await?
            .ok_or_else(|| StorageError::not_found(&self.name, &id))
    }

    pub(crate) async fn find_one<T: Record>(
        &self,
        conn: &mut SqliteConnection,
        filters: &[Filter],
    ) -> StorageResult<T> {
        self.select_one(conn, filters)
            .await?
            .ok_or_else(|| StorageError::not_found(&self.name, describe_filters(filters)))
    }

    pub(crate) async fn update_existing<T: Record>(
        &self,
        conn: &mut SqliteConnection,
        id: Value,
        item: &T,
    ) -> StorageResult<T> {
        self.update(conn, id.clone(), item)
            .await?
            .ok_or_else(|| StorageError::not_found(&self.name, &id))
    }

    pub(crate) async fn delete_existing(&self, conn: &mut SqliteConnection, id: Value) -> StorageResult<()> {
        match self.delete(conn, id.clone()).await? {
            0 => Err(StorageError::not_found(&self.name, &id)),
            _ => Ok(()),
        }
    }

    /// Full-row `UPDATE ... RETURNING *`; `None` when no row has this identifier.
    pub(crate) async fn update<T: Record>(
        &self,
        conn: &mut SqliteConnection,
        id: Value,
        item: &T,
    ) -> StorageResult<Option<T>> {
        let (columns, _) = self.encode(item)?;
        let columns = columns
            .into_iter()
            .filter(|(key, _)| *key != self.id_key)
            .collect::<Vec<_>>();
        if columns.is_empty() {
            return Err(StorageError::invalid_query(format!(
                "{} has no columns besides its identifier to update",
                self.schema.type_name()
            )));
        }

        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE ");
        qb.push(&self.quoted).push(" SET ");
        for (i, (key, value)) in columns.into_iter().enumerate() {
            if i > 0 {
                qb.push(", ");
            }
            qb.push(quote_ident(&key)?).push(" = ");
            push_value(&mut qb, value);
        }
        qb.push(" WHERE ").push(&self.id_column).push(" = ");
        push_value(&mut qb, id);
        qb.push(" RETURNING *");
        self.log(&qb);

        let row = qb
            .build()
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| StorageError::exec_failed(&self.name, e))?;
        row.map(|row| decode_row(&self.name, &self.schema, &row))
            .transpose()
    }

    /// Delete by identifier, returning the number of rows removed.
    pub(crate) async fn delete(&self, conn: &mut SqliteConnection, id: Value) -> StorageResult<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM ");
        qb.push(&self.quoted)
            .push(" WHERE ")
            .push(&self.id_column)
            .push(" = ");
        push_value(&mut qb, id);
        self.log(&qb);

        let result = qb
            .build()
            .execute(&mut *conn)
            .await
            .map_err(|e| StorageError::exec_failed(&self.name, e))?;
        Ok(result.rows_affected())
    }

    pub(crate) async fn count(&self, conn: &mut SqliteConnection, filters: &[Filter]) -> StorageResult<usize> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM ");
        qb.push(&self.quoted);
        push_filters(&mut qb, &self.schema, filters)?;
        self.log(&qb);

        let total: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StorageError::count_failed(&self.name, e))?;
        Ok(usize::try_from(total).unwrap_or_default())
    }

    pub(crate) async fn exists(&self, conn: &mut SqliteConnection, id: Value) -> StorageResult<bool> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT EXISTS(SELECT 1 FROM ");
        qb.push(&self.quoted)
            .push(" WHERE ")
            .push(&self.id_column)
            .push(" = ");
        push_value(&mut qb, id);
        qb.push(")");
        self.log(&qb);

        let found: i64 = qb
            .build_query_scalar::<i64>()
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| StorageError::query_failed(&self.name, e))?;
        Ok(found != 0)
    }

    /// Count, then fetch one bounded page ordered by the sort keys or the identifier.
    pub(crate) async fn paginate<T: Record>(
        &self,
        conn: &mut SqliteConnection,
        options: &PaginationOptions,
    ) -> StorageResult<Paginated<T>> {
        let total = self.count(&mut *conn, &options.filters).await?;

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT ");
        qb.push(select_list(&self.schema, &options.fields)?)
            .push(" FROM ")
            .push(&self.quoted);
        push_filters(&mut qb, &self.schema, &options.filters)?;
        push_order(&mut qb, &self.schema, &options.sort, &self.id_column)?;
        push_limit_offset(&mut qb, Some(options.page_size), options.offset());
        self.log(&qb);

        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| StorageError::query_failed(&self.name, e))?;
        let data = rows
            .iter()
            .map(|row| decode_row(&self.name, &self.schema, row))
            .collect::<StorageResult<Vec<T>>>()?;

        Ok(Paginated::new(
            data,
            options.page_number(),
            options.page_size,
            total,
        ))
    }

    /// Case-insensitive substring match OR-combined across `options.fields`.
    pub(crate) async fn search<T: Record>(
        &self,
        conn: &mut SqliteConnection,
        query: &str,
        options: &SearchOptions,
    ) -> StorageResult<Vec<T>> {
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM ");
        qb.push(&self.quoted).push(" WHERE (");
        for (i, field) in options.fields.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            qb.push("LOWER(CAST(")
                .push(column(&self.schema, field)?)
                .push(" AS TEXT)) LIKE ")
                .push_bind(pattern.clone())
                .push(" ESCAPE '\\'");
        }
        qb.push(")");
        push_order(&mut qb, &self.schema, &[], &self.id_column)?;
        push_limit_offset(&mut qb, options.limit, options.offset);
        self.log(&qb);

        let rows = qb
            .build()
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| StorageError::query_failed(&self.name, e))?;
        rows.iter()
            .map(|row| decode_row(&self.name, &self.schema, row))
            .collect()
    }
}

/// Reject a search without fields before touching the database.
pub(crate) fn check_search(table: &Table, options: &SearchOptions) -> StorageResult<()> {
    if options.fields.is_empty() {
        return Err(StorageError::invalid_query(format!(
            "search on {} needs at least one field",
            table.name
        )));
    }
    for field in &options.fields {
        table.schema.key_of(field)?;
    }
    Ok(())
}
