//! Shared helper functions for SQLite repositories.
//!
//! Statements are assembled with `sqlx::QueryBuilder`: identifiers are validated and
//! quoted, every value is a bind parameter.

use sqlx::sqlite::{SqliteRow, SqliteValueRef};
use sqlx::{Column, QueryBuilder, Row, Sqlite, TypeInfo, ValueRef};

use crate::db::coerce::decode_record;
use crate::db::mapper::{Record, RecordSchema};
use crate::db::models::{Filter, FilterOp, SortKey, SortOrder};
use crate::db::value::{Document, Value, format_time};
use crate::db::{StorageError, StorageResult};

/// Validate an identifier and wrap it in double quotes.
///
/// Only ASCII letters, digits and underscores are accepted, and the first character must
/// not be a digit.
pub(crate) fn quote_ident(name: &str) -> StorageResult<String> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StorageError::invalid_query(format!(
            "invalid SQL identifier '{}'",
            name
        )));
    }
    Ok(format!("\"{}\"", name))
}

/// Quoted column for a caller-supplied field name.
pub(crate) fn column(schema: &RecordSchema, field: &str) -> StorageResult<String> {
    quote_ident(schema.key_of(field)?)
}

/// Bind a value using the SQLite storage class that fits it.
///
/// Times are stored as RFC3339 text, object ids as hex, composites as JSON text.
pub(crate) fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: Value) {
    match value {
        Value::Null => qb.push_bind(None::<String>),
        Value::Bool(b) => qb.push_bind(b),
        Value::Int(i) => qb.push_bind(i),
        Value::UInt(u) => match i64::try_from(u) {
            Ok(i) => qb.push_bind(i),
            Err(_) => qb.push_bind(u.to_string()),
        },
        Value::Float(f) => qb.push_bind(f),
        Value::Text(s) => qb.push_bind(s),
        Value::Bytes(b) => qb.push_bind(b),
        Value::Time(t) => qb.push_bind(format_time(&t)),
        Value::ObjectId(oid) => qb.push_bind(oid.to_hex()),
        composite @ (Value::Array(_) | Value::Document(_)) => {
            qb.push_bind(composite.to_json().to_string())
        }
    };
}

/// Append ` WHERE ...` for an AND-combined filter list; nothing when the list is empty.
pub(crate) fn push_filters(
    qb: &mut QueryBuilder<'_, Sqlite>,
    schema: &RecordSchema,
    filters: &[Filter],
) -> StorageResult<()> {
    for (i, filter) in filters.iter().enumerate() {
        qb.push(if i == 0 { " WHERE " } else { " AND " });
        push_predicate(qb, schema, filter)?;
    }
    Ok(())
}

fn push_predicate(
    qb: &mut QueryBuilder<'_, Sqlite>,
    schema: &RecordSchema,
    filter: &Filter,
) -> StorageResult<()> {
    let col = column(schema, &filter.field)?;
    match (&filter.op, &filter.value) {
        (FilterOp::Eq, Value::Null) => {
            qb.push(col).push(" IS NULL");
        }
        (FilterOp::Ne, Value::Null) => {
            qb.push(col).push(" IS NOT NULL");
        }
        (FilterOp::In, Value::Array(items)) if items.is_empty() => {
            qb.push("1 = 0");
        }
        (FilterOp::In, Value::Array(items)) => {
            qb.push(col).push(" IN (");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_value(qb, item.clone());
            }
            qb.push(")");
        }
        (FilterOp::In, other) => {
            return Err(StorageError::invalid_query(format!(
                "IN filter on '{}' needs an array, got {}",
                filter.field,
                other.type_name()
            )));
        }
        (_, Value::Null) => {
            return Err(StorageError::invalid_query(format!(
                "cannot order-compare '{}' against null",
                filter.field
            )));
        }
        (op, value) => {
            let symbol = match op {
                FilterOp::Eq => " = ",
                FilterOp::Ne => " <> ",
                FilterOp::Gt => " > ",
                FilterOp::Gte => " >= ",
                FilterOp::Lt => " < ",
                FilterOp::Lte => " <= ",
                FilterOp::In => " IN ",
            };
            qb.push(col).push(symbol);
            push_value(qb, value.clone());
        }
    }
    Ok(())
}

/// Append ` ORDER BY ...`; an empty key list orders by the identifier column.
pub(crate) fn push_order(
    qb: &mut QueryBuilder<'_, Sqlite>,
    schema: &RecordSchema,
    sort: &[SortKey],
    default_column: &str,
) -> StorageResult<()> {
    if sort.is_empty() {
        qb.push(" ORDER BY ").push(default_column).push(" ASC");
        return Ok(());
    }
    for (i, key) in sort.iter().enumerate() {
        qb.push(if i == 0 { " ORDER BY " } else { ", " });
        let order = match key.order {
            SortOrder::Asc => " ASC",
            SortOrder::Desc => " DESC",
        };
        qb.push(column(schema, &key.field)?).push(order);
    }
    Ok(())
}

/// Append LIMIT/OFFSET.
/// Note: SQL requires LIMIT when using OFFSET. If offset is provided without limit,
/// we use LIMIT -1 (SQLite's "no limit" value).
pub(crate) fn push_limit_offset(qb: &mut QueryBuilder<'_, Sqlite>, limit: Option<usize>, offset: usize) {
    match limit {
        Some(limit) => {
            qb.push(" LIMIT ").push_bind(to_sql_int(limit));
        }
        None if offset > 0 => {
            qb.push(" LIMIT -1");
        }
        None => {}
    }
    if offset > 0 {
        qb.push(" OFFSET ").push_bind(to_sql_int(offset));
    }
}

fn to_sql_int(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Column list for a projection; empty selects `*`.
pub(crate) fn select_list(schema: &RecordSchema, fields: &[String]) -> StorageResult<String> {
    if fields.is_empty() {
        return Ok("*".to_string());
    }
    let columns = fields
        .iter()
        .map(|f| column(schema, f))
        .collect::<StorageResult<Vec<_>>>()?;
    Ok(columns.join(", "))
}

/// Escape LIKE wildcards so the search term matches literally (`ESCAPE '\'`).
pub(crate) fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

enum StorageClass {
    Null,
    Integer,
    Real,
    Blob,
    Text,
}

fn storage_class(raw: &SqliteValueRef<'_>) -> StorageClass {
    if raw.is_null() {
        return StorageClass::Null;
    }
    match raw.type_info().name() {
        "INTEGER" | "BOOLEAN" => StorageClass::Integer,
        "REAL" => StorageClass::Real,
        "BLOB" => StorageClass::Blob,
        "NULL" => StorageClass::Null,
        _ => StorageClass::Text,
    }
}

/// Read every column of a row into a document keyed by column name.
pub(crate) fn row_to_document(row: &SqliteRow) -> Result<Document, sqlx::Error> {
    let mut doc = Document::new();
    for (i, col) in row.columns().iter().enumerate() {
        let class = storage_class(&row.try_get_raw(i)?);
        let value = match class {
            StorageClass::Null => Value::Null,
            StorageClass::Integer => Value::Int(row.try_get_unchecked::<i64, _>(i)?),
            StorageClass::Real => Value::Float(row.try_get_unchecked::<f64, _>(i)?),
            StorageClass::Blob => Value::Bytes(row.try_get_unchecked::<Vec<u8>, _>(i)?),
            StorageClass::Text => Value::Text(row.try_get_unchecked::<String, _>(i)?),
        };
        doc.insert(col.name().to_string(), value);
    }
    Ok(doc)
}

/// Decode a row into a record, reporting failures as scan failures on `target`.
pub(crate) fn decode_row<T: Record>(
    target: &str,
    schema: &RecordSchema,
    row: &SqliteRow,
) -> StorageResult<T> {
    let doc = row_to_document(row).map_err(|e| StorageError::scan_failed(target, e))?;
    decode_record(schema, doc).map_err(|e| StorageError::scan_failed(target, e))
}
