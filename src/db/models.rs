//! Request and response shapes shared by every repository.
//!
//! These types are backend-agnostic: the SQL and document repositories lower
//! [`PaginationOptions`] and [`Filter`] into their native constructs and return the same
//! [`Paginated`] envelope and [`BulkResponse`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::Value;

/// Default page size when none is given.
pub const DEFAULT_PAGE_SIZE: usize = 20;

// =============================================================================
// Filtering and Sorting
// =============================================================================

/// Sort order for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// One ordering key. Keys apply in sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Comparison operator of a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterOp {
    #[default]
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Membership; the value must be an array.
    In,
}

/// Atomic predicate. A filter list is always AND-combined.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn is_in<V: Into<Value>>(field: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self::new(
            field,
            FilterOp::In,
            Value::Array(values.into_iter().map(Into::into).collect()),
        )
    }
}

/// Render a filter list for not-found messages.
pub(crate) fn describe_filters(filters: &[Filter]) -> String {
    if filters.is_empty() {
        return "<any>".to_string();
    }
    filters
        .iter()
        .map(|f| format!("{} {:?} {}", f.field, f.op, f.value))
        .collect::<Vec<_>>()
        .join(" AND ")
}

// =============================================================================
// Pagination
// =============================================================================

/// Input of a paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct PaginationOptions {
    /// 1-based page number; 0 is treated as 1.
    pub page: usize,
    pub page_size: usize,
    /// Ordering keys; empty means order by the identifier field.
    pub sort: Vec<SortKey>,
    pub filters: Vec<Filter>,
    /// Projection; empty selects every mapped field.
    pub fields: Vec<String>,
}

impl Default for PaginationOptions {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            sort: Vec::new(),
            filters: Vec::new(),
            fields: Vec::new(),
        }
    }
}

impl PaginationOptions {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page,
            page_size,
            ..Self::default()
        }
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order,
        });
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn select<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn page_number(&self) -> usize {
        self.page.max(1)
    }

    /// Rows to skip: `(page - 1) * page_size`.
    pub fn offset(&self) -> usize {
        (self.page_number() - 1).saturating_mul(self.page_size)
    }
}

/// Page metadata of a [`Paginated`] result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub number: usize,
    pub size: usize,
    pub total: usize,
    pub pages: usize,
    pub has_next: bool,
    pub has_previous: bool,
}

impl PageInfo {
    pub fn new(number: usize, size: usize, total: usize) -> Self {
        let number = number.max(1);
        let pages = if size > 0 { total.div_ceil(size) } else { 0 };
        Self {
            number,
            size,
            total,
            pages,
            has_next: number < pages,
            has_previous: number > 1,
        }
    }
}

/// One page of records plus metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paginated<T> {
    pub data: Vec<T>,
    pub page: PageInfo,
    pub empty: bool,
}

impl<T> Paginated<T> {
    pub fn new(data: Vec<T>, number: usize, size: usize, total: usize) -> Self {
        let empty = data.is_empty();
        Self {
            data,
            page: PageInfo::new(number, size, total),
            empty,
        }
    }
}

/// Bounds of a search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Fields matched by the SQL substring search. The document store searches its text
    /// index and ignores this list.
    pub fields: Vec<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl SearchOptions {
    pub fn in_fields<S: Into<String>>(fields: impl IntoIterator<Item = S>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

// =============================================================================
// Bulk Results
// =============================================================================

/// Why a bulk item was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The item's identifier field was unset.
    MissingIdentifier,
    /// No stored record carries the item's identifier.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedItem {
    /// Position in the request.
    pub index: usize,
    pub reason: SkipReason,
}

/// Outcome of a bulk operation that completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResponse {
    pub requested: usize,
    /// Request positions that were written.
    pub applied: Vec<usize>,
    pub skipped: Vec<SkippedItem>,
}

impl BulkResponse {
    pub fn new(requested: usize) -> Self {
        Self {
            requested,
            ..Self::default()
        }
    }

    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty() && self.applied.len() == self.requested
    }

    pub(crate) fn skip(&mut self, index: usize, reason: SkipReason) {
        self.skipped.push(SkippedItem { index, reason });
    }
}

// =============================================================================
// Change Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Replace,
}

/// A typed change notification from a document collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    pub operation: OperationKind,
    /// Present for updates and deletes.
    pub previous: Option<T>,
    /// Present for inserts, updates and replaces.
    pub current: Option<T>,
    pub timestamp: DateTime<Utc>,
}
