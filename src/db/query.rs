//! Query Builder.

use tracing::debug;

use super::models::{DEFAULT_PAGE_SIZE, Filter, FilterOp, PaginationOptions, SortKey, SortOrder};
use super::value::Value;

/// Fluent accumulator of filters, ordering and bounds. Performs no I/O.
///
/// ```
/// use record_store::db::{QueryBuilder, SortOrder};
///
/// let opts = QueryBuilder::new()
///     .where_eq("status", "open")
///     .order_by("priority", SortOrder::Desc)
///     .order_by("created_at", SortOrder::Asc)
///     .limit(10)
///     .offset(20)
///     .to_pagination_options();
///
/// assert_eq!(opts.page, 3);
/// assert_eq!(opts.sort.len(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryBuilder {
    filters: Vec<Filter>,
    sort: Vec<SortKey>,
    limit: Option<usize>,
    offset: usize,
    fields: Vec<String>,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn where_op(self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(field, op, value))
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.where_op(field, FilterOp::Eq, value)
    }

    /// Append an ordering key; earlier keys take precedence.
    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    pub fn select<S: Into<String>>(mut self, fields: impl IntoIterator<Item = S>) -> Self {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort
    }

    /// Lower into page-based options.
    ///
    /// The limit becomes the page size and the offset selects the page containing it,
    /// so an offset that is not a multiple of the limit rounds down to a page boundary.
    pub fn to_pagination_options(&self) -> PaginationOptions {
        let page_size = self.limit.unwrap_or(DEFAULT_PAGE_SIZE);
        let page = match page_size {
            0 => 1,
            size => self.offset / size + 1,
        };
        if page_size > 0 && self.offset % page_size != 0 {
            debug!(
                offset = self.offset,
                page_size,
                effective_offset = (page - 1) * page_size,
                "Offset rounded down to a page boundary"
            );
        }
        PaginationOptions {
            page,
            page_size,
            sort: self.sort.clone(),
            filters: self.filters.clone(),
            fields: self.fields.clone(),
        }
    }
}

impl From<QueryBuilder> for PaginationOptions {
    fn from(builder: QueryBuilder) -> Self {
        builder.to_pagination_options()
    }
}
