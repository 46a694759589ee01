//! Storage error types.
//!
//! One taxonomy for both backends: callers branch on [`StorageError::kind`] and never on
//! which backend raised the failure. It uses miette for diagnostic output and thiserror
//! for derive macros.

use miette::Diagnostic;
use thiserror::Error;

use crate::db::document::DocumentError;

/// Failure reported by the wrapped driver, or a mapping failure hit while reading its output.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),

    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error(transparent)]
    Mapping(Box<StorageError>),
}

impl From<StorageError> for BackendError {
    fn from(err: StorageError) -> Self {
        BackendError::Mapping(Box::new(err))
    }
}

/// Storage layer errors.
#[derive(Error, Diagnostic, Debug)]
pub enum StorageError {
    #[error("Invalid query: {message}")]
    #[diagnostic(code(record_store::db::invalid_query))]
    InvalidQuery { message: String },

    #[error("Record not found: {target} with id '{id}'")]
    #[diagnostic(code(record_store::db::record_not_found))]
    RecordNotFound { id: String, target: String },

    #[error("Type '{type_name}' is not a struct")]
    #[diagnostic(
        code(record_store::db::not_struct),
        help("records must be plain structs deriving Serialize and Deserialize")
    )]
    NotStruct { type_name: String },

    #[error("Invalid field mapping for '{type_name}': {message}")]
    #[diagnostic(code(record_store::db::invalid_mapping))]
    InvalidMapping { type_name: String, message: String },

    #[error("Cannot convert {source_type} into {dest_kind} for field '{field}'")]
    #[diagnostic(code(record_store::db::conversion))]
    Conversion {
        field: String,
        source_type: String,
        dest_kind: String,
    },

    #[error("Unsupported field type {kind} for field '{field}'")]
    #[diagnostic(code(record_store::db::unsupported_field_type))]
    UnsupportedFieldType { field: String, kind: String },

    #[error("Failed to decode field '{field}': {message}")]
    #[diagnostic(code(record_store::db::decode))]
    Decode { field: String, message: String },

    #[error("Failed to encode record: {message}")]
    #[diagnostic(code(record_store::db::encode))]
    Encode { message: String },

    #[error("Query failed on {target}: {source}")]
    #[diagnostic(code(record_store::db::query_failed))]
    QueryFailed {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Count failed on {target}: {source}")]
    #[diagnostic(code(record_store::db::count_failed))]
    CountFailed {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Scan failed on {target}: {source}")]
    #[diagnostic(code(record_store::db::scan_failed))]
    ScanFailed {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Exec failed on {target}: {source}")]
    #[diagnostic(code(record_store::db::exec_failed))]
    ExecFailed {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to begin transaction on {target}: {source}")]
    #[diagnostic(code(record_store::db::tx_begin_failed))]
    TxBeginFailed {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to commit transaction on {target}: {source}")]
    #[diagnostic(code(record_store::db::tx_commit_failed))]
    TxCommitFailed {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error("Failed to roll back transaction on {target}: {source}")]
    #[diagnostic(code(record_store::db::tx_rollback_failed))]
    TxRollbackFailed {
        target: String,
        #[source]
        source: BackendError,
    },

    #[error(
        "Bulk operation failed on {target} at item {index} ({applied} applied, rolled back: {rolled_back}): {source}"
    )]
    #[diagnostic(code(record_store::db::bulk_operation_failed))]
    BulkOperationFailed {
        target: String,
        index: usize,
        applied: usize,
        rolled_back: bool,
        #[source]
        source: Box<StorageError>,
    },

    #[error("Connection error: {message}")]
    #[diagnostic(code(record_store::db::connection))]
    Connection { message: String },

    #[error("Operation cancelled")]
    #[diagnostic(code(record_store::db::cancelled))]
    Cancelled,
}

/// Backend-independent classification of a [`StorageError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed request or record mapping; fix the call, never retry it.
    InvalidQuery,
    /// No record matched a point lookup, update or delete.
    NotFound,
    /// A backend value did not fit the destination field.
    Conversion,
    /// The driver failed executing a statement.
    Backend,
    /// Transaction lifecycle failure.
    Transaction,
    /// A batched write failed part way.
    Bulk,
    /// The caller cancelled the operation.
    Cancelled,
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::InvalidQuery { .. }
            | StorageError::NotStruct { .. }
            | StorageError::InvalidMapping { .. }
            | StorageError::Encode { .. } => ErrorKind::InvalidQuery,
            StorageError::RecordNotFound { .. } => ErrorKind::NotFound,
            StorageError::Conversion { .. }
            | StorageError::UnsupportedFieldType { .. }
            | StorageError::Decode { .. } => ErrorKind::Conversion,
            StorageError::ScanFailed {
                source: BackendError::Mapping(inner),
                ..
            } => inner.kind(),
            StorageError::QueryFailed { .. }
            | StorageError::CountFailed { .. }
            | StorageError::ScanFailed { .. }
            | StorageError::ExecFailed { .. }
            | StorageError::Connection { .. } => ErrorKind::Backend,
            StorageError::TxBeginFailed { .. }
            | StorageError::TxCommitFailed { .. }
            | StorageError::TxRollbackFailed { .. } => ErrorKind::Transaction,
            StorageError::BulkOperationFailed { .. } => ErrorKind::Bulk,
            StorageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// True for errors the caller must fix before trying again.
    pub fn is_caller_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::InvalidQuery | ErrorKind::Conversion)
    }

    pub(crate) fn invalid_query(message: impl Into<String>) -> Self {
        StorageError::InvalidQuery {
            message: message.into(),
        }
    }

    pub(crate) fn not_found(target: &str, id: impl std::fmt::Display) -> Self {
        StorageError::RecordNotFound {
            id: id.to_string(),
            target: target.to_string(),
        }
    }

    pub(crate) fn query_failed(target: &str, source: impl Into<BackendError>) -> Self {
        StorageError::QueryFailed {
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn count_failed(target: &str, source: impl Into<BackendError>) -> Self {
        StorageError::CountFailed {
            target: target.to_string(),
            source: source.into(),
        }
    }

    /// Row or document mapping failure; the conversion error keeps its own kind.
    pub(crate) fn scan_failed(target: &str, source: impl Into<BackendError>) -> Self {
        StorageError::ScanFailed {
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn exec_failed(target: &str, source: impl Into<BackendError>) -> Self {
        StorageError::ExecFailed {
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn tx_begin_failed(target: &str, source: impl Into<BackendError>) -> Self {
        StorageError::TxBeginFailed {
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn tx_commit_failed(target: &str, source: impl Into<BackendError>) -> Self {
        StorageError::TxCommitFailed {
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn tx_rollback_failed(target: &str, source: impl Into<BackendError>) -> Self {
        StorageError::TxRollbackFailed {
            target: target.to_string(),
            source: source.into(),
        }
    }

    pub(crate) fn bulk_failed(
        target: &str,
        index: usize,
        applied: usize,
        rolled_back: bool,
        source: StorageError,
    ) -> Self {
        StorageError::BulkOperationFailed {
            target: target.to_string(),
            index,
            applied,
            rolled_back,
            source: Box::new(source),
        }
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
