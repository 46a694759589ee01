//! Storage layer with one repository contract over two backends.
//!
//! Callers program against [`Repository`] and [`Transactional`]; the SQL
//! ([`SqlRepository`]) and document ([`DocumentRepository`]) implementations are
//! swappable without changing business logic.
//!
//! # Architecture
//!
//! - `error`: backend-agnostic error taxonomy
//! - `value`: raw values exchanged with drivers ([`Value`], [`Document`], [`ObjectId`])
//! - `mapper`: record field descriptors, derived from serde and cached per type
//! - `coerce` / `encode`: reading driver values into records and records into values
//! - `models`: pagination, filters, bulk results and change events
//! - `query`: fluent [`QueryBuilder`]
//! - `repository`: trait definitions for data access
//! - `sqlite` / `document`: the two backends

mod cancel;
mod coerce;
mod encode;
mod error;
mod mapper;
mod models;
mod query;
mod repository;
mod value;

pub mod document;
pub mod sqlite;


pub use cancel::run_cancellable;
pub use coerce::{assign, coerce, decode_record, parse_time};
pub use document::{
    ChangeFeed, Collection, DocumentError, DocumentRepository, DocumentTransaction,
    MemoryCollection,
};
pub use encode::{encode_document, encode_record, to_value};
pub use error::{BackendError, ErrorKind, StorageError, StorageResult};
pub use mapper::{FieldDescriptor, FieldKind, Record, RecordSchema, describe};
pub use models::*;
pub use query::QueryBuilder;
pub use repository::*;
pub use sqlite::{DEFAULT_ID_FIELD, SqlRepository, SqlTransaction, SqliteDatabase};
pub use value::{Document, InvalidObjectId, ObjectId, Timestamp, Value};
