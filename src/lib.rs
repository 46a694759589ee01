//! Typed repositories over relational and document stores.
//!
//! The [`db`] module exposes one repository contract, [`db::Repository`], with two
//! backends: SQLite through sqlx ([`db::SqlRepository`]) and a document collection
//! driver ([`db::DocumentRepository`]). Both map arbitrary serde record types to
//! backend rows/documents, paginate the same way and report failures through a single
//! [`db::StorageError`] taxonomy.

pub mod config;
pub mod db;
pub mod logging;
pub mod serde_utils;

pub use config::StorageConfig;
