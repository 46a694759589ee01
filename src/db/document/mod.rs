//! Document-store backend.
//!
//! - `collection`: the [`Collection`] driver trait and its request/response types
//! - `filter`: backend-key queries, sorting and projection
//! - `memory`: [`MemoryCollection`], an in-process driver with a change log
//! - `repository`: [`DocumentRepository`], the typed repository over any driver
//! - `transaction`: staged writes committed as one atomic batch
//! - `watch`: [`ChangeFeed`], the typed change stream

mod binding;
mod collection;
mod filter;
mod memory;
mod repository;
mod transaction;
mod watch;

#[cfg(test)]
mod repository_test;
#[cfg(test)]
mod watch_test;

pub use collection::{
    BulkWriteFailure, BulkWriteOptions, BulkWriteOutcome, ChangeNotification, ChangeStream,
    Collection, DocumentError, FindOptions, NATIVE_ID_KEY, WriteModel, WriteResult,
};
pub use filter::{Condition, Query};
pub use memory::MemoryCollection;
pub use repository::DocumentRepository;
pub use transaction::DocumentTransaction;
pub use watch::ChangeFeed;
