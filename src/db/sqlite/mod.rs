//! SQLite implementation of the repository traits.
//!
//! [`SqlRepository`] maps records onto one table through sqlx. Every statement binds its
//! values; identifiers are validated against the record's field descriptors.

mod connection;
mod helpers;
mod repository;
mod statements;
mod transaction;

#[cfg(test)]
mod connection_test;
#[cfg(test)]
mod repository_test;
#[cfg(test)]
mod pagination_test;

pub use connection::SqliteDatabase;
pub use repository::{DEFAULT_ID_FIELD, SqlRepository};
pub use transaction::SqlTransaction;
