//! SQLite connection pool management.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, instrument};

use super::repository::SqlRepository;
use crate::config::StorageConfig;
use crate::db::mapper::Record;
use crate::db::{StorageError, StorageResult};

/// Owner of the sqlx pool that SQL repositories borrow connections from.
///
/// Schema management stays with the application; tables must exist before use.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Open (creating if needed) a database file.
    pub async fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(StorageConfig::default().max_connections)
            .connect_with(options)
            .await
            .map_err(connection_error)?;
        Ok(Self { pool })
    }

    /// Create an in-memory database (useful for testing).
    ///
    /// Each SQLite in-memory connection is its own database, so the pool holds exactly one
    /// connection that never expires.
    pub async fn in_memory() -> StorageResult<Self> {
        Self::connect(&StorageConfig::default()).await
    }

    /// Build the pool described by `config`.
    #[instrument(skip(config), fields(url = %config.database_url))]
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(connection_error)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool_options = if config.is_in_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(connection_error)?;
        info!("SQLite pool ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool, e.g. for schema setup.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Repository for `T` bound to `table`, keyed by the `id` field.
    pub fn repository<T: Record>(&self, table: &str) -> StorageResult<SqlRepository<T>> {
        SqlRepository::new(self.pool.clone(), table)
    }

    /// Repository for `T` bound to `table`, keyed by `id_field`.
    pub fn repository_keyed_by<T: Record>(
        &self,
        table: &str,
        id_field: &str,
    ) -> StorageResult<SqlRepository<T>> {
        SqlRepository::keyed_by(self.pool.clone(), table, id_field)
    }

    /// Close every pooled connection, waiting for checked-out ones to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn connection_error(e: sqlx::Error) -> StorageError {
    StorageError::Connection {
        message: e.to_string(),
    }
}
