//! Process-wide pool lifecycle
//!
//! Owns the single [`ConnectionPool`] of the process: created once at
//! bootstrap, shut down once at exit.

use std::sync::Arc;

use parking_lot::RwLock;
use rp_core::DatabaseConfig;
use tracing::Span;

use crate::connection::PooledConnection;
use crate::driver::DriverFactory;
use crate::error::{DbError, DbResult};
use crate::pool::ConnectionPool;

pub struct DatabasePoolService {
    pool: RwLock<Option<Arc<ConnectionPool>>>,
    factory: Arc<DriverFactory>,
    span: Span,
}

impl DatabasePoolService {
    pub fn new(factory: Arc<DriverFactory>, span: Span) -> Self {
        Self {
            pool: RwLock::new(None),
            factory,
            span,
        }
    }

    /// Create the pool. Without a configuration no pool is created and the
    /// configuration error is returned after it has been logged.
    pub fn bootstrap(&self, config: Option<DatabaseConfig>) -> DbResult<()> {
        tracing::info!(parent: &self.span, "Creating database pool...");
        let config = match config {
            Some(config) => config,
            None => {
                tracing::error!(parent: &self.span, "Config for DB is required...");
                return Err(DbError::Config("database configuration is missing".into()));
            }
        };
        if let Err(e) = config.validate() {
            tracing::error!(parent: &self.span, error = %e, "Invalid database configuration");
            return Err(DbError::Config(e.to_string()));
        }

        tracing::debug!(
            parent: &self.span,
            database = %config.database,
            tables = ?config.tables,
            "Table map"
        );

        let pool = ConnectionPool::create(config, self.factory.as_ref(), self.span.clone())?;
        *self.pool.write() = Some(Arc::new(pool));
        tracing::info!(parent: &self.span, "Created database pool");
        Ok(())
    }

    pub fn pool(&self) -> Option<Arc<ConnectionPool>> {
        self.pool.read().clone()
    }

    /// A new, unopened connection from the pool
    pub fn get_connection(&self) -> DbResult<Arc<PooledConnection>> {
        self.pool
            .read()
            .as_ref()
            .map(|pool| pool.get_connection())
            .ok_or(DbError::PoolUnavailable)
    }

    /// Shut the pool down. Idempotent.
    pub async fn shutdown(&self) -> DbResult<()> {
        let pool = self.pool.write().take();
        if let Some(pool) = pool {
            tracing::info!(parent: &self.span, "Stopping database pool...");
            pool.shutdown().await?;
            tracing::info!(parent: &self.span, "Stopped database pool");
        }
        Ok(())
    }
}

impl std::fmt::Debug for DatabasePoolService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabasePoolService")
            .field("pool", &self.pool.read().is_some())
            .finish_non_exhaustive()
    }
}
