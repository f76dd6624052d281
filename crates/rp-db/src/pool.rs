//! Connection pool
//!
//! Wraps the driver's physical pool. Handing out a [`PooledConnection`] does
//! not touch the network; the physical connection is taken on the first
//! statement.

use std::sync::Arc;

use rp_core::{DatabaseConfig, TableMap};
use tracing::Span;

use crate::connection::PooledConnection;
use crate::driver::{Driver, DriverFactory, PoolEvent, PoolEventListener};
use crate::error::DbResult;
use crate::formatter::QueryFormatter;
use crate::value::SqlValue;

/// Logs the pool lifecycle. Enqueue is always logged, the rest only in
/// debug mode.
pub struct LoggingEventListener {
    debug: bool,
    span: Span,
}

impl LoggingEventListener {
    pub fn new(debug: bool, span: Span) -> Self {
        Self { debug, span }
    }
}

impl PoolEventListener for LoggingEventListener {
    fn on_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Acquire { connection_id } if self.debug => {
                tracing::info!(parent: &self.span, connection_id, "Acquired connection [{}]", connection_id);
            }
            PoolEvent::Connection { thread_id } if self.debug => {
                tracing::debug!(parent: &self.span, thread_id, "Add connection [{}]", thread_id);
            }
            PoolEvent::Release { connection_id } if self.debug => {
                tracing::info!(parent: &self.span, connection_id, "Release connection [{}]", connection_id);
            }
            PoolEvent::Enqueue => {
                tracing::info!(parent: &self.span, "Enqueue a connection");
            }
            _ => {}
        }
    }
}

/// The database pool of the process
pub struct ConnectionPool {
    driver: Arc<dyn Driver>,
    formatter: QueryFormatter,
    tables: Arc<TableMap>,
    config: DatabaseConfig,
    span: Span,
}

impl ConnectionPool {
    /// Build the pool through `factory`, wiring the logging listener and the
    /// driver's escaping into the formatter.
    pub fn create(config: DatabaseConfig, factory: &DriverFactory, span: Span) -> DbResult<Self> {
        let listener: Arc<dyn PoolEventListener> =
            Arc::new(LoggingEventListener::new(config.debug, span.clone()));
        let driver = factory(&config, listener)?;

        let escaping = driver.clone();
        let formatter = QueryFormatter::new(
            Arc::new(move |value: &SqlValue| escaping.escape(value)),
            config.debug,
            span.clone(),
        );

        Ok(Self {
            driver,
            formatter,
            tables: Arc::new(config.tables.clone()),
            config,
            span,
        })
    }

    /// A new, unopened connection
    pub fn get_connection(&self) -> Arc<PooledConnection> {
        Arc::new(PooledConnection::new(
            self.driver.clone(),
            self.formatter.clone(),
            self.tables.clone(),
            self.span.clone(),
        ))
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn formatter(&self) -> &QueryFormatter {
        &self.formatter
    }

    /// Close every physical connection
    pub async fn shutdown(&self) -> DbResult<()> {
        self.driver.shutdown().await?;
        Ok(())
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
