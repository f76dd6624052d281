//! # rp-db
//!
//! Scoped, transactional repository access over a pooled MySQL driver.
//!
//! This crate provides:
//!
//! - A SQL template formatter with `table(name)` and `{key}` placeholders
//! - The process-wide connection pool and its lifecycle service
//! - Lazily opened pooled connections with exactly-once release
//! - Repositories, the per-operation registry and the repository runner
//! - The [`DatabaseService`] facade business code starts from
//!
//! ## Example
//!
//! ```ignore
//! use rp_db::{DatabasePoolService, DatabaseService, MySqlDriver, RepositoryKind};
//!
//! let pool_service = Arc::new(DatabasePoolService::new(Arc::new(MySqlDriver::create), span.clone()));
//! pool_service.bootstrap(config.db.clone())?;
//! let db = DatabaseService::new(pool_service.clone(), span);
//!
//! let user = db
//!     .with_pool(&[RepositoryKind::of::<UserRepository>()])?
//!     .run(|registry, _tx| async move { registry.get::<UserRepository>()?.find(7).await })
//!     .await?;
//!
//! pool_service.shutdown().await?;
//! ```

pub mod connection;
pub mod driver;
pub mod error;
pub mod escape;
pub mod formatter;
pub mod pool;
pub mod pool_service;
pub mod repository;
pub mod runner;
pub mod service;
pub mod transaction;
pub mod value;

#[cfg(test)]
mod testing;

// Re-exports
pub use connection::{ConnectionState, PooledConnection};
pub use driver::{
    Driver, DriverConnection, DriverFactory, MemoryCall, MemoryDriver, MySqlDriver, PoolEvent,
    PoolEventListener, QueryOutput, Record,
};
pub use error::{DbError, DbResult, DriverError};
pub use escape::{escape_string, escape_value};
pub use formatter::{date_time_format, format, QueryFormatter, NULL_VALUE};
pub use pool::{ConnectionPool, LoggingEventListener};
pub use pool_service::DatabasePoolService;
pub use repository::{
    AnyRepository, FromRegistry, Repository, RepositoryBase, RepositoryKind, RepositoryRegistry,
};
pub use runner::RepositoryRunner;
pub use service::DatabaseService;
pub use transaction::{Transaction, TransactionState};
pub use value::{Params, SqlValue};
