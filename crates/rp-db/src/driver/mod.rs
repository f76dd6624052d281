//! Driver seam
//!
//! The physical pool and the wire protocol live behind these traits. The
//! rest of the crate never talks to `sqlx` directly.

use std::sync::Arc;

use async_trait::async_trait;
use rp_core::DatabaseConfig;
use serde::Serialize;

use crate::error::DriverError;
use crate::value::SqlValue;

pub mod memory;
pub mod mysql;

pub use memory::{MemoryCall, MemoryDriver};
pub use mysql::MySqlDriver;

/// One result row, column name -> value
pub type Record = serde_json::Map<String, serde_json::Value>;

/// Raw result of one statement
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryOutput {
    /// The statement produced a result set
    Rows(Vec<Record>),
    /// The statement completed without rows
    Done {
        #[serde(rename = "affectedRows")]
        affected_rows: u64,
        #[serde(rename = "insertId")]
        last_insert_id: Option<u64>,
    },
}

impl Default for QueryOutput {
    fn default() -> Self {
        QueryOutput::Done {
            affected_rows: 0,
            last_insert_id: None,
        }
    }
}

impl QueryOutput {
    pub fn rows(rows: impl IntoIterator<Item = Record>) -> Self {
        QueryOutput::Rows(rows.into_iter().collect())
    }

    pub fn done(affected_rows: u64, last_insert_id: Option<u64>) -> Self {
        QueryOutput::Done {
            affected_rows,
            last_insert_id,
        }
    }

    pub fn affected_rows(&self) -> Option<u64> {
        match self {
            QueryOutput::Done { affected_rows, .. } => Some(*affected_rows),
            QueryOutput::Rows(_) => None,
        }
    }

    pub fn last_insert_id(&self) -> Option<u64> {
        match self {
            QueryOutput::Done { last_insert_id, .. } => *last_insert_id,
            QueryOutput::Rows(_) => None,
        }
    }
}

/// Lifecycle events of the physical pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// A connection was handed out. `connection_id` identifies the lease.
    Acquire { connection_id: u64 },
    /// A new physical connection was opened. `thread_id` is the server side id.
    Connection { thread_id: u64 },
    /// A connection went back into the pool
    Release { connection_id: u64 },
    /// An acquisition had to wait because the pool was exhausted
    Enqueue,
}

/// Observer of pool lifecycle events. Must not block.
pub trait PoolEventListener: Send + Sync {
    fn on_event(&self, event: PoolEvent);
}

/// The physical connection pool
#[async_trait]
pub trait Driver: Send + Sync {
    /// Acquire a physical connection, waiting in FIFO order when exhausted
    async fn acquire(&self) -> Result<Box<dyn DriverConnection>, DriverError>;

    /// Escape a single value into an inline SQL literal
    fn escape(&self, value: &SqlValue) -> String;

    /// Close every connection and stop handing out new ones
    async fn shutdown(&self) -> Result<(), DriverError>;
}

/// One physical connection leased from a [`Driver`]
#[async_trait]
pub trait DriverConnection: Send {
    /// Lease id, matches the ids in [`PoolEvent::Acquire`] and [`PoolEvent::Release`]
    fn id(&self) -> u64;

    async fn begin(&mut self) -> Result<(), DriverError>;

    async fn commit(&mut self) -> Result<(), DriverError>;

    async fn rollback(&mut self) -> Result<(), DriverError>;

    /// Execute an already rendered statement
    async fn query(&mut self, sql: &str) -> Result<QueryOutput, DriverError>;

    /// Give the connection back to the pool
    fn release(self: Box<Self>);
}

/// Builds a driver for a configuration. The listener receives the pool's
/// lifecycle events.
pub type DriverFactory = dyn Fn(&DatabaseConfig, Arc<dyn PoolEventListener>) -> Result<Arc<dyn Driver>, DriverError>
    + Send
    + Sync;
