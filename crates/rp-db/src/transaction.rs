//! Transaction handle
//!
//! Scopes begin/commit/rollback to the pooled connection of one operation.
//! [`Transaction::close`] is where an operation is declared finished: it
//! releases the connection back to the pool.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::connection::PooledConnection;
use crate::error::{DbError, DbResult};

/// Lifecycle of a [`Transaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    InTransaction,
    Committed,
    RolledBack,
    Closed,
}

struct Inner {
    connection: Option<Arc<PooledConnection>>,
    state: TransactionState,
}

/// Handle over the connection of one operation. Clones share the same state.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<Mutex<Inner>>,
}

impl Transaction {
    pub fn new(connection: Arc<PooledConnection>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                connection: Some(connection),
                state: TransactionState::Idle,
            })),
        }
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub async fn start_transaction(&self) -> DbResult<()> {
        self.connection()?.start_transaction().await?;
        self.set_state(TransactionState::InTransaction);
        Ok(())
    }

    pub async fn commit(&self) -> DbResult<()> {
        self.connection()?.commit().await?;
        self.set_state(TransactionState::Committed);
        Ok(())
    }

    pub async fn rollback(&self) -> DbResult<()> {
        self.connection()?.rollback().await?;
        self.set_state(TransactionState::RolledBack);
        Ok(())
    }

    /// Release the connection. Idempotent, never fails.
    pub fn close(&self) {
        let connection = {
            let mut inner = self.inner.lock();
            inner.state = TransactionState::Closed;
            inner.connection.take()
        };
        if let Some(connection) = connection {
            connection.release();
        }
    }

    fn connection(&self) -> DbResult<Arc<PooledConnection>> {
        self.inner
            .lock()
            .connection
            .clone()
            .ok_or(DbError::ConnectionReleased)
    }

    fn set_state(&self, state: TransactionState) {
        let mut inner = self.inner.lock();
        if inner.state != TransactionState::Closed {
            inner.state = state;
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state())
            .finish()
    }
}
