//! Pooled connection
//!
//! A [`PooledConnection`] is the unit of work of one business operation. The
//! physical connection is taken from the driver on the first statement and
//! kept for every statement after it, so all statements of one operation share
//! one session and one transaction. Releasing hands the physical connection
//! back exactly once; after that every operation fails with
//! [`DbError::ConnectionReleased`] and nothing reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rp_core::TableMap;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::Span;

use crate::driver::{Driver, DriverConnection, QueryOutput};
use crate::error::{DbError, DbResult, DriverError};
use crate::formatter::QueryFormatter;
use crate::value::Params;

/// Lifecycle of a [`PooledConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No physical connection taken yet
    Unopened,
    /// Holding a physical connection
    Open,
    /// Given back; terminal
    Released,
}

enum Slot {
    Unopened,
    Open(Box<dyn DriverConnection>),
    Released,
}

impl Slot {
    fn close(&mut self) -> bool {
        match std::mem::replace(self, Slot::Released) {
            Slot::Open(conn) => {
                conn.release();
                true
            }
            _ => false,
        }
    }
}

enum Command<'a> {
    Begin,
    Commit,
    Rollback,
    Query(&'a str),
}

/// One logical connection of one business operation
pub struct PooledConnection {
    driver: Arc<dyn Driver>,
    formatter: QueryFormatter,
    tables: Arc<TableMap>,
    slot: Mutex<Slot>,
    released: AtomicBool,
    span: Span,
}

impl PooledConnection {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        formatter: QueryFormatter,
        tables: Arc<TableMap>,
        span: Span,
    ) -> Self {
        Self {
            driver,
            formatter,
            tables,
            slot: Mutex::new(Slot::Unopened),
            released: AtomicBool::new(false),
            span,
        }
    }

    /// Current state. A connection busy with a statement reports `Open`.
    pub fn state(&self) -> ConnectionState {
        if self.released.load(Ordering::SeqCst) {
            return ConnectionState::Released;
        }
        match self.slot.try_lock() {
            Ok(slot) => match *slot {
                Slot::Unopened => ConnectionState::Unopened,
                Slot::Open(_) => ConnectionState::Open,
                Slot::Released => ConnectionState::Released,
            },
            Err(_) => ConnectionState::Open,
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub async fn start_transaction(&self) -> DbResult<()> {
        self.run("Start transaction", Command::Begin).await?;
        Ok(())
    }

    pub async fn commit(&self) -> DbResult<()> {
        self.run("Commit", Command::Commit).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> DbResult<()> {
        self.run("Rollback", Command::Rollback).await?;
        Ok(())
    }

    /// Rows decoded into `T`. A statement without a result set yields no rows.
    pub async fn select<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<Vec<T>> {
        match self.execute("Select", sql, params.into()).await? {
            QueryOutput::Rows(rows) => rows
                .into_iter()
                .map(|row| {
                    serde_json::from_value(serde_json::Value::Object(row)).map_err(DbError::from)
                })
                .collect(),
            QueryOutput::Done { .. } => Ok(Vec::new()),
        }
    }

    /// The first row decoded into `T`, if any
    pub async fn select_one<T: DeserializeOwned>(
        &self,
        sql: &str,
        params: impl Into<Params>,
    ) -> DbResult<Option<T>> {
        match self.execute("Select one", sql, params.into()).await? {
            QueryOutput::Rows(rows) => match rows.into_iter().next() {
                Some(row) => Ok(Some(serde_json::from_value(serde_json::Value::Object(row))?)),
                None => Ok(None),
            },
            QueryOutput::Done { .. } => Ok(None),
        }
    }

    /// The generated id, `NaN` when the statement generated none
    pub async fn insert(&self, sql: &str, params: impl Into<Params>) -> DbResult<f64> {
        let output = self.execute("Insert", sql, params.into()).await?;
        Ok(positive_or_nan(output.last_insert_id()))
    }

    /// The number of affected rows, `NaN` when none
    pub async fn update(&self, sql: &str, params: impl Into<Params>) -> DbResult<f64> {
        let output = self.execute("Update", sql, params.into()).await?;
        Ok(positive_or_nan(output.affected_rows()))
    }

    /// The number of deleted rows, `NaN` when none
    pub async fn delete(&self, sql: &str, params: impl Into<Params>) -> DbResult<f64> {
        let output = self.execute("Delete", sql, params.into()).await?;
        Ok(positive_or_nan(output.affected_rows()))
    }

    /// Raw driver output
    pub async fn query(&self, sql: &str, params: impl Into<Params>) -> DbResult<QueryOutput> {
        self.execute("Query", sql, params.into()).await
    }

    /// Hand the physical connection back to the pool.
    ///
    /// Idempotent. When a statement is in flight the connection goes back as
    /// soon as that statement finishes.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut slot) = self.slot.try_lock() {
            self.close(&mut slot);
        }
    }

    async fn execute(&self, action: &'static str, sql: &str, params: Params) -> DbResult<QueryOutput> {
        let values = params.merged_over(&self.tables);
        let statement = self.formatter.format(sql, &values);
        self.run(action, Command::Query(&statement)).await
    }

    async fn run(&self, action: &'static str, command: Command<'_>) -> DbResult<QueryOutput> {
        let mut slot = self.slot.lock().await;
        if self.released.load(Ordering::SeqCst) {
            self.close(&mut slot);
            return Err(DbError::ConnectionReleased);
        }

        if let Slot::Unopened = *slot {
            let conn = self
                .driver
                .acquire()
                .await
                .map_err(|e| self.driver_error("Get connection", e))?;
            tracing::debug!(parent: &self.span, connection_id = conn.id(), "Connection opened");
            *slot = Slot::Open(conn);

            // released while the driver was still handing out the connection
            if self.released.load(Ordering::SeqCst) {
                self.close(&mut slot);
                return Err(DbError::ConnectionReleased);
            }
        }

        let conn = match &mut *slot {
            Slot::Open(conn) => conn,
            _ => return Err(DbError::ConnectionReleased),
        };

        let result = match command {
            Command::Begin => conn.begin().await.map(|_| QueryOutput::default()),
            Command::Commit => conn.commit().await.map(|_| QueryOutput::default()),
            Command::Rollback => conn.rollback().await.map(|_| QueryOutput::default()),
            Command::Query(sql) => conn.query(sql).await,
        };

        if self.released.load(Ordering::SeqCst) {
            self.close(&mut slot);
        }
        drop(slot);

        // a release that raced with the end of this statement
        if self.released.load(Ordering::SeqCst) {
            if let Ok(mut slot) = self.slot.try_lock() {
                self.close(&mut slot);
            }
        }

        result.map_err(|e| self.driver_error(action, e))
    }

    fn close(&self, slot: &mut Slot) {
        if slot.close() {
            tracing::debug!(parent: &self.span, "Connection released");
        }
    }

    fn driver_error(&self, action: &str, err: DriverError) -> DbError {
        tracing::error!(
            parent: &self.span,
            errno = ?err.errno,
            sql_state = ?err.sql_state,
            code = ?err.code,
            "{} with error => {}",
            action,
            err.message
        );
        DbError::Driver(err)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
        if self.slot.get_mut().close() {
            tracing::debug!(parent: &self.span, "Connection released on drop");
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn positive_or_nan(value: Option<u64>) -> f64 {
    match value {
        Some(n) if n > 0 => n as f64,
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryCall, MemoryDriver, Record};
    use crate::escape::escape_value;
    use serde::Deserialize;
    use serde_json::json;

    fn connection(driver: &MemoryDriver, tables: TableMap) -> PooledConnection {
        let formatter = QueryFormatter::new(Arc::new(escape_value), false, Span::none());
        PooledConnection::new(
            Arc::new(driver.clone()),
            formatter,
            Arc::new(tables),
            Span::none(),
        )
    }

    fn row(value: serde_json::Value) -> Record {
        match value {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct User {
        id: i64,
        name: String,
    }

    #[tokio::test]
    async fn test_opens_lazily_and_once() {
        let driver = MemoryDriver::new();
        let conn = connection(&driver, TableMap::new());
        assert_eq!(conn.state(), ConnectionState::Unopened);
        assert_eq!(driver.acquire_count(), 0);

        conn.start_transaction().await.unwrap();
        conn.query("SELECT 1", ()).await.unwrap();
        conn.commit().await.unwrap();

        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(driver.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_release_is_idempotent_and_final() {
        let driver = MemoryDriver::new();
        let conn = connection(&driver, TableMap::new());
        conn.query("SELECT 1", ()).await.unwrap();

        conn.release();
        conn.release();
        assert_eq!(conn.state(), ConnectionState::Released);
        assert_eq!(driver.release_count(), 1);

        let err = conn.query("SELECT 1", ()).await.unwrap_err();
        assert!(matches!(err, DbError::ConnectionReleased));
        assert!(matches!(conn.commit().await, Err(DbError::ConnectionReleased)));
        assert_eq!(driver.acquire_count(), 1);
    }

    #[tokio::test]
    async fn test_release_before_open_never_acquires() {
        let driver = MemoryDriver::new();
        let conn = connection(&driver, TableMap::new());
        conn.release();

        assert!(matches!(conn.start_transaction().await, Err(DbError::ConnectionReleased)));
        assert_eq!(driver.acquire_count(), 0);
        assert_eq!(driver.release_count(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases() {
        let driver = MemoryDriver::new();
        {
            let conn = connection(&driver, TableMap::new());
            conn.query("SELECT 1", ()).await.unwrap();
        }
        assert_eq!(driver.release_count(), 1);
        assert_eq!(driver.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_params_win_over_tables() {
        let driver = MemoryDriver::new();
        let tables = TableMap::from([
            ("user".to_string(), "t_user".to_string()),
            ("role".to_string(), "t_role".to_string()),
        ]);
        let conn = connection(&driver, tables);

        conn.query(
            "SELECT * FROM table(user) JOIN table(role) WHERE id={id}",
            Params::new().set("id", 7).set("role", "t_role_archive"),
        )
        .await
        .unwrap();

        assert_eq!(
            driver.statements(),
            vec!["SELECT * FROM t_user JOIN t_role_archive WHERE id=7"]
        );
    }

    #[tokio::test]
    async fn test_select_decodes_rows() {
        let driver = MemoryDriver::new();
        driver.push_response(QueryOutput::rows(vec![
            row(json!({ "id": 1, "name": "ada" })),
            row(json!({ "id": 2, "name": "grace" })),
        ]));
        driver.push_response(QueryOutput::done(0, None));
        let conn = connection(&driver, TableMap::new());

        let users: Vec<User> = conn.select("SELECT * FROM users", ()).await.unwrap();
        assert_eq!(users.len(), 2);
        assert_eq!(users[1].name, "grace");

        let none: Vec<User> = conn.select("SET @x = 1", ()).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_select_one() {
        let driver = MemoryDriver::new();
        driver.push_response(QueryOutput::rows(vec![row(json!({ "id": 3, "name": "lin" }))]));
        driver.push_response(QueryOutput::rows(Vec::new()));
        let conn = connection(&driver, TableMap::new());

        let user: Option<User> = conn.select_one("SELECT 1", ()).await.unwrap();
        assert_eq!(user, Some(User { id: 3, name: "lin".into() }));

        let user: Option<User> = conn.select_one("SELECT 1", ()).await.unwrap();
        assert_eq!(user, None);
    }

    #[tokio::test]
    async fn test_decode_failure_is_distinct() {
        let driver = MemoryDriver::new();
        driver.push_response(QueryOutput::rows(vec![row(json!({ "id": "x" }))]));
        let conn = connection(&driver, TableMap::new());

        let err = conn.select::<User>("SELECT 1", ()).await.unwrap_err();
        assert!(matches!(err, DbError::Decode(_)));
    }

    #[tokio::test]
    async fn test_write_results_and_nan() {
        let driver = MemoryDriver::new();
        driver.push_response(QueryOutput::done(1, Some(42)));
        driver.push_response(QueryOutput::done(1, None));
        driver.push_response(QueryOutput::done(3, None));
        driver.push_response(QueryOutput::done(0, None));
        driver.push_response(QueryOutput::done(2, None));
        driver.push_response(QueryOutput::done(0, None));
        let conn = connection(&driver, TableMap::new());

        assert_eq!(conn.insert("INSERT", ()).await.unwrap(), 42.0);
        assert!(conn.insert("INSERT", ()).await.unwrap().is_nan());
        assert_eq!(conn.update("UPDATE", ()).await.unwrap(), 3.0);
        assert!(conn.update("UPDATE", ()).await.unwrap().is_nan());
        assert_eq!(conn.delete("DELETE", ()).await.unwrap(), 2.0);
        assert!(conn.delete("DELETE", ()).await.unwrap().is_nan());
    }

    #[tokio::test]
    async fn test_driver_error_is_reraised_unchanged() {
        let driver = MemoryDriver::new();
        let failure = DriverError::new("Duplicate entry '7' for key 'PRIMARY'")
            .with_errno(1062)
            .with_sql_state("23000")
            .with_code("UNIQUE_VIOLATION");
        driver.push_error(failure.clone());
        let conn = connection(&driver, TableMap::new());

        match conn.insert("INSERT", ()).await {
            Err(DbError::Driver(err)) => assert_eq!(err, failure),
            other => panic!("unexpected result: {:?}", other),
        }
        // the connection stays usable
        assert_eq!(conn.state(), ConnectionState::Open);
        conn.query("SELECT 1", ()).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_open_is_retried() {
        let driver = MemoryDriver::new();
        driver.fail_acquire(DriverError::new("too many connections").with_errno(1040));
        let conn = connection(&driver, TableMap::new());

        assert!(matches!(conn.query("SELECT 1", ()).await, Err(DbError::Driver(_))));
        assert_eq!(conn.state(), ConnectionState::Unopened);
    }

    #[tokio::test]
    async fn test_release_during_open_skips_the_statement() {
        let driver = MemoryDriver::new();
        driver.delay_acquire(std::time::Duration::from_millis(50));
        let conn = Arc::new(connection(&driver, TableMap::new()));

        let pending = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query("DELETE FROM t", ()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        conn.release();

        assert!(matches!(pending.await.unwrap(), Err(DbError::ConnectionReleased)));
        assert_eq!(driver.calls(), vec![MemoryCall::Acquire(1), MemoryCall::Release(1)]);
        assert_eq!(conn.state(), ConnectionState::Released);
        assert_eq!(driver.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_statements_serialize_on_one_connection() {
        let driver = MemoryDriver::new();
        let conn = Arc::new(connection(&driver, TableMap::new()));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let conn = conn.clone();
                tokio::spawn(async move { conn.query("SELECT {i}", Params::new().set("i", i)).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(driver.acquire_count(), 1);
        assert!(driver
            .calls()
            .iter()
            .all(|call| !matches!(call, MemoryCall::Query(id, _) if *id != 1)));
        assert_eq!(driver.statements().len(), 4);
    }
}
