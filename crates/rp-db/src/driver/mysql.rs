//! MySQL driver over an `sqlx` pool
//!
//! Statements are sent without bind arguments, so they travel over the text
//! protocol exactly as the formatter rendered them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;
use rp_core::DatabaseConfig;
use serde_json::Value;
use sqlx::error::ErrorKind;
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlDatabaseError, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Either, Executor, MySqlPool, Row, TypeInfo, ValueRef};

use super::{Driver, DriverConnection, PoolEvent, PoolEventListener, QueryOutput, Record};
use crate::error::DriverError;
use crate::escape::escape_value;
use crate::value::SqlValue;

/// The physical pool backed by `sqlx`
pub struct MySqlDriver {
    pool: MySqlPool,
    max_connections: u32,
    next_id: AtomicU64,
    listener: Arc<dyn PoolEventListener>,
}

impl MySqlDriver {
    /// Create the pool lazily; no connection is opened until the first acquire.
    ///
    /// Fits [`DriverFactory`](super::DriverFactory).
    pub fn create(
        config: &DatabaseConfig,
        listener: Arc<dyn PoolEventListener>,
    ) -> Result<Arc<dyn Driver>, DriverError> {
        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        let mut pool_options = MySqlPoolOptions::new()
            .max_connections(config.connection_limit)
            // sqlx bounds connection establishment by the acquire timeout
            .acquire_timeout(config.acquire_timeout().max(config.connect_timeout()));

        // the thread id only feeds debug logging
        if config.debug {
            let on_connect = listener.clone();
            pool_options = pool_options.after_connect(move |conn, _meta| {
                let listener = on_connect.clone();
                Box::pin(async move {
                    let thread_id = sqlx::query_scalar::<_, u64>("SELECT CONNECTION_ID()")
                        .fetch_one(&mut *conn)
                        .await;
                    if let Some(event) = connection_event(thread_id) {
                        listener.on_event(event);
                    }
                    Ok::<_, sqlx::Error>(())
                })
            });
        }
        let pool = pool_options.connect_lazy_with(options);

        tracing::info!(
            url = %config.display_url(),
            max_connections = config.connection_limit,
            "MySQL pool created"
        );

        Ok(Arc::new(Self {
            pool,
            max_connections: config.connection_limit,
            next_id: AtomicU64::new(0),
            listener,
        }))
    }

    fn is_exhausted(&self) -> bool {
        self.pool.num_idle() == 0 && self.pool.size() >= self.max_connections
    }
}

#[async_trait]
impl Driver for MySqlDriver {
    async fn acquire(&self) -> Result<Box<dyn DriverConnection>, DriverError> {
        if self.is_exhausted() {
            self.listener.on_event(PoolEvent::Enqueue);
        }
        let conn = self.pool.acquire().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.listener.on_event(PoolEvent::Acquire { connection_id: id });

        Ok(Box::new(MySqlConnection {
            id,
            conn,
            in_transaction: false,
            listener: self.listener.clone(),
        }))
    }

    fn escape(&self, value: &SqlValue) -> String {
        escape_value(value)
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.pool.close().await;
        tracing::info!("MySQL pool closed");
        Ok(())
    }
}

struct MySqlConnection {
    id: u64,
    conn: PoolConnection<MySql>,
    in_transaction: bool,
    listener: Arc<dyn PoolEventListener>,
}

impl MySqlConnection {
    async fn command(&mut self, sql: &str) -> Result<(), DriverError> {
        (&mut *self.conn).execute(sql).await?;
        Ok(())
    }
}

/// The `Connection` event for a new physical connection. A failed thread id
/// lookup is logged and skipped; it never fails the connect.
fn connection_event(thread_id: Result<u64, sqlx::Error>) -> Option<PoolEvent> {
    match thread_id {
        Ok(thread_id) => Some(PoolEvent::Connection { thread_id }),
        Err(e) => {
            tracing::warn!(error = %e, "Could not read the connection thread id");
            None
        }
    }
}

/// Whether a raw statement opens (`Some(true)`) or ends (`Some(false)`) a
/// transaction. Savepoint statements leave the transaction as it is.
fn transaction_effect(sql: &str) -> Option<bool> {
    let words: Vec<String> = sql
        .split(|c: char| c.is_whitespace() || c == ';')
        .filter(|word| !word.is_empty())
        .take(3)
        .map(str::to_ascii_uppercase)
        .collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["START", "TRANSACTION", ..] | ["BEGIN"] | ["BEGIN", "WORK"] => Some(true),
        ["COMMIT"] | ["COMMIT", "WORK"] | ["ROLLBACK"] | ["ROLLBACK", "WORK"] => Some(false),
        _ => None,
    }
}

#[async_trait]
impl DriverConnection for MySqlConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.command("START TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.command("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.command("ROLLBACK").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryOutput, DriverError> {
        let mut rows = Vec::new();
        let mut affected_rows = 0u64;
        let mut last_insert_id = None;

        let mut results = (&mut *self.conn).fetch_many(sql);
        while let Some(item) = results.try_next().await? {
            match item {
                Either::Left(done) => {
                    affected_rows += done.rows_affected();
                    if done.last_insert_id() > 0 {
                        last_insert_id = Some(done.last_insert_id());
                    }
                }
                Either::Right(row) => rows.push(row_to_record(&row)?),
            }
        }

        if let Some(open) = transaction_effect(sql) {
            self.in_transaction = open;
        }

        if rows.is_empty() {
            Ok(QueryOutput::done(affected_rows, last_insert_id))
        } else {
            Ok(QueryOutput::Rows(rows))
        }
    }

    fn release(self: Box<Self>) {
        let MySqlConnection {
            id,
            mut conn,
            in_transaction,
            listener,
        } = *self;
        listener.on_event(PoolEvent::Release { connection_id: id });

        if !in_transaction {
            // dropping a pool connection returns it to the pool
            drop(conn);
            return;
        }

        // never hand an open transaction to the next borrower
        tracing::warn!(
            connection_id = id,
            "Releasing connection with an open transaction, rolling back"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = (&mut *conn).execute("ROLLBACK").await {
                        tracing::error!(
                            connection_id = id,
                            error = %e,
                            "Rollback on release failed, closing connection"
                        );
                        let _ = conn.detach();
                    }
                });
            }
            Err(_) => {
                let _ = conn.detach();
            }
        }
    }
}

fn row_to_record(row: &MySqlRow) -> Result<Record, DriverError> {
    let mut record = Record::new();
    for column in row.columns() {
        let index = column.ordinal();
        let value = if row.try_get_raw(index)?.is_null() {
            Value::Null
        } else {
            decode_column(row, index, column.type_info().name())?
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn decode_column(row: &MySqlRow, index: usize, type_name: &str) -> Result<Value, sqlx::Error> {
    let type_name = type_name.to_ascii_uppercase();
    let value = match type_name.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get_unchecked::<bool, _>(index)?),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => {
            Value::from(row.try_get_unchecked::<i64, _>(index)?)
        }
        t if t.ends_with("UNSIGNED") => Value::from(row.try_get_unchecked::<u64, _>(index)?),
        "FLOAT" | "DOUBLE" => serde_json::Number::from_f64(row.try_get_unchecked::<f64, _>(index)?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        "JSON" => {
            let text = row.try_get_unchecked::<String, _>(index)?;
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        }
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT"
        | "GEOMETRY" => {
            let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }
        // DECIMAL, DATE, DATETIME, TIMESTAMP, TIME and all text types
        _ => Value::String(row.try_get_unchecked::<String, _>(index)?),
    };
    Ok(value)
}

impl From<sqlx::Error> for DriverError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) => {
                let mut driver = DriverError::new(db_err.message()).with_code(match db_err.kind() {
                    ErrorKind::UniqueViolation => "UNIQUE_VIOLATION",
                    ErrorKind::ForeignKeyViolation => "FOREIGN_KEY_VIOLATION",
                    ErrorKind::NotNullViolation => "NOT_NULL_VIOLATION",
                    ErrorKind::CheckViolation => "CHECK_VIOLATION",
                    _ => "DATABASE",
                });
                if let Some(mysql) = db_err.try_downcast_ref::<MySqlDatabaseError>() {
                    driver = driver.with_errno(u32::from(mysql.number()));
                }
                if let Some(state) = db_err.code() {
                    driver = driver.with_sql_state(state.into_owned());
                }
                driver
            }
            sqlx::Error::PoolTimedOut => DriverError::new(err.to_string()).with_code("POOL_TIMED_OUT"),
            sqlx::Error::PoolClosed => DriverError::new(err.to_string()).with_code("POOL_CLOSED"),
            sqlx::Error::Io(_) => DriverError::new(err.to_string()).with_code("IO"),
            sqlx::Error::Tls(_) => DriverError::new(err.to_string()).with_code("TLS"),
            sqlx::Error::Protocol(_) => DriverError::new(err.to_string()).with_code("PROTOCOL"),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                DriverError::new(err.to_string()).with_code("DECODE")
            }
            _ => DriverError::new(err.to_string()).with_code("DRIVER"),
        }
    }
}
