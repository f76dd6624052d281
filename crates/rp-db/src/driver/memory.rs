//! In-memory driver for development and testing
//!
//! Records every call, answers queries from a scripted queue and can be told
//! to fail specific commands.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rp_core::DatabaseConfig;

use super::{Driver, DriverConnection, PoolEvent, PoolEventListener, QueryOutput};
use crate::error::DriverError;
use crate::escape::escape_value;
use crate::value::SqlValue;

/// A call observed by the [`MemoryDriver`]. Connection calls carry the lease id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryCall {
    Acquire(u64),
    Begin(u64),
    Commit(u64),
    Rollback(u64),
    Query(u64, String),
    Release(u64),
    Shutdown,
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<MemoryCall>,
    responses: VecDeque<Result<QueryOutput, DriverError>>,
    fail_acquire: Option<DriverError>,
    acquire_delay: Option<Duration>,
    fail_begin: Option<DriverError>,
    fail_commit: Option<DriverError>,
    fail_rollback: Option<DriverError>,
    open: HashSet<u64>,
    shut_down: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<MemoryState>,
    next_id: AtomicU64,
    listener: Mutex<Option<Arc<dyn PoolEventListener>>>,
}

impl Shared {
    fn emit(&self, event: PoolEvent) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.on_event(event);
        }
    }
}

/// Scripted in-memory driver. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    shared: Arc<Shared>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// A driver factory handing out this driver and wiring the pool's listener into it
    pub fn factory(
        &self,
    ) -> impl Fn(&DatabaseConfig, Arc<dyn PoolEventListener>) -> Result<Arc<dyn Driver>, DriverError>
           + Send
           + Sync
           + 'static {
        let driver = self.clone();
        move |_config, listener| {
            *driver.shared.listener.lock() = Some(listener);
            Ok(Arc::new(driver.clone()) as Arc<dyn Driver>)
        }
    }

    /// Queue the answer of the next query
    pub fn push_response(&self, output: QueryOutput) {
        self.shared.state.lock().responses.push_back(Ok(output));
    }

    /// Queue a failure as the answer of the next query
    pub fn push_error(&self, error: DriverError) {
        self.shared.state.lock().responses.push_back(Err(error));
    }

    pub fn fail_acquire(&self, error: DriverError) {
        self.shared.state.lock().fail_acquire = Some(error);
    }

    /// Make every acquire wait `delay` before handing out a connection
    pub fn delay_acquire(&self, delay: Duration) {
        self.shared.state.lock().acquire_delay = Some(delay);
    }

    pub fn fail_begin(&self, error: DriverError) {
        self.shared.state.lock().fail_begin = Some(error);
    }

    pub fn fail_commit(&self, error: DriverError) {
        self.shared.state.lock().fail_commit = Some(error);
    }

    pub fn fail_rollback(&self, error: DriverError) {
        self.shared.state.lock().fail_rollback = Some(error);
    }

    pub fn calls(&self) -> Vec<MemoryCall> {
        self.shared.state.lock().calls.clone()
    }

    /// Every rendered statement in execution order
    pub fn statements(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MemoryCall::Query(_, sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn acquire_count(&self) -> usize {
        self.count(|call| matches!(call, MemoryCall::Acquire(_)))
    }

    pub fn release_count(&self) -> usize {
        self.count(|call| matches!(call, MemoryCall::Release(_)))
    }

    /// Connections acquired and not yet released
    pub fn open_connections(&self) -> usize {
        self.shared.state.lock().open.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.state.lock().shut_down
    }

    fn count(&self, predicate: impl Fn(&MemoryCall) -> bool) -> usize {
        self.shared
            .state
            .lock()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn acquire(&self) -> Result<Box<dyn DriverConnection>, DriverError> {
        let delay = self.shared.state.lock().acquire_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let id = {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return Err(DriverError::new("Pool is closed").with_code("POOL_CLOSED"));
            }
            if let Some(error) = state.fail_acquire.clone() {
                return Err(error);
            }
            let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            state.calls.push(MemoryCall::Acquire(id));
            state.open.insert(id);
            id
        };
        self.shared.emit(PoolEvent::Connection { thread_id: id });
        self.shared.emit(PoolEvent::Acquire { connection_id: id });

        Ok(Box::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
        }))
    }

    fn escape(&self, value: &SqlValue) -> String {
        escape_value(value)
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        let mut state = self.shared.state.lock();
        state.shut_down = true;
        state.calls.push(MemoryCall::Shutdown);
        Ok(())
    }
}

struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
}

impl MemoryConnection {
    fn record(
        &self,
        call: MemoryCall,
        failure: impl FnOnce(&MemoryState) -> Option<DriverError>,
    ) -> Result<(), DriverError> {
        let mut state = self.shared.state.lock();
        state.calls.push(call);
        match failure(&*state) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DriverConnection for MemoryConnection {
    fn id(&self) -> u64 {
        self.id
    }

    async fn begin(&mut self) -> Result<(), DriverError> {
        self.record(MemoryCall::Begin(self.id), |s| s.fail_begin.clone())
    }

    async fn commit(&mut self) -> Result<(), DriverError> {
        self.record(MemoryCall::Commit(self.id), |s| s.fail_commit.clone())
    }

    async fn rollback(&mut self) -> Result<(), DriverError> {
        self.record(MemoryCall::Rollback(self.id), |s| s.fail_rollback.clone())
    }

    async fn query(&mut self, sql: &str) -> Result<QueryOutput, DriverError> {
        let mut state = self.shared.state.lock();
        state.calls.push(MemoryCall::Query(self.id, sql.to_string()));
        state
            .responses
            .pop_front()
            .unwrap_or_else(|| Ok(QueryOutput::default()))
    }

    fn release(self: Box<Self>) {
        {
            let mut state = self.shared.state.lock();
            state.calls.push(MemoryCall::Release(self.id));
            state.open.remove(&self.id);
        }
        self.shared.emit(PoolEvent::Release {
            connection_id: self.id,
        });
    }
}
