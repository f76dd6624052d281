//! Repository runner
//!
//! Runs one business callback against a prepared set of repositories and
//! their shared transaction, then cleans up on every exit path. Cleanup
//! lives in `Drop`, so it also runs when the callback panics or the future
//! of [`RepositoryRunner::run`] is dropped before completion.

use std::error::Error as StdError;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use rp_core::{AppError, AppResult};
use tracing::Span;

use crate::error::{DbError, DbResult};
use crate::repository::{AnyRepository, RepositoryRegistry};
use crate::transaction::Transaction;

/// Single-use runner of one business operation
pub struct RepositoryRunner {
    registry: RepositoryRegistry,
    span: Span,
}

impl RepositoryRunner {
    pub fn new(
        repositories: Vec<Arc<dyn AnyRepository>>,
        transaction: Transaction,
        span: Span,
    ) -> Self {
        Self {
            registry: RepositoryRegistry::new(repositories, transaction, span.clone()),
            span,
        }
    }

    /// Invoke `callback` with the registry and the transaction.
    ///
    /// The runner never begins or commits a transaction; that is up to the
    /// callback. Request-level errors come back unchanged, anything else as a
    /// business call error carrying the underlying message.
    pub async fn run<T, F, Fut>(self, callback: F) -> AppResult<T>
    where
        F: FnOnce(RepositoryRegistry, Transaction) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let registry = self.registry.clone();
        let transaction = registry.transaction().clone();

        let outcome = callback(registry, transaction)
            .await
            .map_err(|err| self.handle_error(err));

        drop(self);
        outcome
    }

    fn handle_error(&self, err: DbError) -> AppError {
        let mut causes = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        tracing::error!(parent: &self.span, error = %err, causes = ?causes, "Business call is failed");

        err.request_error()
            .unwrap_or_else(|| AppError::business_call(err.business_message()))
    }

    fn cleanup(&self) {
        let registry = &self.registry;
        if catch_unwind(AssertUnwindSafe(|| registry.close_all())).is_err() {
            tracing::error!(parent: &self.span, "Repository is not closed");
        }
        if catch_unwind(AssertUnwindSafe(|| registry.transaction().close())).is_err() {
            tracing::error!(parent: &self.span, "DB connection not release");
        }
    }
}

impl Drop for RepositoryRunner {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for RepositoryRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryRunner")
            .field("registry", &self.registry)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryCall, MemoryDriver};
    use crate::error::DriverError;
    use crate::repository::RepositoryKind;
    use crate::testing::{connection, RoleRepository, UserRepository};
    use crate::transaction::TransactionState;
    use std::time::Duration;

    fn runner(driver: &MemoryDriver) -> RepositoryRunner {
        let conn = connection(driver);
        let repositories = vec![RepositoryKind::of::<UserRepository>().construct(conn.clone())];
        RepositoryRunner::new(repositories, Transaction::new(conn), Span::none())
    }

    #[tokio::test]
    async fn test_success_returns_result_and_releases() {
        let driver = MemoryDriver::new();
        let result = runner(&driver)
            .run(|registry, tx| async move {
                let users = registry.get::<UserRepository>()?;
                tx.start_transaction().await?;
                let changed = users.rename(1, "ada").await?;
                tx.commit().await?;
                Ok(changed)
            })
            .await;

        assert!(result.unwrap().is_nan());
        assert_eq!(driver.release_count(), 1);
        assert_eq!(driver.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_callback_error_is_wrapped_and_released_once() {
        let driver = MemoryDriver::new();
        driver.push_error(DriverError::new("Table 'app.t_user' doesn't exist").with_errno(1146));

        let err = runner(&driver)
            .run(|registry, _tx| async move {
                registry.get::<UserRepository>()?.find(1).await
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            AppError::business_call("Table 'app.t_user' doesn't exist")
        );
        assert_eq!(err.status_code(), 400);
        assert_eq!(driver.acquire_count(), 1);
        assert_eq!(driver.release_count(), 1);
    }

    #[tokio::test]
    async fn test_request_error_passes_through() {
        let driver = MemoryDriver::new();
        let err = runner(&driver)
            .run(|_registry, _tx| async move {
                Err::<(), _>(AppError::not_found("user 7").into())
            })
            .await
            .unwrap_err();

        assert_eq!(err, AppError::not_found("user 7"));
    }

    #[tokio::test]
    async fn test_repository_outside_scheme_is_bad_request() {
        let driver = MemoryDriver::new();
        let err = runner(&driver)
            .run(|registry, _tx| async move {
                registry.get::<RoleRepository>()?.purge_expired().await
            })
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::BadRequest { .. }));
        assert_eq!(driver.acquire_count(), 0);
    }

    #[tokio::test]
    async fn test_commit_error_releases_once() {
        let driver = MemoryDriver::new();
        driver.fail_commit(DriverError::new("Lost connection to MySQL server").with_errno(2013));

        let err = runner(&driver)
            .run(|registry, tx| async move {
                tx.start_transaction().await?;
                registry.get::<UserRepository>()?.rename(1, "ada").await?;
                tx.commit().await?;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.message(), "Lost connection to MySQL server");
        assert_eq!(driver.release_count(), 1);
    }

    #[tokio::test]
    async fn test_no_statement_never_acquires() {
        let driver = MemoryDriver::new();
        let value = runner(&driver).run(|_, _| async { Ok(5) }).await.unwrap();

        assert_eq!(value, 5);
        assert_eq!(driver.acquire_count(), 0);
        assert_eq!(driver.release_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_happens_before_release() {
        let driver = MemoryDriver::new();
        runner(&driver)
            .run(|registry, tx| async move {
                tx.start_transaction().await?;
                registry.get::<UserRepository>()?.rename(1, "ada").await?;
                tx.rollback().await?;
                Ok(())
            })
            .await
            .unwrap();

        let calls = driver.calls();
        assert_eq!(
            calls[calls.len() - 2..],
            [MemoryCall::Rollback(1), MemoryCall::Release(1)]
        );
    }

    #[tokio::test]
    async fn test_leaked_repository_is_closed() {
        let driver = MemoryDriver::new();
        let leaked = runner(&driver)
            .run(|registry, _tx| async move { registry.get::<UserRepository>() })
            .await
            .unwrap();

        assert!(matches!(leaked.find(1).await, Err(DbError::RepositoryClosed("user"))));
    }

    #[tokio::test]
    async fn test_panic_still_releases() {
        let driver = MemoryDriver::new();
        let runner = runner(&driver);

        let handle = tokio::spawn(runner.run(|registry, _tx| async move {
            registry.get::<UserRepository>()?.find(1).await?;
            if registry.transaction().state() != TransactionState::Closed {
                panic!("business logic failed");
            }
            Ok(())
        }));

        assert!(handle.await.unwrap_err().is_panic());
        assert_eq!(driver.acquire_count(), 1);
        assert_eq!(driver.release_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_future_still_releases() {
        let driver = MemoryDriver::new();
        let run = runner(&driver).run(|registry, _tx| async move {
            registry.get::<UserRepository>()?.find(1).await?;
            futures::future::pending::<()>().await;
            Ok(())
        });

        let timed_out = tokio::time::timeout(Duration::from_millis(20), run).await;
        assert!(timed_out.is_err());
        assert_eq!(driver.acquire_count(), 1);
        assert_eq!(driver.release_count(), 1);
    }
}
