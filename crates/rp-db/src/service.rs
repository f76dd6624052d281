//! Database service
//!
//! Entry point for business code:
//!
//! ```ignore
//! let user = db
//!     .with_pool(&[RepositoryKind::of::<UserRepository>()])?
//!     .run(|registry, tx| async move {
//!         let users = registry.get::<UserRepository>()?;
//!         users.find(7).await
//!     })
//!     .await?;
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use rp_core::{AppError, AppResult};
use tracing::Span;

use crate::pool_service::DatabasePoolService;
use crate::repository::RepositoryKind;
use crate::runner::RepositoryRunner;
use crate::transaction::Transaction;

#[derive(Debug, Clone)]
pub struct DatabaseService {
    pool_service: Arc<DatabasePoolService>,
    span: Span,
}

impl DatabaseService {
    pub fn new(pool_service: Arc<DatabasePoolService>, span: Span) -> Self {
        Self { pool_service, span }
    }

    pub fn pool_service(&self) -> &Arc<DatabasePoolService> {
        &self.pool_service
    }

    /// Prepare a runner for one business operation over `scheme`.
    ///
    /// Every repository shares one connection and one transaction. A kind
    /// listed twice yields a single instance.
    pub fn with_pool(&self, scheme: &[RepositoryKind]) -> AppResult<RepositoryRunner> {
        if scheme.is_empty() {
            return Err(AppError::bad_request("Repository Scheme not define"));
        }

        let connection = self.pool_service.get_connection().map_err(|e| {
            tracing::error!(parent: &self.span, error = %e, "No database pool");
            AppError::internal(e.to_string())
        })?;
        let transaction = Transaction::new(connection.clone());

        let mut seen = HashSet::new();
        let repositories = scheme
            .iter()
            .filter(|kind| seen.insert(kind.name()))
            .map(|kind| kind.construct(connection.clone()))
            .collect();

        Ok(RepositoryRunner::new(repositories, transaction, self.span.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryCall, MemoryDriver, QueryOutput, Record};
    use crate::error::DriverError;
    use crate::testing::{RoleRepository, User, UserRepository};
    use rp_core::DatabaseConfig;
    use serde_json::json;

    fn service(driver: &MemoryDriver) -> DatabaseService {
        let pool_service = DatabasePoolService::new(Arc::new(driver.factory()), Span::none());
        pool_service
            .bootstrap(Some(
                DatabaseConfig::new("app", "app", "secret").with_table("user", "t_user"),
            ))
            .unwrap();
        DatabaseService::new(Arc::new(pool_service), Span::none())
    }

    fn user_row(id: i64, name: &str) -> Record {
        match json!({ "id": id, "name": name }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_empty_scheme_fails_without_touching_the_pool() {
        let driver = MemoryDriver::new();
        let service = service(&driver);

        let err = service.with_pool(&[]).unwrap_err();
        assert_eq!(err, AppError::bad_request("Repository Scheme not define"));
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_missing_pool() {
        let pool_service = DatabasePoolService::new(Arc::new(MemoryDriver::new().factory()), Span::none());
        let service = DatabaseService::new(Arc::new(pool_service), Span::none());

        let err = service
            .with_pool(&[RepositoryKind::of::<UserRepository>()])
            .unwrap_err();
        assert_eq!(err, AppError::internal("Database pool is required"));
    }

    #[tokio::test]
    async fn test_end_to_end_select() {
        let driver = MemoryDriver::new();
        driver.push_response(QueryOutput::rows(vec![user_row(7, "ada")]));
        let service = service(&driver);

        let user = service
            .with_pool(&[RepositoryKind::of::<UserRepository>()])
            .unwrap()
            .run(|registry, _tx| async move { registry.get::<UserRepository>()?.find(7).await })
            .await
            .unwrap();

        assert_eq!(user, Some(User { id: 7, name: "ada".into() }));
        assert_eq!(driver.statements(), vec!["SELECT * FROM t_user WHERE id=7"]);
        assert_eq!(driver.acquire_count(), 1);
        assert_eq!(driver.release_count(), 1);
    }

    #[tokio::test]
    async fn test_repositories_share_one_connection() {
        let driver = MemoryDriver::new();
        let service = service(&driver);

        service
            .with_pool(&[
                RepositoryKind::of::<UserRepository>(),
                RepositoryKind::of::<RoleRepository>(),
            ])
            .unwrap()
            .run(|registry, tx| async move {
                let (users, roles) =
                    registry.fetch::<(Arc<UserRepository>, Arc<RoleRepository>)>()?;
                tx.start_transaction().await?;
                users.rename(7, "ada").await?;
                roles.purge_expired().await?;
                tx.commit().await?;
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(
            driver.calls(),
            vec![
                MemoryCall::Acquire(1),
                MemoryCall::Begin(1),
                MemoryCall::Query(1, "UPDATE users SET name='ada' WHERE id=7".into()),
                MemoryCall::Query(1, "DELETE FROM roles WHERE expired".into()),
                MemoryCall::Commit(1),
                MemoryCall::Release(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_duplicate_kinds_collapse() {
        let driver = MemoryDriver::new();
        let service = service(&driver);

        let same = service
            .with_pool(&[
                RepositoryKind::of::<UserRepository>(),
                RepositoryKind::of::<UserRepository>(),
            ])
            .unwrap()
            .run(|registry, _tx| async move {
                let kinds = [
                    RepositoryKind::of::<UserRepository>(),
                    RepositoryKind::of::<UserRepository>(),
                ];
                let found = registry.from_kinds(&kinds)?;
                Ok(Arc::ptr_eq(&found[0], &found[1]))
            })
            .await
            .unwrap();

        assert!(same);
    }

    #[tokio::test]
    async fn test_failed_rollback_path_releases_once() {
        let driver = MemoryDriver::new();
        driver.push_error(DriverError::new("Deadlock found when trying to get lock").with_errno(1213));
        let service = service(&driver);

        let err = service
            .with_pool(&[RepositoryKind::of::<UserRepository>()])
            .unwrap()
            .run(|registry, tx| async move {
                tx.start_transaction().await?;
                let result = registry.get::<UserRepository>()?.rename(7, "ada").await;
                if result.is_err() {
                    tx.rollback().await?;
                }
                result
            })
            .await
            .unwrap_err();

        assert_eq!(err, AppError::business_call("Deadlock found when trying to get lock"));
        let calls = driver.calls();
        assert_eq!(calls[calls.len() - 2..], [MemoryCall::Rollback(1), MemoryCall::Release(1)]);
        assert_eq!(driver.release_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_operations_use_distinct_connections() {
        let driver = MemoryDriver::new();
        let service = service(&driver);

        let operations = (0..3).map(|id| {
            let runner = service
                .with_pool(&[RepositoryKind::of::<UserRepository>()])
                .unwrap();
            tokio::spawn(runner.run(move |registry, _tx| async move {
                registry.get::<UserRepository>()?.find(id).await
            }))
        });
        for operation in futures::future::join_all(operations).await {
            operation.unwrap().unwrap();
        }

        assert_eq!(driver.acquire_count(), 3);
        assert_eq!(driver.release_count(), 3);
        assert_eq!(driver.open_connections(), 0);
    }
}
