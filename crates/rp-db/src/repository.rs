//! Repositories and the per-operation registry
//!
//! A repository is a named group of data access methods built over the
//! pooled connection of one operation. Every repository kind declares a
//! stable name in [`Repository::KIND`]; the registry hands instances out by
//! that name.
//!
//! ```ignore
//! pub struct UserRepository {
//!     base: RepositoryBase,
//! }
//!
//! impl Repository for UserRepository {
//!     const KIND: &'static str = "user";
//!
//!     fn new(connection: Arc<PooledConnection>) -> Self {
//!         Self { base: RepositoryBase::new(Self::KIND, connection) }
//!     }
//!
//!     fn base(&self) -> &RepositoryBase {
//!         &self.base
//!     }
//! }
//!
//! impl UserRepository {
//!     pub async fn find(&self, id: i64) -> DbResult<Option<User>> {
//!         self.connection()?
//!             .select_one("SELECT * FROM table(user) WHERE id={id}", [("id", id)])
//!             .await
//!     }
//! }
//! ```

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use rp_core::AppError;
use tracing::Span;

use crate::connection::PooledConnection;
use crate::error::{DbError, DbResult};
use crate::transaction::Transaction;

/// Holds the connection reference of a repository until it is closed
#[derive(Debug)]
pub struct RepositoryBase {
    kind: &'static str,
    connection: RwLock<Option<Arc<PooledConnection>>>,
}

impl RepositoryBase {
    pub fn new(kind: &'static str, connection: Arc<PooledConnection>) -> Self {
        Self {
            kind,
            connection: RwLock::new(Some(connection)),
        }
    }

    /// The connection of the running operation
    pub fn connection(&self) -> DbResult<Arc<PooledConnection>> {
        self.connection
            .read()
            .clone()
            .ok_or(DbError::RepositoryClosed(self.kind))
    }

    /// Drop the connection reference. The connection itself stays open.
    pub fn close(&self) {
        self.connection.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.connection.read().is_none()
    }
}

/// A repository kind
pub trait Repository: Send + Sync + 'static {
    /// Stable name of the kind, unique within a scheme
    const KIND: &'static str;

    fn new(connection: Arc<PooledConnection>) -> Self
    where
        Self: Sized;

    fn base(&self) -> &RepositoryBase;

    /// The connection of the running operation; fails once the repository
    /// is closed
    fn connection(&self) -> DbResult<Arc<PooledConnection>> {
        self.base().connection()
    }
}

/// Type-erased view of a repository instance
pub trait AnyRepository: Send + Sync + 'static {
    fn kind(&self) -> &'static str;

    fn close(&self);

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<R: Repository> AnyRepository for R {
    fn kind(&self) -> &'static str {
        R::KIND
    }

    fn close(&self) {
        self.base().close();
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A repository kind as a value: its name and how to build it
#[derive(Clone, Copy)]
pub struct RepositoryKind {
    name: &'static str,
    construct: fn(Arc<PooledConnection>) -> Arc<dyn AnyRepository>,
}

fn construct<R: Repository>(connection: Arc<PooledConnection>) -> Arc<dyn AnyRepository> {
    Arc::new(R::new(connection))
}

impl RepositoryKind {
    pub fn of<R: Repository>() -> Self {
        Self {
            name: R::KIND,
            construct: construct::<R>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn construct(&self, connection: Arc<PooledConnection>) -> Arc<dyn AnyRepository> {
        (self.construct)(connection)
    }
}

impl PartialEq for RepositoryKind {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for RepositoryKind {}

impl std::fmt::Debug for RepositoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("RepositoryKind").field(&self.name).finish()
    }
}

/// The repositories and transaction of one running operation
#[derive(Clone)]
pub struct RepositoryRegistry {
    repositories: Arc<[Arc<dyn AnyRepository>]>,
    transaction: Transaction,
    span: Span,
}

impl RepositoryRegistry {
    pub fn new(
        repositories: Vec<Arc<dyn AnyRepository>>,
        transaction: Transaction,
        span: Span,
    ) -> Self {
        Self {
            repositories: repositories.into(),
            transaction,
            span,
        }
    }

    /// The instance of kind `R`. Fails if `R` was not part of the scheme.
    pub fn get<R: Repository>(&self) -> DbResult<Arc<R>> {
        self.find(R::KIND)?
            .as_any()
            .downcast::<R>()
            .map_err(|_| DbError::RepositoryNotFound(R::KIND))
    }

    pub fn get_kind(&self, kind: &RepositoryKind) -> DbResult<Arc<dyn AnyRepository>> {
        self.find(kind.name())
    }

    /// The instances of `kinds`, in the same order
    pub fn from_kinds(&self, kinds: &[RepositoryKind]) -> DbResult<Vec<Arc<dyn AnyRepository>>> {
        kinds.iter().map(|kind| self.get_kind(kind)).collect()
    }

    /// Typed batch retrieval
    ///
    /// ```ignore
    /// let (users, roles) = registry.fetch::<(Arc<UserRepository>, Arc<RoleRepository>)>()?;
    /// ```
    pub fn fetch<T: FromRegistry>(&self) -> DbResult<T> {
        T::from_registry(self)
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    /// Run `func` inside a database transaction.
    ///
    /// Commits and returns `Some(result)` on success. On failure the
    /// transaction is rolled back and the failure logged; then `error` is
    /// returned if given, otherwise `Ok(None)`. A failed rollback is returned
    /// as is, ahead of `error`.
    pub async fn execute_transaction<T, F, Fut>(
        &self,
        func: F,
        error: Option<AppError>,
    ) -> DbResult<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let outcome = async {
            self.transaction.start_transaction().await?;
            let result = func().await?;
            self.transaction.commit().await?;
            Ok::<_, DbError>(result)
        }
        .await;

        match outcome {
            Ok(result) => Ok(Some(result)),
            Err(err) => {
                if let Err(rollback_err) = self.transaction.rollback().await {
                    tracing::error!(
                        parent: &self.span,
                        error = %rollback_err,
                        cause = %err,
                        "Rollback is failed"
                    );
                    return Err(rollback_err);
                }
                tracing::error!(
                    parent: &self.span,
                    error = ?err,
                    "Rollback: repository transaction is failed ({})",
                    err
                );
                match error {
                    Some(error) => Err(DbError::Request(error)),
                    None => Ok(None),
                }
            }
        }
    }

    pub(crate) fn close_all(&self) {
        for repository in self.repositories.iter() {
            repository.close();
        }
    }

    fn find(&self, name: &'static str) -> DbResult<Arc<dyn AnyRepository>> {
        self.repositories
            .iter()
            .find(|repository| repository.kind() == name)
            .cloned()
            .ok_or(DbError::RepositoryNotFound(name))
    }
}

impl std::fmt::Debug for RepositoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryRegistry")
            .field(
                "repositories",
                &self.repositories.iter().map(|r| r.kind()).collect::<Vec<_>>(),
            )
            .field("transaction", &self.transaction)
            .finish()
    }
}

/// Values that can be taken out of a [`RepositoryRegistry`]
pub trait FromRegistry: Sized {
    fn from_registry(registry: &RepositoryRegistry) -> DbResult<Self>;
}

impl<R: Repository> FromRegistry for Arc<R> {
    fn from_registry(registry: &RepositoryRegistry) -> DbResult<Self> {
        registry.get::<R>()
    }
}

macro_rules! impl_from_registry_tuple {
    ($($name:ident),+) => {
        impl<$($name: FromRegistry),+> FromRegistry for ($($name,)+) {
            fn from_registry(registry: &RepositoryRegistry) -> DbResult<Self> {
                Ok(($($name::from_registry(registry)?,)+))
            }
        }
    };
}

impl_from_registry_tuple!(A);
impl_from_registry_tuple!(A, B);
impl_from_registry_tuple!(A, B, C);
impl_from_registry_tuple!(A, B, C, D);
impl_from_registry_tuple!(A, B, C, D, E);
impl_from_registry_tuple!(A, B, C, D, E, F);
