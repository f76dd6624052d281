//! Shared fixtures for the unit tests

use std::sync::Arc;

use rp_core::TableMap;
use serde::Deserialize;
use tracing::Span;

use crate::connection::PooledConnection;
use crate::driver::MemoryDriver;
use crate::error::DbResult;
use crate::escape::escape_value;
use crate::formatter::QueryFormatter;
use crate::repository::{Repository, RepositoryBase};
use crate::value::Params;

pub fn connection(driver: &MemoryDriver) -> Arc<PooledConnection> {
    Arc::new(PooledConnection::new(
        Arc::new(driver.clone()),
        QueryFormatter::new(Arc::new(escape_value), false, Span::none()),
        Arc::new(TableMap::from([("user".to_string(), "t_user".to_string())])),
        Span::none(),
    ))
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct User {
    pub id: i64,
    pub name: String,
}

#[derive(Debug)]
pub struct UserRepository {
    base: RepositoryBase,
}

impl Repository for UserRepository {
    const KIND: &'static str = "user";

    fn new(connection: Arc<PooledConnection>) -> Self {
        Self {
            base: RepositoryBase::new(Self::KIND, connection),
        }
    }

    fn base(&self) -> &RepositoryBase {
        &self.base
    }
}

impl UserRepository {
    pub async fn find(&self, id: i64) -> DbResult<Option<User>> {
        self.connection()?
            .select_one("SELECT * FROM table(user) WHERE id={id}", [("id", id)])
            .await
    }

    pub async fn rename(&self, id: i64, name: &str) -> DbResult<f64> {
        self.connection()?
            .update(
                "UPDATE users SET name={name} WHERE id={id}",
                Params::new().set("id", id).set("name", name),
            )
            .await
    }
}

#[derive(Debug)]
pub struct RoleRepository {
    base: RepositoryBase,
}

impl Repository for RoleRepository {
    const KIND: &'static str = "role";

    fn new(connection: Arc<PooledConnection>) -> Self {
        Self {
            base: RepositoryBase::new(Self::KIND, connection),
        }
    }

    fn base(&self) -> &RepositoryBase {
        &self.base
    }
}

impl RoleRepository {
    pub async fn purge_expired(&self) -> DbResult<f64> {
        self.connection()?.delete("DELETE FROM roles WHERE expired", ()).await
    }
}
