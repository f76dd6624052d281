//! repodb command line client

use std::sync::Arc;

use clap::Parser;
use rp_core::config::CONFIG_PATH_ENV;
use rp_core::logging::init_tracing;
use rp_core::{AppConfig, AppError, TableMap};
use rp_db::{
    escape_value, format, DatabasePoolService, DatabaseService, DbResult, MySqlDriver, Params,
    PooledConnection, QueryOutput, Repository, RepositoryBase, RepositoryKind, SqlValue,
};
use tracing::info;

mod cli;

use cli::{Cli, Command};

/// Raw statements, for the command line only
struct SqlRepository {
    base: RepositoryBase,
}

impl Repository for SqlRepository {
    const KIND: &'static str = "sql";

    fn new(connection: Arc<PooledConnection>) -> Self {
        Self {
            base: RepositoryBase::new(Self::KIND, connection),
        }
    }

    fn base(&self) -> &RepositoryBase {
        &self.base
    }
}

impl SqlRepository {
    async fn execute(&self, template: &str, params: Params) -> DbResult<QueryOutput> {
        self.connection()?.query(template, params).await
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::from_env_path(CONFIG_PATH_ENV)?,
    };
    init_tracing(&config.logging);

    match cli.command {
        Command::Render { template, params } => {
            let tables = config.db.map(|db| db.tables).unwrap_or_default();
            println!("{}", render_statement(&tables, &template, params));
            Ok(())
        }
        Command::Query {
            template,
            params,
            transaction,
        } => {
            with_database(config, |db| async move {
                let output = run_query(&db, template, params.into_iter().collect(), transaction).await?;
                println!("{}", serde_json::to_string_pretty(&output)?);
                Ok(())
            })
            .await
        }
        Command::Ping => {
            with_database(config, |db| async move {
                run_query(&db, "SELECT 1".into(), Params::new(), false).await?;
                println!("ok");
                Ok(())
            })
            .await
        }
    }
}

/// Render offline with the driver's escaping
fn render_statement(tables: &TableMap, template: &str, params: Vec<(String, SqlValue)>) -> String {
    let values = params.into_iter().collect::<Params>().merged_over(tables);
    format(&escape_value, template, &values)
}

/// Bootstrap the pool, run `command` until it finishes or Ctrl+C, then shut
/// the pool down
async fn with_database<F, Fut>(config: AppConfig, command: F) -> anyhow::Result<()>
where
    F: FnOnce(DatabaseService) -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    let span = tracing::info_span!("database");
    let pool_service = Arc::new(DatabasePoolService::new(
        Arc::new(MySqlDriver::create),
        span.clone(),
    ));
    pool_service.bootstrap(config.db)?;
    let db = DatabaseService::new(pool_service.clone(), span);

    let outcome = tokio::select! {
        result = command(db) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, cancelling");
            Ok(())
        }
    };

    pool_service.shutdown().await?;
    outcome
}

async fn run_query(
    db: &DatabaseService,
    template: String,
    params: Params,
    transaction: bool,
) -> anyhow::Result<QueryOutput> {
    let output = db
        .with_pool(&[RepositoryKind::of::<SqlRepository>()])?
        .run(|registry, _tx| async move {
            let sql = registry.get::<SqlRepository>()?;
            if !transaction {
                return sql.execute(&template, params).await;
            }
            let output = registry
                .execute_transaction(
                    || sql.execute(&template, params),
                    Some(AppError::business_call("Statement was rolled back")),
                )
                .await?;
            Ok(output.unwrap_or_default())
        })
        .await?;
    Ok(output)
}
