//! Database handle.
//!
//! Owns the connector, the registered migrations and the one-time run of
//! global migrations. Collections are opened through it.

use std::sync::Arc;

use futures::future::LocalBoxFuture;
use sqlx::postgres::PgPool;
use tessera_migrate::{finish, Connector, DatabaseConfig, MigrationRunner, Session};
use tessera_schema::{validate_identifier, Schema};
use tokio::sync::OnceCell;
use tracing::info;

use crate::collection::Collection;
use crate::error::Result;

/// Shared database handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database<C = PgPool> {
    connector: C,
    runner: Arc<MigrationRunner>,
    globals: Arc<OnceCell<Vec<String>>>,
}

impl Database<PgPool> {
    /// Opens a connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = config.connect().await?;
        Ok(Self::new(pool))
    }
}

impl<C> Database<C>
where
    C: Connector + Session + Clone,
{
    /// Wraps an existing connector.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            runner: Arc::new(MigrationRunner::new()),
            globals: Arc::new(OnceCell::new()),
        }
    }

    /// Uses `runner` for global and table-scoped migrations.
    #[must_use]
    pub fn with_migrations(mut self, runner: MigrationRunner) -> Self {
        self.runner = Arc::new(runner);
        self.globals = Arc::new(OnceCell::new());
        self
    }

    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    #[must_use]
    pub fn runner(&self) -> &MigrationRunner {
        &self.runner
    }

    /// A session for one statement outside any transaction.
    pub(crate) fn session(&self) -> C {
        self.connector.clone()
    }

    /// Runs pending global migrations once per handle.
    ///
    /// Returns the identifiers applied by the first call.
    pub async fn run_migrations(&self) -> Result<&[String]> {
        let applied = self
            .globals
            .get_or_try_init(|| async {
                let applied = self.runner.run_global(&self.connector).await?;
                info!(count = applied.len(), "Global migrations complete");
                Ok::<_, crate::OrmError>(applied)
            })
            .await?;
        Ok(applied.as_slice())
    }

    /// Opens a collection, running pending migrations for its table first.
    pub async fn collection(&self, table: &str, schema: Schema) -> Result<Collection<C>> {
        let collection = self.collection_lazy(table, schema)?;
        self.run_migrations().await?;
        collection.migrate().await?;
        Ok(collection)
    }

    /// Opens a collection without migrating it. Call
    /// [`Collection::migrate`] before use if the table may be out of date.
    pub fn collection_lazy(&self, table: &str, schema: Schema) -> Result<Collection<C>> {
        validate_identifier(table)?;
        schema.check_identifiers()?;
        Ok(Collection::new(self.clone(), table, schema))
    }

    /// Runs `f` in a transaction, committing if it returns `Ok`.
    ///
    /// The future may borrow the transaction but not the caller's stack, so
    /// move clones of any collections into the closure.
    ///
    /// ```rust,ignore
    /// let (users, posts) = (users.clone(), posts.clone());
    /// db.transaction(move |tx| Box::pin(async move {
    ///     users.create_in(tx, row).await?;
    ///     posts.delete_in(tx, fragment!("WHERE author = $1", 7)?).await?;
    ///     Ok::<_, OrmError>(())
    /// }))
    /// .await?;
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'t> FnOnce(&'t mut C::Tx) -> LocalBoxFuture<'t, Result<T>>,
    {
        let mut tx = self.connector.begin().await?;
        let result = f(&mut tx).await;
        finish(tx, result).await
    }
}
