//! Schema-diff migrations for Tessera collections.
//!
//! `tessera-migrate` reconciles live PostgreSQL tables with declared schemas:
//!
//! - [`introspect`] reads the live shape of a table and its enum types
//! - [`planner`] diffs it against normalized target columns and produces an
//!   ordered, additive [`MigrationPlan`]
//! - [`ledger`] records applied migrations in the `migrations` table
//! - [`runner`] sequences global and table-scoped migrations, each unit in
//!   one transaction with before/after hooks
//! - [`session`] is the seam every database call goes through
//!
//! # Example
//!
//! ```rust,ignore
//! use tessera_migrate::prelude::*;
//! use tessera_schema::{normalize_schema, Field, Schema};
//!
//! let pool = DatabaseConfig::from_env().connect().await?;
//! let runner = MigrationRunner::new().load_dir("migrations")?;
//! runner.run_global(&pool).await?;
//!
//! let schema = Schema::new()
//!     .field("id", Field::number())
//!     .field("name", Field::string().max(100));
//! runner
//!     .migrate_table(&pool, "users", &normalize_schema("users", &schema))
//!     .await?;
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Create the ledger table
//! tessera-migrate init
//!
//! # Run SQL migrations, then reconcile tables declared in a schema file
//! tessera-migrate migrate --dir migrations --schema schema.json
//!
//! # List applied migrations
//! tessera-migrate show-migrations
//!
//! # Print the statements a table migration would run
//! tessera-migrate sql --schema schema.json --table users
//! ```

pub mod config;
pub mod error;
pub mod introspect;
pub mod ledger;
pub mod planner;
pub mod runner;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::DatabaseConfig;
pub use error::{MigrateError, Result};
pub use introspect::{introspect, LiveColumn, LiveTable};
pub use ledger::AppliedMigration;
pub use planner::{plan, MigrationPlan};
pub use runner::{finish, Hook, Migration, MigrationRunner, TableReport, UnitReport, UnitState};
pub use session::{Connector, DynSession, RawRow, Session, TxSession};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::DatabaseConfig;
    pub use crate::error::{MigrateError, Result};
    pub use crate::planner::MigrationPlan;
    pub use crate::runner::{Hook, Migration, MigrationRunner};
    pub use crate::session::{Connector, Session, TxSession};
}
