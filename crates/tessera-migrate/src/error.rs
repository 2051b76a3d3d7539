//! Error types for the migration system.

use std::path::PathBuf;

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A column cannot become NOT NULL because nothing can fill existing nulls.
    #[error(
        "Cannot make column '{column}' of table '{table}' NOT NULL: no default to backfill existing rows"
    )]
    Planning {
        /// Table being migrated.
        table: String,
        /// Column that would be tightened.
        column: String,
    },

    /// A default uses an enum label that this migration pass adds.
    #[error(
        "Cannot use new label '{label}' as the default of column '{column}' of table '{table}' \
         in the pass that adds it: declare the label first, migrate, then set the default"
    )]
    PendingEnumLabel {
        /// Table being migrated.
        table: String,
        /// Column whose default needs the label.
        column: String,
        /// Label missing from the live enum type.
        label: String,
    },

    /// A migration is already recorded in the ledger for this scope.
    #[error("Migration '{migration}' already applied{}", scope_suffix(.collection))]
    AlreadyApplied {
        /// Migration identifier.
        migration: String,
        /// Collection scope, `None` for global migrations.
        collection: Option<String>,
    },

    /// Two migrations registered under the same identifier and scope.
    #[error("Duplicate migration '{0}'")]
    DuplicateMigration(String),

    /// A row returned by an introspection or ledger query had an unexpected shape.
    #[error("Unexpected row from {query}: {message}")]
    UnexpectedRow {
        /// Which query produced the row.
        query: &'static str,
        /// What was wrong with it.
        message: String,
    },

    /// A hook failed.
    #[error("Hook of migration '{migration}' failed: {message}")]
    Hook {
        /// Migration identifier.
        migration: String,
        /// Error message.
        message: String,
    },

    /// Database error during migration execution.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IO error (reading migration files or schema files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No migrations directory found.
    #[error("Migrations directory not found: {0}")]
    MigrationsDirNotFound(PathBuf),

    /// Declared schema is invalid.
    #[error("Schema error: {0}")]
    Schema(#[from] tessera_schema::SchemaError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn scope_suffix(collection: &Option<String>) -> String {
    match collection {
        Some(c) => format!(" for collection '{c}'"),
        None => String::new(),
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
