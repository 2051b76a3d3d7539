//! Error types for the ORM.

use thiserror::Error;

/// ORM-specific errors.
#[derive(Debug, Error)]
pub enum OrmError {
    /// Database error from sqlx. Constraint violations surface here verbatim.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A row or patch failed schema validation. No statement was issued.
    #[error("validation error: {0}")]
    Validation(#[from] tessera_schema::SchemaError),

    /// A query fragment cannot be used with the requested operation.
    #[error("invalid template: {0}")]
    TemplateUsage(String),

    /// Migration of the backing table failed.
    #[error("migration error: {0}")]
    Migrate(#[from] tessera_migrate::MigrateError),
}

impl OrmError {
    pub(crate) fn template(message: impl Into<String>) -> Self {
        Self::TemplateUsage(message.into())
    }

    /// Returns the SQLSTATE code of a database error, if any.
    #[must_use]
    pub fn sqlstate(&self) -> Option<String> {
        let db = match self {
            Self::Database(e) => e.as_database_error(),
            Self::Migrate(tessera_migrate::MigrateError::Database(e)) => e.as_database_error(),
            _ => None,
        }?;
        db.code().map(|c| c.into_owned())
    }
}

/// Result type alias for ORM operations.
pub type Result<T> = std::result::Result<T, OrmError>;
