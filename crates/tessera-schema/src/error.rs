//! Error types for schema declarations and row validation.

/// Errors raised while declaring a schema or validating values against it.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    /// A value does not match the declared field.
    #[error("invalid value for field '{field}': {message}")]
    Validation {
        /// Field that rejected the value.
        field: String,
        /// Why the value was rejected.
        message: String,
    },

    /// A row carries a key the schema does not declare.
    #[error("unknown field '{0}'")]
    UnknownField(String),

    /// A table or column name is not a plain lowercase SQL identifier.
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),

    /// Failed to read a schema from JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchemaError {
    pub(crate) fn validation(field: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for schema operations.
pub type Result<T> = std::result::Result<T, SchemaError>;
