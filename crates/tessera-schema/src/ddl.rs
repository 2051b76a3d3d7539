//! PostgreSQL column DDL.
//!
//! Renders one [`ColumnDefinition`] into the clause used inside
//! `CREATE TABLE` or `ALTER TABLE ... ADD COLUMN`. Enum columns also carry an
//! [`EnumTypeAction`] that must run before the clause is used.

use serde_json::Value;

use crate::field::{DefaultValue, LogicalType};
use crate::translate::{ColumnDefinition, EnumType, Identity};

/// Quotes an identifier (table name, column name, type name).
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quotes a string literal.
#[must_use]
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Renders a default value for a column.
///
/// Generators are emitted bare, strings quoted, numbers and booleans bare.
/// Any literal on a JSONB column is cast from its JSON text.
#[must_use]
pub fn render_default(column: &ColumnDefinition, default: &DefaultValue) -> String {
    match default {
        DefaultValue::Now => "now()".to_string(),
        DefaultValue::RandomUuid => "gen_random_uuid()".to_string(),
        DefaultValue::Expression(expr) => expr.clone(),
        DefaultValue::Value(value) => match column.logical_type {
            LogicalType::Array | LogicalType::Object | LogicalType::Json => {
                format!("{}::jsonb", quote_literal(&value.to_string()))
            }
            _ => render_literal(value),
        },
    }
}

fn render_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => quote_literal(s),
        Value::Array(_) | Value::Object(_) => quote_literal(&value.to_string()),
    }
}

/// Creates or extends the enum type behind an enum column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumTypeAction {
    pub type_name: String,
    pub options: Vec<String>,
}

impl From<&EnumType> for EnumTypeAction {
    fn from(enum_type: &EnumType) -> Self {
        Self {
            type_name: enum_type.name.clone(),
            options: enum_type.options.clone(),
        }
    }
}

impl EnumTypeAction {
    /// Returns the statements that bring the type up to date.
    ///
    /// `existing` holds the live labels, or `None` if the type does not exist.
    /// Labels are only ever appended; an up-to-date type yields nothing.
    #[must_use]
    pub fn statements(&self, existing: Option<&[String]>) -> Vec<String> {
        let name = quote_identifier(&self.type_name);
        match existing {
            None => {
                let labels: Vec<String> = self.options.iter().map(|o| quote_literal(o)).collect();
                vec![format!("CREATE TYPE {} AS ENUM ({})", name, labels.join(", "))]
            }
            Some(labels) => self
                .options
                .iter()
                .filter(|o| !labels.contains(o))
                .map(|o| {
                    format!(
                        "ALTER TYPE {} ADD VALUE IF NOT EXISTS {}",
                        name,
                        quote_literal(o)
                    )
                })
                .collect(),
        }
    }
}

/// A rendered column clause and the action it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnClause {
    pub clause: String,
    pub preflight: Option<EnumTypeAction>,
}

/// Renders a column clause.
#[must_use]
pub fn render(column: &ColumnDefinition) -> ColumnClause {
    let name = quote_identifier(&column.name);
    let clause = match column.identity {
        Some(Identity::Integer) => {
            format!("{name} INTEGER GENERATED ALWAYS AS IDENTITY PRIMARY KEY")
        }
        Some(Identity::Uuid) => format!("{name} UUID PRIMARY KEY DEFAULT gen_random_uuid()"),
        None => {
            let mut parts = vec![name, column.physical_type.clone()];
            if !column.nullable {
                parts.push("NOT NULL".to_string());
            }
            if let Some(default) = &column.default {
                parts.push(format!("DEFAULT {}", render_default(column, default)));
            }
            if column.unique {
                parts.push("UNIQUE".to_string());
            }
            parts.join(" ")
        }
    };

    ColumnClause {
        clause,
        preflight: column.enum_type.as_ref().map(EnumTypeAction::from),
    }
}
