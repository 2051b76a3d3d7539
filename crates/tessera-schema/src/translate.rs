//! Translation from declared fields to normalized column definitions.
//!
//! [`describe`] flattens a [`Field`] and its modifiers into a
//! [`FieldDescriptor`]; [`normalize`] maps a descriptor onto a PostgreSQL
//! column. The type map is total: shapes without a storage mapping become
//! `TEXT` columns.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::field::{DefaultValue, Field, FieldKind, LogicalType, Modifier, NumericFormat, Schema};

/// A field with its modifiers unwrapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
    pub unique: bool,
    pub max_length: Option<u32>,
    pub numeric_format: Option<NumericFormat>,
    pub enum_options: Vec<String>,
    /// Name of the unsupported shape, for [`LogicalType::Unknown`].
    pub unknown_type: Option<String>,
}

/// How the database generates a primary key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    /// `INTEGER GENERATED ALWAYS AS IDENTITY`.
    Integer,
    /// `UUID` with a `gen_random_uuid()` default.
    Uuid,
}

/// Enum type backing an enum column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnumType {
    /// Type name, `{table}_{field}`.
    pub name: String,
    /// Declared labels, in order.
    pub options: Vec<String>,
}

/// A column derived from one declared field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    pub logical_type: LogicalType,
    /// PostgreSQL type as written in DDL.
    pub physical_type: String,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
    pub unique: bool,
    pub identity: Option<Identity>,
    pub enum_type: Option<EnumType>,
    pub max_length: Option<u32>,
}

/// Unwraps a field's modifiers in application order.
///
/// Optional and nullable both make the column nullable. The first default
/// applied wins.
#[must_use]
pub fn describe(name: &str, field: &Field) -> FieldDescriptor {
    let mut descriptor = FieldDescriptor {
        name: name.to_string(),
        logical_type: field.logical_type(),
        nullable: false,
        default: None,
        unique: false,
        max_length: field.max_length(),
        numeric_format: field.numeric_format(),
        enum_options: field.enum_options().to_vec(),
        unknown_type: match field.kind() {
            FieldKind::Unknown { name } => Some(name.clone()),
            _ => None,
        },
    };

    for modifier in field.modifiers() {
        match modifier {
            Modifier::Optional | Modifier::Nullable => {
                descriptor.nullable = true;
            }
            Modifier::Default(value) => {
                if descriptor.default.is_none() {
                    descriptor.default = Some(value.clone());
                }
            }
            Modifier::Unique => descriptor.unique = true,
        }
    }

    descriptor
}

/// Returns the enum type name for a field of a table.
#[must_use]
pub fn enum_type_name(table: &str, field: &str) -> String {
    format!("{table}_{field}")
}

/// Maps a descriptor to the column stored in `table`.
#[must_use]
pub fn normalize(table: &str, descriptor: &FieldDescriptor) -> ColumnDefinition {
    let mut column = ColumnDefinition {
        name: descriptor.name.clone(),
        logical_type: descriptor.logical_type,
        physical_type: String::new(),
        nullable: descriptor.nullable,
        default: descriptor.default.clone(),
        unique: descriptor.unique,
        identity: None,
        enum_type: None,
        max_length: descriptor.max_length,
    };

    if descriptor.name == "id" {
        let identity = match descriptor.logical_type {
            LogicalType::Number => Some(Identity::Integer),
            LogicalType::Uuid => Some(Identity::Uuid),
            _ => None,
        };
        if let Some(identity) = identity {
            column.identity = Some(identity);
            column.nullable = false;
            column.unique = false;
            column.default = match identity {
                Identity::Integer => None,
                Identity::Uuid => Some(DefaultValue::RandomUuid),
            };
            column.physical_type = match identity {
                Identity::Integer => "INTEGER".to_string(),
                Identity::Uuid => "UUID".to_string(),
            };
            return column;
        }
    }

    column.physical_type = match descriptor.logical_type {
        LogicalType::String => match descriptor.max_length {
            Some(len) => format!("VARCHAR({len})"),
            None => "TEXT".to_string(),
        },
        LogicalType::Number => match descriptor.numeric_format {
            Some(NumericFormat::Integer) => "INTEGER".to_string(),
            Some(NumericFormat::Float32) => "REAL".to_string(),
            Some(NumericFormat::Float64) => "DOUBLE PRECISION".to_string(),
            Some(NumericFormat::Decimal) | None => "NUMERIC".to_string(),
        },
        LogicalType::Boolean => "BOOLEAN".to_string(),
        LogicalType::Date => "TIMESTAMPTZ".to_string(),
        LogicalType::Uuid => "UUID".to_string(),
        LogicalType::Enum => {
            let name = enum_type_name(table, &descriptor.name);
            let physical = crate::ddl::quote_identifier(&name);
            column.enum_type = Some(EnumType {
                name,
                options: descriptor.enum_options.clone(),
            });
            physical
        }
        LogicalType::Array | LogicalType::Object | LogicalType::Json => "JSONB".to_string(),
        LogicalType::Unknown => {
            warn!(
                table = %table,
                field = %descriptor.name,
                declared = descriptor.unknown_type.as_deref().unwrap_or("?"),
                "Unsupported field type, storing as TEXT"
            );
            "TEXT".to_string()
        }
    };

    column
}

/// Translates every field of a schema, in declaration order.
#[must_use]
pub fn normalize_schema(table: &str, schema: &Schema) -> Vec<ColumnDefinition> {
    schema
        .fields()
        .map(|f| normalize(table, &describe(&f.name, &f.field)))
        .collect()
}

/// Returns the type string `information_schema.columns` reports for a column.
///
/// Used to decide whether a live column needs `ALTER COLUMN ... TYPE`.
#[must_use]
pub fn expected_live_type(column: &ColumnDefinition) -> String {
    match column.identity {
        Some(Identity::Integer) => return "integer".to_string(),
        Some(Identity::Uuid) => return "uuid".to_string(),
        None => {}
    }
    match column.logical_type {
        LogicalType::String => match column.max_length {
            Some(len) => format!("character varying({len})"),
            None => "text".to_string(),
        },
        LogicalType::Number => match column.physical_type.as_str() {
            "INTEGER" => "integer".to_string(),
            "REAL" => "real".to_string(),
            "DOUBLE PRECISION" => "double precision".to_string(),
            _ => "numeric".to_string(),
        },
        LogicalType::Boolean => "boolean".to_string(),
        LogicalType::Date => "timestamp with time zone".to_string(),
        LogicalType::Uuid => "uuid".to_string(),
        LogicalType::Enum => "USER-DEFINED".to_string(),
        LogicalType::Array | LogicalType::Object | LogicalType::Json => "jsonb".to_string(),
        LogicalType::Unknown => "text".to_string(),
    }
}
