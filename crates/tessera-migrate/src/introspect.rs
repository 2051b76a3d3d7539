//! Live schema introspection.
//!
//! Reads the current shape of one table from `information_schema` and the
//! labels of its enum types from `pg_enum`. Snapshots are taken fresh on every
//! migration pass.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::session::{RawRow, Session};

/// Checks whether a table exists in the current schema.
pub const TABLE_EXISTS_SQL: &str = "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
     WHERE table_schema = current_schema() AND table_name = $1) AS exists";

/// Lists the columns of a table in ordinal order.
pub const COLUMNS_SQL: &str = "SELECT column_name::text AS column_name, \
     data_type::text AS data_type, \
     character_maximum_length::int4 AS character_maximum_length, \
     column_default::text AS column_default, \
     is_nullable::text AS is_nullable \
     FROM information_schema.columns \
     WHERE table_schema = current_schema() AND table_name = $1 \
     ORDER BY ordinal_position";

/// Lists the labels of an enum type. No rows means the type does not exist.
pub const ENUM_LABELS_SQL: &str = "SELECT t.typname::text AS type_name, e.enumlabel::text AS label \
     FROM pg_type t LEFT JOIN pg_enum e ON e.enumtypid = t.oid \
     WHERE t.typname = $1 \
     ORDER BY e.enumsortorder";

/// One column as reported by the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveColumn {
    pub name: String,
    /// `information_schema.columns.data_type`.
    pub data_type: String,
    pub character_maximum_length: Option<i64>,
    pub default_expression: Option<String>,
    pub nullable: bool,
}

impl LiveColumn {
    /// Returns the type string comparable with
    /// [`tessera_schema::expected_live_type`].
    #[must_use]
    pub fn reported_type(&self) -> String {
        match self.character_maximum_length {
            Some(len) => format!("{}({})", self.data_type, len),
            None => self.data_type.clone(),
        }
    }

    /// Parses a row of [`COLUMNS_SQL`].
    pub fn from_row(row: &RawRow) -> Result<Self> {
        let text = |key: &str| -> Option<String> {
            row.get(key).and_then(Value::as_str).map(str::to_string)
        };
        let name = text("column_name").ok_or_else(|| MigrateError::UnexpectedRow {
            query: "information_schema.columns",
            message: "missing column_name".to_string(),
        })?;
        let data_type = text("data_type").ok_or_else(|| MigrateError::UnexpectedRow {
            query: "information_schema.columns",
            message: format!("missing data_type for column '{name}'"),
        })?;

        Ok(Self {
            character_maximum_length: row.get("character_maximum_length").and_then(Value::as_i64),
            default_expression: text("column_default"),
            nullable: text("is_nullable").is_some_and(|v| v.eq_ignore_ascii_case("YES")),
            name,
            data_type,
        })
    }

    /// Renders this column as a row of [`COLUMNS_SQL`].
    #[must_use]
    pub fn to_row(&self) -> RawRow {
        let value = json!({
            "column_name": self.name,
            "data_type": self.data_type,
            "character_maximum_length": self.character_maximum_length,
            "column_default": self.default_expression,
            "is_nullable": if self.nullable { "YES" } else { "NO" },
        });
        match value {
            Value::Object(map) => map,
            _ => RawRow::new(),
        }
    }
}

/// Snapshot of one table and the enum types it references.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveTable {
    pub exists: bool,
    pub columns: Vec<LiveColumn>,
    /// Current labels per existing enum type. Absent types are not listed.
    pub enum_labels: BTreeMap<String, Vec<String>>,
}

impl LiveTable {
    /// A table that does not exist yet.
    #[must_use]
    pub fn missing() -> Self {
        Self::default()
    }

    /// Looks up a live column by name.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&LiveColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Reads the live shape of `table` and the labels of `enum_types`.
pub async fn introspect<S: Session>(
    session: &mut S,
    table: &str,
    enum_types: &[String],
) -> Result<LiveTable> {
    let params = [Value::String(table.to_string())];
    let exists = session
        .fetch_all(TABLE_EXISTS_SQL, &params)
        .await?
        .first()
        .and_then(|row| row.get("exists"))
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let columns = if exists {
        session
            .fetch_all(COLUMNS_SQL, &params)
            .await?
            .iter()
            .map(LiveColumn::from_row)
            .collect::<Result<Vec<_>>>()?
    } else {
        Vec::new()
    };

    let mut enum_labels = BTreeMap::new();
    for type_name in enum_types {
        let rows = session
            .fetch_all(ENUM_LABELS_SQL, &[Value::String(type_name.clone())])
            .await?;
        if rows.is_empty() {
            continue;
        }
        let labels = rows
            .iter()
            .filter_map(|row| row.get("label").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        enum_labels.insert(type_name.clone(), labels);
    }

    debug!(
        table = %table,
        exists,
        columns = columns.len(),
        enum_types = enum_labels.len(),
        "Introspected live table"
    );

    Ok(LiveTable {
        exists,
        columns,
        enum_labels,
    })
}
