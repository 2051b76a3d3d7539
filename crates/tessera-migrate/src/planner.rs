//! Schema differ and migration planner.
//!
//! Compares the normalized target columns of one table against its live
//! snapshot and produces the statements that reconcile them. Plans only ever
//! add: columns are never dropped or renamed, enum labels never removed.

use tessera_schema::ddl::{quote_identifier, render, render_default};
use serde_json::Value;
use tessera_schema::{expected_live_type, ColumnDefinition, DefaultValue};
use tracing::debug;

use crate::error::{MigrateError, Result};
use crate::introspect::LiveTable;

/// Ordered statements reconciling one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    /// Data backfills, run before any constraint is tightened.
    pub pre_statements: Vec<String>,
    /// Enum type actions followed by `CREATE TABLE` or one `ALTER TABLE`.
    pub statements: Vec<String>,
}

impl MigrationPlan {
    /// Returns `true` if the live table already matches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pre_statements.is_empty() && self.statements.is_empty()
    }

    /// Returns every statement in execution order.
    #[must_use]
    pub fn sql(&self) -> Vec<String> {
        self.pre_statements
            .iter()
            .chain(&self.statements)
            .cloned()
            .collect()
    }
}

/// One entry of the batched `ALTER TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ColumnChange {
    Add(String),
    SetType {
        column: String,
        physical_type: String,
        cast: bool,
    },
    SetDefault {
        column: String,
        default: String,
    },
    SetNotNull(String),
    DropNotNull(String),
}

impl ColumnChange {
    fn to_sql(&self) -> String {
        match self {
            Self::Add(clause) => format!("ADD COLUMN {clause}"),
            Self::SetType {
                column,
                physical_type,
                cast,
            } => {
                let name = quote_identifier(column);
                if *cast {
                    format!(
                        "ALTER COLUMN {name} TYPE {physical_type} USING {name}::{physical_type}"
                    )
                } else {
                    format!("ALTER COLUMN {name} TYPE {physical_type}")
                }
            }
            Self::SetDefault { column, default } => {
                format!(
                    "ALTER COLUMN {} SET DEFAULT {}",
                    quote_identifier(column),
                    default
                )
            }
            Self::SetNotNull(column) => {
                format!("ALTER COLUMN {} SET NOT NULL", quote_identifier(column))
            }
            Self::DropNotNull(column) => {
                format!("ALTER COLUMN {} DROP NOT NULL", quote_identifier(column))
            }
        }
    }
}

/// The default label of an enum column when its live type lacks it.
fn pending_default_label<'c>(column: &'c ColumnDefinition, live: &LiveTable) -> Option<&'c str> {
    let labels = live.enum_labels.get(&column.enum_type.as_ref()?.name)?;
    match &column.default {
        Some(DefaultValue::Value(Value::String(label))) if !labels.contains(label) => {
            Some(label.as_str())
        }
        _ => None,
    }
}

/// Rejects a plan that would write an enum label added in the same pass.
///
/// PostgreSQL refuses to use a value from `ALTER TYPE .. ADD VALUE` before
/// the adding transaction commits.
fn check_pending_labels(table: &str, live: &LiveTable, target: &[ColumnDefinition]) -> Result<()> {
    for column in target {
        let Some(label) = pending_default_label(column, live) else {
            continue;
        };
        let uses_default = live.column(&column.name).map_or(true, |live_column| {
            live_column.default_expression.is_none() || (live_column.nullable && !column.nullable)
        });
        if uses_default {
            return Err(MigrateError::PendingEnumLabel {
                table: table.to_string(),
                column: column.name.clone(),
                label: label.to_string(),
            });
        }
    }
    Ok(())
}

/// Plans the migration of `table` from `live` to `target`.
///
/// Fails with [`MigrateError::Planning`] when a nullable column must become
/// NOT NULL and has no default to backfill existing nulls with, and with
/// [`MigrateError::PendingEnumLabel`] when a default needs an enum label the
/// same plan adds.
pub fn plan(table: &str, live: &LiveTable, target: &[ColumnDefinition]) -> Result<MigrationPlan> {
    check_pending_labels(table, live, target)?;
    let mut plan = MigrationPlan::default();

    for column in target {
        if let Some(action) = render(column).preflight {
            let existing = live.enum_labels.get(&action.type_name).map(Vec::as_slice);
            plan.statements.extend(action.statements(existing));
        }
    }

    let table_name = quote_identifier(table);

    if !live.exists {
        let clauses: Vec<String> = target
            .iter()
            .map(|c| format!("    {}", render(c).clause))
            .collect();
        plan.statements.push(format!(
            "CREATE TABLE {} (\n{}\n)",
            table_name,
            clauses.join(",\n")
        ));
        debug!(table = %table, columns = target.len(), "Planned table creation");
        return Ok(plan);
    }

    let mut changes = Vec::new();
    for column in target {
        let Some(live_column) = live.column(&column.name) else {
            changes.push(ColumnChange::Add(render(column).clause));
            continue;
        };
        if column.identity.is_some() {
            continue;
        }

        if live_column.reported_type() != expected_live_type(column) {
            changes.push(ColumnChange::SetType {
                column: column.name.clone(),
                physical_type: column.physical_type.clone(),
                cast: column.enum_type.is_some(),
            });
        }

        if let (Some(default), None) = (&column.default, &live_column.default_expression) {
            changes.push(ColumnChange::SetDefault {
                column: column.name.clone(),
                default: render_default(column, default),
            });
        }

        match (live_column.nullable, column.nullable) {
            (true, false) => {
                let default = column
                    .default
                    .as_ref()
                    .ok_or_else(|| MigrateError::Planning {
                        table: table.to_string(),
                        column: column.name.clone(),
                    })?;
                let name = quote_identifier(&column.name);
                plan.pre_statements.push(format!(
                    "UPDATE {} SET {} = {} WHERE {} IS NULL",
                    table_name,
                    name,
                    render_default(column, default),
                    name
                ));
                changes.push(ColumnChange::SetNotNull(column.name.clone()));
            }
            (false, true) => changes.push(ColumnChange::DropNotNull(column.name.clone())),
            _ => {}
        }
    }

    if !changes.is_empty() {
        let entries: Vec<String> = changes.iter().map(ColumnChange::to_sql).collect();
        plan.statements
            .push(format!("ALTER TABLE {} {}", table_name, entries.join(", ")));
    }

    debug!(
        table = %table,
        changes = changes.len(),
        backfills = plan.pre_statements.len(),
        "Planned table alteration"
    );
    Ok(plan)
}
