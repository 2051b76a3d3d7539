//! Migration ledger.
//!
//! Manages the `migrations` table recording which units have been applied.
//! Global migrations are recorded with a `NULL` collection; table-scoped ones
//! with the table name. `NULL` scopes are compared with
//! `IS NOT DISTINCT FROM`, so the `(migration, collection)` pair is unique for
//! both.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use serde_json::Value;

use crate::error::{MigrateError, Result};
use crate::session::{RawRow, Session};

/// SQL to create the ledger table.
pub const CREATE_LEDGER_SQL: &str = "CREATE TABLE IF NOT EXISTS migrations (
    id SERIAL PRIMARY KEY,
    migration VARCHAR(500) NOT NULL,
    collection VARCHAR(255) NULL,
    applied_at TIMESTAMP DEFAULT now(),
    UNIQUE (migration, collection)
)";

pub const IS_APPLIED_SQL: &str = "SELECT 1 AS applied FROM migrations \
     WHERE migration = $1 AND collection IS NOT DISTINCT FROM $2";

pub const INSERT_APPLIED_SQL: &str =
    "INSERT INTO migrations (migration, collection) VALUES ($1, $2)";

pub const LIST_APPLIED_SQL: &str = "SELECT id, migration, collection, \
     to_char(applied_at, 'YYYY-MM-DD HH24:MI:SS') AS applied_at \
     FROM migrations ORDER BY id";

/// A record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    /// Unique ID in the ledger table.
    pub id: i64,
    /// Migration identifier.
    pub migration: String,
    /// Collection scope, `None` for global migrations.
    pub collection: Option<String>,
    /// When the migration was applied.
    pub applied_at: Option<NaiveDateTime>,
}

impl AppliedMigration {
    fn from_row(row: &RawRow) -> Result<Self> {
        let id = row.get("id").and_then(Value::as_i64);
        let migration = row.get("migration").and_then(Value::as_str);
        let (Some(id), Some(migration)) = (id, migration) else {
            return Err(MigrateError::UnexpectedRow {
                query: "migrations",
                message: format!("{row:?}"),
            });
        };

        Ok(Self {
            id,
            migration: migration.to_string(),
            collection: row
                .get("collection")
                .and_then(Value::as_str)
                .map(str::to_string),
            applied_at: row
                .get("applied_at")
                .and_then(Value::as_str)
                .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").ok()),
        })
    }

    /// Returns `collection/migration`, or the bare identifier for globals.
    #[must_use]
    pub fn label(&self) -> String {
        match &self.collection {
            Some(c) => format!("{}/{}", c, self.migration),
            None => self.migration.clone(),
        }
    }
}

fn scope(collection: Option<&str>) -> Value {
    collection.map_or(Value::Null, |c| Value::String(c.to_string()))
}

/// Ensures the ledger table exists.
pub async fn ensure_table<S: Session>(session: &mut S) -> Result<()> {
    session.execute(CREATE_LEDGER_SQL, &[]).await?;
    Ok(())
}

/// Checks if a migration has been applied in the given scope.
pub async fn is_applied<S: Session>(
    session: &mut S,
    migration: &str,
    collection: Option<&str>,
) -> Result<bool> {
    let rows = session
        .fetch_all(
            IS_APPLIED_SQL,
            &[Value::String(migration.to_string()), scope(collection)],
        )
        .await?;
    Ok(!rows.is_empty())
}

/// Records a migration as applied.
///
/// Fails with [`MigrateError::AlreadyApplied`] if the pair is already
/// recorded.
pub async fn record_applied<S: Session>(
    session: &mut S,
    migration: &str,
    collection: Option<&str>,
) -> Result<()> {
    if is_applied(session, migration, collection).await? {
        return Err(MigrateError::AlreadyApplied {
            migration: migration.to_string(),
            collection: collection.map(str::to_string),
        });
    }
    session
        .execute(
            INSERT_APPLIED_SQL,
            &[Value::String(migration.to_string()), scope(collection)],
        )
        .await?;
    Ok(())
}

/// Gets all applied migrations in application order.
pub async fn applied<S: Session>(session: &mut S) -> Result<Vec<AppliedMigration>> {
    session
        .fetch_all(LIST_APPLIED_SQL, &[])
        .await?
        .iter()
        .map(AppliedMigration::from_row)
        .collect()
}

/// Gets the identifiers applied in one scope.
pub async fn applied_set<S: Session>(
    session: &mut S,
    collection: Option<&str>,
) -> Result<HashSet<String>> {
    Ok(applied(session)
        .await?
        .into_iter()
        .filter(|m| m.collection.as_deref() == collection)
        .map(|m| m.migration)
        .collect())
}
