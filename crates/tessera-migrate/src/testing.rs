//! Recording in-memory session for tests.
//!
//! [`FakeDatabase`] answers the introspection and ledger queries from
//! in-memory state and records every other statement. Transactions buffer
//! their statements and ledger writes until commit.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{json, Value};

use crate::introspect::{LiveColumn, COLUMNS_SQL, ENUM_LABELS_SQL, TABLE_EXISTS_SQL};
use crate::ledger::{CREATE_LEDGER_SQL, INSERT_APPLIED_SQL, IS_APPLIED_SQL, LIST_APPLIED_SQL};
use crate::session::{Connector, RawRow, Session, TxSession};

/// A statement recorded by the fake.
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, Vec<LiveColumn>>,
    enums: BTreeMap<String, Vec<String>>,
    ledger: Vec<(String, Option<String>)>,
    executed: Vec<Executed>,
    responses: Vec<(String, Vec<RawRow>)>,
    fail_on: Vec<String>,
    commits: usize,
    rollbacks: usize,
}

#[derive(Debug, Default)]
struct Pending {
    ledger: Vec<(String, Option<String>)>,
    executed: Vec<Executed>,
}

/// In-memory stand-in for a PostgreSQL pool.
#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    state: Arc<Mutex<State>>,
}

impl FakeDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declares an existing table with the given live columns.
    pub fn with_table(&self, table: &str, columns: Vec<LiveColumn>) -> &Self {
        self.state().tables.insert(table.to_string(), columns);
        self
    }

    /// Declares an existing enum type.
    pub fn with_enum<I, S>(&self, type_name: &str, labels: I) -> &Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels = labels.into_iter().map(Into::into).collect();
        self.state().enums.insert(type_name.to_string(), labels);
        self
    }

    /// Marks a migration as already applied.
    pub fn with_applied(&self, migration: &str, collection: Option<&str>) -> &Self {
        self.state()
            .ledger
            .push((migration.to_string(), collection.map(str::to_string)));
        self
    }

    /// Returns `rows` for any other query starting with `prefix`.
    pub fn respond(&self, prefix: &str, rows: Vec<Value>) -> &Self {
        let rows = rows
            .into_iter()
            .filter_map(|row| match row {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        self.state().responses.push((prefix.to_string(), rows));
        self
    }

    /// Fails every statement containing `needle`.
    pub fn fail_on(&self, needle: &str) -> &Self {
        self.state().fail_on.push(needle.to_string());
        self
    }

    /// Committed statements, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<Executed> {
        self.state().executed.clone()
    }

    /// Committed statement texts, in order.
    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.state().executed.iter().map(|e| e.sql.clone()).collect()
    }

    /// Committed ledger entries.
    #[must_use]
    pub fn ledger(&self) -> Vec<(String, Option<String>)> {
        self.state().ledger.clone()
    }

    #[must_use]
    pub fn commits(&self) -> usize {
        self.state().commits
    }

    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.state().rollbacks
    }

    fn handle(
        &self,
        pending: &mut Pending,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<RawRow>, sqlx::Error> {
        let state = self.state();
        if state.fail_on.iter().any(|needle| sql.contains(needle.as_str())) {
            return Err(sqlx::Error::Protocol(format!("fake failure: {sql}")));
        }
        let first = params.first().and_then(Value::as_str).unwrap_or_default();

        let rows = match sql {
            TABLE_EXISTS_SQL => vec![object(json!({
                "exists": state.tables.contains_key(first)
            }))],
            COLUMNS_SQL => state
                .tables
                .get(first)
                .map(|cols| cols.iter().map(LiveColumn::to_row).collect())
                .unwrap_or_default(),
            ENUM_LABELS_SQL => state
                .enums
                .get(first)
                .map(|labels| {
                    labels
                        .iter()
                        .map(|l| object(json!({ "type_name": first, "label": l })))
                        .collect()
                })
                .unwrap_or_default(),
            IS_APPLIED_SQL => {
                let version = params.get(1).and_then(Value::as_str).map(str::to_string);
                let key = (first.to_string(), version);
                if state.ledger.contains(&key) || pending.ledger.contains(&key) {
                    vec![object(json!({ "applied": 1 }))]
                } else {
                    Vec::new()
                }
            }
            LIST_APPLIED_SQL => state
                .ledger
                .iter()
                .enumerate()
                .map(|(i, (migration, collection))| {
                    object(json!({
                        "id": i + 1,
                        "migration": migration,
                        "collection": collection,
                        "applied_at": "2024-01-01 00:00:00",
                    }))
                })
                .collect(),
            _ => {
                if sql == INSERT_APPLIED_SQL {
                    pending.ledger.push((
                        first.to_string(),
                        params.get(1).and_then(Value::as_str).map(str::to_string),
                    ));
                }
                if sql != CREATE_LEDGER_SQL {
                    pending.executed.push(Executed {
                        sql: sql.to_string(),
                        params: params.to_vec(),
                    });
                }
                state
                    .responses
                    .iter()
                    .find(|(prefix, _)| sql.starts_with(prefix.as_str()))
                    .map(|(_, rows)| rows.clone())
                    .unwrap_or_default()
            }
        };
        Ok(rows)
    }

    fn apply(&self, pending: Pending) {
        let mut state = self.state();
        state.ledger.extend(pending.ledger);
        state.executed.extend(pending.executed);
    }
}

fn object(value: Value) -> RawRow {
    match value {
        Value::Object(map) => map,
        _ => RawRow::new(),
    }
}

impl Session for FakeDatabase {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error> {
        let mut pending = Pending::default();
        let rows = self.handle(&mut pending, sql, params)?;
        self.apply(pending);
        Ok(rows.len() as u64)
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<RawRow>, sqlx::Error> {
        let mut pending = Pending::default();
        let rows = self.handle(&mut pending, sql, params)?;
        self.apply(pending);
        Ok(rows)
    }

    async fn execute_script(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        Session::execute(self, sql, &[]).await
    }
}

/// A transaction on a [`FakeDatabase`].
#[derive(Debug)]
pub struct FakeTransaction {
    db: FakeDatabase,
    pending: Pending,
}

impl Session for FakeTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error> {
        let rows = self.db.handle(&mut self.pending, sql, params)?;
        Ok(rows.len() as u64)
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<RawRow>, sqlx::Error> {
        self.db.handle(&mut self.pending, sql, params)
    }

    async fn execute_script(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        Session::execute(self, sql, &[]).await
    }
}

impl TxSession for FakeTransaction {
    async fn commit(self) -> Result<(), sqlx::Error> {
        self.db.state().commits += 1;
        self.db.apply(self.pending);
        Ok(())
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        self.db.state().rollbacks += 1;
        Ok(())
    }
}

impl Connector for FakeDatabase {
    type Tx = FakeTransaction;

    async fn begin(&self) -> Result<Self::Tx, sqlx::Error> {
        Ok(FakeTransaction {
            db: self.clone(),
            pending: Pending::default(),
        })
    }
}
