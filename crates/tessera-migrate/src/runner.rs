//! Migration runner.
//!
//! Global migrations run first, alphabetically by identifier, each in its own
//! transaction. Each table is then migrated in one transaction: before hooks
//! of its pending table-scoped migrations, the schema-diff plan, then their
//! bodies and after hooks, then the ledger writes. Applied units are never
//! re-executed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use tessera_schema::ColumnDefinition;
use tracing::{debug, info, warn};

use crate::error::{MigrateError, Result};
use crate::introspect::introspect;
use crate::ledger::{self, AppliedMigration};
use crate::planner::{self, MigrationPlan};
use crate::session::{Connector, DynSession, Session, TxSession};

/// Async hook body. Receives the transaction the migration runs in.
pub type HookFn =
    Arc<dyn for<'s> Fn(&'s mut dyn DynSession) -> LocalBoxFuture<'s, Result<()>> + Send + Sync>;

/// A step run inside a migration's transaction.
#[derive(Clone)]
pub enum Hook {
    /// SQL scripts, executed in order.
    Sql(Vec<String>),
    /// Code with access to the transaction.
    Call(HookFn),
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sql(statements) => f.debug_tuple("Sql").field(statements).finish(),
            Self::Call(_) => f.write_str("Call(..)"),
        }
    }
}

impl Hook {
    /// A hook running SQL scripts.
    #[must_use]
    pub fn sql<I, S>(statements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Sql(statements.into_iter().map(Into::into).collect())
    }

    /// A hook running an async closure.
    #[must_use]
    pub fn call<F>(f: F) -> Self
    where
        F: for<'s> Fn(&'s mut dyn DynSession) -> LocalBoxFuture<'s, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self::Call(Arc::new(f))
    }

    async fn run<S: Session>(&self, session: &mut S) -> Result<()> {
        match self {
            Self::Sql(statements) => {
                for sql in statements {
                    debug!(sql = %sql, "Executing hook SQL");
                    session.execute_script(sql).await?;
                }
                Ok(())
            }
            Self::Call(f) => {
                let session: &mut dyn DynSession = session;
                f(session).await
            }
        }
    }
}

/// A named migration unit.
#[derive(Debug, Clone)]
pub struct Migration {
    /// Identifier recorded in the ledger.
    pub id: String,
    pub before: Vec<Hook>,
    /// Main body. For table-scoped migrations it runs after the schema plan.
    pub up: Vec<Hook>,
    pub after: Vec<Hook>,
}

impl Migration {
    /// Creates an empty migration.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            before: Vec::new(),
            up: Vec::new(),
            after: Vec::new(),
        }
    }

    /// Creates a migration whose body is one SQL script.
    #[must_use]
    pub fn from_sql(id: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(id).up(Hook::Sql(vec![sql.into()]))
    }

    #[must_use]
    pub fn before(mut self, hook: Hook) -> Self {
        self.before.push(hook);
        self
    }

    #[must_use]
    pub fn up(mut self, hook: Hook) -> Self {
        self.up.push(hook);
        self
    }

    #[must_use]
    pub fn after(mut self, hook: Hook) -> Self {
        self.after.push(hook);
        self
    }
}

/// Lifecycle of a migration unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Pending,
    Running,
    Applied,
    Failed,
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// State of one registered unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitReport {
    pub migration: String,
    /// `None` for global migrations.
    pub collection: Option<String>,
    pub state: UnitState,
}

/// Outcome of migrating one table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableReport {
    /// The schema plan that was executed.
    pub plan: MigrationPlan,
    /// Table-scoped migrations applied in this pass.
    pub applied: Vec<String>,
}

/// Orders and executes migrations.
#[derive(Debug, Clone, Default)]
pub struct MigrationRunner {
    global: Vec<Migration>,
    tables: BTreeMap<String, Vec<Migration>>,
}

impl MigrationRunner {
    /// Creates a runner with no registered migrations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a global migration.
    #[must_use]
    pub fn global(mut self, migration: Migration) -> Self {
        self.global.push(migration);
        self
    }

    /// Registers a migration scoped to `table`.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>, migration: Migration) -> Self {
        self.tables.entry(table.into()).or_default().push(migration);
        self
    }

    /// Registers every `*.sql` file in `dir` as a global migration named after
    /// its file stem.
    pub fn load_dir(mut self, dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(MigrateError::MigrationsDirNotFound(dir.to_path_buf()));
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "sql") {
                files.push(path);
            }
        }
        files.sort();

        for path in files {
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                warn!(path = %path.display(), "Skipping migration file with non UTF-8 name");
                continue;
            };
            let sql = std::fs::read_to_string(&path)?;
            debug!(migration = %id, path = %path.display(), "Loaded migration file");
            self.global.push(Migration::from_sql(id, sql));
        }
        Ok(self)
    }

    /// Global migrations in execution order.
    #[must_use]
    pub fn global_migrations(&self) -> Vec<&Migration> {
        let mut migrations: Vec<&Migration> = self.global.iter().collect();
        migrations.sort_by(|a, b| a.id.cmp(&b.id));
        migrations
    }

    /// Migrations registered for `table`, in registration order.
    #[must_use]
    pub fn table_migrations(&self, table: &str) -> &[Migration] {
        self.tables.get(table).map_or(&[], Vec::as_slice)
    }

    fn check_unique(migrations: &[&Migration]) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for m in migrations {
            if !seen.insert(m.id.as_str()) {
                return Err(MigrateError::DuplicateMigration(m.id.clone()));
            }
        }
        Ok(())
    }

    /// Ensures the ledger table exists.
    pub async fn init<C: Connector>(&self, connector: &C) -> Result<()> {
        let mut tx = connector.begin().await?;
        let result = ledger::ensure_table(&mut tx).await;
        finish(tx, result).await
    }

    /// Runs every pending global migration, each in its own transaction.
    ///
    /// Stops at the first failure; earlier migrations stay applied.
    pub async fn run_global<C: Connector>(&self, connector: &C) -> Result<Vec<String>> {
        let migrations = self.global_migrations();
        Self::check_unique(&migrations)?;
        self.init(connector).await?;

        let mut applied = Vec::new();
        for migration in migrations {
            let mut tx = connector.begin().await?;
            let result = apply_global(&mut tx, migration).await;
            let ran = finish(tx, result).await.inspect_err(|e| {
                warn!(
                    migration = %migration.id,
                    state = %UnitState::Failed,
                    error = %e,
                    "Migration failed"
                );
            })?;
            if ran {
                info!(migration = %migration.id, state = %UnitState::Applied, "Migration applied");
                applied.push(migration.id.clone());
            }
        }
        Ok(applied)
    }

    /// Migrates one table in a single transaction.
    pub async fn migrate_table<C: Connector>(
        &self,
        connector: &C,
        table: &str,
        target: &[ColumnDefinition],
    ) -> Result<TableReport> {
        let mut tx = connector.begin().await?;
        let result = self.migrate_table_in(&mut tx, table, target).await;
        finish(tx, result).await.inspect_err(|e| {
            warn!(
                table = %table,
                state = %UnitState::Failed,
                error = %e,
                "Table migration rolled back"
            );
        })
    }

    /// Migrates one table inside a caller-owned transaction.
    pub async fn migrate_table_in<S: Session>(
        &self,
        session: &mut S,
        table: &str,
        target: &[ColumnDefinition],
    ) -> Result<TableReport> {
        let registered: Vec<&Migration> = self.table_migrations(table).iter().collect();
        Self::check_unique(&registered)?;
        ledger::ensure_table(session).await?;

        let mut pending = Vec::new();
        for migration in registered {
            if !ledger::is_applied(session, &migration.id, Some(table)).await? {
                pending.push(migration);
            }
        }

        info!(table = %table, pending = pending.len(), "Migrating table");

        for migration in &pending {
            debug!(
                table = %table,
                migration = %migration.id,
                state = %UnitState::Running,
                "Running before hooks"
            );
            run_hooks(session, &migration.id, &migration.before).await?;
        }

        let plan = self.plan_table(session, table, target).await?;
        for sql in plan.sql() {
            debug!(table = %table, sql = %sql, "Executing SQL");
            Session::execute(session, &sql, &[]).await?;
        }

        let mut applied = Vec::new();
        for migration in &pending {
            run_hooks(session, &migration.id, &migration.up).await?;
            run_hooks(session, &migration.id, &migration.after).await?;
            ledger::record_applied(session, &migration.id, Some(table)).await?;
            applied.push(migration.id.clone());
        }

        info!(
            table = %table,
            statements = plan.sql().len(),
            applied = applied.len(),
            "Table migrated"
        );
        Ok(TableReport { plan, applied })
    }

    /// Returns the plan for `table` without executing it.
    pub async fn plan_table<S: Session>(
        &self,
        session: &mut S,
        table: &str,
        target: &[ColumnDefinition],
    ) -> Result<MigrationPlan> {
        let enum_types: Vec<String> = target
            .iter()
            .filter_map(|c| c.enum_type.as_ref().map(|e| e.name.clone()))
            .collect();
        let live = introspect(session, table, &enum_types).await?;
        planner::plan(table, &live, target)
    }

    /// Returns the SQL a migration of `table` would execute.
    pub async fn sql_for_table<S: Session>(
        &self,
        session: &mut S,
        table: &str,
        target: &[ColumnDefinition],
    ) -> Result<Vec<String>> {
        Ok(self.plan_table(session, table, target).await?.sql())
    }

    /// Lists applied ledger entries.
    pub async fn applied<S: Session>(&self, session: &mut S) -> Result<Vec<AppliedMigration>> {
        ledger::applied(session).await
    }

    /// Reports every registered unit as applied or pending.
    pub async fn status<S: Session>(&self, session: &mut S) -> Result<Vec<UnitReport>> {
        let mut reports = Vec::new();
        let globals = ledger::applied_set(session, None).await?;
        for migration in self.global_migrations() {
            reports.push(UnitReport {
                migration: migration.id.clone(),
                collection: None,
                state: state_of(globals.contains(&migration.id)),
            });
        }
        for (table, migrations) in &self.tables {
            let done = ledger::applied_set(session, Some(table)).await?;
            for migration in migrations {
                reports.push(UnitReport {
                    migration: migration.id.clone(),
                    collection: Some(table.clone()),
                    state: state_of(done.contains(&migration.id)),
                });
            }
        }
        Ok(reports)
    }
}

fn state_of(applied: bool) -> UnitState {
    if applied {
        UnitState::Applied
    } else {
        UnitState::Pending
    }
}

/// Applies one global migration. Returns `false` if it was already applied.
async fn apply_global<S: Session>(session: &mut S, migration: &Migration) -> Result<bool> {
    if ledger::is_applied(session, &migration.id, None).await? {
        debug!(migration = %migration.id, "Migration already applied, skipping");
        return Ok(false);
    }

    info!(migration = %migration.id, state = %UnitState::Running, "Applying migration");
    run_hooks(session, &migration.id, &migration.before).await?;
    run_hooks(session, &migration.id, &migration.up).await?;
    run_hooks(session, &migration.id, &migration.after).await?;
    ledger::record_applied(session, &migration.id, None).await?;
    Ok(true)
}

async fn run_hooks<S: Session>(session: &mut S, migration: &str, hooks: &[Hook]) -> Result<()> {
    for hook in hooks {
        hook.run(session).await.map_err(|e| match e {
            MigrateError::Database(_) | MigrateError::Planning { .. } => e,
            other => MigrateError::Hook {
                migration: migration.to_string(),
                message: other.to_string(),
            },
        })?;
    }
    Ok(())
}

/// Commits on success, rolls back on failure.
///
/// A failed rollback is logged; the original error is returned.
pub async fn finish<T, R, E>(
    tx: T,
    result: std::result::Result<R, E>,
) -> std::result::Result<R, E>
where
    T: TxSession,
    E: From<sqlx::Error>,
{
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspect::LiveColumn;
    use crate::testing::FakeDatabase;
    use serde_json::Value;
    use tessera_schema::{normalize_schema, Field, Schema};

    fn users() -> Vec<ColumnDefinition> {
        let schema = Schema::new()
            .field("id", Field::number())
            .field("name", Field::string())
            .field("age", Field::integer().optional());
        normalize_schema("users", &schema)
    }

    fn live(name: &str, data_type: &str, nullable: bool) -> LiveColumn {
        LiveColumn {
            name: name.to_string(),
            data_type: data_type.to_string(),
            character_maximum_length: None,
            default_expression: None,
            nullable,
        }
    }

    #[tokio::test]
    async fn test_global_migrations_run_alphabetically() {
        let db = FakeDatabase::new();
        let runner = MigrationRunner::new()
            .global(Migration::from_sql("0002_b", "SELECT 2"))
            .global(Migration::from_sql("0001_a", "SELECT 1"));

        let applied = runner.run_global(&db).await.unwrap();

        assert_eq!(applied, vec!["0001_a", "0002_b"]);
        let statements = db.statements();
        let first = statements.iter().position(|s| s == "SELECT 1").unwrap();
        let second = statements.iter().position(|s| s == "SELECT 2").unwrap();
        assert!(first < second);
        assert_eq!(
            db.ledger(),
            vec![("0001_a".to_string(), None), ("0002_b".to_string(), None)]
        );
    }

    #[tokio::test]
    async fn test_applied_global_migration_is_skipped() {
        let db = FakeDatabase::new();
        db.with_applied("0001_a", None);
        let runner = MigrationRunner::new()
            .global(Migration::from_sql("0001_a", "SELECT 1"))
            .global(Migration::from_sql("0002_b", "SELECT 2"));

        let applied = runner.run_global(&db).await.unwrap();

        assert_eq!(applied, vec!["0002_b"]);
        assert!(!db.statements().iter().any(|s| s == "SELECT 1"));
    }

    #[tokio::test]
    async fn test_global_failure_keeps_earlier_units() {
        let db = FakeDatabase::new();
        db.fail_on("boom");
        let runner = MigrationRunner::new()
            .global(Migration::from_sql("0001_ok", "SELECT 1"))
            .global(Migration::from_sql("0002_bad", "SELECT boom"))
            .global(Migration::from_sql("0003_never", "SELECT 3"));

        let err = runner.run_global(&db).await.unwrap_err();

        assert!(matches!(err, MigrateError::Database(_)));
        assert_eq!(db.ledger(), vec![("0001_ok".to_string(), None)]);
        assert!(!db.statements().iter().any(|s| s == "SELECT 3"));
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_global_ids_rejected() {
        let db = FakeDatabase::new();
        let runner = MigrationRunner::new()
            .global(Migration::from_sql("0001_a", "SELECT 1"))
            .global(Migration::from_sql("0001_a", "SELECT 2"));

        let err = runner.run_global(&db).await.unwrap_err();
        assert!(matches!(err, MigrateError::DuplicateMigration(id) if id == "0001_a"));
    }

    #[test]
    fn test_load_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0002_second.sql"), "SELECT 2;").unwrap();
        std::fs::write(dir.path().join("0001_first.sql"), "SELECT 1;").unwrap();
        std::fs::write(dir.path().join("README.md"), "not a migration").unwrap();

        let runner = MigrationRunner::new().load_dir(dir.path()).unwrap();
        let ids: Vec<&str> = runner
            .global_migrations()
            .iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["0001_first", "0002_second"]);
    }

    #[test]
    fn test_load_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let err = MigrationRunner::new()
            .load_dir(dir.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, MigrateError::MigrationsDirNotFound(_)));
    }

    #[tokio::test]
    async fn test_table_sequence_order() {
        let db = FakeDatabase::new();
        let runner = MigrationRunner::new().table(
            "users",
            Migration::new("0001_seed")
                .before(Hook::sql(["SELECT 'before'"]))
                .after(Hook::sql(["INSERT INTO users (name) VALUES ('root')"])),
        );

        let report = runner.migrate_table(&db, "users", &users()).await.unwrap();

        assert_eq!(report.applied, vec!["0001_seed"]);
        let statements = db.statements();
        assert_eq!(statements[0], "SELECT 'before'");
        assert!(statements[1].starts_with("CREATE TABLE \"users\""));
        assert_eq!(statements[2], "INSERT INTO users (name) VALUES ('root')");
        assert_eq!(
            db.ledger(),
            vec![("0001_seed".to_string(), Some("users".to_string()))]
        );
        assert_eq!(db.commits(), 1);
    }

    #[tokio::test]
    async fn test_applied_table_migration_not_rerun() {
        let db = FakeDatabase::new();
        db.with_applied("0001_seed", Some("users"));
        let runner = MigrationRunner::new().table(
            "users",
            Migration::new("0001_seed").after(Hook::sql(["SELECT 'seed'"])),
        );

        let report = runner.migrate_table(&db, "users", &users()).await.unwrap();

        assert!(report.applied.is_empty());
        assert!(!db.statements().iter().any(|s| s == "SELECT 'seed'"));
    }

    #[tokio::test]
    async fn test_table_failure_rolls_back_everything() {
        let db = FakeDatabase::new();
        db.fail_on("CREATE TABLE");
        let runner = MigrationRunner::new().table(
            "users",
            Migration::new("0001_seed").before(Hook::sql(["SELECT 'before'"])),
        );

        let err = runner.migrate_table(&db, "users", &users()).await.unwrap_err();

        assert!(matches!(err, MigrateError::Database(_)));
        assert!(db.statements().is_empty());
        assert!(db.ledger().is_empty());
        assert_eq!(db.rollbacks(), 1);
        assert_eq!(db.commits(), 0);
    }

    #[tokio::test]
    async fn test_planning_failure_rolls_back() {
        let db = FakeDatabase::new();
        db.with_table(
            "users",
            vec![
                live("id", "integer", false),
                live("name", "text", false),
                live("age", "integer", true),
            ],
        );
        let schema = Schema::new()
            .field("id", Field::number())
            .field("name", Field::string())
            .field("age", Field::integer());
        let target = normalize_schema("users", &schema);

        let err = MigrationRunner::new()
            .migrate_table(&db, "users", &target)
            .await
            .unwrap_err();

        assert!(matches!(err, MigrateError::Planning { .. }));
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_new_enum_default_rejected_before_any_statement() {
        let db = FakeDatabase::new();
        db.with_table("posts", vec![live("status", "USER-DEFINED", true)]);
        db.with_enum("posts_status", ["a", "b"]);
        let schema =
            Schema::new().field("status", Field::enumeration(["a", "b", "c"]).default("c"));
        let target = normalize_schema("posts", &schema);

        let err = MigrationRunner::new()
            .migrate_table(&db, "posts", &target)
            .await
            .unwrap_err();

        assert!(matches!(err, MigrateError::PendingEnumLabel { .. }));
        assert!(db.statements().is_empty());
        assert_eq!(db.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_call_hook_receives_transaction() {
        let db = FakeDatabase::new();
        let runner = MigrationRunner::new().table(
            "users",
            Migration::new("0001_touch").after(Hook::call(|session| {
                Box::pin(async move {
                    session
                        .execute(
                            "UPDATE users SET name = $1",
                            &[Value::String("x".to_string())],
                        )
                        .await?;
                    Ok::<_, MigrateError>(())
                })
            })),
        );

        runner.migrate_table(&db, "users", &users()).await.unwrap();

        let executed = db.executed();
        let update = executed
            .iter()
            .find(|e| e.sql == "UPDATE users SET name = $1")
            .unwrap();
        assert_eq!(update.params, vec![Value::String("x".to_string())]);
    }

    #[tokio::test]
    async fn test_sql_for_table_executes_nothing() {
        let mut db = FakeDatabase::new();
        let sql = MigrationRunner::new()
            .sql_for_table(&mut db, "users", &users())
            .await
            .unwrap();

        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with("CREATE TABLE"));
        assert!(db.statements().is_empty());
    }

    #[tokio::test]
    async fn test_status() {
        let mut db = FakeDatabase::new();
        db.with_applied("0001_a", None);
        let runner = MigrationRunner::new()
            .global(Migration::from_sql("0001_a", "SELECT 1"))
            .global(Migration::from_sql("0002_b", "SELECT 2"))
            .table("users", Migration::new("0001_seed"));

        let status = runner.status(&mut db).await.unwrap();

        assert_eq!(status.len(), 3);
        assert_eq!(status[0].state, UnitState::Applied);
        assert_eq!(status[1].state, UnitState::Pending);
        assert_eq!(status[2].collection.as_deref(), Some("users"));
        assert_eq!(status[2].state, UnitState::Pending);
    }
}
