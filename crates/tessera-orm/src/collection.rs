//! Collection handle and query surface.
//!
//! A [`Collection`] binds a table name to its declared [`Schema`]. Queries
//! take a [`Fragment`] holding only the clause text (`WHERE ...`,
//! `ORDER BY ...`, a row object for writes); the collection completes it
//! into a full statement, validates rows against the schema, and decodes
//! results.
//!
//! Every operation comes in two forms: `op(..)` runs on the pool, and
//! `op_in(session, ..)` runs on a caller-supplied session such as an open
//! transaction.
//!
//! ```rust,ignore
//! let users = db
//!     .collection("users", Schema::new()
//!         .field("id", Field::number())
//!         .field("name", Field::string().max(50))
//!         .field("age", Field::number().optional()))
//!     .await?;
//!
//! users.insert(Fragment::bind(json!({ "name": "Ann" }))).await?;
//! let adults = users.select(fragment!("WHERE age >= $1 ORDER BY name", 18)?).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tessera_migrate::{
    finish, introspect, Connector, LiveColumn, LiveTable, Session, TableReport,
};
use tessera_schema::ddl::quote_identifier;
use tessera_schema::{normalize_schema, ColumnDefinition, Schema};
use tracing::{debug, info};

use crate::codec::{decode, encode, Row};
use crate::database::Database;
use crate::error::Result;
use crate::fragment::{Fragment, Part};
use crate::rewrite::{leading_object, rewrite, RewriteOptions, Statement, Verb};

/// Column types whose generated placeholders need an explicit cast.
fn needs_cast(column: &ColumnDefinition) -> bool {
    column.enum_type.is_some()
        || matches!(
            column.physical_type.as_str(),
            "NUMERIC" | "UUID" | "TIMESTAMPTZ" | "JSONB"
        )
}

/// A table and the schema its rows follow.
///
/// Clones share the cached live columns.
#[derive(Debug, Clone)]
pub struct Collection<C = sqlx::PgPool> {
    db: Database<C>,
    table: String,
    schema: Schema,
    columns: Vec<ColumnDefinition>,
    casts: BTreeMap<String, String>,
    live: Arc<RwLock<Option<LiveTable>>>,
}

impl<C> Collection<C>
where
    C: Connector + Session + Clone,
{
    pub(crate) fn new(db: Database<C>, table: &str, schema: Schema) -> Self {
        let columns = normalize_schema(table, &schema);
        let casts = columns
            .iter()
            .filter(|c| needs_cast(c))
            .map(|c| (c.name.clone(), c.physical_type.clone()))
            .collect();
        Self {
            db,
            table: table.to_string(),
            schema,
            columns,
            casts,
            live: Arc::new(RwLock::new(None)),
        }
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Target columns derived from the schema.
    #[must_use]
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Live columns seen by the last migration pass. Empty before the first.
    #[must_use]
    pub fn live_columns(&self) -> Vec<LiveColumn> {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|live| live.columns.clone())
            .unwrap_or_default()
    }

    /// True once a migration pass has run on this handle.
    #[must_use]
    pub fn is_migrated(&self) -> bool {
        self.live
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn options(&self) -> RewriteOptions {
        RewriteOptions::default().casts(self.casts.clone())
    }

    fn statement(
        &self,
        fragment: &Fragment,
        verb: &Verb,
        options: &RewriteOptions,
    ) -> Result<Statement> {
        rewrite(fragment, verb, &self.table, options)
    }

    async fn fetch<S: Session>(&self, session: &mut S, statement: Statement) -> Result<Vec<Row>> {
        debug!(
            table = %self.table,
            sql = %statement.sql,
            params = statement.params.len(),
            "Executing query"
        );
        let rows = session.fetch_all(&statement.sql, &statement.params).await?;
        Ok(rows.into_iter().map(|raw| decode(&self.schema, raw)).collect())
    }

    /// Replaces a leading row object with its validated, encoded form.
    fn prepare_write(&self, fragment: Fragment, partial: bool) -> Result<Fragment> {
        let Some(object) = leading_object(&fragment) else {
            return Ok(fragment);
        };
        let valid = if partial {
            self.schema.validate_patch(object)?
        } else {
            self.schema.validate_row(object)?
        };
        let encoded = encode(&self.schema, &valid);

        let mut parts = fragment.into_parts();
        parts[0] = Part {
            sql: String::new(),
            param: Some(Value::Object(encoded)),
        };
        Ok(Fragment::from_parts(parts))
    }

    // Migration

    /// Brings the table in line with the schema in one transaction, then
    /// refreshes the cached live columns.
    pub async fn migrate(&self) -> Result<TableReport> {
        let report = self
            .db
            .runner()
            .migrate_table(self.db.connector(), &self.table, &self.columns)
            .await?;
        self.refresh(&mut self.db.session()).await?;
        Ok(report)
    }

    pub async fn migrate_in<S: Session>(&self, session: &mut S) -> Result<TableReport> {
        let report = self
            .db
            .runner()
            .migrate_table_in(session, &self.table, &self.columns)
            .await?;
        self.refresh(session).await?;
        Ok(report)
    }

    async fn refresh<S: Session>(&self, session: &mut S) -> Result<()> {
        let enum_types: Vec<String> = self
            .columns
            .iter()
            .filter_map(|c| c.enum_type.as_ref().map(|e| e.name.clone()))
            .collect();
        let live = introspect(session, &self.table, &enum_types).await?;
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = Some(live);
        Ok(())
    }

    /// SQL the next migration pass would execute, without running it.
    pub async fn migration_sql(&self) -> Result<Vec<String>> {
        self.migration_sql_in(&mut self.db.session()).await
    }

    pub async fn migration_sql_in<S: Session>(&self, session: &mut S) -> Result<Vec<String>> {
        let sql = self
            .db
            .runner()
            .sql_for_table(session, &self.table, &self.columns)
            .await?;
        Ok(sql)
    }

    /// Drops the table and the enum types created for it.
    ///
    /// Ledger entries are kept.
    pub async fn drop_table(&self) -> Result<()> {
        let mut tx = self.db.connector().begin().await?;
        let result = self.drop_table_in(&mut tx).await;
        finish(tx, result).await
    }

    pub async fn drop_table_in<S: Session>(&self, session: &mut S) -> Result<()> {
        let mut statements = vec![format!(
            "DROP TABLE IF EXISTS {}",
            quote_identifier(&self.table)
        )];
        statements.extend(self.columns.iter().filter_map(|c| {
            c.enum_type
                .as_ref()
                .map(|e| format!("DROP TYPE IF EXISTS {}", quote_identifier(&e.name)))
        }));
        for sql in &statements {
            Session::execute(session, sql, &[]).await?;
        }
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!(table = %self.table, "Table dropped");
        Ok(())
    }

    // Reads

    /// Returns every row matching `fragment`.
    pub async fn select(&self, fragment: impl Into<Fragment>) -> Result<Vec<Row>> {
        self.select_in(&mut self.db.session(), fragment).await
    }

    pub async fn select_in<S: Session>(
        &self,
        session: &mut S,
        fragment: impl Into<Fragment>,
    ) -> Result<Vec<Row>> {
        let statement = self.statement(&fragment.into(), &Verb::Select, &self.options())?;
        self.fetch(session, statement).await
    }

    /// Returns the first row matching `fragment`.
    ///
    /// The fragment must not carry its own `LIMIT`.
    pub async fn select_one(&self, fragment: impl Into<Fragment>) -> Result<Option<Row>> {
        self.select_one_in(&mut self.db.session(), fragment).await
    }

    pub async fn select_one_in<S: Session>(
        &self,
        session: &mut S,
        fragment: impl Into<Fragment>,
    ) -> Result<Option<Row>> {
        let options = self.options().limit_one();
        let statement = self.statement(&fragment.into(), &Verb::Select, &options)?;
        Ok(self.fetch(session, statement).await?.into_iter().next())
    }

    /// Counts rows matching `fragment`.
    pub async fn count(&self, fragment: impl Into<Fragment>) -> Result<i64> {
        self.count_in(&mut self.db.session(), fragment).await
    }

    pub async fn count_in<S: Session>(
        &self,
        session: &mut S,
        fragment: impl Into<Fragment>,
    ) -> Result<i64> {
        let verb = Verb::SelectAggregate("count(*)".to_string());
        let statement = self.statement(&fragment.into(), &verb, &self.options())?;
        debug!(table = %self.table, sql = %statement.sql, "Executing count");
        let rows = session.fetch_all(&statement.sql, &statement.params).await?;
        let count = rows
            .first()
            .and_then(|row| row.get("count"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        Ok(count)
    }

    // Writes

    /// Runs an `INSERT` built from `fragment` and returns the inserted rows.
    ///
    /// A leading row object is validated as a complete row.
    pub async fn insert(&self, fragment: impl Into<Fragment>) -> Result<Vec<Row>> {
        self.insert_in(&mut self.db.session(), fragment).await
    }

    pub async fn insert_in<S: Session>(
        &self,
        session: &mut S,
        fragment: impl Into<Fragment>,
    ) -> Result<Vec<Row>> {
        let fragment = self.prepare_write(fragment.into(), false)?;
        let options = self.options().returning();
        let statement = self.statement(&fragment, &Verb::Insert, &options)?;
        self.fetch(session, statement).await
    }

    /// Validates and inserts one row, returning it as stored.
    pub async fn create(&self, row: Row) -> Result<Row> {
        self.create_in(&mut self.db.session(), row).await
    }

    pub async fn create_in<S: Session>(&self, session: &mut S, row: Row) -> Result<Row> {
        let rows = self.insert_in(session, Fragment::bind(Value::Object(row))).await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| sqlx::Error::RowNotFound.into())
    }

    /// Inserts rows in one transaction. Every row is validated before the
    /// first statement is sent.
    pub async fn create_many(&self, rows: Vec<Row>) -> Result<Vec<Row>> {
        let mut tx = self.db.connector().begin().await?;
        let result = self.create_many_in(&mut tx, rows).await;
        finish(tx, result).await
    }

    pub async fn create_many_in<S: Session>(
        &self,
        session: &mut S,
        rows: Vec<Row>,
    ) -> Result<Vec<Row>> {
        for row in &rows {
            self.schema.validate_row(row)?;
        }
        let mut created = Vec::with_capacity(rows.len());
        for row in rows {
            created.push(self.create_in(session, row).await?);
        }
        info!(table = %self.table, count = created.len(), "Rows created");
        Ok(created)
    }

    /// Runs an `UPDATE` built from `fragment` and returns the updated rows.
    ///
    /// A leading row object is validated as a patch: only its keys are
    /// checked and assigned.
    pub async fn update(&self, fragment: impl Into<Fragment>) -> Result<Vec<Row>> {
        self.update_in(&mut self.db.session(), fragment).await
    }

    pub async fn update_in<S: Session>(
        &self,
        session: &mut S,
        fragment: impl Into<Fragment>,
    ) -> Result<Vec<Row>> {
        let fragment = self.prepare_write(fragment.into(), true)?;
        let options = self.options().returning();
        let statement = self.statement(&fragment, &Verb::Update, &options)?;
        self.fetch(session, statement).await
    }

    /// Deletes rows matching `fragment` and returns them.
    pub async fn delete(&self, fragment: impl Into<Fragment>) -> Result<Vec<Row>> {
        self.delete_in(&mut self.db.session(), fragment).await
    }

    pub async fn delete_in<S: Session>(
        &self,
        session: &mut S,
        fragment: impl Into<Fragment>,
    ) -> Result<Vec<Row>> {
        let options = self.options().returning();
        let statement = self.statement(&fragment.into(), &Verb::Delete, &options)?;
        self.fetch(session, statement).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrmError;
    use crate::fragment;
    use serde_json::json;
    use tessera_migrate::testing::FakeDatabase;
    use tessera_schema::Field;

    fn users_schema() -> Schema {
        Schema::new()
            .field("id", Field::number())
            .field("name", Field::string().max(50))
            .field("age", Field::number().optional())
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => Row::new(),
        }
    }

    async fn users(fake: &FakeDatabase) -> Collection<FakeDatabase> {
        Database::new(fake.clone())
            .collection("users", users_schema())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_collection_creates_table() {
        let fake = FakeDatabase::new();
        let users = users(&fake).await;

        assert!(users.is_migrated());
        assert_eq!(
            fake.statements(),
            vec![
                "CREATE TABLE \"users\" (\n    \"id\" INTEGER GENERATED ALWAYS AS IDENTITY PRIMARY KEY,\n    \"name\" VARCHAR(50) NOT NULL,\n    \"age\" NUMERIC\n)"
            ]
        );
    }

    #[tokio::test]
    async fn test_create_validates_encodes_and_decodes() {
        let fake = FakeDatabase::new();
        fake.respond(
            "INSERT INTO users",
            vec![json!({"id": 1, "name": "A", "age": "42"})],
        );
        let users = users(&fake).await;

        let created = users.create(row(json!({"name": "A", "age": 42}))).await.unwrap();
        assert_eq!(Value::Object(created), json!({"id": 1, "name": "A", "age": 42}));

        let insert = fake.executed().pop().unwrap();
        assert_eq!(
            insert.sql,
            "INSERT INTO users (\"age\", \"name\") VALUES ($1::NUMERIC, $2) RETURNING *"
        );
        assert_eq!(insert.params, vec![json!("42"), json!("A")]);
    }

    #[tokio::test]
    async fn test_invalid_row_sends_nothing() {
        let fake = FakeDatabase::new();
        let users = users(&fake).await;
        let before = fake.statements().len();

        let err = users.create(row(json!({"age": 3}))).await.unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));

        let err = users
            .create(row(json!({"name": "A", "nickname": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));

        assert_eq!(fake.statements().len(), before);
    }

    #[tokio::test]
    async fn test_create_many_is_atomic() {
        let fake = FakeDatabase::new();
        let users = users(&fake).await;
        let commits = fake.commits();

        let err = users
            .create_many(vec![row(json!({"name": "A"})), row(json!({"name": 7}))])
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));
        assert!(!fake.statements().iter().any(|s| s.starts_with("INSERT INTO users")));

        fake.respond("INSERT INTO users", vec![json!({"id": 1, "name": "A"})]);
        users
            .create_many(vec![row(json!({"name": "A"})), row(json!({"name": "B"}))])
            .await
            .unwrap();
        let inserts = fake
            .statements()
            .iter()
            .filter(|s| s.starts_with("INSERT INTO users"))
            .count();
        assert_eq!(inserts, 2);
        assert_eq!(fake.commits(), commits + 1);
    }

    #[tokio::test]
    async fn test_select_and_select_one() {
        let fake = FakeDatabase::new();
        fake.respond(
            "SELECT * FROM users",
            vec![json!({"id": 1, "name": "A", "age": null})],
        );
        let users = users(&fake).await;

        let rows = users
            .select(fragment!("WHERE age > $1", 18).unwrap())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].contains_key("age"));

        let one = users.select_one("ORDER BY name").await.unwrap();
        assert!(one.is_some());

        let executed = fake.executed();
        let n = executed.len();
        assert_eq!(executed[n - 2].sql, "SELECT * FROM users WHERE age > $1");
        assert_eq!(executed[n - 2].params, vec![json!(18)]);
        assert_eq!(executed[n - 1].sql, "SELECT * FROM users ORDER BY name LIMIT 1");
    }

    #[tokio::test]
    async fn test_select_one_rejects_limit() {
        let fake = FakeDatabase::new();
        let users = users(&fake).await;
        let err = users.select_one("LIMIT 5").await.unwrap_err();
        assert!(matches!(err, OrmError::TemplateUsage(_)));
    }

    #[tokio::test]
    async fn test_count() {
        let fake = FakeDatabase::new();
        fake.respond("SELECT count(*) FROM users", vec![json!({"count": 3})]);
        let users = users(&fake).await;

        let count = users
            .count(fragment!("WHERE name = $1", "A").unwrap())
            .await
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(
            fake.statements().last().unwrap(),
            "SELECT count(*) FROM users WHERE name = $1"
        );
    }

    #[tokio::test]
    async fn test_update_with_patch() {
        let fake = FakeDatabase::new();
        let users = users(&fake).await;

        let patch = Fragment::bind(json!({"age": null}))
            .push_sql(" WHERE id = ")
            .push_bind(1);
        users.update(patch).await.unwrap();

        let update = fake.executed().pop().unwrap();
        assert_eq!(
            update.sql,
            "UPDATE users SET \"age\" = NULL WHERE id = $1 RETURNING *"
        );
        assert_eq!(update.params, vec![json!(1)]);

        let err = users
            .update(Fragment::bind(json!({"name": null})))
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_null_on_defaulted_field_sends_nothing() {
        let fake = FakeDatabase::new();
        let scores = Database::new(fake.clone())
            .collection(
                "scores",
                Schema::new()
                    .field("name", Field::string())
                    .field("score", Field::number().default(0)),
            )
            .await
            .unwrap();
        let before = fake.statements().len();

        let err = scores
            .update(Fragment::bind(json!({"name": "B", "score": null})))
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::Validation(_)));
        assert_eq!(fake.statements().len(), before);
    }

    #[tokio::test]
    async fn test_delete() {
        let fake = FakeDatabase::new();
        let users = users(&fake).await;

        users.delete(fragment!("WHERE id = $1", 4).unwrap()).await.unwrap();
        assert_eq!(
            fake.statements().last().unwrap(),
            "DELETE FROM users WHERE id = $1 RETURNING *"
        );
    }

    #[tokio::test]
    async fn test_operations_in_transaction() {
        let fake = FakeDatabase::new();
        let db = Database::new(fake.clone());
        let users = db.collection("users", users_schema()).await.unwrap();
        let before = fake.statements().len();

        let handle = users.clone();
        let result = db
            .transaction(move |tx| {
                let users = handle;
                Box::pin(async move {
                    users.create_in(tx, row(json!({"name": "A"}))).await.ok();
                    users.delete_in(tx, "WHERE true").await?;
                    Err::<(), _>(OrmError::TemplateUsage("abort".into()))
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(fake.statements().len(), before);
    }

    #[tokio::test]
    async fn test_casts_for_typed_columns() {
        let fake = FakeDatabase::new();
        let docs = Database::new(fake.clone())
            .collection(
                "docs",
                Schema::new()
                    .field("id", Field::uuid())
                    .field("status", Field::enumeration(["draft", "live"]))
                    .field("meta", Field::object().optional())
                    .field("rank", Field::integer()),
            )
            .await
            .unwrap();

        docs.create(row(json!({"status": "live", "meta": {"a": 1}, "rank": 2})))
            .await
            .ok();

        let insert = fake
            .executed()
            .into_iter()
            .find(|e| e.sql.starts_with("INSERT INTO docs"))
            .unwrap();
        assert_eq!(
            insert.sql,
            "INSERT INTO docs (\"meta\", \"rank\", \"status\") VALUES (to_jsonb($1), $2, $3::\"docs_status\") RETURNING *"
        );
    }

    #[tokio::test]
    async fn test_migration_sql_and_drop() {
        let fake = FakeDatabase::new();
        let db = Database::new(fake.clone());
        let docs = db
            .collection_lazy(
                "docs",
                Schema::new().field("status", Field::enumeration(["a", "b"])),
            )
            .unwrap();

        let sql = docs.migration_sql().await.unwrap();
        assert_eq!(sql.len(), 2);
        assert_eq!(sql[0], "CREATE TYPE \"docs_status\" AS ENUM ('a', 'b')");
        assert!(fake.statements().is_empty());
        assert!(!docs.is_migrated());

        docs.drop_table().await.unwrap();
        assert_eq!(
            fake.statements(),
            vec![
                "DROP TABLE IF EXISTS \"docs\"",
                "DROP TYPE IF EXISTS \"docs_status\""
            ]
        );
    }
}
