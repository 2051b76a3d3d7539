//! Integration tests against a live PostgreSQL database.
//!
//! Set DATABASE_URL to a database the tests may create and drop tables in.
//!
//! Run tests with: cargo test --package tessera-orm --test postgres -- --ignored

use serde_json::{json, Value};
use tessera_migrate::{DatabaseConfig, Session};
use tessera_orm::{fragment, Collection, Database, Fragment, OrmError, Row};
use tessera_schema::{Field, Schema};

async fn connect() -> Database {
    Database::connect(&DatabaseConfig::from_env())
        .await
        .expect("Failed to connect to database")
}

/// Opens `table` with `schema`, starting from an empty table.
async fn fresh(db: &Database, table: &str, schema: Schema) -> Collection {
    db.collection_lazy(table, schema.clone())
        .unwrap()
        .drop_table()
        .await
        .unwrap();
    db.collection(table, schema).await.unwrap()
}

fn row(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

#[tokio::test]
#[ignore]
async fn test_added_default_backfills_existing_rows() {
    let db = connect().await;
    let users = fresh(
        &db,
        "tessera_it_backfill",
        Schema::new()
            .field("id", Field::number())
            .field("name", Field::string())
            .field("age", Field::number().optional()),
    )
    .await;
    users.create(row(json!({"name": "A"}))).await.unwrap();

    let users = db
        .collection(
            "tessera_it_backfill",
            Schema::new()
                .field("id", Field::number())
                .field("name", Field::string())
                .field("age", Field::number().default(0)),
        )
        .await
        .unwrap();

    let rows = users.select("").await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["age"], json!(0));
    assert!(users.live_columns().iter().all(|c| c.name != "age" || !c.nullable));

    // Settled: a further pass plans nothing.
    assert!(users.migration_sql().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_crud_round_trip() {
    let db = connect().await;
    let items = fresh(
        &db,
        "tessera_it_items",
        Schema::new()
            .field("id", Field::uuid())
            .field("name", Field::string().max(50))
            .field("price", Field::number())
            .field("tags", Field::array(Field::string()).optional())
            .field("status", Field::enumeration(["draft", "live"]).default("draft")),
    )
    .await;

    let created = items
        .create(row(json!({"name": "pen", "price": 1.25, "tags": ["a", "b"]})))
        .await
        .unwrap();
    assert_eq!(created["price"], json!(1.25));
    assert_eq!(created["tags"], json!(["a", "b"]));
    assert_eq!(created["status"], json!("draft"));
    let id = created["id"].as_str().unwrap().to_string();

    let updated = items
        .update(
            Fragment::bind(json!({"status": "live"}))
                .push_sql(" WHERE id = ")
                .push_bind(id.clone())
                .push_sql("::uuid"),
        )
        .await
        .unwrap();
    assert_eq!(updated[0]["status"], json!("live"));

    let found = items
        .select_one(fragment!("WHERE name = $1", "pen").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found["id"], json!(id));

    assert_eq!(items.count("").await.unwrap(), 1);
    items.delete("").await.unwrap();
    assert_eq!(items.count("").await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
async fn test_enum_growth_keeps_rows() {
    let db = connect().await;
    let posts = fresh(
        &db,
        "tessera_it_posts",
        Schema::new().field("kind", Field::enumeration(["a", "b"])),
    )
    .await;
    posts.create(row(json!({"kind": "b"}))).await.unwrap();

    let posts = db
        .collection(
            "tessera_it_posts",
            Schema::new().field("kind", Field::enumeration(["a", "b", "c"])),
        )
        .await
        .unwrap();
    posts.create(row(json!({"kind": "c"}))).await.unwrap();

    assert_eq!(posts.count("").await.unwrap(), 2);
    assert!(posts.migration_sql().await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
async fn test_numeric_outside_decimal_range_reads_as_text() {
    let db = connect().await;
    let readings = fresh(
        &db,
        "tessera_it_readings",
        Schema::new()
            .field("label", Field::string())
            .field("value", Field::number().optional()),
    )
    .await;
    let mut session = db.connector().clone();
    session
        .execute(
            "INSERT INTO tessera_it_readings (label, value) VALUES \
             ('nan', 'NaN'::numeric), ('wide', 1e30::numeric), ('plain', 2.5)",
            &[],
        )
        .await
        .unwrap();

    let rows = readings.select("ORDER BY label").await.unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["value"], json!("NaN"));
    assert_eq!(rows[1]["value"], json!(2.5));
    assert_eq!(rows[2]["value"], json!(format!("1{}", "0".repeat(30))));
}

#[tokio::test]
#[ignore]
async fn test_unique_violation_surfaces_sqlstate() {
    let db = connect().await;
    let accounts = fresh(
        &db,
        "tessera_it_accounts",
        Schema::new().field("email", Field::string().unique()),
    )
    .await;
    accounts.create(row(json!({"email": "a@x"}))).await.unwrap();

    let err = accounts
        .create(row(json!({"email": "a@x"})))
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::Database(_)));
    assert_eq!(err.sqlstate().as_deref(), Some("23505"));
}

#[tokio::test]
#[ignore]
async fn test_transaction_rolls_back() {
    let db = connect().await;
    let notes = fresh(
        &db,
        "tessera_it_notes",
        Schema::new().field("body", Field::string()),
    )
    .await;

    let handle = notes.clone();
    let result = db
        .transaction(move |tx| {
            let notes = handle;
            Box::pin(async move {
                notes.create_in(tx, row(json!({"body": "x"}))).await?;
                Err::<(), _>(OrmError::TemplateUsage("abort".into()))
            })
        })
        .await;

    assert!(result.is_err());
    assert_eq!(notes.count("").await.unwrap(), 0);
}
