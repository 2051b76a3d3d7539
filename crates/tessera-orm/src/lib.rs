//! # tessera-orm
//!
//! Schema-validated collections over PostgreSQL.
//!
//! This crate provides:
//! - `Database`, a handle owning the pool and registered migrations
//! - `Collection`, a table bound to its declared `Schema`
//! - `Fragment` and the `fragment!` macro for parameterized clause text
//! - A rewriter completing clause fragments into full statements
//! - A row codec mapping `NUMERIC` strings and SQL `NULL`
//!
//! ## Quick Start
//!
//! ```ignore
//! use serde_json::json;
//! use tessera_orm::{fragment, Database, Fragment};
//! use tessera_migrate::DatabaseConfig;
//! use tessera_schema::{Field, Schema};
//!
//! async fn example() -> tessera_orm::Result<()> {
//!     let db = Database::connect(&DatabaseConfig::from_env()).await?;
//!
//!     // Creates or alters the table to match the schema.
//!     let users = db
//!         .collection(
//!             "users",
//!             Schema::new()
//!                 .field("id", Field::number())
//!                 .field("name", Field::string().max(50))
//!                 .field("age", Field::number().default(0)),
//!         )
//!         .await?;
//!
//!     users.insert(Fragment::bind(json!({ "name": "Ann" }))).await?;
//!
//!     let adults = users
//!         .select(fragment!("WHERE age >= $1 ORDER BY name", 18)?)
//!         .await?;
//!
//!     let renamed = users
//!         .update(Fragment::bind(json!({ "name": "Bo" })).push_sql(" WHERE id = ").push_bind(1))
//!         .await?;
//!
//!     let total = users.count("").await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Fragments
//!
//! A fragment holds only the clause the caller cares about. The table and
//! verb are supplied by the collection:
//!
//! | Call | Fragment | Statement |
//! |------|----------|-----------|
//! | `select` | `WHERE age > $1` | `SELECT * FROM users WHERE age > $1` |
//! | `update` | `{"name": "x"}` | `UPDATE users SET "name" = $1 RETURNING *` |
//! | `delete` | `` | `DELETE FROM users RETURNING *` |
//!
//! Parameters are always bound, never inlined.

mod codec;
mod collection;
mod database;
mod error;
mod fragment;
mod rewrite;

pub use codec::{decode, encode, Row};
pub use collection::Collection;
pub use database::Database;
pub use error::{OrmError, Result};
pub use fragment::{Fragment, Part};
pub use rewrite::{rewrite, RewriteOptions, Statement, Verb};

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
