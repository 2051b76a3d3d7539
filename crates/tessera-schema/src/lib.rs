//! # tessera-schema
//!
//! Schema declarations for Tessera collections and their PostgreSQL column
//! mapping.
//!
//! - [`Field`] / [`Schema`] - immutable field builders with validation
//! - [`translate`] - field descriptors and normalized column definitions
//! - [`ddl`] - column clauses, default rendering and enum type actions
//!
//! ## Example
//!
//! ```
//! use tessera_schema::{ddl, normalize_schema, Field, Schema};
//!
//! let schema = Schema::new()
//!     .field("id", Field::number())
//!     .field("name", Field::string().max(100))
//!     .field("age", Field::integer().optional());
//!
//! let clauses: Vec<String> = normalize_schema("users", &schema)
//!     .iter()
//!     .map(|c| ddl::render(c).clause)
//!     .collect();
//!
//! assert_eq!(
//!     clauses,
//!     vec![
//!         "\"id\" INTEGER GENERATED ALWAYS AS IDENTITY PRIMARY KEY",
//!         "\"name\" VARCHAR(100) NOT NULL",
//!         "\"age\" INTEGER",
//!     ]
//! );
//! ```

pub mod ddl;
mod error;
mod field;
pub mod translate;

pub use error::{Result, SchemaError};
pub use field::{
    is_generated_id, validate_identifier, DefaultValue, Field, FieldKind, LogicalType, Modifier,
    NamedField, NumericFormat, Schema,
};
pub use translate::{
    describe, enum_type_name, expected_live_type, normalize, normalize_schema, ColumnDefinition,
    EnumType, FieldDescriptor, Identity,
};
