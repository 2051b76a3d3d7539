//! Database session seam.
//!
//! Everything that talks to the database receives a [`Session`] as an
//! explicit argument: a pooled connection, a single connection, or an open
//! transaction. [`Connector`] opens transactions for the runner.
//!
//! Rows come back as [`RawRow`]s: JSON maps keyed by column name, with SQL
//! `NULL` as `Value::Null`, `NUMERIC` as decimal strings, timestamps and UUIDs
//! as strings.

use futures::future::LocalBoxFuture;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgConnection, PgPool, PgRow, PgValueFormat, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// A row as returned by the database.
pub type RawRow = Map<String, Value>;

/// Executes statements with positional `$n` parameters.
#[allow(async_fn_in_trait)]
pub trait Session: Send {
    /// Executes one statement and returns the number of affected rows.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error>;

    /// Executes one statement and returns its rows.
    async fn fetch_all(&mut self, sql: &str, params: &[Value])
        -> Result<Vec<RawRow>, sqlx::Error>;

    /// Executes a script that may hold several statements, without parameters.
    async fn execute_script(&mut self, sql: &str) -> Result<u64, sqlx::Error>;
}

/// A session that can be committed or rolled back.
#[allow(async_fn_in_trait)]
pub trait TxSession: Session + Sized {
    async fn commit(self) -> Result<(), sqlx::Error>;
    async fn rollback(self) -> Result<(), sqlx::Error>;
}

/// Opens transactions.
#[allow(async_fn_in_trait)]
pub trait Connector: Send + Sync {
    type Tx: TxSession;

    async fn begin(&self) -> Result<Self::Tx, sqlx::Error>;
}

/// Object-safe view of a [`Session`], handed to migration hooks.
pub trait DynSession: Send {
    fn execute<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<u64, sqlx::Error>>;

    fn fetch_all<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<Vec<RawRow>, sqlx::Error>>;
}

impl<S: Session> DynSession for S {
    fn execute<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<u64, sqlx::Error>> {
        Box::pin(Session::execute(self, sql, params))
    }

    fn fetch_all<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [Value],
    ) -> LocalBoxFuture<'a, Result<Vec<RawRow>, sqlx::Error>> {
        Box::pin(Session::fetch_all(self, sql, params))
    }
}

/// Binds JSON parameters in order.
///
/// `NULL` binds as an untyped text null; write `NULL` literally where the
/// column type cannot accept text.
fn bind_params<'q>(
    mut query: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> Query<'q, Postgres, PgArguments> {
    for param in params {
        query = match param {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64()),
            },
            Value::String(s) => query.bind(s.as_str()),
            Value::Array(_) | Value::Object(_) => query.bind(sqlx::types::Json(param)),
        };
    }
    query
}

/// Converts a Postgres row into a [`RawRow`].
pub fn raw_row(row: &PgRow) -> Result<RawRow, sqlx::Error> {
    let mut out = Map::new();
    for (index, column) in row.columns().iter().enumerate() {
        out.insert(column.name().to_string(), decode_column(row, index)?);
    }
    Ok(out)
}

fn decode_column(row: &PgRow, index: usize) -> Result<Value, sqlx::Error> {
    let type_name = row.columns()[index].type_info().name().to_string();
    let value = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::Bool),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|f| Value::from(f64::from(f))),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(Value::from),
        "NUMERIC" => match row.try_get::<Option<rust_decimal::Decimal>, _>(index) {
            Ok(decimal) => decimal.map(|d| Value::String(d.to_string())),
            // NaN, infinities and values wider than Decimal.
            Err(_) => numeric_text(row, index)?.map(Value::String),
        },
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)?
            .map(|u| Value::String(u.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)?
            .map(|t| Value::String(t.to_rfc3339())),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(index)?
            .map(|t| Value::String(t.format("%Y-%m-%d %H:%M:%S").to_string())),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(index)?
            .map(|d| Value::String(d.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index)?,
        "TEXT[]" | "VARCHAR[]" => row
            .try_get::<Option<Vec<String>>, _>(index)?
            .map(|items| Value::Array(items.into_iter().map(Value::String).collect())),
        // Text-like types and enum types share the text wire format.
        _ => row
            .try_get_unchecked::<Option<String>, _>(index)?
            .map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

impl Session for PgConnection {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&mut *self)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<RawRow>, sqlx::Error> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&mut *self)
            .await?;
        rows.iter().map(raw_row).collect()
    }

    async fn execute_script(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::raw_sql(sql).execute(&mut *self).await?;
        Ok(result.rows_affected())
    }
}

impl Session for PgPool {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error> {
        let result = bind_params(sqlx::query(sql), params)
            .execute(&*self)
            .await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<RawRow>, sqlx::Error> {
        let rows = bind_params(sqlx::query(sql), params)
            .fetch_all(&*self)
            .await?;
        rows.iter().map(raw_row).collect()
    }

    async fn execute_script(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        let result = sqlx::raw_sql(sql).execute(&*self).await?;
        Ok(result.rows_affected())
    }
}

impl Session for sqlx::Transaction<'static, Postgres> {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, sqlx::Error> {
        Session::execute(&mut **self, sql, params).await
    }

    async fn fetch_all(
        &mut self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<RawRow>, sqlx::Error> {
        Session::fetch_all(&mut **self, sql, params).await
    }

    async fn execute_script(&mut self, sql: &str) -> Result<u64, sqlx::Error> {
        Session::execute_script(&mut **self, sql).await
    }
}

impl TxSession for sqlx::Transaction<'static, Postgres> {
    async fn commit(self) -> Result<(), sqlx::Error> {
        sqlx::Transaction::commit(self).await
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        sqlx::Transaction::rollback(self).await
    }
}

impl Connector for PgPool {
    type Tx = sqlx::Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, sqlx::Error> {
        sqlx::Pool::begin(self).await
    }
}

/// Reads a `NUMERIC` column as its text form, whatever its magnitude.
fn numeric_text(row: &PgRow, index: usize) -> Result<Option<String>, sqlx::Error> {
    let raw = row.try_get_raw(index)?;
    if raw.is_null() {
        return Ok(None);
    }
    let text = match raw.format() {
        PgValueFormat::Text => raw.as_str().map(str::to_string),
        PgValueFormat::Binary => raw.as_bytes().and_then(|bytes| {
            numeric_from_binary(bytes).ok_or_else(|| "malformed NUMERIC value".into())
        }),
    };
    text.map(Some).map_err(|source| sqlx::Error::ColumnDecode {
        index: index.to_string(),
        source,
    })
}

/// Renders the binary `NUMERIC` wire format: digit count, weight, sign and
/// display scale, then base-10000 digit groups, all big-endian 16-bit.
fn numeric_from_binary(bytes: &[u8]) -> Option<String> {
    let word = |i: usize| -> Option<u16> {
        bytes
            .get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
    };
    let ndigits = usize::from(word(0)?);
    let weight = i64::from(i16::from_be_bytes(word(1)?.to_be_bytes()));
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);
    let negative = match sign {
        0x0000 => false,
        0x4000 => true,
        0xC000 => return Some("NaN".to_string()),
        0xD000 => return Some("Infinity".to_string()),
        0xF000 => return Some("-Infinity".to_string()),
        _ => return None,
    };
    let digits: Vec<u16> = (0..ndigits).map(|i| word(4 + i)).collect::<Option<_>>()?;
    let group = |i: i64| -> u16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&group(0).to_string());
        for i in 1..=weight {
            text.push_str(&format!("{:04}", group(i)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::new();
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", group(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    Some(text)
}
