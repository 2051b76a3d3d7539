//! Row codec.
//!
//! Converts between rows as the database returns them and rows typed by a
//! collection's schema. `NUMERIC` columns travel as decimal strings; SQL
//! `NULL` becomes an absent key.

use serde_json::{Map, Number, Value};
use tessera_migrate::RawRow;
use tessera_schema::{LogicalType, NumericFormat, Schema};

/// A schema-typed row.
pub type Row = Map<String, Value>;

fn is_number(schema: &Schema, column: &str) -> bool {
    schema
        .get(column)
        .is_some_and(|f| f.logical_type() == LogicalType::Number)
}

fn is_decimal(schema: &Schema, column: &str) -> bool {
    schema.get(column).is_some_and(|f| {
        f.logical_type() == LogicalType::Number
            && matches!(f.numeric_format(), None | Some(NumericFormat::Decimal))
    })
}

/// Significant digits an `f64` carries exactly.
const F64_DIGITS: usize = 15;

/// Parses a decimal string into a JSON number. Integers stay integers.
///
/// Values a float would round are left alone.
fn parse_number(s: &str) -> Option<Number> {
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::from(i));
    }
    let mantissa = s.split(['e', 'E']).next().unwrap_or(s);
    let significant = mantissa
        .trim_start_matches(['-', '+', '0', '.'])
        .chars()
        .filter(char::is_ascii_digit)
        .count();
    if significant > F64_DIGITS {
        return None;
    }
    s.parse::<f64>().ok().and_then(Number::from_f64)
}

/// Decodes a database row.
///
/// Numeric strings on number fields are parsed; strings that do not parse
/// (such as `NaN`) pass through unchanged.
#[must_use]
pub fn decode(schema: &Schema, raw: RawRow) -> Row {
    raw.into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(column, value)| {
            let value = match value {
                Value::String(s) if is_number(schema, &column) => {
                    parse_number(&s).map_or(Value::String(s), Value::Number)
                }
                other => other,
            };
            (column, value)
        })
        .collect()
}

/// Encodes a row for writing. Decimal number fields are sent as strings.
#[must_use]
pub fn encode(schema: &Schema, row: &Row) -> RawRow {
    row.iter()
        .map(|(column, value)| {
            let value = match value {
                Value::Number(n) if is_decimal(schema, column) => Value::String(n.to_string()),
                other => other.clone(),
            };
            (column.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_schema::Field;

    fn schema() -> Schema {
        Schema::new()
            .field("id", Field::number())
            .field("name", Field::string())
            .field("age", Field::number().optional())
            .field("score", Field::number().format(NumericFormat::Float64))
            .field("meta", Field::object().optional())
    }

    fn raw(value: Value) -> RawRow {
        match value {
            Value::Object(map) => map,
            _ => RawRow::new(),
        }
    }

    #[test]
    fn test_decode_nulls_become_absent() {
        let row = decode(&schema(), raw(json!({"id": 1, "name": "a", "age": null})));
        assert_eq!(Value::Object(row), json!({"id": 1, "name": "a"}));
    }

    #[test]
    fn test_decode_parses_numeric_strings() {
        let row = decode(
            &schema(),
            raw(json!({"id": 1, "name": "7", "age": "42", "score": "1.5"})),
        );
        assert_eq!(row["age"], json!(42));
        assert_eq!(row["score"], json!(1.5));
        // Not a number field.
        assert_eq!(row["name"], json!("7"));
    }

    #[test]
    fn test_decode_passes_unparseable_numbers_through() {
        let row = decode(&schema(), raw(json!({"id": 1, "age": "NaN"})));
        assert_eq!(row["age"], json!("NaN"));

        let row = decode(&schema(), raw(json!({"age": "Infinity", "score": "-Infinity"})));
        assert_eq!(row["age"], json!("Infinity"));
        assert_eq!(row["score"], json!("-Infinity"));
    }

    #[test]
    fn test_decode_keeps_wide_decimals_exact() {
        let wide = "1234567890123456789012345.123456";
        let row = decode(&schema(), raw(json!({"age": wide, "score": "0.000123"})));
        assert_eq!(row["age"], json!(wide));
        assert_eq!(row["score"], json!(0.000123));

        // Fits i64 even though it exceeds f64 precision.
        let row = decode(&schema(), raw(json!({"age": "9007199254740993"})));
        assert_eq!(row["age"], json!(9_007_199_254_740_993_i64));
    }

    #[test]
    fn test_encode_sends_decimals_as_strings() {
        let row = raw(json!({"name": "a", "age": 42, "score": 2.5, "meta": {"k": [1]}}));
        let encoded = encode(&schema(), &row);
        assert_eq!(encoded["age"], json!("42"));
        assert_eq!(encoded["score"], json!(2.5));
        assert_eq!(encoded["meta"], json!({"k": [1]}));
        assert!(!encoded.contains_key("id"));
    }

    #[test]
    fn test_round_trip() {
        let row = raw(json!({"id": 3, "name": "a", "age": 0.25, "meta": {"x": null}}));
        assert_eq!(decode(&schema(), encode(&schema(), &row)), row);
    }

    #[test]
    fn test_round_trip_every_field_type() {
        let schema = Schema::new()
            .field("active", Field::boolean())
            .field("born", Field::date())
            .field("key", Field::uuid())
            .field("status", Field::enumeration(["draft", "live"]))
            .field("tags", Field::array(Field::string()))
            .field("extra", Field::json())
            .field("count", Field::integer())
            .field("ratio", Field::number().format(NumericFormat::Float32))
            .field("weight", Field::number().format(NumericFormat::Float64))
            .field("price", Field::number());
        let row = raw(json!({
            "active": false,
            "born": "2024-02-29",
            "key": "6f1c2a0e-8a3b-4c1d-9e2f-0a1b2c3d4e5f",
            "status": "live",
            "tags": ["a", "b"],
            "extra": [1, {"k": "v"}],
            "count": -7,
            "ratio": 1.5,
            "weight": 2.25,
            "price": 10.05,
        }));

        let encoded = encode(&schema, &row);
        assert_eq!(encoded["count"], json!(-7));
        assert_eq!(encoded["ratio"], json!(1.5));
        assert_eq!(encoded["price"], json!("10.05"));
        assert_eq!(decode(&schema, encoded), row);
    }
}
