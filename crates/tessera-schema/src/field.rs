//! Field declarations.
//!
//! A [`Field`] is an immutable builder: every modifier returns a new value
//! with the modifier recorded, in application order. The [`Schema`] is the
//! ordered list of named fields describing one collection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SchemaError};

/// The logical type of a declared field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalType {
    String,
    Number,
    Boolean,
    Date,
    Uuid,
    Enum,
    Array,
    Object,
    Json,
    Unknown,
}

/// Storage format of a numeric field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumericFormat {
    /// 32-bit integer.
    Integer,
    /// Single precision float.
    Float32,
    /// Double precision float.
    Float64,
    /// Arbitrary precision decimal.
    Decimal,
}

/// Default value of a field.
///
/// Generators are evaluated by the database; values are rendered as literals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    /// A literal value.
    Value(Value),
    /// Current timestamp, `now()`.
    Now,
    /// Random UUID, `gen_random_uuid()`.
    RandomUuid,
    /// Any other database-side expression, emitted verbatim.
    Expression(String),
}

/// A modifier applied on top of the base field shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    Optional,
    Nullable,
    Unique,
    Default(DefaultValue),
}

/// The base shape of a field, before modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<u32>,
    },
    Number {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<NumericFormat>,
    },
    Boolean,
    Date,
    Uuid,
    Enum {
        options: Vec<String>,
    },
    Array {
        items: Box<Field>,
    },
    Object,
    Json,
    /// A shape this crate does not know how to store.
    Unknown {
        name: String,
    },
}

impl FieldKind {
    /// Returns the logical type of this shape.
    #[must_use]
    pub fn logical_type(&self) -> LogicalType {
        match self {
            Self::String { .. } => LogicalType::String,
            Self::Number { .. } => LogicalType::Number,
            Self::Boolean => LogicalType::Boolean,
            Self::Date => LogicalType::Date,
            Self::Uuid => LogicalType::Uuid,
            Self::Enum { .. } => LogicalType::Enum,
            Self::Array { .. } => LogicalType::Array,
            Self::Object => LogicalType::Object,
            Self::Json => LogicalType::Json,
            Self::Unknown { .. } => LogicalType::Unknown,
        }
    }
}

/// A declared field.
///
/// # Example
///
/// ```
/// use tessera_schema::{Field, NumericFormat};
///
/// let name = Field::string().max(100).unique();
/// let age = Field::number().format(NumericFormat::Integer).optional();
/// let status = Field::enumeration(["draft", "published"]).default("draft");
///
/// assert_eq!(name.max_length(), Some(100));
/// assert!(age.is_nullable());
/// assert!(status.default_value().is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    #[serde(flatten)]
    kind: FieldKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    modifiers: Vec<Modifier>,
}

impl Field {
    /// Creates a field from a base shape.
    #[must_use]
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            modifiers: Vec::new(),
        }
    }

    #[must_use]
    pub fn string() -> Self {
        Self::new(FieldKind::String { max_length: None })
    }

    #[must_use]
    pub fn number() -> Self {
        Self::new(FieldKind::Number { format: None })
    }

    /// Shorthand for `number().format(NumericFormat::Integer)`.
    #[must_use]
    pub fn integer() -> Self {
        Self::new(FieldKind::Number {
            format: Some(NumericFormat::Integer),
        })
    }

    #[must_use]
    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    #[must_use]
    pub fn date() -> Self {
        Self::new(FieldKind::Date)
    }

    #[must_use]
    pub fn uuid() -> Self {
        Self::new(FieldKind::Uuid)
    }

    /// Creates an enum field. Option order is kept.
    #[must_use]
    pub fn enumeration<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(FieldKind::Enum {
            options: options.into_iter().map(Into::into).collect(),
        })
    }

    #[must_use]
    pub fn array(items: Field) -> Self {
        Self::new(FieldKind::Array {
            items: Box::new(items),
        })
    }

    #[must_use]
    pub fn object() -> Self {
        Self::new(FieldKind::Object)
    }

    #[must_use]
    pub fn json() -> Self {
        Self::new(FieldKind::Json)
    }

    /// Creates a field of a shape that has no storage mapping.
    #[must_use]
    pub fn unknown(name: impl Into<String>) -> Self {
        Self::new(FieldKind::Unknown { name: name.into() })
    }

    fn with(mut self, modifier: Modifier) -> Self {
        self.modifiers.push(modifier);
        self
    }

    /// The value may be absent.
    #[must_use]
    pub fn optional(self) -> Self {
        self.with(Modifier::Optional)
    }

    /// The value may be null.
    #[must_use]
    pub fn nullable(self) -> Self {
        self.with(Modifier::Nullable)
    }

    /// Adds an inline UNIQUE constraint.
    #[must_use]
    pub fn unique(self) -> Self {
        self.with(Modifier::Unique)
    }

    /// Sets a literal default.
    #[must_use]
    pub fn default(self, value: impl Into<Value>) -> Self {
        self.with(Modifier::Default(DefaultValue::Value(value.into())))
    }

    /// Defaults to the current timestamp.
    #[must_use]
    pub fn default_now(self) -> Self {
        self.with(Modifier::Default(DefaultValue::Now))
    }

    /// Defaults to a random UUID.
    #[must_use]
    pub fn default_random_uuid(self) -> Self {
        self.with(Modifier::Default(DefaultValue::RandomUuid))
    }

    /// Defaults to a raw database expression.
    #[must_use]
    pub fn default_expression(self, expr: impl Into<String>) -> Self {
        self.with(Modifier::Default(DefaultValue::Expression(expr.into())))
    }

    /// Sets the maximum string length. No effect on other shapes.
    #[must_use]
    pub fn max(mut self, len: u32) -> Self {
        if let FieldKind::String { max_length } = &mut self.kind {
            *max_length = Some(len);
        }
        self
    }

    /// Sets the numeric storage format. No effect on other shapes.
    #[must_use]
    pub fn format(mut self, numeric: NumericFormat) -> Self {
        if let FieldKind::Number { format } = &mut self.kind {
            *format = Some(numeric);
        }
        self
    }

    /// Returns the base shape.
    #[must_use]
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// Returns the modifiers in application order.
    #[must_use]
    pub fn modifiers(&self) -> &[Modifier] {
        &self.modifiers
    }

    #[must_use]
    pub fn logical_type(&self) -> LogicalType {
        self.kind.logical_type()
    }

    #[must_use]
    pub fn max_length(&self) -> Option<u32> {
        match self.kind {
            FieldKind::String { max_length } => max_length,
            _ => None,
        }
    }

    #[must_use]
    pub fn numeric_format(&self) -> Option<NumericFormat> {
        match self.kind {
            FieldKind::Number { format } => format,
            _ => None,
        }
    }

    #[must_use]
    pub fn enum_options(&self) -> &[String] {
        match &self.kind {
            FieldKind::Enum { options } => options,
            _ => &[],
        }
    }

    /// True if an optional or nullable modifier was applied.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.modifiers
            .iter()
            .any(|m| matches!(m, Modifier::Optional | Modifier::Nullable))
    }

    /// Returns the innermost (first applied) default.
    #[must_use]
    pub fn default_value(&self) -> Option<&DefaultValue> {
        self.modifiers.iter().find_map(|m| match m {
            Modifier::Default(value) => Some(value),
            _ => None,
        })
    }

    /// Validates a value against this field.
    ///
    /// `name` is only used for error messages. An absent or null value is
    /// accepted when the field is nullable or has a default; the result is
    /// then `None` and the database fills in the column.
    pub fn validate(&self, name: &str, value: Option<&Value>) -> Result<Option<Value>> {
        match value {
            None | Some(Value::Null) => {
                if self.is_nullable() || self.default_value().is_some() {
                    Ok(None)
                } else {
                    Err(SchemaError::validation(name, "required"))
                }
            }
            Some(value) => self.validate_present(name, value).map(Some),
        }
    }

    fn validate_present(&self, name: &str, value: &Value) -> Result<Value> {
        match &self.kind {
            FieldKind::String { max_length } => {
                let s = value
                    .as_str()
                    .ok_or_else(|| SchemaError::validation(name, "expected a string"))?;
                if let Some(max) = max_length {
                    if s.chars().count() > *max as usize {
                        return Err(SchemaError::validation(
                            name,
                            format!("longer than {max} characters"),
                        ));
                    }
                }
                Ok(value.clone())
            }
            FieldKind::Number { format } => validate_number(name, value, *format),
            FieldKind::Boolean => match value {
                Value::Bool(_) => Ok(value.clone()),
                _ => Err(SchemaError::validation(name, "expected a boolean")),
            },
            FieldKind::Date => {
                let s = value
                    .as_str()
                    .ok_or_else(|| SchemaError::validation(name, "expected a date string"))?;
                let parsed = chrono::DateTime::parse_from_rfc3339(s).is_ok()
                    || chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok();
                if parsed {
                    Ok(value.clone())
                } else {
                    Err(SchemaError::validation(name, format!("invalid date '{s}'")))
                }
            }
            FieldKind::Uuid => {
                let s = value
                    .as_str()
                    .ok_or_else(|| SchemaError::validation(name, "expected a uuid string"))?;
                uuid::Uuid::parse_str(s)
                    .map(|id| Value::String(id.to_string()))
                    .map_err(|e| SchemaError::validation(name, e.to_string()))
            }
            FieldKind::Enum { options } => match value.as_str() {
                Some(s) if options.iter().any(|o| o == s) => Ok(value.clone()),
                _ => Err(SchemaError::validation(
                    name,
                    format!("expected one of {}", options.join(", ")),
                )),
            },
            FieldKind::Array { items } => {
                let elements = value
                    .as_array()
                    .ok_or_else(|| SchemaError::validation(name, "expected an array"))?;
                let mut out = Vec::with_capacity(elements.len());
                for element in elements {
                    out.push(items.validate(name, Some(element))?.unwrap_or(Value::Null));
                }
                Ok(Value::Array(out))
            }
            FieldKind::Object => match value {
                Value::Object(_) => Ok(value.clone()),
                _ => Err(SchemaError::validation(name, "expected an object")),
            },
            FieldKind::Json | FieldKind::Unknown { .. } => Ok(value.clone()),
        }
    }
}

fn validate_number(name: &str, value: &Value, format: Option<NumericFormat>) -> Result<Value> {
    match (value, format) {
        (Value::Number(n), Some(NumericFormat::Integer)) => {
            let fits = n.as_i64().is_some_and(|i| i32::try_from(i).is_ok());
            if fits {
                Ok(value.clone())
            } else {
                Err(SchemaError::validation(name, "expected a 32-bit integer"))
            }
        }
        (Value::Number(_), _) => Ok(value.clone()),
        // Arbitrary precision values may travel as strings.
        (Value::String(s), None | Some(NumericFormat::Decimal)) if s.parse::<f64>().is_ok() => {
            Ok(value.clone())
        }
        _ => Err(SchemaError::validation(name, "expected a number")),
    }
}

/// A field with its column name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedField {
    pub name: String,
    #[serde(flatten)]
    pub field: Field,
}

/// The ordered field declarations of one collection.
///
/// Serialized as a JSON array so declaration order survives a round trip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    fields: Vec<NamedField>,
}

impl Schema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a field. Redeclaring a name replaces the earlier field in place.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field: Field) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|f| f.name == name) {
            Some(existing) => existing.field = field,
            None => self.fields.push(NamedField { name, field }),
        }
        self
    }

    /// Reads a schema from its JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Checks that every field name is a valid identifier.
    pub fn check_identifiers(&self) -> Result<()> {
        for f in &self.fields {
            validate_identifier(&f.name)?;
        }
        Ok(())
    }

    pub fn fields(&self) -> impl Iterator<Item = &NamedField> {
        self.fields.iter()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| &f.field)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Validates a full row for insertion.
    ///
    /// Absent values are dropped from the output so column defaults apply.
    /// A generated `id` may always be left out.
    pub fn validate_row(&self, row: &Map<String, Value>) -> Result<Map<String, Value>> {
        self.validate(row, false)
    }

    /// Validates a partial row for an update: only present keys are checked.
    pub fn validate_patch(&self, row: &Map<String, Value>) -> Result<Map<String, Value>> {
        self.validate(row, true)
    }

    fn validate(&self, row: &Map<String, Value>, partial: bool) -> Result<Map<String, Value>> {
        if let Some(key) = row.keys().find(|k| self.get(k).is_none()) {
            return Err(SchemaError::UnknownField(key.clone()));
        }

        let mut out = Map::new();
        for NamedField { name, field } in &self.fields {
            let value = row.get(name);
            if value.is_none() && (partial || is_generated_id(name, field)) {
                continue;
            }
            // An explicit null on a nullable field is kept so updates can clear it.
            if matches!(value, Some(Value::Null)) {
                if field.is_nullable() {
                    out.insert(name.clone(), Value::Null);
                    continue;
                }
                // An update cannot fall back to the column default.
                if partial {
                    return Err(SchemaError::validation(name, "cannot be null"));
                }
            }
            if let Some(valid) = field.validate(name, value)? {
                out.insert(name.clone(), valid);
            }
        }
        Ok(out)
    }
}

/// True for an `id` field the database generates.
#[must_use]
pub fn is_generated_id(name: &str, field: &Field) -> bool {
    name == "id" && matches!(field.logical_type(), LogicalType::Number | LogicalType::Uuid)
}

/// Checks that `name` is a plain lowercase SQL identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if valid_start && valid_rest && name.len() <= 63 {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier(name.to_string()))
    }
}
