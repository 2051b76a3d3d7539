//! Query template rewriting.
//!
//! Turns a clause [`Fragment`] into a complete statement on one table. The
//! first literal segment is split at the earliest clause keyword that may
//! follow the table reference for the verb; the verb, the table and the
//! verb's keyword are placed around that split.
//!
//! | Verb | Result |
//! |---|---|
//! | `Select` | `SELECT <head or *> FROM t <tail>` |
//! | `SelectAggregate(e)` | `SELECT e FROM t <fragment>` |
//! | `Delete` | `DELETE <head> FROM t <tail>` |
//! | `Update` | `UPDATE t SET <fragment>` |
//! | `Insert` | `INSERT INTO t <fragment>` |

use std::collections::BTreeMap;
use std::fmt::Write;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use tessera_schema::ddl::quote_identifier;

use crate::error::{OrmError, Result};
use crate::fragment::{Fragment, Part};

static SELECT_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(WHERE|ORDER\s+BY|GROUP\s+BY|HAVING|LIMIT|OFFSET|(?:NATURAL\s+)?(?:(?:LEFT|RIGHT|FULL)(?:\s+OUTER)?\s+|INNER\s+|CROSS\s+)?JOIN)\b",
    )
    .unwrap()
});

static UPDATE_BOUNDARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(WHERE|ORDER\s+BY|LIMIT|OFFSET|RETURNING)\b").unwrap()
});

static INSERT_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(ON\s+CONFLICT|RETURNING)\b").unwrap());

static RETURNING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bRETURNING\b").unwrap());

static LIMIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bLIMIT\b").unwrap());

/// The statement kind a fragment is completed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Select,
    /// `SELECT <expr> FROM t`, e.g. `count(*)`.
    SelectAggregate(String),
    Insert,
    Update,
    Delete,
}

impl Verb {
    fn boundary(&self) -> &'static Regex {
        match self {
            Self::Select | Self::SelectAggregate(_) | Self::Delete => &SELECT_BOUNDARY,
            Self::Update => &UPDATE_BOUNDARY,
            Self::Insert => &INSERT_BOUNDARY,
        }
    }
}

/// Rewrite options.
#[derive(Debug, Clone, Default)]
pub struct RewriteOptions {
    /// Append `RETURNING *` unless the fragment already returns something.
    pub returning: bool,
    /// Append `LIMIT 1`; an explicit `LIMIT` is then rejected.
    pub limit_one: bool,
    /// Column casts applied to placeholders generated from row objects.
    /// `JSONB` columns are wrapped in `to_jsonb(..)` so scalars bind too.
    pub casts: BTreeMap<String, String>,
}

impl RewriteOptions {
    #[must_use]
    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }

    #[must_use]
    pub fn limit_one(mut self) -> Self {
        self.limit_one = true;
        self
    }

    #[must_use]
    pub fn casts(mut self, casts: BTreeMap<String, String>) -> Self {
        self.casts = casts;
        self
    }
}

/// A complete statement with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Returns the row object of an `UPDATE`/`INSERT` fragment consisting of a
/// bound object in leading position.
pub(crate) fn leading_object(fragment: &Fragment) -> Option<&Map<String, Value>> {
    let first = fragment.parts().first()?;
    if !first.sql.trim().is_empty() {
        return None;
    }
    match &first.param {
        Some(Value::Object(map)) => Some(map),
        _ => None,
    }
}

fn placeholder(
    fragment: Fragment,
    column: &str,
    value: &Value,
    casts: &BTreeMap<String, String>,
) -> Fragment {
    if value.is_null() {
        return fragment.push_sql("NULL");
    }
    match casts.get(column) {
        Some(ty) if ty.eq_ignore_ascii_case("JSONB") => fragment
            .push_sql("to_jsonb(")
            .push_bind(value.clone())
            .push_sql(")"),
        Some(ty) => fragment.push_bind(value.clone()).push_sql(&format!("::{ty}")),
        None => fragment.push_bind(value.clone()),
    }
}

/// Expands a leading row object into assignments or a column/value list.
fn expand_object(fragment: Fragment, verb: &Verb, options: &RewriteOptions) -> Fragment {
    let is_write = matches!(verb, Verb::Update | Verb::Insert);
    let Some(map) = leading_object(&fragment).filter(|_| is_write).cloned() else {
        return fragment;
    };
    let mut parts = fragment.into_parts();
    let rest = parts.split_off(1);

    let mut expanded = Fragment::empty();
    if *verb == Verb::Update {
        for (i, (column, value)) in map.iter().enumerate() {
            if i > 0 {
                expanded = expanded.push_sql(", ");
            }
            expanded = expanded.push_sql(&format!("{} = ", quote_identifier(column)));
            expanded = placeholder(expanded, column, value, &options.casts);
        }
    } else if map.is_empty() {
        expanded = expanded.push_sql("DEFAULT VALUES");
    } else {
        let columns: Vec<String> = map.keys().map(|c| quote_identifier(c)).collect();
        expanded = expanded.push_sql(&format!("({}) VALUES (", columns.join(", ")));
        for (i, (column, value)) in map.iter().enumerate() {
            if i > 0 {
                expanded = expanded.push_sql(", ");
            }
            expanded = placeholder(expanded, column, value, &options.casts);
        }
        expanded = expanded.push_sql(")");
    }

    for part in rest {
        expanded = expanded.push_sql(&part.sql);
        if let Some(param) = part.param {
            expanded = expanded.push_bind(param);
        }
    }
    expanded
}

/// Completes `fragment` into a statement on `table`.
pub fn rewrite(
    fragment: &Fragment,
    verb: &Verb,
    table: &str,
    options: &RewriteOptions,
) -> Result<Statement> {
    let fragment = expand_object(fragment.clone(), verb, options);

    if options.limit_one && fragment.literals().any(|l| LIMIT.is_match(l)) {
        return Err(OrmError::template("explicit LIMIT in a single-row select"));
    }
    let has_returning = fragment.literals().any(|l| RETURNING.is_match(l));

    let mut parts = fragment.into_parts();
    if parts.is_empty() {
        parts.push(Part {
            sql: String::new(),
            param: None,
        });
    }
    let first = &parts[0].sql;
    let boundary = verb.boundary().find(first).map(|m| m.start());
    let (head, tail) = match boundary {
        Some(at) => (first[..at].to_string(), first[at..].to_string()),
        None => (first.clone(), String::new()),
    };
    let first_has_param = parts[0].param.is_some();
    let single = parts.len() == 1 && !first_has_param;

    let lead = match verb {
        Verb::Select => {
            let columns = head.trim();
            if boundary.is_none() && !(single && columns.is_empty()) {
                // The whole fragment is the column list.
                if let Some(last) = parts.last_mut().filter(|p| p.param.is_none()) {
                    let len = last.sql.trim_end().len();
                    last.sql.truncate(len);
                }
                parts.push(Part {
                    sql: format!(" FROM {table}"),
                    param: None,
                });
                let columns = if single { head.trim() } else { head.trim_start() };
                format!("SELECT {columns}")
            } else {
                let columns = if columns.is_empty() { "*" } else { columns };
                format!("SELECT {columns} FROM {table} {tail}")
            }
        }
        Verb::SelectAggregate(expr) => {
            if !head.trim().is_empty() || (boundary.is_none() && first_has_param) {
                return Err(OrmError::template(format!(
                    "unexpected text before the first clause of an aggregate: '{}'",
                    head.trim()
                )));
            }
            format!("SELECT {expr} FROM {table} {tail}")
        }
        Verb::Delete => {
            if head.trim().is_empty() {
                format!("DELETE FROM {table} {tail}")
            } else {
                format!("DELETE {} FROM {table} {tail}", head.trim())
            }
        }
        Verb::Update => {
            if head.trim().is_empty() && (boundary.is_some() || !first_has_param) {
                return Err(OrmError::template("UPDATE without assignments"));
            }
            format!("UPDATE {table} SET {}{tail}", head.trim_start())
        }
        Verb::Insert => format!("INSERT INTO {table} {}{tail}", head.trim_start()),
    };
    parts[0].sql = lead;

    let mut suffix = String::new();
    if options.returning && !has_returning {
        suffix.push_str(" RETURNING *");
    }
    if options.limit_one {
        suffix.push_str(" LIMIT 1");
    }

    let mut sql = String::new();
    let mut params = Vec::new();
    for part in parts {
        sql.push_str(&part.sql);
        if let Some(param) = part.param {
            params.push(param);
            let _ = write!(sql, "${}", params.len());
        }
    }
    let mut sql = sql.trim_end().to_string();
    sql.push_str(&suffix);

    Ok(Statement { sql, params })
}
