//! Parameterized SQL fragments.
//!
//! A [`Fragment`] is an ordered list of literal SQL text, each optionally
//! followed by one bound parameter. Parameters are never inlined into the
//! text; they are numbered `$1..$n` when the fragment is rendered.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{OrmError, Result};

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(\d+)").unwrap());

/// Literal text followed by an optional parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub sql: String,
    pub param: Option<Value>,
}

/// A partial SQL clause with bound parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Fragment {
    parts: Vec<Part>,
}

impl Fragment {
    /// A fragment of plain SQL text.
    #[must_use]
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            parts: vec![Part {
                sql: sql.into(),
                param: None,
            }],
        }
    }

    /// A fragment with no text.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parses `$N` placeholders in `text`, binding `params[N - 1]` at each.
    ///
    /// A placeholder may be used more than once; each use binds its own copy.
    pub fn template(text: &str, params: Vec<Value>) -> Result<Self> {
        let mut fragment = Self::empty();
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(text) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let index: usize = caps[1]
                .parse()
                .map_err(|_| OrmError::template(format!("bad placeholder '{}'", &caps[0])))?;
            let value = index
                .checked_sub(1)
                .and_then(|i| params.get(i))
                .ok_or_else(|| {
                    OrmError::template(format!(
                        "placeholder ${index} out of range, {} parameters given",
                        params.len()
                    ))
                })?;
            fragment = fragment
                .push_sql(&text[last..whole.start])
                .push_bind(value.clone());
            last = whole.end;
        }
        Ok(fragment.push_sql(&text[last..]))
    }

    /// A fragment holding a single parameter, such as a row object.
    #[must_use]
    pub fn bind(value: impl Into<Value>) -> Self {
        Self::empty().push_bind(value)
    }

    /// Appends SQL text.
    #[must_use]
    pub fn push_sql(mut self, sql: &str) -> Self {
        match self.parts.last_mut() {
            Some(last) if last.param.is_none() => last.sql.push_str(sql),
            _ => self.parts.push(Part {
                sql: sql.to_string(),
                param: None,
            }),
        }
        self
    }

    /// Appends a bound parameter.
    #[must_use]
    pub fn push_bind(mut self, value: impl Into<Value>) -> Self {
        let value = value.into();
        match self.parts.last_mut() {
            Some(last) if last.param.is_none() => last.param = Some(value),
            _ => self.parts.push(Part {
                sql: String::new(),
                param: Some(value),
            }),
        }
        self
    }

    #[must_use]
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub(crate) fn into_parts(self) -> Vec<Part> {
        self.parts
    }

    pub(crate) fn from_parts(parts: Vec<Part>) -> Self {
        Self { parts }
    }

    /// Text of the first literal segment.
    #[must_use]
    pub fn first_literal(&self) -> &str {
        self.parts.first().map_or("", |p| p.sql.as_str())
    }

    /// Iterates over the literal text of every part.
    pub fn literals(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|p| p.sql.as_str())
    }

    /// Bound parameters in order.
    pub fn params(&self) -> impl Iterator<Item = &Value> {
        self.parts.iter().filter_map(|p| p.param.as_ref())
    }

    /// True if the fragment has no parameters and only whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.parts
            .iter()
            .all(|p| p.param.is_none() && p.sql.trim().is_empty())
    }
}

impl From<&str> for Fragment {
    fn from(sql: &str) -> Self {
        Self::new(sql)
    }
}

impl From<String> for Fragment {
    fn from(sql: String) -> Self {
        Self::new(sql)
    }
}

/// Builds a [`Fragment`] from a template and its parameters.
///
/// Evaluates to `Result<Fragment>`.
///
/// ```
/// use tessera_orm::fragment;
///
/// let f = fragment!("WHERE age > $1 AND name = $2", 18, "ann").unwrap();
/// assert_eq!(f.params().count(), 2);
/// ```
#[macro_export]
macro_rules! fragment {
    ($sql:expr $(, $param:expr)* $(,)?) => {
        $crate::Fragment::template($sql, vec![$($crate::__private::json!($param)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_template_splits_at_placeholders() {
        let f = Fragment::template("WHERE age > $1 AND name = $2", vec![json!(18), json!("a")])
            .unwrap();

        assert_eq!(
            f.parts(),
            &[
                Part {
                    sql: "WHERE age > ".to_string(),
                    param: Some(json!(18)),
                },
                Part {
                    sql: " AND name = ".to_string(),
                    param: Some(json!("a")),
                },
                Part {
                    sql: String::new(),
                    param: None,
                },
            ]
        );
    }

    #[test]
    fn test_template_reused_placeholder() {
        let f = Fragment::template("a = $1 OR b = $1", vec![json!(1)]).unwrap();
        assert_eq!(f.params().count(), 2);
    }

    #[test]
    fn test_template_out_of_range() {
        let err = Fragment::template("a = $2", vec![json!(1)]).unwrap_err();
        assert!(matches!(err, OrmError::TemplateUsage(_)));

        let err = Fragment::template("a = $0", vec![json!(1)]).unwrap_err();
        assert!(matches!(err, OrmError::TemplateUsage(_)));
    }

    #[test]
    fn test_builder_merges_text() {
        let f = Fragment::new("WHERE a = ")
            .push_bind(1)
            .push_sql(" AND b = ")
            .push_bind("x")
            .push_sql(" ORDER BY")
            .push_sql(" a");

        assert_eq!(f.parts().len(), 3);
        assert_eq!(f.parts()[2].sql, " ORDER BY a");
        assert_eq!(f.first_literal(), "WHERE a = ");
    }

    #[test]
    fn test_consecutive_binds() {
        let f = Fragment::empty().push_bind(1).push_bind(2);
        assert_eq!(f.parts().len(), 2);
        assert_eq!(f.parts()[1].sql, "");
    }

    #[test]
    fn test_blank() {
        assert!(Fragment::empty().is_blank());
        assert!(Fragment::new("  ").is_blank());
        assert!(!Fragment::bind(json!({})).is_blank());
    }

    #[test]
    fn test_macro() {
        let name = "ann";
        let f = crate::fragment!("name = $1", name).unwrap();
        assert_eq!(f.params().collect::<Vec<_>>(), vec![&json!("ann")]);

        let f = crate::fragment!("").unwrap();
        assert!(f.is_blank());
    }
}
