//! Filter expressions
//!
//! Storage-level projection of a specification. A `Filter` addresses
//! fields of an aggregate's JSON document by dotted path and can be
//! evaluated in memory (`matches`) or rendered into a PostgreSQL `WHERE`
//! fragment over a JSONB column (`push_sql`).
//!
//! Both evaluations follow the same two-valued rules:
//! - a missing field never satisfies a comparison
//! - ordered comparisons only hold between two numbers or two strings;
//!   strings compare bytewise (`COLLATE "C"` in SQL)
//! - numbers compare by value, so `1` equals `1.0`
//!
//! Every SQL leaf is wrapped in `COALESCE(.., FALSE)` so SQL NULLs cannot
//! leak three-valued logic into `NOT`.

use std::cmp::Ordering;

use serde_json::Value;
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};

/// Boolean filter over a JSON document
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    Ne(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    /// Field equals one of the values
    In(String, Vec<Value>),
    /// Array field has an element equal to the value
    Contains(String, Value),
    /// Field is missing or JSON null
    IsNull(String),
    And(Box<Filter>, Box<Filter>),
    Or(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

#[derive(Debug, Clone, Copy)]
enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Gt => ordering == Ordering::Greater,
            Comparison::Gte => ordering != Ordering::Less,
            Comparison::Lt => ordering == Ordering::Less,
            Comparison::Lte => ordering != Ordering::Greater,
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            Comparison::Gt => " > ",
            Comparison::Gte => " >= ",
            Comparison::Lt => " < ",
            Comparison::Lte => " <= ",
        }
    }
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(field.into(), value.into())
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Ne(field.into(), value.into())
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gt(field.into(), value.into())
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Gte(field.into(), value.into())
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lt(field.into(), value.into())
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Lte(field.into(), value.into())
    }

    pub fn is_in<V: Into<Value>>(
        field: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Filter::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Contains(field.into(), value.into())
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Filter::IsNull(field.into())
    }

    pub fn and(self, other: Filter) -> Self {
        Filter::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Filter) -> Self {
        Filter::Or(Box::new(self), Box::new(other))
    }

    pub fn negate(self) -> Self {
        Filter::Not(Box::new(self))
    }

    /// Evaluate against a JSON document
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Filter::Eq(path, value) => lookup(document, path).is_some_and(|f| json_eq(f, value)),
            Filter::Ne(path, value) => lookup(document, path).is_some_and(|f| !json_eq(f, value)),
            Filter::Gt(path, value) => compare_field(document, path, value, Comparison::Gt),
            Filter::Gte(path, value) => compare_field(document, path, value, Comparison::Gte),
            Filter::Lt(path, value) => compare_field(document, path, value, Comparison::Lt),
            Filter::Lte(path, value) => compare_field(document, path, value, Comparison::Lte),
            Filter::In(path, values) => lookup(document, path)
                .is_some_and(|f| values.iter().any(|value| json_eq(f, value))),
            Filter::Contains(path, value) => match lookup(document, path) {
                Some(Value::Array(items)) => items.iter().any(|item| json_eq(item, value)),
                _ => false,
            },
            Filter::IsNull(path) => matches!(lookup(document, path), None | Some(Value::Null)),
            Filter::And(left, right) => left.matches(document) && right.matches(document),
            Filter::Or(left, right) => left.matches(document) || right.matches(document),
            Filter::Not(inner) => !inner.matches(document),
        }
    }

    /// Append this filter as a boolean SQL expression over the JSONB `column`
    ///
    /// `column` is pushed verbatim and must be a trusted identifier; paths
    /// and values are always bound as parameters.
    pub fn push_sql(&self, column: &str, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Filter::And(left, right) => {
                qb.push("(");
                left.push_sql(column, qb);
                qb.push(" AND ");
                right.push_sql(column, qb);
                qb.push(")");
            }
            Filter::Or(left, right) => {
                qb.push("(");
                left.push_sql(column, qb);
                qb.push(" OR ");
                right.push_sql(column, qb);
                qb.push(")");
            }
            Filter::Not(inner) => {
                qb.push("(NOT ");
                inner.push_sql(column, qb);
                qb.push(")");
            }
            leaf => {
                qb.push("COALESCE(");
                leaf.push_leaf_sql(column, qb);
                qb.push(", FALSE)");
            }
        }
    }

    fn push_leaf_sql(&self, column: &str, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Filter::Eq(path, value) => {
                push_field(column, path, qb);
                qb.push(" = ");
                qb.push_bind(Json(value.clone()));
            }
            Filter::Ne(path, value) => {
                push_field(column, path, qb);
                qb.push(" <> ");
                qb.push_bind(Json(value.clone()));
            }
            Filter::Gt(path, value) => push_comparison(column, path, value, Comparison::Gt, qb),
            Filter::Gte(path, value) => push_comparison(column, path, value, Comparison::Gte, qb),
            Filter::Lt(path, value) => push_comparison(column, path, value, Comparison::Lt, qb),
            Filter::Lte(path, value) => push_comparison(column, path, value, Comparison::Lte, qb),
            Filter::In(_, values) if values.is_empty() => {
                qb.push("FALSE");
            }
            Filter::In(path, values) => {
                push_field(column, path, qb);
                qb.push(" IN (");
                for (idx, value) in values.iter().enumerate() {
                    if idx > 0 {
                        qb.push(", ");
                    }
                    qb.push_bind(Json(value.clone()));
                }
                qb.push(")");
            }
            Filter::Contains(path, value) => {
                qb.push("CASE WHEN jsonb_typeof(");
                push_field(column, path, qb);
                qb.push(") = 'array' THEN EXISTS (SELECT 1 FROM jsonb_array_elements(");
                push_field(column, path, qb);
                qb.push(") AS elem WHERE elem = ");
                qb.push_bind(Json(value.clone()));
                qb.push(") ELSE FALSE END");
            }
            Filter::IsNull(path) => {
                qb.push("(");
                push_field(column, path, qb);
                qb.push(" IS NULL OR ");
                push_field(column, path, qb);
                qb.push(" = 'null'::jsonb)");
            }
            Filter::And(..) | Filter::Or(..) | Filter::Not(..) => self.push_sql(column, qb),
        }
    }
}

/// `(column #> '{a,b}')` with the path bound as a text array
fn push_field(column: &str, path: &str, qb: &mut QueryBuilder<'_, Postgres>) {
    qb.push("(");
    qb.push(column);
    qb.push(" #> ");
    qb.push_bind(path_segments(path));
    qb.push(")");
}

/// `(column #>> '{a,b}')`, the field as text
fn push_field_text(column: &str, path: &str, qb: &mut QueryBuilder<'_, Postgres>) {
    qb.push("(");
    qb.push(column);
    qb.push(" #>> ");
    qb.push_bind(path_segments(path));
    qb.push(")");
}

fn push_comparison(
    column: &str,
    path: &str,
    value: &Value,
    comparison: Comparison,
    qb: &mut QueryBuilder<'_, Postgres>,
) {
    match value {
        Value::Number(number) => match number.as_f64() {
            Some(n) => {
                qb.push("CASE WHEN jsonb_typeof(");
                push_field(column, path, qb);
                qb.push(") = 'number' THEN ");
                push_field_text(column, path, qb);
                qb.push("::float8");
                qb.push(comparison.as_sql());
                qb.push_bind(n);
                qb.push(" ELSE FALSE END");
            }
            None => {
                qb.push("FALSE");
            }
        },
        Value::String(s) => {
            qb.push("CASE WHEN jsonb_typeof(");
            push_field(column, path, qb);
            qb.push(") = 'string' THEN ");
            push_field_text(column, path, qb);
            qb.push(" COLLATE \"C\"");
            qb.push(comparison.as_sql());
            qb.push_bind(s.clone());
            qb.push(" ELSE FALSE END");
        }
        _ => {
            qb.push("FALSE");
        }
    }
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

/// Resolve a dotted path the way JSONB `#>` does
///
/// Objects are indexed by key and arrays by integer position, negative
/// positions counting from the end.
fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |current, segment| match current {
        Value::Object(fields) => fields.get(segment),
        Value::Array(items) => {
            let index: i64 = segment.parse().ok()?;
            let position = if index < 0 {
                i64::try_from(items.len()).ok()? + index
            } else {
                index
            };
            items.get(usize::try_from(position).ok()?)
        }
        _ => None,
    })
}

fn compare_field(document: &Value, path: &str, value: &Value, comparison: Comparison) -> bool {
    lookup(document, path)
        .and_then(|field| compare(field, value))
        .is_some_and(|ordering| comparison.holds(ordering))
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.as_str().cmp(y.as_str())),
        _ => None,
    }
}

/// JSON equality with numbers compared by value, matching JSONB `=`
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| json_eq(x, y)))
        }
        _ => a == b,
    }
}
