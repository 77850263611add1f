use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Resolve a dotted path such as `health.metrics.requestsPerSecond` against a
/// JSON document.
///
/// Object segments are matched by key, array segments by numeric index.
/// An empty path resolves to the root.
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Comparison operators shared by workflow conditions and policy rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    /// Values are equal (numbers compare numerically).
    #[serde(alias = "==", alias = "eq")]
    Equals,
    /// Values differ.
    #[serde(alias = "!=", alias = "ne")]
    NotEquals,
    /// Actual value is strictly greater than the expected one.
    #[serde(alias = ">", alias = "gt")]
    GreaterThan,
    /// Actual value is strictly less than the expected one.
    #[serde(alias = "<", alias = "lt")]
    LessThan,
    /// Actual value is greater than or equal to the expected one.
    #[serde(alias = ">=", alias = "gte")]
    GreaterOrEqual,
    /// Actual value is less than or equal to the expected one.
    #[serde(alias = "<=", alias = "lte")]
    LessOrEqual,
    /// Substring, array element or object key membership.
    Contains,
}

impl Operator {
    /// Apply the operator to a resolved value (or its absence).
    ///
    /// A missing value only satisfies `equals null` and `not_equals <non-null>`.
    pub fn evaluate(self, actual: Option<&Value>, expected: &Value) -> bool {
        let Some(actual) = actual else {
            return match self {
                Operator::Equals => expected.is_null(),
                Operator::NotEquals => !expected.is_null(),
                _ => false,
            };
        };
        match self {
            Operator::Equals => values_equal(actual, expected),
            Operator::NotEquals => !values_equal(actual, expected),
            Operator::GreaterThan => compare(actual, expected) == Some(Ordering::Greater),
            Operator::LessThan => compare(actual, expected) == Some(Ordering::Less),
            Operator::GreaterOrEqual => matches!(
                compare(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::LessOrEqual => matches!(
                compare(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Contains => contains(actual, expected),
        }
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let symbol = match self {
            Operator::Equals => "==",
            Operator::NotEquals => "!=",
            Operator::GreaterThan => ">",
            Operator::LessThan => "<",
            Operator::GreaterOrEqual => ">=",
            Operator::LessOrEqual => "<=",
            Operator::Contains => "contains",
        };
        f.write_str(symbol)
    }
}

/// A single `field <operator> value` predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    /// Dotted path into the evaluated document.
    #[serde(alias = "condition", alias = "path")]
    pub field: String,
    /// How the resolved value is compared.
    pub operator: Operator,
    /// Value to compare against.
    #[serde(default)]
    pub value: Value,
}

impl Comparison {
    /// Build a comparison.
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    /// Evaluate against a document.
    pub fn matches(&self, document: &Value) -> bool {
        self.operator
            .evaluate(lookup(document, &self.field), &self.value)
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => {
            match (x.trim().parse::<f64>(), y.trim().parse::<f64>()) {
                (Ok(x), Ok(y)) => x.partial_cmp(&y),
                _ => Some(x.cmp(y)),
            }
        }
        _ => as_number(a)?.partial_cmp(&as_number(b)?),
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Array(items), n) => items.iter().any(|item| values_equal(item, n)),
        (Value::Object(map), Value::String(key)) => map.contains_key(key),
        _ => false,
    }
}
