//! Pure step functions run by the workflow engine: condition, transform and validate.

use maestro_core::{lookup, Comparison, MaestroError, MaestroResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::OnceLock;

/// Conversion applied by a `transform` step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformOp {
    /// Upper-case the text form.
    Uppercase,
    /// Lower-case the text form.
    Lowercase,
    /// Parse into a number; fails on non-numeric text.
    Number,
    /// Truthiness: empty, `false`, `0`, `no` and `off` are false.
    Boolean,
}

impl TransformOp {
    /// Apply the conversion to `value`.
    pub fn apply(self, value: &Value) -> MaestroResult<Value> {
        match self {
            TransformOp::Uppercase => Ok(Value::String(text_of(value).to_uppercase())),
            TransformOp::Lowercase => Ok(Value::String(text_of(value).to_lowercase())),
            TransformOp::Number => to_number(value),
            TransformOp::Boolean => Ok(Value::Bool(truthy(value))),
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn to_number(value: &Value) -> MaestroResult<Value> {
    let parsed = match value {
        Value::Number(_) => return Ok(value.clone()),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let n = parsed.ok_or_else(|| MaestroError::Validation(format!("cannot convert {value} to a number")))?;
    // Integral values stay integers in the output document.
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Ok(json!(n as i64))
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .ok_or_else(|| MaestroError::Validation(format!("{value} is not a finite number")))
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "false" | "0" | "no" | "off"
        ),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// One check of a `validate` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "camelCase")]
pub enum ValidationRule {
    /// Present and not empty.
    Required,
    /// Looks like an email address.
    Email,
    /// Text form has at least `value` characters.
    MinLength {
        /// Minimum length.
        value: usize,
    },
    /// Text form has at most `value` characters.
    MaxLength {
        /// Maximum length.
        value: usize,
    },
}

fn email_pattern() -> Option<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok())
        .as_ref()
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    }
}

impl ValidationRule {
    /// Returns a violation message, or `None` if the value passes.
    ///
    /// Rules other than `required` accept an absent or null value.
    pub fn check(&self, value: Option<&Value>) -> Option<String> {
        let present = match value {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(v) => Some(v),
        };
        match (self, present) {
            (ValidationRule::Required, None) => Some("is required".to_string()),
            (ValidationRule::Required, Some(_)) | (_, None) => None,
            (ValidationRule::Email, Some(v)) => {
                let ok = v
                    .as_str()
                    .zip(email_pattern())
                    .is_some_and(|(s, re)| re.is_match(s));
                (!ok).then(|| "must be a valid email address".to_string())
            }
            (ValidationRule::MinLength { value: min }, Some(v)) => match length_of(v) {
                Some(len) if len >= *min => None,
                _ => Some(format!("must have length of at least {min}")),
            },
            (ValidationRule::MaxLength { value: max }, Some(v)) => match length_of(v) {
                Some(len) if len <= *max => None,
                _ => Some(format!("must have length of at most {max}")),
            },
        }
    }
}

/// Evaluate a conjunction of comparisons against the data bag.
pub fn evaluate_condition(conditions: &[Comparison], data: &Value) -> Value {
    let result = conditions.iter().all(|c| c.matches(data));
    json!({ "result": result })
}

/// Whether a recorded step result is a false condition outcome.
pub fn is_false_condition(result: &Value) -> bool {
    result.get("result") == Some(&Value::Bool(false))
}

/// Apply `op` to the value at `field` in the data bag.
pub fn apply_transform(field: &str, op: TransformOp, data: &Value) -> MaestroResult<Value> {
    let value = lookup(data, field)
        .ok_or_else(|| MaestroError::Validation(format!("field '{field}' not found")))?;
    let transformed = op.apply(value)?;
    Ok(json!({ "field": field, "value": transformed }))
}

/// Check every rule against the value at `field`. All violations are reported together.
pub fn validate(field: &str, rules: &[ValidationRule], data: &Value) -> MaestroResult<Value> {
    let value = lookup(data, field);
    let violations: Vec<String> = rules.iter().filter_map(|r| r.check(value)).collect();
    if violations.is_empty() {
        Ok(json!({ "valid": true }))
    } else {
        Err(MaestroError::Validation(format!(
            "field '{field}' {}",
            violations.join(", ")
        )))
    }
}
