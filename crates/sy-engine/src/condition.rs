//! Edge predicates over an execution context.
//!
//! Only the single condition attached to an edge is evaluated; the
//! `combinator` field is carried in the schema but not consulted.

use std::cmp::Ordering;

use serde_json::{Map, Value};
use sy_core::types::{Condition, ConditionOperator};

/// Resolve a dotted path such as `outputs.scan.findings.0` against the
/// context. Numeric segments index into arrays.
pub fn lookup<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = context.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Evaluate `condition` against `context`.
///
/// A missing field only equals an expected `null`; `neq` against a missing
/// field is true and every ordering comparison is false.
pub fn evaluate(condition: &Condition, context: &Map<String, Value>) -> bool {
    let actual = lookup(context, &condition.field);
    let expected = &condition.value;
    match condition.operator {
        ConditionOperator::Eq => actual.map_or(expected.is_null(), |a| loosely_equal(a, expected)),
        ConditionOperator::Neq => !actual.map_or(expected.is_null(), |a| loosely_equal(a, expected)),
        ConditionOperator::Gt => compare(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::Gte => matches!(
            compare(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::Lt => compare(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Lte => {
            matches!(compare(actual, expected), Some(Ordering::Less | Ordering::Equal))
        }
        ConditionOperator::Contains => actual.is_some_and(|a| contains(a, expected)),
    }
}

/// JSON equality, except that numbers compare by value (`1` equals `1.0`).
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn compare(actual: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (actual?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}
