// ABOUTME: Evaluation of conditional, loop and wait predicates
// ABOUTME: Reads a field from the last result, workflow variables or context and applies an operator

use serde_json::Value;
use std::cmp::Ordering;

use crate::model::metadata::lookup_value;
use crate::model::{Condition, ConditionOperator, ConditionSource, Metadata};

/// Data a condition can read from
#[derive(Debug, Clone, Copy)]
pub struct ConditionScope<'a> {
    pub result: Option<&'a Value>,
    pub variables: &'a Metadata,
    pub context: &'a Metadata,
}

impl<'a> ConditionScope<'a> {
    fn resolve(&self, source: ConditionSource, field: &str) -> Option<&'a Value> {
        match source {
            ConditionSource::Result => {
                let result = self.result?;
                if field.is_empty() {
                    Some(result)
                } else {
                    lookup_value(result, field.split('.'))
                }
            }
            ConditionSource::Variables => self.variables.lookup(field),
            ConditionSource::Context => self.context.lookup(field),
        }
    }
}

pub fn evaluate(condition: &Condition, scope: &ConditionScope<'_>) -> bool {
    let actual = scope.resolve(condition.source, &condition.field);
    let expected = condition.value.as_ref().unwrap_or(&Value::Null);

    match condition.operator {
        ConditionOperator::Exists => actual.is_some_and(|v| !v.is_null()),
        ConditionOperator::Equals => values_equal(actual.unwrap_or(&Value::Null), expected),
        ConditionOperator::NotEquals => !values_equal(actual.unwrap_or(&Value::Null), expected),
        ConditionOperator::GreaterThan => {
            actual.and_then(|a| compare(a, expected)) == Some(Ordering::Greater)
        }
        ConditionOperator::LessThan => {
            actual.and_then(|a| compare(a, expected)) == Some(Ordering::Less)
        }
        ConditionOperator::Contains => actual.is_some_and(|a| contains(a, expected)),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::String(haystack) => match expected {
            Value::String(needle) => haystack.contains(needle.as_str()),
            other => haystack.contains(&other.to_string()),
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, expected)),
        Value::Object(map) => expected.as_str().is_some_and(|key| map.contains_key(key)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn condition(source: ConditionSource, field: &str, op: ConditionOperator, value: Value) -> Condition {
        Condition::new(source, field, op, Some(value))
    }

    #[test]
    fn test_operators_over_variables() {
        let variables: Metadata = [
            ("count".to_string(), json!(5)),
            ("env".to_string(), json!("production")),
            ("tags".to_string(), json!(["a", "b"])),
        ]
        .into_iter()
        .collect();
        let context = Metadata::new();
        let scope = ConditionScope {
            result: None,
            variables: &variables,
            context: &context,
        };
        let vars = ConditionSource::Variables;

        assert!(evaluate(&condition(vars, "count", ConditionOperator::Equals, json!(5.0)), &scope));
        assert!(evaluate(&condition(vars, "count", ConditionOperator::GreaterThan, json!(3)), &scope));
        assert!(!evaluate(&condition(vars, "count", ConditionOperator::LessThan, json!(3)), &scope));
        assert!(evaluate(&condition(vars, "env", ConditionOperator::NotEquals, json!("dev")), &scope));
        assert!(evaluate(&condition(vars, "env", ConditionOperator::Contains, json!("prod")), &scope));
        assert!(evaluate(&condition(vars, "tags", ConditionOperator::Contains, json!("b")), &scope));
        assert!(evaluate(&Condition::new(vars, "env", ConditionOperator::Exists, None), &scope));
        assert!(!evaluate(&Condition::new(vars, "nope", ConditionOperator::Exists, None), &scope));
    }

    #[test]
    fn test_result_source_supports_paths() {
        let result = json!({ "build": { "status": "green", "warnings": 0 } });
        let empty = Metadata::new();
        let scope = ConditionScope {
            result: Some(&result),
            variables: &empty,
            context: &empty,
        };

        assert!(evaluate(
            &condition(ConditionSource::Result, "build.status", ConditionOperator::Equals, json!("green")),
            &scope
        ));
        assert!(evaluate(
            &condition(ConditionSource::Result, "build.warnings", ConditionOperator::LessThan, json!(1)),
            &scope
        ));

        let no_result = ConditionScope { result: None, ..scope };
        assert!(!evaluate(
            &Condition::new(ConditionSource::Result, "build", ConditionOperator::Exists, None),
            &no_result
        ));
    }
}
