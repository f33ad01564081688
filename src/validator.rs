//! Assertion evaluation.

use crate::error::{Result, RunnerError};
use crate::expression;
use crate::functions::FunctionRegistry;
use crate::model::{ValidationResult, Validator};
use crate::parser;
use crate::variables::VariableMapping;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error};

/// Supported comparators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    NotEqual,
    LessThan,
    LessOrEquals,
    GreaterThan,
    GreaterOrEquals,
    StringEquals,
    LengthEqual,
    LengthGreaterThan,
    LengthGreaterOrEquals,
    LengthLessThan,
    LengthLessOrEquals,
    Contains,
    ContainedBy,
    TypeMatch,
    RegexMatch,
    StartsWith,
    EndsWith,
}

impl FromStr for Comparator {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        let comparator = match s.trim() {
            "eq" | "equal" | "equals" | "==" => Comparator::Equal,
            "ne" | "not_equal" | "!=" => Comparator::NotEqual,
            "lt" | "less_than" => Comparator::LessThan,
            "le" | "less_or_equals" | "less_than_or_equals" => {
                Comparator::LessOrEquals
            }
            "gt" | "greater_than" => Comparator::GreaterThan,
            "ge" | "greater_or_equals" | "greater_than_or_equals" => {
                Comparator::GreaterOrEquals
            }
            "str_eq" | "string_equals" => Comparator::StringEquals,
            "len_eq" | "count_eq" | "length_equal" | "length_equals" => {
                Comparator::LengthEqual
            }
            "len_gt" | "count_gt" | "length_greater_than" => {
                Comparator::LengthGreaterThan
            }
            "len_ge"
            | "count_ge"
            | "length_greater_or_equals"
            | "length_greater_than_or_equals" => {
                Comparator::LengthGreaterOrEquals
            }
            "len_lt" | "count_lt" | "length_less_than" => {
                Comparator::LengthLessThan
            }
            "len_le"
            | "count_le"
            | "length_less_or_equals"
            | "length_less_than_or_equals" => Comparator::LengthLessOrEquals,
            "contains" => Comparator::Contains,
            "contained_by" => Comparator::ContainedBy,
            "type_match" => Comparator::TypeMatch,
            "regex_match" => Comparator::RegexMatch,
            "startswith" | "starts_with" => Comparator::StartsWith,
            "endswith" | "ends_with" => Comparator::EndsWith,
            other => {
                return Err(RunnerError::UnknownComparator(other.to_string()))
            }
        };
        Ok(comparator)
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Comparator::Equal => "equal",
            Comparator::NotEqual => "not_equal",
            Comparator::LessThan => "less_than",
            Comparator::LessOrEquals => "less_or_equals",
            Comparator::GreaterThan => "greater_than",
            Comparator::GreaterOrEquals => "greater_or_equals",
            Comparator::StringEquals => "string_equals",
            Comparator::LengthEqual => "length_equal",
            Comparator::LengthGreaterThan => "length_greater_than",
            Comparator::LengthGreaterOrEquals => "length_greater_or_equals",
            Comparator::LengthLessThan => "length_less_than",
            Comparator::LengthLessOrEquals => "length_less_or_equals",
            Comparator::Contains => "contains",
            Comparator::ContainedBy => "contained_by",
            Comparator::TypeMatch => "type_match",
            Comparator::RegexMatch => "regex_match",
            Comparator::StartsWith => "startswith",
            Comparator::EndsWith => "endswith",
        })
    }
}

impl Comparator {
    pub fn compare(&self, check: &Value, expect: &Value) -> bool {
        match self {
            Comparator::Equal => values_equal(check, expect),
            Comparator::NotEqual => !values_equal(check, expect),
            Comparator::LessThan => {
                order(check, expect) == Some(Ordering::Less)
            }
            Comparator::LessOrEquals => matches!(
                order(check, expect),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Comparator::GreaterThan => {
                order(check, expect) == Some(Ordering::Greater)
            }
            Comparator::GreaterOrEquals => matches!(
                order(check, expect),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Comparator::StringEquals => {
                parser::stringify(check) == parser::stringify(expect)
            }
            Comparator::LengthEqual => {
                compare_length(check, expect, |o| o == Ordering::Equal)
            }
            Comparator::LengthGreaterThan => {
                compare_length(check, expect, |o| o == Ordering::Greater)
            }
            Comparator::LengthGreaterOrEquals => {
                compare_length(check, expect, |o| o != Ordering::Less)
            }
            Comparator::LengthLessThan => {
                compare_length(check, expect, |o| o == Ordering::Less)
            }
            Comparator::LengthLessOrEquals => {
                compare_length(check, expect, |o| o != Ordering::Greater)
            }
            Comparator::Contains => contains(check, expect),
            Comparator::ContainedBy => contains(expect, check),
            Comparator::TypeMatch => type_matches(check, expect),
            Comparator::RegexMatch => {
                let pattern = parser::stringify(expect);
                match Regex::new(&pattern) {
                    Ok(re) => re
                        .find(&parser::stringify(check))
                        .is_some_and(|m| m.start() == 0),
                    Err(e) => {
                        error!("Invalid regex_match pattern '{}': {}", pattern, e);
                        false
                    }
                }
            }
            Comparator::StartsWith => parser::stringify(check)
                .starts_with(&parser::stringify(expect)),
            Comparator::EndsWith => parser::stringify(check)
                .ends_with(&parser::stringify(expect)),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn compare_length(
    check: &Value,
    expect: &Value,
    accept: impl Fn(Ordering) -> bool,
) -> bool {
    let expected = match expect {
        Value::Number(n) => n.as_u64().map(|n| n as usize),
        Value::String(s) => s.trim().parse::<usize>().ok(),
        _ => None,
    };
    match (length_of(check), expected) {
        (Some(len), Some(expected)) => accept(len.cmp(&expected)),
        _ => false,
    }
}

fn contains(container: &Value, item: &Value) -> bool {
    match container {
        Value::String(s) => s.contains(&parser::stringify(item)),
        Value::Array(items) => items.iter().any(|i| values_equal(i, item)),
        Value::Object(map) => {
            item.as_str().is_some_and(|key| map.contains_key(key))
        }
        _ => false,
    }
}

fn type_matches(check: &Value, expect: &Value) -> bool {
    let Some(name) = expect.as_str() else {
        return false;
    };
    match name {
        "int" | "integer" => check.is_i64() || check.is_u64(),
        "float" => check.is_f64(),
        "number" => check.is_number(),
        "str" | "string" => check.is_string(),
        "bool" | "boolean" => check.is_boolean(),
        "list" | "array" => check.is_array(),
        "dict" | "object" => check.is_object(),
        "None" | "NoneType" | "null" => check.is_null(),
        _ => false,
    }
}

/// Evaluate every validator; the first configuration or resolution
/// error aborts, assertion failures are collected in the results.
pub fn validate(
    validators: &[Validator],
    context: &Value,
    variables: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<Vec<ValidationResult>> {
    let comparators = validators
        .iter()
        .map(|v| v.comparator.parse::<Comparator>())
        .collect::<Result<Vec<_>>>()?;

    let mut results = Vec::with_capacity(validators.len());
    for (validator, comparator) in validators.iter().zip(comparators) {
        let check_value = match &validator.check {
            Value::String(expr) => {
                expression::evaluate(expr, context, variables, functions)?
            }
            literal => literal.clone(),
        };
        let expect_value =
            parser::resolve(&validator.expect, variables, functions)?;
        let passed = comparator.compare(&check_value, &expect_value);
        debug!(
            "Validate {} {} {}: {}",
            validator.check, comparator, validator.expect, passed
        );

        results.push(ValidationResult {
            comparator: comparator.to_string(),
            check: validator.check.clone(),
            check_value,
            expect: validator.expect.clone(),
            expect_value,
            message: validator.message.clone(),
            passed,
        });
    }
    Ok(results)
}

/// Fail with one aggregated validation error when any result failed.
pub fn ensure_passed(results: &[ValidationResult]) -> Result<()> {
    let failures: Vec<String> = results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| {
            let mut line = format!(
                "assert {} {} {} ==> fail\n  check value: {} \
                 ({})\n  expect value: {} ({})",
                r.check,
                r.comparator,
                r.expect,
                r.check_value,
                type_name(&r.check_value),
                r.expect_value,
                type_name(&r.expect_value),
            );
            if let Some(message) = &r.message {
                line.push_str(&format!("\n  message: {message}"));
            }
            line
        })
        .collect();

    if failures.is_empty() {
        Ok(())
    } else {
        Err(RunnerError::Validation(failures.join("\n")))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}
