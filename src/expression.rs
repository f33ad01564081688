//! Check expressions used by extractors and validators.
//!
//! An expression is either a template (`$token`, `${func()}`) resolved
//! against the variables, or a dotted path into the step's result
//! context such as `body.items[0].id` or `headers.Content-Type`.

use crate::error::{Result, RunnerError};
use crate::functions::FunctionRegistry;
use crate::parser;
use crate::variables::VariableMapping;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// `[n]` index segments, normalised to `.n`.
static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d+)\]").expect("failed to compile index regex")
});

/// Evaluate `expr` against a result `context` and the step variables.
///
/// The first path segment is looked up in the context first, then in
/// the variables. A missing root is an unresolved-variable error; a
/// missing sub-path evaluates to `null`.
pub fn evaluate(
    expr: &str,
    context: &Value,
    variables: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<Value> {
    let expr = expr.trim();
    if expr.contains('$') {
        return parser::resolve_string(expr, variables, functions);
    }

    let normalized = INDEX_RE.replace_all(expr, ".$1");
    let mut segments = normalized.split('.').filter(|s| !s.is_empty());
    let Some(root) = segments.next() else {
        return Ok(context.clone());
    };

    let base = lookup_key(context, root)
        .or_else(|| variables.get(root))
        .ok_or_else(|| RunnerError::UnresolvedVariable(root.to_string()))?;

    let mut current = base;
    for segment in segments {
        match step_into(current, segment) {
            Some(next) => current = next,
            None => return Ok(Value::Null),
        }
    }
    Ok(current.clone())
}

fn step_into<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(_) => lookup_key(value, segment),
        Value::Array(items) => {
            let index = segment.parse::<usize>().ok()?;
            items.get(index)
        }
        _ => None,
    }
}

/// Exact key lookup with an ASCII case-insensitive fallback.
fn lookup_key<'a>(value: &'a Value, key: &str) -> Option<&'a Value> {
    let map = value.as_object()?;
    map.get(key).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "status_code": 200,
            "headers": {"Content-Type": "application/json"},
            "body": {
                "items": [{"id": 11}, {"id": 12}],
                "pong": true
            }
        })
    }

    fn eval(expr: &str, vars: &VariableMapping) -> Result<Value> {
        evaluate(expr, &context(), vars, &FunctionRegistry::new())
    }

    #[test]
    fn test_dotted_and_indexed_paths() {
        let vars = VariableMapping::new();
        assert_eq!(eval("status_code", &vars).unwrap(), json!(200));
        assert_eq!(eval("body.items.1.id", &vars).unwrap(), json!(12));
        assert_eq!(eval("body.items[0].id", &vars).unwrap(), json!(11));
        assert_eq!(eval("body.pong", &vars).unwrap(), json!(true));
    }

    #[test]
    fn test_case_insensitive_keys() {
        let vars = VariableMapping::new();
        assert_eq!(
            eval("headers.content-type", &vars).unwrap(),
            json!("application/json")
        );
        assert_eq!(eval("Status_Code", &vars).unwrap(), json!(200));
    }

    #[test]
    fn test_missing_sub_path_is_null() {
        let vars = VariableMapping::new();
        assert_eq!(eval("body.items.9.id", &vars).unwrap(), Value::Null);
        assert_eq!(eval("body.nothing", &vars).unwrap(), Value::Null);
    }

    #[test]
    fn test_root_falls_back_to_variables() {
        let mut vars = VariableMapping::new();
        vars.insert("user".into(), json!({"name": "alice"}));
        assert_eq!(eval("user.name", &vars).unwrap(), json!("alice"));
        assert!(matches!(
            eval("missing.path", &vars),
            Err(RunnerError::UnresolvedVariable(n)) if n == "missing"
        ));
    }

    #[test]
    fn test_templates_resolve_against_variables() {
        let mut vars = VariableMapping::new();
        vars.insert("pong".into(), json!(true));
        assert_eq!(eval("$pong", &vars).unwrap(), json!(true));
        assert_eq!(eval("${pong}", &vars).unwrap(), json!(true));
    }
}
