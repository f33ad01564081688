//! Template resolution: `$name`, `${name}` and `${func(args)}`.

use crate::error::{Result, RunnerError};
use crate::functions::FunctionRegistry;
use crate::variables::{is_self_reference, VariableMapping};
use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::LazyLock;

/// `$$` escape, `${func(args)}`, `${name}` or `$name`.
static TEMPLATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{(\w+)\(([^{}]*?)\)\}|\$\{(\w+)\}|\$(\w+)")
        .expect("failed to compile template regex")
});

/// Resolve every template inside `value`, recursing through arrays
/// and objects.
pub fn resolve(
    value: &Value,
    variables: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<Value> {
    match value {
        Value::String(s) => resolve_string(s, variables, functions),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve(item, variables, functions))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                let key = match resolve_string(key, variables, functions)? {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                out.insert(key, resolve(item, variables, functions)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Resolve a single string.
///
/// When one expression spans the whole string its raw value is
/// returned, so `"${get_count()}"` can yield a number. Embedded
/// expressions are stringified.
pub fn resolve_string(
    text: &str,
    variables: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<Value> {
    if !text.contains('$') {
        return Ok(Value::String(text.to_string()));
    }

    if let Some(caps) = TEMPLATE_RE.captures(text) {
        let whole = &caps[0];
        if whole.len() == text.len() && whole != "$$" {
            return evaluate(&caps, variables, functions);
        }
    }

    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in TEMPLATE_RE.captures_iter(text) {
        let Some(m) = caps.get(0) else { continue };
        out.push_str(&text[last..m.start()]);
        if m.as_str() == "$$" {
            out.push('$');
        } else {
            let value = evaluate(&caps, variables, functions)?;
            out.push_str(&stringify(&value));
        }
        last = m.end();
    }
    out.push_str(&text[last..]);
    Ok(Value::String(out))
}

/// Resolve a typed document fragment by round-tripping it through
/// JSON.
pub fn resolve_as<T>(
    item: &T,
    variables: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    let raw = serde_json::to_value(item)?;
    let resolved = resolve(&raw, variables, functions)?;
    Ok(serde_json::from_value(resolved)?)
}

/// Resolve a mapping whose values may reference each other.
///
/// Entries are resolved in dependency order. A reference to a name
/// outside the mapping, or a cycle, is an unresolved-variable error.
pub fn resolve_mapping(
    mapping: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<VariableMapping> {
    resolve_mapping_over(mapping, &VariableMapping::new(), functions)
}

/// Resolve `mapping` on top of `base` and return both combined.
///
/// `base` holds already resolved values and is taken as is; keys in
/// `mapping` override it. A self reference in `mapping` (`"$token"`
/// for `token`) inherits the base value instead.
pub fn resolve_mapping_over(
    mapping: &VariableMapping,
    base: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<VariableMapping> {
    let own: VariableMapping = mapping
        .iter()
        .filter(|(k, v)| !(is_self_reference(k, v) && base.contains_key(*k)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let mut resolved: VariableMapping = base
        .iter()
        .filter(|(k, _)| !own.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let mut pending: Vec<(&String, &Value)> = own.iter().collect();

    while !pending.is_empty() {
        let mut remaining = Vec::new();
        let mut progressed = false;

        for (name, value) in pending {
            let refs = referenced_variables(value);
            if let Some(missing) = refs
                .iter()
                .find(|r| !own.contains_key(*r) && !resolved.contains_key(*r))
            {
                return Err(RunnerError::UnresolvedVariable(missing.clone()));
            }
            if refs.iter().all(|r| resolved.contains_key(r)) {
                let value = resolve(value, &resolved, functions)?;
                resolved.insert(name.clone(), value);
                progressed = true;
            } else {
                remaining.push((name, value));
            }
        }

        if !progressed {
            // Only cycles are left, self references included.
            let stuck = remaining
                .iter()
                .map(|(name, _)| name.as_str())
                .min()
                .unwrap_or_default();
            return Err(RunnerError::UnresolvedVariable(stuck.to_string()));
        }
        pending = remaining;
    }

    Ok(resolved)
}

/// Names of all variables referenced by templates inside `value`,
/// including references inside function arguments.
pub fn referenced_variables(value: &Value) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    collect_references(value, &mut names);
    names
}

fn collect_references(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => collect_string_references(s, names),
        Value::Array(items) => {
            items.iter().for_each(|item| collect_references(item, names))
        }
        Value::Object(map) => {
            for (key, item) in map {
                collect_string_references(key, names);
                collect_references(item, names);
            }
        }
        _ => {}
    }
}

fn collect_string_references(text: &str, names: &mut BTreeSet<String>) {
    for caps in TEMPLATE_RE.captures_iter(text) {
        if let Some(args) = caps.get(2) {
            collect_string_references(args.as_str(), names);
        } else if let Some(name) = caps.get(3).or_else(|| caps.get(4)) {
            names.insert(name.as_str().to_string());
        }
    }
}

fn evaluate(
    caps: &Captures<'_>,
    variables: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<Value> {
    if let Some(func) = caps.get(1) {
        let raw_args = caps.get(2).map_or("", |m| m.as_str());
        let args = split_args(raw_args)
            .iter()
            .map(|arg| parse_arg(arg, variables, functions))
            .collect::<Result<Vec<_>>>()?;
        return functions.call(func.as_str(), &args);
    }

    let name = caps
        .get(3)
        .or_else(|| caps.get(4))
        .map_or("", |m| m.as_str());
    variables
        .get(name)
        .cloned()
        .ok_or_else(|| RunnerError::UnresolvedVariable(name.to_string()))
}

/// Split a function argument list on commas outside quotes.
fn split_args(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for ch in raw.chars() {
        match quote {
            Some(q) => {
                if ch == q {
                    quote = None;
                }
                current.push(ch);
            }
            None => match ch {
                '\'' | '"' => {
                    quote = Some(ch);
                    current.push(ch);
                }
                ',' => args.push(std::mem::take(&mut current)),
                _ => current.push(ch),
            },
        }
    }
    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current);
    }

    args.into_iter().map(|a| a.trim().to_string()).collect()
}

fn parse_arg(
    token: &str,
    variables: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<Value> {
    if token.starts_with('$') {
        return resolve_string(token, variables, functions);
    }

    let bytes = token.as_bytes();
    if bytes.len() >= 2
        && (bytes[0] == b'\'' || bytes[0] == b'"')
        && bytes[bytes.len() - 1] == bytes[0]
    {
        return Ok(Value::String(token[1..token.len() - 1].to_string()));
    }

    match token {
        "True" => return Ok(Value::Bool(true)),
        "False" => return Ok(Value::Bool(false)),
        "None" => return Ok(Value::Null),
        _ => {}
    }

    match serde_json::from_str::<Value>(token) {
        Ok(v @ (Value::Number(_) | Value::Bool(_) | Value::Null)) => Ok(v),
        _ => Ok(Value::String(token.to_string())),
    }
}

/// Render a value for embedding inside a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
