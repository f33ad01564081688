//! Variable mappings and the precedence merge used at every
//! composition boundary.

use serde_json::Value;
use std::collections::HashMap;

/// Name → value bindings threaded through a run.
pub type VariableMapping = HashMap<String, Value>;

/// `true` when `value` is exactly `"$name"` or `"${name}"`.
///
/// Such a binding means "inherit the outer value" rather than a real
/// override.
pub fn is_self_reference(name: &str, value: &Value) -> bool {
    match value {
        Value::String(s) => {
            s.strip_prefix('$').is_some_and(|rest| {
                rest == name
                    || rest
                        .strip_prefix('{')
                        .and_then(|r| r.strip_suffix('}'))
                        .is_some_and(|inner| inner == name)
            })
        }
        _ => false,
    }
}

/// Merge two mappings; keys in `primary` win over `secondary`.
///
/// A self-referencing entry in `primary` (`{"token": "$token"}`) does
/// not override and the value from `secondary` is kept. When
/// `secondary` lacks the key the self reference is preserved so that
/// resolution reports it as unresolved.
pub fn merge_variables(
    primary: &VariableMapping,
    secondary: &VariableMapping,
) -> VariableMapping {
    let mut merged = secondary.clone();
    for (key, value) in primary {
        if is_self_reference(key, value) && secondary.contains_key(key) {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }
    merged
}
