//! Derive named variables from a step result.

use crate::error::Result;
use crate::expression;
use crate::functions::FunctionRegistry;
use crate::variables::VariableMapping;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Evaluate every extraction field against `context`.
///
/// Fields are evaluated independently: one field cannot see a value
/// extracted by another field of the same step.
pub fn extract(
    rules: &BTreeMap<String, String>,
    context: &Value,
    variables: &VariableMapping,
    functions: &FunctionRegistry,
) -> Result<VariableMapping> {
    let mut extracted = VariableMapping::with_capacity(rules.len());
    for (name, expr) in rules {
        let value = expression::evaluate(expr, context, variables, functions)?;
        debug!("Extracted '{}' = {} from '{}'", name, value, expr);
        extracted.insert(name.clone(), value);
    }
    Ok(extracted)
}
