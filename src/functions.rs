//! Named functions callable from `${func(args)}` templates.

use crate::error::{Result, RunnerError};
use anyhow::{anyhow, bail};
use chrono::format::{Item, StrftimeItems};
use chrono::Local;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// A function callable from a template.
pub type Function =
    Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Registry of template functions, loaded once per process and
/// passed by reference into every resolver call.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Function>,
}

impl FunctionRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with the built-in helpers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("get_timestamp", get_timestamp);
        registry.register("get_current_date", get_current_date);
        registry.register("gen_random_string", gen_random_string);
        registry.register("uuid4", |_| {
            Ok(Value::String(Uuid::new_v4().to_string()))
        });
        registry.register("urlencode", urlencode);
        registry
    }

    /// Register (or replace) a function under `name`.
    pub fn register<F>(&mut self, name: &str, function: F) -> &mut Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Invoke `name` with already-resolved arguments.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| RunnerError::UnresolvedFunction(name.into()))?;
        function(args).map_err(|reason| RunnerError::Function {
            name: name.to_string(),
            reason,
        })
    }

    /// Registered function names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> =
            self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

fn arg_as_u64(args: &[Value], index: usize) -> anyhow::Result<Option<u64>> {
    match args.get(index) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| anyhow!("expected a positive integer, got {n}")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| anyhow!("expected an integer, got '{s}': {e}")),
        Some(other) => bail!("expected an integer, got {other}"),
    }
}

/// Millisecond timestamp, truncated to the first `len` digits
/// (default 13).
fn get_timestamp(args: &[Value]) -> anyhow::Result<Value> {
    let len = arg_as_u64(args, 0)?.unwrap_or(13) as usize;
    let millis = chrono::Utc::now().timestamp_millis().to_string();
    let digits = &millis[..len.min(millis.len())];
    Ok(Value::String(digits.to_string()))
}

fn get_current_date(args: &[Value]) -> anyhow::Result<Value> {
    let format = match args.first() {
        Some(Value::String(s)) => s.as_str(),
        None | Some(Value::Null) => "%Y-%m-%d",
        Some(other) => bail!("date format must be a string, got {other}"),
    };
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        bail!("invalid date format '{format}'");
    }
    Ok(Value::String(Local::now().format(format).to_string()))
}

/// Random alphanumeric string of length `n`.
fn gen_random_string(args: &[Value]) -> anyhow::Result<Value> {
    const CHARSET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let len = arg_as_u64(args, 0)?
        .ok_or_else(|| anyhow!("gen_random_string requires a length"))?
        as usize;

    let mut out = String::with_capacity(len);
    while out.len() < len {
        for byte in Uuid::new_v4().as_bytes() {
            if out.len() == len {
                break;
            }
            out.push(CHARSET[*byte as usize % CHARSET.len()] as char);
        }
    }
    Ok(Value::String(out))
}

fn urlencode(args: &[Value]) -> anyhow::Result<Value> {
    let raw = match args.first() {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => bail!("urlencode requires one argument"),
    };
    Ok(Value::String(
        url::form_urlencoded::byte_serialize(raw.as_bytes()).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtins_are_registered() {
        let registry = FunctionRegistry::with_builtins();
        for name in [
            "get_timestamp",
            "get_current_date",
            "gen_random_string",
            "uuid4",
            "urlencode",
        ] {
            assert!(registry.contains(name), "missing builtin {name}");
        }
    }

    #[test]
    fn test_unknown_function() {
        let registry = FunctionRegistry::new();
        let err = registry.call("nope", &[]).unwrap_err();
        assert!(matches!(err, RunnerError::UnresolvedFunction(n) if n == "nope"));
    }

    #[test]
    fn test_custom_function() {
        let mut registry = FunctionRegistry::new();
        registry.register("sum", |args| {
            let total: i64 = args.iter().filter_map(Value::as_i64).sum();
            Ok(json!(total))
        });
        assert_eq!(
            registry.call("sum", &[json!(1), json!(2)]).unwrap(),
            json!(3)
        );
    }

    #[test]
    fn test_function_error_is_wrapped() {
        let registry = FunctionRegistry::with_builtins();
        let err = registry.call("gen_random_string", &[]).unwrap_err();
        assert!(matches!(err, RunnerError::Function { ref name, .. } if name == "gen_random_string"));
    }

    #[test]
    fn test_random_string_length() {
        let registry = FunctionRegistry::with_builtins();
        let value =
            registry.call("gen_random_string", &[json!(40)]).unwrap();
        let s = value.as_str().unwrap();
        assert_eq!(s.len(), 40);
        assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_timestamp_truncation() {
        let registry = FunctionRegistry::with_builtins();
        let value = registry.call("get_timestamp", &[json!(10)]).unwrap();
        assert_eq!(value.as_str().unwrap().len(), 10);
    }

    #[test]
    fn test_urlencode() {
        let registry = FunctionRegistry::with_builtins();
        let value = registry
            .call("urlencode", &[json!("hello world&foo=bar")])
            .unwrap();
        assert_eq!(value, json!("hello+world%26foo%3Dbar"));
    }
}
