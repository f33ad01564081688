//! Setup and teardown hook invocation.

use crate::error::Result;
use crate::functions::FunctionRegistry;
use crate::model::Hook;
use crate::parser;
use crate::variables::VariableMapping;
use tracing::{debug, error};

/// Run `hooks` in order against `variables`.
///
/// Assignment results are bound immediately, so later hooks see them.
/// Malformed hooks are logged and skipped; resolution errors abort.
pub fn call_hooks(
    hooks: &[Hook],
    variables: &mut VariableMapping,
    functions: &FunctionRegistry,
    phase: &str,
) -> Result<()> {
    if hooks.is_empty() {
        return Ok(());
    }
    debug!("Calling {} {} hooks", hooks.len(), phase);

    for hook in hooks {
        match hook {
            Hook::Expression(expr) => {
                debug!("{} hook: {}", phase, expr);
                parser::resolve_string(expr, variables, functions)?;
            }
            Hook::Assignment { name, value } => {
                let result = parser::resolve(value, variables, functions)?;
                debug!("{} hook: {} = {}", phase, name, result);
                variables.insert(name.clone(), result);
            }
            Hook::Malformed(raw) => {
                error!("Invalid {} hook format: {}", phase, raw);
            }
        }
    }
    Ok(())
}
