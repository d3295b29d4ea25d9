//! Pipe lookup: run a command on the control node and capture stdout.

use super::{LookupContext, LookupError, LookupPlugin, LookupResult};
use serde_json::Value;
use std::process::Command;

/// Executes commands through the control-node shell and returns trimmed
/// stdout. Never routed through a transport.
#[derive(Debug, Clone, Default)]
pub struct PipeLookup;

impl LookupPlugin for PipeLookup {
    fn name(&self) -> &'static str {
        "pipe"
    }

    fn lookup(&self, terms: &[String], _context: &LookupContext) -> LookupResult<Vec<Value>> {
        let mut results = Vec::with_capacity(terms.len());
        for term in terms {
            let output = Command::new("sh").arg("-c").arg(term).output()?;

            if !output.status.success() {
                return Err(LookupError::CommandFailed {
                    code: output.status.code().unwrap_or(-1),
                    message: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }

            let stdout = String::from_utf8_lossy(&output.stdout)
                .trim_end()
                .to_string();
            results.push(Value::String(stdout));
        }
        Ok(results)
    }
}
