//! Structural lookups: `items` and `dict`.

use super::{LookupContext, LookupError, LookupPlugin, LookupResult};
use serde_json::Value;

/// Flattens its terms into a list, one level deep. A term that parses as a
/// JSON list contributes its elements; anything else contributes itself.
#[derive(Debug, Clone, Default)]
pub struct ItemsLookup;

impl LookupPlugin for ItemsLookup {
    fn name(&self) -> &'static str {
        "items"
    }

    fn lookup(&self, terms: &[String], _context: &LookupContext) -> LookupResult<Vec<Value>> {
        let mut results = Vec::new();
        for term in terms {
            match serde_json::from_str::<Value>(term) {
                Ok(Value::Array(items)) => results.extend(items),
                Ok(other) => results.push(other),
                Err(_) => results.push(Value::String(term.clone())),
            }
        }
        Ok(results)
    }
}

/// Turns a mapping into a list of `{key, value}` entries.
#[derive(Debug, Clone, Default)]
pub struct DictLookup;

impl LookupPlugin for DictLookup {
    fn name(&self) -> &'static str {
        "dict"
    }

    fn lookup(&self, terms: &[String], _context: &LookupContext) -> LookupResult<Vec<Value>> {
        let mut results = Vec::new();
        for term in terms {
            let parsed: Value =
                serde_json::from_str(term).map_err(|_| LookupError::Failed {
                    plugin: "dict".to_string(),
                    message: format!("expected a mapping, got '{}'", term),
                })?;
            let Value::Object(map) = parsed else {
                return Err(LookupError::Failed {
                    plugin: "dict".to_string(),
                    message: format!("expected a mapping, got '{}'", term),
                });
            };
            for (key, value) in map {
                results.push(serde_json::json!({"key": key, "value": value}));
            }
        }
        Ok(results)
    }
}
