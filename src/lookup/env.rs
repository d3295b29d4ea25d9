//! Environment variable lookup.

use super::{LookupContext, LookupError, LookupPlugin, LookupResult};
use serde_json::Value;

/// Reads control-node environment variables. An unset variable is an
/// error; pair with the `default` filter to make it optional.
#[derive(Debug, Clone, Default)]
pub struct EnvLookup;

impl LookupPlugin for EnvLookup {
    fn name(&self) -> &'static str {
        "env"
    }

    fn lookup(&self, terms: &[String], _context: &LookupContext) -> LookupResult<Vec<Value>> {
        let mut results = Vec::with_capacity(terms.len());
        for term in terms {
            match std::env::var(term) {
                Ok(value) => results.push(Value::String(value)),
                Err(_) => {
                    return Err(LookupError::Failed {
                        plugin: "env".to_string(),
                        message: format!("environment variable '{}' is not set", term),
                    })
                }
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_lookup() {
        std::env::set_var("STAGEHAND_LOOKUP_TEST", "value");
        let result = EnvLookup
            .lookup(
                &["STAGEHAND_LOOKUP_TEST".to_string()],
                &LookupContext::default(),
            )
            .unwrap();
        assert_eq!(result, vec![Value::String("value".to_string())]);
    }

    #[test]
    fn test_env_lookup_unset_errors() {
        assert!(EnvLookup
            .lookup(
                &["STAGEHAND_DEFINITELY_UNSET_93".to_string()],
                &LookupContext::default()
            )
            .is_err());
    }
}
