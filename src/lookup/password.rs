//! Password lookup: read or generate a password stored at a path.

use super::{LookupContext, LookupPlugin, LookupResult};
use rand::Rng;
use serde_json::Value;

/// Length of generated passwords.
const GENERATED_LENGTH: usize = 20;

/// Returns the password stored at the given path, generating (and
/// persisting) a random one on first use.
#[derive(Debug, Clone, Default)]
pub struct PasswordLookup;

impl LookupPlugin for PasswordLookup {
    fn name(&self) -> &'static str {
        "password"
    }

    fn lookup(&self, terms: &[String], context: &LookupContext) -> LookupResult<Vec<Value>> {
        let mut results = Vec::with_capacity(terms.len());
        for term in terms {
            let path = context.resolve(term);
            let password = if path.is_file() {
                let content = std::fs::read_to_string(&path)?;
                content.lines().next().unwrap_or_default().to_string()
            } else {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let password = generate_password(GENERATED_LENGTH);
                std::fs::write(&path, format!("{}\n", password))?;
                password
            };
            results.push(Value::String(password));
        }
        Ok(results)
    }
}

fn generate_password(length: usize) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz\
                             ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                             0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_generated_then_stable() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LookupContext::new(dir.path().to_path_buf());

        let first = PasswordLookup
            .lookup(&["secrets/db".to_string()], &ctx)
            .unwrap();
        let second = PasswordLookup
            .lookup(&["secrets/db".to_string()], &ctx)
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].as_str().unwrap().len(), GENERATED_LENGTH);
    }

    #[test]
    fn test_password_reads_existing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pw"), "preset-secret\n").unwrap();
        let ctx = LookupContext::new(dir.path().to_path_buf());

        let result = PasswordLookup.lookup(&["pw".to_string()], &ctx).unwrap();
        assert_eq!(result, vec![Value::String("preset-secret".to_string())]);
    }
}
