//! Lookup plugins.
//!
//! Lookups pull data into templates from the control node: file contents,
//! environment variables, command output, glob matches, generated
//! passwords. They are reached from templates through the `lookup()` and
//! `query()` functions and run on the control node, never through a
//! transport. Relative paths resolve against the playbook directory.

mod env;
mod file;
mod items;
mod password;
mod pipe;

pub use env::EnvLookup;
pub use file::{FileGlobLookup, FileLookup, FirstFoundLookup, LinesLookup};
pub use items::{DictLookup, ItemsLookup};
pub use password::PasswordLookup;
pub use pipe::PipeLookup;

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during lookup operations.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup plugin not found: {0}")]
    NotFound(String),

    #[error("lookup '{plugin}': {message}")]
    Failed {
        /// The plugin that failed
        plugin: String,
        /// What went wrong
        message: String,
    },

    #[error("lookup file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("lookup command failed with exit code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for lookup operations.
pub type LookupResult<T> = Result<T, LookupError>;

/// Execution context passed to lookups.
#[derive(Debug, Clone, Default)]
pub struct LookupContext {
    /// Directory relative paths resolve against (the playbook directory)
    pub base_dir: PathBuf,
}

impl LookupContext {
    /// Create a context rooted at the given directory.
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Resolve a possibly-relative path against the base directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }
}

/// Core trait for lookup plugins.
pub trait LookupPlugin: Send + Sync {
    /// Plugin name as referenced from templates.
    fn name(&self) -> &'static str;

    /// Run the lookup over the given terms, producing one value per term
    /// (or per match, for glob-style plugins).
    fn lookup(&self, terms: &[String], context: &LookupContext) -> LookupResult<Vec<Value>>;
}

/// Registry mapping lookup names to implementations. Write-once at init,
/// shared read-only afterwards.
pub struct LookupRegistry {
    plugins: HashMap<&'static str, Arc<dyn LookupPlugin>>,
}

impl LookupRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Create a registry with the built-in plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FileLookup));
        registry.register(Arc::new(LinesLookup));
        registry.register(Arc::new(FileGlobLookup));
        registry.register(Arc::new(FirstFoundLookup));
        registry.register(Arc::new(EnvLookup));
        registry.register(Arc::new(PipeLookup));
        registry.register(Arc::new(PasswordLookup));
        registry.register(Arc::new(ItemsLookup));
        registry.register(Arc::new(DictLookup));
        registry
    }

    /// Register a plugin.
    pub fn register(&mut self, plugin: Arc<dyn LookupPlugin>) {
        self.plugins.insert(plugin.name(), plugin);
    }

    /// Run a lookup by name.
    pub fn run(
        &self,
        name: &str,
        terms: &[String],
        context: &LookupContext,
    ) -> LookupResult<Vec<Value>> {
        let plugin = self
            .plugins
            .get(name)
            .ok_or_else(|| LookupError::NotFound(name.to_string()))?;
        plugin.lookup(terms, context)
    }

    /// Check whether a plugin is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }
}

impl Default for LookupRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = LookupRegistry::with_builtins();
        for name in [
            "file",
            "lines",
            "fileglob",
            "first_found",
            "env",
            "pipe",
            "password",
            "items",
            "dict",
        ] {
            assert!(registry.contains(name), "missing plugin {name}");
        }
    }

    #[test]
    fn test_unknown_plugin_errors() {
        let registry = LookupRegistry::with_builtins();
        let err = registry
            .run("no_such", &[], &LookupContext::default())
            .unwrap_err();
        assert!(matches!(err, LookupError::NotFound(_)));
    }

    #[test]
    fn test_context_resolve() {
        let ctx = LookupContext::new(PathBuf::from("/playbooks"));
        assert_eq!(ctx.resolve("files/x"), PathBuf::from("/playbooks/files/x"));
        assert_eq!(ctx.resolve("/abs/x"), PathBuf::from("/abs/x"));
    }
}
