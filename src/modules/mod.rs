//! Module system: the units of work tasks invoke.
//!
//! A module is identified by a name plus aliases (including fully
//! qualified `namespace.collection.module` forms); the registry maps every
//! alias to one implementation. Each module declares its required and
//! known argument names, receives a rendered argument map plus an
//! execution context (connection, variables, check/diff mode), and returns
//! a [`ModuleOutput`].
//!
//! In check mode a module must not mutate remote state but still reports
//! whether it would have; modules that cannot simulate safely report
//! skipped with a reason.

pub mod command;
pub mod control;
pub mod copy;
pub mod file;
pub mod lineinfile;
pub mod setup;
pub mod stat;
pub mod template;
pub mod wait_for;
pub mod windows;

use crate::connection::{Connection, ConnectionError, ExecuteOptions, ShellKind};
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Sentinel produced by the `omit()` template function; arguments equal to
/// it are dropped before the module sees them.
pub const OMIT_SENTINEL: &str = "__omit_placeholder__";

/// Qualified-name prefixes this runner implements natively.
const KNOWN_NAMESPACES: &[&str] = &[
    "ansible.builtin",
    "ansible.legacy",
    "ansible.windows",
    "ansible.posix",
];

/// Errors that can occur during module execution.
#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("module not found: {0}")]
    NotFound(String),

    #[error("module '{name}' is not provided by namespace '{namespace}'")]
    UnknownNamespace {
        /// The unqualified module name
        name: String,
        /// The namespace prefix the task used
        namespace: String,
    },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("command failed with exit code {code}: {message}")]
    CommandFailed { code: i32, message: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for module operations.
pub type ModuleResult<T> = Result<T, ModuleError>;

/// Status of a module execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    /// Executed and changed state
    Changed,
    /// Executed, nothing to change
    Ok,
    /// Execution failed
    Failed,
    /// Not executed (condition, empty loop, unsimulatable check mode)
    Skipped,
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleStatus::Changed => write!(f, "changed"),
            ModuleStatus::Ok => write!(f, "ok"),
            ModuleStatus::Failed => write!(f, "failed"),
            ModuleStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// A file difference reported in diff mode.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Diff {
    /// Content before the change
    pub before: String,
    /// Content after the change
    pub after: String,
    /// Label for the before side (usually the path)
    pub before_header: String,
    /// Label for the after side
    pub after_header: String,
}

impl Diff {
    /// Build a diff for one file path.
    pub fn for_path(path: &str, before: impl Into<String>, after: impl Into<String>) -> Self {
        Self {
            before: before.into(),
            after: after.into(),
            before_header: path.to_string(),
            after_header: path.to_string(),
        }
    }

    /// Unified-diff rendering for terminal output.
    pub fn unified(&self) -> String {
        similar::TextDiff::from_lines(&self.before, &self.after)
            .unified_diff()
            .header(&self.before_header, &self.after_header)
            .to_string()
    }
}

/// Result of one module execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleOutput {
    /// Whether state changed
    pub changed: bool,
    /// Human-readable message
    pub msg: String,
    /// Execution status
    pub status: ModuleStatus,
    /// Diff payload when diff mode applies
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<Diff>,
    /// Module-specific result data
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub data: IndexMap<String, Value>,
    /// Captured stdout (command-style modules)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured stderr
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Exit code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rc: Option<i32>,
}

impl ModuleOutput {
    /// Success without changes.
    pub fn ok(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Ok, false, msg)
    }

    /// Success with changes.
    pub fn changed(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Changed, true, msg)
    }

    /// Failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Failed, false, msg)
    }

    /// Skipped.
    pub fn skipped(msg: impl Into<String>) -> Self {
        Self::with_status(ModuleStatus::Skipped, false, msg)
    }

    fn with_status(status: ModuleStatus, changed: bool, msg: impl Into<String>) -> Self {
        Self {
            changed,
            msg: msg.into(),
            status,
            diff: None,
            data: IndexMap::new(),
            stdout: None,
            stderr: None,
            rc: None,
        }
    }

    /// Attach a diff payload.
    pub fn with_diff(mut self, diff: Diff) -> Self {
        self.diff = Some(diff);
        self
    }

    /// Attach a data entry.
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Attach command output.
    pub fn with_command_output(mut self, stdout: String, stderr: String, rc: i32) -> Self {
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self.rc = Some(rc);
        self
    }
}

/// Rendered module arguments.
pub type ModuleParams = IndexMap<String, Value>;

/// Context for module execution.
#[derive(Clone)]
pub struct ModuleContext {
    /// Dry-run mode: report would-change, never mutate
    pub check_mode: bool,
    /// Attach diff payloads on file edits
    pub diff_mode: bool,
    /// The effective variables of the host being acted on
    pub vars: IndexMap<String, Value>,
    /// Transport to the target (local transport for control-node modules)
    pub connection: Arc<dyn Connection>,
    /// Privilege escalation requested for this task
    pub r#become: bool,
    /// Escalation target user
    pub become_user: Option<String>,
    /// Escalation method
    pub become_method: Option<String>,
    /// Escalation password
    pub become_password: Option<String>,
    /// Per-command timeout in seconds
    pub timeout: Option<u64>,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("check_mode", &self.check_mode)
            .field("diff_mode", &self.diff_mode)
            .field("become", &self.r#become)
            .field("connection", &self.connection.identifier())
            .finish()
    }
}

impl ModuleContext {
    /// Resolve a control-node path relative to the playbook directory
    /// (exposed to modules through the `playbook_dir` variable).
    pub fn resolve_local_path(&self, path: &str) -> std::path::PathBuf {
        let p = std::path::Path::new(path);
        if p.is_absolute() {
            return p.to_path_buf();
        }
        match self.vars.get("playbook_dir").and_then(Value::as_str) {
            Some(dir) => std::path::Path::new(dir).join(p),
            None => p.to_path_buf(),
        }
    }

    /// Execute options carrying this context's escalation and timeout.
    pub fn exec_options(&self, shell: ShellKind) -> ExecuteOptions {
        let mut options = ExecuteOptions::new().with_shell(shell);
        options.timeout = self.timeout;
        if self.r#become {
            options.escalate = true;
            options.escalate_user = self.become_user.clone();
            options.escalate_method = self.become_method.clone();
            options.escalate_password = self.become_password.clone();
        }
        options
    }
}

/// Trait all modules implement.
#[async_trait]
pub trait Module: Send + Sync {
    /// Primary name.
    fn name(&self) -> &'static str;

    /// Alias names resolving to this module.
    fn aliases(&self) -> &'static [&'static str] {
        &[]
    }

    /// One-line description.
    fn description(&self) -> &'static str;

    /// Required argument names.
    fn required_params(&self) -> &'static [&'static str] {
        &[]
    }

    /// Known optional argument names (used when splitting free-form
    /// strings into command text and keyword arguments).
    fn optional_params(&self) -> &'static [&'static str] {
        &[]
    }

    /// The parameter a bare string argument maps to, for modules that
    /// accept free-form invocation (`shell: echo hi`).
    fn free_form_param(&self) -> Option<&'static str> {
        None
    }

    /// True for modules that run entirely on the control node.
    fn control_node(&self) -> bool {
        false
    }

    /// Execute with rendered arguments.
    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput>;
}

/// Registry mapping module names and aliases to implementations.
/// Write-once at startup, read-only afterwards.
pub struct ModuleRegistry {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            modules: HashMap::new(),
        }
    }

    /// Create a registry with every built-in module.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();

        // Command execution
        registry.register(Arc::new(command::CommandModule));
        registry.register(Arc::new(command::ShellModule));
        registry.register(Arc::new(command::RawModule));

        // File handling
        registry.register(Arc::new(copy::CopyModule));
        registry.register(Arc::new(file::FileModule));
        registry.register(Arc::new(lineinfile::LineinfileModule));
        registry.register(Arc::new(lineinfile::ReplaceModule));
        registry.register(Arc::new(lineinfile::BlockinfileModule));
        registry.register(Arc::new(stat::StatModule));
        registry.register(Arc::new(template::TemplateModule));

        // Control-node logic
        registry.register(Arc::new(control::DebugModule));
        registry.register(Arc::new(control::SetFactModule));
        registry.register(Arc::new(control::AssertModule));
        registry.register(Arc::new(control::FailModule));
        registry.register(Arc::new(control::PingModule));
        registry.register(Arc::new(control::MetaModule));
        registry.register(Arc::new(control::AddHostModule));
        registry.register(Arc::new(control::GroupByModule));
        registry.register(Arc::new(control::IncludeVarsModule));

        // Facts and waiting
        registry.register(Arc::new(setup::SetupModule));
        registry.register(Arc::new(wait_for::WaitForModule));

        // Windows counterparts
        registry.register(Arc::new(windows::WinCommandModule));
        registry.register(Arc::new(windows::WinShellModule));
        registry.register(Arc::new(windows::WinCopyModule));
        registry.register(Arc::new(windows::WinFileModule));
        registry.register(Arc::new(windows::WinStatModule));
        registry.register(Arc::new(windows::WinServiceModule));
        registry.register(Arc::new(windows::WinLineinfileModule));
        registry.register(Arc::new(windows::WinWaitForModule));

        registry
    }

    /// Register a module under its name and all aliases.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules
            .insert(module.name().to_string(), Arc::clone(&module));
        for alias in module.aliases() {
            self.modules.insert(alias.to_string(), Arc::clone(&module));
        }
    }

    /// Resolve a possibly-qualified module name.
    ///
    /// Tries an exact match first. For `namespace.collection.module`
    /// forms, the prefix must be a namespace this runner implements;
    /// a qualified name from an unknown namespace is an error even when
    /// the bare suffix would match, so a foreign collection's module is
    /// never silently mis-dispatched.
    pub fn resolve(&self, name: &str) -> ModuleResult<Arc<dyn Module>> {
        if let Some(module) = self.modules.get(name) {
            return Ok(Arc::clone(module));
        }

        if let Some((namespace, bare)) = name.rsplit_once('.') {
            if !KNOWN_NAMESPACES.contains(&namespace) {
                return Err(ModuleError::UnknownNamespace {
                    name: bare.to_string(),
                    namespace: namespace.to_string(),
                });
            }
            if let Some(module) = self.modules.get(bare) {
                return Ok(Arc::clone(module));
            }
        }

        Err(ModuleError::NotFound(name.to_string()))
    }

    /// Check whether a name (or resolvable qualified name) is known.
    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_ok()
    }

    /// Normalize a raw argument value into a parameter map, resolve the
    /// module, validate required parameters, and execute.
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let module = self.resolve(name)?;
        let params = normalize_args(module.as_ref(), args)?;

        for required in module.required_params() {
            if !params.contains_key(*required) {
                return Err(ModuleError::MissingParameter(format!(
                    "{} (module '{}')",
                    required,
                    module.name()
                )));
            }
        }

        module.execute(&params, context).await
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Normalize the argument shapes a task may carry: a mapping, a free-form
/// string, or a `key=value` short form. Arguments rendered to the omit
/// sentinel are dropped.
pub fn normalize_args(module: &dyn Module, args: &Value) -> ModuleResult<ModuleParams> {
    let mut params = match args {
        Value::Null => ModuleParams::new(),
        Value::Object(map) => {
            let mut params: ModuleParams =
                map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            // A free-form string that arrived alongside an `args:` block is
            // carried under a reserved key; give it its real name.
            if let Some(free_form) = params.shift_remove("_free_form") {
                if let Some(key) = module.free_form_param() {
                    params.entry(key.to_string()).or_insert(free_form);
                }
            }
            params
        }
        Value::String(text) => parse_string_args(module, text)?,
        other => {
            return Err(ModuleError::InvalidParameter(format!(
                "module arguments must be a mapping or string, got {}",
                other
            )))
        }
    };

    params.retain(|_, v| v.as_str() != Some(OMIT_SENTINEL));
    Ok(params)
}

/// Split a string argument. For free-form modules, tokens of the form
/// `known_key=value` peel off into keyword arguments and the remainder is
/// the free-form parameter; for everything else the whole string must be
/// `key=value` pairs. Values containing spaces take matching quotes.
fn parse_string_args(module: &dyn Module, text: &str) -> ModuleResult<ModuleParams> {
    let tokens = shell_words::split(text)
        .map_err(|e| ModuleError::InvalidParameter(format!("unbalanced quotes: {}", e)))?;

    let mut params = ModuleParams::new();

    if let Some(free_form) = module.free_form_param() {
        let known: Vec<&str> = module
            .required_params()
            .iter()
            .chain(module.optional_params())
            .copied()
            .collect();
        let mut free_parts: Vec<String> = Vec::new();
        for token in tokens {
            match token.split_once('=') {
                Some((key, value)) if known.contains(&key) => {
                    params.insert(key.to_string(), Value::String(value.to_string()));
                }
                _ => free_parts.push(token),
            }
        }
        if !free_parts.is_empty() {
            params.insert(
                free_form.to_string(),
                Value::String(shell_words::join(free_parts.iter().map(String::as_str))),
            );
        }
    } else {
        for token in tokens {
            let (key, value) = token.split_once('=').ok_or_else(|| {
                ModuleError::InvalidParameter(format!(
                    "expected key=value in arguments for '{}', got '{}'",
                    module.name(),
                    token
                ))
            })?;
            params.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    Ok(params)
}

/// Helpers for pulling typed values out of a parameter map.
pub trait ParamExt {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>>;
    fn get_string_required(&self, key: &str) -> ModuleResult<String>;
    fn get_bool_or(&self, key: &str, default: bool) -> bool;
    fn get_u64(&self, key: &str) -> ModuleResult<Option<u64>>;
    fn get_mode(&self, key: &str) -> ModuleResult<Option<u32>>;
}

impl ParamExt for ModuleParams {
    fn get_string(&self, key: &str) -> ModuleResult<Option<String>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Ok(Some(match other {
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => n.to_string(),
                v => v.to_string(),
            })),
        }
    }

    fn get_string_required(&self, key: &str) -> ModuleResult<String> {
        self.get_string(key)?
            .ok_or_else(|| ModuleError::MissingParameter(key.to_string()))
    }

    fn get_bool_or(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => {
                matches!(s.to_lowercase().as_str(), "true" | "yes" | "on" | "1")
            }
            Some(Value::Number(n)) => n.as_i64().map(|i| i != 0).unwrap_or(default),
            _ => default,
        }
    }

    fn get_u64(&self, key: &str) -> ModuleResult<Option<u64>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                ModuleError::InvalidParameter(format!("{} must be a positive integer", key))
            }),
            Some(Value::String(s)) => s.parse().map(Some).map_err(|_| {
                ModuleError::InvalidParameter(format!("{} must be a positive integer", key))
            }),
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a positive integer",
                key
            ))),
        }
    }

    /// File modes accept octal strings ("0644") or numbers.
    fn get_mode(&self, key: &str) -> ModuleResult<Option<u32>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(n)) => n
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| {
                    ModuleError::InvalidParameter(format!("{} must be a mode", key))
                }),
            Some(Value::String(s)) => {
                let s = s.trim().trim_start_matches("0o");
                u32::from_str_radix(s, 8).map(Some).map_err(|_| {
                    ModuleError::InvalidParameter(format!("{} must be an octal mode", key))
                })
            }
            Some(_) => Err(ModuleError::InvalidParameter(format!(
                "{} must be a mode",
                key
            ))),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::connection::local::LocalConnection;

    /// A context wired to the local transport for module tests.
    pub fn local_context() -> ModuleContext {
        ModuleContext {
            check_mode: false,
            diff_mode: false,
            vars: IndexMap::new(),
            connection: Arc::new(LocalConnection::new()),
            r#become: false,
            become_user: None,
            become_method: None,
            become_password: None,
            timeout: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registry_builtin_surface() {
        let registry = ModuleRegistry::with_builtins();
        for name in [
            "command",
            "shell",
            "raw",
            "copy",
            "file",
            "lineinfile",
            "blockinfile",
            "replace",
            "stat",
            "template",
            "ping",
            "debug",
            "set_fact",
            "assert",
            "fail",
            "setup",
            "wait_for",
            "meta",
            "add_host",
            "group_by",
            "include_vars",
            "win_command",
            "win_shell",
            "win_copy",
            "win_file",
            "win_service",
            "win_stat",
            "win_lineinfile",
            "win_wait_for",
        ] {
            assert!(registry.contains(name), "missing module {name}");
        }
    }

    #[test]
    fn test_qualified_resolution() {
        let registry = ModuleRegistry::with_builtins();
        assert!(registry.resolve("ansible.builtin.command").is_ok());
        assert!(registry.resolve("ansible.windows.win_copy").is_ok());

        let result = registry.resolve("community.general.ufw");
        assert!(matches!(result, Err(ModuleError::UnknownNamespace { .. })));

        assert!(matches!(
            registry.resolve("no_such_module"),
            Err(ModuleError::NotFound(_))
        ));
    }

    #[test]
    fn test_normalize_mapping_args() {
        let registry = ModuleRegistry::with_builtins();
        let module = registry.resolve("copy").unwrap();
        let params =
            normalize_args(module.as_ref(), &json!({"src": "a", "dest": "b"})).unwrap();
        assert_eq!(params.get("src"), Some(&json!("a")));
    }

    #[test]
    fn test_normalize_free_form_with_kwargs() {
        let registry = ModuleRegistry::with_builtins();
        let module = registry.resolve("shell").unwrap();
        let params = normalize_args(
            module.as_ref(),
            &json!("echo hello world creates=/tmp/marker"),
        )
        .unwrap();
        assert_eq!(params.get("cmd"), Some(&json!("echo hello world")));
        assert_eq!(params.get("creates"), Some(&json!("/tmp/marker")));
    }

    #[test]
    fn test_normalize_key_value_string() {
        let registry = ModuleRegistry::with_builtins();
        let module = registry.resolve("file").unwrap();
        let params = normalize_args(
            module.as_ref(),
            &json!(r#"path="/tmp/spaced name" state=touch"#),
        )
        .unwrap();
        assert_eq!(params.get("path"), Some(&json!("/tmp/spaced name")));
        assert_eq!(params.get("state"), Some(&json!("touch")));
    }

    #[test]
    fn test_omit_sentinel_dropped() {
        let registry = ModuleRegistry::with_builtins();
        let module = registry.resolve("file").unwrap();
        let params = normalize_args(
            module.as_ref(),
            &json!({"path": "/tmp/x", "mode": OMIT_SENTINEL}),
        )
        .unwrap();
        assert!(!params.contains_key("mode"));
    }

    #[test]
    fn test_param_ext_mode_octal() {
        let mut params = ModuleParams::new();
        params.insert("mode".to_string(), json!("0644"));
        assert_eq!(params.get_mode("mode").unwrap(), Some(0o644));

        params.insert("mode".to_string(), json!(493));
        assert_eq!(params.get_mode("mode").unwrap(), Some(493));
    }
}
