//! Task, block, and handler shapes plus the normalization from raw YAML
//! definitions.
//!
//! A raw task definition may invoke its module inline
//! (`shell: echo hi`), as a mapping (`copy: {src: ..., dest: ...}`), or
//! through an `args:` block; all three normalize to one module name plus
//! one argument value. Exactly one module per task is enforced here, as is
//! the eager rejection of constructs outside the supported subset.

use super::ParseError;
use crate::vars::yaml_to_json;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Keys of a task mapping that are task metadata, not module invocations.
const NON_MODULE_KEYS: &[&str] = &[
    "name",
    "when",
    "register",
    "notify",
    "loop",
    "loop_control",
    "ignore_errors",
    "changed_when",
    "failed_when",
    "tags",
    "become",
    "become_user",
    "become_method",
    "check_mode",
    "diff",
    "delegate_to",
    "vars",
    "args",
    "block",
    "rescue",
    "always",
    "include_tasks",
    "import_tasks",
    "include_role",
    "import_role",
    "listen",
    "environment",
    "run_once",
];

/// Task-level keys the runner deliberately rejects.
const UNSUPPORTED_TASK_KEYS: &[&str] = &["async", "poll", "strategy", "serial", "throttle"];

/// Accept YAML's looser booleans (`yes`, `no`, `on`, `off`, `1`, `0`).
pub(crate) fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(option_flexible_bool(deserializer)?.unwrap_or(false))
}

pub(crate) fn option_flexible_bool<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match value {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::Bool(b)) => Ok(Some(b)),
        Some(serde_yaml::Value::String(s)) => match s.to_lowercase().as_str() {
            "yes" | "true" | "on" | "1" => Ok(Some(true)),
            "no" | "false" | "off" | "0" | "" => Ok(Some(false)),
            other => Err(D::Error::custom(format!("invalid boolean '{}'", other))),
        },
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
        Some(other) => Err(D::Error::custom(format!("invalid boolean {:?}", other))),
    }
}

/// `when:` accepts a bare boolean, one expression, or a list (meaning AND).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WhenCondition {
    Bool(bool),
    Single(String),
    List(Vec<String>),
}

impl WhenCondition {
    /// Normalize to a list of expressions.
    pub fn to_list(&self) -> Vec<String> {
        match self {
            WhenCondition::Bool(b) => vec![b.to_string()],
            WhenCondition::Single(s) => vec![s.clone()],
            WhenCondition::List(list) => list.clone(),
        }
    }
}

/// `notify:` accepts one handler name or a list.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum NotifyValue {
    #[default]
    None,
    Single(String),
    List(Vec<String>),
}

impl NotifyValue {
    pub fn to_list(&self) -> Vec<String> {
        match self {
            NotifyValue::None => Vec::new(),
            NotifyValue::Single(s) => vec![s.clone()],
            NotifyValue::List(list) => list.clone(),
        }
    }
}

/// Loop control options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopControl {
    /// Variable bound to the current item
    #[serde(default = "default_loop_var")]
    pub loop_var: String,
    /// Optional variable bound to the item index
    #[serde(default)]
    pub index_var: Option<String>,
    /// Template used to label iterations in output
    #[serde(default)]
    pub label: Option<String>,
}

fn default_loop_var() -> String {
    "item".to_string()
}

impl Default for LoopControl {
    fn default() -> Self {
        Self {
            loop_var: default_loop_var(),
            index_var: None,
            label: None,
        }
    }
}

/// A single module invocation with its conditional, loop, and
/// error-handling metadata.
#[derive(Debug, Clone, Default)]
pub struct Task {
    /// Task name (may be empty)
    pub name: String,
    /// Registry key of the module to invoke
    pub module: String,
    /// The module name as written (kept for diagnostics)
    pub original_module: String,
    /// Pre-template module arguments
    pub args: Value,
    /// `when` expressions (AND)
    pub when: Vec<String>,
    /// Loop expression or literal list
    pub loop_spec: Option<Value>,
    /// Loop variable naming
    pub loop_control: LoopControl,
    /// Variable name the result registers under
    pub register: Option<String>,
    /// Override for the changed flag
    pub changed_when: Vec<String>,
    /// Override for failure detection
    pub failed_when: Vec<String>,
    /// Continue past failure
    pub ignore_errors: bool,
    /// Handlers to notify on change
    pub notify: Vec<String>,
    /// Tags for --tags / --skip-tags filtering
    pub tags: Vec<String>,
    /// Privilege escalation override
    pub r#become: Option<bool>,
    /// Escalation user override
    pub become_user: Option<String>,
    /// Escalation method override
    pub become_method: Option<String>,
    /// Per-task check mode override
    pub check_mode: Option<bool>,
    /// Per-task diff mode override
    pub diff: Option<bool>,
    /// Route the transport to another inventory host
    pub delegate_to: Option<String>,
    /// Task-scoped variables
    pub vars: IndexMap<String, Value>,
    /// Dynamic include: path of a task file expanded at execution time
    pub include_file: Option<String>,
    /// Dynamic role include: role name expanded at execution time
    pub include_role: Option<String>,
}

impl Task {
    /// Display name for output.
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            self.original_module.clone()
        } else {
            self.name.clone()
        }
    }

    /// Whether the task carries one of the given tags (or is untagged and
    /// no tag filter applies; that logic lives in the runner).
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// A task container with body/rescue/always semantics. Blocks may nest.
#[derive(Debug, Clone, Default)]
pub struct Block {
    /// Block name (may be empty)
    pub name: String,
    /// `when` guarding the whole block
    pub when: Vec<String>,
    /// Tags applying to all children
    pub tags: Vec<String>,
    /// Escalation override for all children
    pub r#become: Option<bool>,
    /// Escalation user override
    pub become_user: Option<String>,
    /// Block-scoped variables
    pub vars: IndexMap<String, Value>,
    /// Body
    pub body: Vec<TaskNode>,
    /// Runs when the body fails
    pub rescue: Vec<TaskNode>,
    /// Always runs
    pub always: Vec<TaskNode>,
}

/// One entry in a task list: a task or a nested block.
#[derive(Debug, Clone)]
pub enum TaskNode {
    Task(Task),
    Block(Block),
}

/// A handler: a task that runs at flush points when notified. Responds to
/// its name and to any of its `listen` topics.
#[derive(Debug, Clone)]
pub struct Handler {
    /// Handler name (the notify key)
    pub name: String,
    /// Additional notification topics
    pub listen: Vec<String>,
    /// The underlying task
    pub task: Task,
}

impl Handler {
    /// Whether a notification addresses this handler.
    pub fn responds_to(&self, notification: &str) -> bool {
        self.name == notification || self.listen.iter().any(|l| l == notification)
    }
}

/// Raw task definition straight from YAML.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub when: Option<WhenCondition>,
    #[serde(default)]
    pub register: Option<String>,
    #[serde(default)]
    pub notify: NotifyValue,
    #[serde(default, rename = "loop", alias = "with_items")]
    pub loop_spec: Option<serde_yaml::Value>,
    #[serde(default)]
    pub loop_control: Option<LoopControl>,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub ignore_errors: bool,
    #[serde(default)]
    pub changed_when: Option<WhenCondition>,
    #[serde(default)]
    pub failed_when: Option<WhenCondition>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, deserialize_with = "option_flexible_bool")]
    pub r#become: Option<bool>,
    #[serde(default)]
    pub become_user: Option<String>,
    #[serde(default)]
    pub become_method: Option<String>,
    #[serde(default, deserialize_with = "option_flexible_bool")]
    pub check_mode: Option<bool>,
    #[serde(default, deserialize_with = "option_flexible_bool")]
    pub diff: Option<bool>,
    #[serde(default)]
    pub delegate_to: Option<String>,
    #[serde(default)]
    pub vars: IndexMap<String, serde_yaml::Value>,
    #[serde(default)]
    pub args: Option<IndexMap<String, serde_yaml::Value>>,
    #[serde(default)]
    pub block: Option<Vec<TaskDefinition>>,
    #[serde(default)]
    pub rescue: Option<Vec<TaskDefinition>>,
    #[serde(default)]
    pub always: Option<Vec<TaskDefinition>>,
    #[serde(default)]
    pub include_tasks: Option<String>,
    #[serde(default)]
    pub import_tasks: Option<String>,
    #[serde(default)]
    pub include_role: Option<RoleIncludeDefinition>,
    #[serde(default)]
    pub import_role: Option<RoleIncludeDefinition>,
    /// Handlers only: extra notification topics.
    #[serde(default)]
    pub listen: Vec<String>,
    /// Catch-all for the module invocation plus anything unrecognized.
    #[serde(flatten)]
    pub extra: IndexMap<String, serde_yaml::Value>,
}

/// `include_role`/`import_role` argument shape.
#[derive(Debug, Clone, Deserialize)]
pub struct RoleIncludeDefinition {
    pub name: String,
}

impl TaskDefinition {
    fn location(&self) -> String {
        if self.name.is_empty() {
            "unnamed task".to_string()
        } else {
            format!("task '{}'", self.name)
        }
    }

    /// True when this definition is a block rather than a module call.
    pub fn is_block(&self) -> bool {
        self.block.is_some() || self.rescue.is_some() || self.always.is_some()
    }

    /// Reject the constructs outside the supported subset.
    fn check_supported(&self) -> Result<(), ParseError> {
        for key in self.extra.keys() {
            if UNSUPPORTED_TASK_KEYS.contains(&key.as_str()) {
                return Err(ParseError::UnsupportedFeature {
                    feature: key.clone(),
                    location: self.location(),
                });
            }
            if key.starts_with("with_") {
                return Err(ParseError::UnsupportedFeature {
                    feature: key.clone(),
                    location: self.location(),
                });
            }
        }
        Ok(())
    }

    /// Identify the module invocation among the leftover keys.
    fn module_invocation(&self) -> Result<(String, Value), ParseError> {
        let candidates: Vec<(&String, &serde_yaml::Value)> = self
            .extra
            .iter()
            .filter(|(key, _)| !NON_MODULE_KEYS.contains(&key.as_str()))
            .collect();

        match candidates.len() {
            0 => Err(ParseError::NoModule {
                location: self.location(),
            }),
            1 => {
                let (name, value) = candidates[0];
                Ok((name.clone(), yaml_to_json(value)))
            }
            _ => Err(ParseError::MultipleModules {
                location: self.location(),
                modules: candidates.iter().map(|(k, _)| k.to_string()).collect(),
            }),
        }
    }

    /// Convert into a strongly-shaped [`Task`].
    pub fn into_task(self) -> Result<Task, ParseError> {
        self.check_supported()?;

        let (original_module, mut args) = if let Some(file) = &self.include_tasks {
            ("include_tasks".to_string(), Value::String(file.clone()))
        } else if let Some(role) = &self.include_role {
            ("include_role".to_string(), Value::String(role.name.clone()))
        } else {
            self.module_invocation()?
        };

        // An `args:` block merges into (and loses to) inline arguments.
        if let Some(extra_args) = &self.args {
            let mut merged = serde_json::Map::new();
            for (key, value) in extra_args {
                merged.insert(key.clone(), yaml_to_json(value));
            }
            match &mut args {
                Value::Object(inline) => {
                    for (key, value) in merged {
                        inline.entry(key).or_insert(value);
                    }
                }
                Value::Null => args = Value::Object(merged),
                // Free-form string plus args block: keep both; the module
                // sees the string under its free-form parameter.
                Value::String(free_form) => {
                    let mut map = merged;
                    map.insert(
                        "_free_form".to_string(),
                        Value::String(free_form.clone()),
                    );
                    args = Value::Object(map);
                }
                _ => {}
            }
        }

        // Qualified names normalize at execution via the registry; the
        // original spelling is kept for messages.
        let module = original_module.clone();

        Ok(Task {
            name: self.name,
            module,
            original_module,
            args,
            when: self.when.map(|w| w.to_list()).unwrap_or_default(),
            loop_spec: self.loop_spec.as_ref().map(yaml_to_json),
            loop_control: self.loop_control.unwrap_or_default(),
            register: self.register,
            changed_when: self.changed_when.map(|w| w.to_list()).unwrap_or_default(),
            failed_when: self.failed_when.map(|w| w.to_list()).unwrap_or_default(),
            ignore_errors: self.ignore_errors,
            notify: self.notify.to_list(),
            tags: self.tags,
            r#become: self.r#become,
            become_user: self.become_user,
            become_method: self.become_method,
            check_mode: self.check_mode,
            diff: self.diff,
            delegate_to: self.delegate_to,
            vars: self
                .vars
                .iter()
                .map(|(k, v)| (k.clone(), yaml_to_json(v)))
                .collect(),
            include_file: self.include_tasks,
            include_role: self.include_role.map(|r| r.name),
        })
    }

    /// Convert into a block node.
    fn into_block(self, base_dir: Option<&std::path::Path>) -> Result<Block, ParseError> {
        self.check_supported()?;

        let convert = |defs: Option<Vec<TaskDefinition>>| -> Result<Vec<TaskNode>, ParseError> {
            defs.unwrap_or_default()
                .into_iter()
                .map(|def| def.into_node(base_dir))
                .collect()
        };

        Ok(Block {
            name: self.name.clone(),
            when: self.when.as_ref().map(|w| w.to_list()).unwrap_or_default(),
            tags: self.tags.clone(),
            r#become: self.r#become,
            become_user: self.become_user.clone(),
            vars: self
                .vars
                .iter()
                .map(|(k, v)| (k.clone(), yaml_to_json(v)))
                .collect(),
            body: convert(self.block)?,
            rescue: convert(self.rescue)?,
            always: convert(self.always)?,
        })
    }

    /// Convert into a node, statically expanding `import_tasks` when a base
    /// directory is available.
    pub fn into_node(self, base_dir: Option<&std::path::Path>) -> Result<TaskNode, ParseError> {
        if self.is_block() {
            return Ok(TaskNode::Block(self.into_block(base_dir)?));
        }

        if let Some(file) = &self.import_tasks {
            // Static import: expanded right here at parse time into an
            // anonymous block carrying the importing task's when/tags.
            let dir = base_dir.ok_or_else(|| {
                ParseError::Include(format!(
                    "import_tasks '{}' used without a playbook directory",
                    file
                ))
            })?;
            let nodes = load_task_file(&dir.join(file), Some(dir))?;
            return Ok(TaskNode::Block(Block {
                name: self.name.clone(),
                when: self.when.as_ref().map(|w| w.to_list()).unwrap_or_default(),
                tags: self.tags.clone(),
                r#become: self.r#become,
                become_user: self.become_user.clone(),
                vars: self
                    .vars
                    .iter()
                    .map(|(k, v)| (k.clone(), yaml_to_json(v)))
                    .collect(),
                body: nodes,
                rescue: Vec::new(),
                always: Vec::new(),
            }));
        }

        if let Some(role) = self.import_role.clone() {
            let dir = base_dir.ok_or_else(|| {
                ParseError::Include(format!(
                    "import_role '{}' used without a playbook directory",
                    role.name
                ))
            })?;
            let loaded = super::role::Role::load(dir, &role.name)?;
            return Ok(TaskNode::Block(loaded.into_block(
                self.when.as_ref().map(|w| w.to_list()).unwrap_or_default(),
                self.tags.clone(),
            )));
        }

        Ok(TaskNode::Task(self.into_task()?))
    }
}

/// Parse a task file into nodes (used by imports and dynamic includes).
pub fn load_task_file(
    path: &std::path::Path,
    base_dir: Option<&std::path::Path>,
) -> Result<Vec<TaskNode>, ParseError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ParseError::Include(format!("cannot read task file {}: {}", path.display(), e))
    })?;
    let defs: Vec<TaskDefinition> =
        serde_yaml::from_str(&content).map_err(|source| ParseError::Yaml {
            file: path.to_path_buf(),
            source,
        })?;
    defs.into_iter()
        .map(|def| def.into_node(base_dir))
        .collect()
}

/// Raw handler definition: a named task plus `listen` topics.
pub(crate) fn handler_from_definition(def: TaskDefinition) -> Result<Handler, ParseError> {
    if def.name.is_empty() {
        return Err(ParseError::MissingField {
            field: "name".to_string(),
            location: "handler".to_string(),
        });
    }
    let name = def.name.clone();
    let listen = def.listen.clone();
    let task = def.into_task()?;
    Ok(Handler { name, listen, task })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse_task(yaml: &str) -> Result<Task, ParseError> {
        let def: TaskDefinition = serde_yaml::from_str(yaml).unwrap();
        def.into_task()
    }

    #[test]
    fn test_inline_module_mapping() {
        let task = parse_task(
            r#"
name: Install thing
copy:
  src: a
  dest: b
register: r
"#,
        )
        .unwrap();
        assert_eq!(task.module, "copy");
        assert_eq!(task.args, json!({"src": "a", "dest": "b"}));
        assert_eq!(task.register.as_deref(), Some("r"));
    }

    #[test]
    fn test_free_form_module() {
        let task = parse_task("shell: echo hi\n").unwrap();
        assert_eq!(task.module, "shell");
        assert_eq!(task.args, json!("echo hi"));
    }

    #[test]
    fn test_args_block_merges() {
        let task = parse_task(
            r#"
file:
  path: /tmp/x
args:
  state: touch
  path: /ignored
"#,
        )
        .unwrap();
        // Inline wins on collision; args fills gaps.
        assert_eq!(task.args, json!({"path": "/tmp/x", "state": "touch"}));
    }

    #[test]
    fn test_when_list_and_scalar() {
        let task = parse_task("debug:\nwhen: x > 1\n").unwrap();
        assert_eq!(task.when, vec!["x > 1"]);

        let task = parse_task("debug:\nwhen:\n  - a\n  - b\n").unwrap();
        assert_eq!(task.when, vec!["a", "b"]);
    }

    #[test]
    fn test_no_module_rejected() {
        let err = parse_task("name: empty\n").unwrap_err();
        assert!(matches!(err, ParseError::NoModule { .. }));
    }

    #[test]
    fn test_two_modules_rejected() {
        let err = parse_task("debug:\nshell: echo\n").unwrap_err();
        assert!(matches!(err, ParseError::MultipleModules { .. }));
    }

    #[test]
    fn test_async_rejected() {
        let err = parse_task("shell: sleep 5\nasync: 10\npoll: 1\n").unwrap_err();
        match err {
            ParseError::UnsupportedFeature { feature, .. } => assert_eq!(feature, "async"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_with_items_is_loop_alias() {
        let task = parse_task("debug:\nwith_items:\n  - 1\n  - 2\n").unwrap();
        assert_eq!(task.loop_spec, Some(json!([1, 2])));
    }

    #[test]
    fn test_exotic_with_loops_rejected() {
        let err = parse_task("debug:\nwith_dict:\n  a: 1\n").unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedFeature { .. }));
    }

    #[test]
    fn test_loop_control_custom_var() {
        let task = parse_task(
            r#"
debug:
loop: "{{ packages }}"
loop_control:
  loop_var: pkg
"#,
        )
        .unwrap();
        assert_eq!(task.loop_control.loop_var, "pkg");
        assert_eq!(task.loop_spec, Some(json!("{{ packages }}")));
    }

    #[test]
    fn test_flexible_booleans() {
        let task = parse_task("debug:\nignore_errors: \"yes\"\nbecome: \"on\"\n").unwrap();
        assert!(task.ignore_errors);
        assert_eq!(task.r#become, Some(true));
    }

    #[test]
    fn test_block_node() {
        let def: TaskDefinition = serde_yaml::from_str(
            r#"
name: grouped
when: go
block:
  - debug:
rescue:
  - debug:
always:
  - debug:
"#,
        )
        .unwrap();
        let node = def.into_node(None).unwrap();
        match node {
            TaskNode::Block(block) => {
                assert_eq!(block.when, vec!["go"]);
                assert_eq!(block.body.len(), 1);
                assert_eq!(block.rescue.len(), 1);
                assert_eq!(block.always.len(), 1);
            }
            TaskNode::Task(_) => panic!("expected block"),
        }
    }

    #[test]
    fn test_handler_requires_name() {
        let def: TaskDefinition = serde_yaml::from_str("debug:\n").unwrap();
        assert!(handler_from_definition(def).is_err());
    }

    #[test]
    fn test_handler_listen() {
        let def: TaskDefinition = serde_yaml::from_str(
            r#"
name: restart app
listen:
  - restart services
debug:
"#,
        )
        .unwrap();
        let handler = handler_from_definition(def).unwrap();
        assert!(handler.responds_to("restart app"));
        assert!(handler.responds_to("restart services"));
        assert!(!handler.responds_to("other"));
    }

    #[test]
    fn test_include_tasks_is_dynamic() {
        let task = parse_task("include_tasks: extra.yml\nwhen: flag\n").unwrap();
        assert_eq!(task.include_file.as_deref(), Some("extra.yml"));
        assert_eq!(task.module, "include_tasks");
    }
}
