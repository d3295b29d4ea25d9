//! Playbook parsing: plays, tasks, blocks, handlers, and roles.
//!
//! A playbook document is a sequence of plays. Parsing translates the
//! generic YAML tree into strongly-shaped structures, normalizes module
//! invocation shapes, expands static `import_*` constructs in place, and
//! eagerly rejects anything outside the supported subset
//! (`async`/`poll`, non-linear strategies, `serial`, `throttle`,
//! `max_fail_percentage`).

pub mod role;
pub mod task;

pub use role::Role;
pub use task::{
    Block, Handler, LoopControl, NotifyValue, Task, TaskDefinition, TaskNode, WhenCondition,
};

use crate::vars::yaml_to_json;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use task::{flexible_bool, handler_from_definition, option_flexible_bool};
use thiserror::Error;

/// Errors raised while parsing playbooks, task files, or roles.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error in '{file}': {source}")]
    Yaml {
        file: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid playbook structure: {0}")]
    InvalidStructure(String),

    #[error("missing required field '{field}' in {location}")]
    MissingField { field: String, location: String },

    #[error("unsupported construct '{feature}' in {location}")]
    UnsupportedFeature { feature: String, location: String },

    #[error("{location} declares no module")]
    NoModule { location: String },

    #[error("{location} declares multiple modules: {modules:?}")]
    MultipleModules {
        location: String,
        modules: Vec<String>,
    },

    #[error("include error: {0}")]
    Include(String),

    #[error("role error: {0}")]
    Role(String),
}

impl ParseError {
    /// True when this error should map to the unsupported-construct exit
    /// code rather than the generic parse-error one.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ParseError::UnsupportedFeature { .. })
    }
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Keys of a play mapping the runner deliberately rejects.
const UNSUPPORTED_PLAY_KEYS: &[&str] = &["serial", "throttle", "max_fail_percentage"];

/// Raw play definition from YAML.
#[derive(Debug, Deserialize)]
struct PlayDefinition {
    #[serde(default)]
    name: String,
    hosts: Option<String>,
    #[serde(default = "default_true", deserialize_with = "flexible_bool")]
    gather_facts: bool,
    #[serde(default)]
    vars: IndexMap<String, serde_yaml::Value>,
    #[serde(default)]
    vars_files: Vec<String>,
    #[serde(default)]
    roles: Vec<RoleRef>,
    #[serde(default)]
    pre_tasks: Vec<TaskDefinition>,
    #[serde(default)]
    tasks: Vec<TaskDefinition>,
    #[serde(default)]
    post_tasks: Vec<TaskDefinition>,
    #[serde(default)]
    handlers: Vec<TaskDefinition>,
    #[serde(default, deserialize_with = "flexible_bool")]
    r#become: bool,
    #[serde(default)]
    become_user: Option<String>,
    #[serde(default)]
    become_method: Option<String>,
    #[serde(default, deserialize_with = "option_flexible_bool")]
    check_mode: Option<bool>,
    #[serde(default, deserialize_with = "option_flexible_bool")]
    diff: Option<bool>,
    #[serde(default, deserialize_with = "flexible_bool")]
    any_errors_fatal: bool,
    #[serde(default, deserialize_with = "flexible_bool")]
    force_handlers: bool,
    #[serde(default)]
    strategy: Option<String>,
    #[serde(flatten)]
    extra: IndexMap<String, serde_yaml::Value>,
}

fn default_true() -> bool {
    true
}

/// A role reference in a play's `roles:` list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RoleRef {
    Name(String),
    Spec {
        #[serde(alias = "name")]
        role: String,
        #[serde(default)]
        vars: IndexMap<String, serde_yaml::Value>,
    },
}

/// A play: a host selector bound to ordered task lists and handlers.
#[derive(Debug, Clone, Default)]
pub struct Play {
    /// Play name
    pub name: String,
    /// Host selection pattern
    pub hosts: String,
    /// Whether to run the fact gatherer first
    pub gather_facts: bool,
    /// Play-level variables
    pub vars: IndexMap<String, Value>,
    /// Variable files loaded at play start
    pub vars_files: Vec<String>,
    /// Included roles, in order
    pub roles: Vec<Role>,
    /// Tasks before roles and tasks
    pub pre_tasks: Vec<TaskNode>,
    /// Main task list
    pub tasks: Vec<TaskNode>,
    /// Tasks after the main list
    pub post_tasks: Vec<TaskNode>,
    /// Handlers keyed by name and listen topics
    pub handlers: Vec<Handler>,
    /// Play-level privilege escalation default
    pub r#become: bool,
    /// Escalation user default
    pub become_user: Option<String>,
    /// Escalation method default
    pub become_method: Option<String>,
    /// Play-level check mode override
    pub check_mode: Option<bool>,
    /// Play-level diff mode override
    pub diff: Option<bool>,
    /// Promote any single-host failure to a play-wide stop
    pub any_errors_fatal: bool,
    /// Run remaining handlers even on failed hosts
    pub force_handlers: bool,
}

impl Play {
    fn from_definition(def: PlayDefinition, base_dir: Option<&Path>) -> ParseResult<Self> {
        let location = if def.name.is_empty() {
            "play".to_string()
        } else {
            format!("play '{}'", def.name)
        };

        let hosts = def.hosts.ok_or_else(|| ParseError::MissingField {
            field: "hosts".to_string(),
            location: location.clone(),
        })?;

        for key in def.extra.keys() {
            if UNSUPPORTED_PLAY_KEYS.contains(&key.as_str()) {
                return Err(ParseError::UnsupportedFeature {
                    feature: key.clone(),
                    location,
                });
            }
        }
        if let Some(strategy) = &def.strategy {
            if strategy != "linear" {
                return Err(ParseError::UnsupportedFeature {
                    feature: format!("strategy: {}", strategy),
                    location,
                });
            }
        }

        let convert = |defs: Vec<TaskDefinition>| -> ParseResult<Vec<TaskNode>> {
            defs.into_iter().map(|d| d.into_node(base_dir)).collect()
        };

        let mut handlers = Vec::new();
        for def in def.handlers {
            handlers.push(handler_from_definition(def)?);
        }

        let mut roles = Vec::new();
        for role_ref in &def.roles {
            let dir = base_dir.ok_or_else(|| {
                ParseError::Role("roles require a playbook directory".to_string())
            })?;
            let (name, role_vars) = match role_ref {
                RoleRef::Name(name) => (name.as_str(), IndexMap::new()),
                RoleRef::Spec { role, vars } => (
                    role.as_str(),
                    vars.iter()
                        .map(|(k, v)| (k.clone(), yaml_to_json(v)))
                        .collect::<IndexMap<String, Value>>(),
                ),
            };
            let mut role = Role::load(dir, name)?;
            // Inline role parameters override the role's own vars tier.
            for (key, value) in role_vars {
                role.vars.insert(key, value);
            }
            handlers.extend(role.handlers.drain(..));
            roles.push(role);
        }

        Ok(Play {
            name: def.name,
            hosts,
            gather_facts: def.gather_facts,
            vars: def
                .vars
                .iter()
                .map(|(k, v)| (k.clone(), yaml_to_json(v)))
                .collect(),
            vars_files: def.vars_files,
            roles,
            pre_tasks: convert(def.pre_tasks)?,
            tasks: convert(def.tasks)?,
            post_tasks: convert(def.post_tasks)?,
            handlers,
            r#become: def.r#become,
            become_user: def.become_user,
            become_method: def.become_method,
            check_mode: def.check_mode,
            diff: def.diff,
            any_errors_fatal: def.any_errors_fatal,
            force_handlers: def.force_handlers,
        })
    }
}

/// A parsed playbook: an ordered sequence of plays.
#[derive(Debug, Clone, Default)]
pub struct Playbook {
    /// Plays in declaration order
    pub plays: Vec<Play>,
    /// Source path (used to resolve relative includes and roles)
    pub path: Option<PathBuf>,
}

impl Playbook {
    /// Load and parse a playbook file.
    pub fn load<P: AsRef<Path>>(path: P) -> ParseResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let base_dir = path.parent().map(Path::to_path_buf);
        let mut playbook = Self::parse(&content, base_dir.as_deref())?;
        playbook.path = Some(path.to_path_buf());
        Ok(playbook)
    }

    /// Parse playbook text. `base_dir` anchors includes, imports, and
    /// roles; without one those constructs fail to parse.
    pub fn parse(content: &str, base_dir: Option<&Path>) -> ParseResult<Self> {
        let docs: serde_yaml::Value = serde_yaml::from_str(content).map_err(|source| {
            ParseError::Yaml {
                file: PathBuf::from("<playbook>"),
                source,
            }
        })?;

        let serde_yaml::Value::Sequence(raw_plays) = docs else {
            return Err(ParseError::InvalidStructure(
                "a playbook must be a list of plays".to_string(),
            ));
        };

        let mut playbook = Playbook::default();
        for raw_play in raw_plays {
            let def: PlayDefinition =
                serde_yaml::from_value(raw_play).map_err(|source| ParseError::Yaml {
                    file: PathBuf::from("<playbook>"),
                    source,
                })?;
            playbook.plays.push(Play::from_definition(def, base_dir)?);
        }

        Ok(playbook)
    }

    /// The directory the playbook lives in.
    pub fn base_dir(&self) -> PathBuf {
        self.path
            .as_ref()
            .and_then(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}
