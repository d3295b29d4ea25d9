//! Role loading.
//!
//! A role lives at `roles/<name>/` with the conventional subdirectories:
//! `tasks/`, `handlers/`, `defaults/`, `vars/`, and `meta/`, each holding
//! a `main.yml`. Role defaults feed the lowest variable tier and role vars
//! a higher one; dependencies from `meta/main.yml` are flattened ahead of
//! the role's own tasks.

use super::task::{handler_from_definition, load_task_file, Block, Handler, TaskDefinition, TaskNode};
use super::ParseError;
use crate::vars::yaml_to_json;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// A loaded role: tasks, handlers, and its two variable tiers.
#[derive(Debug, Clone, Default)]
pub struct Role {
    /// Role name
    pub name: String,
    /// Role directory
    pub path: PathBuf,
    /// `defaults/main.yml` (lowest variable priority)
    pub defaults: IndexMap<String, Value>,
    /// `vars/main.yml` (above play vars)
    pub vars: IndexMap<String, Value>,
    /// Tasks, dependencies first
    pub tasks: Vec<TaskNode>,
    /// Handlers contributed to the play
    pub handlers: Vec<Handler>,
}

#[derive(Debug, Deserialize, Default)]
struct RoleMeta {
    #[serde(default)]
    dependencies: Vec<RoleDependency>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RoleDependency {
    Name(String),
    Spec { role: String },
}

impl RoleDependency {
    fn name(&self) -> &str {
        match self {
            RoleDependency::Name(name) => name,
            RoleDependency::Spec { role } => role,
        }
    }
}

impl Role {
    /// Load `roles/<name>` relative to the playbook directory, flattening
    /// meta dependencies ahead of the role's own tasks.
    pub fn load(base_dir: &Path, name: &str) -> Result<Self, ParseError> {
        let mut seen = Vec::new();
        Self::load_inner(base_dir, name, &mut seen)
    }

    fn load_inner(
        base_dir: &Path,
        name: &str,
        seen: &mut Vec<String>,
    ) -> Result<Self, ParseError> {
        if seen.iter().any(|s| s == name) {
            return Err(ParseError::Role(format!(
                "circular role dependency: {} -> {}",
                seen.join(" -> "),
                name
            )));
        }
        seen.push(name.to_string());

        let path = base_dir.join("roles").join(name);
        if !path.is_dir() {
            return Err(ParseError::Role(format!(
                "role '{}' not found under {}",
                name,
                base_dir.join("roles").display()
            )));
        }

        let mut role = Role {
            name: name.to_string(),
            path: path.clone(),
            ..Default::default()
        };

        role.defaults = read_vars_main(&path.join("defaults"))?;
        role.vars = read_vars_main(&path.join("vars"))?;

        // Dependencies run before the role itself; their variable tiers
        // merge below ours.
        if let Some(meta_file) = main_file(&path.join("meta")) {
            let content = std::fs::read_to_string(&meta_file)
                .map_err(|e| ParseError::Role(format!("cannot read {}: {}", meta_file.display(), e)))?;
            let meta: RoleMeta =
                serde_yaml::from_str(&content).map_err(|source| ParseError::Yaml {
                    file: meta_file.clone(),
                    source,
                })?;
            for dependency in &meta.dependencies {
                let dep = Self::load_inner(base_dir, dependency.name(), seen)?;
                for (key, value) in dep.defaults {
                    role.defaults.entry(key).or_insert(value);
                }
                for (key, value) in dep.vars {
                    role.vars.entry(key).or_insert(value);
                }
                role.tasks.extend(dep.tasks);
                role.handlers.extend(dep.handlers);
            }
        }

        if let Some(tasks_file) = main_file(&path.join("tasks")) {
            role.tasks
                .extend(load_task_file(&tasks_file, Some(base_dir))?);
        }

        if let Some(handlers_file) = main_file(&path.join("handlers")) {
            let content = std::fs::read_to_string(&handlers_file).map_err(|e| {
                ParseError::Role(format!("cannot read {}: {}", handlers_file.display(), e))
            })?;
            let defs: Vec<TaskDefinition> =
                serde_yaml::from_str(&content).map_err(|source| ParseError::Yaml {
                    file: handlers_file.clone(),
                    source,
                })?;
            for def in defs {
                role.handlers.push(handler_from_definition(def)?);
            }
        }

        seen.pop();
        Ok(role)
    }

    /// Wrap the role's tasks in a block for static imports, carrying the
    /// importing task's condition and tags. Role vars ride on the block.
    pub fn into_block(self, when: Vec<String>, tags: Vec<String>) -> Block {
        let mut vars = self.defaults;
        for (key, value) in self.vars {
            vars.insert(key, value);
        }
        Block {
            name: format!("role: {}", self.name),
            when,
            tags,
            r#become: None,
            become_user: None,
            vars,
            body: self.tasks,
            rescue: Vec::new(),
            always: Vec::new(),
        }
    }
}

/// The conventional `main.yml` / `main.yaml` inside a role subdirectory.
fn main_file(dir: &Path) -> Option<PathBuf> {
    for name in ["main.yml", "main.yaml"] {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn read_vars_main(dir: &Path) -> Result<IndexMap<String, Value>, ParseError> {
    let Some(file) = main_file(dir) else {
        return Ok(IndexMap::new());
    };
    let content = std::fs::read_to_string(&file)
        .map_err(|e| ParseError::Role(format!("cannot read {}: {}", file.display(), e)))?;
    let yaml: serde_yaml::Value =
        serde_yaml::from_str(&content).map_err(|source| ParseError::Yaml {
            file: file.clone(),
            source,
        })?;

    let mut vars = IndexMap::new();
    if let serde_yaml::Value::Mapping(map) = yaml {
        for (k, v) in map {
            if let serde_yaml::Value::String(key) = k {
                vars.insert(key, yaml_to_json(&v));
            }
        }
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_load_role_structure() {
        let dir = tempfile::tempdir().unwrap();
        let role_dir = dir.path().join("roles/web");
        write(
            &role_dir.join("tasks/main.yml"),
            "- name: one\n  debug:\n",
        );
        write(&role_dir.join("defaults/main.yml"), "port: 80\n");
        write(&role_dir.join("vars/main.yml"), "app: web\n");
        write(
            &role_dir.join("handlers/main.yml"),
            "- name: restart\n  debug:\n",
        );

        let role = Role::load(dir.path(), "web").unwrap();
        assert_eq!(role.tasks.len(), 1);
        assert_eq!(role.handlers.len(), 1);
        assert_eq!(role.defaults.get("port"), Some(&json!(80)));
        assert_eq!(role.vars.get("app"), Some(&json!("web")));
    }

    #[test]
    fn test_dependencies_flattened_first() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("roles/base/tasks/main.yml"),
            "- name: base task\n  debug:\n",
        );
        write(
            &dir.path().join("roles/app/meta/main.yml"),
            "dependencies:\n  - base\n",
        );
        write(
            &dir.path().join("roles/app/tasks/main.yml"),
            "- name: app task\n  debug:\n",
        );

        let role = Role::load(dir.path(), "app").unwrap();
        assert_eq!(role.tasks.len(), 2);
        match &role.tasks[0] {
            TaskNode::Task(task) => assert_eq!(task.name, "base task"),
            TaskNode::Block(_) => panic!("expected task"),
        }
    }

    #[test]
    fn test_missing_role_errors() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Role::load(dir.path(), "ghost"),
            Err(ParseError::Role(_))
        ));
    }

    #[test]
    fn test_circular_dependency_detected() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("roles/a/meta/main.yml"),
            "dependencies: [b]\n",
        );
        write(&dir.path().join("roles/a/tasks/main.yml"), "[]\n");
        write(
            &dir.path().join("roles/b/meta/main.yml"),
            "dependencies: [a]\n",
        );
        write(&dir.path().join("roles/b/tasks/main.yml"), "[]\n");

        let err = Role::load(dir.path(), "a").unwrap_err();
        assert!(matches!(err, ParseError::Role(_)));
    }
}
