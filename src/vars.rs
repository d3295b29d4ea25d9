//! Variable precedence and merging.
//!
//! Variables reach a host from many places: group vars, inventory host vars,
//! `group_vars/`/`host_vars/` overlays, play vars, role defaults and vars,
//! registered results, `set_fact`, and `--extra-vars`. This module provides
//! the layered store that merges them in a fixed priority order.

use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;

/// Variable precedence levels, from lowest to highest priority.
///
/// A later (higher) level wins on key collision. Maps merge shallowly;
/// lists and scalars replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum VarPrecedence {
    /// Role defaults (`defaults/main.yml`), lowest priority
    RoleDefaults = 1,
    /// Group vars from the implicit `all` group
    GroupVarsAll = 2,
    /// Other inventory group vars (child groups override parents)
    GroupVars = 3,
    /// `group_vars/<name>` overlay files
    GroupVarsOverlay = 4,
    /// Host vars from the inventory source itself
    InventoryHostVars = 5,
    /// `host_vars/<name>` overlay files
    HostVarsOverlay = 6,
    /// Gathered facts
    Facts = 7,
    /// Play `vars` and `vars_files`
    PlayVars = 8,
    /// Role vars (`vars/main.yml`)
    RoleVars = 9,
    /// Block and task `vars`
    TaskVars = 10,
    /// `--extra-vars` from the command line
    ExtraVars = 11,
    /// `set_fact`, `register`, and `include_vars` results, applied by the
    /// runner; highest priority so a registered name always resolves to the
    /// captured result
    SetFacts = 12,
}

impl VarPrecedence {
    /// All precedence levels in merge order (lowest to highest).
    pub fn all() -> impl Iterator<Item = VarPrecedence> {
        [
            VarPrecedence::RoleDefaults,
            VarPrecedence::GroupVarsAll,
            VarPrecedence::GroupVars,
            VarPrecedence::GroupVarsOverlay,
            VarPrecedence::InventoryHostVars,
            VarPrecedence::HostVarsOverlay,
            VarPrecedence::Facts,
            VarPrecedence::PlayVars,
            VarPrecedence::RoleVars,
            VarPrecedence::TaskVars,
            VarPrecedence::ExtraVars,
            VarPrecedence::SetFacts,
        ]
        .into_iter()
    }
}

impl std::fmt::Display for VarPrecedence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            VarPrecedence::RoleDefaults => "role defaults",
            VarPrecedence::GroupVarsAll => "group vars (all)",
            VarPrecedence::GroupVars => "group vars",
            VarPrecedence::GroupVarsOverlay => "group_vars/*",
            VarPrecedence::InventoryHostVars => "inventory host vars",
            VarPrecedence::HostVarsOverlay => "host_vars/*",
            VarPrecedence::Facts => "facts",
            VarPrecedence::PlayVars => "play vars",
            VarPrecedence::RoleVars => "role vars",
            VarPrecedence::TaskVars => "task vars",
            VarPrecedence::ExtraVars => "extra vars",
            VarPrecedence::SetFacts => "set_fact / register",
        };
        write!(f, "{}", name)
    }
}

/// Layered variable store with precedence-ordered merging.
///
/// Each precedence level holds an insertion-ordered map; [`VarStore::merged`]
/// flattens them lowest-to-highest. The merged view is cached and
/// invalidated on writes.
#[derive(Debug, Clone, Default)]
pub struct VarStore {
    layers: HashMap<VarPrecedence, IndexMap<String, Value>>,
    merged_cache: Option<IndexMap<String, Value>>,
}

impl VarStore {
    /// Create a new empty variable store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single variable at a precedence level.
    pub fn set(&mut self, key: impl Into<String>, value: Value, precedence: VarPrecedence) {
        self.merged_cache = None;
        self.layers
            .entry(precedence)
            .or_default()
            .insert(key.into(), value);
    }

    /// Set multiple variables at a precedence level.
    pub fn set_many(&mut self, vars: IndexMap<String, Value>, precedence: VarPrecedence) {
        if vars.is_empty() {
            return;
        }
        self.merged_cache = None;
        let layer = self.layers.entry(precedence).or_default();
        for (key, value) in vars {
            layer.insert(key, value);
        }
    }

    /// Get a variable, considering precedence.
    pub fn get(&mut self, key: &str) -> Option<&Value> {
        self.ensure_merged();
        self.merged_cache.as_ref().and_then(|cache| cache.get(key))
    }

    /// Check if a variable exists at any level.
    pub fn contains(&mut self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove every variable at a precedence level.
    pub fn clear_precedence(&mut self, precedence: VarPrecedence) {
        self.merged_cache = None;
        self.layers.remove(&precedence);
    }

    /// The fully merged variable view, lowest precedence first.
    pub fn merged(&mut self) -> &IndexMap<String, Value> {
        self.ensure_merged();
        self.merged_cache.as_ref().unwrap()
    }

    /// An owned snapshot of the merged view.
    pub fn snapshot(&mut self) -> IndexMap<String, Value> {
        self.merged().clone()
    }

    fn ensure_merged(&mut self) {
        if self.merged_cache.is_some() {
            return;
        }

        let mut merged = IndexMap::new();
        for precedence in VarPrecedence::all() {
            if let Some(layer) = self.layers.get(&precedence) {
                for (key, value) in layer {
                    merge_into(&mut merged, key, value);
                }
            }
        }
        self.merged_cache = Some(merged);
    }
}

/// Merge one value into a flat map: maps merge shallowly, everything else
/// (lists included) replaces.
pub fn merge_into(target: &mut IndexMap<String, Value>, key: &str, value: &Value) {
    match (target.get_mut(key), value) {
        (Some(Value::Object(existing)), Value::Object(new)) => {
            for (k, v) in new {
                existing.insert(k.clone(), v.clone());
            }
        }
        _ => {
            target.insert(key.to_string(), value.clone());
        }
    }
}

/// Convert a YAML tree into the JSON value model used everywhere past the
/// parse boundary. Tagged values are unwrapped; non-string mapping keys are
/// stringified.
pub fn yaml_to_json(value: &serde_yaml::Value) -> Value {
    match value {
        serde_yaml::Value::Null => Value::Null,
        serde_yaml::Value::Bool(b) => Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::from(i)
            } else if let Some(u) = n.as_u64() {
                Value::from(u)
            } else {
                n.as_f64().map(Value::from).unwrap_or(Value::Null)
            }
        }
        serde_yaml::Value::String(s) => Value::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => Value::Array(seq.iter().map(yaml_to_json).collect()),
        serde_yaml::Value::Mapping(map) => {
            let mut obj = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    other => serde_yaml::to_string(other)
                        .map(|s| s.trim().to_string())
                        .unwrap_or_default(),
                };
                obj.insert(key, yaml_to_json(v));
            }
            Value::Object(obj)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

/// Parse `key=value` pairs or a JSON/YAML document from an `--extra-vars`
/// argument. A leading `@` loads the named file.
pub fn parse_extra_vars(spec: &str) -> std::io::Result<IndexMap<String, Value>> {
    let text = if let Some(path) = spec.strip_prefix('@') {
        std::fs::read_to_string(path)?
    } else {
        spec.to_string()
    };

    let trimmed = text.trim();
    let mut vars = IndexMap::new();

    if trimmed.starts_with('{') {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(trimmed) {
            for (k, v) in map {
                vars.insert(k, v);
            }
            return Ok(vars);
        }
    }

    if spec.starts_with('@') || trimmed.contains(":\n") || trimmed.ends_with(':') {
        if let Ok(yaml) = serde_yaml::from_str::<serde_yaml::Value>(trimmed) {
            if let Value::Object(map) = yaml_to_json(&yaml) {
                for (k, v) in map {
                    vars.insert(k, v);
                }
                return Ok(vars);
            }
        }
    }

    for pair in shell_words::split(trimmed).unwrap_or_else(|_| vec![trimmed.to_string()]) {
        if let Some((key, value)) = pair.split_once('=') {
            vars.insert(key.to_string(), Value::String(value.to_string()));
        }
    }

    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_precedence_order() {
        let mut store = VarStore::new();
        store.set("port", json!(80), VarPrecedence::GroupVars);
        store.set("port", json!(8080), VarPrecedence::InventoryHostVars);
        store.set("port", json!(9090), VarPrecedence::ExtraVars);

        assert_eq!(store.get("port"), Some(&json!(9090)));
    }

    #[test]
    fn test_set_fact_beats_extra_vars() {
        let mut store = VarStore::new();
        store.set("r", json!("cli"), VarPrecedence::ExtraVars);
        store.set("r", json!({"rc": 0}), VarPrecedence::SetFacts);

        assert_eq!(store.get("r"), Some(&json!({"rc": 0})));
    }

    #[test]
    fn test_maps_merge_shallowly() {
        let mut store = VarStore::new();
        store.set(
            "app",
            json!({"name": "web", "port": 80}),
            VarPrecedence::GroupVars,
        );
        store.set("app", json!({"port": 443}), VarPrecedence::PlayVars);

        assert_eq!(store.get("app"), Some(&json!({"name": "web", "port": 443})));
    }

    #[test]
    fn test_lists_replace() {
        let mut store = VarStore::new();
        store.set("packages", json!(["a", "b"]), VarPrecedence::GroupVars);
        store.set("packages", json!(["c"]), VarPrecedence::PlayVars);

        assert_eq!(store.get("packages"), Some(&json!(["c"])));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut store = VarStore::new();
        store.set("first", json!(1), VarPrecedence::PlayVars);
        store.set("second", json!(2), VarPrecedence::PlayVars);

        let keys: Vec<_> = store.merged().keys().cloned().collect();
        assert_eq!(keys, vec!["first", "second"]);
    }

    #[test]
    fn test_parse_extra_vars_pairs() {
        let vars = parse_extra_vars("env=prod port=8080").unwrap();
        assert_eq!(vars.get("env"), Some(&json!("prod")));
        assert_eq!(vars.get("port"), Some(&json!("8080")));
    }

    #[test]
    fn test_parse_extra_vars_json() {
        let vars = parse_extra_vars(r#"{"env": "prod", "n": 3}"#).unwrap();
        assert_eq!(vars.get("env"), Some(&json!("prod")));
        assert_eq!(vars.get("n"), Some(&json!(3)));
    }

    #[test]
    fn test_yaml_to_json_roundtrip() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("a: [1, two]\nb: true").unwrap();
        assert_eq!(yaml_to_json(&yaml), json!({"a": [1, "two"], "b": true}));
    }
}
