//! Inventory management for stagehand.
//!
//! The inventory resolver parses two equivalent source formats (a
//! line-oriented sections format and a YAML tree), expands host-range
//! patterns, loads `group_vars/` and `host_vars/` overlays, builds the
//! host/group graph (verifying it is acyclic), and computes per-host
//! variable snapshots in the documented precedence order.

pub mod group;
pub mod host;

pub use group::Group;
pub use host::{ConnectionParams, Host, HostParseError, Transport};

use crate::vars::{yaml_to_json, VarPrecedence, VarStore};
use indexmap::{IndexMap, IndexSet};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during inventory operations.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error in '{file}': {source}")]
    Yaml {
        file: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{file}:{line}: {source}")]
    HostLine {
        file: PathBuf,
        line: usize,
        #[source]
        source: HostParseError,
    },

    #[error("{file}:{line}: {message}")]
    InvalidLine {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid host range '{0}': {1}")]
    InvalidRange(String, String),

    #[error("circular group membership: {0}")]
    CircularGroups(String),

    #[error("invalid host pattern: {0}")]
    InvalidPattern(String),

    #[error("host not found: {0}")]
    HostNotFound(String),
}

/// Result type for inventory operations.
pub type InventoryResult<T> = Result<T, InventoryError>;

/// The main inventory: hosts, groups, and the overlay variables loaded from
/// `group_vars/` and `host_vars/` directories. Host and group iteration
/// follows declaration order.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    hosts: IndexMap<String, Host>,
    groups: IndexMap<String, Group>,
    group_overlays: HashMap<String, IndexMap<String, Value>>,
    host_overlays: HashMap<String, IndexMap<String, Value>>,
    source: Option<PathBuf>,
}

impl Inventory {
    /// Create a new empty inventory with the implicit groups.
    pub fn new() -> Self {
        let mut inventory = Self::default();
        inventory.groups.insert("all".to_string(), Group::all());
        inventory
            .groups
            .insert("ungrouped".to_string(), Group::ungrouped());
        inventory
    }

    /// Load an inventory from a file or directory and finalize it.
    ///
    /// A directory is expected to contain a `hosts` file plus optional
    /// `group_vars/` and `host_vars/` subdirectories; a file loads overlays
    /// from its parent directory.
    pub fn load<P: AsRef<Path>>(path: P) -> InventoryResult<Self> {
        let path = path.as_ref();
        let mut inventory = Self::new();
        inventory.source = Some(path.to_path_buf());

        let overlay_dir = if path.is_dir() {
            for name in ["hosts", "hosts.yml", "hosts.yaml", "hosts.ini", "inventory"] {
                let candidate = path.join(name);
                if candidate.is_file() {
                    inventory.load_file(&candidate)?;
                    break;
                }
            }
            Some(path.to_path_buf())
        } else if path.is_file() {
            inventory.load_file(path)?;
            path.parent().map(Path::to_path_buf)
        } else {
            return Err(InventoryError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("inventory path not found: {}", path.display()),
            )));
        };

        if let Some(dir) = overlay_dir {
            inventory.load_overlays(&dir)?;
        }

        inventory.finalize()?;
        Ok(inventory)
    }

    /// Parse inventory text in the line-oriented format and finalize.
    pub fn from_ini_str(content: &str) -> InventoryResult<Self> {
        let mut inventory = Self::new();
        inventory.parse_ini(content, Path::new("<inline>"))?;
        inventory.finalize()?;
        Ok(inventory)
    }

    /// Parse inventory text in the YAML tree format and finalize.
    pub fn from_yaml_str(content: &str) -> InventoryResult<Self> {
        let mut inventory = Self::new();
        inventory.parse_yaml(content, Path::new("<inline>"))?;
        inventory.finalize()?;
        Ok(inventory)
    }

    fn load_file(&mut self, path: &Path) -> InventoryResult<()> {
        let content = std::fs::read_to_string(path)?;
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        match extension.to_lowercase().as_str() {
            "yml" | "yaml" | "json" => self.parse_yaml(&content, path),
            _ => self.parse_ini(&content, path),
        }
    }

    /// Load `group_vars/` and `host_vars/` overlays next to the inventory.
    /// Each entry may be a file (`group_vars/web.yml`) or a directory of
    /// files merged in name order.
    fn load_overlays(&mut self, dir: &Path) -> InventoryResult<()> {
        let group_vars = dir.join("group_vars");
        if group_vars.is_dir() {
            for (name, vars) in Self::read_vars_dir(&group_vars)? {
                self.group_overlays.entry(name).or_default().extend(vars);
            }
        }

        let host_vars = dir.join("host_vars");
        if host_vars.is_dir() {
            for (name, vars) in Self::read_vars_dir(&host_vars)? {
                self.host_overlays.entry(name).or_default().extend(vars);
            }
        }

        Ok(())
    }

    fn read_vars_dir(dir: &Path) -> InventoryResult<Vec<(String, IndexMap<String, Value>)>> {
        let mut result = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?.filter_map(|e| e.ok()).collect();
        entries.sort_by_key(|e| e.path());

        for entry in entries {
            let path = entry.path();
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            if name.is_empty() {
                continue;
            }

            if path.is_file() {
                result.push((name, Self::read_vars_file(&path)?));
            } else if path.is_dir() {
                let name = path
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                let mut merged = IndexMap::new();
                let mut files: Vec<_> = std::fs::read_dir(&path)?.filter_map(|e| e.ok()).collect();
                files.sort_by_key(|e| e.path());
                for file in files {
                    if file.path().is_file() {
                        merged.extend(Self::read_vars_file(&file.path())?);
                    }
                }
                result.push((name, merged));
            }
        }

        Ok(result)
    }

    fn read_vars_file(path: &Path) -> InventoryResult<IndexMap<String, Value>> {
        let content = std::fs::read_to_string(path)?;
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(&content).map_err(|source| InventoryError::Yaml {
                file: path.to_path_buf(),
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

    /// Parse the line-oriented sections format.
    fn parse_ini(&mut self, content: &str, file: &Path) -> InventoryResult<()> {
        #[derive(PartialEq)]
        enum Section {
            Hosts,
            Vars,
            Children,
        }

        let mut current_group = "ungrouped".to_string();
        let mut section = Section::Hosts;

        for (idx, raw_line) in content.lines().enumerate() {
            let lineno = idx + 1;
            let line = strip_comment(raw_line).trim().to_string();
            if line.is_empty() {
                continue;
            }

            if line.starts_with('[') && line.ends_with(']') {
                let header = &line[1..line.len() - 1];
                let (name, kind) = match header.rsplit_once(':') {
                    Some((name, "vars")) => (name, Section::Vars),
                    Some((name, "children")) => (name, Section::Children),
                    Some(_) => {
                        return Err(InventoryError::InvalidLine {
                            file: file.to_path_buf(),
                            line: lineno,
                            message: format!("unknown section suffix in '[{}]'", header),
                        })
                    }
                    None => (header, Section::Hosts),
                };
                current_group = name.to_string();
                section = kind;
                self.ensure_group(&current_group);
                continue;
            }

            match section {
                Section::Vars => {
                    let (key, value) =
                        line.split_once('=')
                            .ok_or_else(|| InventoryError::InvalidLine {
                                file: file.to_path_buf(),
                                line: lineno,
                                message: "expected key=value in vars section".to_string(),
                            })?;
                    let value = parse_scalar(value.trim());
                    if let Some(group) = self.groups.get_mut(&current_group) {
                        group.set_var(key.trim(), value);
                    }
                }
                Section::Children => {
                    for child in expand_ranges(&line)
                        .map_err(|e| InventoryError::InvalidRange(line.clone(), e))?
                    {
                        self.ensure_group(&child);
                        if let Some(group) = self.groups.get_mut(&current_group) {
                            group.add_child(child);
                        }
                    }
                }
                Section::Hosts => {
                    let template =
                        Host::parse(&line).map_err(|source| InventoryError::HostLine {
                            file: file.to_path_buf(),
                            line: lineno,
                            source,
                        })?;
                    let names = expand_ranges(&template.name)
                        .map_err(|e| InventoryError::InvalidRange(template.name.clone(), e))?;
                    for name in names {
                        let mut host = template.clone();
                        host.name = name;
                        self.insert_host(host, &current_group);
                    }
                }
            }
        }

        Ok(())
    }

    /// Parse the YAML tree format. The top level is either a mapping of
    /// group definitions or an `all:` wrapper with `hosts`/`children`/`vars`.
    fn parse_yaml(&mut self, content: &str, file: &Path) -> InventoryResult<()> {
        let data: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|source| InventoryError::Yaml {
                file: file.to_path_buf(),
                source,
            })?;

        if let serde_yaml::Value::Mapping(map) = data {
            for (key, value) in map {
                if let serde_yaml::Value::String(group_name) = key {
                    self.parse_yaml_group(&group_name, &value)?;
                }
            }
        }

        Ok(())
    }

    fn parse_yaml_group(
        &mut self,
        name: &str,
        value: &serde_yaml::Value,
    ) -> InventoryResult<()> {
        self.ensure_group(name);

        let serde_yaml::Value::Mapping(map) = value else {
            return Ok(());
        };
        let get = |key: &str| map.get(serde_yaml::Value::String(key.to_string()));

        if let Some(serde_yaml::Value::Mapping(hosts)) = get("hosts") {
            for (host_key, host_value) in hosts {
                let serde_yaml::Value::String(pattern) = host_key else {
                    continue;
                };
                let names = expand_ranges(pattern)
                    .map_err(|e| InventoryError::InvalidRange(pattern.clone(), e))?;
                for host_name in names {
                    let mut host = Host::new(&host_name);
                    if let serde_yaml::Value::Mapping(vars) = host_value {
                        for (var_key, var_value) in vars {
                            if let serde_yaml::Value::String(key) = var_key {
                                host.apply_var(key, yaml_to_json(var_value)).map_err(
                                    |source| InventoryError::HostLine {
                                        file: PathBuf::from("<yaml>"),
                                        line: 0,
                                        source,
                                    },
                                )?;
                            }
                        }
                    }
                    self.insert_host(host, name);
                }
            }
        }

        if let Some(serde_yaml::Value::Mapping(children)) = get("children") {
            for (child_key, child_value) in children {
                if let serde_yaml::Value::String(child_name) = child_key {
                    self.ensure_group(child_name);
                    if let Some(group) = self.groups.get_mut(name) {
                        group.add_child(child_name.clone());
                    }
                    self.parse_yaml_group(child_name, child_value)?;
                }
            }
        }

        if let Some(serde_yaml::Value::Mapping(vars)) = get("vars") {
            for (var_key, var_value) in vars {
                if let serde_yaml::Value::String(key) = var_key {
                    if let Some(group) = self.groups.get_mut(name) {
                        group.set_var(key.clone(), yaml_to_json(var_value));
                    }
                }
            }
        }

        Ok(())
    }

    fn ensure_group(&mut self, name: &str) {
        if !self.groups.contains_key(name) {
            self.groups.insert(name.to_string(), Group::new(name));
        }
    }

    fn insert_host(&mut self, mut host: Host, group_name: &str) {
        host.add_to_group(group_name.to_string());
        host.add_to_group("all".to_string());

        if let Some(group) = self.groups.get_mut(group_name) {
            group.add_host(host.name.clone());
        }
        if group_name != "all" {
            if let Some(all) = self.groups.get_mut("all") {
                all.add_host(host.name.clone());
            }
        }

        match self.hosts.get_mut(&host.name) {
            Some(existing) => {
                existing.add_to_group(group_name.to_string());
                existing.merge_vars(&host.vars);
                if host.connection != ConnectionParams::default() {
                    existing.connection = host.connection;
                }
                if host.address.is_some() {
                    existing.address = host.address;
                }
            }
            None => {
                self.hosts.insert(host.name.clone(), host);
            }
        }
    }

    /// Compute parent links, assign `ungrouped` membership, propagate
    /// transitive group membership to hosts, and reject group cycles.
    fn finalize(&mut self) -> InventoryResult<()> {
        // Parent links from children declarations.
        let relations: Vec<(String, Vec<String>)> = self
            .groups
            .iter()
            .map(|(name, group)| (name.clone(), group.children.iter().cloned().collect()))
            .collect();
        for (parent, children) in &relations {
            for child in children {
                self.ensure_group(child);
                if let Some(group) = self.groups.get_mut(child) {
                    group.add_parent(parent.clone());
                }
            }
        }

        self.check_cycles()?;

        // Hosts in no user-defined group fall into `ungrouped`.
        let ungrouped: Vec<String> = self
            .hosts
            .values()
            .filter(|h| h.groups.iter().all(|g| g == "all"))
            .map(|h| h.name.clone())
            .collect();
        for name in ungrouped {
            if let Some(group) = self.groups.get_mut("ungrouped") {
                group.add_host(name.clone());
            }
            if let Some(host) = self.hosts.get_mut(&name) {
                host.add_to_group("ungrouped");
            }
        }

        // A host transitively belongs to every ancestor of its groups.
        let ancestors: HashMap<String, Vec<String>> = self
            .groups
            .keys()
            .map(|name| (name.clone(), self.ancestor_groups(name)))
            .collect();
        for host in self.hosts.values_mut() {
            let direct: Vec<String> = host.groups.iter().cloned().collect();
            for group in direct {
                if let Some(parents) = ancestors.get(&group) {
                    for parent in parents {
                        host.groups.insert(parent.clone());
                    }
                }
            }
        }

        debug!(
            hosts = self.hosts.len(),
            groups = self.groups.len(),
            "inventory finalized"
        );
        Ok(())
    }

    /// Depth-first cycle check over the children relation.
    fn check_cycles(&self) -> InventoryResult<()> {
        let mut visited = HashSet::new();
        let mut stack = Vec::new();

        fn visit(
            inventory: &Inventory,
            name: &str,
            visited: &mut HashSet<String>,
            stack: &mut Vec<String>,
        ) -> InventoryResult<()> {
            if stack.iter().any(|s| s == name) {
                let mut chain: Vec<&str> = stack.iter().map(String::as_str).collect();
                chain.push(name);
                return Err(InventoryError::CircularGroups(chain.join(" -> ")));
            }
            if visited.contains(name) {
                return Ok(());
            }
            stack.push(name.to_string());
            if let Some(group) = inventory.groups.get(name) {
                for child in &group.children {
                    visit(inventory, child, visited, stack)?;
                }
            }
            stack.pop();
            visited.insert(name.to_string());
            Ok(())
        }

        for name in self.groups.keys() {
            visit(self, name, &mut visited, &mut stack)?;
        }
        Ok(())
    }

    /// All ancestor groups of `name` (parents, their parents, ...).
    fn ancestor_groups(&self, name: &str) -> Vec<String> {
        let mut result = Vec::new();
        let mut queue: Vec<String> = self
            .groups
            .get(name)
            .map(|g| g.parents.iter().cloned().collect())
            .unwrap_or_default();
        let mut seen: HashSet<String> = HashSet::new();

        while let Some(parent) = queue.pop() {
            if seen.insert(parent.clone()) {
                if let Some(group) = self.groups.get(&parent) {
                    queue.extend(group.parents.iter().cloned());
                }
                result.push(parent);
            }
        }
        result
    }

    /// Distance of a group below `all`; used to order group vars so child
    /// groups override parents.
    fn group_depth(&self, name: &str) -> usize {
        fn depth(
            inventory: &Inventory,
            name: &str,
            memo: &mut HashMap<String, usize>,
            guard: &mut HashSet<String>,
        ) -> usize {
            if name == "all" {
                return 0;
            }
            if let Some(d) = memo.get(name) {
                return *d;
            }
            if !guard.insert(name.to_string()) {
                return 1;
            }
            let d = inventory
                .groups
                .get(name)
                .map(|g| {
                    g.parents
                        .iter()
                        .map(|p| depth(inventory, p, memo, guard) + 1)
                        .max()
                        .unwrap_or(1)
                })
                .unwrap_or(1);
            guard.remove(name);
            memo.insert(name.to_string(), d);
            d
        }

        let mut memo = HashMap::new();
        let mut guard = HashSet::new();
        depth(self, name, &mut memo, &mut guard)
    }

    /// Build the variable store for a host, populated with the inventory
    /// tiers: `all` group vars, other group vars (parents before children,
    /// alphabetical order among siblings at equal depth, later wins),
    /// `group_vars/` overlays, inventory host vars, `host_vars/` overlays.
    pub fn var_store_for(&self, host_name: &str) -> InventoryResult<VarStore> {
        let host = self
            .hosts
            .get(host_name)
            .ok_or_else(|| InventoryError::HostNotFound(host_name.to_string()))?;

        let mut store = VarStore::new();

        if let Some(all) = self.groups.get("all") {
            store.set_many(all.vars.clone(), VarPrecedence::GroupVarsAll);
        }
        if let Some(overlay) = self.group_overlays.get("all") {
            store.set_many(overlay.clone(), VarPrecedence::GroupVarsOverlay);
        }

        let mut member_groups: Vec<&str> = host
            .groups
            .iter()
            .map(String::as_str)
            .filter(|g| *g != "all")
            .collect();
        member_groups.sort_by_key(|name| (self.group_depth(name), name.to_string()));

        for name in &member_groups {
            if let Some(group) = self.groups.get(*name) {
                store.set_many(group.vars.clone(), VarPrecedence::GroupVars);
            }
        }
        for name in &member_groups {
            if let Some(overlay) = self.group_overlays.get(*name) {
                store.set_many(overlay.clone(), VarPrecedence::GroupVarsOverlay);
            }
        }

        store.set_many(host.vars.clone(), VarPrecedence::InventoryHostVars);
        if let Some(overlay) = self.host_overlays.get(host_name) {
            store.set_many(overlay.clone(), VarPrecedence::HostVarsOverlay);
        }

        Ok(store)
    }

    /// The merged inventory-level variables for a host.
    pub fn host_vars(&self, host_name: &str) -> InventoryResult<IndexMap<String, Value>> {
        Ok(self.var_store_for(host_name)?.snapshot())
    }

    /// Select hosts matching a pattern, preserving inventory declaration
    /// order. A pattern is a comma- (or colon-) separated list of terms; a
    /// term is a host or group name, a shell-style wildcard, the literal
    /// `all`, `!term` (subtract), or `&term` (intersect). Terms evaluate
    /// left to right. Zero matches is a warning, not an error.
    pub fn select(&self, pattern: &str) -> InventoryResult<Vec<&Host>> {
        let mut selected: IndexSet<String> = IndexSet::new();

        for raw_term in split_pattern_terms(pattern) {
            let term = raw_term.trim();
            if term.is_empty() {
                continue;
            }

            if let Some(sub) = term.strip_prefix('!') {
                let matched = self.match_term(sub)?;
                selected.retain(|name| !matched.contains(name));
            } else if let Some(sub) = term.strip_prefix('&') {
                let matched = self.match_term(sub)?;
                selected.retain(|name| matched.contains(name));
            } else {
                let matched = self.match_term(term)?;
                for name in matched {
                    selected.insert(name);
                }
            }
        }

        let hosts: Vec<&Host> = self
            .hosts
            .values()
            .filter(|h| selected.contains(&h.name))
            .collect();

        if hosts.is_empty() {
            warn!(pattern = %pattern, "no hosts matched pattern");
        }

        Ok(hosts)
    }

    /// Match a single pattern term to a set of host names.
    fn match_term(&self, term: &str) -> InventoryResult<IndexSet<String>> {
        let mut result = IndexSet::new();

        if term == "all" || term == "*" {
            result.extend(self.hosts.keys().cloned());
            return Ok(result);
        }

        if let Some(group) = self.groups.get(term) {
            for host in self.hosts.values() {
                if host.in_group(&group.name) {
                    result.insert(host.name.clone());
                }
            }
            return Ok(result);
        }

        if self.hosts.contains_key(term) {
            result.insert(term.to_string());
            return Ok(result);
        }

        if term.contains('*') || term.contains('?') || term.contains('[') {
            let regex = Regex::new(&glob_to_regex(term))
                .map_err(|_| InventoryError::InvalidPattern(term.to_string()))?;
            for name in self.hosts.keys() {
                if regex.is_match(name) {
                    result.insert(name.clone());
                }
            }
            // Also allow the wildcard to match group names.
            for (name, group) in &self.groups {
                if regex.is_match(name) {
                    for host in &group.hosts {
                        result.insert(host.clone());
                    }
                }
            }
        }

        Ok(result)
    }

    /// Add a host at runtime (the `add_host` contract). The host joins the
    /// named groups in addition to `all`.
    pub fn add_host(&mut self, mut host: Host, groups: &[String]) {
        for group in groups {
            self.ensure_group(group);
            if let Some(g) = self.groups.get_mut(group) {
                g.add_host(host.name.clone());
            }
            host.add_to_group(group.clone());
        }
        host.add_to_group("all");
        if let Some(all) = self.groups.get_mut("all") {
            all.add_host(host.name.clone());
        }
        self.hosts.insert(host.name.clone(), host);
    }

    /// Assign an existing host to a group at runtime (the `group_by`
    /// contract). Creates the group as needed.
    pub fn group_host(&mut self, host_name: &str, group_name: &str) -> InventoryResult<()> {
        if !self.hosts.contains_key(host_name) {
            return Err(InventoryError::HostNotFound(host_name.to_string()));
        }
        self.ensure_group(group_name);
        if let Some(group) = self.groups.get_mut(group_name) {
            group.add_host(host_name.to_string());
        }
        if let Some(host) = self.hosts.get_mut(host_name) {
            host.add_to_group(group_name);
        }
        Ok(())
    }

    /// Get a host by name.
    pub fn get_host(&self, name: &str) -> Option<&Host> {
        self.hosts.get(name)
    }

    /// Get a group by name.
    pub fn get_group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// All hosts in declaration order.
    pub fn hosts(&self) -> impl Iterator<Item = &Host> {
        self.hosts.values()
    }

    /// All groups in declaration order.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    /// Number of hosts.
    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Mapping of group name to member host names (transitive), used for
    /// the `groups` magic variable.
    pub fn groups_map(&self) -> IndexMap<String, Vec<String>> {
        let mut map = IndexMap::new();
        for (name, _) in &self.groups {
            let members: Vec<String> = self
                .hosts
                .values()
                .filter(|h| h.in_group(name))
                .map(|h| h.name.clone())
                .collect();
            map.insert(name.clone(), members);
        }
        map
    }

    /// Serialize back to the line-oriented format. Parsing the output yields
    /// an equivalent host/group graph and variable mapping.
    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();

        for (name, group) in &self.groups {
            if name == "all" || (name == "ungrouped" && group.hosts.is_empty()) {
                continue;
            }
            if !group.hosts.is_empty() || group.children.is_empty() {
                out.push_str(&format!("[{}]\n", name));
                for host_name in &group.hosts {
                    if let Some(host) = self.hosts.get(host_name) {
                        out.push_str(&host_line(host));
                        out.push('\n');
                    }
                }
                out.push('\n');
            }
            if !group.children.is_empty() {
                out.push_str(&format!("[{}:children]\n", name));
                for child in &group.children {
                    out.push_str(child);
                    out.push('\n');
                }
                out.push('\n');
            }
            if !group.vars.is_empty() {
                out.push_str(&format!("[{}:vars]\n", name));
                for (key, value) in &group.vars {
                    out.push_str(&format!("{}={}\n", key, scalar_to_ini(value)));
                }
                out.push('\n');
            }
        }

        if let Some(all) = self.groups.get("all") {
            if !all.vars.is_empty() {
                out.push_str("[all:vars]\n");
                for (key, value) in &all.vars {
                    out.push_str(&format!("{}={}\n", key, scalar_to_ini(value)));
                }
            }
        }

        out
    }
}

/// Render one host line with its connection overrides and variables.
fn host_line(host: &Host) -> String {
    let mut parts = vec![host.name.clone()];
    if let Some(addr) = &host.address {
        parts.push(format!("ansible_host={}", addr));
    }
    if let Some(port) = host.connection.port {
        parts.push(format!("ansible_port={}", port));
    }
    if let Some(user) = &host.connection.user {
        parts.push(format!("ansible_user={}", user));
    }
    if let Some(password) = &host.connection.password {
        parts.push(format!("ansible_password={}", password));
    }
    if let Some(key) = &host.connection.private_key_file {
        parts.push(format!("ansible_ssh_private_key_file={}", key));
    }
    if host.connection.transport != Transport::Ssh {
        parts.push(format!("ansible_connection={}", host.connection.transport));
    }
    for (key, value) in &host.vars {
        parts.push(format!("{}={}", key, scalar_to_ini(value)));
    }
    parts.join(" ")
}

fn scalar_to_ini(value: &Value) -> String {
    match value {
        Value::String(s) if s.contains(' ') => format!("\"{}\"", s),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Strip a trailing `#` comment that is not inside quotes.
fn strip_comment(line: &str) -> &str {
    let mut in_single = false;
    let mut in_double = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '#' | ';' if !in_single && !in_double => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Split a selection pattern on `,` and `:`, but not inside brackets (so
/// range expressions survive).
fn split_pattern_terms(pattern: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut depth: usize = 0;

    for (i, ch) in pattern.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' | ':' if depth == 0 => {
                parts.push(&pattern[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&pattern[start..]);
    parts
}

/// Convert a shell-style glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> String {
    let mut regex = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '{' | '}' | '^' | '$' | '|' | '\\' | '[' | ']' => {
                regex.push('\\');
                regex.push(ch);
            }
            _ => regex.push(ch),
        }
    }
    regex.push('$');
    regex
}

/// Expand host-range tokens of the form `prefix[LOW:HIGH(:STRIDE)]suffix`.
///
/// Numeric ranges preserve the zero-padding width of `LOW`; single-letter
/// ranges walk the alphabet. Multiple brackets on one token compose as a
/// cross product in left-to-right odometer order. A token without brackets
/// expands to itself.
pub fn expand_ranges(token: &str) -> Result<Vec<String>, String> {
    let Some(open) = token.find('[') else {
        return Ok(vec![token.to_string()]);
    };
    let close = token[open..]
        .find(']')
        .map(|i| open + i)
        .ok_or_else(|| "unclosed '['".to_string())?;

    let prefix = &token[..open];
    let spec = &token[open + 1..close];
    let suffix = &token[close + 1..];

    let mut pieces = spec.splitn(3, ':');
    let low = pieces.next().unwrap_or_default();
    let high = pieces
        .next()
        .ok_or_else(|| "expected LOW:HIGH".to_string())?;
    let stride: usize = match pieces.next() {
        Some(s) => s
            .parse()
            .map_err(|_| format!("invalid stride '{}'", s))
            .and_then(|v: usize| {
                if v == 0 {
                    Err("stride must be positive".to_string())
                } else {
                    Ok(v)
                }
            })?,
        None => 1,
    };

    let expansions: Vec<String> = if low.chars().all(|c| c.is_ascii_digit())
        && high.chars().all(|c| c.is_ascii_digit())
        && !low.is_empty()
    {
        let width = low.len();
        let start: usize = low.parse().map_err(|_| format!("invalid bound '{}'", low))?;
        let end: usize = high
            .parse()
            .map_err(|_| format!("invalid bound '{}'", high))?;
        if end < start {
            return Err(format!("descending range {}:{}", start, end));
        }
        (start..=end)
            .step_by(stride)
            .map(|n| format!("{:0width$}", n, width = width))
            .collect()
    } else if low.len() == 1 && high.len() == 1 {
        let (start, end) = (low.chars().next().unwrap(), high.chars().next().unwrap());
        if !start.is_ascii_alphabetic() || !end.is_ascii_alphabetic() || end < start {
            return Err(format!("invalid alphabetic range {}:{}", low, high));
        }
        (start..=end)
            .step_by(stride)
            .map(|c| c.to_string())
            .collect()
    } else {
        return Err(format!("invalid range bounds {}:{}", low, high));
    };

    let mut result = Vec::new();
    for expansion in &expansions {
        let rest = format!("{}{}", expansion, suffix);
        for tail in expand_ranges(&rest)? {
            result.push(format!("{}{}", prefix, tail));
        }
    }
    Ok(result)
}

/// Parse a `key=value` scalar: quoted strings stay strings, `true`/`false`
/// become booleans, numbers become numbers, everything else stays a
/// string. Shared by host lines and `[group:vars]` sections so the same
/// syntax yields the same type either way.
pub(crate) fn parse_scalar(value: &str) -> Value {
    let value = value.trim();

    if (value.starts_with('"') && value.ends_with('"') && value.len() >= 2)
        || (value.starts_with('\'') && value.ends_with('\'') && value.len() >= 2)
    {
        return Value::String(value[1..value.len() - 1].to_string());
    }

    match value.to_lowercase().as_str() {
        "true" | "yes" | "on" => return Value::Bool(true),
        "false" | "no" | "off" => return Value::Bool(false),
        _ => {}
    }

    if let Ok(n) = value.parse::<i64>() {
        return Value::from(n);
    }
    if let Ok(f) = value.parse::<f64>() {
        return Value::from(f);
    }

    Value::String(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BASIC: &str = r#"
[web]
web1 ansible_host=10.0.0.1
web2 ansible_host=10.0.0.2

[db]
db1

[web:vars]
http_port=80

[prod:children]
web
db
"#;

    #[test]
    fn test_parse_ini_basic() {
        let inv = Inventory::from_ini_str(BASIC).unwrap();
        assert_eq!(inv.host_count(), 3);
        assert!(inv.get_group("web").unwrap().has_host("web1"));
        assert!(inv.get_group("prod").unwrap().has_child("db"));
        assert!(inv.get_host("web1").unwrap().in_group("prod"));
    }

    #[test]
    fn test_empty_inventory_is_valid() {
        let inv = Inventory::from_ini_str("").unwrap();
        assert_eq!(inv.host_count(), 0);
        assert!(inv.select("all").unwrap().is_empty());
        assert!(inv.select("web*").unwrap().is_empty());
    }

    #[test]
    fn test_range_expansion_zero_padded() {
        let names = expand_ranges("web[01:03].example.com").unwrap();
        assert_eq!(
            names,
            vec![
                "web01.example.com",
                "web02.example.com",
                "web03.example.com"
            ]
        );
    }

    #[test]
    fn test_range_expansion_stride_and_alpha() {
        assert_eq!(expand_ranges("n[0:6:3]").unwrap(), vec!["n0", "n3", "n6"]);
        assert_eq!(expand_ranges("r[a:c]").unwrap(), vec!["ra", "rb", "rc"]);
    }

    #[test]
    fn test_range_expansion_odometer_order() {
        let names = expand_ranges("h[1:2]x[a:b]").unwrap();
        assert_eq!(names, vec!["h1xa", "h1xb", "h2xa", "h2xb"]);
    }

    #[test]
    fn test_range_expansion_errors() {
        assert!(expand_ranges("web[3:1]").is_err());
        assert!(expand_ranges("web[1:5").is_err());
        assert!(expand_ranges("web[1:5:0]").is_err());
    }

    #[test]
    fn test_group_cycle_detected() {
        let content = r#"
[a:children]
b

[b:children]
a
"#;
        let err = Inventory::from_ini_str(content).unwrap_err();
        assert!(matches!(err, InventoryError::CircularGroups(_)));
    }

    #[test]
    fn test_selection_order_and_operators() {
        let inv = Inventory::from_ini_str(BASIC).unwrap();

        let all: Vec<&str> = inv.select("all").unwrap().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(all, vec!["web1", "web2", "db1"]);

        let subtracted: Vec<&str> = inv
            .select("all,!db")
            .unwrap()
            .iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(subtracted, vec!["web1", "web2"]);

        let intersected: Vec<&str> = inv
            .select("prod,&web")
            .unwrap()
            .iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(intersected, vec!["web1", "web2"]);

        let globbed: Vec<&str> = inv
            .select("web*")
            .unwrap()
            .iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(globbed, vec!["web1", "web2"]);
    }

    #[test]
    fn test_child_group_overrides_parent() {
        let content = r#"
[prod:children]
web

[prod:vars]
env=prod
tier=outer

[web]
web1

[web:vars]
tier=inner
"#;
        let inv = Inventory::from_ini_str(content).unwrap();
        let vars = inv.host_vars("web1").unwrap();
        assert_eq!(vars.get("env"), Some(&json!("prod")));
        assert_eq!(vars.get("tier"), Some(&json!("inner")));
    }

    #[test]
    fn test_sibling_tie_break_alphabetical() {
        let content = r#"
[beta]
shared1

[alpha]
shared1

[alpha:vars]
color=from_alpha

[beta:vars]
color=from_beta
"#;
        let inv = Inventory::from_ini_str(content).unwrap();
        let vars = inv.host_vars("shared1").unwrap();
        // Equal depth: alphabetically later group wins.
        assert_eq!(vars.get("color"), Some(&json!("from_beta")));
    }

    #[test]
    fn test_host_vars_beat_group_vars() {
        let content = r#"
[web]
web1 http_port=8080

[web:vars]
http_port=80
"#;
        let inv = Inventory::from_ini_str(content).unwrap();
        let vars = inv.host_vars("web1").unwrap();
        // Host-line and group-vars values take the same scalar typing.
        assert_eq!(vars.get("http_port"), Some(&json!(8080)));
    }

    #[test]
    fn test_yaml_form_equivalent() {
        let content = r#"
all:
  children:
    web:
      hosts:
        web[1:2]:
          ansible_user: deploy
      vars:
        http_port: 80
"#;
        let inv = Inventory::from_yaml_str(content).unwrap();
        assert_eq!(inv.host_count(), 2);
        let web1 = inv.get_host("web1").unwrap();
        assert_eq!(web1.connection.user.as_deref(), Some("deploy"));
        assert_eq!(
            inv.host_vars("web2").unwrap().get("http_port"),
            Some(&json!(80))
        );
    }

    #[test]
    fn test_ini_round_trip() {
        let inv = Inventory::from_ini_str(BASIC).unwrap();
        let serialized = inv.to_ini_string();
        let reparsed = Inventory::from_ini_str(&serialized).unwrap();

        assert_eq!(inv.host_count(), reparsed.host_count());
        for host in inv.hosts() {
            let other = reparsed.get_host(&host.name).expect("host survived");
            assert_eq!(host.groups, other.groups);
            assert_eq!(
                inv.host_vars(&host.name).unwrap(),
                reparsed.host_vars(&host.name).unwrap()
            );
        }
    }

    #[test]
    fn test_add_host_and_group_by() {
        let mut inv = Inventory::from_ini_str(BASIC).unwrap();
        inv.add_host(Host::new("new1"), &["staging".to_string()]);
        assert!(inv.get_host("new1").unwrap().in_group("staging"));

        inv.group_host("web1", "tagged").unwrap();
        assert!(inv.get_host("web1").unwrap().in_group("tagged"));
    }

    #[test]
    fn test_comment_stripping() {
        let content = r#"
[web]  # trailing comment
web1   ; also a comment
"#;
        let inv = Inventory::from_ini_str(content).unwrap();
        assert!(inv.get_host("web1").is_some());
    }
}
