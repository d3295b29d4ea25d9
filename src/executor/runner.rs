//! The linear-strategy playbook runner.
//!
//! For each task in a play's flattened list, every eligible host renders
//! its own view of the task, executes it through its transport, and the
//! runner gathers all results before advancing. A semaphore bounds the
//! number of hosts running a task at any instant (`forks`). Blocks,
//! rescue/always, handler notification and flushing, loops, privilege
//! escalation, delegation, and check/diff propagation are all driven from
//! here.

use super::host::{HostContext, HostState};
use super::{ExecutorError, ExecutorResult, HostStats, RunReport, TaskResult, TaskStatus};
use crate::callback::Callback;
use crate::connection::{ConnectionDefaults, ConnectionError, ConnectionManager};
use crate::inventory::{Host, Inventory, Transport};
use crate::modules::{ModuleContext, ModuleError, ModuleOutput, ModuleRegistry, ModuleStatus};
use crate::playbook::{Block, Handler, Play, Playbook, Task, TaskNode};
use crate::template::TemplateEngine;
use crate::vars::VarPrecedence;
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// Grace period given to in-flight transports on interrupt.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Knobs for one run, mostly straight off the CLI.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Cross-host concurrency bound
    pub forks: usize,
    /// Dry-run every module
    pub check_mode: bool,
    /// Collect diff payloads
    pub diff_mode: bool,
    /// Highest-priority variable overrides
    pub extra_vars: IndexMap<String, Value>,
    /// Restrict selection to hosts matching this pattern
    pub limit: Option<String>,
    /// Only run tasks carrying one of these tags
    pub tags: Vec<String>,
    /// Skip tasks carrying one of these tags
    pub skip_tags: Vec<String>,
    /// Keep running handlers on failed hosts
    pub force_handlers: bool,
    /// Privilege escalation default
    pub r#become: bool,
    /// Escalation user default
    pub become_user: Option<String>,
    /// Escalation method default
    pub become_method: Option<String>,
    /// Escalation password (from the interactive prompt)
    pub become_password: Option<String>,
    /// Per-command timeout in seconds
    pub timeout: Option<u64>,
    /// Vault password for encrypted vars
    pub vault_password: Option<String>,
    /// Transport-level defaults (remote user, key, host key policy)
    pub connection: ConnectionDefaults,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            forks: 5,
            check_mode: false,
            diff_mode: false,
            extra_vars: IndexMap::new(),
            limit: None,
            tags: Vec::new(),
            skip_tags: Vec::new(),
            force_handlers: false,
            r#become: false,
            become_user: None,
            become_method: None,
            become_password: None,
            timeout: None,
            vault_password: None,
            connection: ConnectionDefaults::default(),
        }
    }
}

/// Block-scope context threaded down through nested nodes: accumulated
/// conditions, variables, tags, and escalation overrides.
#[derive(Debug, Clone, Default)]
struct Frame {
    when: Vec<String>,
    vars: IndexMap<String, Value>,
    tags: Vec<String>,
    r#become: Option<bool>,
    become_user: Option<String>,
}

impl Frame {
    fn child(&self, block: &Block) -> Frame {
        let mut frame = self.clone();
        frame.when.extend(block.when.iter().cloned());
        for (key, value) in &block.vars {
            frame.vars.insert(key.clone(), value.clone());
        }
        frame.tags.extend(block.tags.iter().cloned());
        if block.r#become.is_some() {
            frame.r#become = block.r#become;
        }
        if block.become_user.is_some() {
            frame.become_user = block.become_user.clone();
        }
        frame
    }
}

/// Which hosts a node list may touch.
#[derive(Debug, Clone, Default)]
struct Scope {
    /// When set, only these host names are eligible
    only: Option<HashSet<String>>,
    /// Let failed hosts run too (`always` sections)
    include_failed: bool,
}

impl Scope {
    fn admits(&self, ctx: &HostContext) -> bool {
        if ctx.is_unreachable() {
            return false;
        }
        if let Some(only) = &self.only {
            if !only.contains(ctx.name()) {
                return false;
            }
        }
        ctx.is_ready() || (self.include_failed && ctx.is_failed())
    }
}

/// Per-play mutable state: host contexts, handlers, magic variables, and
/// the effective play-level modes.
struct PlayState {
    hosts: Vec<HostContext>,
    handlers: Vec<Handler>,
    magic: IndexMap<String, Value>,
    check_mode: bool,
    diff_mode: bool,
    play_become: bool,
    play_become_user: Option<String>,
    play_become_method: Option<String>,
    any_errors_fatal: bool,
    force_handlers: bool,
    /// Set when any_errors_fatal promoted a failure to a play-wide stop
    fatal: bool,
}

/// Runtime side effects a module reports back through its result data.
enum SideEffect {
    Facts {
        vars: IndexMap<String, Value>,
        precedence: VarPrecedence,
    },
    AddHost {
        name: String,
        groups: Vec<String>,
        vars: IndexMap<String, Value>,
    },
    GroupBy {
        group: String,
    },
}

/// The playbook runner.
pub struct PlaybookRunner {
    inventory: Inventory,
    registry: Arc<ModuleRegistry>,
    connections: Arc<ConnectionManager>,
    options: RunnerOptions,
    callbacks: Vec<Box<dyn Callback>>,
    interrupted: Arc<AtomicBool>,
    task_counter: usize,
}

impl PlaybookRunner {
    /// Create a runner over an inventory.
    pub fn new(inventory: Inventory, options: RunnerOptions) -> Self {
        let connections = Arc::new(ConnectionManager::new(options.connection.clone()));
        Self {
            inventory,
            registry: Arc::new(ModuleRegistry::with_builtins()),
            connections,
            options,
            callbacks: Vec::new(),
            interrupted: Arc::new(AtomicBool::new(false)),
            task_counter: 0,
        }
    }

    /// Attach a reporting callback.
    pub fn add_callback(&mut self, callback: Box<dyn Callback>) {
        self.callbacks.push(callback);
    }

    /// The flag a signal handler flips to request graceful shutdown.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn emit(&mut self, f: impl Fn(&mut dyn Callback)) {
        for callback in &mut self.callbacks {
            f(callback.as_mut());
        }
    }

    /// Run every play, emit the recap, and release connections.
    #[instrument(skip_all)]
    pub async fn run(&mut self, playbook: &Playbook) -> ExecutorResult<RunReport> {
        let engine = TemplateEngine::new(playbook.base_dir());
        let mut report = RunReport::default();

        for play in &playbook.plays {
            if self.interrupted() {
                warn!("interrupted; no further plays will start");
                break;
            }
            self.run_play(play, &engine, playbook, &mut report).await?;
        }

        let stats = report.stats.clone();
        self.emit(move |cb| cb.on_recap(&stats));

        // Give in-flight transports a short grace period, then let them go.
        let _ = tokio::time::timeout(SHUTDOWN_GRACE, self.connections.close_all()).await;

        Ok(report)
    }

    #[instrument(skip_all, fields(play = %play.name))]
    async fn run_play(
        &mut self,
        play: &Play,
        engine: &TemplateEngine,
        playbook: &Playbook,
        report: &mut RunReport,
    ) -> ExecutorResult<()> {
        // Host selection, with --limit layered on top.
        let selected: Vec<Host> = {
            let hosts = self.inventory.select(&play.hosts)?;
            match &self.options.limit {
                Some(limit) => {
                    let limited: HashSet<String> = self
                        .inventory
                        .select(limit)?
                        .into_iter()
                        .map(|h| h.name.clone())
                        .collect();
                    hosts
                        .into_iter()
                        .filter(|h| limited.contains(&h.name))
                        .cloned()
                        .collect()
                }
                None => hosts.into_iter().cloned().collect(),
            }
        };

        let host_names: Vec<String> = selected.iter().map(|h| h.name.clone()).collect();
        self.emit({
            let name = play.name.clone();
            let hosts = host_names.clone();
            move |cb| cb.on_play_start(&name, &hosts)
        });

        if selected.is_empty() {
            warn!(pattern = %play.hosts, "play matched no hosts");
            return Ok(());
        }
        if selected.len() > self.connections.max_connections() {
            return Err(ExecutorError::TooManyHosts {
                play: play.name.clone(),
                hosts: selected.len(),
                limit: self.connections.max_connections(),
            });
        }

        info!(hosts = selected.len(), "play starting");

        // Every selected host appears in the recap, results or not.
        for name in &host_names {
            report.stats.entry(name.clone()).or_default();
        }

        // Play-level variables: vars plus vars_files (decrypted as needed).
        let mut play_vars = play.vars.clone();
        for file in &play.vars_files {
            let rendered = engine
                .render_string(file, &self.options.extra_vars)
                .unwrap_or_else(|_| file.clone());
            let path = playbook.base_dir().join(&rendered);
            let raw = std::fs::read_to_string(&path).map_err(|e| ExecutorError::VarsFile {
                file: rendered.clone(),
                message: e.to_string(),
            })?;
            let text = crate::vault::maybe_decrypt(&raw, self.options.vault_password.as_deref())?;
            let yaml: serde_yaml::Value =
                serde_yaml::from_str(&text).map_err(|e| ExecutorError::VarsFile {
                    file: rendered.clone(),
                    message: e.to_string(),
                })?;
            if let Value::Object(map) = crate::vars::yaml_to_json(&yaml) {
                for (key, value) in map {
                    play_vars.insert(key, value);
                }
            }
        }

        // Individual variable values may themselves be vault payloads.
        let vault_password = self.options.vault_password.clone();
        for value in play_vars.values_mut() {
            if let Value::String(s) = value {
                if crate::vault::Vault::is_encrypted(s) {
                    let decrypted = crate::vault::maybe_decrypt(s, vault_password.as_deref())?;
                    *value = serde_yaml::from_str::<serde_yaml::Value>(&decrypted)
                        .map(|yaml| crate::vars::yaml_to_json(&yaml))
                        .unwrap_or(Value::String(decrypted));
                }
            }
        }

        // Magic variables shared by every host of this play.
        let mut magic = IndexMap::new();
        magic.insert(
            "playbook_dir".to_string(),
            Value::String(playbook.base_dir().display().to_string()),
        );
        magic.insert(
            "groups".to_string(),
            serde_json::to_value(self.inventory.groups_map())
                .unwrap_or(Value::Null),
        );
        magic.insert(
            "play_hosts".to_string(),
            Value::Array(host_names.iter().cloned().map(Value::String).collect()),
        );
        let check_mode = play.check_mode.unwrap_or(self.options.check_mode);
        magic.insert("ansible_check_mode".to_string(), Value::Bool(check_mode));
        let mut hostvars = serde_json::Map::new();
        for host in self.inventory.hosts() {
            if let Ok(vars) = self.inventory.host_vars(&host.name) {
                hostvars.insert(
                    host.name.clone(),
                    serde_json::to_value(vars).unwrap_or(Value::Null),
                );
            }
        }
        magic.insert("hostvars".to_string(), Value::Object(hostvars));

        // Per-host contexts with the full variable stack.
        let mut contexts = Vec::with_capacity(selected.len());
        for host in &selected {
            let mut store = self.inventory.var_store_for(&host.name)?;
            for role in &play.roles {
                store.set_many(role.defaults.clone(), VarPrecedence::RoleDefaults);
            }
            store.set_many(play_vars.clone(), VarPrecedence::PlayVars);
            for role in &play.roles {
                store.set_many(role.vars.clone(), VarPrecedence::RoleVars);
            }
            store.set_many(self.options.extra_vars.clone(), VarPrecedence::ExtraVars);
            contexts.push(HostContext::new(host.clone(), store));
        }

        let mut state = PlayState {
            hosts: contexts,
            handlers: play.handlers.clone(),
            magic,
            check_mode,
            diff_mode: play.diff.unwrap_or(self.options.diff_mode),
            play_become: play.r#become || self.options.r#become,
            play_become_user: play
                .become_user
                .clone()
                .or_else(|| self.options.become_user.clone()),
            play_become_method: play
                .become_method
                .clone()
                .or_else(|| self.options.become_method.clone()),
            any_errors_fatal: play.any_errors_fatal,
            force_handlers: play.force_handlers || self.options.force_handlers,
            fatal: false,
        };

        if play.gather_facts {
            let mut setup = Task::default();
            setup.name = "Gathering Facts".to_string();
            setup.module = "setup".to_string();
            setup.original_module = "setup".to_string();
            setup.tags = vec!["always".to_string()];
            self.run_task(&setup, &mut state, &Frame::default(), &Scope::default(), false, engine, report)
                .await?;
        }

        // The three flush points: after pre_tasks, tasks (roles included),
        // and post_tasks.
        let role_nodes: Vec<TaskNode> = play
            .roles
            .iter()
            .map(|role| {
                TaskNode::Block(Block {
                    name: format!("role: {}", role.name),
                    body: role.tasks.clone(),
                    ..Default::default()
                })
            })
            .collect();
        let mut main_section: Vec<TaskNode> = role_nodes;
        main_section.extend(play.tasks.iter().cloned());

        let sections: [&[TaskNode]; 3] = [&play.pre_tasks, &main_section, &play.post_tasks];
        for section in sections {
            if state.fatal || self.interrupted() {
                break;
            }
            self.run_nodes(section, &mut state, &Frame::default(), &Scope::default(), engine, report)
                .await?;
            if (!state.fatal || state.force_handlers) && !self.interrupted() {
                self.flush_handlers(&mut state, engine, report).await?;
            }
        }

        Ok(())
    }

    /// Run a list of nodes under a scope, task by task (linear strategy).
    fn run_nodes<'a>(
        &'a mut self,
        nodes: &'a [TaskNode],
        state: &'a mut PlayState,
        frame: &'a Frame,
        scope: &'a Scope,
        engine: &'a TemplateEngine,
        report: &'a mut RunReport,
    ) -> futures::future::BoxFuture<'a, ExecutorResult<()>> {
        Box::pin(async move {
            for node in nodes {
                if state.fatal || self.interrupted() {
                    break;
                }
                match node {
                    TaskNode::Task(task) if task.module == "meta" => {
                        if meta_directive(task) == Some("flush_handlers".to_string()) {
                            debug!("flush_handlers requested by meta task");
                            self.flush_handlers(state, engine, report).await?;
                        }
                    }
                    TaskNode::Task(task)
                        if task.include_file.is_some() || task.include_role.is_some() =>
                    {
                        let block = self.expand_include(task, state, engine)?;
                        self.run_block(&block, state, frame, scope, engine, report)
                            .await?;
                    }
                    TaskNode::Task(task) => {
                        self.run_task(task, state, frame, scope, false, engine, report)
                            .await?;
                    }
                    TaskNode::Block(block) => {
                        self.run_block(block, state, frame, scope, engine, report)
                            .await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Block execution: body, rescue for hosts whose body failed, always
    /// for every host that entered.
    async fn run_block(
        &mut self,
        block: &Block,
        state: &mut PlayState,
        frame: &Frame,
        scope: &Scope,
        engine: &TemplateEngine,
        report: &mut RunReport,
    ) -> ExecutorResult<()> {
        let entered: HashSet<String> = state
            .hosts
            .iter()
            .filter(|ctx| scope.admits(ctx))
            .map(|ctx| ctx.name().to_string())
            .collect();
        if entered.is_empty() {
            return Ok(());
        }

        let child_frame = frame.child(block);
        // Snapshot failure counters so a successful rescue can absolve the
        // body's failures in the recap.
        let failed_before: std::collections::HashMap<String, usize> = entered
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    report.stats.get(name).map(|s| s.failed).unwrap_or(0),
                )
            })
            .collect();

        let body_scope = Scope {
            only: Some(entered.clone()),
            include_failed: false,
        };
        self.run_nodes(&block.body, state, &child_frame, &body_scope, engine, report)
            .await?;

        // Hosts whose body failed become rescue candidates.
        let rescue_candidates: HashSet<String> = state
            .hosts
            .iter()
            .filter(|ctx| entered.contains(ctx.name()) && ctx.is_failed())
            .map(|ctx| ctx.name().to_string())
            .collect();

        if !block.rescue.is_empty() && !rescue_candidates.is_empty() {
            debug!(hosts = rescue_candidates.len(), "entering rescue");
            for ctx in state.hosts.iter_mut() {
                if rescue_candidates.contains(ctx.name()) {
                    ctx.state = HostState::Ready;
                }
            }
            let rescue_scope = Scope {
                only: Some(rescue_candidates.clone()),
                include_failed: false,
            };
            self.run_nodes(&block.rescue, state, &child_frame, &rescue_scope, engine, report)
                .await?;

            // A host whose rescue completed is no longer failed; its body
            // failures leave the recap.
            for name in &rescue_candidates {
                let recovered = state
                    .hosts
                    .iter()
                    .any(|ctx| ctx.name() == name && ctx.is_ready());
                if recovered {
                    if let (Some(stats), Some(before)) =
                        (report.stats.get_mut(name), failed_before.get(name))
                    {
                        stats.failed = *before;
                    }
                }
            }
        }

        if !block.always.is_empty() {
            let always_scope = Scope {
                only: Some(entered),
                include_failed: true,
            };
            self.run_nodes(&block.always, state, &child_frame, &always_scope, engine, report)
                .await?;
        }

        Ok(())
    }

    /// Expand a dynamic include into a block at execution time, so its
    /// condition, variables, and path render in play context.
    fn expand_include(
        &mut self,
        task: &Task,
        state: &mut PlayState,
        engine: &TemplateEngine,
    ) -> ExecutorResult<Block> {
        let magic = state.magic.clone();
        let render_vars = state
            .hosts
            .iter_mut()
            .find(|ctx| ctx.is_ready())
            .map(|ctx| ctx.render_vars(&magic))
            .unwrap_or_else(|| magic.clone());

        let body = if let Some(file) = &task.include_file {
            let rendered = engine
                .render_string(file, &render_vars)
                .map_err(|e| ExecutorError::Parse(crate::playbook::ParseError::Include(e.to_string())))?;
            let base_dir = std::path::PathBuf::from(
                render_vars
                    .get("playbook_dir")
                    .and_then(Value::as_str)
                    .unwrap_or("."),
            );
            crate::playbook::task::load_task_file(&base_dir.join(&rendered), Some(&base_dir))?
        } else {
            let role_name = task.include_role.as_deref().unwrap_or_default();
            let rendered = engine
                .render_string(role_name, &render_vars)
                .map_err(|e| ExecutorError::Parse(crate::playbook::ParseError::Include(e.to_string())))?;
            let base_dir = std::path::PathBuf::from(
                render_vars
                    .get("playbook_dir")
                    .and_then(Value::as_str)
                    .unwrap_or("."),
            );
            let role = crate::playbook::Role::load(&base_dir, &rendered)?;
            return Ok(role.into_block(task.when.clone(), task.tags.clone()));
        };

        Ok(Block {
            name: task.display_name(),
            when: task.when.clone(),
            tags: task.tags.clone(),
            r#become: task.r#become,
            become_user: task.become_user.clone(),
            vars: task.vars.clone(),
            body,
            rescue: Vec::new(),
            always: Vec::new(),
        })
    }

    /// Tag filtering: `--tags` keeps matching (or `always`-tagged) tasks,
    /// `--skip-tags` drops matching ones, `never` runs only when named.
    fn tag_allows(&self, task: &Task, frame: &Frame) -> bool {
        let mut tags: Vec<&str> = frame.tags.iter().map(String::as_str).collect();
        tags.extend(task.tags.iter().map(String::as_str));

        if tags
            .iter()
            .any(|t| self.options.skip_tags.iter().any(|s| s == t))
        {
            return false;
        }
        if tags.contains(&"never")
            && !tags
                .iter()
                .any(|t| self.options.tags.iter().any(|s| s == t))
        {
            return false;
        }
        if self.options.tags.is_empty() {
            return true;
        }
        tags.contains(&"always")
            || tags
                .iter()
                .any(|t| self.options.tags.iter().any(|s| s == t))
    }

    /// Fan one task out across all eligible hosts, bounded by forks, then
    /// fold the results back into per-host state.
    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        &mut self,
        task: &Task,
        state: &mut PlayState,
        frame: &Frame,
        scope: &Scope,
        is_handler: bool,
        engine: &TemplateEngine,
        report: &mut RunReport,
    ) -> ExecutorResult<()> {
        // Notified handlers run regardless of tag filters.
        if !is_handler && !self.tag_allows(task, frame) {
            debug!(task = %task.display_name(), "filtered out by tags");
            return Ok(());
        }

        let task_index = self.task_counter;
        self.task_counter += 1;

        let eligible: Vec<String> = state
            .hosts
            .iter()
            .filter(|ctx| scope.admits(ctx))
            .map(|ctx| ctx.name().to_string())
            .collect();

        self.emit({
            let name = task.display_name();
            let module = task.original_module.clone();
            move |cb| cb.on_task_start(task_index, &name, &module, is_handler)
        });

        if eligible.is_empty() {
            return Ok(());
        }

        debug!(task = %task.display_name(), hosts = eligible.len(), "task starting");

        // Build one future per host; the semaphore enforces the forks
        // bound across them.
        let semaphore = Arc::new(Semaphore::new(self.options.forks.max(1)));
        let mut futures = Vec::with_capacity(eligible.len());

        let magic = state.magic.clone();
        let play_become = state.play_become;
        let play_become_user = state.play_become_user.clone();
        let play_become_method = state.play_become_method.clone();
        let (play_check, play_diff) = (state.check_mode, state.diff_mode);

        for name in &eligible {
            let ctx = state
                .hosts
                .iter_mut()
                .find(|c| c.name() == name)
                .expect("eligible host exists");

            let mut vars = ctx.render_vars(&magic);
            for (key, value) in &frame.vars {
                vars.insert(key.clone(), value.clone());
            }
            for (key, value) in &task.vars {
                vars.insert(key.clone(), value.clone());
            }

            let mut when = frame.when.clone();
            when.extend(task.when.iter().cloned());

            // Delegation re-routes the transport while templating stays on
            // the originating host's variables.
            let target_host = match &task.delegate_to {
                Some(delegate) => {
                    let rendered = engine
                        .render_string(delegate, &vars)
                        .unwrap_or_else(|_| delegate.clone());
                    self.inventory
                        .get_host(&rendered)
                        .cloned()
                        .ok_or(ExecutorError::DelegateNotFound(rendered))?
                }
                None => ctx.host.clone(),
            };

            let becomes = resolve_become(
                task,
                frame,
                &ctx.host,
                play_become,
                &play_become_user,
                &play_become_method,
                &self.options,
            );
            let input = HostExecInput {
                host_name: name.clone(),
                target_host,
                vars,
                when,
                task: task.clone(),
                engine: engine.clone(),
                registry: Arc::clone(&self.registry),
                connections: Arc::clone(&self.connections),
                check_mode: task.check_mode.unwrap_or(play_check),
                diff_mode: task.diff.unwrap_or(play_diff),
                becomes,
                timeout: self.options.timeout,
                gathering: task.module == "setup" && !is_handler,
            };

            let semaphore = Arc::clone(&semaphore);
            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("semaphore open");
                execute_on_host(input).await
            });
        }

        let outcomes = futures::future::join_all(futures).await;

        // Fold results back in host order; state mutation stays on the
        // orchestrator.
        for (name, mut result, side_effects) in outcomes {
            let newly_failed = matches!(result.status, TaskStatus::Failed) && !result.ignored;

            let ctx = state
                .hosts
                .iter_mut()
                .find(|c| c.name() == name)
                .expect("host context exists");

            if let Some(register) = &task.register {
                ctx.set_runtime_var(register.clone(), result.value.clone());
            }

            for effect in side_effects {
                match effect {
                    SideEffect::Facts { vars, precedence } => {
                        for (key, value) in vars {
                            ctx.store.set(key, value, precedence);
                        }
                    }
                    SideEffect::AddHost { name, groups, vars } => {
                        let mut host = Host::new(&name);
                        for (key, value) in &vars {
                            let _ = host.apply_var(key, value.clone());
                        }
                        self.inventory.add_host(host, &groups);
                    }
                    SideEffect::GroupBy { group } => {
                        let host_name = name.clone();
                        let _ = self.inventory.group_host(&host_name, &group);
                    }
                }
            }

            if result.changed && !task.notify.is_empty() {
                let handlers = &state.handlers;
                for notification in &task.notify {
                    let mut matched = false;
                    for handler in handlers.iter() {
                        if handler.responds_to(notification) {
                            ctx.notify(handler.name.clone());
                            matched = true;
                        }
                    }
                    if !matched {
                        warn!(handler = %notification, "notify matched no handler");
                    }
                }
            }

            match result.status {
                TaskStatus::Unreachable => {
                    ctx.state = HostState::Unreachable;
                    self.connections.discard(&name).await;
                }
                TaskStatus::Failed if !result.ignored => ctx.state = HostState::Failed,
                _ => {}
            }
            if result.ignored {
                result.msg = Some(format!(
                    "{} (errors ignored)",
                    result.msg.as_deref().unwrap_or("failed")
                ));
            }

            report
                .stats
                .entry(name.clone())
                .or_insert_with(HostStats::default)
                .record(&result);
            self.emit({
                let host = name.clone();
                let result = result.clone();
                move |cb| cb.on_host_result(task_index, &host, &result)
            });

            if newly_failed && state.any_errors_fatal {
                warn!(host = %name, "any_errors_fatal: stopping play");
                state.fatal = true;
            }
        }

        Ok(())
    }

    /// Flush pending handler notifications: run each notified handler once
    /// per host, in first-notify order, with the same linear semantics.
    async fn flush_handlers(
        &mut self,
        state: &mut PlayState,
        engine: &TemplateEngine,
        report: &mut RunReport,
    ) -> ExecutorResult<()> {
        // Global order: walk hosts in play order, collecting each host's
        // pending list in its own notify order.
        let mut order: Vec<String> = Vec::new();
        for ctx in &state.hosts {
            for name in &ctx.pending_handlers {
                if !order.contains(name) {
                    order.push(name.clone());
                }
            }
        }
        if order.is_empty() {
            return Ok(());
        }

        info!(handlers = order.len(), "flushing handlers");
        let force = state.force_handlers;

        for handler_name in order {
            let Some(handler) = state
                .handlers
                .iter()
                .find(|h| h.name == handler_name)
                .cloned()
            else {
                warn!(handler = %handler_name, "pending handler disappeared");
                continue;
            };

            let eligible: HashSet<String> = state
                .hosts
                .iter()
                .filter(|ctx| {
                    ctx.pending_handlers.contains(&handler_name)
                        && !ctx.is_unreachable()
                        && (!ctx.is_failed() || force)
                })
                .map(|ctx| ctx.name().to_string())
                .collect();

            for ctx in state.hosts.iter_mut() {
                if ctx.pending_handlers.shift_remove(&handler_name) {
                    ctx.ran_handlers.insert(handler_name.clone());
                }
            }
            if eligible.is_empty() {
                continue;
            }

            let scope = Scope {
                only: Some(eligible),
                include_failed: force,
            };
            self.run_task(&handler.task, state, &Frame::default(), &scope, true, engine, report)
                .await?;
        }

        Ok(())
    }
}

/// The `meta` module's directive, read pre-render (directives are plain
/// strings).
fn meta_directive(task: &Task) -> Option<String> {
    match &task.args {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("directive")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Resolved escalation settings for one host's task.
#[derive(Debug, Clone, Default)]
struct BecomeSettings {
    enabled: bool,
    user: Option<String>,
    method: Option<String>,
    password: Option<String>,
}

/// Escalation cascade: task overrides block, block overrides host, host
/// overrides play/CLI defaults. A local transport only escalates when the
/// request is explicit (task, block, or host), never from play/CLI
/// defaults.
fn resolve_become(
    task: &Task,
    frame: &Frame,
    host: &Host,
    play_become: bool,
    play_become_user: &Option<String>,
    play_become_method: &Option<String>,
    options: &RunnerOptions,
) -> BecomeSettings {
    let explicit = task
        .r#become
        .or(frame.r#become)
        .or(if host.connection.r#become {
            Some(true)
        } else {
            None
        });
    let enabled = match explicit {
        Some(value) => value,
        None => {
            if host.connection.transport == Transport::Local {
                false
            } else {
                play_become
            }
        }
    };

    let user = task
        .become_user
        .clone()
        .or_else(|| frame.become_user.clone())
        .or_else(|| host.connection.become_user.clone())
        .or_else(|| play_become_user.clone());
    let method = task
        .become_method
        .clone()
        .or_else(|| host.connection.become_method.clone())
        .or_else(|| play_become_method.clone());
    let password = host
        .connection
        .become_password
        .clone()
        .or_else(|| options.become_password.clone());

    BecomeSettings {
        enabled,
        user,
        method,
        password,
    }
}

/// Everything one host's task execution needs, captured by value so the
/// future is independent of the runner's borrows.
struct HostExecInput {
    host_name: String,
    target_host: Host,
    vars: IndexMap<String, Value>,
    when: Vec<String>,
    task: Task,
    engine: TemplateEngine,
    registry: Arc<ModuleRegistry>,
    connections: Arc<ConnectionManager>,
    check_mode: bool,
    diff_mode: bool,
    becomes: BecomeSettings,
    timeout: Option<u64>,
    gathering: bool,
}

/// Execute one task on one host: condition, loop expansion, rendering,
/// module dispatch, and result shaping.
async fn execute_on_host(input: HostExecInput) -> (String, TaskResult, Vec<SideEffect>) {
    let host_name = input.host_name.clone();
    let (result, effects) = execute_on_host_inner(&input).await;
    let mut result = result;
    if matches!(result.status, TaskStatus::Failed) && input.task.ignore_errors {
        result.ignored = true;
    }
    (host_name, result, effects)
}

async fn execute_on_host_inner(input: &HostExecInput) -> (TaskResult, Vec<SideEffect>) {
    // Task condition (without loop vars); with a loop the condition is
    // re-evaluated per item instead.
    if input.task.loop_spec.is_none() {
        match input.engine.evaluate_when(&input.when, &input.vars) {
            Ok(true) => {}
            Ok(false) => {
                return (
                    TaskResult::skipped("conditional result was false"),
                    Vec::new(),
                )
            }
            Err(e) => return (TaskResult::failed(e.to_string()), Vec::new()),
        }
    }

    let Some(loop_spec) = &input.task.loop_spec else {
        let (result, effects) = run_iteration(input, &input.vars).await;
        return (result, effects);
    };

    // Loop expansion: render the expression to a sequence, then run the
    // task once per item with the loop variable bound.
    let items = match input.engine.render_structure(loop_spec, &input.vars) {
        Ok(Value::Array(items)) => items,
        Ok(other) => {
            return (
                TaskResult::failed(format!("loop did not produce a list: {}", other)),
                Vec::new(),
            )
        }
        Err(e) => return (TaskResult::failed(e.to_string()), Vec::new()),
    };

    if items.is_empty() {
        return (TaskResult::skipped("empty loop"), Vec::new());
    }

    let loop_var = &input.task.loop_control.loop_var;
    let mut iteration_values = Vec::with_capacity(items.len());
    let mut any_changed = false;
    let mut any_failed = false;
    let mut all_skipped = true;
    let mut effects = Vec::new();
    let mut diff = None;
    let mut first_failure: Option<String> = None;

    for (index, item) in items.iter().enumerate() {
        let mut iter_vars = input.vars.clone();
        iter_vars.insert(loop_var.clone(), item.clone());
        if let Some(index_var) = &input.task.loop_control.index_var {
            iter_vars.insert(index_var.clone(), json!(index));
        }

        match input.engine.evaluate_when(&input.when, &iter_vars) {
            Ok(true) => {}
            Ok(false) => {
                let mut value = json!({
                    "changed": false,
                    "skipped": true,
                    "msg": "conditional result was false",
                });
                value[loop_var] = item.clone();
                iteration_values.push(value);
                continue;
            }
            Err(e) => {
                any_failed = true;
                all_skipped = false;
                first_failure.get_or_insert(e.to_string());
                let mut value = json!({"failed": true, "msg": e.to_string()});
                value[loop_var] = item.clone();
                iteration_values.push(value);
                continue;
            }
        }

        all_skipped = false;
        let (result, iteration_effects) = run_iteration(input, &iter_vars).await;
        effects.extend(iteration_effects);

        if matches!(result.status, TaskStatus::Unreachable) {
            // The host is gone; no point attempting further items.
            return (result, effects);
        }

        any_changed |= result.changed;
        if matches!(result.status, TaskStatus::Failed) {
            any_failed = true;
            first_failure.get_or_insert_with(|| {
                result.msg.clone().unwrap_or_else(|| "item failed".to_string())
            });
        }
        if diff.is_none() {
            diff = result.diff.clone();
        }

        let mut value = result.value;
        value[loop_var] = item.clone();
        iteration_values.push(value);
    }

    let status = if any_failed {
        TaskStatus::Failed
    } else if all_skipped {
        TaskStatus::Skipped
    } else if any_changed {
        TaskStatus::Changed
    } else {
        TaskStatus::Ok
    };

    let msg = match (&first_failure, all_skipped) {
        (Some(failure), _) => format!("one or more items failed: {}", failure),
        (None, true) => "all items skipped".to_string(),
        (None, false) => "all items completed".to_string(),
    };

    let value = json!({
        "results": iteration_values,
        "changed": any_changed,
        "failed": any_failed,
        "skipped": all_skipped,
        "msg": msg,
    });

    (
        TaskResult {
            status,
            changed: any_changed,
            msg: Some(msg),
            value,
            diff,
            ignored: false,
        },
        effects,
    )
}

/// One module invocation (a whole task, or a single loop iteration).
async fn run_iteration(
    input: &HostExecInput,
    vars: &IndexMap<String, Value>,
) -> (TaskResult, Vec<SideEffect>) {
    // Render the argument structure under this host's variables.
    let args = match input.engine.render_structure(&input.task.args, vars) {
        Ok(args) => args,
        Err(e) => return (TaskResult::failed(e.to_string()), Vec::new()),
    };

    let module = match input.registry.resolve(&input.task.module) {
        Ok(module) => module,
        Err(e) => return (TaskResult::failed(e.to_string()), Vec::new()),
    };

    let connection = if module.control_node() {
        Arc::new(crate::connection::local::LocalConnection::new())
            as Arc<dyn crate::connection::Connection>
    } else {
        match input.connections.get(&input.target_host).await {
            Ok(conn) => conn,
            Err(e) if e.is_unreachable() => {
                return (TaskResult::unreachable(e.to_string()), Vec::new())
            }
            Err(e) => return (TaskResult::failed(e.to_string()), Vec::new()),
        }
    };

    let context = ModuleContext {
        check_mode: input.check_mode,
        diff_mode: input.diff_mode,
        vars: vars.clone(),
        connection,
        r#become: input.becomes.enabled,
        become_user: input.becomes.user.clone(),
        become_method: input.becomes.method.clone(),
        become_password: input.becomes.password.clone(),
        timeout: input.timeout,
    };

    let output = match input
        .registry
        .execute(&input.task.module, &args, &context)
        .await
    {
        Ok(output) => output,
        Err(ModuleError::Connection(e)) if e.is_unreachable() => {
            return (TaskResult::unreachable(e.to_string()), Vec::new())
        }
        Err(ModuleError::Connection(ConnectionError::Timeout(secs))) => {
            // A timeout fails the host but does not unreach it; the
            // transport is reset so the next task reconnects.
            input.connections.discard(&input.target_host.name).await;
            return (
                TaskResult::failed(format!("command timed out after {}s", secs)),
                Vec::new(),
            );
        }
        Err(e) => return (TaskResult::failed(e.to_string()), Vec::new()),
    };

    let effects = extract_side_effects(&output, input.gathering);
    let mut result = shape_result(output);

    // changed_when / failed_when re-judge the outcome; the result value is
    // visible to the expressions under the registered name.
    if !input.task.changed_when.is_empty() || !input.task.failed_when.is_empty() {
        let mut eval_vars = vars.clone();
        if let Some(register) = &input.task.register {
            eval_vars.insert(register.clone(), result.value.clone());
        }

        if !matches!(result.status, TaskStatus::Skipped) {
            if !input.task.failed_when.is_empty() {
                match input.engine.evaluate_when(&input.task.failed_when, &eval_vars) {
                    Ok(failed) => {
                        if failed {
                            result.status = TaskStatus::Failed;
                            result.value["failed"] = json!(true);
                        } else if matches!(result.status, TaskStatus::Failed) {
                            result.status =
                                if result.changed { TaskStatus::Changed } else { TaskStatus::Ok };
                            result.value["failed"] = json!(false);
                        }
                    }
                    Err(e) => {
                        result.status = TaskStatus::Failed;
                        result.msg = Some(e.to_string());
                    }
                }
            }
            if !input.task.changed_when.is_empty()
                && !matches!(result.status, TaskStatus::Failed)
            {
                match input.engine.evaluate_when(&input.task.changed_when, &eval_vars) {
                    Ok(changed) => {
                        result.changed = changed;
                        result.value["changed"] = json!(changed);
                        result.status = if changed {
                            TaskStatus::Changed
                        } else {
                            TaskStatus::Ok
                        };
                    }
                    Err(e) => {
                        result.status = TaskStatus::Failed;
                        result.msg = Some(e.to_string());
                    }
                }
            }
        }
    }

    (result, effects)
}

/// Module result data keys with runner-visible side effects.
fn extract_side_effects(output: &ModuleOutput, gathering: bool) -> Vec<SideEffect> {
    let mut effects = Vec::new();

    if let Some(Value::Object(facts)) = output.data.get("ansible_facts") {
        let precedence = if gathering {
            VarPrecedence::Facts
        } else {
            VarPrecedence::SetFacts
        };
        effects.push(SideEffect::Facts {
            vars: facts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            precedence,
        });
    }

    if let Some(payload) = output.data.get("add_host") {
        let name = payload
            .get("host_name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !name.is_empty() {
            let groups = payload
                .get("groups")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();
            let vars = payload
                .get("host_vars")
                .and_then(Value::as_object)
                .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            effects.push(SideEffect::AddHost { name, groups, vars });
        }
    }

    if let Some(group) = output.data.get("group_by").and_then(Value::as_str) {
        effects.push(SideEffect::GroupBy {
            group: group.to_string(),
        });
    }

    effects
}

/// Turn a module output into the runner-level result, flattening the data
/// map into the registered value.
fn shape_result(output: ModuleOutput) -> TaskResult {
    let status = match output.status {
        ModuleStatus::Ok => TaskStatus::Ok,
        ModuleStatus::Changed => TaskStatus::Changed,
        ModuleStatus::Failed => TaskStatus::Failed,
        ModuleStatus::Skipped => TaskStatus::Skipped,
    };

    let mut value = json!({
        "changed": output.changed,
        "failed": matches!(status, TaskStatus::Failed),
        "skipped": matches!(status, TaskStatus::Skipped),
        "msg": output.msg,
        "status": status.to_string(),
    });
    if let Some(stdout) = &output.stdout {
        value["stdout"] = json!(stdout);
        value["stdout_lines"] = json!(stdout.lines().collect::<Vec<_>>());
    }
    if let Some(stderr) = &output.stderr {
        value["stderr"] = json!(stderr);
    }
    if let Some(rc) = output.rc {
        value["rc"] = json!(rc);
    }
    for (key, data) in &output.data {
        value[key] = data.clone();
    }
    if let Some(diff) = &output.diff {
        value["diff"] = json!({
            "before": diff.before,
            "after": diff.after,
            "before_header": diff.before_header,
            "after_header": diff.after_header,
        });
    }

    TaskResult {
        status,
        changed: output.changed,
        msg: Some(output.msg),
        value,
        diff: output.diff,
        ignored: false,
    }
}
