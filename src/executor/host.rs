//! Per-play, per-host mutable state.

use crate::inventory::Host;
use crate::vars::{VarPrecedence, VarStore};
use indexmap::{IndexMap, IndexSet};
use serde_json::Value;

/// Host states within a play.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Eligible for the next task
    Ready,
    /// Failed a task; skipped unless rescued, running `always`, or the
    /// task ignores errors
    Failed,
    /// Transport gone; permanently excluded for the rest of the play
    Unreachable,
}

/// The mutable context a host carries through one play: its variable
/// store, state flag, and pending handler notifications.
#[derive(Debug)]
pub struct HostContext {
    /// The inventory host this context belongs to
    pub host: Host,
    /// Layered variables (inventory snapshot + play/role tiers + runtime)
    pub store: VarStore,
    /// Current state in the play's state machine
    pub state: HostState,
    /// Pending handler names, de-duplicated, first-notify order preserved
    pub pending_handlers: IndexSet<String>,
    /// Handlers that already ran this play; a handler runs at most once
    /// per play per host
    pub ran_handlers: std::collections::HashSet<String>,
}

impl HostContext {
    /// Create a context in the ready state.
    pub fn new(host: Host, store: VarStore) -> Self {
        Self {
            host,
            store,
            state: HostState::Ready,
            pending_handlers: IndexSet::new(),
            ran_handlers: std::collections::HashSet::new(),
        }
    }

    /// The host name.
    pub fn name(&self) -> &str {
        &self.host.name
    }

    /// Whether the host may run an ordinary next task.
    pub fn is_ready(&self) -> bool {
        self.state == HostState::Ready
    }

    /// Whether the host is permanently out of the play.
    pub fn is_unreachable(&self) -> bool {
        self.state == HostState::Unreachable
    }

    /// Whether the host has failed (but could still be rescued).
    pub fn is_failed(&self) -> bool {
        self.state == HostState::Failed
    }

    /// Store a registered result or fact at the runtime tier.
    pub fn set_runtime_var(&mut self, key: impl Into<String>, value: Value) {
        self.store.set(key, value, VarPrecedence::SetFacts);
    }

    /// Add a handler notification, keeping first-notify order. A handler
    /// that already ran this play is not re-queued.
    pub fn notify(&mut self, handler_name: impl Into<String>) {
        let name = handler_name.into();
        if !self.ran_handlers.contains(&name) {
            self.pending_handlers.insert(name);
        }
    }

    /// The effective variables for rendering on this host, including the
    /// magic variables supplied by the runner.
    pub fn render_vars(
        &mut self,
        magic: &IndexMap<String, Value>,
    ) -> IndexMap<String, Value> {
        let mut vars = self.store.snapshot();
        for (key, value) in magic {
            vars.insert(key.clone(), value.clone());
        }
        vars.insert(
            "inventory_hostname".to_string(),
            Value::String(self.host.name.clone()),
        );
        vars.insert(
            "inventory_hostname_short".to_string(),
            Value::String(
                self.host
                    .name
                    .split('.')
                    .next()
                    .unwrap_or(&self.host.name)
                    .to_string(),
            ),
        );
        vars.insert(
            "ansible_host".to_string(),
            Value::String(self.host.address().to_string()),
        );
        vars.insert(
            "group_names".to_string(),
            Value::Array(
                self.host
                    .groups
                    .iter()
                    .filter(|g| *g != "all")
                    .map(|g| Value::String(g.clone()))
                    .collect(),
            ),
        );
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notify_dedup_preserves_order() {
        let mut ctx = HostContext::new(Host::new("h"), VarStore::new());
        ctx.notify("restart b");
        ctx.notify("restart a");
        ctx.notify("restart b");

        let pending: Vec<_> = ctx.pending_handlers.iter().collect();
        assert_eq!(pending, vec!["restart b", "restart a"]);
    }

    #[test]
    fn test_render_vars_magic() {
        let mut host = Host::new("web1.example.com");
        host.add_to_group("all");
        host.add_to_group("web");
        let mut ctx = HostContext::new(host, VarStore::new());
        ctx.set_runtime_var("fact", json!(1));

        let vars = ctx.render_vars(&IndexMap::new());
        assert_eq!(vars.get("inventory_hostname"), Some(&json!("web1.example.com")));
        assert_eq!(vars.get("inventory_hostname_short"), Some(&json!("web1")));
        assert_eq!(vars.get("group_names"), Some(&json!(["web"])));
        assert_eq!(vars.get("fact"), Some(&json!(1)));
    }
}
