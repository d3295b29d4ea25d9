//! Result reporting.
//!
//! The runner feeds lifecycle events to a [`Callback`]; two are built in:
//! [`DefaultCallback`] renders the human stream (task banners, per-host
//! status lines, the recap table) and [`JsonCallback`] accumulates the
//! machine-readable document and prints it when the run ends. Results may
//! arrive in any order within a task; the JSON stream keys them on
//! `(task_index, host_name)`.

pub mod default;
pub mod json;

pub use default::DefaultCallback;
pub use json::JsonCallback;

use crate::executor::{HostStats, TaskResult};
use indexmap::IndexMap;

/// Lifecycle hooks fed by the runner. All calls happen from the
/// orchestrator, never concurrently.
pub trait Callback: Send {
    /// A play is starting on the given hosts.
    fn on_play_start(&mut self, name: &str, hosts: &[String]) {
        let _ = (name, hosts);
    }

    /// A task is starting across hosts.
    fn on_task_start(&mut self, task_index: usize, name: &str, module: &str, is_handler: bool) {
        let _ = (task_index, name, module, is_handler);
    }

    /// One host finished the task.
    fn on_host_result(&mut self, task_index: usize, host: &str, result: &TaskResult) {
        let _ = (task_index, host, result);
    }

    /// The whole run finished; `stats` holds the recap counters.
    fn on_recap(&mut self, stats: &IndexMap<String, HostStats>) {
        let _ = stats;
    }
}

/// Verbosity-driven detail levels shared by callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Detail {
    /// One line per host
    #[default]
    Normal,
    /// Include messages and command output
    Verbose,
}
