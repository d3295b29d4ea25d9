//! The runner: linear-strategy playbook execution.
//!
//! Plays run sequentially; within a play every task is evaluated across
//! all eligible hosts with bounded concurrency before the next task
//! starts. Per-host state (variables, registered results, failure flags,
//! pending handler notifications) lives in [`host::HostContext`].

pub mod host;
pub mod runner;

pub use host::{HostContext, HostState};
pub use runner::{PlaybookRunner, RunnerOptions};

use crate::modules::Diff;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors that abort a run (as opposed to per-host failures, which are
/// carried in results).
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error(transparent)]
    Inventory(#[from] crate::inventory::InventoryError),

    #[error(transparent)]
    Parse(#[from] crate::playbook::ParseError),

    #[error(transparent)]
    Vault(#[from] crate::vault::VaultError),

    #[error("failed to load vars file '{file}': {message}")]
    VarsFile { file: String, message: String },

    #[error("play '{play}' targets {hosts} hosts, above the connection limit of {limit}")]
    TooManyHosts {
        play: String,
        hosts: usize,
        limit: usize,
    },

    #[error("delegate_to host '{0}' not found in inventory")]
    DelegateNotFound(String),

    #[error("run interrupted")]
    Interrupted,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Final status of one task on one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Ok,
    Changed,
    Failed,
    Skipped,
    Unreachable,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Ok => write!(f, "ok"),
            TaskStatus::Changed => write!(f, "changed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Skipped => write!(f, "skipped"),
            TaskStatus::Unreachable => write!(f, "unreachable"),
        }
    }
}

/// Outcome of one task on one host: the status plus the full result value
/// stored under `register`.
#[derive(Debug, Clone)]
pub struct TaskResult {
    /// Final status after `changed_when`/`failed_when` overrides
    pub status: TaskStatus,
    /// Whether state changed
    pub changed: bool,
    /// Human message
    pub msg: Option<String>,
    /// The structured result map (registered verbatim)
    pub value: Value,
    /// Diff payload when diff mode produced one
    pub diff: Option<Diff>,
    /// Whether a failure was ignored via `ignore_errors`
    pub ignored: bool,
}

impl TaskResult {
    /// A skipped result with the given reason.
    pub fn skipped(reason: impl Into<String>) -> Self {
        let msg = reason.into();
        Self {
            status: TaskStatus::Skipped,
            changed: false,
            msg: Some(msg.clone()),
            value: serde_json::json!({
                "changed": false,
                "skipped": true,
                "msg": msg,
            }),
            diff: None,
            ignored: false,
        }
    }

    /// An unreachable result with the given message.
    pub fn unreachable(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            status: TaskStatus::Unreachable,
            changed: false,
            msg: Some(msg.clone()),
            value: serde_json::json!({
                "changed": false,
                "unreachable": true,
                "msg": msg,
            }),
            diff: None,
            ignored: false,
        }
    }

    /// A failed result with the given message.
    pub fn failed(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        Self {
            status: TaskStatus::Failed,
            changed: false,
            msg: Some(msg.clone()),
            value: serde_json::json!({
                "changed": false,
                "failed": true,
                "msg": msg,
            }),
            diff: None,
            ignored: false,
        }
    }
}

/// Per-host counters for the recap.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HostStats {
    pub ok: usize,
    pub changed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub unreachable: usize,
}

impl HostStats {
    /// Record one task result.
    pub fn record(&mut self, result: &TaskResult) {
        match result.status {
            TaskStatus::Ok => self.ok += 1,
            TaskStatus::Changed => {
                self.ok += 1;
                self.changed += 1;
            }
            TaskStatus::Failed if result.ignored => self.ok += 1,
            TaskStatus::Failed => self.failed += 1,
            TaskStatus::Skipped => self.skipped += 1,
            TaskStatus::Unreachable => self.unreachable += 1,
        }
    }
}

/// The aggregate outcome of a run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Recap counters per host, in inventory order
    pub stats: IndexMap<String, HostStats>,
}

impl RunReport {
    /// Number of hosts that ended failed.
    pub fn failed_hosts(&self) -> usize {
        self.stats.values().filter(|s| s.failed > 0).count()
    }

    /// Number of hosts that became unreachable.
    pub fn unreachable_hosts(&self) -> usize {
        self.stats.values().filter(|s| s.unreachable > 0).count()
    }

    /// Process exit code: 0 all succeeded, 2 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.failed_hosts() == 0 && self.unreachable_hosts() == 0 {
            0
        } else {
            crate::error::EXIT_HOST_FAILED
        }
    }
}
