//! # stagehand
//!
//! A minimal, async-first configuration-management runner speaking a
//! familiar declarative playbook dialect: inventories of hosts and groups,
//! playbooks of plays and tasks, handlers, roles, blocks, and Jinja2-style
//! templating, executed over pluggable transports.
//!
//! ## Core concepts
//!
//! - **Inventory**: hosts and groups with variables, from a line-oriented
//!   sections format or a YAML tree, plus `group_vars/` and `host_vars/`
//!   overlays
//! - **Playbook**: an ordered sequence of plays, each binding a host
//!   pattern to ordered task lists and handlers
//! - **Modules**: the units of work tasks invoke, from `command` to
//!   `win_copy`
//! - **Transports**: a uniform connection contract with local, SSH, and
//!   Windows remote shell implementations
//! - **Runner**: the linear-strategy scheduler fanning every task across
//!   eligible hosts under a bounded concurrency limit
//!
//! ## Quick example
//!
//! ```rust,ignore
//! use stagehand::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let inventory = Inventory::load("inventory/hosts")?;
//!     let playbook = Playbook::load("site.yml")?;
//!
//!     let mut runner = PlaybookRunner::new(inventory, RunnerOptions::default());
//!     runner.add_callback(Box::new(DefaultCallback::new(0, false)));
//!
//!     let report = runner.run(&playbook).await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(clippy::all)]

pub mod callback;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod executor;
pub mod inventory;
pub mod lookup;
pub mod modules;
pub mod playbook;
pub mod template;
pub mod vars;
pub mod vault;

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    pub use crate::callback::{Callback, DefaultCallback, JsonCallback};
    pub use crate::connection::{
        CommandResult, Connection, ConnectionDefaults, ConnectionError, ConnectionManager,
        ConnectionResult, ExecuteOptions, FileStat, HostKeyPolicy, ShellKind, TransferOptions,
    };
    pub use crate::error::{Error, Result};
    pub use crate::executor::{
        HostStats, PlaybookRunner, RunReport, RunnerOptions, TaskResult, TaskStatus,
    };
    pub use crate::inventory::{Group, Host, Inventory, Transport};
    pub use crate::modules::{Module, ModuleOutput, ModuleRegistry, ModuleStatus};
    pub use crate::playbook::{Block, Handler, Play, Playbook, Task, TaskNode};
    pub use crate::template::TemplateEngine;
    pub use crate::vars::{VarPrecedence, VarStore};
    pub use crate::vault::Vault;
}

/// The crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
