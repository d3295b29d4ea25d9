//! Command-line interface.

use clap::Parser;
use std::path::PathBuf;

/// Run playbooks against an inventory.
#[derive(Debug, Parser)]
#[command(
    name = "stagehand",
    version,
    about = "A minimal, async-first configuration-management runner",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Playbook file(s), executed in order
    #[arg(required = true, value_name = "PLAYBOOK")]
    pub playbooks: Vec<PathBuf>,

    /// Inventory path (file or directory)
    #[arg(short, long, env = "ANSIBLE_INVENTORY", value_name = "PATH")]
    pub inventory: Option<PathBuf>,

    /// Restrict selection to hosts matching this pattern
    #[arg(short, long, value_name = "PATTERN")]
    pub limit: Option<String>,

    /// Extra variables (key=value, JSON/YAML, or @file); highest priority
    #[arg(short, long = "extra-vars", value_name = "VARS")]
    pub extra_vars: Vec<String>,

    /// Number of hosts to run on in parallel
    #[arg(short, long, env = "ANSIBLE_FORKS", default_value_t = 5)]
    pub forks: usize,

    /// Dry run: report would-change without mutating remote state
    #[arg(short = 'C', long)]
    pub check: bool,

    /// Attach file diffs to change reports
    #[arg(short = 'D', long)]
    pub diff: bool,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Human)]
    pub output: OutputFormat,

    /// Only run tasks tagged with one of these (comma-separated)
    #[arg(short, long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Skip tasks tagged with one of these (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub skip_tags: Vec<String>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Read the vault password from this file
    #[arg(long, env = "ANSIBLE_VAULT_PASSWORD_FILE", value_name = "PATH")]
    pub vault_password_file: Option<PathBuf>,

    /// Prompt for the vault password
    #[arg(long)]
    pub ask_vault_pass: bool,

    /// Remote user
    #[arg(short = 'u', long = "user", env = "ANSIBLE_REMOTE_USER")]
    pub remote_user: Option<String>,

    /// Transport override for every host (local, ssh, winrm)
    #[arg(short = 'c', long = "connection")]
    pub connection: Option<String>,

    /// Per-command timeout in seconds
    #[arg(short = 'T', long, env = "ANSIBLE_TIMEOUT")]
    pub timeout: Option<u64>,

    /// SSH private key file
    #[arg(long, env = "ANSIBLE_PRIVATE_KEY_FILE", value_name = "PATH")]
    pub private_key: Option<PathBuf>,

    /// SSH host key policy (strict, accept-new, insecure)
    #[arg(long, env = "ANSIBLE_HOST_KEY_CHECKING", value_name = "POLICY")]
    pub host_key_policy: Option<String>,

    /// Escalate privileges for every task
    #[arg(short = 'b', long = "become", env = "ANSIBLE_BECOME")]
    pub r#become: bool,

    /// User to escalate to
    #[arg(long, env = "ANSIBLE_BECOME_USER")]
    pub become_user: Option<String>,

    /// Escalation method (sudo, su, runas)
    #[arg(long, env = "ANSIBLE_BECOME_METHOD")]
    pub become_method: Option<String>,

    /// Prompt for the escalation password
    #[arg(short = 'K', long)]
    pub ask_become_pass: bool,

    /// Run notified handlers even on failed hosts
    #[arg(long)]
    pub force_handlers: bool,

    /// List matched hosts per play and exit; contacts no host
    #[arg(long)]
    pub list_hosts: bool,

    /// List tasks per play and exit; contacts no host
    #[arg(long)]
    pub list_tasks: bool,

    /// List tags per play and exit; contacts no host
    #[arg(long)]
    pub list_tags: bool,

    /// Parse the playbook and inventory, then exit; contacts no host
    #[arg(long)]
    pub syntax_check: bool,

    /// Configuration file path
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

/// Output stream selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Colored per-host status lines plus the recap table
    Human,
    /// One machine-readable JSON document at the end of the run
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Human => write!(f, "human"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl Cli {
    /// True when the invocation is a diagnostic dry run that must never
    /// contact a host.
    pub fn is_diagnostic(&self) -> bool {
        self.list_hosts || self.list_tasks || self.list_tags || self.syntax_check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_invocation() {
        let cli = Cli::parse_from(["stagehand", "site.yml"]);
        assert_eq!(cli.playbooks, vec![PathBuf::from("site.yml")]);
        assert_eq!(cli.forks, 5);
        assert!(!cli.check);
        assert!(!cli.is_diagnostic());
    }

    #[test]
    fn test_full_invocation() {
        let cli = Cli::parse_from([
            "stagehand",
            "-i",
            "hosts",
            "-l",
            "web*",
            "-e",
            "env=prod",
            "-f",
            "20",
            "-C",
            "-D",
            "-t",
            "deploy,config",
            "-vv",
            "-b",
            "--become-user",
            "svc",
            "site.yml",
            "extra.yml",
        ]);
        assert_eq!(cli.playbooks.len(), 2);
        assert_eq!(cli.forks, 20);
        assert_eq!(cli.tags, vec!["deploy", "config"]);
        assert_eq!(cli.verbose, 2);
        assert!(cli.check && cli.diff && cli.r#become);
        assert_eq!(cli.become_user.as_deref(), Some("svc"));
    }

    #[test]
    fn test_diagnostic_flags() {
        let cli = Cli::parse_from(["stagehand", "--syntax-check", "site.yml"]);
        assert!(cli.is_diagnostic());
    }
}
