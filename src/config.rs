//! Runner configuration file.
//!
//! A small TOML file provides lowest-priority defaults, below environment
//! variables, below command-line flags. Looked up at `./stagehand.cfg`,
//! then `~/.stagehand.cfg`, unless an explicit path is given.
//!
//! Environment variables consulted (all optional, all overridable by
//! flags): `ANSIBLE_INVENTORY`, `ANSIBLE_FORKS`, `ANSIBLE_REMOTE_USER`,
//! `ANSIBLE_PRIVATE_KEY_FILE`, `ANSIBLE_TIMEOUT`,
//! `ANSIBLE_HOST_KEY_CHECKING`, `ANSIBLE_BECOME`, `ANSIBLE_BECOME_USER`,
//! `ANSIBLE_BECOME_METHOD`, `ANSIBLE_VAULT_PASSWORD_FILE`. Everything
//! else in the environment is ignored.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Parsed configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// `[defaults]` section
    #[serde(default)]
    pub defaults: Defaults,
    /// `[privilege_escalation]` section
    #[serde(default)]
    pub privilege_escalation: PrivilegeEscalation,
    /// `[ssh]` section
    #[serde(default)]
    pub ssh: SshSection,
}

/// `[defaults]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    /// Default inventory path
    pub inventory: Option<String>,
    /// Default forks
    pub forks: Option<usize>,
    /// Default per-command timeout in seconds
    pub timeout: Option<u64>,
    /// Default remote user
    pub remote_user: Option<String>,
}

/// `[privilege_escalation]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivilegeEscalation {
    #[serde(default)]
    pub r#become: bool,
    pub become_method: Option<String>,
    pub become_user: Option<String>,
}

/// `[ssh]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SshSection {
    /// Host key policy: strict, accept-new, or insecure
    pub host_key_policy: Option<String>,
    /// Default private key path
    pub private_key_file: Option<String>,
}

impl Config {
    /// Load from an explicit path, or probe the conventional locations.
    /// A missing file yields the default configuration.
    pub fn load(explicit: Option<&Path>) -> Result<Self, String> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Self::probe(),
        };

        let Some(path) = path else {
            return Ok(Self::default());
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        toml::from_str(&content).map_err(|e| format!("invalid config {}: {}", path.display(), e))
    }

    fn probe() -> Option<PathBuf> {
        let local = PathBuf::from("stagehand.cfg");
        if local.is_file() {
            return Some(local);
        }
        if let Some(home) = std::env::var_os("HOME") {
            let user = PathBuf::from(home).join(".stagehand.cfg");
            if user.is_file() {
                return Some(user);
            }
        }
        None
    }
}
