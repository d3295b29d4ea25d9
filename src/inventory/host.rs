//! Host definition for the stagehand inventory.
//!
//! A [`Host`] carries a stable name, addressing, a transport selector,
//! credentials, and host-scoped variables. Hosts are constructed by the
//! inventory parse and immutable afterwards; runtime state (registered
//! results, facts) lives in the runner's per-host context instead.

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport selector for a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// SSH connection (default)
    #[default]
    Ssh,
    /// Child process on the control node
    Local,
    /// Windows remote shell
    Winrm,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Ssh => write!(f, "ssh"),
            Transport::Local => write!(f, "local"),
            Transport::Winrm => write!(f, "winrm"),
        }
    }
}

impl std::str::FromStr for Transport {
    type Err = HostParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ssh" | "smart" => Ok(Transport::Ssh),
            "local" => Ok(Transport::Local),
            "winrm" => Ok(Transport::Winrm),
            other => Err(HostParseError::InvalidTransport(other.to_string())),
        }
    }
}

/// Connection parameters for a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConnectionParams {
    /// Transport selector
    #[serde(default)]
    pub transport: Transport,

    /// Port override (22 for ssh, 5985 for winrm when unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Remote user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Password (keys are preferred)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Private key file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<String>,

    /// Remote shell executable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell_executable: Option<String>,

    /// Privilege escalation enabled by inventory
    #[serde(default)]
    pub r#become: bool,

    /// Privilege escalation method (sudo, su, runas)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub become_method: Option<String>,

    /// Privilege escalation target user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub become_user: Option<String>,

    /// Privilege escalation password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub become_password: Option<String>,
}

/// A managed host in the inventory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Host name (hostname, IP, or alias); unique within the inventory
    pub name: String,

    /// Address to connect to when it differs from the name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Connection parameters
    #[serde(flatten)]
    pub connection: ConnectionParams,

    /// Host-scoped variables from the inventory source
    #[serde(default)]
    pub vars: IndexMap<String, Value>,

    /// Groups this host belongs to, in the order it joined them
    #[serde(skip)]
    pub groups: IndexSet<String>,
}

impl Host {
    /// Create a new host with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            connection: ConnectionParams::default(),
            vars: IndexMap::new(),
            groups: IndexSet::new(),
        }
    }

    /// The address to connect to.
    pub fn address(&self) -> &str {
        self.address.as_deref().unwrap_or(&self.name)
    }

    /// Set a host-scoped variable.
    pub fn set_var(&mut self, key: impl Into<String>, value: Value) {
        self.vars.insert(key.into(), value);
    }

    /// Merge variables from another source; the other side wins.
    pub fn merge_vars(&mut self, other: &IndexMap<String, Value>) {
        for (key, value) in other {
            self.vars.insert(key.clone(), value.clone());
        }
    }

    /// Add this host to a group.
    pub fn add_to_group(&mut self, group: impl Into<String>) {
        self.groups.insert(group.into());
    }

    /// Check if the host belongs to a group.
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.contains(group)
    }

    /// Apply a `key=value` pair from a host line or a vars mapping,
    /// recognizing the conventional `ansible_*` connection keys and storing
    /// everything else as a plain variable.
    pub fn apply_var(&mut self, key: &str, value: Value) -> Result<(), HostParseError> {
        let as_str = || value.as_str().map(str::to_string);
        match key {
            "ansible_host" => self.address = as_str(),
            "ansible_port" => {
                let port = match &value {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                };
                self.connection.port = Some(
                    port.and_then(|p| u16::try_from(p).ok())
                        .ok_or_else(|| HostParseError::InvalidPort(value.to_string()))?,
                );
            }
            "ansible_user" => self.connection.user = as_str(),
            "ansible_password" | "ansible_ssh_pass" => self.connection.password = as_str(),
            "ansible_ssh_private_key_file" | "ansible_private_key_file" => {
                self.connection.private_key_file = as_str()
            }
            "ansible_shell_executable" => self.connection.shell_executable = as_str(),
            "ansible_connection" => {
                let s =
                    as_str().ok_or_else(|| HostParseError::InvalidTransport(value.to_string()))?;
                self.connection.transport = s.parse()?;
            }
            "ansible_become" => self.connection.r#become = truthy(&value),
            "ansible_become_method" => self.connection.become_method = as_str(),
            "ansible_become_user" => self.connection.become_user = as_str(),
            "ansible_become_password" | "ansible_become_pass" => {
                self.connection.become_password = as_str()
            }
            _ => {
                self.vars.insert(key.to_string(), value);
            }
        }
        Ok(())
    }

    /// Parse a host line: `name [key=value ...]`. Values with spaces need
    /// matching quotes, and values take the same scalar typing as
    /// `[group:vars]` entries. The name may contain range brackets;
    /// expansion happens in the inventory parser, not here.
    pub fn parse(input: &str) -> Result<Self, HostParseError> {
        let parts = shell_words::split(input).map_err(|_| HostParseError::UnbalancedQuotes)?;
        let mut parts = parts.into_iter();
        let name = parts.next().ok_or(HostParseError::EmptyInput)?;

        let mut host = Host::new(name);
        for part in parts {
            match part.split_once('=') {
                Some((key, value)) => host.apply_var(key, super::parse_scalar(value))?,
                None => return Err(HostParseError::NotKeyValue(part)),
            }
        }

        Ok(host)
    }
}

/// Loose YAML-style truthiness for inventory values.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|i| i != 0).unwrap_or(false),
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "yes" | "on" | "1"),
        _ => false,
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Host {}

impl std::hash::Hash for Host {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(addr) = &self.address {
            write!(f, " ({})", addr)?;
        }
        Ok(())
    }
}

/// Errors that can occur when parsing a host line.
#[derive(Debug, thiserror::Error)]
pub enum HostParseError {
    #[error("empty host line")]
    EmptyInput,
    #[error("unbalanced quotes in host line")]
    UnbalancedQuotes,
    #[error("expected key=value, got '{0}'")]
    NotKeyValue(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("invalid connection transport: {0}")]
    InvalidTransport(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_host_new() {
        let host = Host::new("web1");
        assert_eq!(host.name, "web1");
        assert_eq!(host.address(), "web1");
        assert_eq!(host.connection.transport, Transport::Ssh);
    }

    #[test]
    fn test_host_parse_connection_keys() {
        let host = Host::parse(
            "web1 ansible_host=10.0.0.1 ansible_port=2222 ansible_user=admin ansible_connection=ssh",
        )
        .unwrap();
        assert_eq!(host.name, "web1");
        assert_eq!(host.address(), "10.0.0.1");
        assert_eq!(host.connection.port, Some(2222));
        assert_eq!(host.connection.user.as_deref(), Some("admin"));
    }

    #[test]
    fn test_host_parse_quoted_value() {
        let host = Host::parse(r#"web1 greeting="hello there""#).unwrap();
        assert_eq!(host.vars.get("greeting"), Some(&json!("hello there")));
    }

    #[test]
    fn test_host_parse_winrm() {
        let host = Host::parse("win1 ansible_connection=winrm ansible_password=secret").unwrap();
        assert_eq!(host.connection.transport, Transport::Winrm);
        assert_eq!(host.connection.password.as_deref(), Some("secret"));
    }

    #[test]
    fn test_host_parse_invalid_port() {
        assert!(Host::parse("web1 ansible_port=banana").is_err());
    }

    #[test]
    fn test_plain_var_typed_like_group_vars() {
        let host = Host::parse("web1 http_port=80 weight=1.5 fast=yes region=east").unwrap();
        assert_eq!(host.vars.get("http_port"), Some(&json!(80)));
        assert_eq!(host.vars.get("weight"), Some(&json!(1.5)));
        assert_eq!(host.vars.get("fast"), Some(&json!(true)));
        assert_eq!(host.vars.get("region"), Some(&json!("east")));
    }
}
