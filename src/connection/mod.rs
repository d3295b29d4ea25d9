//! Transport layer for host communication.
//!
//! Every transport implements the [`Connection`] contract: execute a
//! command, transfer files, query metadata, tear down. Implementations
//! exist for local subprocesses, SSH, and the Windows remote shell. The
//! [`ConnectionManager`] creates connections lazily per host, caches them
//! for the remainder of the play, and bounds the total number of open
//! transports.
//!
//! Transports never retry work on their own; only connection
//! establishment is retried, a small fixed number of times with
//! exponential backoff and jitter.

pub mod local;
#[cfg(feature = "ssh")]
pub mod ssh;
pub mod winrm;

use crate::inventory::{Host, Transport};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Maximum connect attempts for transient establishment failures.
pub const CONNECT_ATTEMPTS: u32 = 3;

/// Base delay for connect retries.
pub const CONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Default bound on simultaneously open connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;

/// Errors that can occur during connection operations.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Could not establish the initial connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The remote side rejected our credentials.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// An established session went away.
    #[error("session lost: {0}")]
    SessionLost(String),

    /// The command could not be started (distinct from a non-zero exit).
    #[error("command execution failed: {0}")]
    ExecutionFailed(String),

    /// A file upload or download failed.
    #[error("file transfer failed: {0}")]
    TransferFailed(String),

    /// The operation ran past its deadline.
    #[error("timed out after {0} seconds")]
    Timeout(u64),

    /// The transport cannot perform the requested operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration is invalid or incomplete.
    #[error("invalid connection configuration: {0}")]
    InvalidConfig(String),

    /// The open-connection bound was reached.
    #[error("connection limit reached ({0} open)")]
    LimitReached(usize),

    /// IO error during connection operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConnectionError {
    /// Whether this error means the host is unreachable (connect, auth, or
    /// session failure) rather than a command that ran and failed. The
    /// runner's host state machine branches on this.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ConnectionError::ConnectionFailed(_)
                | ConnectionError::AuthenticationFailed(_)
                | ConnectionError::SessionLost(_)
        )
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// How a command line should be interpreted on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShellKind {
    /// POSIX shell (`sh -c`)
    #[default]
    Posix,
    /// PowerShell (Windows transports)
    PowerShell,
    /// No shell: the command is split into argv and executed directly
    None,
}

/// The result of executing a command on a connection.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code (0 is success)
    pub rc: i32,
    /// Captured standard output
    pub stdout: String,
    /// Captured standard error
    pub stderr: String,
}

impl CommandResult {
    /// Create a successful result.
    pub fn success(stdout: String, stderr: String) -> Self {
        Self {
            rc: 0,
            stdout,
            stderr,
        }
    }

    /// Create a failed result.
    pub fn failure(rc: i32, stdout: String, stderr: String) -> Self {
        Self { rc, stdout, stderr }
    }

    /// True when the exit code is zero.
    pub fn success_rc(&self) -> bool {
        self.rc == 0
    }
}

/// Options for command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// How to interpret the command line
    pub shell: ShellKind,
    /// Working directory
    pub cwd: Option<String>,
    /// Environment variables to set
    pub env: HashMap<String, String>,
    /// Timeout in seconds (None for no timeout)
    pub timeout: Option<u64>,
    /// Payload to feed on stdin
    pub stdin: Option<String>,
    /// Run with privilege escalation
    pub escalate: bool,
    /// User to escalate to (root / Administrator when unset)
    pub escalate_user: Option<String>,
    /// Escalation method (sudo, su, runas)
    pub escalate_method: Option<String>,
    /// Escalation password, fed through stdin, never on the command line
    pub escalate_password: Option<String>,
}

impl ExecuteOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the shell kind.
    pub fn with_shell(mut self, shell: ShellKind) -> Self {
        self.shell = shell;
        self
    }

    /// Set the working directory.
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the timeout in seconds.
    pub fn with_timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable privilege escalation.
    pub fn with_escalation(mut self, user: Option<String>) -> Self {
        self.escalate = true;
        self.escalate_user = user;
        self
    }
}

/// Options for file transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    /// File mode to apply (best effort on Windows)
    pub mode: Option<u32>,
    /// Create parent directories as needed
    pub create_dirs: bool,
}

/// File metadata returned by [`Connection::stat`].
#[derive(Debug, Clone, Default)]
pub struct FileStat {
    /// Whether the path exists at all
    pub exists: bool,
    /// Directory?
    pub is_dir: bool,
    /// Regular file?
    pub is_file: bool,
    /// Symlink?
    pub is_symlink: bool,
    /// Size in bytes
    pub size: u64,
    /// Modification time (Unix timestamp)
    pub mtime: i64,
    /// Permission bits where the platform has them
    pub mode: Option<u32>,
    /// SHA-256 checksum of regular files, when cheap to compute
    pub checksum: Option<String>,
}

impl FileStat {
    /// The stat of a path that does not exist.
    pub fn missing() -> Self {
        Self::default()
    }
}

/// The transport contract.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Identifier for logs (host name or address).
    fn identifier(&self) -> &str;

    /// Cheap liveness check for cached connections.
    async fn is_alive(&self) -> bool;

    /// Execute a single command.
    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult>;

    /// Upload a local file.
    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Upload a byte buffer.
    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()>;

    /// Download a remote file.
    async fn download(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()>;

    /// Download a remote file into memory.
    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>>;

    /// Create a directory, parents included.
    async fn mkdir(&self, remote_path: &Path, mode: Option<u32>) -> ConnectionResult<()>;

    /// Query file metadata. A missing path yields `FileStat::missing()`,
    /// not an error.
    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat>;

    /// Tear down the connection; idempotent.
    async fn close(&self) -> ConnectionResult<()>;
}

/// Process-wide defaults applied when a host does not specify its own
/// connection parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDefaults {
    /// Remote user override from the CLI
    pub remote_user: Option<String>,
    /// Private key path from the CLI
    pub private_key: Option<String>,
    /// Connect timeout in seconds
    pub timeout: Option<u64>,
    /// Transport override from the CLI
    pub transport: Option<Transport>,
    /// SSH host key policy
    pub host_key_policy: HostKeyPolicy,
}

/// Host key verification policy for SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HostKeyPolicy {
    /// Reject unknown hosts
    Strict,
    /// Accept unknown hosts on first contact, reject key changes
    #[default]
    AcceptNew,
    /// Accept anything
    Insecure,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(HostKeyPolicy::Strict),
            "accept-new" | "accept_new" => Ok(HostKeyPolicy::AcceptNew),
            "insecure" | "none" => Ok(HostKeyPolicy::Insecure),
            other => Err(format!("unknown host key policy '{}'", other)),
        }
    }
}

/// Creates, caches, and closes connections. One connection per host,
/// created on first use, reused for the rest of the play.
pub struct ConnectionManager {
    defaults: ConnectionDefaults,
    cache: Mutex<HashMap<String, Arc<dyn Connection>>>,
    max_connections: usize,
}

impl ConnectionManager {
    /// Create a manager with the given defaults and the standard
    /// connection bound.
    pub fn new(defaults: ConnectionDefaults) -> Self {
        Self::with_limit(defaults, DEFAULT_MAX_CONNECTIONS)
    }

    /// Create a manager with an explicit connection bound.
    pub fn with_limit(defaults: ConnectionDefaults, max_connections: usize) -> Self {
        Self {
            defaults,
            cache: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    /// The configured connection bound.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Get the cached connection for a host, establishing it on first use.
    /// Establishment retries up to [`CONNECT_ATTEMPTS`] times with
    /// exponential backoff and 0-25% jitter.
    pub async fn get(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        {
            let cache = self.cache.lock().await;
            if let Some(conn) = cache.get(&host.name) {
                if conn.is_alive().await {
                    return Ok(Arc::clone(conn));
                }
            }
        }

        let conn = self.connect_with_retry(host).await?;

        let mut cache = self.cache.lock().await;
        if cache.len() >= self.max_connections && !cache.contains_key(&host.name) {
            return Err(ConnectionError::LimitReached(cache.len()));
        }
        cache.insert(host.name.clone(), Arc::clone(&conn));
        Ok(conn)
    }

    /// Drop a host's cached connection (after it became unreachable).
    pub async fn discard(&self, host_name: &str) {
        let conn = self.cache.lock().await.remove(host_name);
        if let Some(conn) = conn {
            let _ = conn.close().await;
        }
    }

    /// Close every cached connection.
    pub async fn close_all(&self) {
        let connections: Vec<_> = self.cache.lock().await.drain().map(|(_, c)| c).collect();
        for conn in connections {
            let _ = conn.close().await;
        }
    }

    async fn connect_with_retry(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        let mut last_error = None;

        for attempt in 0..CONNECT_ATTEMPTS {
            if attempt > 0 {
                let backoff = CONNECT_BACKOFF_BASE * 2u32.pow(attempt - 1);
                let jitter = rand::thread_rng().gen_range(0.0..=0.25);
                let delay = backoff.mul_f64(1.0 + jitter);
                debug!(host = %host.name, attempt, delay = ?delay, "retrying connect");
                tokio::time::sleep(delay).await;
            }

            match self.connect(host).await {
                Ok(conn) => return Ok(conn),
                Err(e) if e.is_unreachable() => {
                    warn!(host = %host.name, attempt, error = %e, "connect attempt failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error
            .unwrap_or_else(|| ConnectionError::ConnectionFailed("no attempts made".to_string())))
    }

    async fn connect(&self, host: &Host) -> ConnectionResult<Arc<dyn Connection>> {
        let transport = self
            .defaults
            .transport
            .unwrap_or(host.connection.transport);

        match transport {
            Transport::Local => Ok(Arc::new(local::LocalConnection::new())),
            Transport::Winrm => {
                let conn = winrm::WinRmConnection::connect(host, &self.defaults).await?;
                Ok(Arc::new(conn))
            }
            Transport::Ssh => {
                #[cfg(feature = "ssh")]
                {
                    let conn = ssh::SshConnection::connect(host, &self.defaults).await?;
                    Ok(Arc::new(conn))
                }
                #[cfg(not(feature = "ssh"))]
                {
                    Err(ConnectionError::InvalidConfig(
                        "built without the 'ssh' feature".to_string(),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_result() {
        let ok = CommandResult::success("out".into(), String::new());
        assert!(ok.success_rc());
        let bad = CommandResult::failure(2, String::new(), "err".into());
        assert!(!bad.success_rc());
        assert_eq!(bad.rc, 2);
    }

    #[test]
    fn test_unreachable_classification() {
        assert!(ConnectionError::ConnectionFailed("x".into()).is_unreachable());
        assert!(ConnectionError::AuthenticationFailed("x".into()).is_unreachable());
        assert!(ConnectionError::SessionLost("x".into()).is_unreachable());
        assert!(!ConnectionError::ExecutionFailed("x".into()).is_unreachable());
        assert!(!ConnectionError::Timeout(5).is_unreachable());
    }

    #[test]
    fn test_host_key_policy_parse() {
        assert_eq!(
            "accept-new".parse::<HostKeyPolicy>().unwrap(),
            HostKeyPolicy::AcceptNew
        );
        assert_eq!(
            "strict".parse::<HostKeyPolicy>().unwrap(),
            HostKeyPolicy::Strict
        );
        assert!("bogus".parse::<HostKeyPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_manager_caches_local_connections() {
        let mut host = Host::new("localhost");
        host.connection.transport = Transport::Local;

        let manager = ConnectionManager::new(ConnectionDefaults::default());
        let first = manager.get(&host).await.unwrap();
        let second = manager.get(&host).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_manager_connection_limit() {
        let manager = ConnectionManager::with_limit(ConnectionDefaults::default(), 1);

        let mut a = Host::new("a");
        a.connection.transport = Transport::Local;
        let mut b = Host::new("b");
        b.connection.transport = Transport::Local;

        manager.get(&a).await.unwrap();
        let result = manager.get(&b).await;
        assert!(matches!(result, Err(ConnectionError::LimitReached(_))));
    }
}
