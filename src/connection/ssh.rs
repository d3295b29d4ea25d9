//! SSH transport built on russh.
//!
//! One session is established per host and reused for the duration of a
//! play. Authentication order: agent identities, then an explicit key
//! file, then password. File transfer goes through the SFTP subsystem.

use async_trait::async_trait;
use russh::client::{self, Handle, Handler};
use russh::keys::key::{parse_public_key, PublicKey};
use russh::keys::load_secret_key;
use russh::ChannelMsg;
use russh_keys::agent::client::AgentClient;
use russh_sftp::client::SftpSession;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

use super::{
    CommandResult, Connection, ConnectionDefaults, ConnectionError, ConnectionResult,
    ExecuteOptions, FileStat, HostKeyPolicy, ShellKind, TransferOptions,
};
use crate::inventory::Host;

/// Default connect timeout when nothing is configured.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Wrapper so the russh handler error satisfies the trait bounds.
#[derive(Debug)]
pub struct SshHandlerError(pub russh::Error);

impl From<russh::Error> for SshHandlerError {
    fn from(err: russh::Error) -> Self {
        SshHandlerError(err)
    }
}

impl std::fmt::Display for SshHandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ssh error: {}", self.0)
    }
}

impl std::error::Error for SshHandlerError {}

impl From<russh::Error> for ConnectionError {
    fn from(err: russh::Error) -> Self {
        ConnectionError::SessionLost(err.to_string())
    }
}

impl From<russh_sftp::client::error::Error> for ConnectionError {
    fn from(err: russh_sftp::client::error::Error) -> Self {
        ConnectionError::TransferFailed(format!("sftp: {}", err))
    }
}

/// Client handler implementing the host key policy against
/// `~/.ssh/known_hosts`.
struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_keys: Vec<PublicKey>,
}

impl ClientHandler {
    fn new(host: &str, port: u16, policy: HostKeyPolicy) -> Self {
        Self {
            host: host.to_string(),
            port,
            known_keys: Self::load_known_keys(host, port),
            policy,
        }
    }

    /// Keys from known_hosts whose hostname field matches this endpoint.
    fn load_known_keys(host: &str, port: u16) -> Vec<PublicKey> {
        let Some(home) = std::env::var_os("HOME") else {
            return Vec::new();
        };
        let path = PathBuf::from(home).join(".ssh").join("known_hosts");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Vec::new();
        };

        let mut keys = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let (Some(patterns), Some(_keytype), Some(key_b64)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };

            let matches_host = patterns.split(',').any(|pattern| {
                if let Some(rest) = pattern.strip_prefix('[') {
                    if let Some((h, p)) = rest.split_once("]:") {
                        return h == host && p.parse() == Ok(port);
                    }
                }
                port == 22 && pattern == host
            });
            if !matches_host {
                continue;
            }

            use base64::Engine as _;
            if let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(key_b64) {
                if let Ok(key) = parse_public_key(&bytes, None) {
                    keys.push(key);
                }
            }
        }
        keys
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = SshHandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        if self.policy == HostKeyPolicy::Insecure {
            return Ok(true);
        }

        if self.known_keys.is_empty() {
            return match self.policy {
                HostKeyPolicy::AcceptNew => {
                    debug!(host = %self.host, port = self.port, "unknown host key accepted");
                    Ok(true)
                }
                _ => {
                    warn!(host = %self.host, "unknown host rejected by strict host key policy");
                    Ok(false)
                }
            };
        }

        let fingerprint = server_public_key.fingerprint();
        let matched = self
            .known_keys
            .iter()
            .any(|key| key.fingerprint() == fingerprint);
        if !matched {
            warn!(host = %self.host, "server key does not match known_hosts entry");
        }
        Ok(matched)
    }
}

/// SSH connection to a single host.
pub struct SshConnection {
    identifier: String,
    handle: Arc<RwLock<Option<Handle<ClientHandler>>>>,
}

impl SshConnection {
    /// Establish a session to the host using the inventory parameters,
    /// falling back to process-wide defaults.
    pub async fn connect(host: &Host, defaults: &ConnectionDefaults) -> ConnectionResult<Self> {
        let address = host.address().to_string();
        let port = host.connection.port.unwrap_or(22);
        let user = host
            .connection
            .user
            .clone()
            .or_else(|| defaults.remote_user.clone())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        let timeout = defaults
            .timeout
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        debug!(host = %address, port, user = %user, "connecting via ssh");

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        });

        let socket = tokio::time::timeout(
            timeout,
            tokio::net::TcpStream::connect((address.as_str(), port)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(timeout.as_secs()))?
        .map_err(|e| {
            ConnectionError::ConnectionFailed(format!("connect {}:{}: {}", address, port, e))
        })?;
        socket.set_nodelay(true).ok();

        let handler = ClientHandler::new(&address, port, defaults.host_key_policy);
        let mut session = client::connect_stream(config, socket, handler)
            .await
            .map_err(|e| ConnectionError::ConnectionFailed(format!("handshake: {}", e.0)))?;

        Self::authenticate(&mut session, &user, host, defaults).await?;

        Ok(Self {
            identifier: format!("{}@{}:{}", user, address, port),
            handle: Arc::new(RwLock::new(Some(session))),
        })
    }

    /// Agent identities, then configured key files, then password.
    async fn authenticate(
        session: &mut Handle<ClientHandler>,
        user: &str,
        host: &Host,
        defaults: &ConnectionDefaults,
    ) -> ConnectionResult<()> {
        if Self::try_agent_auth(session, user).await {
            debug!("authenticated via ssh agent");
            return Ok(());
        }

        let mut key_candidates: Vec<String> = Vec::new();
        if let Some(key) = &host.connection.private_key_file {
            key_candidates.push(key.clone());
        }
        if let Some(key) = &defaults.private_key {
            key_candidates.push(key.clone());
        }
        key_candidates.push("~/.ssh/id_ed25519".to_string());
        key_candidates.push("~/.ssh/id_rsa".to_string());

        for candidate in key_candidates {
            let path = PathBuf::from(shellexpand::tilde(&candidate).to_string());
            if !path.exists() {
                continue;
            }
            match Self::try_key_auth(session, user, &path).await {
                Ok(true) => {
                    debug!(key = %path.display(), "authenticated via key");
                    return Ok(());
                }
                Ok(false) => trace!(key = %path.display(), "key rejected"),
                Err(e) => trace!(key = %path.display(), error = %e, "key unusable"),
            }
        }

        if let Some(password) = &host.connection.password {
            let authenticated = session
                .authenticate_password(user, password)
                .await
                .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))?;
            if authenticated {
                debug!("authenticated via password");
                return Ok(());
            }
        }

        Err(ConnectionError::AuthenticationFailed(format!(
            "all authentication methods failed for {}",
            user
        )))
    }

    async fn try_agent_auth(session: &mut Handle<ClientHandler>, user: &str) -> bool {
        let Ok(mut agent) = AgentClient::connect_env().await else {
            return false;
        };
        let Ok(identities) = agent.request_identities().await else {
            return false;
        };

        for identity in identities {
            let (returned, result) = session
                .authenticate_future(user, identity.clone(), agent)
                .await;
            agent = returned;
            if matches!(result, Ok(true)) {
                return true;
            }
        }
        false
    }

    async fn try_key_auth(
        session: &mut Handle<ClientHandler>,
        user: &str,
        key_path: &Path,
    ) -> ConnectionResult<bool> {
        let key_pair = load_secret_key(key_path, None)
            .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))?;
        session
            .authenticate_publickey(user, Arc::new(key_pair))
            .await
            .map_err(|e| ConnectionError::AuthenticationFailed(e.to_string()))
    }

    /// Build the remote command line: environment exports, cwd, optional
    /// escalation prefix. The escalation password, when present, travels
    /// over the channel's stdin.
    fn build_command(command: &str, options: &ExecuteOptions) -> String {
        let mut parts = Vec::new();

        for (key, value) in &options.env {
            parts.push(format!(
                "export {}={}; ",
                key,
                shell_words::quote(value)
            ));
        }
        if let Some(cwd) = &options.cwd {
            parts.push(format!("cd {} && ", shell_words::quote(cwd)));
        }

        if options.escalate {
            let method = options.escalate_method.as_deref().unwrap_or("sudo");
            let user = options.escalate_user.as_deref().unwrap_or("root");
            match method {
                "su" => {
                    parts.push(format!(
                        "su - {} -c {}",
                        user,
                        shell_words::quote(command)
                    ));
                }
                _ => {
                    let stdin_flag = if options.escalate_password.is_some() {
                        "-S -p '' "
                    } else {
                        "-n "
                    };
                    parts.push(format!(
                        "sudo {}-u {} -- sh -c {}",
                        stdin_flag,
                        user,
                        shell_words::quote(command)
                    ));
                }
            }
        } else {
            parts.push(command.to_string());
        }

        parts.concat()
    }

    async fn open_sftp(&self) -> ConnectionResult<SftpSession> {
        let guard = self.handle.read().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| ConnectionError::SessionLost("connection closed".to_string()))?;
        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectionError::SessionLost(format!("open channel: {}", e)))?;
        drop(guard);
        SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("sftp subsystem: {}", e)))
    }

    async fn sftp_mkdir_parents(sftp: &SftpSession, path: &Path) -> ConnectionResult<()> {
        let mut current = PathBuf::new();
        for component in path.components() {
            current.push(component);
            let s = current.to_string_lossy().to_string();
            if s.is_empty() || s == "/" {
                continue;
            }
            match sftp.metadata(&s).await {
                Ok(_) => continue,
                Err(_) => {
                    // Racing another worker is fine; re-stat on failure.
                    if sftp.create_dir(&s).await.is_err() && sftp.metadata(&s).await.is_err() {
                        return Err(ConnectionError::TransferFailed(format!(
                            "mkdir {} failed",
                            s
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for SshConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        self.handle.read().await.is_some()
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        let full_command = match options.shell {
            ShellKind::Posix | ShellKind::PowerShell | ShellKind::None => {
                Self::build_command(command, &options)
            }
        };
        trace!(command = %full_command, "executing remote command");

        let run = async {
            let guard = self.handle.read().await;
            let handle = guard
                .as_ref()
                .ok_or_else(|| ConnectionError::SessionLost("connection closed".to_string()))?;
            let mut channel = handle
                .channel_open_session()
                .await
                .map_err(|e| ConnectionError::SessionLost(format!("open channel: {}", e)))?;
            drop(guard);

            channel
                .exec(true, full_command.as_str())
                .await
                .map_err(|e| ConnectionError::ExecutionFailed(format!("exec: {}", e)))?;

            let mut stdin_payload = String::new();
            if options.escalate {
                if let Some(password) = &options.escalate_password {
                    stdin_payload.push_str(password);
                    stdin_payload.push('\n');
                }
            }
            if let Some(input) = &options.stdin {
                stdin_payload.push_str(input);
            }
            if !stdin_payload.is_empty() {
                let mut reader = tokio::io::BufReader::new(stdin_payload.as_bytes());
                channel
                    .data(&mut reader)
                    .await
                    .map_err(|e| ConnectionError::ExecutionFailed(format!("stdin: {}", e)))?;
            }
            let _ = channel.eof().await;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut rc = None;

            while let Some(msg) = channel.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                    ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                        stderr.extend_from_slice(data)
                    }
                    ChannelMsg::ExitStatus { exit_status } => rc = Some(exit_status as i32),
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }

            Ok(CommandResult {
                rc: rc.unwrap_or(-1),
                stdout: String::from_utf8_lossy(&stdout).to_string(),
                stderr: String::from_utf8_lossy(&stderr).to_string(),
            })
        };

        match options.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                .await
                .map_err(|_| ConnectionError::Timeout(secs))?,
            None => run.await,
        }
    }

    async fn upload(
        &self,
        local_path: &Path,
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let content = tokio::fs::read(local_path)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("read source: {}", e)))?;
        self.upload_content(&content, remote_path, options).await
    }

    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        let sftp = self.open_sftp().await?;

        if options.create_dirs {
            if let Some(parent) = remote_path.parent() {
                Self::sftp_mkdir_parents(&sftp, parent).await?;
            }
        }

        let remote_str = remote_path.to_string_lossy().to_string();
        let mut file = sftp.create(&remote_str).await?;
        file.write_all(content)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("write: {}", e)))?;
        file.shutdown()
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("flush: {}", e)))?;
        drop(file);

        if let Some(mode) = options.mode {
            let mut attrs = russh_sftp::protocol::FileAttributes::default();
            attrs.permissions = Some(mode);
            sftp.set_metadata(&remote_str, attrs).await?;
        }

        Ok(())
    }

    async fn download(&self, remote_path: &Path, local_path: &Path) -> ConnectionResult<()> {
        let content = self.download_content(remote_path).await?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConnectionError::TransferFailed(format!("mkdir: {}", e)))?;
        }
        tokio::fs::write(local_path, content)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("write local: {}", e)))
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        let sftp = self.open_sftp().await?;
        let mut file = sftp.open(&remote_path.to_string_lossy().to_string()).await?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("read: {}", e)))?;
        Ok(content)
    }

    async fn mkdir(&self, remote_path: &Path, mode: Option<u32>) -> ConnectionResult<()> {
        let sftp = self.open_sftp().await?;
        Self::sftp_mkdir_parents(&sftp, remote_path).await?;
        if let Some(mode) = mode {
            let mut attrs = russh_sftp::protocol::FileAttributes::default();
            attrs.permissions = Some(mode);
            sftp.set_metadata(&remote_path.to_string_lossy().to_string(), attrs)
                .await?;
        }
        Ok(())
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat> {
        let sftp = self.open_sftp().await?;
        let path_str = path.to_string_lossy().to_string();

        let is_symlink = sftp
            .symlink_metadata(&path_str)
            .await
            .map(|attrs| attrs.is_symlink())
            .unwrap_or(false);

        let attrs = match sftp.metadata(&path_str).await {
            Ok(attrs) => attrs,
            Err(_) if !is_symlink => return Ok(FileStat::missing()),
            Err(e) => return Err(e.into()),
        };

        Ok(FileStat {
            exists: true,
            is_dir: attrs.is_dir(),
            is_file: attrs.is_regular(),
            is_symlink,
            size: attrs.size.unwrap_or(0),
            mtime: attrs.mtime.map(|t| t as i64).unwrap_or(0),
            mode: attrs.permissions,
            checksum: None,
        })
    }

    async fn close(&self) -> ConnectionResult<()> {
        let handle = self.handle.write().await.take();
        if let Some(handle) = handle {
            let _ = handle
                .disconnect(russh::Disconnect::ByApplication, "closed by client", "en")
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_command_plain() {
        let options = ExecuteOptions::new();
        assert_eq!(
            SshConnection::build_command("uptime", &options),
            "uptime"
        );
    }

    #[test]
    fn test_build_command_cwd_and_env() {
        let options = ExecuteOptions::new()
            .with_cwd("/opt/app")
            .with_env("MODE", "fast one");
        let command = SshConnection::build_command("make", &options);
        assert!(command.contains("export MODE='fast one'; "));
        assert!(command.ends_with("cd /opt/app && make"));
    }

    #[test]
    fn test_build_command_sudo_password_stays_off_cli() {
        let mut options = ExecuteOptions::new().with_escalation(Some("deploy".to_string()));
        options.escalate_password = Some("hunter2".to_string());
        let command = SshConnection::build_command("whoami", &options);
        assert!(command.starts_with("sudo -S -p '' -u deploy"));
        assert!(!command.contains("hunter2"));
    }

    #[test]
    fn test_build_command_sudo_noninteractive_without_password() {
        let options = ExecuteOptions::new().with_escalation(None);
        let command = SshConnection::build_command("id", &options);
        assert!(command.starts_with("sudo -n -u root"));
    }

    #[test]
    fn test_build_command_su() {
        let mut options = ExecuteOptions::new().with_escalation(Some("admin".to_string()));
        options.escalate_method = Some("su".to_string());
        let command = SshConnection::build_command("id", &options);
        assert!(command.starts_with("su - admin -c"));
    }
}
