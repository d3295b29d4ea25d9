//! Local transport: commands run as child processes of the control node.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::trace;

use super::{
    CommandResult, Connection, ConnectionError, ConnectionResult, ExecuteOptions, FileStat,
    ShellKind, TransferOptions,
};

/// Local connection for executing commands on the control node itself.
#[derive(Debug, Clone)]
pub struct LocalConnection {
    identifier: String,
}

impl LocalConnection {
    /// Create a new local connection.
    pub fn new() -> Self {
        let identifier = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        Self { identifier }
    }

    fn build_command(command: &str, options: &ExecuteOptions) -> ConnectionResult<Command> {
        let mut cmd = if options.escalate {
            let method = options.escalate_method.as_deref().unwrap_or("sudo");
            let user = options.escalate_user.as_deref().unwrap_or("root");

            match method {
                "su" => {
                    let mut c = Command::new("su");
                    c.arg("-").arg(user).arg("-c").arg(command);
                    c
                }
                // sudo and anything sudo-like
                _ => {
                    let mut c = Command::new("sudo");
                    c.arg("-n");
                    if options.escalate_password.is_some() {
                        // -S reads the password from stdin, keeping it off
                        // the command line; an empty -p suppresses the
                        // prompt text.
                        c.arg("-S").arg("-p").arg("");
                    }
                    c.arg("-u").arg(user).arg("--").arg("sh").arg("-c").arg(command);
                    c
                }
            }
        } else {
            match options.shell {
                ShellKind::Posix | ShellKind::PowerShell => {
                    let mut c = Command::new("sh");
                    c.arg("-c").arg(command);
                    c
                }
                ShellKind::None => {
                    let argv = shell_words::split(command).map_err(|e| {
                        ConnectionError::ExecutionFailed(format!("unparsable command: {}", e))
                    })?;
                    let (program, args) = argv.split_first().ok_or_else(|| {
                        ConnectionError::ExecutionFailed("empty command".to_string())
                    })?;
                    let mut c = Command::new(program);
                    c.args(args);
                    c
                }
            }
        };

        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        Ok(cmd)
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        command: &str,
        options: Option<ExecuteOptions>,
    ) -> ConnectionResult<CommandResult> {
        let options = options.unwrap_or_default();
        trace!(command = %command, "executing local command");

        let mut cmd = Self::build_command(command, &options)?;
        let mut child = cmd
            .spawn()
            .map_err(|e| ConnectionError::ExecutionFailed(format!("spawn failed: {}", e)))?;

        // The escalation password goes in first, then any task stdin.
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
        if let Some(mut stdin) = child.stdin.take() {
            if !stdin_payload.is_empty() {
                stdin
                    .write_all(stdin_payload.as_bytes())
                    .await
                    .map_err(|e| {
                        ConnectionError::ExecutionFailed(format!("stdin write failed: {}", e))
                    })?;
            }
            drop(stdin);
        }

        let wait = child.wait_with_output();
        let output = match options.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), wait)
                .await
                .map_err(|_| ConnectionError::Timeout(secs))?,
            None => wait.await,
        }
        .map_err(|e| ConnectionError::ExecutionFailed(format!("wait failed: {}", e)))?;

        let rc = output.status.code().unwrap_or(-1);
        Ok(CommandResult {
            rc,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
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

        if options.create_dirs {
            if let Some(parent) = remote_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ConnectionError::TransferFailed(format!("mkdir: {}", e)))?;
            }
        }

        tokio::fs::write(remote_path, content)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("write: {}", e)))?;

        #[cfg(unix)]
        if let Some(mode) = options.mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(remote_path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| ConnectionError::TransferFailed(format!("chmod: {}", e)))?;
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
            .map_err(|e| ConnectionError::TransferFailed(format!("write: {}", e)))
    }

    async fn download_content(&self, remote_path: &Path) -> ConnectionResult<Vec<u8>> {
        tokio::fs::read(remote_path)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("read: {}", e)))
    }

    async fn mkdir(&self, remote_path: &Path, mode: Option<u32>) -> ConnectionResult<()> {
        tokio::fs::create_dir_all(remote_path)
            .await
            .map_err(|e| ConnectionError::TransferFailed(format!("mkdir: {}", e)))?;

        #[cfg(unix)]
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(remote_path, std::fs::Permissions::from_mode(mode))
                .await
                .map_err(|e| ConnectionError::TransferFailed(format!("chmod: {}", e)))?;
        }
        #[cfg(not(unix))]
        let _ = mode;

        Ok(())
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat> {
        let symlink_meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(FileStat::missing())
            }
            Err(e) => return Err(ConnectionError::Io(e)),
        };
        let is_symlink = symlink_meta.file_type().is_symlink();

        let meta = tokio::fs::metadata(path)
            .await
            .unwrap_or(symlink_meta.clone());

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            Some(meta.permissions().mode() & 0o7777)
        };
        #[cfg(not(unix))]
        let mode = None;

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let checksum = if meta.is_file() {
            tokio::fs::read(path).await.ok().map(|content| {
                let mut hasher = Sha256::new();
                hasher.update(&content);
                format!("{:x}", hasher.finalize())
            })
        } else {
            None
        };

        Ok(FileStat {
            exists: true,
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            is_symlink,
            size: meta.len(),
            mtime,
            mode,
            checksum,
        })
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_shell() {
        let conn = LocalConnection::new();
        let result = conn.execute("echo hello", None).await.unwrap();
        assert_eq!(result.rc, 0);
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_execute_no_shell() {
        let conn = LocalConnection::new();
        let options = ExecuteOptions::new().with_shell(ShellKind::None);
        // No shell: the pipe character is just an argument.
        let result = conn.execute("echo a | b", Some(options)).await.unwrap();
        assert_eq!(result.stdout.trim(), "a | b");
    }

    #[tokio::test]
    async fn test_execute_nonzero_rc() {
        let conn = LocalConnection::new();
        let result = conn.execute("exit 4", None).await.unwrap();
        assert_eq!(result.rc, 4);
    }

    #[tokio::test]
    async fn test_execute_env_and_cwd() {
        let conn = LocalConnection::new();
        let options = ExecuteOptions::new()
            .with_env("GREETING", "hi")
            .with_cwd("/");
        let result = conn
            .execute("echo $GREETING $(pwd)", Some(options))
            .await
            .unwrap();
        assert_eq!(result.stdout.trim(), "hi /");
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let conn = LocalConnection::new();
        let options = ExecuteOptions::new().with_timeout(1);
        let err = conn.execute("sleep 5", Some(options)).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_stdin_payload() {
        let conn = LocalConnection::new();
        let mut options = ExecuteOptions::new();
        options.stdin = Some("piped in".to_string());
        let result = conn.execute("cat", Some(options)).await.unwrap();
        assert_eq!(result.stdout, "piped in");
    }

    #[tokio::test]
    async fn test_upload_stat_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/file.txt");
        let conn = LocalConnection::new();

        let options = TransferOptions {
            mode: Some(0o644),
            create_dirs: true,
        };
        conn.upload_content(b"payload", &path, Some(options))
            .await
            .unwrap();

        let stat = conn.stat(&path).await.unwrap();
        assert!(stat.exists);
        assert!(stat.is_file);
        assert_eq!(stat.size, 7);
        assert!(stat.checksum.is_some());

        let fetched = conn.download_content(&path).await.unwrap();
        assert_eq!(fetched, b"payload");
    }

    #[tokio::test]
    async fn test_stat_missing() {
        let conn = LocalConnection::new();
        let stat = conn.stat(Path::new("/no/such/path/at/all")).await.unwrap();
        assert!(!stat.exists);
    }

    #[tokio::test]
    async fn test_mkdir_parents() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        let conn = LocalConnection::new();
        conn.mkdir(&nested, Some(0o755)).await.unwrap();
        assert!(nested.is_dir());
    }
}
