//! Windows remote shell transport.
//!
//! Speaks the WS-Management SOAP protocol over HTTP(S): create a shell,
//! run a command, receive base64-framed output streams, signal, delete.
//! Two protocol constraints shape this module: the command envelope is
//! text-only (no binary stdin), and a session is logically synchronous,
//! so concurrent calls on one connection are serialized behind a lock.
//!
//! Because `put` cannot stream binary data, uploads go through a chunked
//! protocol: the local file is read in fixed-size chunks, each chunk is
//! base64-encoded and appended to a remote temp file by its own command,
//! strictly in order, and the temp file is atomically renamed onto the
//! destination after the last chunk. Any chunk failure aborts the
//! transfer and deletes the temp file.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    CommandResult, Connection, ConnectionDefaults, ConnectionError, ConnectionResult,
    ExecuteOptions, FileStat, ShellKind, TransferOptions,
};
use crate::inventory::Host;

/// Default WinRM HTTP port.
pub const DEFAULT_PORT: u16 = 5985;

/// Default WinRM HTTPS port.
pub const DEFAULT_SSL_PORT: u16 = 5986;

/// Plaintext bytes per upload chunk. Base64 expands by 4/3, so 700 KiB of
/// plaintext encodes to roughly 950 KiB, safely below the 1 MiB envelope
/// cap.
pub const UPLOAD_CHUNK_SIZE: usize = 700 * 1024;

/// Maximum SOAP envelope size advertised to the server.
const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;

/// Prefix for upload temp files.
const UPLOAD_TMP_PREFIX: &str = ".stagehand-upload";

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";

/// Windows remote shell connection.
pub struct WinRmConnection {
    identifier: String,
    endpoint: String,
    username: String,
    password: String,
    client: reqwest::Client,
    operation_timeout: u64,
    /// The protocol is synchronous per session; one command at a time.
    session_lock: Mutex<()>,
}

impl WinRmConnection {
    /// Establish a connection and verify credentials by opening and
    /// closing a throwaway shell.
    pub async fn connect(host: &Host, defaults: &ConnectionDefaults) -> ConnectionResult<Self> {
        let port = host.connection.port.unwrap_or(DEFAULT_PORT);
        let use_ssl = port == DEFAULT_SSL_PORT;
        let scheme = if use_ssl { "https" } else { "http" };
        let endpoint = format!("{}://{}:{}/wsman", scheme, host.address(), port);

        let username = host
            .connection
            .user
            .clone()
            .or_else(|| defaults.remote_user.clone())
            .unwrap_or_else(|| "Administrator".to_string());
        let password = host.connection.password.clone().ok_or_else(|| {
            ConnectionError::InvalidConfig(format!(
                "winrm host '{}' has no password configured",
                host.name
            ))
        })?;

        let timeout = defaults.timeout.unwrap_or(60);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout.max(60)))
            .danger_accept_invalid_certs(defaults.host_key_policy == super::HostKeyPolicy::Insecure)
            .build()
            .map_err(|e| ConnectionError::InvalidConfig(e.to_string()))?;

        let conn = Self {
            identifier: format!("{}@{}", username, host.address()),
            endpoint,
            username,
            password,
            client,
            operation_timeout: timeout,
            session_lock: Mutex::new(()),
        };

        debug!(endpoint = %conn.endpoint, "probing winrm endpoint");
        let shell_id = conn.create_shell().await?;
        conn.delete_shell(&shell_id).await;

        Ok(conn)
    }

    fn header(&self, action: &str, shell_id: Option<&str>) -> String {
        let selector = match shell_id {
            Some(id) => format!(
                "\n    <w:SelectorSet><w:Selector Name=\"ShellId\">{}</w:Selector></w:SelectorSet>",
                id
            ),
            None => String::new(),
        };
        format!(
            r#"<s:Header>
    <a:To>{endpoint}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{action}</a:Action>
    <a:MessageID>uuid:{message_id}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{envelope}</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT{timeout}S</w:OperationTimeout>{selector}
  </s:Header>"#,
            endpoint = self.endpoint,
            resource = SHELL_RESOURCE_URI,
            action = action,
            message_id = Uuid::new_v4(),
            envelope = MAX_ENVELOPE_SIZE,
            timeout = self.operation_timeout,
            selector = selector,
        )
    }

    fn envelope(&self, action: &str, shell_id: Option<&str>, body: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  {header}
  <s:Body>{body}</s:Body>
</s:Envelope>"#,
            header = self.header(action, shell_id),
            body = body,
        )
    }

    async fn send(&self, envelope: &str) -> ConnectionResult<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .body(envelope.to_string())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ConnectionError::Timeout(self.operation_timeout)
                } else {
                    ConnectionError::ConnectionFailed(format!("winrm request: {}", e))
                }
            })?;

        let status = response.status();
        let text = response.text().await.map_err(|e| {
            ConnectionError::SessionLost(format!("winrm response read: {}", e))
        })?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "winrm endpoint rejected credentials for '{}'",
                self.username
            )));
        }
        if !status.is_success() {
            // SOAP faults come back as HTTP 500 with a reason in the body.
            let reason = extract_tag(&text, "Text").unwrap_or_else(|| status.to_string());
            return Err(ConnectionError::ExecutionFailed(format!(
                "winrm fault: {}",
                reason
            )));
        }

        Ok(text)
    }

    async fn create_shell(&self) -> ConnectionResult<String> {
        let body = format!(
            r#"<rsp:Shell xmlns:rsp="{SHELL_NS}">
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>"#
        );
        let envelope = self.envelope(ACTION_CREATE, None, &body);
        let response = self.send(&envelope).await?;

        extract_tag(&response, "w:Selector")
            .or_else(|| extract_tag(&response, "rsp:ShellId"))
            .ok_or_else(|| {
                ConnectionError::SessionLost("no shell id in create response".to_string())
            })
    }

    async fn run_command(&self, shell_id: &str, command: &str) -> ConnectionResult<String> {
        let body = format!(
            r#"<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>"#,
            xml_escape(command)
        );
        let envelope = self.envelope(ACTION_COMMAND, Some(shell_id), &body);
        let response = self.send(&envelope).await?;

        extract_tag(&response, "rsp:CommandId").ok_or_else(|| {
            ConnectionError::SessionLost("no command id in command response".to_string())
        })
    }

    async fn receive_output(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> ConnectionResult<CommandResult> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut rc = 0;

        loop {
            let body = format!(
                r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
                command_id
            );
            let envelope = self.envelope(ACTION_RECEIVE, Some(shell_id), &body);
            let response = self.send(&envelope).await?;

            for (name, content) in extract_streams(&response) {
                if let Ok(decoded) = BASE64.decode(content.trim()) {
                    match name.as_str() {
                        "stdout" => stdout.extend_from_slice(&decoded),
                        "stderr" => stderr.extend_from_slice(&decoded),
                        _ => {}
                    }
                }
            }

            if let Some(code) = extract_tag(&response, "rsp:ExitCode") {
                rc = code.trim().parse().unwrap_or(-1);
            }
            if response.contains("CommandState/Done") {
                break;
            }
        }

        Ok(CommandResult {
            rc,
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
        })
    }

    async fn signal_terminate(&self, shell_id: &str, command_id: &str) {
        let body = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate</rsp:Code></rsp:Signal>"#,
            command_id
        );
        let envelope = self.envelope(ACTION_SIGNAL, Some(shell_id), &body);
        if self.send(&envelope).await.is_err() {
            warn!(shell_id, command_id, "failed to signal command termination");
        }
    }

    async fn delete_shell(&self, shell_id: &str) {
        let envelope = self.envelope(ACTION_DELETE, Some(shell_id), "");
        if self.send(&envelope).await.is_err() {
            warn!(shell_id, "failed to delete shell");
        }
    }

    /// Run one command through a fresh shell, serialized on the session.
    async fn run(&self, command: &str) -> ConnectionResult<CommandResult> {
        let _guard = self.session_lock.lock().await;

        let shell_id = self.create_shell().await?;
        let result = async {
            let command_id = self.run_command(&shell_id, command).await?;
            let output = self.receive_output(&shell_id, &command_id).await?;
            self.signal_terminate(&shell_id, &command_id).await;
            Ok(output)
        }
        .await;
        self.delete_shell(&shell_id).await;
        result
    }

    /// Run a PowerShell script via `-EncodedCommand` (UTF-16LE base64), so
    /// quoting survives the cmd envelope.
    pub async fn run_powershell(&self, script: &str) -> ConnectionResult<CommandResult> {
        let utf16: Vec<u8> = script.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
        let encoded = BASE64.encode(&utf16);
        let command = format!(
            "powershell.exe -NoProfile -NonInteractive -EncodedCommand {}",
            encoded
        );
        self.run(&command).await
    }

    /// Byte offsets of the ordered upload chunks for a payload.
    pub fn plan_chunks(total: usize) -> Vec<(usize, usize)> {
        let mut chunks = Vec::new();
        let mut offset = 0;
        while offset < total {
            let len = UPLOAD_CHUNK_SIZE.min(total - offset);
            chunks.push((offset, len));
            offset += len;
        }
        chunks
    }
}

impl std::fmt::Debug for WinRmConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WinRmConnection")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .finish()
    }
}

#[async_trait]
impl Connection for WinRmConnection {
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

        let mut script = String::new();
        for (key, value) in &options.env {
            script.push_str(&format!(
                "$env:{} = '{}'\n",
                key,
                value.replace('\'', "''")
            ));
        }
        if let Some(cwd) = &options.cwd {
            script.push_str(&format!("Set-Location '{}'\n", cwd.replace('\'', "''")));
        }

        match options.shell {
            // Everything lands in PowerShell on this transport; raw
            // commands are passed through cmd.exe semantics unchanged.
            ShellKind::PowerShell | ShellKind::Posix => script.push_str(command),
            ShellKind::None => script.push_str(command),
        }

        let run = self.run_powershell(&script);
        let result = match options.timeout {
            Some(secs) => tokio::time::timeout(Duration::from_secs(secs), run)
                .await
                .map_err(|_| ConnectionError::Timeout(secs))??,
            None => run.await?,
        };
        Ok(result)
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

    /// The chunked upload protocol. See the module docs for the shape;
    /// chunks are applied strictly in order and the rename at the end is
    /// atomic on the remote filesystem.
    async fn upload_content(
        &self,
        content: &[u8],
        remote_path: &Path,
        options: Option<TransferOptions>,
    ) -> ConnectionResult<()> {
        let options = options.unwrap_or_default();
        let dest = win_path(remote_path);

        debug!(
            remote = %dest,
            size = content.len(),
            chunks = Self::plan_chunks(content.len()).len(),
            "starting chunked upload"
        );

        // A directory at the destination would make the final rename
        // ambiguous; remove it and make sure the parent exists.
        let prepare = format!(
            r#"if (Test-Path -LiteralPath '{dest}' -PathType Container) {{ Remove-Item -LiteralPath '{dest}' -Recurse -Force }}
$parent = Split-Path -Parent '{dest}'
if ($parent -and -not (Test-Path -LiteralPath $parent)) {{ New-Item -ItemType Directory -Force -Path $parent | Out-Null }}"#,
            dest = ps_quote(&dest),
        );
        let result = self.run_powershell(&prepare).await?;
        if result.rc != 0 {
            return Err(ConnectionError::TransferFailed(format!(
                "prepare destination: {}",
                result.stderr
            )));
        }

        let parent = remote_path
            .parent()
            .map(win_path)
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| ".".to_string());
        let tmp = format!("{}\\{}-{}.tmp", parent, UPLOAD_TMP_PREFIX, Uuid::new_v4());

        for (index, (offset, len)) in Self::plan_chunks(content.len()).into_iter().enumerate() {
            let encoded = BASE64.encode(&content[offset..offset + len]);
            trace!(chunk = index, bytes = len, "appending chunk");

            let append = format!(
                r#"$bytes = [System.Convert]::FromBase64String('{encoded}')
$stream = [System.IO.File]::Open('{tmp}', [System.IO.FileMode]::Append)
try {{ $stream.Write($bytes, 0, $bytes.Length) }} finally {{ $stream.Close() }}"#,
                encoded = encoded,
                tmp = ps_quote(&tmp),
            );

            let result = self.run_powershell(&append).await;
            let failed = match &result {
                Ok(r) => r.rc != 0,
                Err(_) => true,
            };
            if failed {
                // Abort: remove the partial temp file before reporting.
                let cleanup = format!(
                    "Remove-Item -LiteralPath '{}' -Force -ErrorAction SilentlyContinue",
                    ps_quote(&tmp)
                );
                let _ = self.run_powershell(&cleanup).await;
                return match result {
                    Ok(r) => Err(ConnectionError::TransferFailed(format!(
                        "chunk {} of upload failed: {}",
                        index, r.stderr
                    ))),
                    Err(e) => Err(e),
                };
            }
        }

        // Zero-byte payload: the append loop never created the file.
        if content.is_empty() {
            let touch = format!(
                "New-Item -ItemType File -Force -Path '{}' | Out-Null",
                ps_quote(&tmp)
            );
            let result = self.run_powershell(&touch).await?;
            if result.rc != 0 {
                return Err(ConnectionError::TransferFailed(result.stderr));
            }
        }

        let rename = format!(
            "Move-Item -LiteralPath '{}' -Destination '{}' -Force",
            ps_quote(&tmp),
            ps_quote(&dest)
        );
        let result = self.run_powershell(&rename).await?;
        if result.rc != 0 {
            let cleanup = format!(
                "Remove-Item -LiteralPath '{}' -Force -ErrorAction SilentlyContinue",
                ps_quote(&tmp)
            );
            let _ = self.run_powershell(&cleanup).await;
            return Err(ConnectionError::TransferFailed(format!(
                "rename onto destination failed: {}",
                result.stderr
            )));
        }

        // Windows ACLs do not map onto mode bits; accepted, not translated.
        if options.mode.is_some() {
            trace!(remote = %dest, "mode accepted without translation");
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
        let script = format!(
            "[System.Convert]::ToBase64String([System.IO.File]::ReadAllBytes('{}'))",
            ps_quote(&win_path(remote_path))
        );
        let result = self.run_powershell(&script).await?;
        if result.rc != 0 {
            return Err(ConnectionError::TransferFailed(format!(
                "read remote file: {}",
                result.stderr
            )));
        }
        BASE64
            .decode(result.stdout.trim())
            .map_err(|e| ConnectionError::TransferFailed(format!("decode: {}", e)))
    }

    async fn mkdir(&self, remote_path: &Path, _mode: Option<u32>) -> ConnectionResult<()> {
        let script = format!(
            "New-Item -ItemType Directory -Force -Path '{}' | Out-Null",
            ps_quote(&win_path(remote_path))
        );
        let result = self.run_powershell(&script).await?;
        if result.rc != 0 {
            return Err(ConnectionError::TransferFailed(format!(
                "mkdir: {}",
                result.stderr
            )));
        }
        Ok(())
    }

    async fn stat(&self, path: &Path) -> ConnectionResult<FileStat> {
        let quoted = ps_quote(&win_path(path));
        let script = format!(
            r#"if (-not (Test-Path -LiteralPath '{quoted}')) {{ Write-Output '{{"exists": false}}'; exit 0 }}
$item = Get-Item -LiteralPath '{quoted}' -Force
$checksum = $null
if (-not $item.PSIsContainer) {{ $checksum = (Get-FileHash -LiteralPath '{quoted}' -Algorithm SHA256).Hash.ToLower() }}
@{{
  exists = $true
  isdir = $item.PSIsContainer
  islink = [bool]($item.Attributes -band [System.IO.FileAttributes]::ReparsePoint)
  size = [int64]($item.Length)
  mtime = [int64](Get-Date $item.LastWriteTimeUtc -UFormat %s)
  checksum = $checksum
}} | ConvertTo-Json -Compress"#,
            quoted = quoted,
        );

        let result = self.run_powershell(&script).await?;
        if result.rc != 0 {
            return Err(ConnectionError::TransferFailed(format!(
                "stat: {}",
                result.stderr
            )));
        }

        let json: serde_json::Value =
            serde_json::from_str(result.stdout.trim()).map_err(|e| {
                ConnectionError::TransferFailed(format!("unparsable stat output: {}", e))
            })?;

        if !json["exists"].as_bool().unwrap_or(false) {
            return Ok(FileStat::missing());
        }

        let is_dir = json["isdir"].as_bool().unwrap_or(false);
        Ok(FileStat {
            exists: true,
            is_dir,
            is_file: !is_dir,
            is_symlink: json["islink"].as_bool().unwrap_or(false),
            size: json["size"].as_u64().unwrap_or(0),
            mtime: json["mtime"].as_i64().unwrap_or(0),
            mode: None,
            checksum: json["checksum"].as_str().map(str::to_string),
        })
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

/// Render a path with backslashes for the remote side.
fn win_path(path: &Path) -> String {
    path.to_string_lossy().replace('/', "\\")
}

/// Escape a string for inclusion inside single quotes in PowerShell.
fn ps_quote(s: &str) -> String {
    s.replace('\'', "''")
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Extract the text content of the first occurrence of an XML tag.
fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let start = xml.find(&open)?;
    let content_start = xml[start..].find('>')? + start + 1;
    let content_end = xml[content_start..].find(&close)? + content_start;
    let content = xml[content_start..content_end].trim();
    if content.is_empty() {
        None
    } else {
        Some(content.to_string())
    }
}

/// Extract `(stream name, base64 content)` pairs from a Receive response.
fn extract_streams(xml: &str) -> Vec<(String, String)> {
    let mut streams = Vec::new();
    let mut pos = 0;
    while let Some(start) = xml[pos..].find("<rsp:Stream Name=\"") {
        let abs = pos + start + "<rsp:Stream Name=\"".len();
        let Some(name_end) = xml[abs..].find('"') else {
            break;
        };
        let name = xml[abs..abs + name_end].to_string();
        let Some(tag_end) = xml[abs..].find('>') else {
            break;
        };
        let content_start = abs + tag_end + 1;
        let Some(end) = xml[content_start..].find("</rsp:Stream>") else {
            break;
        };
        let content = xml[content_start..content_start + end].to_string();
        // Self-closing streams carry no '>' before '/' in range; skip them.
        if !content.contains('<') {
            streams.push((name, content));
        }
        pos = content_start + end;
    }
    streams
}
