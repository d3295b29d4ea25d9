//! Windows counterpart modules: `win_command`, `win_shell`, `win_copy`,
//! `win_file`, `win_stat`, `win_service`, `win_lineinfile`, and
//! `win_wait_for`.
//!
//! These speak PowerShell and expect to run over the Windows remote shell
//! transport; file transfer rides the transport's chunked upload. Where
//! the semantics are transport-neutral (copy, line editing, waiting), the
//! POSIX implementation is shared and only the remote command vocabulary
//! differs.

use super::copy::sha256_hex;
use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::{ShellKind, TransferOptions};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

/// Quote for single-quoted PowerShell strings.
fn ps_quote(s: &str) -> String {
    s.replace('\'', "''")
}

/// Execute a command without shell processing.
pub struct WinCommandModule;

#[async_trait]
impl Module for WinCommandModule {
    fn name(&self) -> &'static str {
        "win_command"
    }

    fn description(&self) -> &'static str {
        "Execute a command on a Windows host"
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["chdir", "creates", "removes"]
    }

    fn free_form_param(&self) -> Option<&'static str> {
        Some("cmd")
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        win_run(ShellKind::None, params, context).await
    }
}

/// Execute a command through PowerShell.
pub struct WinShellModule;

#[async_trait]
impl Module for WinShellModule {
    fn name(&self) -> &'static str {
        "win_shell"
    }

    fn description(&self) -> &'static str {
        "Execute a PowerShell command on a Windows host"
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["chdir", "creates", "removes"]
    }

    fn free_form_param(&self) -> Option<&'static str> {
        Some("cmd")
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        win_run(ShellKind::PowerShell, params, context).await
    }
}

async fn win_run(
    shell: ShellKind,
    params: &ModuleParams,
    context: &ModuleContext,
) -> ModuleResult<ModuleOutput> {
    if let Some(creates) = params.get_string("creates")? {
        if context.connection.stat(Path::new(&creates)).await?.exists {
            return Ok(ModuleOutput::ok(format!("skipped, since {} exists", creates)));
        }
    }
    if let Some(removes) = params.get_string("removes")? {
        if !context.connection.stat(Path::new(&removes)).await?.exists {
            return Ok(ModuleOutput::ok(format!(
                "skipped, since {} does not exist",
                removes
            )));
        }
    }

    let command = params.get_string_required("cmd")?;
    if context.check_mode {
        return Ok(ModuleOutput::skipped(format!(
            "cannot run '{}' in check mode",
            command
        )));
    }

    let mut options = context.exec_options(shell);
    if let Some(chdir) = params.get_string("chdir")? {
        options.cwd = Some(chdir);
    }

    let result = context.connection.execute(&command, Some(options)).await?;
    let output = if result.rc == 0 {
        ModuleOutput::changed("command executed")
    } else {
        ModuleOutput::failed(format!("non-zero return code {}", result.rc))
    };
    Ok(output.with_command_output(result.stdout, result.stderr, result.rc))
}

/// Upload a file to a Windows host via the chunked transfer.
pub struct WinCopyModule;

#[async_trait]
impl Module for WinCopyModule {
    fn name(&self) -> &'static str {
        "win_copy"
    }

    fn description(&self) -> &'static str {
        "Copy a file to a Windows host"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["dest"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["src", "content", "mode"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let dest = params.get_string_required("dest")?;
        let dest_path = Path::new(&dest);

        let content = if let Some(content) = params.get_string("content")? {
            content.into_bytes()
        } else {
            let src = params
                .get_string("src")?
                .ok_or_else(|| ModuleError::MissingParameter("src or content".to_string()))?;
            let path = context.resolve_local_path(&src);
            tokio::fs::read(&path).await.map_err(|e| {
                ModuleError::ExecutionFailed(format!("cannot read source {}: {}", path.display(), e))
            })?
        };

        let new_checksum = sha256_hex(&content);
        let stat = context.connection.stat(dest_path).await?;
        if stat.is_file && stat.checksum.as_deref() == Some(new_checksum.as_str()) {
            return Ok(ModuleOutput::ok("file already up to date")
                .with_data("checksum", json!(new_checksum)));
        }

        if context.check_mode {
            return Ok(ModuleOutput::changed(format!("would copy to {}", dest))
                .with_data("checksum", json!(new_checksum)));
        }

        // The mode rides along but Windows ACLs are left untouched.
        let options = TransferOptions {
            mode: params.get_mode("mode")?,
            create_dirs: true,
        };
        context
            .connection
            .upload_content(&content, dest_path, Some(options))
            .await?;

        Ok(ModuleOutput::changed(format!("copied to {}", dest))
            .with_data("checksum", json!(new_checksum))
            .with_data("size", json!(content.len())))
    }
}

/// Manage path state on a Windows host.
pub struct WinFileModule;

#[async_trait]
impl Module for WinFileModule {
    fn name(&self) -> &'static str {
        "win_file"
    }

    fn description(&self) -> &'static str {
        "Manage file and directory state on a Windows host"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["state"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path = params.get_string_required("path")?;
        let state = params
            .get_string("state")?
            .unwrap_or_else(|| "file".to_string());
        let stat = context.connection.stat(Path::new(&path)).await?;
        let quoted = ps_quote(&path);

        match state.as_str() {
            "absent" => {
                if !stat.exists {
                    return Ok(ModuleOutput::ok(format!("{} already absent", path)));
                }
                if context.check_mode {
                    return Ok(ModuleOutput::changed(format!("would remove {}", path)));
                }
                let command = format!(
                    "Remove-Item -LiteralPath '{}' -Recurse -Force",
                    quoted
                );
                let result = context
                    .connection
                    .execute(&command, Some(context.exec_options(ShellKind::PowerShell)))
                    .await?;
                if result.rc != 0 {
                    return Ok(ModuleOutput::failed(format!(
                        "failed to remove {}: {}",
                        path, result.stderr
                    )));
                }
                Ok(ModuleOutput::changed(format!("removed {}", path)))
            }
            "directory" => {
                if stat.exists && stat.is_dir {
                    return Ok(ModuleOutput::ok(format!("{} is already a directory", path)));
                }
                if context.check_mode {
                    return Ok(ModuleOutput::changed(format!("would create {}", path)));
                }
                context.connection.mkdir(Path::new(&path), None).await?;
                Ok(ModuleOutput::changed(format!("created directory {}", path)))
            }
            "touch" => {
                if context.check_mode {
                    return Ok(if stat.exists {
                        ModuleOutput::ok(format!("{} exists", path))
                    } else {
                        ModuleOutput::changed(format!("would touch {}", path))
                    });
                }
                let command = format!(
                    "if (Test-Path -LiteralPath '{q}') {{ (Get-Item -LiteralPath '{q}').LastWriteTime = Get-Date }} else {{ New-Item -ItemType File -Force -Path '{q}' | Out-Null }}",
                    q = quoted
                );
                let result = context
                    .connection
                    .execute(&command, Some(context.exec_options(ShellKind::PowerShell)))
                    .await?;
                if result.rc != 0 {
                    return Ok(ModuleOutput::failed(format!(
                        "touch failed: {}",
                        result.stderr
                    )));
                }
                if stat.exists {
                    Ok(ModuleOutput::ok(format!("{} exists", path)))
                } else {
                    Ok(ModuleOutput::changed(format!("touched {}", path)))
                }
            }
            other => Err(ModuleError::InvalidParameter(format!(
                "unknown state '{}'",
                other
            ))),
        }
    }
}

/// Query file metadata on a Windows host.
pub struct WinStatModule;

#[async_trait]
impl Module for WinStatModule {
    fn name(&self) -> &'static str {
        "win_stat"
    }

    fn description(&self) -> &'static str {
        "Retrieve file metadata from a Windows host"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path = params.get_string_required("path")?;
        let stat = context.connection.stat(Path::new(&path)).await?;

        let mut payload = json!({
            "exists": stat.exists,
            "isdir": stat.is_dir,
            "isreg": stat.is_file,
            "islnk": stat.is_symlink,
            "size": stat.size,
            "mtime": stat.mtime,
            "path": path,
        });
        if let Some(checksum) = stat.checksum {
            payload["checksum"] = json!(checksum);
        }

        Ok(ModuleOutput::ok("stat gathered").with_data("stat", payload))
    }
}

/// Manage a Windows service.
pub struct WinServiceModule;

#[async_trait]
impl Module for WinServiceModule {
    fn name(&self) -> &'static str {
        "win_service"
    }

    fn description(&self) -> &'static str {
        "Manage a Windows service"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["state", "start_mode"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let name = params.get_string_required("name")?;
        let state = params.get_string("state")?;
        let start_mode = params.get_string("start_mode")?;
        let quoted = ps_quote(&name);

        let probe = format!(
            "(Get-Service -Name '{}' -ErrorAction Stop).Status",
            quoted
        );
        let current = context
            .connection
            .execute(&probe, Some(context.exec_options(ShellKind::PowerShell)))
            .await?;
        if current.rc != 0 {
            return Ok(ModuleOutput::failed(format!(
                "service '{}' not found: {}",
                name,
                current.stderr.trim()
            )));
        }
        let running = current.stdout.trim().eq_ignore_ascii_case("running");

        let mut changed = false;
        let mut actions: Vec<String> = Vec::new();

        if let Some(state) = &state {
            let (needs_action, verb) = match state.as_str() {
                "started" => (!running, "Start-Service"),
                "stopped" => (running, "Stop-Service -Force"),
                "restarted" => (true, "Restart-Service -Force"),
                other => {
                    return Err(ModuleError::InvalidParameter(format!(
                        "unknown state '{}'",
                        other
                    )))
                }
            };
            if needs_action {
                changed = true;
                actions.push(format!("{} -Name '{}'", verb, quoted));
            }
        }
        if let Some(mode) = &start_mode {
            changed = true;
            actions.push(format!(
                "Set-Service -Name '{}' -StartupType '{}'",
                quoted,
                ps_quote(mode)
            ));
        }

        if !changed {
            return Ok(ModuleOutput::ok(format!("service '{}' already in state", name))
                .with_data("name", json!(name)));
        }
        if context.check_mode {
            return Ok(ModuleOutput::changed(format!(
                "would adjust service '{}'",
                name
            )));
        }

        for action in actions {
            let result = context
                .connection
                .execute(&action, Some(context.exec_options(ShellKind::PowerShell)))
                .await?;
            if result.rc != 0 {
                return Ok(ModuleOutput::failed(format!(
                    "service action failed: {}",
                    result.stderr.trim()
                )));
            }
        }

        Ok(ModuleOutput::changed(format!("service '{}' adjusted", name))
            .with_data("name", json!(name)))
    }
}

/// Manage a single line in a file on a Windows host. The editing engine is
/// shared with `lineinfile`; only the transport differs.
pub struct WinLineinfileModule;

#[async_trait]
impl Module for WinLineinfileModule {
    fn name(&self) -> &'static str {
        "win_lineinfile"
    }

    fn description(&self) -> &'static str {
        "Manage a single line in a file on a Windows host"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["line", "regexp", "state", "create", "insertafter", "insertbefore"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        super::lineinfile::LineinfileModule
            .execute(params, context)
            .await
    }
}

/// Wait for a path or port on a Windows host.
pub struct WinWaitForModule;

#[async_trait]
impl Module for WinWaitForModule {
    fn name(&self) -> &'static str {
        "win_wait_for"
    }

    fn description(&self) -> &'static str {
        "Wait for a path or port condition on a Windows host"
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["path", "port", "host", "state", "timeout", "delay"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        super::wait_for::WaitForModule.execute(params, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::local_context;
    use serde_json::json;

    #[test]
    fn test_ps_quote() {
        assert_eq!(ps_quote("O'Brien"), "O''Brien");
    }

    #[tokio::test]
    async fn test_win_copy_change_detection() {
        // The contract is transport-neutral; exercised here over the local
        // transport where stat provides checksums just like the Windows
        // remote shell does.
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        let mut params = ModuleParams::new();
        params.insert("content".to_string(), json!("chunked payload"));
        params.insert("dest".to_string(), json!(dest.to_str().unwrap()));

        let ctx = local_context();
        let first = WinCopyModule.execute(&params, &ctx).await.unwrap();
        assert!(first.changed);

        let second = WinCopyModule.execute(&params, &ctx).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn test_win_lineinfile_shares_engine() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg");
        std::fs::write(&file, "a=1\n").unwrap();

        let mut params = ModuleParams::new();
        params.insert("path".to_string(), json!(file.to_str().unwrap()));
        params.insert("line".to_string(), json!("b=2"));

        let output = WinLineinfileModule
            .execute(&params, &local_context())
            .await
            .unwrap();
        assert!(output.changed);
    }
}
