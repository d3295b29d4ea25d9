//! Command execution modules: `command`, `shell`, and `raw`.
//!
//! `command` executes without a shell (no pipes or redirects), `shell`
//! goes through the remote shell, and `raw` sends the line as-is with no
//! environment preparation at all. All three route through the task's
//! transport.

use super::{Module, ModuleContext, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use crate::connection::ShellKind;
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

const COMMAND_OPTIONS: &[&str] = &["chdir", "creates", "removes", "stdin", "argv"];

/// Shared implementation for the three command-style modules.
async fn run_command(
    shell: ShellKind,
    params: &ModuleParams,
    context: &ModuleContext,
) -> ModuleResult<ModuleOutput> {
    // creates/removes make re-runs cheap to skip.
    if let Some(creates) = params.get_string("creates")? {
        let stat = context.connection.stat(Path::new(&creates)).await?;
        if stat.exists {
            return Ok(ModuleOutput::ok(format!("skipped, since {} exists", creates)));
        }
    }
    if let Some(removes) = params.get_string("removes")? {
        let stat = context.connection.stat(Path::new(&removes)).await?;
        if !stat.exists {
            return Ok(ModuleOutput::ok(format!(
                "skipped, since {} does not exist",
                removes
            )));
        }
    }

    let command = match params.get("argv") {
        Some(Value::Array(argv)) => {
            let parts: Vec<String> = argv
                .iter()
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .collect();
            shell_words::join(parts.iter().map(String::as_str))
        }
        _ => params.get_string_required("cmd")?,
    };

    if context.check_mode {
        // Arbitrary commands cannot be simulated.
        return Ok(ModuleOutput::skipped(format!(
            "cannot run '{}' in check mode",
            command
        )));
    }

    let mut options = context.exec_options(shell);
    if let Some(chdir) = params.get_string("chdir")? {
        options.cwd = Some(chdir);
    }
    if let Some(stdin) = params.get_string("stdin")? {
        options.stdin = Some(stdin);
    }

    let result = context.connection.execute(&command, Some(options)).await?;

    let output = if result.rc == 0 {
        ModuleOutput::changed("command executed")
    } else {
        ModuleOutput::failed(format!("non-zero return code {}", result.rc))
    };
    Ok(output.with_command_output(result.stdout, result.stderr, result.rc))
}

/// Execute a command without going through a shell.
pub struct CommandModule;

#[async_trait]
impl Module for CommandModule {
    fn name(&self) -> &'static str {
        "command"
    }

    fn description(&self) -> &'static str {
        "Execute a command without a shell"
    }

    fn optional_params(&self) -> &'static [&'static str] {
        COMMAND_OPTIONS
    }

    fn free_form_param(&self) -> Option<&'static str> {
        Some("cmd")
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        run_command(ShellKind::None, params, context).await
    }
}

/// Execute a command through the remote shell.
pub struct ShellModule;

#[async_trait]
impl Module for ShellModule {
    fn name(&self) -> &'static str {
        "shell"
    }

    fn description(&self) -> &'static str {
        "Execute a command through the remote shell"
    }

    fn optional_params(&self) -> &'static [&'static str] {
        COMMAND_OPTIONS
    }

    fn free_form_param(&self) -> Option<&'static str> {
        Some("cmd")
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        run_command(ShellKind::Posix, params, context).await
    }
}

/// Send a line to the transport untouched. No creates/removes, no chdir.
pub struct RawModule;

#[async_trait]
impl Module for RawModule {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn description(&self) -> &'static str {
        "Execute a raw command line on the transport"
    }

    fn free_form_param(&self) -> Option<&'static str> {
        Some("cmd")
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let command = params.get_string_required("cmd")?;
        if context.check_mode {
            return Ok(ModuleOutput::skipped(format!(
                "cannot run '{}' in check mode",
                command
            )));
        }

        let options = context.exec_options(ShellKind::Posix);
        let result = context.connection.execute(&command, Some(options)).await?;

        let output = if result.rc == 0 {
            ModuleOutput::changed("command executed")
        } else {
            ModuleOutput::failed(format!("non-zero return code {}", result.rc))
        };
        Ok(output.with_command_output(result.stdout, result.stderr, result.rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::local_context;
    use serde_json::json;

    #[tokio::test]
    async fn test_command_runs() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("echo hello"));

        let output = CommandModule
            .execute(&params, &local_context())
            .await
            .unwrap();
        assert!(output.changed);
        assert_eq!(output.rc, Some(0));
        assert_eq!(output.stdout.unwrap().trim(), "hello");
    }

    #[tokio::test]
    async fn test_shell_pipes_work() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("echo one two | wc -w"));

        let output = ShellModule
            .execute(&params, &local_context())
            .await
            .unwrap();
        assert_eq!(output.stdout.unwrap().trim(), "2");
    }

    #[tokio::test]
    async fn test_command_failure_reported() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("false"));

        let output = CommandModule
            .execute(&params, &local_context())
            .await
            .unwrap();
        assert_eq!(output.status, super::super::ModuleStatus::Failed);
        assert_eq!(output.rc, Some(1));
    }

    #[tokio::test]
    async fn test_creates_short_circuit() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("echo side-effect"));
        params.insert("creates".to_string(), json!("/"));

        let output = CommandModule
            .execute(&params, &local_context())
            .await
            .unwrap();
        assert!(!output.changed);
        assert!(output.msg.contains("skipped"));
    }

    #[tokio::test]
    async fn test_check_mode_skips() {
        let mut params = ModuleParams::new();
        params.insert("cmd".to_string(), json!("rm -rf /tmp/never"));

        let mut context = local_context();
        context.check_mode = true;
        let output = CommandModule.execute(&params, &context).await.unwrap();
        assert_eq!(output.status, super::super::ModuleStatus::Skipped);
    }

    #[tokio::test]
    async fn test_argv_form() {
        let mut params = ModuleParams::new();
        params.insert("argv".to_string(), json!(["echo", "a b"]));

        let output = CommandModule
            .execute(&params, &local_context())
            .await
            .unwrap();
        assert_eq!(output.stdout.unwrap().trim(), "a b");
    }
}
