//! File module: manage path state on the target.
//!
//! Supported states: `absent`, `directory`, `touch`, `file`, `link`.
//! Ensuring `state=directory` on an existing directory reports
//! `changed=false`.

use super::{
    Diff, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::ShellKind;
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

/// Manage file and directory state.
pub struct FileModule;

#[async_trait]
impl Module for FileModule {
    fn name(&self) -> &'static str {
        "file"
    }

    fn description(&self) -> &'static str {
        "Manage file, directory, and link state"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["state", "mode", "src"]
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
        let mode = params.get_mode("mode")?;
        let target = Path::new(&path);

        let stat = context.connection.stat(target).await?;

        match state.as_str() {
            "absent" => {
                if !stat.exists {
                    return Ok(ModuleOutput::ok(format!("{} already absent", path)));
                }
                let diff = context
                    .diff_mode
                    .then(|| Diff::for_path(&path, format!("{} present\n", path), ""));
                if context.check_mode {
                    let mut out = ModuleOutput::changed(format!("would remove {}", path));
                    if let Some(d) = diff {
                        out = out.with_diff(d);
                    }
                    return Ok(out);
                }
                let command = format!("rm -rf {}", shell_words::quote(&path));
                let result = context
                    .connection
                    .execute(&command, Some(context.exec_options(ShellKind::Posix)))
                    .await?;
                if result.rc != 0 {
                    return Ok(ModuleOutput::failed(format!(
                        "failed to remove {}: {}",
                        path, result.stderr
                    )));
                }
                let mut out = ModuleOutput::changed(format!("removed {}", path));
                if let Some(d) = diff {
                    out = out.with_diff(d);
                }
                Ok(out)
            }

            "directory" => {
                if stat.exists && stat.is_dir {
                    return Ok(ModuleOutput::ok(format!("{} is already a directory", path))
                        .with_data("path", json!(path)));
                }
                if stat.exists && !stat.is_dir {
                    return Ok(ModuleOutput::failed(format!(
                        "{} exists and is not a directory",
                        path
                    )));
                }
                if context.check_mode {
                    return Ok(ModuleOutput::changed(format!("would create {}", path)));
                }
                context.connection.mkdir(target, mode).await?;
                Ok(ModuleOutput::changed(format!("created directory {}", path))
                    .with_data("path", json!(path)))
            }

            "touch" => {
                if context.check_mode {
                    return Ok(if stat.exists {
                        ModuleOutput::ok(format!("{} exists", path))
                    } else {
                        ModuleOutput::changed(format!("would touch {}", path))
                    });
                }
                let existed = stat.exists;
                if !existed {
                    context
                        .connection
                        .upload_content(b"", target, Some(crate::connection::TransferOptions {
                            mode,
                            create_dirs: true,
                        }))
                        .await?;
                } else {
                    let command = format!("touch {}", shell_words::quote(&path));
                    let result = context
                        .connection
                        .execute(&command, Some(context.exec_options(ShellKind::Posix)))
                        .await?;
                    if result.rc != 0 {
                        return Ok(ModuleOutput::failed(format!(
                            "touch failed: {}",
                            result.stderr
                        )));
                    }
                }
                if existed {
                    Ok(ModuleOutput::ok(format!("{} exists", path)))
                } else {
                    Ok(ModuleOutput::changed(format!("touched {}", path)))
                }
            }

            "file" => {
                if !stat.exists {
                    return Ok(ModuleOutput::failed(format!(
                        "{} does not exist; use state=touch to create it",
                        path
                    )));
                }
                if !stat.is_file {
                    return Ok(ModuleOutput::failed(format!("{} is not a regular file", path)));
                }
                // Only mode adjustments apply for an existing file.
                if let Some(mode) = mode {
                    if stat.mode.map(|m| m & 0o7777) != Some(mode) {
                        if context.check_mode {
                            return Ok(ModuleOutput::changed(format!(
                                "would set mode {:o} on {}",
                                mode, path
                            )));
                        }
                        let command =
                            format!("chmod {:o} {}", mode, shell_words::quote(&path));
                        let result = context
                            .connection
                            .execute(&command, Some(context.exec_options(ShellKind::Posix)))
                            .await?;
                        if result.rc != 0 {
                            return Ok(ModuleOutput::failed(format!(
                                "chmod failed: {}",
                                result.stderr
                            )));
                        }
                        return Ok(ModuleOutput::changed(format!(
                            "mode of {} set to {:o}",
                            path, mode
                        )));
                    }
                }
                Ok(ModuleOutput::ok(format!("{} is in the requested state", path)))
            }

            "link" => {
                let src = params.get_string("src")?.ok_or_else(|| {
                    ModuleError::MissingParameter("src (required for state=link)".to_string())
                })?;
                if stat.is_symlink {
                    // Re-linking to the same target is a no-op; resolve the
                    // current target to compare.
                    let command = format!("readlink {}", shell_words::quote(&path));
                    let result = context
                        .connection
                        .execute(&command, Some(context.exec_options(ShellKind::Posix)))
                        .await?;
                    if result.rc == 0 && result.stdout.trim() == src {
                        return Ok(ModuleOutput::ok(format!("{} already links to {}", path, src)));
                    }
                }
                if context.check_mode {
                    return Ok(ModuleOutput::changed(format!(
                        "would link {} -> {}",
                        path, src
                    )));
                }
                let command = format!(
                    "ln -sfn {} {}",
                    shell_words::quote(&src),
                    shell_words::quote(&path)
                );
                let result = context
                    .connection
                    .execute(&command, Some(context.exec_options(ShellKind::Posix)))
                    .await?;
                if result.rc != 0 {
                    return Ok(ModuleOutput::failed(format!(
                        "link failed: {}",
                        result.stderr
                    )));
                }
                Ok(ModuleOutput::changed(format!("linked {} -> {}", path, src)))
            }

            other => Err(ModuleError::InvalidParameter(format!(
                "unknown state '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::local_context;
    use crate::modules::ModuleStatus;
    use serde_json::json;

    fn params(pairs: &[(&str, serde_json::Value)]) -> ModuleParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_directory_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("made");
        let p = params(&[
            ("path", json!(target.to_str().unwrap())),
            ("state", json!("directory")),
        ]);
        let ctx = local_context();

        let first = FileModule.execute(&p, &ctx).await.unwrap();
        assert!(first.changed);
        assert!(target.is_dir());

        let second = FileModule.execute(&p, &ctx).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn test_touch_then_exists() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("touched");
        let p = params(&[
            ("path", json!(target.to_str().unwrap())),
            ("state", json!("touch")),
        ]);

        let first = FileModule.execute(&p, &local_context()).await.unwrap();
        assert!(first.changed);
        assert!(target.is_file());
    }

    #[tokio::test]
    async fn test_absent_removes() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("doomed");
        std::fs::write(&target, "x").unwrap();

        let p = params(&[
            ("path", json!(target.to_str().unwrap())),
            ("state", json!("absent")),
        ]);
        let output = FileModule.execute(&p, &local_context()).await.unwrap();
        assert!(output.changed);
        assert!(!target.exists());

        let again = FileModule.execute(&p, &local_context()).await.unwrap();
        assert!(!again.changed);
    }

    #[tokio::test]
    async fn test_link_and_relink() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("target.txt");
        std::fs::write(&src, "content").unwrap();
        let link = dir.path().join("alias");

        let p = params(&[
            ("path", json!(link.to_str().unwrap())),
            ("state", json!("link")),
            ("src", json!(src.to_str().unwrap())),
        ]);
        let first = FileModule.execute(&p, &local_context()).await.unwrap();
        assert!(first.changed);

        let second = FileModule.execute(&p, &local_context()).await.unwrap();
        assert!(!second.changed, "relink to same target is a no-op");
    }

    #[tokio::test]
    async fn test_file_state_on_missing_fails() {
        let p = params(&[
            ("path", json!("/definitely/not/here")),
            ("state", json!("file")),
        ]);
        let output = FileModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(output.status, ModuleStatus::Failed);
    }

    #[tokio::test]
    async fn test_check_mode_does_not_create() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("ghost");
        let p = params(&[
            ("path", json!(target.to_str().unwrap())),
            ("state", json!("directory")),
        ]);
        let mut ctx = local_context();
        ctx.check_mode = true;

        let output = FileModule.execute(&p, &ctx).await.unwrap();
        assert!(output.changed);
        assert!(!target.exists());
    }
}
