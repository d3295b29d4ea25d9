//! Template module: render a local template and upload it like `copy`.

use super::copy::{remote_checksum, sha256_hex};
use super::{
    Diff, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::TransferOptions;
use crate::template::TemplateEngine;
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

/// Render a template file with the host's variables and upload it.
pub struct TemplateModule;

#[async_trait]
impl Module for TemplateModule {
    fn name(&self) -> &'static str {
        "template"
    }

    fn description(&self) -> &'static str {
        "Render a local template to the target"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["src", "dest"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["mode"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let src = params.get_string_required("src")?;
        let dest = params.get_string_required("dest")?;
        let dest_path = Path::new(&dest);
        let mode = params.get_mode("mode")?;

        let src_path = context.resolve_local_path(&src);
        let raw = tokio::fs::read_to_string(&src_path).await.map_err(|e| {
            ModuleError::ExecutionFailed(format!(
                "cannot read template {}: {}",
                src_path.display(),
                e
            ))
        })?;

        let engine = TemplateEngine::new(
            src_path
                .parent()
                .unwrap_or_else(|| Path::new(".")),
        );
        let rendered = engine
            .render_string(&raw, &context.vars)
            .map_err(|e| ModuleError::ExecutionFailed(e.to_string()))?;

        let new_checksum = sha256_hex(rendered.as_bytes());
        let existing = remote_checksum(context, dest_path).await?;
        let changed = match &existing {
            Some((checksum, _)) => *checksum != new_checksum,
            None => true,
        };

        if !changed {
            return Ok(ModuleOutput::ok("template already up to date")
                .with_data("checksum", json!(new_checksum)));
        }

        let diff = if context.diff_mode {
            let before = match &existing {
                Some((_, bytes)) if bytes.is_empty() => {
                    let old = context.connection.download_content(dest_path).await?;
                    String::from_utf8_lossy(&old).to_string()
                }
                Some((_, bytes)) => String::from_utf8_lossy(bytes).to_string(),
                None => String::new(),
            };
            Some(Diff::for_path(&dest, before, rendered.clone()))
        } else {
            None
        };

        if context.check_mode {
            let mut output =
                ModuleOutput::changed(format!("would render {} to {}", src, dest));
            if let Some(d) = diff {
                output = output.with_diff(d);
            }
            return Ok(output);
        }

        context
            .connection
            .upload_content(
                rendered.as_bytes(),
                dest_path,
                Some(TransferOptions {
                    mode,
                    create_dirs: true,
                }),
            )
            .await?;

        let mut output = ModuleOutput::changed(format!("rendered {} to {}", src, dest))
            .with_data("checksum", json!(new_checksum))
            .with_data("dest", json!(dest));
        if let Some(d) = diff {
            output = output.with_diff(d);
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::local_context;
    use serde_json::json;

    #[tokio::test]
    async fn test_template_renders_vars() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.conf.j2");
        std::fs::write(&src, "port={{ http_port }}\n").unwrap();
        let dest = dir.path().join("app.conf");

        let mut params = ModuleParams::new();
        params.insert("src".to_string(), json!(src.to_str().unwrap()));
        params.insert("dest".to_string(), json!(dest.to_str().unwrap()));

        let mut ctx = local_context();
        ctx.vars.insert("http_port".to_string(), json!(8080));

        let first = TemplateModule.execute(&params, &ctx).await.unwrap();
        assert!(first.changed);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "port=8080\n");

        let second = TemplateModule.execute(&params, &ctx).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn test_template_undefined_var_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bad.j2");
        std::fs::write(&src, "{{ nope }}").unwrap();

        let mut params = ModuleParams::new();
        params.insert("src".to_string(), json!(src.to_str().unwrap()));
        params.insert("dest".to_string(), json!(dir.path().join("out").to_str().unwrap()));

        assert!(TemplateModule
            .execute(&params, &local_context())
            .await
            .is_err());
    }
}
