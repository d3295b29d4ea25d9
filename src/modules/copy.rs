//! Copy module: upload a local file (or inline content) to the target.
//!
//! Change detection compares SHA-256 checksums; uploading identical
//! content a second time reports `changed=false`.

use super::{
    Diff, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::TransferOptions;
use async_trait::async_trait;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::Path;

pub(crate) fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Read the source bytes: inline `content` wins over `src`.
async fn source_bytes(
    params: &ModuleParams,
    context: &ModuleContext,
) -> ModuleResult<(Vec<u8>, String)> {
    if let Some(content) = params.get_string("content")? {
        return Ok((content.into_bytes(), "(content)".to_string()));
    }
    let src = params
        .get_string("src")?
        .ok_or_else(|| ModuleError::MissingParameter("src or content".to_string()))?;
    let path = context.resolve_local_path(&src);
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        ModuleError::ExecutionFailed(format!("cannot read source {}: {}", path.display(), e))
    })?;
    Ok((bytes, path.display().to_string()))
}

/// Checksum of the current remote file, when it exists and is a file.
pub(crate) async fn remote_checksum(
    context: &ModuleContext,
    dest: &Path,
) -> ModuleResult<Option<(String, Vec<u8>)>> {
    let stat = context.connection.stat(dest).await?;
    if !stat.exists || !stat.is_file {
        return Ok(None);
    }
    // Transports that checksum in stat save us the download.
    if let Some(checksum) = stat.checksum {
        return Ok(Some((checksum, Vec::new())));
    }
    let content = context.connection.download_content(dest).await?;
    Ok(Some((sha256_hex(&content), content)))
}

/// Upload a file to the target host.
pub struct CopyModule;

#[async_trait]
impl Module for CopyModule {
    fn name(&self) -> &'static str {
        "copy"
    }

    fn description(&self) -> &'static str {
        "Copy a file or inline content to the target"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["dest"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["src", "content", "mode", "backup", "force"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let dest = params.get_string_required("dest")?;
        let dest_path = Path::new(&dest);
        let mode = params.get_mode("mode")?;
        let force = params.get_bool_or("force", true);

        let (content, src_label) = source_bytes(params, context).await?;
        let new_checksum = sha256_hex(&content);

        let existing = remote_checksum(context, dest_path).await?;
        let changed = match &existing {
            Some((checksum, _)) => *checksum != new_checksum,
            None => true,
        };

        if !changed {
            return Ok(ModuleOutput::ok("file already up to date")
                .with_data("checksum", json!(new_checksum))
                .with_data("dest", json!(dest)));
        }
        if existing.is_some() && !force {
            return Ok(ModuleOutput::ok("destination exists, force=false")
                .with_data("dest", json!(dest)));
        }

        let diff = if context.diff_mode {
            let before = match &existing {
                // Stat-provided checksums skip the download; fetch the old
                // content now that we know we need it for the diff.
                Some((_, bytes)) if bytes.is_empty() => {
                    let old = context.connection.download_content(dest_path).await?;
                    String::from_utf8_lossy(&old).to_string()
                }
                Some((_, bytes)) => String::from_utf8_lossy(bytes).to_string(),
                None => String::new(),
            };
            Some(Diff::for_path(
                &dest,
                before,
                String::from_utf8_lossy(&content).to_string(),
            ))
        } else {
            None
        };

        if context.check_mode {
            let mut output = ModuleOutput::changed(format!("would copy {} to {}", src_label, dest))
                .with_data("checksum", json!(new_checksum));
            if let Some(diff) = diff {
                output = output.with_diff(diff);
            }
            return Ok(output);
        }

        let options = TransferOptions {
            mode,
            create_dirs: true,
        };
        context
            .connection
            .upload_content(&content, dest_path, Some(options))
            .await?;

        let mut output = ModuleOutput::changed(format!("copied {} to {}", src_label, dest))
            .with_data("checksum", json!(new_checksum))
            .with_data("dest", json!(dest))
            .with_data("size", json!(content.len()));
        if let Some(diff) = diff {
            output = output.with_diff(diff);
        }
        Ok(output)
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
    async fn test_copy_content_then_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.txt");
        let p = params(&[
            ("content", json!("payload\n")),
            ("dest", json!(dest.to_str().unwrap())),
        ]);
        let ctx = local_context();

        let first = CopyModule.execute(&p, &ctx).await.unwrap();
        assert!(first.changed);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "payload\n");

        let second = CopyModule.execute(&p, &ctx).await.unwrap();
        assert!(!second.changed);
        assert_eq!(second.status, ModuleStatus::Ok);
    }

    #[tokio::test]
    async fn test_copy_src_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"\x00\x01\x02").unwrap();
        let dest = dir.path().join("dest.bin");

        let p = params(&[
            ("src", json!(src.to_str().unwrap())),
            ("dest", json!(dest.to_str().unwrap())),
        ]);
        let output = CopyModule.execute(&p, &local_context()).await.unwrap();
        assert!(output.changed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"\x00\x01\x02");
    }

    #[tokio::test]
    async fn test_copy_check_mode_does_not_write() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("never.txt");
        let p = params(&[
            ("content", json!("x")),
            ("dest", json!(dest.to_str().unwrap())),
        ]);

        let mut ctx = local_context();
        ctx.check_mode = true;
        let output = CopyModule.execute(&p, &ctx).await.unwrap();
        assert!(output.changed);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_copy_diff_mode() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("d.txt");
        std::fs::write(&dest, "old\n").unwrap();

        let p = params(&[
            ("content", json!("new\n")),
            ("dest", json!(dest.to_str().unwrap())),
        ]);
        let mut ctx = local_context();
        ctx.diff_mode = true;
        let output = CopyModule.execute(&p, &ctx).await.unwrap();
        let diff = output.diff.unwrap();
        assert_eq!(diff.before, "old\n");
        assert_eq!(diff.after, "new\n");
    }
}
