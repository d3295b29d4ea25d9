//! Stat module: query file metadata on the target.

use super::{Module, ModuleContext, ModuleOutput, ModuleParams, ModuleResult, ParamExt};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;

/// Retrieve file status, reported under the `stat` key of the result.
pub struct StatModule;

#[async_trait]
impl Module for StatModule {
    fn name(&self) -> &'static str {
        "stat"
    }

    fn description(&self) -> &'static str {
        "Retrieve file metadata"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["get_checksum"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path_str = params.get_string_required("path")?;
        let path = Path::new(&path_str);
        let want_checksum = params.get_bool_or("get_checksum", true);

        let stat = context.connection.stat(path).await?;

        let checksum = if want_checksum && stat.is_file {
            match &stat.checksum {
                Some(c) => Some(c.clone()),
                // Transports without stat-time checksums pay a download.
                None => {
                    let content = context.connection.download_content(path).await?;
                    Some(super::copy::sha256_hex(&content))
                }
            }
        } else {
            None
        };

        let mut payload = json!({
            "exists": stat.exists,
            "isdir": stat.is_dir,
            "isreg": stat.is_file,
            "islnk": stat.is_symlink,
            "size": stat.size,
            "mtime": stat.mtime,
            "path": path_str,
        });
        if let Some(mode) = stat.mode {
            payload["mode"] = json!(format!("{:04o}", mode));
        }
        if let Some(checksum) = checksum {
            payload["checksum"] = json!(checksum);
        }

        Ok(ModuleOutput::ok("stat gathered").with_data("stat", payload))
    }
}
