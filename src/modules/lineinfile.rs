//! Regex-based file editing: `lineinfile`, `replace`, and `blockinfile`.
//!
//! All three fetch the current content through the transport, compute the
//! edited text on the control node, and upload only when something
//! actually changes. A line that is already present reports
//! `changed=false`.

use super::{
    Diff, Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;

/// Fetch current file content; `None` when the file does not exist.
async fn read_target(
    context: &ModuleContext,
    path: &Path,
) -> ModuleResult<Option<String>> {
    let stat = context.connection.stat(path).await?;
    if !stat.exists {
        return Ok(None);
    }
    if !stat.is_file {
        return Err(ModuleError::InvalidParameter(format!(
            "{} is not a regular file",
            path.display()
        )));
    }
    let content = context.connection.download_content(path).await?;
    Ok(Some(String::from_utf8_lossy(&content).to_string()))
}

/// Write the edited content back, honoring check mode and diff mode.
async fn apply_edit(
    context: &ModuleContext,
    path: &Path,
    before: &str,
    after: String,
    msg: &str,
) -> ModuleResult<ModuleOutput> {
    if before == after {
        return Ok(ModuleOutput::ok("no change required"));
    }

    let diff = context
        .diff_mode
        .then(|| Diff::for_path(&path.to_string_lossy(), before, after.clone()));

    if context.check_mode {
        let mut output = ModuleOutput::changed(format!("would {}", msg));
        if let Some(d) = diff {
            output = output.with_diff(d);
        }
        return Ok(output);
    }

    context
        .connection
        .upload_content(after.as_bytes(), path, None)
        .await?;

    let mut output = ModuleOutput::changed(msg.to_string());
    if let Some(d) = diff {
        output = output.with_diff(d);
    }
    Ok(output)
}

fn compile(pattern: &str) -> ModuleResult<Regex> {
    Regex::new(pattern)
        .map_err(|e| ModuleError::InvalidParameter(format!("invalid regexp '{}': {}", pattern, e)))
}

/// Ensure a single line is present in (or absent from) a file.
pub struct LineinfileModule;

#[async_trait]
impl Module for LineinfileModule {
    fn name(&self) -> &'static str {
        "lineinfile"
    }

    fn description(&self) -> &'static str {
        "Manage a single line in a file"
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
        let path_str = params.get_string_required("path")?;
        let path = Path::new(&path_str);
        let state = params
            .get_string("state")?
            .unwrap_or_else(|| "present".to_string());
        let create = params.get_bool_or("create", false);
        let regexp = params
            .get_string("regexp")?
            .map(|p| compile(&p))
            .transpose()?;

        let existing = read_target(context, path).await?;
        let content = match &existing {
            Some(content) => content.clone(),
            None if state == "absent" => {
                return Ok(ModuleOutput::ok("file does not exist"));
            }
            None if create => String::new(),
            None => {
                return Ok(ModuleOutput::failed(format!(
                    "{} does not exist; set create=true to create it",
                    path_str
                )))
            }
        };

        let had_trailing_newline = content.is_empty() || content.ends_with('\n');
        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();

        match state.as_str() {
            "present" => {
                let line = params.get_string_required("line")?;

                if let Some(re) = &regexp {
                    if let Some(idx) = lines.iter().rposition(|l| re.is_match(l)) {
                        if lines[idx] == line {
                            return Ok(ModuleOutput::ok("line already present"));
                        }
                        lines[idx] = line;
                        let after = join_lines(&lines, had_trailing_newline);
                        return apply_edit(context, path, &content, after, "line replaced").await;
                    }
                }

                if lines.iter().any(|l| *l == line) {
                    return Ok(ModuleOutput::ok("line already present"));
                }

                let insert_at = insertion_index(params, &lines)?;
                lines.insert(insert_at, line);
                let after = join_lines(&lines, true);
                apply_edit(context, path, &content, after, "line added").await
            }
            "absent" => {
                let line = params.get_string("line")?;
                let before_len = lines.len();
                lines.retain(|l| {
                    let matched = regexp.as_ref().map(|re| re.is_match(l)).unwrap_or(false)
                        || line.as_deref() == Some(l.as_str());
                    !matched
                });
                if lines.len() == before_len {
                    return Ok(ModuleOutput::ok("no matching line"));
                }
                let after = join_lines(&lines, had_trailing_newline);
                apply_edit(context, path, &content, after, "line(s) removed").await
            }
            other => Err(ModuleError::InvalidParameter(format!(
                "unknown state '{}'",
                other
            ))),
        }
    }
}

/// Where to insert a new line given insertafter/insertbefore.
fn insertion_index(params: &ModuleParams, lines: &[String]) -> ModuleResult<usize> {
    if let Some(spec) = params.get_string("insertbefore")? {
        if spec == "BOF" {
            return Ok(0);
        }
        let re = compile(&spec)?;
        if let Some(idx) = lines.iter().position(|l| re.is_match(l)) {
            return Ok(idx);
        }
        return Ok(lines.len());
    }
    if let Some(spec) = params.get_string("insertafter")? {
        if spec != "EOF" {
            let re = compile(&spec)?;
            if let Some(idx) = lines.iter().rposition(|l| re.is_match(l)) {
                return Ok(idx + 1);
            }
        }
    }
    Ok(lines.len())
}

fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    let mut joined = lines.join("\n");
    if trailing_newline && !lines.is_empty() {
        joined.push('\n');
    }
    joined
}

/// Replace every regex match in a file.
pub struct ReplaceModule;

#[async_trait]
impl Module for ReplaceModule {
    fn name(&self) -> &'static str {
        "replace"
    }

    fn description(&self) -> &'static str {
        "Replace all regex matches in a file"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path", "regexp"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["replace"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path_str = params.get_string_required("path")?;
        let path = Path::new(&path_str);
        let re = compile(&params.get_string_required("regexp")?)?;
        let replacement = params.get_string("replace")?.unwrap_or_default();

        let Some(content) = read_target(context, path).await? else {
            return Ok(ModuleOutput::failed(format!("{} does not exist", path_str)));
        };

        let after = re.replace_all(&content, replacement.as_str()).to_string();
        apply_edit(context, path, &content, after, "content replaced").await
    }
}

/// Maintain a marker-delimited block of text in a file.
pub struct BlockinfileModule;

const DEFAULT_MARKER: &str = "# {mark} MANAGED BLOCK";

#[async_trait]
impl Module for BlockinfileModule {
    fn name(&self) -> &'static str {
        "blockinfile"
    }

    fn description(&self) -> &'static str {
        "Insert, update, or remove a marked block of lines"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["path"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["block", "marker", "state", "create"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path_str = params.get_string_required("path")?;
        let path = Path::new(&path_str);
        let state = params
            .get_string("state")?
            .unwrap_or_else(|| "present".to_string());
        let create = params.get_bool_or("create", false);
        let block = params.get_string("block")?.unwrap_or_default();
        let marker = params
            .get_string("marker")?
            .unwrap_or_else(|| DEFAULT_MARKER.to_string());
        let begin = marker.replace("{mark}", "BEGIN");
        let end = marker.replace("{mark}", "END");

        let existing = read_target(context, path).await?;
        let content = match existing {
            Some(content) => content,
            None if state == "absent" => return Ok(ModuleOutput::ok("file does not exist")),
            None if create => String::new(),
            None => {
                return Ok(ModuleOutput::failed(format!(
                    "{} does not exist; set create=true to create it",
                    path_str
                )))
            }
        };

        let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
        let begin_idx = lines.iter().position(|l| *l == begin);
        let end_idx = lines.iter().position(|l| *l == end);

        // Drop any existing block, markers included.
        if let (Some(b), Some(e)) = (begin_idx, end_idx) {
            if b < e {
                lines.drain(b..=e);
            }
        }

        let insert_at = begin_idx.unwrap_or(lines.len());
        if state == "present" && !block.is_empty() {
            let mut new_block = vec![begin.clone()];
            new_block.extend(block.lines().map(str::to_string));
            new_block.push(end.clone());
            for (offset, line) in new_block.into_iter().enumerate() {
                lines.insert(insert_at + offset, line);
            }
        }

        let after = join_lines(&lines, true);
        apply_edit(context, path, &content, after, "block updated").await
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
    async fn test_lineinfile_appends_then_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg");
        std::fs::write(&file, "a=1\n").unwrap();

        let p = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("line", json!("b=2")),
        ]);
        let first = LineinfileModule.execute(&p, &local_context()).await.unwrap();
        assert!(first.changed);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "a=1\nb=2\n");

        let second = LineinfileModule.execute(&p, &local_context()).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn test_lineinfile_regexp_replace() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg");
        std::fs::write(&file, "port=80\nname=x\n").unwrap();

        let p = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("regexp", json!("^port=")),
            ("line", json!("port=8080")),
        ]);
        let output = LineinfileModule.execute(&p, &local_context()).await.unwrap();
        assert!(output.changed);
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "port=8080\nname=x\n"
        );
    }

    #[tokio::test]
    async fn test_lineinfile_absent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg");
        std::fs::write(&file, "keep\ndrop-me\nkeep2\n").unwrap();

        let p = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("regexp", json!("^drop")),
            ("state", json!("absent")),
        ]);
        let output = LineinfileModule.execute(&p, &local_context()).await.unwrap();
        assert!(output.changed);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "keep\nkeep2\n");
    }

    #[tokio::test]
    async fn test_lineinfile_insertafter() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg");
        std::fs::write(&file, "[section]\nother=1\n").unwrap();

        let p = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("line", json!("new=2")),
            ("insertafter", json!(r"^\[section\]")),
        ]);
        LineinfileModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "[section]\nnew=2\nother=1\n"
        );
    }

    #[tokio::test]
    async fn test_lineinfile_missing_without_create_fails() {
        let p = params(&[("path", json!("/not/there")), ("line", json!("x"))]);
        let output = LineinfileModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(output.status, ModuleStatus::Failed);
    }

    #[tokio::test]
    async fn test_replace_module() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hosts");
        std::fs::write(&file, "10.0.0.1 web\n10.0.0.2 web\n").unwrap();

        let p = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("regexp", json!("web")),
            ("replace", json!("app")),
        ]);
        let output = ReplaceModule.execute(&p, &local_context()).await.unwrap();
        assert!(output.changed);
        assert_eq!(
            std::fs::read_to_string(&file).unwrap(),
            "10.0.0.1 app\n10.0.0.2 app\n"
        );

        let second = ReplaceModule.execute(&p, &local_context()).await.unwrap();
        assert!(!second.changed);
    }

    #[tokio::test]
    async fn test_blockinfile_insert_update_remove() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg");
        std::fs::write(&file, "top\n").unwrap();
        let ctx = local_context();

        let p = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("block", json!("alpha\nbeta")),
        ]);
        let first = BlockinfileModule.execute(&p, &ctx).await.unwrap();
        assert!(first.changed);
        let content = std::fs::read_to_string(&file).unwrap();
        assert!(content.contains("# BEGIN MANAGED BLOCK\nalpha\nbeta\n# END MANAGED BLOCK"));

        // Same block again: no change.
        let second = BlockinfileModule.execute(&p, &ctx).await.unwrap();
        assert!(!second.changed);

        // Updated block replaces in place.
        let p2 = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("block", json!("gamma")),
        ]);
        let third = BlockinfileModule.execute(&p2, &ctx).await.unwrap();
        assert!(third.changed);
        let content = std::fs::read_to_string(&file).unwrap();
        assert!(content.contains("gamma"));
        assert!(!content.contains("alpha"));

        // state=absent removes block and markers.
        let p3 = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("state", json!("absent")),
        ]);
        let fourth = BlockinfileModule.execute(&p3, &ctx).await.unwrap();
        assert!(fourth.changed);
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "top\n");
    }

    #[tokio::test]
    async fn test_diff_mode_payload() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg");
        std::fs::write(&file, "old\n").unwrap();

        let p = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("regexp", json!("old")),
            ("replace", json!("new")),
        ]);
        let mut ctx = local_context();
        ctx.diff_mode = true;
        let output = ReplaceModule.execute(&p, &ctx).await.unwrap();
        let diff = output.diff.unwrap();
        assert_eq!(diff.before, "old\n");
        assert_eq!(diff.after, "new\n");
        assert_eq!(diff.before_header, file.to_str().unwrap());
    }
}
