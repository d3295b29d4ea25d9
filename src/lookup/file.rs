//! File-backed lookups: `file`, `lines`, `fileglob`, and `first_found`.

use super::{LookupContext, LookupError, LookupPlugin, LookupResult};
use serde_json::Value;

/// Reads whole files, trailing newline stripped.
#[derive(Debug, Clone, Default)]
pub struct FileLookup;

impl LookupPlugin for FileLookup {
    fn name(&self) -> &'static str {
        "file"
    }

    fn lookup(&self, terms: &[String], context: &LookupContext) -> LookupResult<Vec<Value>> {
        let mut results = Vec::with_capacity(terms.len());
        for term in terms {
            let path = context.resolve(term);
            if !path.is_file() {
                return Err(LookupError::FileNotFound(path));
            }
            let content = std::fs::read_to_string(&path)?;
            results.push(Value::String(
                content.strip_suffix('\n').unwrap_or(&content).to_string(),
            ));
        }
        Ok(results)
    }
}

/// Reads files and yields one value per line.
#[derive(Debug, Clone, Default)]
pub struct LinesLookup;

impl LookupPlugin for LinesLookup {
    fn name(&self) -> &'static str {
        "lines"
    }

    fn lookup(&self, terms: &[String], context: &LookupContext) -> LookupResult<Vec<Value>> {
        let mut results = Vec::new();
        for term in terms {
            let path = context.resolve(term);
            if !path.is_file() {
                return Err(LookupError::FileNotFound(path));
            }
            let content = std::fs::read_to_string(&path)?;
            results.extend(content.lines().map(|l| Value::String(l.to_string())));
        }
        Ok(results)
    }
}

/// Expands shell-style globs to matching file paths, sorted.
#[derive(Debug, Clone, Default)]
pub struct FileGlobLookup;

impl LookupPlugin for FileGlobLookup {
    fn name(&self) -> &'static str {
        "fileglob"
    }

    fn lookup(&self, terms: &[String], context: &LookupContext) -> LookupResult<Vec<Value>> {
        let mut results = Vec::new();
        for term in terms {
            let pattern = context.resolve(term);
            let pattern = pattern.to_string_lossy();
            let paths = glob::glob(&pattern).map_err(|e| LookupError::Failed {
                plugin: "fileglob".to_string(),
                message: format!("invalid pattern '{}': {}", term, e),
            })?;
            let mut matched: Vec<String> = paths
                .filter_map(|entry| entry.ok())
                .filter(|p| p.is_file())
                .map(|p| p.to_string_lossy().to_string())
                .collect();
            matched.sort();
            results.extend(matched.into_iter().map(Value::String));
        }
        Ok(results)
    }
}

/// Returns the first path from the candidate list that exists.
#[derive(Debug, Clone, Default)]
pub struct FirstFoundLookup;

impl LookupPlugin for FirstFoundLookup {
    fn name(&self) -> &'static str {
        "first_found"
    }

    fn lookup(&self, terms: &[String], context: &LookupContext) -> LookupResult<Vec<Value>> {
        for term in terms {
            let path = context.resolve(term);
            if path.exists() {
                return Ok(vec![Value::String(path.to_string_lossy().to_string())]);
            }
        }
        Err(LookupError::Failed {
            plugin: "first_found".to_string(),
            message: format!("no file found among {} candidate(s)", terms.len()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn ctx(dir: &tempfile::TempDir) -> LookupContext {
        LookupContext::new(dir.path().to_path_buf())
    }

    #[test]
    fn test_file_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut f = std::fs::File::create(dir.path().join("greeting.txt")).unwrap();
        writeln!(f, "hello").unwrap();

        let result = FileLookup
            .lookup(&["greeting.txt".to_string()], &ctx(&dir))
            .unwrap();
        assert_eq!(result, vec![Value::String("hello".to_string())]);
    }

    #[test]
    fn test_file_lookup_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileLookup
            .lookup(&["missing.txt".to_string()], &ctx(&dir))
            .unwrap_err();
        assert!(matches!(err, LookupError::FileNotFound(_)));
    }

    #[test]
    fn test_lines_lookup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lines.txt"), "one\ntwo\nthree\n").unwrap();

        let result = LinesLookup
            .lookup(&["lines.txt".to_string()], &ctx(&dir))
            .unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[1], Value::String("two".to_string()));
    }

    #[test]
    fn test_fileglob_lookup_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.conf"), "").unwrap();
        std::fs::write(dir.path().join("a.conf"), "").unwrap();
        std::fs::write(dir.path().join("c.txt"), "").unwrap();

        let result = FileGlobLookup
            .lookup(&["*.conf".to_string()], &ctx(&dir))
            .unwrap();
        let names: Vec<String> = result
            .iter()
            .map(|v| v.as_str().unwrap().rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.conf", "b.conf"]);
    }

    #[test]
    fn test_first_found() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("second.yml"), "").unwrap();

        let result = FirstFoundLookup
            .lookup(
                &["first.yml".to_string(), "second.yml".to_string()],
                &ctx(&dir),
            )
            .unwrap();
        assert!(result[0].as_str().unwrap().ends_with("second.yml"));

        assert!(FirstFoundLookup
            .lookup(&["nope".to_string()], &ctx(&dir))
            .is_err());
    }
}
