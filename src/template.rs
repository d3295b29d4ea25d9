//! Jinja2-compatible templating and expression evaluation.
//!
//! Strings are rendered through a shared [`minijinja`] environment with
//! strict-undefined semantics: referencing a name that is neither defined
//! nor given a default raises [`TemplateError`]. Three entry points cover
//! the engine's uses: [`TemplateEngine::render_string`] for plain text,
//! [`TemplateEngine::render_structure`] for trees (every string leaf is
//! rendered, non-string scalars pass through), and
//! [`TemplateEngine::evaluate_when`] for conditions (bare expressions, a
//! list means AND of its elements).
//!
//! Variables may reference other templated variables; resolution iterates
//! until a pass produces no change, capped at [`MAX_RENDER_PASSES`] passes.
//! On cap exhaustion the last partial result is returned and a diagnostic
//! is logged.

use crate::lookup::{LookupContext, LookupRegistry};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use indexmap::IndexMap;
use minijinja::value::{Rest, Value as MjValue};
use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Cap on iterative variable resolution passes.
pub const MAX_RENDER_PASSES: usize = 10;

/// Errors raised by rendering, expression evaluation, or lookups.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The expression failed to parse or render. Carries the failing
    /// expression text.
    #[error("template error in {expression:?}: {message}")]
    Render {
        /// The template or expression that failed
        expression: String,
        /// Underlying message
        message: String,
    },

    /// A lookup plugin failed.
    #[error(transparent)]
    Lookup(#[from] crate::lookup::LookupError),
}

impl TemplateError {
    fn render(expression: &str, err: &minijinja::Error) -> Self {
        // The innermost error carries the useful message (undefined name,
        // bad filter arguments, ...).
        let mut message = err.to_string();
        let mut source = std::error::Error::source(err);
        while let Some(inner) = source {
            message = inner.to_string();
            source = inner.source();
        }
        TemplateError::Render {
            expression: expression.to_string(),
            message,
        }
    }
}

/// Result type for template operations.
pub type TemplateResult<T> = Result<T, TemplateError>;

/// The shared template engine: one configured environment plus the lookup
/// registry. Static tables are read-only after construction, so the engine
/// is freely shared across host workers.
#[derive(Clone)]
pub struct TemplateEngine {
    env: Arc<Environment<'static>>,
    lookups: Arc<LookupRegistry>,
    base_dir: PathBuf,
}

impl std::fmt::Debug for TemplateEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateEngine")
            .field("base_dir", &self.base_dir)
            .finish()
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(".")
    }
}

impl TemplateEngine {
    /// Create an engine. Relative lookup paths resolve against `base_dir`
    /// (normally the playbook directory).
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base_dir = base_dir.as_ref().to_path_buf();
        let lookups = Arc::new(LookupRegistry::with_builtins());

        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);

        register_filters(&mut env);
        register_tests(&mut env);
        register_functions(&mut env, Arc::clone(&lookups), base_dir.clone());

        Self {
            env: Arc::new(env),
            lookups,
            base_dir,
        }
    }

    /// The directory relative lookup paths resolve against.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The lookup registry backing `lookup()`/`query()`.
    pub fn lookups(&self) -> &LookupRegistry {
        &self.lookups
    }

    /// True when the string contains template markers.
    pub fn has_template(text: &str) -> bool {
        text.contains("{{") || text.contains("{%") || text.contains("{#")
    }

    /// Render a string, iterating while the output still contains template
    /// markers (nested variable references), up to [`MAX_RENDER_PASSES`].
    pub fn render_string(
        &self,
        text: &str,
        vars: &IndexMap<String, Value>,
    ) -> TemplateResult<String> {
        if !Self::has_template(text) {
            return Ok(text.to_string());
        }

        let ctx = MjValue::from_serialize(vars);
        let mut current = text.to_string();

        for pass in 0..MAX_RENDER_PASSES {
            if !Self::has_template(&current) {
                return Ok(current);
            }
            let rendered = self
                .env
                .render_str(&current, &ctx)
                .map_err(|e| TemplateError::render(text, &e))?;
            if rendered == current {
                return Ok(rendered);
            }
            debug!(pass, "template required another resolution pass");
            current = rendered;
        }

        warn!(
            template = %text,
            "variable resolution did not converge within {} passes",
            MAX_RENDER_PASSES
        );
        Ok(current)
    }

    /// Render a string into a typed value. A string that is exactly one
    /// `{{ … }}` expression evaluates to the expression's native value
    /// (lists stay lists, numbers stay numbers); anything else renders to a
    /// string.
    pub fn render_value(
        &self,
        text: &str,
        vars: &IndexMap<String, Value>,
    ) -> TemplateResult<Value> {
        if let Some(expr) = whole_expression(text) {
            let ctx = MjValue::from_serialize(vars);
            let compiled = self
                .env
                .compile_expression(expr)
                .map_err(|e| TemplateError::render(text, &e))?;
            let value = compiled
                .eval(&ctx)
                .map_err(|e| TemplateError::render(text, &e))?;
            let mut json = mj_to_json(&value, text)?;
            // The expression may have produced another template layer.
            for _ in 0..MAX_RENDER_PASSES {
                let nested = match &json {
                    Value::String(s) if Self::has_template(s) => s.clone(),
                    _ => break,
                };
                json = self.render_value(&nested, vars)?;
            }
            return Ok(json);
        }

        self.render_string(text, vars).map(Value::String)
    }

    /// Recursively render every string leaf of a tree, preserving
    /// non-string scalars. Rendering an already-resolved structure returns
    /// an equal structure.
    pub fn render_structure(
        &self,
        tree: &Value,
        vars: &IndexMap<String, Value>,
    ) -> TemplateResult<Value> {
        match tree {
            Value::String(s) => self.render_value(s, vars),
            Value::Array(items) => {
                let rendered: TemplateResult<Vec<Value>> = items
                    .iter()
                    .map(|item| self.render_structure(item, vars))
                    .collect();
                Ok(Value::Array(rendered?))
            }
            Value::Object(map) => {
                let mut rendered = serde_json::Map::new();
                for (key, value) in map {
                    let key = self.render_string(key, vars)?;
                    rendered.insert(key, self.render_structure(value, vars)?);
                }
                Ok(Value::Object(rendered))
            }
            other => Ok(other.clone()),
        }
    }

    /// Evaluate one bare `when` expression to a boolean.
    pub fn evaluate_expression(
        &self,
        expr: &str,
        vars: &IndexMap<String, Value>,
    ) -> TemplateResult<bool> {
        let trimmed = expr.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }

        // Conditions are bare expressions, but embedded markers are
        // tolerated by resolving them first.
        let prepared = if Self::has_template(trimmed) {
            self.render_string(trimmed, vars)?
        } else {
            trimmed.to_string()
        };

        let compiled = self
            .env
            .compile_expression(&prepared)
            .map_err(|e| TemplateError::render(expr, &e))?;
        let ctx = MjValue::from_serialize(vars);
        let value = compiled
            .eval(&ctx)
            .map_err(|e| TemplateError::render(expr, &e))?;

        Ok(mj_truthy(&value))
    }

    /// Evaluate a `when` condition: a list of expressions means AND.
    pub fn evaluate_when(
        &self,
        exprs: &[String],
        vars: &IndexMap<String, Value>,
    ) -> TemplateResult<bool> {
        for expr in exprs {
            if !self.evaluate_expression(expr, vars)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run a lookup plugin directly (used by `vars_files` candidates and
    /// the modules that take lookup-style arguments).
    pub fn lookup(&self, name: &str, terms: &[String]) -> TemplateResult<Vec<Value>> {
        let ctx = LookupContext::new(self.base_dir.clone());
        Ok(self.lookups.run(name, terms, &ctx)?)
    }
}

/// If the text is exactly one `{{ … }}` expression, return its inside.
fn whole_expression(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    // Reject "{{ a }} and {{ b }}": the inside must not open another block.
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

/// Truthiness for condition results: native booleans pass through, strings
/// follow the YAML convention, everything else uses the engine's notion.
fn mj_truthy(value: &MjValue) -> bool {
    if let Some(s) = value.as_str() {
        return !matches!(
            s.trim().to_lowercase().as_str(),
            "" | "false" | "no" | "off" | "0"
        );
    }
    value.is_true()
}

/// Convert an engine value back to the JSON value model.
fn mj_to_json(value: &MjValue, expression: &str) -> TemplateResult<Value> {
    serde_json::to_value(value).map_err(|e| TemplateError::Render {
        expression: expression.to_string(),
        message: e.to_string(),
    })
}

fn invalid_input(msg: impl Into<String>) -> minijinja::Error {
    minijinja::Error::new(minijinja::ErrorKind::InvalidOperation, msg.into())
}

fn register_filters(env: &mut Environment<'static>) {
    env.add_filter("lower", |s: String| s.to_lowercase());
    env.add_filter("upper", |s: String| s.to_uppercase());
    env.add_filter("trim", |s: String| s.trim().to_string());

    env.add_filter("replace", |s: String, from: String, to: String| {
        s.replace(&from, &to)
    });

    env.add_filter(
        "regex_replace",
        |s: String, pattern: String, repl: String| -> Result<String, minijinja::Error> {
            let re = regex::Regex::new(&pattern)
                .map_err(|e| invalid_input(format!("invalid regex '{}': {}", pattern, e)))?;
            Ok(re.replace_all(&s, repl.as_str()).to_string())
        },
    );

    // default(fallback, treat_falsy=false); also registered as `d`.
    let default_filter = |value: MjValue, fallback: MjValue, falsy: Option<bool>| -> MjValue {
        let use_default = if falsy.unwrap_or(false) {
            !mj_truthy(&value)
        } else {
            value.is_undefined() || value.is_none()
        };
        if use_default {
            fallback
        } else {
            value
        }
    };
    env.add_filter("default", default_filter);
    env.add_filter("d", default_filter);

    env.add_filter("to_json", |value: MjValue| -> Result<String, minijinja::Error> {
        serde_json::to_string(&value).map_err(|e| invalid_input(e.to_string()))
    });
    env.add_filter("to_nice_json", |value: MjValue| -> Result<String, minijinja::Error> {
        serde_json::to_string_pretty(&value).map_err(|e| invalid_input(e.to_string()))
    });
    env.add_filter("to_yaml", |value: MjValue| -> Result<String, minijinja::Error> {
        serde_yaml::to_string(&value).map_err(|e| invalid_input(e.to_string()))
    });
    env.add_filter("from_json", |s: String| -> Result<MjValue, minijinja::Error> {
        let parsed: Value = serde_json::from_str(&s).map_err(|e| invalid_input(e.to_string()))?;
        Ok(MjValue::from_serialize(&parsed))
    });
    env.add_filter("from_yaml", |s: String| -> Result<MjValue, minijinja::Error> {
        let parsed: serde_yaml::Value =
            serde_yaml::from_str(&s).map_err(|e| invalid_input(e.to_string()))?;
        Ok(MjValue::from_serialize(&crate::vars::yaml_to_json(&parsed)))
    });

    env.add_filter("join", |value: MjValue, sep: Option<String>| -> Result<String, minijinja::Error> {
        let sep = sep.unwrap_or_default();
        let items = value
            .try_iter()
            .map_err(|_| invalid_input("join expects a sequence"))?;
        let parts: Vec<String> = items
            .map(|item| match item.as_str() {
                Some(s) => s.to_string(),
                None => item.to_string(),
            })
            .collect();
        Ok(parts.join(&sep))
    });

    env.add_filter("first", |value: MjValue| -> Result<MjValue, minijinja::Error> {
        if let Some(s) = value.as_str() {
            return Ok(s
                .chars()
                .next()
                .map(|c| MjValue::from(c.to_string()))
                .unwrap_or(MjValue::UNDEFINED));
        }
        let mut items = value
            .try_iter()
            .map_err(|_| invalid_input("first expects a sequence"))?;
        Ok(items.next().unwrap_or(MjValue::UNDEFINED))
    });

    env.add_filter("last", |value: MjValue| -> Result<MjValue, minijinja::Error> {
        if let Some(s) = value.as_str() {
            return Ok(s
                .chars()
                .last()
                .map(|c| MjValue::from(c.to_string()))
                .unwrap_or(MjValue::UNDEFINED));
        }
        let items = value
            .try_iter()
            .map_err(|_| invalid_input("last expects a sequence"))?;
        Ok(items.last().unwrap_or(MjValue::UNDEFINED))
    });

    env.add_filter("length", |value: MjValue| -> Result<usize, minijinja::Error> {
        value
            .len()
            .or_else(|| value.as_str().map(|s| s.chars().count()))
            .ok_or_else(|| invalid_input("value has no length"))
    });
    env.add_filter("count", |value: MjValue| -> Result<usize, minijinja::Error> {
        value
            .len()
            .or_else(|| value.as_str().map(|s| s.chars().count()))
            .ok_or_else(|| invalid_input("value has no length"))
    });

    env.add_filter("int", |value: MjValue| -> i64 {
        if let Some(s) = value.as_str() {
            s.trim().parse().unwrap_or(0)
        } else if let Ok(n) = i64::try_from(value.clone()) {
            n
        } else if let Ok(f) = f64::try_from(value) {
            f as i64
        } else {
            0
        }
    });

    env.add_filter("bool", |value: MjValue| mj_truthy(&value));

    env.add_filter("string", |value: MjValue| -> String {
        match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        }
    });

    env.add_filter("basename", |s: String| -> String {
        Path::new(&s)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string()
    });
    env.add_filter("dirname", |s: String| -> String {
        Path::new(&s)
            .parent()
            .and_then(|p| p.to_str())
            .unwrap_or_default()
            .to_string()
    });

    env.add_filter("b64encode", |s: String| BASE64.encode(s.as_bytes()));
    env.add_filter("b64decode", |s: String| -> Result<String, minijinja::Error> {
        let bytes = BASE64
            .decode(s.as_bytes())
            .map_err(|e| invalid_input(format!("invalid base64: {}", e)))?;
        String::from_utf8(bytes).map_err(|e| invalid_input(format!("invalid utf-8: {}", e)))
    });

    env.add_filter(
        "combine",
        |base: MjValue, others: Rest<MjValue>| -> Result<MjValue, minijinja::Error> {
            let mut merged = match serde_json::to_value(&base) {
                Ok(Value::Object(map)) => map,
                _ => return Err(invalid_input("combine expects mappings")),
            };
            for other in others.iter() {
                match serde_json::to_value(other) {
                    Ok(Value::Object(map)) => merged.extend(map),
                    _ => return Err(invalid_input("combine expects mappings")),
                }
            }
            Ok(MjValue::from_serialize(&Value::Object(merged)))
        },
    );

    env.add_filter("flatten", |value: MjValue| -> Result<MjValue, minijinja::Error> {
        fn walk(value: &Value, out: &mut Vec<Value>) {
            match value {
                Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
                other => out.push(other.clone()),
            }
        }
        let json = serde_json::to_value(&value).map_err(|e| invalid_input(e.to_string()))?;
        let mut out = Vec::new();
        walk(&json, &mut out);
        Ok(MjValue::from_serialize(&out))
    });

    env.add_filter("unique", |value: MjValue| -> Result<MjValue, minijinja::Error> {
        let items = value
            .try_iter()
            .map_err(|_| invalid_input("unique expects a sequence"))?;
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for item in items {
            if seen.insert(item.to_string()) {
                out.push(item);
            }
        }
        Ok(MjValue::from(out))
    });

    env.add_filter("quote", |s: String| -> String {
        format!("'{}'", s.replace('\'', r#"'"'"'"#))
    });
}

fn register_tests(env: &mut Environment<'static>) {
    // Result-shaped tests operate on a registered task result mapping.
    fn attr_truthy(value: &MjValue, key: &str) -> bool {
        value
            .get_attr(key)
            .ok()
            .map(|v| mj_truthy(&v))
            .unwrap_or(false)
    }
    fn status_is(value: &MjValue, expected: &str) -> bool {
        value
            .get_attr("status")
            .ok()
            .and_then(|v| v.as_str().map(|s| s == expected))
            .unwrap_or(false)
    }

    env.add_test("failed", |value: MjValue| {
        attr_truthy(&value, "failed") || status_is(&value, "failed")
    });
    let success = |value: MjValue| {
        !attr_truthy(&value, "failed")
            && !status_is(&value, "failed")
            && !status_is(&value, "unreachable")
    };
    env.add_test("success", success);
    env.add_test("succeeded", success);
    env.add_test("changed", |value: MjValue| attr_truthy(&value, "changed"));
    env.add_test("skipped", |value: MjValue| {
        attr_truthy(&value, "skipped") || status_is(&value, "skipped")
    });

    env.add_test("string", |value: MjValue| value.as_str().is_some());
    env.add_test("number", |value: MjValue| {
        matches!(
            value.kind(),
            minijinja::value::ValueKind::Number
        )
    });
    env.add_test("mapping", |value: MjValue| {
        matches!(value.kind(), minijinja::value::ValueKind::Map)
    });
    env.add_test("sequence", |value: MjValue| {
        matches!(value.kind(), minijinja::value::ValueKind::Seq)
    });
    env.add_test("iterable", |value: MjValue| value.try_iter().is_ok());
}

fn register_functions(
    env: &mut Environment<'static>,
    lookups: Arc<LookupRegistry>,
    base_dir: PathBuf,
) {
    let run_lookup = move |name: &str, args: &[MjValue]| -> Result<Vec<Value>, minijinja::Error> {
        let terms: Vec<String> = args
            .iter()
            .map(|v| match v.as_str() {
                Some(s) => s.to_string(),
                None => v.to_string(),
            })
            .collect();
        let ctx = LookupContext::new(base_dir.clone());
        lookups
            .run(name, &terms, &ctx)
            .map_err(|e| invalid_input(e.to_string()))
    };

    {
        let run = run_lookup.clone();
        env.add_function(
            "lookup",
            move |name: String, args: Rest<MjValue>| -> Result<MjValue, minijinja::Error> {
                let mut results = run(&name, &args.0)?;
                let value = if results.len() == 1 {
                    results.remove(0)
                } else {
                    Value::Array(results)
                };
                Ok(MjValue::from_serialize(&value))
            },
        );
    }
    {
        let run = run_lookup;
        env.add_function(
            "query",
            move |name: String, args: Rest<MjValue>| -> Result<MjValue, minijinja::Error> {
                let results = run(&name, &args.0)?;
                Ok(MjValue::from_serialize(&results))
            },
        );
    }

    env.add_function("now", || -> String {
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
    });

    // Sentinel for "leave this argument out entirely".
    env.add_function("omit", || MjValue::from(crate::modules::OMIT_SENTINEL));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_render_plain_string_untouched() {
        let engine = TemplateEngine::default();
        let result = engine.render_string("no markers here", &IndexMap::new()).unwrap();
        assert_eq!(result, "no markers here");
    }

    #[test]
    fn test_render_simple_variable() {
        let engine = TemplateEngine::default();
        let vars = vars(&[("name", json!("world"))]);
        assert_eq!(
            engine.render_string("Hello, {{ name }}!", &vars).unwrap(),
            "Hello, world!"
        );
    }

    #[test]
    fn test_strict_undefined_errors() {
        let engine = TemplateEngine::default();
        let err = engine
            .render_string("{{ missing }}", &IndexMap::new())
            .unwrap_err();
        match err {
            TemplateError::Render { expression, .. } => {
                assert_eq!(expression, "{{ missing }}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_default_filter_covers_undefined() {
        let engine = TemplateEngine::default();
        let result = engine
            .render_string("{{ missing | default('fallback') }}", &IndexMap::new())
            .unwrap();
        assert_eq!(result, "fallback");
    }

    #[test]
    fn test_iterative_resolution() {
        let engine = TemplateEngine::default();
        let vars = vars(&[
            ("a", json!("{{ b }}")),
            ("b", json!("{{ c }}")),
            ("c", json!("bottom")),
        ]);
        assert_eq!(engine.render_string("{{ a }}", &vars).unwrap(), "bottom");
    }

    #[test]
    fn test_self_reference_returns_last_stable() {
        let engine = TemplateEngine::default();
        let vars = vars(&[("a", json!("{{ a }}"))]);
        // Does not diverge; the last partial result is the raw reference.
        let result = engine.render_string("{{ a }}", &vars).unwrap();
        assert_eq!(result, "{{ a }}");
    }

    #[test]
    fn test_whole_expression_keeps_type() {
        let engine = TemplateEngine::default();
        let vars = vars(&[("items", json!([1, 2, 3])), ("n", json!(7))]);
        assert_eq!(
            engine.render_value("{{ items }}", &vars).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(engine.render_value("{{ n }}", &vars).unwrap(), json!(7));
        // Mixed content renders to a string.
        assert_eq!(
            engine.render_value("n is {{ n }}", &vars).unwrap(),
            json!("n is 7")
        );
    }

    #[test]
    fn test_render_structure_idempotent() {
        let engine = TemplateEngine::default();
        let vars = vars(&[("port", json!(8080))]);
        let tree = json!({
            "listen": "{{ port }}",
            "enabled": true,
            "tags": ["a", "{{ port }}"],
        });
        let once = engine.render_structure(&tree, &vars).unwrap();
        assert_eq!(
            once,
            json!({"listen": 8080, "enabled": true, "tags": ["a", 8080]})
        );
        let twice = engine.render_structure(&once, &vars).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_evaluate_when_bare_expression() {
        let engine = TemplateEngine::default();
        let vars = vars(&[("item", json!("a"))]);
        assert!(engine
            .evaluate_when(&["item != 'b'".to_string()], &vars)
            .unwrap());
        assert!(!engine
            .evaluate_when(&["item == 'b'".to_string()], &vars)
            .unwrap());
    }

    #[test]
    fn test_evaluate_when_list_is_and() {
        let engine = TemplateEngine::default();
        let vars = vars(&[("x", json!(5))]);
        assert!(engine
            .evaluate_when(&["x > 1".to_string(), "x < 10".to_string()], &vars)
            .unwrap());
        assert!(!engine
            .evaluate_when(&["x > 1".to_string(), "x > 10".to_string()], &vars)
            .unwrap());
    }

    #[test]
    fn test_evaluate_when_defined_test() {
        let engine = TemplateEngine::default();
        let vars = vars(&[("present", json!(1))]);
        assert!(engine
            .evaluate_when(&["present is defined".to_string()], &vars)
            .unwrap());
        assert!(engine
            .evaluate_when(&["absent is undefined".to_string()], &vars)
            .unwrap());
    }

    #[test]
    fn test_evaluate_when_undefined_reference_errors() {
        let engine = TemplateEngine::default();
        assert!(engine
            .evaluate_when(&["missing == 1".to_string()], &IndexMap::new())
            .is_err());
    }

    #[test]
    fn test_result_tests() {
        let engine = TemplateEngine::default();
        let vars = vars(&[(
            "r",
            json!({"status": "failed", "failed": true, "changed": false}),
        )]);
        assert!(engine.evaluate_when(&["r is failed".to_string()], &vars).unwrap());
        assert!(!engine
            .evaluate_when(&["r is success".to_string()], &vars)
            .unwrap());
        assert!(!engine
            .evaluate_when(&["r is changed".to_string()], &vars)
            .unwrap());
    }

    #[test]
    fn test_mandatory_filters() {
        let engine = TemplateEngine::default();
        let vars = vars(&[
            ("s", json!("  Mixed Case  ")),
            ("path", json!("/etc/app/conf.d/main.cfg")),
            ("list", json!(["a", "b", "c"])),
            ("map1", json!({"a": 1})),
            ("map2", json!({"b": 2})),
        ]);

        let cases: &[(&str, &str)] = &[
            ("{{ s | trim | lower }}", "mixed case"),
            ("{{ s | trim | upper }}", "MIXED CASE"),
            ("{{ 'aaa' | replace('a', 'b') }}", "bbb"),
            ("{{ 'web42' | regex_replace('[0-9]+', 'N') }}", "webN"),
            ("{{ list | join(',') }}", "a,b,c"),
            ("{{ list | first }}", "a"),
            ("{{ list | last }}", "c"),
            ("{{ list | length }}", "3"),
            ("{{ '42' | int + 1 }}", "43"),
            ("{{ 'yes' | bool }}", "true"),
            ("{{ 7 | string }}", "7"),
            ("{{ path | basename }}", "main.cfg"),
            ("{{ path | dirname }}", "/etc/app/conf.d"),
            ("{{ 'hi' | b64encode }}", "aGk="),
            ("{{ 'aGk=' | b64decode }}", "hi"),
        ];
        for (template, expected) in cases {
            assert_eq!(
                engine.render_string(template, &vars).unwrap(),
                *expected,
                "template: {template}"
            );
        }

        assert_eq!(
            engine
                .render_value("{{ map1 | combine(map2) }}", &vars)
                .unwrap(),
            json!({"a": 1, "b": 2})
        );
        assert_eq!(
            engine.render_value("{{ list | to_json }}", &vars).unwrap(),
            json!(r#"["a","b","c"]"#)
        );
    }

    #[test]
    fn test_b64_round_trip() {
        let engine = TemplateEngine::default();
        let vars = vars(&[("data", json!("round trip payload"))]);
        assert_eq!(
            engine
                .render_string("{{ data | b64encode | b64decode }}", &vars)
                .unwrap(),
            "round trip payload"
        );
    }

    #[test]
    fn test_env_lookup() {
        std::env::set_var("STAGEHAND_TEST_VAR", "from-env");
        let engine = TemplateEngine::default();
        assert_eq!(
            engine
                .render_string("{{ lookup('env', 'STAGEHAND_TEST_VAR') }}", &IndexMap::new())
                .unwrap(),
            "from-env"
        );
    }

    #[test]
    fn test_bad_filter_args_raise() {
        let engine = TemplateEngine::default();
        assert!(engine
            .render_string("{{ 'x' | regex_replace('[', 'y') }}", &IndexMap::new())
            .is_err());
    }
}
