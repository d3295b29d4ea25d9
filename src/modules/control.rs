//! Control-node modules: `debug`, `set_fact`, `assert`, `fail`, `ping`,
//! `meta`, `add_host`, `group_by`, and `include_vars`.
//!
//! These never touch the remote host (except `ping`, whose whole point is
//! a round trip). Modules that change runner state (`set_fact`,
//! `add_host`, `group_by`, `include_vars`, `meta`) communicate through
//! well-known keys in their result data, applied by the runner.

use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use crate::connection::ShellKind;
use crate::template::TemplateEngine;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Print a message or a variable's value.
pub struct DebugModule;

#[async_trait]
impl Module for DebugModule {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn description(&self) -> &'static str {
        "Print a message or variable during execution"
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["msg", "var"]
    }

    fn control_node(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let text = if let Some(var) = params.get_string("var")? {
            let value = context.vars.get(&var).cloned().unwrap_or(Value::Null);
            format!("{}: {}", var, serde_json::to_string(&value).unwrap_or_default())
        } else {
            params
                .get_string("msg")?
                .unwrap_or_else(|| "Hello world!".to_string())
        };

        let mut output = ModuleOutput::ok(text.clone());
        output.stdout = Some(text);
        Ok(output)
    }
}

/// Set host-scoped facts for the rest of the play.
pub struct SetFactModule;

#[async_trait]
impl Module for SetFactModule {
    fn name(&self) -> &'static str {
        "set_fact"
    }

    fn description(&self) -> &'static str {
        "Set variables on the host context"
    }

    fn control_node(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let mut facts = serde_json::Map::new();
        for (key, value) in params {
            if key == "cacheable" {
                continue;
            }
            facts.insert(key.clone(), value.clone());
        }

        Ok(ModuleOutput::ok(format!("{} fact(s) set", facts.len()))
            .with_data("ansible_facts", Value::Object(facts)))
    }
}

/// Evaluate one or more expressions and fail unless they all hold.
pub struct AssertModule;

#[async_trait]
impl Module for AssertModule {
    fn name(&self) -> &'static str {
        "assert"
    }

    fn description(&self) -> &'static str {
        "Fail unless the given expressions are true"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["that"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["fail_msg", "success_msg"]
    }

    fn control_node(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let conditions: Vec<String> = match params.get("that") {
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                })
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => {
                return Err(ModuleError::InvalidParameter(
                    "'that' must be a string or list of expressions".to_string(),
                ))
            }
        };

        let engine = TemplateEngine::default();
        for condition in &conditions {
            let holds = engine
                .evaluate_expression(condition, &context.vars)
                .map_err(|e| ModuleError::ExecutionFailed(e.to_string()))?;
            if !holds {
                let msg = params
                    .get_string("fail_msg")?
                    .unwrap_or_else(|| format!("assertion failed: {}", condition));
                return Ok(ModuleOutput::failed(msg)
                    .with_data("assertion", json!(condition))
                    .with_data("evaluated_to", json!(false)));
            }
        }

        let msg = params
            .get_string("success_msg")?
            .unwrap_or_else(|| "all assertions passed".to_string());
        Ok(ModuleOutput::ok(msg))
    }
}

/// Fail unconditionally.
pub struct FailModule;

#[async_trait]
impl Module for FailModule {
    fn name(&self) -> &'static str {
        "fail"
    }

    fn description(&self) -> &'static str {
        "Fail with a custom message"
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["msg"]
    }

    fn control_node(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let msg = params
            .get_string("msg")?
            .unwrap_or_else(|| "Failed as requested from task".to_string());
        Ok(ModuleOutput::failed(msg))
    }
}

/// Verify the transport round trip.
pub struct PingModule;

#[async_trait]
impl Module for PingModule {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn description(&self) -> &'static str {
        "Verify the transport with a trivial round trip"
    }

    async fn execute(
        &self,
        _params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let result = context
            .connection
            .execute("echo pong", Some(context.exec_options(ShellKind::Posix)))
            .await?;
        if result.rc != 0 {
            return Ok(ModuleOutput::failed(format!(
                "ping round trip failed: {}",
                result.stderr
            )));
        }
        Ok(ModuleOutput::ok("pong").with_data("ping", json!("pong")))
    }
}

/// Runner directives (`flush_handlers`, `noop`).
pub struct MetaModule;

#[async_trait]
impl Module for MetaModule {
    fn name(&self) -> &'static str {
        "meta"
    }

    fn description(&self) -> &'static str {
        "Execute a runner directive"
    }

    fn free_form_param(&self) -> Option<&'static str> {
        Some("directive")
    }

    fn control_node(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let directive = params
            .get_string("directive")?
            .unwrap_or_else(|| "noop".to_string());
        match directive.as_str() {
            "flush_handlers" | "noop" => Ok(ModuleOutput::ok(directive.clone())
                .with_data("meta", json!(directive))),
            other => Err(ModuleError::InvalidParameter(format!(
                "unsupported meta directive '{}'",
                other
            ))),
        }
    }
}

/// Add a host to the in-memory inventory for subsequent plays.
pub struct AddHostModule;

#[async_trait]
impl Module for AddHostModule {
    fn name(&self) -> &'static str {
        "add_host"
    }

    fn description(&self) -> &'static str {
        "Add a host to the in-memory inventory"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["name"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["groups"]
    }

    fn control_node(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let name = params.get_string_required("name")?;
        let groups: Vec<String> = match params.get("groups") {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(Value::String(s)) => s.split(',').map(|g| g.trim().to_string()).collect(),
            _ => Vec::new(),
        };

        let mut host_vars = serde_json::Map::new();
        for (key, value) in params {
            if key != "name" && key != "groups" {
                host_vars.insert(key.clone(), value.clone());
            }
        }

        Ok(ModuleOutput::changed(format!("host {} added", name)).with_data(
            "add_host",
            json!({
                "host_name": name,
                "groups": groups,
                "host_vars": host_vars,
            }),
        ))
    }
}

/// Assign the current host to a group derived from a key expression.
pub struct GroupByModule;

#[async_trait]
impl Module for GroupByModule {
    fn name(&self) -> &'static str {
        "group_by"
    }

    fn description(&self) -> &'static str {
        "Assign the current host to a derived group"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["key"]
    }

    fn control_node(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        _context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let key = params.get_string_required("key")?;
        // Group names keep to the inventory's safe character set.
        let group = key.replace([' ', '-', '.'], "_");
        Ok(ModuleOutput::changed(format!("grouped under {}", group))
            .with_data("group_by", json!(group)))
    }
}

/// Load a vars file into the host context.
pub struct IncludeVarsModule;

#[async_trait]
impl Module for IncludeVarsModule {
    fn name(&self) -> &'static str {
        "include_vars"
    }

    fn description(&self) -> &'static str {
        "Load a variables file into the host context"
    }

    fn free_form_param(&self) -> Option<&'static str> {
        Some("file")
    }

    fn control_node(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let file = params.get_string_required("file")?;
        let path = context.resolve_local_path(&file);

        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ModuleError::ExecutionFailed(format!("cannot read {}: {}", path.display(), e))
        })?;
        let yaml: serde_yaml::Value = serde_yaml::from_str(&content)
            .map_err(|e| ModuleError::ExecutionFailed(format!("invalid vars file: {}", e)))?;
        let Value::Object(vars) = crate::vars::yaml_to_json(&yaml) else {
            return Err(ModuleError::ExecutionFailed(format!(
                "{} does not contain a mapping",
                path.display()
            )));
        };

        Ok(
            ModuleOutput::ok(format!("{} variable(s) loaded", vars.len()))
                .with_data("ansible_facts", Value::Object(vars)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::local_context;
    use crate::modules::ModuleStatus;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> ModuleParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_debug_msg() {
        let p = params(&[("msg", json!("hello web1"))]);
        let output = DebugModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(output.stdout.as_deref(), Some("hello web1"));
        assert!(!output.changed);
    }

    #[tokio::test]
    async fn test_debug_var() {
        let p = params(&[("var", json!("answer"))]);
        let mut ctx = local_context();
        ctx.vars.insert("answer".to_string(), json!(42));
        let output = DebugModule.execute(&p, &ctx).await.unwrap();
        assert_eq!(output.stdout.as_deref(), Some("answer: 42"));
    }

    #[tokio::test]
    async fn test_set_fact_reports_facts() {
        let p = params(&[("color", json!("blue")), ("count", json!(2))]);
        let output = SetFactModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(
            output.data["ansible_facts"],
            json!({"color": "blue", "count": 2})
        );
    }

    #[tokio::test]
    async fn test_assert_pass_and_fail() {
        let mut ctx = local_context();
        ctx.vars.insert("x".to_string(), json!(5));

        let ok = AssertModule
            .execute(&params(&[("that", json!(["x == 5", "x > 1"]))]), &ctx)
            .await
            .unwrap();
        assert_eq!(ok.status, ModuleStatus::Ok);

        let bad = AssertModule
            .execute(&params(&[("that", json!("x == 6"))]), &ctx)
            .await
            .unwrap();
        assert_eq!(bad.status, ModuleStatus::Failed);
    }

    #[tokio::test]
    async fn test_fail_module() {
        let output = FailModule
            .execute(&params(&[("msg", json!("boom"))]), &local_context())
            .await
            .unwrap();
        assert_eq!(output.status, ModuleStatus::Failed);
        assert_eq!(output.msg, "boom");
    }

    #[tokio::test]
    async fn test_ping() {
        let output = PingModule
            .execute(&ModuleParams::new(), &local_context())
            .await
            .unwrap();
        assert_eq!(output.data["ping"], json!("pong"));
    }

    #[tokio::test]
    async fn test_meta_flush_handlers() {
        let p = params(&[("directive", json!("flush_handlers"))]);
        let output = MetaModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(output.data["meta"], json!("flush_handlers"));

        let bad = params(&[("directive", json!("end_play"))]);
        assert!(MetaModule.execute(&bad, &local_context()).await.is_err());
    }

    #[tokio::test]
    async fn test_add_host_payload() {
        let p = params(&[
            ("name", json!("burst1")),
            ("groups", json!("web, spare")),
            ("rack", json!("r7")),
        ]);
        let output = AddHostModule.execute(&p, &local_context()).await.unwrap();
        let payload = &output.data["add_host"];
        assert_eq!(payload["host_name"], json!("burst1"));
        assert_eq!(payload["groups"], json!(["web", "spare"]));
        assert_eq!(payload["host_vars"]["rack"], json!("r7"));
    }

    #[tokio::test]
    async fn test_group_by_sanitizes() {
        let p = params(&[("key", json!("os-linux x"))]);
        let output = GroupByModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(output.data["group_by"], json!("os_linux_x"));
    }

    #[tokio::test]
    async fn test_include_vars() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("extra.yml");
        std::fs::write(&file, "region: east\nreplicas: 3\n").unwrap();

        let p = params(&[("file", json!(file.to_str().unwrap()))]);
        let output = IncludeVarsModule
            .execute(&p, &local_context())
            .await
            .unwrap();
        assert_eq!(
            output.data["ansible_facts"],
            json!({"region": "east", "replicas": 3})
        );
    }
}
