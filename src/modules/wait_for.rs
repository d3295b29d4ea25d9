//! Wait-for module: block until a path or TCP port reaches a state.

use super::{
    Module, ModuleContext, ModuleError, ModuleOutput, ModuleParams, ModuleResult, ParamExt,
};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;

const DEFAULT_TIMEOUT_SECS: u64 = 300;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wait for a file to appear/disappear or a TCP port to open/close.
/// Path checks go through the task's transport; port checks connect from
/// the control node to the given host.
pub struct WaitForModule;

impl WaitForModule {
    async fn port_open(host: &str, port: u16) -> bool {
        tokio::time::timeout(
            Duration::from_secs(2),
            TcpStream::connect((host, port)),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false)
    }
}

#[async_trait]
impl Module for WaitForModule {
    fn name(&self) -> &'static str {
        "wait_for"
    }

    fn description(&self) -> &'static str {
        "Wait for a path or port condition"
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["path", "port", "host", "state", "timeout", "delay"]
    }

    async fn execute(
        &self,
        params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let path = params.get_string("path")?;
        let port = params.get_u64("port")?;
        if path.is_none() && port.is_none() {
            return Err(ModuleError::InvalidParameter(
                "either 'path' or 'port' is required".to_string(),
            ));
        }

        let state = params
            .get_string("state")?
            .unwrap_or_else(|| "started".to_string());
        let want_present = matches!(state.as_str(), "started" | "present");
        let timeout = params.get_u64("timeout")?.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let delay = params.get_u64("delay")?.unwrap_or(0);

        if context.check_mode {
            return Ok(ModuleOutput::skipped("wait_for skipped in check mode"));
        }

        if delay > 0 {
            tokio::time::sleep(Duration::from_secs(delay)).await;
        }

        let host = params.get_string("host")?.unwrap_or_else(|| {
            context
                .vars
                .get("ansible_host")
                .or_else(|| context.vars.get("inventory_hostname"))
                .and_then(Value::as_str)
                .unwrap_or("127.0.0.1")
                .to_string()
        });

        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout);
        let mut elapsed = delay;

        loop {
            let satisfied = if let Some(path) = &path {
                let stat = context.connection.stat(Path::new(path)).await?;
                stat.exists == want_present
            } else {
                let port = port.unwrap() as u16;
                Self::port_open(&host, port).await == want_present
            };

            if satisfied {
                return Ok(ModuleOutput::ok(format!(
                    "condition met after {}s",
                    elapsed
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                let what = path
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", host, port.unwrap()));
                return Ok(ModuleOutput::failed(format!(
                    "timeout waiting for {} ({}s)",
                    what, timeout
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            elapsed += 1;
        }
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
    async fn test_wait_for_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("ready");
        std::fs::write(&file, "").unwrap();

        let p = params(&[
            ("path", json!(file.to_str().unwrap())),
            ("timeout", json!(2)),
        ]);
        let output = WaitForModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(output.status, ModuleStatus::Ok);
    }

    #[tokio::test]
    async fn test_wait_for_absent_path_times_out() {
        let p = params(&[("path", json!("/never/appears")), ("timeout", json!(0))]);
        let output = WaitForModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(output.status, ModuleStatus::Failed);
    }

    #[tokio::test]
    async fn test_wait_for_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let p = params(&[
            ("port", json!(port)),
            ("host", json!("127.0.0.1")),
            ("timeout", json!(2)),
        ]);
        let output = WaitForModule.execute(&p, &local_context()).await.unwrap();
        assert_eq!(output.status, ModuleStatus::Ok);
    }

    #[tokio::test]
    async fn test_wait_for_requires_target() {
        let err = WaitForModule
            .execute(&ModuleParams::new(), &local_context())
            .await
            .unwrap_err();
        assert!(matches!(err, ModuleError::InvalidParameter(_)));
    }
}
