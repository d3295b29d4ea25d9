//! Setup module: the minimal fact gatherer.
//!
//! Collects hostname, OS family, distribution, architecture, and kernel
//! from the target and reports them under `ansible_facts`, with both bare
//! and `ansible_`-prefixed names.

use super::{Module, ModuleContext, ModuleOutput, ModuleParams, ModuleResult};
use crate::connection::ShellKind;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Gather a minimal fact set from the target.
pub struct SetupModule;

impl SetupModule {
    async fn run(&self, context: &ModuleContext, command: &str) -> Option<String> {
        let options = context.exec_options(ShellKind::Posix);
        match context.connection.execute(command, Some(options)).await {
            Ok(result) if result.rc == 0 => Some(result.stdout.trim().to_string()),
            _ => None,
        }
    }
}

/// Map an os-release ID / ID_LIKE to the conventional family name.
fn os_family(id: &str, id_like: &str) -> String {
    let haystack = format!("{} {}", id, id_like).to_lowercase();
    for (needle, family) in [
        ("debian", "Debian"),
        ("ubuntu", "Debian"),
        ("rhel", "RedHat"),
        ("fedora", "RedHat"),
        ("centos", "RedHat"),
        ("suse", "Suse"),
        ("alpine", "Alpine"),
        ("arch", "Archlinux"),
    ] {
        if haystack.contains(needle) {
            return family.to_string();
        }
    }
    "Linux".to_string()
}

/// Pull `KEY=value` fields out of os-release text.
fn os_release_field<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .map(|v| v.trim_matches('"'))
    })
}

#[async_trait]
impl Module for SetupModule {
    fn name(&self) -> &'static str {
        "setup"
    }

    fn aliases(&self) -> &'static [&'static str] {
        &["gather_facts"]
    }

    fn description(&self) -> &'static str {
        "Gather a minimal set of facts from the target"
    }

    async fn execute(
        &self,
        _params: &ModuleParams,
        context: &ModuleContext,
    ) -> ModuleResult<ModuleOutput> {
        let hostname = self
            .run(context, "uname -n")
            .await
            .unwrap_or_else(|| "unknown".to_string());
        let kernel = self.run(context, "uname -r").await.unwrap_or_default();
        let system = self
            .run(context, "uname -s")
            .await
            .unwrap_or_else(|| "Linux".to_string());
        let architecture = self.run(context, "uname -m").await.unwrap_or_default();

        let os_release = self
            .run(context, "cat /etc/os-release 2>/dev/null || true")
            .await
            .unwrap_or_default();
        let distribution = os_release_field(&os_release, "NAME")
            .map(str::to_string)
            .unwrap_or_else(|| system.clone());
        let distribution_version = os_release_field(&os_release, "VERSION_ID")
            .map(str::to_string)
            .unwrap_or_default();
        let family = if system == "Darwin" {
            "Darwin".to_string()
        } else {
            os_family(
                os_release_field(&os_release, "ID").unwrap_or(""),
                os_release_field(&os_release, "ID_LIKE").unwrap_or(""),
            )
        };

        let short_hostname = hostname.split('.').next().unwrap_or(&hostname).to_string();

        let mut facts = serde_json::Map::new();
        let entries: [(&str, Value); 7] = [
            ("hostname", json!(short_hostname)),
            ("fqdn", json!(hostname)),
            ("os_family", json!(family)),
            ("distribution", json!(distribution)),
            ("distribution_version", json!(distribution_version)),
            ("architecture", json!(architecture)),
            ("kernel", json!(kernel)),
        ];
        for (key, value) in entries {
            facts.insert(key.to_string(), value.clone());
            facts.insert(format!("ansible_{}", key), value);
        }
        facts.insert("ansible_system".to_string(), json!(system));

        Ok(ModuleOutput::ok("facts gathered").with_data("ansible_facts", Value::Object(facts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::local_context;

    #[test]
    fn test_os_family_mapping() {
        assert_eq!(os_family("ubuntu", "debian"), "Debian");
        assert_eq!(os_family("centos", "rhel fedora"), "RedHat");
        assert_eq!(os_family("nixos", ""), "Linux");
    }

    #[test]
    fn test_os_release_field() {
        let content = "NAME=\"Debian GNU/Linux\"\nID=debian\nVERSION_ID=\"12\"\n";
        assert_eq!(os_release_field(content, "NAME"), Some("Debian GNU/Linux"));
        assert_eq!(os_release_field(content, "VERSION_ID"), Some("12"));
        assert_eq!(os_release_field(content, "MISSING"), None);
    }

    #[tokio::test]
    async fn test_setup_gathers_required_facts() {
        let output = SetupModule
            .execute(&ModuleParams::new(), &local_context())
            .await
            .unwrap();
        let facts = output.data["ansible_facts"].as_object().unwrap();
        for key in ["hostname", "os_family", "distribution", "architecture"] {
            assert!(facts.contains_key(key), "missing fact {key}");
            assert!(
                facts.contains_key(&format!("ansible_{key}")),
                "missing prefixed fact {key}"
            );
        }
    }
}
