use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::env::EnvMap;

/// Everything one deploy invocation runs against.
///
/// `env` is the resolved configuration. Hooks may add keys to it
/// before validation; nothing downstream reads the process
/// environment directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployContext {
    pub repo_root: PathBuf,
    pub env: EnvMap,
    #[serde(default)]
    pub args: Value,
}

impl DeployContext {
    #[must_use]
    pub fn new(repo_root: &Path, env: EnvMap) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            env,
            args: Value::Object(Map::new()),
        }
    }

    /// Record the parsed command-line options for hooks to inspect.
    #[must_use]
    pub fn with_args(mut self, args: &impl Serialize) -> Self {
        self.args = serde_json::to_value(args).unwrap_or(Value::Null);
        self
    }
}

/// The mutable description of one deployment. Hooks may change
/// any field before the manifest is rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeployPlan {
    /// Container group (or stack) name.
    pub name: String,
    pub location: String,
    pub dns_label: String,

    /// e.g. `full`, `web-caddy`.
    pub deploy_mode: String,
    /// Compose service that provided the app container.
    pub compose_service_name: String,
    /// Infrastructure role of that service (`app`, `sidecar`).
    pub deploy_role: String,

    pub app_image: String,
    pub caddy_image: String,
    pub other_image: Option<String>,

    pub app_cpu: f64,
    pub app_memory: f64,
    pub caddy_cpu: f64,
    pub caddy_memory: f64,
    pub other_cpu: f64,
    pub other_memory: f64,

    pub public_domain: String,

    /// Primary port the proxy forwards to.
    pub app_port: Option<u16>,
    #[serde(default)]
    pub app_ports: Vec<u16>,
    pub web_command: Option<Vec<String>>,

    #[serde(default = "default_service_mode")]
    pub service_mode: String,

    #[serde(default)]
    pub extra_env: IndexMap<String, String>,

    /// Open bag for extension data.
    #[serde(default)]
    pub extra_metadata: Map<String, Value>,
}

fn default_service_mode() -> String {
    "app".to_string()
}

impl DeployPlan {
    #[must_use]
    pub fn new(name: &str, location: &str, app_image: &str) -> Self {
        Self {
            name: name.to_string(),
            location: location.to_string(),
            dns_label: name.to_lowercase(),
            deploy_mode: "full".to_string(),
            compose_service_name: "app".to_string(),
            deploy_role: "app".to_string(),
            app_image: app_image.to_string(),
            caddy_image: "caddy:2-alpine".to_string(),
            other_image: None,
            app_cpu: 1.0,
            app_memory: 2.0,
            caddy_cpu: 0.5,
            caddy_memory: 0.5,
            other_cpu: 0.5,
            other_memory: 0.5,
            public_domain: String::new(),
            app_port: Some(8080),
            app_ports: Vec::new(),
            web_command: None,
            service_mode: default_service_mode(),
            extra_env: IndexMap::new(),
            extra_metadata: Map::new(),
        }
    }

    /// Public FQDN the platform assigns to the group.
    #[must_use]
    pub fn fallback_fqdn(&self) -> String {
        format!("{}.{}.azurecontainer.io", self.dns_label, self.location)
    }
}

/// What a successful apply reports back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub target: String,
    pub url: Option<String>,
    pub details: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_roundtrips_through_json() {
        let mut plan = DeployPlan::new("My-App", "westeurope", "ghcr.io/acme/app:1");
        plan.extra_metadata
            .insert("team".into(), Value::String("platform".into()));
        let json = serde_json::to_string(&plan).unwrap();
        let back: DeployPlan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        assert_eq!(back.dns_label, "my-app");
    }

    #[test]
    fn missing_optional_fields_default() {
        let mut value = serde_json::to_value(DeployPlan::new("a", "b", "c")).unwrap();
        let obj = value.as_object_mut().unwrap();
        obj.remove("service_mode");
        obj.remove("extra_env");
        let plan: DeployPlan = serde_json::from_value(value).unwrap();
        assert_eq!(plan.service_mode, "app");
        assert!(plan.extra_env.is_empty());
    }

    #[test]
    fn context_records_args() {
        #[derive(Serialize)]
        struct Args {
            dry_run: bool,
        }
        let ctx = DeployContext::new(Path::new("/repo"), EnvMap::new()).with_args(&Args { dry_run: true });
        assert_eq!(ctx.args["dry_run"], Value::Bool(true));
    }

    #[test]
    fn fqdn_uses_label_and_location() {
        let plan = DeployPlan::new("web", "eastus", "img");
        assert_eq!(plan.fallback_fqdn(), "web.eastus.azurecontainer.io");
    }
}
