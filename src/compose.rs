use std::path::Path;

use docker_compose_types::Compose;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cmd;
use crate::error::{DeployError, DeployResult};
use crate::plan::DeployPlan;

/// Service extension field naming its deployment role.
pub const ROLE_KEY: &str = "x-deploy-role";
pub const ROLE_APP: &str = "app";
pub const ROLE_SIDECAR: &str = "sidecar";

/// Service that may keep a `build:` section when an image is supplied.
pub const BUILD_SERVICE: &str = "app";

fn compose_args<'a>(files: &'a [String], tail: &[&'a str]) -> Vec<&'a str> {
    let mut args = vec!["compose"];
    for file in files {
        args.extend(["-f", file.as_str()]);
    }
    args.push("config");
    args.extend_from_slice(tail);
    args
}

/// Render the merged compose config as JSON and parse it.
pub fn load_compose_config(repo_root: &Path, files: &[String]) -> DeployResult<Value> {
    let out = cmd::run_in(repo_root, "docker", &compose_args(files, &["--format", "json"]))?;
    Ok(serde_json::from_str(&out)?)
}

/// Render the merged compose config as YAML stack content.
pub fn render_compose_stack(repo_root: &Path, files: &[String]) -> DeployResult<String> {
    let out = cmd::run_in(repo_root, "docker", &compose_args(files, &[]))?;
    if out.trim().is_empty() {
        return Err(DeployError::Other(
            "docker compose config produced no output".into(),
        ));
    }
    Ok(out)
}

/// Group service names by their `x-deploy-role`. Untagged
/// services are left out.
#[must_use]
pub fn detect_services_by_role(compose: &Value) -> IndexMap<String, Vec<String>> {
    let mut roles: IndexMap<String, Vec<String>> = IndexMap::new();
    let Some(services) = compose.get("services").and_then(Value::as_object) else {
        return roles;
    };
    for (name, service) in services {
        let role = service
            .get(ROLE_KEY)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|r| !r.is_empty());
        if let Some(role) = role {
            roles.entry(role.to_string()).or_default().push(name.clone());
        }
    }
    roles
}

/// A string command runs through `sh -lc`; a list is kept as is.
#[must_use]
pub fn normalize_command(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => {
            vec!["sh".into(), "-lc".into(), s.clone()]
        }
        Some(Value::Array(items)) => items.iter().map(scalar_to_string).collect(),
        _ => Vec::new(),
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Container-side ports of a service, in declaration order.
///
/// Accepts short syntax (`"8081:8080"`, `"9000"`,
/// `"127.0.0.1:80:8080/tcp"`), bare numbers and the long form
/// `docker compose config` emits (`{target: 8080, ...}`).
#[must_use]
pub fn service_ports(service: &Value) -> Vec<u16> {
    let Some(ports) = service.get("ports").and_then(Value::as_array) else {
        return Vec::new();
    };
    ports.iter().filter_map(container_port).collect()
}

fn container_port(entry: &Value) -> Option<u16> {
    match entry {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => {
            let container = s.rsplit(':').next()?;
            let container = container.split('/').next()?;
            container.trim().parse().ok()
        }
        Value::Object(map) => map.get("target").and_then(container_port),
        _ => None,
    }
}

/// Environment of a service in either mapping or `KEY=value`
/// list form. Pass-through entries without a value are skipped.
#[must_use]
pub fn service_environment(service: &Value) -> IndexMap<String, String> {
    match service.get("environment") {
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), scalar_to_string(v)))
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|item| item.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        _ => IndexMap::new(),
    }
}

fn first_for_role<'a>(
    compose: &'a Value,
    roles: &'a IndexMap<String, Vec<String>>,
    role: &str,
) -> Option<(&'a str, &'a Value)> {
    let names = roles.get(role)?;
    if names.len() > 1 {
        warn!("multiple services tagged '{role}': {names:?}; using '{}'", names[0]);
    }
    let name = names.first()?;
    let service = compose.get("services")?.get(name)?;
    Some((name.as_str(), service))
}

/// Fold role-tagged compose services into the plan.
///
/// The `app` service provides the app image, ports, command
/// override and environment. The `sidecar` service provides the
/// auxiliary container image. Other roles are ignored.
pub fn apply_compose_to_plan(compose: &Value, plan: &mut DeployPlan) {
    let roles = detect_services_by_role(compose);

    for role in roles.keys() {
        if role != ROLE_APP && role != ROLE_SIDECAR {
            debug!("ignoring compose role '{role}'");
        }
    }

    if let Some((name, service)) = first_for_role(compose, &roles, ROLE_APP) {
        if let Some(image) = non_blank_str(service.get("image")) {
            plan.app_image = image.to_string();
        }
        let ports = service_ports(service);
        if let Some((&first, rest)) = ports.split_first() {
            plan.app_port = Some(first);
            plan.app_ports = rest.to_vec();
        }
        let command = normalize_command(service.get("command"));
        if !command.is_empty() {
            plan.web_command = Some(command);
        }
        plan.extra_env.extend(service_environment(service));
        plan.compose_service_name = name.to_string();
        plan.deploy_role = ROLE_APP.to_string();
    }

    if let Some((_, service)) = first_for_role(compose, &roles, ROLE_SIDECAR) {
        if let Some(image) = non_blank_str(service.get("image")) {
            plan.other_image = Some(image.to_string());
        }
    }
}

fn non_blank_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Replace absolute local paths in rendered stack content with
/// the remote directory.
#[must_use]
pub fn rewrite_paths_for_remote(content: &str, local_root: &Path, remote_dir: &str) -> String {
    let local = local_root
        .canonicalize()
        .unwrap_or_else(|_| local_root.to_path_buf());
    content.replace(&local.to_string_lossy().into_owned(), remote_dir)
}

/// Make a rendered stack deployable by Portainer, which cannot
/// build images: the `app` service's `build:` is swapped for
/// `image: <app_image>`, and any other service still carrying a
/// build context is an error.
pub fn prepare_stack_for_portainer(content: &str, app_image: &str) -> DeployResult<String> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(content)?;
    if !doc.is_mapping() {
        return Err(DeployError::Other(
            "rendered compose config is not a mapping".into(),
        ));
    }
    let Some(services) = doc
        .get_mut("services")
        .and_then(serde_yaml::Value::as_mapping_mut)
    else {
        return Ok(content.to_string());
    };

    let app_image = app_image.trim();
    let mut remaining = Vec::new();
    for (name, service) in services.iter_mut() {
        let Some(service) = service.as_mapping_mut() else {
            continue;
        };
        if !service.contains_key("build") {
            continue;
        }
        let name = name.as_str().unwrap_or_default();
        if name == BUILD_SERVICE && !app_image.is_empty() {
            service.remove("build");
            service.insert("image".into(), app_image.into());
        } else {
            remaining.push(name.to_string());
        }
    }

    if !remaining.is_empty() {
        return Err(DeployError::Other(format!(
            "Portainer stacks need image-based services; still using build contexts: {}. \
             Set APP_IMAGE or adjust the compose files.",
            remaining.join(", ")
        )));
    }

    Ok(serde_yaml::to_string(&doc)?)
}

/// `container_name` values declared in a stack.
pub fn container_names(content: &str) -> DeployResult<Vec<String>> {
    let parsed: Compose = serde_yaml::from_str(content)?;
    Ok(parsed
        .services
        .0
        .values()
        .flatten()
        .filter_map(|s| s.container_name.clone())
        .collect())
}
