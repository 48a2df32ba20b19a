use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;

use crate::caddyfile;
use crate::error::{DeployError, DeployResult};

pub const API_VERSION: &str = "2023-05-01";
pub const PROXY_CONTAINER: &str = "tls-proxy";
pub const AUX_CONTAINER: &str = "other";
pub const WORKSPACE_VOLUME: &str = "workspace-volume";
pub const WORKSPACE_MOUNT: &str = "/home/coder/workspace";
pub const CADDY_DATA_VOLUME: &str = "caddy-data";
pub const CADDY_CONFIG_VOLUME: &str = "caddy-config";

/// Round a memory request up to the next tenth of a GiB.
///
/// The platform only accepts multiples of 0.1. The result is never
/// below the input; non-positive and non-finite values are rejected.
pub fn quantize_memory_gb(memory_gb: f64) -> DeployResult<f64> {
    if !memory_gb.is_finite() || memory_gb <= 0.0 {
        return Err(DeployError::ManifestContract(format!(
            "memory_gb must be > 0, got {memory_gb}"
        )));
    }
    // The epsilon keeps 0.3 * 10 (= 3.0000000000000004) at 3 tenths.
    let tenths = (memory_gb * 10.0 - 1e-9).ceil();
    let quantized = tenths / 10.0;
    if quantized < memory_gb {
        Ok((tenths + 1.0) / 10.0)
    } else {
        Ok(quantized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainerSize {
    pub cpu: f64,
    pub memory_gb: f64,
}

impl ContainerSize {
    #[must_use]
    pub const fn new(cpu: f64, memory_gb: f64) -> Self {
        Self { cpu, memory_gb }
    }
}

/// Private registry credentials. All three or none.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub server: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryCredentials {
    #[must_use]
    pub fn new(server: &str, username: &str, password: &str) -> Self {
        Self {
            server: Some(server.to_string()),
            username: Some(username.to_string()),
            password: Some(password.to_string()),
        }
    }

    fn resolve(&self) -> DeployResult<Option<RegistryCredential>> {
        fn present(v: &Option<String>) -> Option<&str> {
            v.as_deref().map(str::trim).filter(|s| !s.is_empty())
        }

        match (
            present(&self.server),
            present(&self.username),
            present(&self.password),
        ) {
            (None, None, None) => Ok(None),
            (Some(server), Some(username), Some(password)) => Ok(Some(RegistryCredential {
                server: server.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            })),
            _ => Err(DeployError::ManifestContract(
                "registry server/username/password must all be set when using registry credentials"
                    .into(),
            )),
        }
    }
}

/// Optional third container with no exposed ports.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxContainer {
    pub image: String,
    pub size: ContainerSize,
}

/// Every scalar the manifest needs, fully resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestInput {
    pub name: String,
    pub location: String,
    pub dns_label: String,
    pub image: String,
    pub registry: RegistryCredentials,
    pub identity_id: String,
    pub identity_client_id: Option<String>,
    pub identity_tenant_id: Option<String>,
    pub storage_name: String,
    pub storage_key: String,
    pub keyvault_name: String,
    pub public_domain: String,
    pub acme_email: String,
    pub basic_auth_user: String,
    pub basic_auth_hash: String,
    pub app_size: ContainerSize,
    pub proxy_image: String,
    pub proxy_size: ContainerSize,
    pub share_workspace: String,
    pub share_caddy_data: String,
    pub share_caddy_config: String,
    pub app_port: Option<u16>,
    pub app_ports: Vec<u16>,
    pub app_command: Vec<String>,
    pub extra_env: IndexMap<String, String>,
    pub aux: Option<AuxContainer>,
}

/// Renders manifest text from resolved inputs. The deploy target
/// is handed an implementation at construction time.
pub trait ManifestRenderer {
    fn render(&self, input: &ManifestInput) -> DeployResult<String>;
}

/// The container-group YAML renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct AciYaml;

impl ManifestRenderer for AciYaml {
    fn render(&self, input: &ManifestInput) -> DeployResult<String> {
        generate_deploy_yaml(input)
    }
}

/// Render the container-group manifest.
pub fn generate_deploy_yaml(input: &ManifestInput) -> DeployResult<String> {
    let group = build_group(input)?;
    let text = serde_yaml::to_string(&group)?;
    Ok(pin_api_version(text))
}

fn build_group(input: &ManifestInput) -> DeployResult<ContainerGroup> {
    let registry = input.registry.resolve()?;
    let proxy_port = input.app_port.or_else(|| input.app_ports.first().copied()).ok_or_else(|| {
        DeployError::ManifestContract("at least one app port is required".into())
    })?;

    let mut containers = vec![app_container(input)?];
    if let Some(aux) = &input.aux {
        containers.push(Container {
            name: AUX_CONTAINER.to_string(),
            properties: ContainerProperties {
                image: aux.image.clone(),
                ports: Vec::new(),
                resources: Resources::new(aux.size)?,
                environment_variables: Vec::new(),
                command: Vec::new(),
                volume_mounts: vec![VolumeMount::new(WORKSPACE_VOLUME, WORKSPACE_MOUNT)],
            },
        });
    }
    containers.push(proxy_container(input, proxy_port)?);

    let mut identities = IndexMap::new();
    identities.insert(input.identity_id.clone(), IndexMap::new());

    Ok(ContainerGroup {
        api_version: API_VERSION.to_string(),
        location: input.location.clone(),
        name: input.name.clone(),
        identity: Identity {
            kind: "UserAssigned",
            user_assigned_identities: identities,
        },
        properties: GroupProperties {
            image_registry_credentials: registry.map(|r| vec![r]),
            containers,
            os_type: "Linux",
            restart_policy: "Always",
            ip_address: IpAddress {
                kind: "Public",
                dns_name_label: input.dns_label.clone(),
                ports: vec![Port::bare(80), Port::bare(443)],
            },
            volumes: vec![
                Volume::azure_file(WORKSPACE_VOLUME, &input.share_workspace, input),
                Volume::azure_file(CADDY_DATA_VOLUME, &input.share_caddy_data, input),
                Volume::azure_file(CADDY_CONFIG_VOLUME, &input.share_caddy_config, input),
            ],
        },
    })
}

fn app_container(input: &ManifestInput) -> DeployResult<Container> {
    let ports: BTreeSet<u16> = input
        .app_port
        .into_iter()
        .chain(input.app_ports.iter().copied())
        .collect();

    let mut env = vec![EnvVar::plain(
        "AZURE_KEYVAULT_URI",
        &format!("https://{}.vault.azure.net/", input.keyvault_name),
    )];
    if let Some(port) = input.app_port {
        if !input.extra_env.contains_key("WEB_PORT") {
            env.push(EnvVar::plain("CODE_SERVER_PORT", &port.to_string()));
        }
    }
    env.extend(input.extra_env.iter().map(|(k, v)| EnvVar::plain(k, v)));
    if let Some(id) = input.identity_client_id.as_deref().filter(|s| !s.is_empty()) {
        env.push(EnvVar::plain("AZURE_CLIENT_ID", id));
    }
    if let Some(id) = input.identity_tenant_id.as_deref().filter(|s| !s.is_empty()) {
        env.push(EnvVar::plain("AZURE_TENANT_ID", id));
    }

    Ok(Container {
        name: input.name.clone(),
        properties: ContainerProperties {
            image: input.image.clone(),
            ports: ports.into_iter().map(Port::tcp).collect(),
            resources: Resources::new(input.app_size)?,
            environment_variables: env,
            command: input.app_command.clone(),
            volume_mounts: vec![VolumeMount::new(WORKSPACE_VOLUME, WORKSPACE_MOUNT)],
        },
    })
}

fn proxy_container(input: &ManifestInput, app_port: u16) -> DeployResult<Container> {
    let script = caddyfile::proxy_bootstrap_script(&input.public_domain, app_port);
    Ok(Container {
        name: PROXY_CONTAINER.to_string(),
        properties: ContainerProperties {
            image: input.proxy_image.clone(),
            ports: vec![Port::tcp(80), Port::tcp(443)],
            resources: Resources::new(input.proxy_size)?,
            environment_variables: vec![
                EnvVar::plain("PUBLIC_DOMAIN", &input.public_domain),
                EnvVar::plain("ACME_EMAIL", &input.acme_email),
                EnvVar::plain(
                    "FALLBACK_DOMAIN",
                    &format!("{}.{}.azurecontainer.io", input.dns_label, input.location),
                ),
                EnvVar::plain("BASIC_AUTH_USER", &input.basic_auth_user),
                EnvVar::secure("BASIC_AUTH_HASH", &input.basic_auth_hash),
            ],
            command: vec!["sh".into(), "-lc".into(), script],
            volume_mounts: vec![
                VolumeMount::new(CADDY_DATA_VOLUME, "/data"),
                VolumeMount::new(CADDY_CONFIG_VOLUME, "/config"),
            ],
        },
    })
}

/// The API version looks like a date; keep it a quoted string so
/// YAML 1.1 loaders do not turn it into a timestamp.
fn pin_api_version(text: String) -> String {
    let plain = format!("apiVersion: {API_VERSION}\n");
    match text.strip_prefix(&plain) {
        Some(rest) => format!("apiVersion: '{API_VERSION}'\n{rest}"),
        None => text,
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerGroup {
    api_version: String,
    location: String,
    name: String,
    identity: Identity,
    properties: GroupProperties,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(rename = "type")]
    kind: &'static str,
    user_assigned_identities: IndexMap<String, IndexMap<String, String>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    image_registry_credentials: Option<Vec<RegistryCredential>>,
    containers: Vec<Container>,
    os_type: &'static str,
    restart_policy: &'static str,
    ip_address: IpAddress,
    volumes: Vec<Volume>,
}

#[derive(Serialize)]
struct RegistryCredential {
    server: String,
    username: String,
    password: String,
}

#[derive(Serialize)]
struct Container {
    name: String,
    properties: ContainerProperties,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ContainerProperties {
    image: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<Port>,
    resources: Resources,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    environment_variables: Vec<EnvVar>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    volume_mounts: Vec<VolumeMount>,
}

#[derive(Serialize)]
struct Port {
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    protocol: Option<&'static str>,
}

impl Port {
    const fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: Some("TCP"),
        }
    }

    const fn bare(port: u16) -> Self {
        Self {
            port,
            protocol: None,
        }
    }
}

#[derive(Serialize)]
struct Resources {
    requests: ResourceRequests,
}

impl Resources {
    fn new(size: ContainerSize) -> DeployResult<Self> {
        Ok(Self {
            requests: ResourceRequests {
                cpu: size.cpu,
                memory_in_gb: quantize_memory_gb(size.memory_gb)?,
            },
        })
    }
}

#[derive(Serialize)]
struct ResourceRequests {
    cpu: f64,
    #[serde(rename = "memoryInGB")]
    memory_in_gb: f64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvVar {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secure_value: Option<String>,
}

impl EnvVar {
    fn plain(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.to_string()),
            secure_value: None,
        }
    }

    fn secure(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            secure_value: Some(value.to_string()),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VolumeMount {
    name: String,
    mount_path: String,
}

impl VolumeMount {
    fn new(name: &str, mount_path: &str) -> Self {
        Self {
            name: name.to_string(),
            mount_path: mount_path.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IpAddress {
    #[serde(rename = "type")]
    kind: &'static str,
    dns_name_label: String,
    ports: Vec<Port>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Volume {
    name: String,
    azure_file: AzureFile,
}

impl Volume {
    fn azure_file(name: &str, share: &str, input: &ManifestInput) -> Self {
        Self {
            name: name.to_string(),
            azure_file: AzureFile {
                share_name: share.to_string(),
                storage_account_name: input.storage_name.clone(),
                storage_account_key: input.storage_key.clone(),
            },
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AzureFile {
    share_name: String,
    storage_account_name: String,
    storage_account_key: String,
}
