use std::fmt;

/// Where a key is expected to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvTarget {
    /// `.env`, read by the container at start.
    DotenvRuntime,
    /// `.env.deploy`, read only at provisioning time.
    DotenvDeploy,
    /// `.env.deploy.secrets`, deploy-time credentials.
    DotenvDeploySecrets,
    GhActionsVar,
    GhActionsSecret,
    KeyVaultSecret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Var,
    Secret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EnvKey {
    // Azure identity / subscription
    AzureClientId,
    AzureTenantId,
    AzureSubscriptionId,
    AzureOidcAppName,

    // Azure deployment
    AzureResourceGroup,
    AzureLocation,
    AzureContainerName,
    AzureDnsLabel,

    // Domain / TLS
    PublicDomain,
    AcmeEmail,

    // Image / registry
    ContainerImage,
    GhcrPrivate,
    GhcrUsername,
    GhcrToken,

    // Sizing
    DefaultCpuCores,
    DefaultMemoryGb,

    // Runtime
    BasicAuthUser,
    BasicAuthHash,
    AppSecret,
    RuntimeEnvDotenv,

    // Hooks
    DeployHooksModule,
    DeployHooksSoftFail,

    // Ubuntu / Portainer
    AppImage,
    Dockerfile,
    UbuntuSshHost,
    UbuntuRemoteDir,
    UbuntuComposeFiles,
    UbuntuBuildPush,
    UbuntuSyncSecrets,
    PortainerHttpsPort,
    PortainerWebhookInsecure,
    PortainerWebhookUrl,
    PortainerWebhookToken,
    PortainerAccessToken,
    PortainerStackName,
    PortainerEndpointId,
}

impl EnvKey {
    pub const ALL: [Self; 36] = [
        Self::AzureClientId,
        Self::AzureTenantId,
        Self::AzureSubscriptionId,
        Self::AzureOidcAppName,
        Self::AzureResourceGroup,
        Self::AzureLocation,
        Self::AzureContainerName,
        Self::AzureDnsLabel,
        Self::PublicDomain,
        Self::AcmeEmail,
        Self::ContainerImage,
        Self::GhcrPrivate,
        Self::GhcrUsername,
        Self::GhcrToken,
        Self::DefaultCpuCores,
        Self::DefaultMemoryGb,
        Self::BasicAuthUser,
        Self::BasicAuthHash,
        Self::AppSecret,
        Self::RuntimeEnvDotenv,
        Self::DeployHooksModule,
        Self::DeployHooksSoftFail,
        Self::AppImage,
        Self::Dockerfile,
        Self::UbuntuSshHost,
        Self::UbuntuRemoteDir,
        Self::UbuntuComposeFiles,
        Self::UbuntuBuildPush,
        Self::UbuntuSyncSecrets,
        Self::PortainerHttpsPort,
        Self::PortainerWebhookInsecure,
        Self::PortainerWebhookUrl,
        Self::PortainerWebhookToken,
        Self::PortainerAccessToken,
        Self::PortainerStackName,
        Self::PortainerEndpointId,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AzureClientId => "AZURE_CLIENT_ID",
            Self::AzureTenantId => "AZURE_TENANT_ID",
            Self::AzureSubscriptionId => "AZURE_SUBSCRIPTION_ID",
            Self::AzureOidcAppName => "AZURE_OIDC_APP_NAME",
            Self::AzureResourceGroup => "AZURE_RESOURCE_GROUP",
            Self::AzureLocation => "AZURE_LOCATION",
            Self::AzureContainerName => "AZURE_CONTAINER_NAME",
            Self::AzureDnsLabel => "AZURE_DNS_LABEL",
            Self::PublicDomain => "PUBLIC_DOMAIN",
            Self::AcmeEmail => "ACME_EMAIL",
            Self::ContainerImage => "CONTAINER_IMAGE",
            Self::GhcrPrivate => "GHCR_PRIVATE",
            Self::GhcrUsername => "GHCR_USERNAME",
            Self::GhcrToken => "GHCR_TOKEN",
            Self::DefaultCpuCores => "DEFAULT_CPU_CORES",
            Self::DefaultMemoryGb => "DEFAULT_MEMORY_GB",
            Self::BasicAuthUser => "BASIC_AUTH_USER",
            Self::BasicAuthHash => "BASIC_AUTH_HASH",
            Self::AppSecret => "APP_SECRET",
            Self::RuntimeEnvDotenv => "RUNTIME_ENV_DOTENV",
            Self::DeployHooksModule => "DEPLOY_HOOKS_MODULE",
            Self::DeployHooksSoftFail => "DEPLOY_HOOKS_SOFT_FAIL",
            Self::AppImage => "APP_IMAGE",
            Self::Dockerfile => "DOCKERFILE",
            Self::UbuntuSshHost => "UBUNTU_SSH_HOST",
            Self::UbuntuRemoteDir => "UBUNTU_REMOTE_DIR",
            Self::UbuntuComposeFiles => "UBUNTU_COMPOSE_FILES",
            Self::UbuntuBuildPush => "UBUNTU_BUILD_PUSH",
            Self::UbuntuSyncSecrets => "UBUNTU_SYNC_SECRETS",
            Self::PortainerHttpsPort => "PORTAINER_HTTPS_PORT",
            Self::PortainerWebhookInsecure => "PORTAINER_WEBHOOK_INSECURE",
            Self::PortainerWebhookUrl => "PORTAINER_WEBHOOK_URL",
            Self::PortainerWebhookToken => "PORTAINER_WEBHOOK_TOKEN",
            Self::PortainerAccessToken => "PORTAINER_ACCESS_TOKEN",
            Self::PortainerStackName => "PORTAINER_STACK_NAME",
            Self::PortainerEndpointId => "PORTAINER_ENDPOINT_ID",
        }
    }

    #[must_use]
    pub const fn kind(self) -> KeyKind {
        match self {
            Self::GhcrToken
            | Self::BasicAuthHash
            | Self::AppSecret
            | Self::RuntimeEnvDotenv
            | Self::PortainerWebhookUrl
            | Self::PortainerWebhookToken
            | Self::PortainerAccessToken => KeyKind::Secret,
            _ => KeyKind::Var,
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for EnvKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recognized configuration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvKeySpec {
    pub key: EnvKey,
    pub mandatory: bool,
    pub default: Option<&'static str>,
    pub targets: &'static [EnvTarget],
}

impl EnvKeySpec {
    #[must_use]
    pub const fn optional(key: EnvKey, targets: &'static [EnvTarget]) -> Self {
        Self {
            key,
            mandatory: false,
            default: None,
            targets,
        }
    }

    #[must_use]
    pub const fn required(key: EnvKey, targets: &'static [EnvTarget]) -> Self {
        Self {
            key,
            mandatory: true,
            default: None,
            targets,
        }
    }

    #[must_use]
    pub const fn defaulted(key: EnvKey, default: &'static str, targets: &'static [EnvTarget]) -> Self {
        Self {
            key,
            mandatory: false,
            default: Some(default),
            targets,
        }
    }

    #[must_use]
    pub fn targets_any(&self, include: &[EnvTarget]) -> bool {
        self.targets.iter().any(|t| include.contains(t))
    }
}

use EnvKey as K;
use EnvTarget as T;

const RUNTIME_VAR: &[EnvTarget] = &[T::DotenvRuntime, T::GhActionsVar];
const RUNTIME_SECRET: &[EnvTarget] = &[T::DotenvRuntime, T::GhActionsSecret];
const RUNTIME_ONLY: &[EnvTarget] = &[T::DotenvRuntime];
const DEPLOY_VAR: &[EnvTarget] = &[T::DotenvDeploy, T::GhActionsVar];
const DEPLOY_SECRET: &[EnvTarget] = &[T::DotenvDeploy, T::GhActionsSecret];
const DEPLOY_ONLY: &[EnvTarget] = &[T::DotenvDeploy];
const DEPLOY_SECRETS_FILE: &[EnvTarget] = &[T::DotenvDeploySecrets];
const GH_SECRET_ONLY: &[EnvTarget] = &[T::GhActionsSecret];

/// Keys the container reads at start (`.env`).
pub static RUNTIME_SCHEMA: &[EnvKeySpec] = &[
    EnvKeySpec::defaulted(K::BasicAuthUser, "admin", RUNTIME_VAR),
    EnvKeySpec::required(K::BasicAuthHash, RUNTIME_SECRET),
    EnvKeySpec::optional(K::AppSecret, RUNTIME_ONLY),
];

/// Keys needed to provision the Azure container group (`.env.deploy`).
pub static DEPLOY_SCHEMA: &[EnvKeySpec] = &[
    EnvKeySpec::optional(K::AzureClientId, DEPLOY_VAR),
    EnvKeySpec::optional(K::AzureTenantId, DEPLOY_VAR),
    EnvKeySpec::optional(K::AzureSubscriptionId, DEPLOY_VAR),
    EnvKeySpec::optional(K::AzureOidcAppName, DEPLOY_VAR),
    EnvKeySpec::defaulted(K::AzureResourceGroup, "protected-azure-container-rg", DEPLOY_VAR),
    EnvKeySpec::defaulted(K::AzureLocation, "westeurope", DEPLOY_VAR),
    EnvKeySpec::defaulted(K::AzureContainerName, "protected-azure-container", DEPLOY_VAR),
    EnvKeySpec::optional(K::AzureDnsLabel, DEPLOY_VAR),
    EnvKeySpec::required(K::PublicDomain, DEPLOY_VAR),
    EnvKeySpec::required(K::AcmeEmail, DEPLOY_VAR),
    EnvKeySpec::required(K::ContainerImage, DEPLOY_VAR),
    EnvKeySpec::defaulted(K::GhcrPrivate, "false", DEPLOY_VAR),
    EnvKeySpec::optional(K::GhcrUsername, DEPLOY_VAR),
    EnvKeySpec::optional(K::GhcrToken, DEPLOY_SECRET),
    EnvKeySpec::defaulted(K::DefaultCpuCores, "1.0", DEPLOY_VAR),
    EnvKeySpec::defaulted(K::DefaultMemoryGb, "2.0", DEPLOY_VAR),
    EnvKeySpec::optional(K::DeployHooksModule, DEPLOY_ONLY),
    EnvKeySpec::optional(K::DeployHooksSoftFail, DEPLOY_ONLY),
    EnvKeySpec::required(K::RuntimeEnvDotenv, GH_SECRET_ONLY),
];

/// Keys for the self-managed Ubuntu host behind Portainer.
pub static UBUNTU_SCHEMA: &[EnvKeySpec] = &[
    EnvKeySpec::optional(K::AppImage, DEPLOY_ONLY),
    EnvKeySpec::defaulted(K::Dockerfile, "docker/Dockerfile", DEPLOY_ONLY),
    EnvKeySpec::optional(K::UbuntuSshHost, DEPLOY_ONLY),
    EnvKeySpec::defaulted(K::UbuntuRemoteDir, "/opt/protected-container", DEPLOY_ONLY),
    EnvKeySpec::defaulted(
        K::UbuntuComposeFiles,
        "docker/docker-compose.yml,docker/docker-compose.ubuntu.yml",
        DEPLOY_ONLY,
    ),
    EnvKeySpec::defaulted(K::UbuntuBuildPush, "true", DEPLOY_ONLY),
    EnvKeySpec::defaulted(K::UbuntuSyncSecrets, "true", DEPLOY_ONLY),
    EnvKeySpec::defaulted(K::PortainerHttpsPort, "9943", DEPLOY_ONLY),
    EnvKeySpec::defaulted(K::PortainerWebhookInsecure, "false", DEPLOY_ONLY),
    EnvKeySpec::optional(K::PortainerWebhookUrl, DEPLOY_SECRETS_FILE),
    EnvKeySpec::optional(K::PortainerWebhookToken, DEPLOY_SECRETS_FILE),
    EnvKeySpec::optional(K::PortainerAccessToken, DEPLOY_SECRETS_FILE),
    EnvKeySpec::optional(K::PortainerStackName, DEPLOY_ONLY),
    EnvKeySpec::optional(K::PortainerEndpointId, DEPLOY_ONLY),
    EnvKeySpec::optional(K::GhcrUsername, DEPLOY_ONLY),
    EnvKeySpec::optional(K::GhcrToken, DEPLOY_SECRETS_FILE),
];

/// Specs whose targets intersect `include`, in schema order.
#[must_use]
pub fn filter_by_targets(schema: &[EnvKeySpec], include: &[EnvTarget]) -> Vec<EnvKeySpec> {
    schema
        .iter()
        .filter(|spec| spec.targets_any(include))
        .copied()
        .collect()
}

#[must_use]
pub fn spec_for(schema: &[EnvKeySpec], key: EnvKey) -> Option<&EnvKeySpec> {
    schema.iter().find(|spec| spec.key == key)
}

#[must_use]
pub fn schema_keys(schema: &[EnvKeySpec]) -> Vec<&'static str> {
    schema.iter().map(|spec| spec.key.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn key_names_are_unique() {
        let names: HashSet<&str> = EnvKey::ALL.iter().map(|k| k.as_str()).collect();
        assert_eq!(names.len(), EnvKey::ALL.len());
    }

    #[test]
    fn from_name_roundtrips() {
        for key in EnvKey::ALL {
            assert_eq!(EnvKey::from_name(key.as_str()), Some(key));
        }
        assert_eq!(EnvKey::from_name("FOO"), None);
    }

    #[test]
    fn schemas_have_no_duplicate_keys() {
        for schema in [RUNTIME_SCHEMA, DEPLOY_SCHEMA, UBUNTU_SCHEMA] {
            let keys: HashSet<EnvKey> = schema.iter().map(|s| s.key).collect();
            assert_eq!(keys.len(), schema.len());
        }
    }

    #[test]
    fn mandatory_specs_have_no_default() {
        for schema in [RUNTIME_SCHEMA, DEPLOY_SCHEMA, UBUNTU_SCHEMA] {
            for spec in schema {
                assert!(!(spec.mandatory && spec.default.is_some()), "{}", spec.key);
            }
        }
    }

    #[test]
    fn deploy_file_filter_excludes_ci_only_secret() {
        let specs = filter_by_targets(DEPLOY_SCHEMA, &[EnvTarget::DotenvDeploy]);
        assert!(specs.iter().all(|s| s.key != EnvKey::RuntimeEnvDotenv));
        assert!(specs.iter().any(|s| s.key == EnvKey::PublicDomain));
    }

    #[test]
    fn secret_kind() {
        assert_eq!(EnvKey::GhcrToken.kind(), KeyKind::Secret);
        assert_eq!(EnvKey::GhcrUsername.kind(), KeyKind::Var);
    }
}
