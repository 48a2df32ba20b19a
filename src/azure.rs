use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::cmd;
use crate::error::{DeployError, DeployResult};

const MAX_NAME_LEN: usize = 24;

/// Attempts for `az container create` on transient registry errors.
pub const CREATE_ATTEMPTS: u32 = 5;
/// Attempts for Key Vault writes while RBAC grants propagate.
pub const RBAC_ATTEMPTS: u32 = 20;

/// Names of every Azure resource one deployment uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureNames {
    pub resource_group: String,
    pub location: String,
    pub container_name: String,
    pub storage_account: String,
    pub keyvault: String,
    pub identity: String,
    pub share_workspace: String,
    pub share_caddy_data: String,
    pub share_caddy_config: String,
}

impl AzureNames {
    #[must_use]
    pub fn derive(resource_group: &str, location: &str, container_name: &str) -> Self {
        Self {
            resource_group: resource_group.to_string(),
            location: location.to_string(),
            container_name: container_name.to_string(),
            storage_account: storage_account_name(resource_group),
            keyvault: keyvault_name(resource_group),
            identity: format!("{resource_group}-identity"),
            share_workspace: format!("{container_name}-workspace"),
            share_caddy_data: format!("{container_name}-caddy-data"),
            share_caddy_config: format!("{container_name}-caddy-config"),
        }
    }

    #[must_use]
    pub fn shares(&self) -> [&str; 3] {
        [
            self.share_workspace.as_str(),
            self.share_caddy_data.as_str(),
            self.share_caddy_config.as_str(),
        ]
    }

    /// Resource id of the user-assigned identity, computable
    /// without a lookup once the subscription is known.
    #[must_use]
    pub fn identity_resource_id(&self, subscription_id: &str) -> String {
        format!(
            "/subscriptions/{subscription_id}/resourceGroups/{}/providers/\
             Microsoft.ManagedIdentity/userAssignedIdentities/{}",
            self.resource_group, self.identity
        )
    }
}

fn alnum_lower(value: &str) -> String {
    value
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Storage accounts allow 3-24 lower-case alphanumerics.
#[must_use]
pub fn storage_account_name(resource_group: &str) -> String {
    alnum_lower(&format!("{resource_group}stg"))
        .chars()
        .take(MAX_NAME_LEN)
        .collect()
}

#[must_use]
pub fn keyvault_name(resource_group: &str) -> String {
    format!("{}kv", alnum_lower(resource_group))
        .chars()
        .take(MAX_NAME_LEN)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct AccountInfo {
    #[serde(rename = "id")]
    pub subscription_id: String,
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityDetails {
    pub id: String,
    pub client_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub principal_id: String,
}

fn az(args: &[&str]) -> DeployResult<String> {
    cmd::run("az", args)
}

/// Whether a resource lookup succeeds. Lookups are exploratory:
/// failure just means "absent".
fn exists(args: &[&str]) -> DeployResult<bool> {
    Ok(cmd::run_optional("az", args)?.is_some())
}

pub fn require_login() -> DeployResult<()> {
    match cmd::run_optional("az", &["account", "show", "-o", "none"])? {
        Some(_) => Ok(()),
        None => Err(DeployError::Other("not logged into Azure. Run: az login".into())),
    }
}

pub fn account_show() -> DeployResult<AccountInfo> {
    let out = az(&["account", "show", "-o", "json"])?;
    Ok(serde_json::from_str(&out)?)
}

pub fn identity_details(names: &AzureNames) -> DeployResult<IdentityDetails> {
    let out = az(&[
        "identity",
        "show",
        "-g",
        &names.resource_group,
        "-n",
        &names.identity,
        "-o",
        "json",
    ])?;
    Ok(serde_json::from_str(&out)?)
}

pub fn storage_key(names: &AzureNames) -> DeployResult<String> {
    az(&[
        "storage",
        "account",
        "keys",
        "list",
        "-g",
        &names.resource_group,
        "-n",
        &names.storage_account,
        "--query",
        "[0].value",
        "-o",
        "tsv",
    ])
}

/// Create whatever is missing: resource group, identity, Key
/// Vault, storage account and file shares. Safe to re-run.
pub fn ensure_infra(names: &AzureNames) -> DeployResult<()> {
    let rg = names.resource_group.as_str();
    let loc = names.location.as_str();

    info!("ensuring resource group {rg}");
    az(&["group", "create", "-n", rg, "-l", loc, "-o", "none"])?;

    if exists(&["identity", "show", "-g", rg, "-n", &names.identity, "-o", "none"])? {
        debug!("identity {} exists", names.identity);
    } else {
        info!("creating identity {}", names.identity);
        az(&["identity", "create", "-g", rg, "-n", &names.identity, "-l", loc, "-o", "none"])?;
    }

    if exists(&["keyvault", "show", "-n", &names.keyvault, "-o", "none"])? {
        debug!("key vault {} exists", names.keyvault);
    } else {
        info!("creating key vault {}", names.keyvault);
        az(&[
            "keyvault",
            "create",
            "-g",
            rg,
            "-n",
            &names.keyvault,
            "-l",
            loc,
            "--enable-rbac-authorization",
            "true",
            "-o",
            "none",
        ])?;
    }

    let account = names.storage_account.as_str();
    if exists(&["storage", "account", "show", "-g", rg, "-n", account, "-o", "none"])? {
        debug!("storage account {account} exists");
    } else {
        info!("creating storage account {account}");
        az(&[
            "storage", "account", "create", "-g", rg, "-n", account, "-l", loc, "--sku",
            "Standard_LRS", "--kind", "StorageV2", "-o", "none",
        ])?;
    }

    let key = storage_key(names)?;
    for share in names.shares() {
        debug!("ensuring file share {share}");
        cmd::run_redacted(
            "az",
            &[
                "storage",
                "share",
                "create",
                "--name",
                share,
                "--account-name",
                account,
                "--account-key",
                &key,
                "-o",
                "none",
            ],
            &[&key],
        )?;
    }

    grant_secrets_reader(names);
    Ok(())
}

/// Let the group's identity read Key Vault secrets. Failures are
/// logged; an existing assignment is the common cause.
fn grant_secrets_reader(names: &AzureNames) {
    let result = identity_details(names).and_then(|identity| {
        let scope = az(&["keyvault", "show", "-n", &names.keyvault, "--query", "id", "-o", "tsv"])?;
        az(&[
            "role",
            "assignment",
            "create",
            "--assignee-object-id",
            &identity.principal_id,
            "--assignee-principal-type",
            "ServicePrincipal",
            "--role",
            "Key Vault Secrets User",
            "--scope",
            &scope,
            "-o",
            "none",
        ])
    });
    if let Err(e) = result {
        warn!("could not grant Key Vault access to {}: {e}", names.identity);
    }
}

/// Key Vault errors that usually mean a fresh role assignment has
/// not propagated yet.
#[must_use]
pub fn is_rbac_propagation(stderr: &str) -> bool {
    ["Forbidden", "Unauthorized", "Caller is not authorized"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

/// `min(20, 3 * 1.5^(attempt-1))` seconds.
#[must_use]
pub fn rbac_backoff(attempt: u32) -> Duration {
    let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    Duration::from_secs_f64((3.0 * 1.5_f64.powi(exp)).min(20.0))
}

/// `min(60, 10 * 2^(attempt-1))` seconds.
#[must_use]
pub fn create_backoff(attempt: u32) -> Duration {
    let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    Duration::from_secs_f64((10.0 * 2.0_f64.powi(exp)).min(60.0))
}

/// Run `op` up to `attempts` times, sleeping `backoff(n)` after a
/// failed attempt `n` that `retryable` accepts.
pub fn with_retry<T>(
    label: &str,
    attempts: u32,
    backoff: fn(u32) -> Duration,
    retryable: impl Fn(&DeployError) -> bool,
    mut op: impl FnMut() -> DeployResult<T>,
) -> DeployResult<T> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && retryable(&e) => {
                let delay = backoff(attempt);
                warn!(
                    "{label} failed (attempt {attempt}/{attempts}), retrying in {:.1}s",
                    delay.as_secs_f64()
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Store a secret without the value ever reaching logs or error
/// text.
pub fn kv_secret_set(vault: &str, name: &str, value: &str) -> DeployResult<()> {
    info!("setting secret '{name}' in vault '{vault}'");
    with_retry(
        "key vault write",
        RBAC_ATTEMPTS,
        rbac_backoff,
        |e| e.stderr().is_some_and(is_rbac_propagation),
        || {
            cmd::run_redacted(
                "az",
                &[
                    "keyvault",
                    "secret",
                    "set",
                    "--vault-name",
                    vault,
                    "--name",
                    name,
                    "--value",
                    value,
                    "-o",
                    "none",
                ],
                &[value],
            )
        },
    )
    .map_err(|e| {
        warn!("secret value length: {} characters", value.len());
        match e {
            DeployError::ExternalTool { stderr, .. } => DeployError::Other(keyvault_help(vault, &stderr)),
            other => other,
        }
    })?;
    Ok(())
}

/// Make sure the vault's data plane answers before anything is
/// written to it. An authorization error still proves the vault is
/// reachable; the write retries until grants propagate.
pub fn kv_data_plane_check(vault: &str) -> DeployResult<()> {
    let listed = cmd::run(
        "az",
        &["keyvault", "secret", "list", "--vault-name", vault, "--maxresults", "1", "-o", "none"],
    );
    match listed {
        Ok(_) => Ok(()),
        Err(DeployError::ExternalTool { stderr, .. }) if is_rbac_propagation(&stderr) => {
            debug!("vault {vault} reachable, access not granted yet");
            Ok(())
        }
        Err(DeployError::ExternalTool { stderr, .. }) => Err(DeployError::Other(keyvault_help(vault, &stderr))),
        Err(e) => Err(e),
    }
}

/// Troubleshooting text for a vault that cannot be written.
#[must_use]
pub fn keyvault_help(vault: &str, stderr: &str) -> String {
    let mut msg = format!("could not write Key Vault secret to '{vault}' ({vault}.vault.azure.net)");
    if stderr.contains("Failed to resolve") || stderr.contains("Name or service not known") {
        msg.push_str(". DNS resolution failed");
    }
    if !stderr.trim().is_empty() {
        msg.push_str(&format!("\n\nAzure CLI error:\n{}", stderr.trim()));
    }
    msg.push_str(&format!(
        "\n\nVerify the vault name: az keyvault show --name {vault} --query name -o tsv\n\
         A vault behind a private endpoint needs access to its private DNS zone.\n\
         Check network, VPN and DNS settings of this machine."
    ));
    msg
}

/// Delete the container group. It may not exist, so errors are
/// ignored.
pub fn container_delete(names: &AzureNames) {
    info!("deleting previous container group {}", names.container_name);
    let result = cmd::run_optional(
        "az",
        &[
            "container",
            "delete",
            "-g",
            &names.resource_group,
            "-n",
            &names.container_name,
            "--yes",
            "-o",
            "none",
        ],
    );
    if let Err(e) = result {
        debug!("container delete skipped: {e}");
    }
}

/// Create the group from a manifest, retrying transient registry
/// errors.
pub fn container_create(resource_group: &str, manifest_path: &str) -> DeployResult<()> {
    info!("creating container group from {manifest_path}");
    with_retry(
        "container create",
        CREATE_ATTEMPTS,
        create_backoff,
        DeployError::is_transient,
        || az(&["container", "create", "-g", resource_group, "--file", manifest_path, "-o", "none"]),
    )
    .map(drop)
}
