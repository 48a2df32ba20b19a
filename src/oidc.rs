use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::cmd;
use crate::error::{DeployError, DeployResult};

pub const GITHUB_ISSUER: &str = "https://token.actions.githubusercontent.com";
pub const TOKEN_AUDIENCE: &str = "api://AzureADTokenExchange";

const NAME_MAX: usize = 120;
const SUFFIX_MAX: usize = 32;

/// `<repo dir>-github-actions-oidc`.
#[must_use]
pub fn default_app_name(repo_root: &Path) -> String {
    let dir = repo_root
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .or_else(|| repo_root.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "app".to_string());
    format!("{dir}-github-actions-oidc")
}

/// Find the app registration by display name or create it, and
/// make sure it has a service principal. Returns the client id.
pub fn ensure_app(display_name: &str) -> DeployResult<String> {
    let found = cmd::run(
        "az",
        &["ad", "app", "list", "--display-name", display_name, "--query", "[0].appId", "-o", "tsv"],
    )?;
    let app_id = if found.is_empty() {
        info!("creating Entra app registration '{display_name}'");
        cmd::run(
            "az",
            &["ad", "app", "create", "--display-name", display_name, "--query", "appId", "-o", "tsv"],
        )?
    } else {
        found
    };
    if app_id.is_empty() {
        return Err(DeployError::Other(format!(
            "could not resolve the app id of '{display_name}'"
        )));
    }

    if cmd::run_optional("az", &["ad", "sp", "show", "--id", &app_id, "-o", "none"])?.is_none() {
        info!("creating service principal for {app_id}");
        cmd::run("az", &["ad", "sp", "create", "--id", &app_id, "-o", "none"])?;
    }
    Ok(app_id)
}

/// Roles the Actions identity needs: deploy into the resource
/// group and manage the runtime secret.
#[must_use]
pub fn role_scopes(subscription_id: &str, resource_group: &str, keyvault: &str) -> Vec<(&'static str, String)> {
    let group = format!("/subscriptions/{subscription_id}/resourceGroups/{resource_group}");
    let vault = format!("{group}/providers/Microsoft.KeyVault/vaults/{keyvault}");
    vec![("Contributor", group), ("Key Vault Secrets Officer", vault)]
}

/// Grant every role from [`role_scopes`] that is missing. Failures
/// are logged; the deploy itself runs with the caller's identity.
pub fn ensure_role_assignments(client_id: &str, subscription_id: &str, resource_group: &str, keyvault: &str) {
    for (role, scope) in role_scopes(subscription_id, resource_group, keyvault) {
        let listed = cmd::run_optional(
            "az",
            &[
                "role", "assignment", "list", "--assignee", client_id, "--role", role, "--scope", &scope,
                "--query", "length(@)", "-o", "tsv",
            ],
        );
        if matches!(listed, Ok(Some(ref n)) if !n.is_empty() && n != "0") {
            continue;
        }
        info!("assigning '{role}' to {client_id}");
        let created = cmd::run(
            "az",
            &[
                "role", "assignment", "create", "--assignee", client_id, "--role", role, "--scope", &scope,
                "-o", "none",
            ],
        );
        if let Err(e) = created {
            warn!("could not assign '{role}' on {scope}: {e}");
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedCredential {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub issuer: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub audiences: Vec<String>,
}

impl FederatedCredential {
    /// Credential trusting GitHub Actions tokens for `subject`.
    #[must_use]
    pub fn github(repo: &str, subject: &str) -> Self {
        Self {
            name: credential_name(repo, subject),
            issuer: GITHUB_ISSUER.to_string(),
            subject: subject.to_string(),
            audiences: vec![TOKEN_AUDIENCE.to_string()],
        }
    }

    #[must_use]
    pub fn covers(&self, subject: &str) -> bool {
        self.issuer == GITHUB_ISSUER
            && self.subject == subject
            && self.audiences.iter().any(|a| a == TOKEN_AUDIENCE)
    }
}

/// `github-oidc-<owner>-<repo>-<branch or hash>`, capped at the
/// length Entra accepts.
#[must_use]
pub fn credential_name(repo: &str, subject: &str) -> String {
    let branch_prefix = format!("repo:{repo}:ref:refs/heads/");
    let hashed = || hex::encode(Sha256::digest(subject.as_bytes()))[..8].to_string();
    let suffix = subject
        .strip_prefix(branch_prefix.as_str())
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(hashed);
    format!("github-oidc-{}-{suffix}", repo.replace('/', "-"))
        .chars()
        .take(NAME_MAX)
        .collect()
}

fn sanitize(raw: &str) -> String {
    let mut out = String::new();
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let capped: String = out.chars().take(SUFFIX_MAX).collect();
    capped.trim_matches('-').to_string()
}

#[must_use]
pub fn branch_subject(repo: &str, branch: &str) -> String {
    format!("repo:{repo}:ref:refs/heads/{branch}")
}

/// Subjects to trust. An explicit subject replaces the defaults:
/// the default branch (`main` when unknown), the `production`
/// environment, and `current_branch` when given and different.
#[must_use]
pub fn github_subjects(
    repo: &str,
    default_branch: Option<&str>,
    current_branch: Option<&str>,
    explicit: Option<&str>,
) -> Vec<String> {
    if let Some(subject) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return vec![subject.to_string()];
    }
    let default_branch = default_branch.map(str::trim).filter(|b| !b.is_empty()).unwrap_or("main");
    let mut subjects = vec![
        branch_subject(repo, default_branch),
        format!("repo:{repo}:environment:production"),
    ];
    if let Some(current) = current_branch
        .map(str::trim)
        .filter(|b| !b.is_empty() && *b != "HEAD" && *b != default_branch)
    {
        subjects.push(branch_subject(repo, current));
    }
    subjects
}

/// Add a federated credential for each subject the app does not
/// already trust. Returns the subjects that were added.
pub fn ensure_federated_credentials(app_id: &str, repo: &str, subjects: &[String]) -> DeployResult<Vec<String>> {
    let listed = cmd::run("az", &["ad", "app", "federated-credential", "list", "--id", app_id, "-o", "json"])?;
    let existing: Vec<FederatedCredential> = if listed.is_empty() {
        Vec::new()
    } else {
        serde_json::from_str(&listed)?
    };

    let mut added = Vec::new();
    for subject in subjects {
        if existing.iter().any(|c| c.covers(subject)) {
            info!("federated credential for {subject} already present");
            continue;
        }
        let credential = FederatedCredential::github(repo, subject);
        let parameters = serde_json::to_string(&credential)?;
        cmd::run(
            "az",
            &["ad", "app", "federated-credential", "create", "--id", app_id, "--parameters", &parameters, "-o", "none"],
        )?;
        info!("added federated credential {} ({subject})", credential.name);
        added.push(subject.clone());
    }
    Ok(added)
}
