use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::cmd;
use crate::env::EnvMap;
use crate::env::schema::{DEPLOY_SCHEMA, EnvKey, EnvKeySpec, EnvTarget, RUNTIME_SCHEMA};
use crate::env::validate::{validate_deploy_file, validate_runtime_file};
use crate::error::{DeployError, DeployResult};
use crate::oidc;

/// One `gh` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GhAction {
    Variable { name: String, value: String },
    Secret { name: String, value: String },
}

impl GhAction {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Variable { name, .. } | Self::Secret { name, .. } => name,
        }
    }

    /// Printable line for dry runs. Secret values are never shown.
    #[must_use]
    pub fn describe(&self, repo: Option<&str>) -> String {
        let repo = repo.map(|r| format!(" (repo={r})")).unwrap_or_default();
        match self {
            Self::Variable { name, value } => format!("set var {name}={value}{repo}"),
            Self::Secret { name, .. } => format!("set secret {name}{repo}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GhSyncOptions {
    pub repo: Option<String>,
    /// Where `git` looks for the current branch and origin.
    pub repo_root: PathBuf,
    pub runtime_file: PathBuf,
    pub deploy_file: PathBuf,
    pub dry_run: bool,
    /// Trust Actions tokens on the `AZURE_CLIENT_ID` app.
    pub federated_credentials: bool,
    /// Replaces the default subjects.
    pub oidc_subject: Option<String>,
    pub include_current_branch: bool,
}

fn collect(schema: &[EnvKeySpec], kv: &EnvMap, actions: &mut Vec<GhAction>) {
    for spec in schema {
        if spec.key == EnvKey::RuntimeEnvDotenv {
            continue;
        }
        let Some(value) = kv.get(spec.key.as_str()).map(|v| v.trim()) else {
            continue;
        };
        if value.is_empty() {
            continue;
        }
        let name = spec.key.to_string();
        let value = value.to_string();
        if spec.targets.contains(&EnvTarget::GhActionsVar) {
            actions.push(GhAction::Variable {
                name: name.clone(),
                value: value.clone(),
            });
        }
        if spec.targets.contains(&EnvTarget::GhActionsSecret) {
            actions.push(GhAction::Secret { name, value });
        }
    }
}

/// Work out every variable and secret to set.
///
/// `RUNTIME_ENV_DOTENV` carries the whole runtime file. Blank
/// values are skipped and a key set by both maps is pushed once.
#[must_use]
pub fn plan_sync(runtime_text: &str, runtime: &EnvMap, deploy: &EnvMap) -> Vec<GhAction> {
    let mut actions = Vec::new();
    if !runtime_text.trim().is_empty() {
        actions.push(GhAction::Secret {
            name: EnvKey::RuntimeEnvDotenv.to_string(),
            value: runtime_text.to_string(),
        });
    }
    collect(RUNTIME_SCHEMA, runtime, &mut actions);
    collect(DEPLOY_SCHEMA, deploy, &mut actions);

    let mut seen = std::collections::HashSet::new();
    actions.retain(|a| seen.insert((matches!(a, GhAction::Secret { .. }), a.name().to_string())));
    actions
}

fn apply(action: &GhAction, repo: Option<&str>) -> DeployResult<()> {
    let (kind, name, value) = match action {
        GhAction::Variable { name, value } => ("variable", name, value),
        GhAction::Secret { name, value } => ("secret", name, value),
    };
    let mut args = vec![kind, "set", name.as_str(), "--body", value.as_str()];
    if let Some(repo) = repo {
        args.extend(["--repo", repo]);
    }
    match action {
        GhAction::Secret { .. } => cmd::run_redacted("gh", &args, &[value.as_str()]),
        GhAction::Variable { .. } => cmd::run("gh", &args),
    }?;
    info!("{}", action.describe(repo));
    Ok(())
}

/// Validate both env files, then set every Actions variable and
/// secret they provide. Returns the planned actions.
pub fn sync(options: &GhSyncOptions, overlay: &EnvMap) -> DeployResult<Vec<GhAction>> {
    let runtime_text = read_required(&options.runtime_file)?;
    let runtime = validate_runtime_file(Some(&options.runtime_file))?;
    let deploy = validate_deploy_file(Some(&options.deploy_file), overlay)?;

    let actions = plan_sync(&runtime_text, &runtime, &deploy);
    let repo = options.repo.as_deref();
    let client_id = deploy
        .get(EnvKey::AzureClientId.as_str())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && options.federated_credentials);
    if options.dry_run {
        for action in &actions {
            println!("[dry-run] {}", action.describe(repo));
        }
        if let Some(client_id) = client_id {
            println!("[dry-run] ensure federated credentials on app {client_id}");
        }
        return Ok(actions);
    }

    if !cmd::command_exists("gh") {
        return Err(DeployError::CommandNotFound("gh".into()));
    }
    for action in &actions {
        apply(action, repo)?;
    }
    info!("synced {} items to GitHub Actions", actions.len());

    if let Some(client_id) = client_id {
        let repo = match repo {
            Some(r) => r.to_string(),
            None => detect_repo(&options.repo_root)?,
        };
        let current = if options.include_current_branch {
            current_branch(&options.repo_root)
        } else {
            None
        };
        let subjects = oidc::github_subjects(
            &repo,
            default_branch(&repo).as_deref(),
            current.as_deref(),
            options.oidc_subject.as_deref(),
        );
        oidc::ensure_federated_credentials(client_id, &repo, &subjects)?;
    }
    Ok(actions)
}

fn non_empty(out: Option<String>) -> Option<String> {
    out.filter(|s| !s.is_empty())
}

/// `owner/name` of the origin remote, else of the repository `gh`
/// sees from the working directory.
pub fn detect_repo(repo_root: &Path) -> DeployResult<String> {
    let root = repo_root.to_string_lossy();
    let origin = non_empty(
        cmd::run_optional("git", &["-C", &root, "remote", "get-url", "origin"])
            .ok()
            .flatten(),
    );
    if let Some(url) = origin {
        let named = cmd::run_optional("gh", &["repo", "view", &url, "--json", "nameWithOwner", "-q", ".nameWithOwner"])?;
        if let Some(name) = non_empty(named) {
            return Ok(name);
        }
    }
    non_empty(cmd::run_optional("gh", &["repo", "view", "--json", "nameWithOwner", "-q", ".nameWithOwner"])?)
        .ok_or_else(|| DeployError::Other("could not determine the GitHub repository. Pass --repo owner/name".into()))
}

fn default_branch(repo: &str) -> Option<String> {
    let out = cmd::run_optional(
        "gh",
        &["repo", "view", repo, "--json", "defaultBranchRef", "-q", ".defaultBranchRef.name"],
    );
    non_empty(out.ok().flatten())
}

fn current_branch(repo_root: &Path) -> Option<String> {
    let root = repo_root.to_string_lossy();
    let out = cmd::run_optional("git", &["-C", &root, "rev-parse", "--abbrev-ref", "HEAD"]);
    non_empty(out.ok().flatten()).filter(|b| b != "HEAD")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GhItemKind {
    Secret,
    Variable,
}

impl GhItemKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Secret => "secret",
            Self::Variable => "variable",
        }
    }
}

/// A secret or variable stored on a repository or one of its
/// environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhItem {
    pub kind: GhItemKind,
    pub name: String,
    pub environment: Option<String>,
}

impl GhItem {
    #[must_use]
    pub fn delete_args<'a>(&'a self, repo: &'a str) -> Vec<&'a str> {
        let mut args = vec![self.kind.as_str(), "delete", self.name.as_str(), "-R", repo];
        if let Some(env) = &self.environment {
            args.extend(["--env", env.as_str()]);
        }
        args
    }
}

impl fmt::Display for GhItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.environment {
            Some(env) => write!(f, "{} {} (env:{env})", self.kind.as_str(), self.name),
            None => write!(f, "{} {} (repo)", self.kind.as_str(), self.name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GhNukeOptions {
    pub repo: Option<String>,
    pub repo_root: PathBuf,
    pub dry_run: bool,
}

/// One name per non-empty line.
fn names_of(out: Option<String>) -> Vec<String> {
    out.map(|o| {
        o.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

fn list_items(kind: GhItemKind, repo: &str, environment: Option<&str>) -> Vec<GhItem> {
    let mut args = vec![kind.as_str(), "list", "-R", repo];
    if let Some(env) = environment {
        args.extend(["--env", env]);
    }
    args.extend(["--json", "name", "-q", ".[].name"]);
    names_of(cmd::run_optional("gh", &args).ok().flatten())
        .into_iter()
        .map(|name| GhItem {
            kind,
            name,
            environment: environment.map(str::to_string),
        })
        .collect()
}

/// Every Actions secret and variable on `repo` and its
/// environments. Listing errors count as "none".
#[must_use]
pub fn inventory(repo: &str) -> Vec<GhItem> {
    let endpoint = format!("repos/{repo}/environments");
    let environments = names_of(
        cmd::run_optional("gh", &["api", &endpoint, "--jq", ".environments[].name"])
            .ok()
            .flatten(),
    );
    let scopes = std::iter::once(None).chain(environments.iter().map(|e| Some(e.as_str())));
    let mut items = Vec::new();
    for scope in scopes {
        for kind in [GhItemKind::Secret, GhItemKind::Variable] {
            items.extend(list_items(kind, repo, scope));
        }
    }
    items
}

/// Delete every Actions secret and variable of the repository.
/// `confirm` sees the inventory first and may cancel; it is not
/// consulted on dry runs. Delete failures are logged and skipped.
pub fn nuke(
    options: &GhNukeOptions,
    confirm: impl FnOnce(&str, &[GhItem]) -> DeployResult<bool>,
) -> DeployResult<Vec<GhItem>> {
    if !cmd::command_exists("gh") {
        return Err(DeployError::CommandNotFound("gh".into()));
    }
    let repo = match options.repo.as_deref() {
        Some(r) => r.to_string(),
        None => detect_repo(&options.repo_root)?,
    };
    let items = inventory(&repo);
    if options.dry_run {
        for item in &items {
            println!("[dry-run] would delete {item}");
        }
        return Ok(items);
    }
    if items.is_empty() {
        info!("no Actions secrets or variables on {repo}");
        return Ok(items);
    }
    if !confirm(&repo, &items)? {
        return Err(DeployError::Other("aborted, nothing deleted".into()));
    }
    for item in &items {
        match cmd::run("gh", &item.delete_args(&repo)) {
            Ok(_) => info!("deleted {item}"),
            Err(e) => warn!("could not delete {item}: {e}"),
        }
    }
    Ok(items)
}

fn read_required(path: &Path) -> DeployResult<String> {
    if !path.is_file() {
        return Err(DeployError::FileNotFound(format!(
            "missing file: {}",
            path.display()
        )));
    }
    Ok(std::fs::read_to_string(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> EnvMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn runtime_file_goes_first_as_secret() {
        let actions = plan_sync("BASIC_AUTH_HASH=x\n", &EnvMap::new(), &EnvMap::new());
        assert_eq!(
            actions,
            vec![GhAction::Secret {
                name: "RUNTIME_ENV_DOTENV".into(),
                value: "BASIC_AUTH_HASH=x\n".into()
            }]
        );
    }

    #[test]
    fn targets_decide_var_or_secret() {
        let runtime = map(&[("BASIC_AUTH_USER", "admin"), ("BASIC_AUTH_HASH", "$2a$14$h"), ("APP_SECRET", "s")]);
        let deploy = map(&[
            ("PUBLIC_DOMAIN", "app.example.com"),
            ("GHCR_TOKEN", "t"),
            ("DEPLOY_HOOKS_MODULE", "hooks.sh"),
            ("AZURE_TENANT_ID", "  "),
        ]);
        let actions = plan_sync("", &runtime, &deploy);
        let names: Vec<_> = actions.iter().map(|a| a.describe(None)).collect();
        assert_eq!(
            names,
            vec![
                "set var BASIC_AUTH_USER=admin",
                "set secret BASIC_AUTH_HASH",
                "set var PUBLIC_DOMAIN=app.example.com",
                "set secret GHCR_TOKEN",
            ]
        );
    }

    #[test]
    fn describe_hides_secret_values() {
        let action = GhAction::Secret {
            name: "GHCR_TOKEN".into(),
            value: "ghp_secret".into(),
        };
        let line = action.describe(Some("acme/app"));
        assert_eq!(line, "set secret GHCR_TOKEN (repo=acme/app)");
        assert!(!line.contains("ghp_secret"));
    }

    #[test]
    fn missing_runtime_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let options = GhSyncOptions {
            runtime_file: dir.path().join(".env"),
            deploy_file: dir.path().join(".env.deploy"),
            dry_run: true,
            ..GhSyncOptions::default()
        };
        let err = sync(&options, &EnvMap::new()).unwrap_err();
        assert!(matches!(err, DeployError::FileNotFound(_)));
    }

    #[test]
    fn dry_run_plans_without_gh() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "BASIC_AUTH_HASH=$2a$14$examplehash\n").unwrap();
        std::fs::write(
            dir.path().join(".env.deploy"),
            "PUBLIC_DOMAIN=app.example.com\nACME_EMAIL=ops@example.com\nCONTAINER_IMAGE=ghcr.io/acme/app:1\n",
        )
        .unwrap();
        let options = GhSyncOptions {
            repo: Some("acme/app".into()),
            runtime_file: dir.path().join(".env"),
            deploy_file: dir.path().join(".env.deploy"),
            dry_run: true,
            federated_credentials: true,
            ..GhSyncOptions::default()
        };
        let actions = sync(&options, &EnvMap::new()).unwrap();
        assert_eq!(actions[0].name(), "RUNTIME_ENV_DOTENV");
        assert!(actions.iter().any(|a| a.name() == "BASIC_AUTH_USER"));
        assert!(actions.iter().any(|a| a.name() == "AZURE_RESOURCE_GROUP"));
    }

    #[test]
    fn delete_args_scope_to_environment() {
        let repo_item = GhItem {
            kind: GhItemKind::Secret,
            name: "GHCR_TOKEN".into(),
            environment: None,
        };
        assert_eq!(repo_item.delete_args("acme/app"), vec!["secret", "delete", "GHCR_TOKEN", "-R", "acme/app"]);
        assert_eq!(repo_item.to_string(), "secret GHCR_TOKEN (repo)");

        let env_item = GhItem {
            kind: GhItemKind::Variable,
            name: "PUBLIC_DOMAIN".into(),
            environment: Some("production".into()),
        };
        assert_eq!(
            env_item.delete_args("acme/app"),
            vec!["variable", "delete", "PUBLIC_DOMAIN", "-R", "acme/app", "--env", "production"]
        );
        assert_eq!(env_item.to_string(), "variable PUBLIC_DOMAIN (env:production)");
    }

    #[test]
    fn listed_names_skip_blank_lines() {
        assert_eq!(names_of(Some("A\n\n B \n".into())), vec!["A", "B"]);
        assert!(names_of(None).is_empty());
    }
}
