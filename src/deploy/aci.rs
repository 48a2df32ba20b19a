use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tracing::{info, warn};

use crate::auth;
use crate::azure::{self, AzureNames, IdentityDetails};
use crate::compose;
use crate::deploy::Deployer;
use crate::docker::{self, GHCR};
use crate::env::dotenv::{load_dotenv_file, write_dotenv_values};
use crate::env::schema::{DEPLOY_SCHEMA, EnvKey, spec_for};
use crate::env::validate::{truthy, validate_deploy_file, validate_runtime_file};
use crate::env::{self, EnvMap};
use crate::error::{DeployError, DeployResult};
use crate::manifest::{
    AciYaml, AuxContainer, ContainerSize, ManifestInput, ManifestRenderer, RegistryCredentials,
};
use crate::oidc;
use crate::plan::{DeployContext, DeployOutcome, DeployPlan};

pub const RUNTIME_ENV_FILE: &str = ".env";
pub const DEPLOY_ENV_FILE: &str = ".env.deploy";
pub const DEFAULT_CADDY_IMAGE: &str = "caddy:2-alpine";

/// Compose files picked up from the repo root when none are given.
const COMPOSE_CANDIDATES: [&str; 2] = ["docker-compose.yml", "compose.yaml"];

/// Stand-ins for values only known after `prepare`.
const PLACEHOLDER_STORAGE_KEY: &str = "<storage-account-key>";
const PLACEHOLDER_HASH: &str = "<basic-auth-hash>";
const PLACEHOLDER_SUBSCRIPTION: &str = "<subscription-id>";
const PLACEHOLDER_PASSWORD: &str = "<registry-password>";

/// Knobs of an ACI deploy. Everything else comes from the
/// resolved config map.
#[derive(Debug, Clone, PartialEq)]
pub struct AciOptions {
    /// Deploy file, default `<repo>/.env.deploy`.
    pub deploy_env_file: Option<PathBuf>,
    /// Runtime file, default `<repo>/.env`.
    pub runtime_env_file: Option<PathBuf>,
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    /// Overrides `CONTAINER_IMAGE` and any compose image.
    pub image: Option<String>,
    pub caddy_image: String,
    /// Build and push the app image before deploying.
    pub publish: bool,
    /// Pull the proxy image locally (and mirror it when pushing).
    pub prefetch_images: bool,
    pub basic_auth_password: Option<String>,
    pub upload_env: bool,
    pub upload_env_prefixes: Vec<String>,
    pub upload_env_secret: String,
    pub write_back: bool,
    pub compose_files: Vec<String>,
    /// Create the GitHub Actions app registration when
    /// `AZURE_CLIENT_ID` is blank, and grant it its roles.
    pub ensure_oidc: bool,
    /// Display name of that app registration.
    pub oidc_app_name: Option<String>,
}

impl Default for AciOptions {
    fn default() -> Self {
        Self {
            deploy_env_file: None,
            runtime_env_file: None,
            cpu: None,
            memory: None,
            image: None,
            caddy_image: DEFAULT_CADDY_IMAGE.to_string(),
            publish: true,
            prefetch_images: true,
            basic_auth_password: None,
            upload_env: true,
            upload_env_prefixes: vec!["BASIC_AUTH_".to_string()],
            upload_env_secret: "env".to_string(),
            write_back: true,
            compose_files: Vec::new(),
            ensure_oidc: true,
            oidc_app_name: None,
        }
    }
}

/// App registration GitHub Actions signs in as.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OidcApp {
    client_id: String,
    app_name: Option<String>,
}

/// Values gathered by `prepare` that the manifest needs.
#[derive(Debug, Clone)]
struct Prepared {
    names: AzureNames,
    storage_key: String,
    identity: IdentityDetails,
    registry: RegistryCredentials,
    basic_auth_user: String,
    basic_auth_hash: String,
}

pub struct AciDeployer {
    options: AciOptions,
    renderer: Box<dyn ManifestRenderer>,
    prepared: Option<Prepared>,
}

impl AciDeployer {
    #[must_use]
    pub fn new(options: AciOptions) -> Self {
        Self {
            options,
            renderer: Box::new(AciYaml),
            prepared: None,
        }
    }

    /// Swap the manifest renderer.
    #[must_use]
    pub fn renderer(mut self, renderer: impl ManifestRenderer + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    fn runtime_path(&self, repo_root: &Path) -> PathBuf {
        resolve_under(repo_root, self.options.runtime_env_file.as_deref(), RUNTIME_ENV_FILE)
    }

    fn deploy_path(&self, repo_root: &Path) -> PathBuf {
        resolve_under(repo_root, self.options.deploy_env_file.as_deref(), DEPLOY_ENV_FILE)
    }

    fn compose_files(&self, repo_root: &Path) -> Vec<String> {
        if !self.options.compose_files.is_empty() {
            return self.options.compose_files.clone();
        }
        COMPOSE_CANDIDATES
            .iter()
            .find(|f| repo_root.join(f).is_file())
            .map(|f| vec![(*f).to_string()])
            .unwrap_or_default()
    }

    fn names(ctx: &DeployContext, plan: &DeployPlan) -> AzureNames {
        let resource_group = env::get(&ctx.env, EnvKey::AzureResourceGroup)
            .map_or_else(|| default_of(EnvKey::AzureResourceGroup), str::to_string);
        AzureNames::derive(&resource_group, &plan.location, &plan.name)
    }

    /// Command line, then `AZURE_OIDC_APP_NAME`, then
    /// `<repo dir>-github-actions-oidc`.
    fn oidc_app_name(&self, ctx: &DeployContext) -> String {
        self.options
            .oidc_app_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .or_else(|| env::get(&ctx.env, EnvKey::AzureOidcAppName))
            .map_or_else(|| oidc::default_app_name(&ctx.repo_root), str::to_string)
    }

    /// A configured `AZURE_CLIENT_ID` is used as is; otherwise the
    /// app registration is looked up or created.
    fn oidc_app(&self, ctx: &DeployContext) -> DeployResult<Option<OidcApp>> {
        if let Some(client_id) = env::get(&ctx.env, EnvKey::AzureClientId) {
            return Ok(Some(OidcApp {
                client_id: client_id.to_string(),
                app_name: env::get(&ctx.env, EnvKey::AzureOidcAppName).map(str::to_string),
            }));
        }
        if !self.options.ensure_oidc {
            return Ok(None);
        }
        let app_name = self.oidc_app_name(ctx);
        let client_id = oidc::ensure_app(&app_name)?;
        info!("GitHub Actions app '{app_name}' has client id {client_id}");
        Ok(Some(OidcApp {
            client_id,
            app_name: Some(app_name),
        }))
    }

    fn write_back(
        &self,
        ctx: &DeployContext,
        app: Option<&OidcApp>,
        tenant_id: &str,
        subscription_id: &str,
    ) -> DeployResult<()> {
        let mut updates = IndexMap::new();
        if let Some(app) = app {
            updates.insert(EnvKey::AzureClientId.to_string(), app.client_id.clone());
        }
        updates.insert(EnvKey::AzureTenantId.to_string(), tenant_id.to_string());
        updates.insert(EnvKey::AzureSubscriptionId.to_string(), subscription_id.to_string());
        if let Some(name) = app.and_then(|a| a.app_name.as_deref()) {
            updates.insert(EnvKey::AzureOidcAppName.to_string(), name.to_string());
        }
        let path = self.deploy_path(&ctx.repo_root);
        write_dotenv_values(&path, &updates, true)?;
        info!("updated {} with derived Azure IDs", path.display());
        Ok(())
    }

    /// Upload the filtered runtime file as one Key Vault secret;
    /// the container fetches it at start.
    fn upload_runtime_env(&self, ctx: &DeployContext, names: &AzureNames) -> DeployResult<()> {
        let path = self.runtime_path(&ctx.repo_root);
        if is_deploy_file(&path) {
            return Err(DeployError::Other(format!(
                "refusing to upload deploy-only env file to Key Vault: {}. \
                 Put runtime settings in .env",
                path.display()
            )));
        }
        if !path.is_file() {
            return Err(DeployError::FileNotFound(format!(
                "runtime env file {}. Create it or pass --no-upload-env",
                path.display()
            )));
        }
        let kv = load_dotenv_file(&path)?;
        let content = filtered_env_content(&kv, &self.options.upload_env_prefixes);
        azure::kv_data_plane_check(&names.keyvault)?;
        azure::kv_secret_set(&names.keyvault, &self.options.upload_env_secret, &content)
    }

    /// An existing hash (or password) from the config map wins,
    /// then the command-line password.
    fn basic_auth_hash(&self, ctx: &DeployContext) -> DeployResult<String> {
        if let Some(value) = env::get(&ctx.env, EnvKey::BasicAuthHash) {
            return auth::resolve_hash(value);
        }
        match self
            .options
            .basic_auth_password
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            Some(password) => auth::hash_password(password, auth::DEFAULT_COST),
            None => Err(DeployError::Other(
                "missing Basic Auth credentials: set BASIC_AUTH_HASH in .env or pass --basic-auth-password"
                    .into(),
            )),
        }
    }

    fn registry_credentials(&self, ctx: &DeployContext, image: &str) -> DeployResult<RegistryCredentials> {
        let private = truthy(env::get(&ctx.env, EnvKey::GhcrPrivate));
        if !private && !self.options.publish {
            return Ok(RegistryCredentials::default());
        }
        let username = env::get(&ctx.env, EnvKey::GhcrUsername).or_else(|| docker::ghcr_owner(image));
        let token = env::get(&ctx.env, EnvKey::GhcrToken);
        match (username, token) {
            (Some(username), Some(token)) => Ok(RegistryCredentials::new(GHCR, username, token)),
            _ if private => Err(DeployError::Other(
                "GHCR_PRIVATE=true but GHCR credentials are incomplete. Set GHCR_USERNAME/GHCR_TOKEN".into(),
            )),
            _ => Err(DeployError::Other(
                "publishing the image requires GHCR credentials. \
                 Set GHCR_USERNAME/GHCR_TOKEN or pass --no-publish"
                    .into(),
            )),
        }
    }

    fn build_and_push(repo_root: &Path, image: &str, registry: &RegistryCredentials) -> DeployResult<()> {
        docker::require()?;
        let docker_dir = repo_root.join("docker");
        let context = if docker_dir.join("Dockerfile").is_file() {
            docker_dir
        } else {
            repo_root.to_path_buf()
        };
        docker::build(image, &context, None)?;

        let (Some(server), Some(username), Some(token)) = (
            registry.server.as_deref(),
            registry.username.as_deref(),
            registry.password.as_deref(),
        ) else {
            return Err(DeployError::Other("pushing requires registry credentials".into()));
        };
        docker::login(server, username, token)?;
        docker::push(image)
    }

    /// Pull the proxy image and, when pushing to GHCR, mirror it
    /// next to the app image. Any failure keeps the original.
    fn proxy_image(&self, plan: &DeployPlan, registry: &RegistryCredentials) -> String {
        let source = plan.caddy_image.clone();
        if !self.options.prefetch_images {
            return source;
        }
        if let Err(e) = docker::pull(&source) {
            warn!("could not prefetch {source}: {e}; continuing");
            return source;
        }
        let Some(username) = registry.username.as_deref().filter(|_| self.options.publish) else {
            return source;
        };
        let prefix =
            docker::repo_prefix(&plan.app_image, GHCR).unwrap_or_else(|| format!("{GHCR}/{username}"));
        let target = format!("{prefix}/{DEFAULT_CADDY_IMAGE}");
        docker::mirror(&source, &target).unwrap_or_else(|e| {
            warn!("failed to mirror {source} to {target}: {e}; using {source}");
            source
        })
    }

    fn manifest_input(&self, ctx: &DeployContext, plan: &DeployPlan) -> ManifestInput {
        let prepared = self.prepared.clone().unwrap_or_else(|| placeholders(ctx, plan));
        let names = &prepared.names;
        ManifestInput {
            name: plan.name.clone(),
            location: plan.location.clone(),
            dns_label: plan.dns_label.clone(),
            image: plan.app_image.clone(),
            registry: prepared.registry.clone(),
            identity_id: prepared.identity.id.clone(),
            identity_client_id: non_empty(&prepared.identity.client_id),
            identity_tenant_id: non_empty(&prepared.identity.tenant_id),
            storage_name: names.storage_account.clone(),
            storage_key: prepared.storage_key.clone(),
            keyvault_name: names.keyvault.clone(),
            public_domain: plan.public_domain.clone(),
            acme_email: env::get(&ctx.env, EnvKey::AcmeEmail).unwrap_or_default().to_string(),
            basic_auth_user: prepared.basic_auth_user.clone(),
            basic_auth_hash: prepared.basic_auth_hash.clone(),
            app_size: ContainerSize::new(plan.app_cpu, plan.app_memory),
            proxy_image: plan.caddy_image.clone(),
            proxy_size: ContainerSize::new(plan.caddy_cpu, plan.caddy_memory),
            share_workspace: names.share_workspace.clone(),
            share_caddy_data: names.share_caddy_data.clone(),
            share_caddy_config: names.share_caddy_config.clone(),
            app_port: plan.app_port,
            app_ports: plan.app_ports.clone(),
            app_command: plan.web_command.clone().unwrap_or_default(),
            extra_env: plan.extra_env.clone(),
            aux: plan.other_image.as_ref().map(|image| AuxContainer {
                image: image.clone(),
                size: ContainerSize::new(plan.other_cpu, plan.other_memory),
            }),
        }
    }
}

impl Deployer for AciDeployer {
    fn target(&self) -> &'static str {
        "aci"
    }

    fn validate(&mut self, ctx: &mut DeployContext) -> DeployResult<()> {
        let runtime_path = self.runtime_path(&ctx.repo_root);
        let runtime = if runtime_path.is_file() {
            validate_runtime_file(Some(&runtime_path))?
        } else {
            EnvMap::new()
        };

        let overlay: EnvMap = ctx
            .env
            .iter()
            .filter(|(k, _)| EnvKey::from_name(k).is_some_and(|key| spec_for(DEPLOY_SCHEMA, key).is_some()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let deploy = validate_deploy_file(Some(&self.deploy_path(&ctx.repo_root)), &overlay)?;

        // Values already in the context come from the process
        // environment or hooks and take precedence over `.env`.
        for (key, value) in runtime {
            ctx.env.entry(key).or_insert(value);
        }
        ctx.env.extend(deploy);
        info!("[env] ok");
        Ok(())
    }

    fn build_plan(&mut self, ctx: &DeployContext) -> DeployResult<DeployPlan> {
        let value = |key: EnvKey| {
            env::get(&ctx.env, key).map_or_else(|| default_of(key), str::to_string)
        };
        let image = self
            .options
            .image
            .clone()
            .filter(|i| !i.trim().is_empty())
            .unwrap_or_else(|| value(EnvKey::ContainerImage));

        let mut plan = DeployPlan::new(
            &value(EnvKey::AzureContainerName),
            &value(EnvKey::AzureLocation),
            &image,
        );
        let label = env::get(&ctx.env, EnvKey::AzureDnsLabel).unwrap_or(&plan.name);
        plan.dns_label = label.to_lowercase();
        plan.public_domain = value(EnvKey::PublicDomain);
        plan.caddy_image.clone_from(&self.options.caddy_image);
        plan.app_cpu = match self.options.cpu {
            Some(cpu) => cpu,
            None => parse_number(EnvKey::DefaultCpuCores, &value(EnvKey::DefaultCpuCores))?,
        };
        plan.app_memory = match self.options.memory {
            Some(memory) => memory,
            None => parse_number(EnvKey::DefaultMemoryGb, &value(EnvKey::DefaultMemoryGb))?,
        };

        let files = self.compose_files(&ctx.repo_root);
        if !files.is_empty() {
            match compose::load_compose_config(&ctx.repo_root, &files) {
                Ok(config) => compose::apply_compose_to_plan(&config, &mut plan),
                Err(e) => warn!("ignoring compose files {files:?}: {e}"),
            }
        }
        if let Some(image) = self.options.image.as_deref().filter(|i| !i.trim().is_empty()) {
            plan.app_image = image.to_string();
        }
        Ok(plan)
    }

    fn prepare(&mut self, ctx: &DeployContext, plan: &mut DeployPlan) -> DeployResult<()> {
        azure::require_login()?;
        let names = Self::names(ctx, plan);
        azure::ensure_infra(&names)?;

        let account = azure::account_show()?;
        let subscription_id = env::get(&ctx.env, EnvKey::AzureSubscriptionId)
            .map_or(account.subscription_id, str::to_string);
        let tenant_id =
            env::get(&ctx.env, EnvKey::AzureTenantId).map_or(account.tenant_id, str::to_string);
        let app = self.oidc_app(ctx)?;
        if self.options.write_back {
            self.write_back(ctx, app.as_ref(), &tenant_id, &subscription_id)?;
        }
        if let Some(app) = app.as_ref().filter(|_| self.options.ensure_oidc) {
            oidc::ensure_role_assignments(&app.client_id, &subscription_id, &names.resource_group, &names.keyvault);
        }

        if self.options.upload_env {
            self.upload_runtime_env(ctx, &names)?;
        }

        let basic_auth_hash = self.basic_auth_hash(ctx)?;
        let registry = self.registry_credentials(ctx, &plan.app_image)?;
        if self.options.publish {
            Self::build_and_push(&ctx.repo_root, &plan.app_image, &registry)?;
        }
        plan.caddy_image = self.proxy_image(plan, &registry);

        let storage_key = azure::storage_key(&names)?;
        let identity = azure::identity_details(&names)?;
        self.prepared = Some(Prepared {
            names,
            storage_key,
            identity,
            registry,
            basic_auth_user: basic_auth_user(ctx),
            basic_auth_hash,
        });
        Ok(())
    }

    fn render(&mut self, ctx: &DeployContext, plan: &DeployPlan) -> DeployResult<String> {
        let input = self.manifest_input(ctx, plan);
        self.renderer.render(&input)
    }

    fn apply(
        &mut self,
        ctx: &DeployContext,
        plan: &DeployPlan,
        manifest_path: &Path,
    ) -> DeployResult<DeployOutcome> {
        let names = self
            .prepared
            .as_ref()
            .map_or_else(|| Self::names(ctx, plan), |p| p.names.clone());
        azure::container_delete(&names);
        azure::container_create(&names.resource_group, &manifest_path.to_string_lossy())?;

        let fqdn = plan.fallback_fqdn();
        info!("deployed {} ({fqdn})", plan.name);
        Ok(DeployOutcome {
            target: self.target().to_string(),
            url: Some(format!("https://{}/", plan.public_domain)),
            details: vec![format!("FQDN: {fqdn}")],
        })
    }
}

/// Dry-run stand-ins. Secrets never appear; names are derived the
/// same way `prepare` derives them.
fn placeholders(ctx: &DeployContext, plan: &DeployPlan) -> Prepared {
    let names = AciDeployer::names(ctx, plan);
    let subscription = env::get(&ctx.env, EnvKey::AzureSubscriptionId).unwrap_or(PLACEHOLDER_SUBSCRIPTION);
    let registry = if truthy(env::get(&ctx.env, EnvKey::GhcrPrivate)) {
        let username = env::get(&ctx.env, EnvKey::GhcrUsername)
            .or_else(|| docker::ghcr_owner(&plan.app_image))
            .unwrap_or("<ghcr-username>");
        RegistryCredentials::new(GHCR, username, PLACEHOLDER_PASSWORD)
    } else {
        RegistryCredentials::default()
    };
    let basic_auth_hash = env::get(&ctx.env, EnvKey::BasicAuthHash)
        .map(auth::unescape_compose)
        .filter(|h| auth::looks_like_bcrypt(h))
        .unwrap_or_else(|| PLACEHOLDER_HASH.to_string());
    Prepared {
        identity: IdentityDetails {
            id: names.identity_resource_id(subscription),
            ..IdentityDetails::default()
        },
        names,
        storage_key: PLACEHOLDER_STORAGE_KEY.to_string(),
        registry,
        basic_auth_user: basic_auth_user(ctx),
        basic_auth_hash,
    }
}

fn basic_auth_user(ctx: &DeployContext) -> String {
    env::get(&ctx.env, EnvKey::BasicAuthUser)
        .unwrap_or("admin")
        .to_string()
}

/// `KEY=value` lines for keys starting with any of `prefixes`.
/// No prefixes keeps every key.
#[must_use]
pub fn filtered_env_content(kv: &EnvMap, prefixes: &[String]) -> String {
    kv.iter()
        .filter(|(k, _)| prefixes.is_empty() || prefixes.iter().any(|p| k.starts_with(p.as_str())))
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect()
}

/// Validate a runtime file and store its whole content as the
/// Key Vault secret `secret_name`. Returns the number of setting
/// lines uploaded.
pub fn upload_env_file(vault: &str, path: &Path, secret_name: &str) -> DeployResult<usize> {
    if is_deploy_file(path) {
        return Err(DeployError::Other(format!(
            "refusing to upload deploy-only env file to Key Vault: {}",
            path.display()
        )));
    }
    validate_runtime_file(Some(path))?;
    let content = std::fs::read_to_string(path)?;
    let settings = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .count();
    info!("read {} ({settings} setting lines)", path.display());

    azure::require_login()?;
    azure::kv_data_plane_check(vault)?;
    azure::kv_secret_set(vault, secret_name, &content)?;
    info!("uploaded secret '{secret_name}' to Key Vault '{vault}'");
    Ok(settings)
}

/// Deploy-time files hold provisioning credentials and must never
/// reach the runtime secret.
#[must_use]
pub fn is_deploy_file(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy())
        .is_some_and(|n| n == "env.deploy" || n.starts_with(".env.deploy"))
}

fn resolve_under(repo_root: &Path, path: Option<&Path>, default: &str) -> PathBuf {
    match path {
        Some(p) if p.is_absolute() => p.to_path_buf(),
        Some(p) => repo_root.join(p),
        None => repo_root.join(default),
    }
}

fn default_of(key: EnvKey) -> String {
    spec_for(DEPLOY_SCHEMA, key)
        .and_then(|spec| spec.default)
        .unwrap_or_default()
        .to_string()
}

fn parse_number(key: EnvKey, raw: &str) -> DeployResult<f64> {
    raw.trim()
        .parse()
        .map_err(|_| DeployError::Other(format!("{key} must be a number, got '{raw}'")))
}

fn non_empty(value: &str) -> Option<String> {
    Some(value.trim().to_string()).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const HASH: &str = "$2a$14$ajq8Q7fbtFRQvXpdCq7Jcuy.Rx1h/L4J60Otx.gyNLbAYctGMJ9tK";

    fn repo(runtime: &str, deploy: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".env"), runtime).unwrap();
        fs::write(dir.path().join(".env.deploy"), deploy).unwrap();
        dir
    }

    const DEPLOY: &str = "PUBLIC_DOMAIN=app.example.com\n\
                          ACME_EMAIL=ops@example.com\n\
                          CONTAINER_IMAGE=ghcr.io/acme/app:1\n\
                          AZURE_CONTAINER_NAME=Web-App\n";

    #[test]
    fn env_filter_by_prefix() {
        let kv: EnvMap = [("BASIC_AUTH_USER", "a"), ("APP_SECRET", "s"), ("BASIC_AUTH_HASH", "h")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(
            filtered_env_content(&kv, &["BASIC_AUTH_".to_string()]),
            "BASIC_AUTH_USER=a\nBASIC_AUTH_HASH=h\n"
        );
        assert_eq!(filtered_env_content(&kv, &[]).lines().count(), 3);
    }

    #[test]
    fn deploy_files_are_never_uploaded() {
        assert!(is_deploy_file(Path::new("/r/.env.deploy")));
        assert!(is_deploy_file(Path::new("/r/.env.deploy.secrets")));
        assert!(is_deploy_file(Path::new("env.deploy")));
        assert!(!is_deploy_file(Path::new("/r/.env")));
    }

    #[test]
    fn upload_checks_the_file_before_azure() {
        let dir = repo("BASIC_AUTH_HASH=x\nFOO=bar\n", DEPLOY);
        let err = upload_env_file("kvapp", &dir.path().join(".env.deploy"), "env").unwrap_err();
        assert!(err.to_string().contains("deploy-only"));

        let err = upload_env_file("kvapp", &dir.path().join(".env"), "env").unwrap_err();
        assert_eq!(err.exit_code(), 2);

        let err = upload_env_file("kvapp", &dir.path().join("missing.env"), "env").unwrap_err();
        assert!(matches!(err, DeployError::FileNotFound(_)));
    }

    #[test]
    fn validate_merges_runtime_and_deploy() {
        let dir = repo(&format!("BASIC_AUTH_HASH={HASH}\n"), DEPLOY);
        let mut ctx = DeployContext::new(dir.path(), EnvMap::new());
        let mut deployer = AciDeployer::new(AciOptions::default());
        deployer.validate(&mut ctx).unwrap();
        assert_eq!(ctx.env["BASIC_AUTH_USER"], "admin");
        assert_eq!(ctx.env["AZURE_DNS_LABEL"], "Web-App");
        assert_eq!(ctx.env["AZURE_LOCATION"], "westeurope");
    }

    #[test]
    fn validate_rejects_unknown_runtime_key() {
        let dir = repo(&format!("BASIC_AUTH_HASH={HASH}\nFOO=bar\n"), DEPLOY);
        let mut ctx = DeployContext::new(dir.path(), EnvMap::new());
        let err = AciDeployer::new(AciOptions::default())
            .validate(&mut ctx)
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(err.to_string().contains("FOO"));
    }

    #[test]
    fn context_values_beat_runtime_file() {
        let dir = repo(&format!("BASIC_AUTH_HASH={HASH}\nBASIC_AUTH_USER=file\n"), DEPLOY);
        let mut env = EnvMap::new();
        env.insert("BASIC_AUTH_USER".into(), "ci".into());
        let mut ctx = DeployContext::new(dir.path(), env);
        AciDeployer::new(AciOptions::default())
            .validate(&mut ctx)
            .unwrap();
        assert_eq!(ctx.env["BASIC_AUTH_USER"], "ci");
    }

    #[test]
    fn plan_and_dry_run_manifest() {
        let dir = repo(&format!("BASIC_AUTH_HASH={HASH}\n"), DEPLOY);
        let mut ctx = DeployContext::new(dir.path(), EnvMap::new());
        let mut deployer = AciDeployer::new(AciOptions {
            cpu: Some(2.0),
            ..AciOptions::default()
        });
        deployer.validate(&mut ctx).unwrap();
        let plan = deployer.build_plan(&ctx).unwrap();
        assert_eq!(plan.name, "Web-App");
        assert_eq!(plan.dns_label, "web-app");
        assert!((plan.app_cpu - 2.0).abs() < f64::EPSILON);
        assert!((plan.app_memory - 2.0).abs() < f64::EPSILON);

        let text = deployer.render(&ctx, &plan).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&text).unwrap();
        let volumes = doc["properties"]["volumes"].as_sequence().unwrap();
        assert_eq!(
            volumes[0]["azureFile"]["storageAccountKey"].as_str(),
            Some(PLACEHOLDER_STORAGE_KEY)
        );
        assert!(text.contains(HASH));
        assert!(doc["properties"].get("imageRegistryCredentials").is_none());
    }

    #[test]
    fn explicit_image_wins() {
        let dir = repo(&format!("BASIC_AUTH_HASH={HASH}\n"), DEPLOY);
        let mut ctx = DeployContext::new(dir.path(), EnvMap::new());
        let mut deployer = AciDeployer::new(AciOptions {
            image: Some("ghcr.io/acme/other:2".into()),
            ..AciOptions::default()
        });
        deployer.validate(&mut ctx).unwrap();
        assert_eq!(deployer.build_plan(&ctx).unwrap().app_image, "ghcr.io/acme/other:2");
    }

    #[test]
    fn missing_credentials_when_publishing() {
        let dir = repo(&format!("BASIC_AUTH_HASH={HASH}\n"), DEPLOY);
        let ctx = DeployContext::new(dir.path(), EnvMap::new());
        let deployer = AciDeployer::new(AciOptions::default());
        let err = deployer
            .registry_credentials(&ctx, "ghcr.io/acme/app:1")
            .unwrap_err();
        assert!(err.to_string().contains("--no-publish"));

        let deployer = AciDeployer::new(AciOptions {
            publish: false,
            ..AciOptions::default()
        });
        assert_eq!(
            deployer.registry_credentials(&ctx, "ghcr.io/acme/app:1").unwrap(),
            RegistryCredentials::default()
        );
    }

    #[test]
    fn oidc_app_name_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("portal");
        fs::create_dir(&repo).unwrap();
        let mut ctx = DeployContext::new(&repo, EnvMap::new());
        let deployer = AciDeployer::new(AciOptions::default());
        assert_eq!(deployer.oidc_app_name(&ctx), "portal-github-actions-oidc");

        ctx.env.insert("AZURE_OIDC_APP_NAME".into(), "portal-ci".into());
        assert_eq!(deployer.oidc_app_name(&ctx), "portal-ci");

        let deployer = AciDeployer::new(AciOptions {
            oidc_app_name: Some("from-cli".into()),
            ..AciOptions::default()
        });
        assert_eq!(deployer.oidc_app_name(&ctx), "from-cli");
    }

    #[test]
    fn configured_client_id_skips_app_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = EnvMap::new();
        env.insert("AZURE_CLIENT_ID".into(), "11111111-2222-3333-4444-555555555555".into());
        let ctx = DeployContext::new(dir.path(), env);
        let app = AciDeployer::new(AciOptions::default()).oidc_app(&ctx).unwrap().unwrap();
        assert_eq!(app.client_id, "11111111-2222-3333-4444-555555555555");
        assert_eq!(app.app_name, None);

        let ctx = DeployContext::new(dir.path(), EnvMap::new());
        let deployer = AciDeployer::new(AciOptions {
            ensure_oidc: false,
            ..AciOptions::default()
        });
        assert_eq!(deployer.oidc_app(&ctx).unwrap(), None);
    }

    #[test]
    fn write_back_records_app_and_ids() {
        let dir = repo("", DEPLOY);
        let ctx = DeployContext::new(dir.path(), EnvMap::new());
        let app = OidcApp {
            client_id: "cid".into(),
            app_name: Some("portal-ci".into()),
        };
        AciDeployer::new(AciOptions::default())
            .write_back(&ctx, Some(&app), "tid", "sid")
            .unwrap();
        let written = load_dotenv_file(&dir.path().join(".env.deploy")).unwrap();
        assert_eq!(written["AZURE_CLIENT_ID"], "cid");
        assert_eq!(written["AZURE_TENANT_ID"], "tid");
        assert_eq!(written["AZURE_SUBSCRIPTION_ID"], "sid");
        assert_eq!(written["AZURE_OIDC_APP_NAME"], "portal-ci");
        assert_eq!(written["PUBLIC_DOMAIN"], "app.example.com");
    }

    #[test]
    fn username_defaults_to_image_owner() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = EnvMap::new();
        env.insert("GHCR_PRIVATE".into(), "true".into());
        env.insert("GHCR_TOKEN".into(), "tok".into());
        let ctx = DeployContext::new(dir.path(), env);
        let creds = AciDeployer::new(AciOptions::default())
            .registry_credentials(&ctx, "ghcr.io/acme/app:1")
            .unwrap();
        assert_eq!(creds, RegistryCredentials::new(GHCR, "acme", "tok"));
    }
}
