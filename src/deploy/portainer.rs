use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::compose;
use crate::deploy::Deployer;
use crate::docker::{self, GHCR};
use crate::env::dotenv::load_dotenv_file;
use crate::env::schema::{EnvKey, EnvTarget, UBUNTU_SCHEMA, spec_for};
use crate::env::validate::parse_boolish;
use crate::env::{self, EnvMap};
use crate::error::{DeployError, DeployResult};
use crate::plan::{DeployContext, DeployOutcome, DeployPlan};
use crate::portainer::{self, PortainerClient};
use crate::ssh::{self, SshSession};

pub const DEPLOY_SECRETS_FILE: &str = ".env.deploy.secrets";
pub const DEPLOY_FILE: &str = ".env.deploy";
pub const CENTRAL_PROXY: &str = "central-proxy";
pub const PROXY_SCRIPT: &str = "scripts/deploy/ubuntu_deploy_proxy.sh";

/// Env files synced to the host when present.
pub const SYNCED_ENV_FILES: [&str; 4] = [".env", ".env.secrets", ".env.deploy", ".env.deploy.secrets"];

/// Command-line overrides. `None`/`false` defers to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UbuntuOptions {
    pub host: Option<String>,
    pub remote_dir: Option<String>,
    pub compose_files: Option<String>,
    pub sync_secrets: bool,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub https_port: Option<u16>,
    pub webhook_insecure: bool,
    pub skip_build_push: bool,
}

/// Fully resolved settings for one Ubuntu deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbuntuSettings {
    pub host: String,
    pub remote_dir: String,
    pub compose_files: Vec<String>,
    pub app_image: Option<String>,
    pub dockerfile: String,
    pub build_push: bool,
    pub sync_secrets: bool,
    pub https_port: u16,
    pub webhook_insecure: bool,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub access_token: Option<String>,
    pub stack_name: String,
    pub endpoint_id: Option<String>,
    pub ghcr_username: Option<String>,
    pub ghcr_token: Option<String>,
}

impl UbuntuSettings {
    #[must_use]
    pub const fn has_api_auth(&self) -> bool {
        self.access_token.is_some()
    }

    fn ghcr_login(&self) -> Option<(&str, &str)> {
        self.ghcr_username.as_deref().zip(self.ghcr_token.as_deref())
    }

    fn is_ghcr_image(&self) -> bool {
        self.app_image
            .as_deref()
            .is_some_and(|i| i.starts_with(&format!("{GHCR}/")))
    }
}

/// Per-key lookup: CLI > context (process env) >
/// `.env.deploy.secrets` for secret-file keys > `.env.deploy` >
/// schema default.
struct Layers<'a> {
    context: &'a EnvMap,
    secrets: &'a EnvMap,
    deploy: &'a EnvMap,
}

impl Layers<'_> {
    fn get(&self, key: EnvKey, cli: Option<&str>) -> Option<String> {
        let spec = spec_for(UBUNTU_SCHEMA, key);
        let from_secrets = spec.is_some_and(|s| s.targets.contains(&EnvTarget::DotenvDeploySecrets));
        let non_blank = |v: &str| Some(v.trim().to_string()).filter(|v| !v.is_empty());

        cli.and_then(non_blank)
            .or_else(|| env::get(self.context, key).and_then(non_blank))
            .or_else(|| {
                if from_secrets {
                    env::get(self.secrets, key).and_then(non_blank)
                } else {
                    None
                }
            })
            .or_else(|| env::get(self.deploy, key).and_then(non_blank))
            .or_else(|| spec.and_then(|s| s.default).map(str::to_string))
    }

    fn flag(&self, key: EnvKey, cli: bool, default: bool) -> bool {
        cli || parse_boolish(self.get(key, None).as_deref(), default)
    }
}

/// Resolve settings from the layered sources and check them.
pub fn resolve_settings(
    options: &UbuntuOptions,
    context: &EnvMap,
    secrets: &EnvMap,
    deploy: &EnvMap,
) -> DeployResult<UbuntuSettings> {
    let layers = Layers {
        context,
        secrets,
        deploy,
    };
    let missing = |what: &str| DeployError::Other(what.to_string());

    let host = layers
        .get(EnvKey::UbuntuSshHost, options.host.as_deref())
        .ok_or_else(|| {
            missing("missing SSH host: pass --host, set UBUNTU_SSH_HOST, or add it to .env.deploy")
        })?;
    let remote_dir = layers
        .get(EnvKey::UbuntuRemoteDir, options.remote_dir.as_deref())
        .unwrap_or_default();
    let compose_files = layers
        .get(EnvKey::UbuntuComposeFiles, options.compose_files.as_deref())
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(str::to_string)
        .collect();

    let https_port = match options.https_port {
        Some(port) => u32::from(port),
        None => {
            let raw = layers.get(EnvKey::PortainerHttpsPort, None).unwrap_or_default();
            raw.parse()
                .map_err(|_| missing(&format!("PORTAINER_HTTPS_PORT must be a number, got '{raw}'")))?
        }
    };
    let https_port = u16::try_from(https_port)
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| missing("--portainer-https-port must be in range 1-65535"))?;

    let stack_name = layers.get(EnvKey::PortainerStackName, None).unwrap_or_else(|| {
        Path::new(&remote_dir)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let settings = UbuntuSettings {
        app_image: layers.get(EnvKey::AppImage, None),
        dockerfile: layers.get(EnvKey::Dockerfile, None).unwrap_or_default(),
        build_push: !options.skip_build_push && layers.flag(EnvKey::UbuntuBuildPush, false, true),
        sync_secrets: layers.flag(EnvKey::UbuntuSyncSecrets, options.sync_secrets, true),
        webhook_insecure: layers.flag(
            EnvKey::PortainerWebhookInsecure,
            options.webhook_insecure,
            false,
        ),
        webhook_url: layers.get(EnvKey::PortainerWebhookUrl, options.webhook_url.as_deref()),
        webhook_token: layers.get(EnvKey::PortainerWebhookToken, options.webhook_token.as_deref()),
        access_token: layers.get(EnvKey::PortainerAccessToken, None),
        endpoint_id: layers.get(EnvKey::PortainerEndpointId, None),
        ghcr_username: layers.get(EnvKey::GhcrUsername, None),
        ghcr_token: layers.get(EnvKey::GhcrToken, None),
        host,
        remote_dir,
        compose_files,
        https_port,
        stack_name,
    };

    if settings.build_push {
        if settings.app_image.is_none() {
            return Err(missing("APP_IMAGE is required when build/push is enabled"));
        }
        if settings.is_ghcr_image() && settings.ghcr_login().is_none() {
            return Err(missing(
                "GHCR_USERNAME and GHCR_TOKEN are required to build/push APP_IMAGE to ghcr.io. \
                 Set them in .env.deploy/.env.deploy.secrets or use --skip-build-push",
            ));
        }
    }
    if settings.webhook_url.is_none() && settings.webhook_token.is_none() && !settings.has_api_auth() {
        return Err(missing(
            "provide a Portainer webhook URL/token or API auth (PORTAINER_ACCESS_TOKEN)",
        ));
    }
    Ok(settings)
}

#[derive(Default)]
pub struct PortainerDeployer {
    options: UbuntuOptions,
    settings: Option<UbuntuSettings>,
}

impl PortainerDeployer {
    #[must_use]
    pub fn new(options: UbuntuOptions) -> Self {
        Self {
            options,
            settings: None,
        }
    }

    fn settings(&self) -> DeployResult<&UbuntuSettings> {
        self.settings
            .as_ref()
            .ok_or_else(|| DeployError::Other("Ubuntu settings used before validation".into()))
    }

    fn sync_paths(repo_root: &Path, settings: &UbuntuSettings) -> Vec<PathBuf> {
        settings
            .compose_files
            .iter()
            .map(|f| repo_root.join(f))
            .chain(std::iter::once(repo_root.join("docker")))
            .collect()
    }

    fn build_and_push(repo_root: &Path, settings: &UbuntuSettings) -> DeployResult<()> {
        let Some(image) = settings.app_image.as_deref() else {
            return Ok(());
        };
        docker::require()?;
        if settings.is_ghcr_image() {
            if let Some((username, token)) = settings.ghcr_login() {
                docker::login(GHCR, username, token)?;
            }
        }
        let dockerfile = repo_root.join(&settings.dockerfile);
        let context = dockerfile.parent().unwrap_or(repo_root).to_path_buf();
        docker::build(image, &context, Some(&dockerfile))?;
        docker::push(image)
    }

    fn sync_env_files(repo_root: &Path, ssh: &SshSession, remote_dir: &str) -> DeployResult<()> {
        let mut present = Vec::new();
        for name in SYNCED_ENV_FILES {
            let path = repo_root.join(name);
            if path.is_file() {
                present.push(path);
            } else {
                info!("skipping missing {}", path.display());
            }
        }
        if present.is_empty() {
            info!("no env files to sync");
            return Ok(());
        }
        info!("syncing environment files");
        let refs: Vec<&Path> = present.iter().map(PathBuf::as_path).collect();
        ssh.rsync_to(&refs, remote_dir)
    }

    fn ensure_central_proxy(repo_root: &Path, ssh: &SshSession) -> DeployResult<()> {
        let check = format!(
            "docker ps -a --format '{{{{.Names}}}}' | grep -Fxq {CENTRAL_PROXY}"
        );
        if ssh.exec(&check).is_ok() {
            info!("central proxy is already running");
            return Ok(());
        }
        let script = repo_root.join(PROXY_SCRIPT);
        if !script.is_file() {
            warn!("{} not found; cannot deploy the central proxy", script.display());
            return Ok(());
        }
        info!("central proxy missing, running {PROXY_SCRIPT}");
        crate::cmd::run_interactive("bash", &[&script.to_string_lossy()]).map_err(|e| {
            DeployError::Other(format!("failed to deploy central proxy via {PROXY_SCRIPT}: {e}"))
        })
    }
}

impl Deployer for PortainerDeployer {
    fn target(&self) -> &'static str {
        "portainer"
    }

    fn validate(&mut self, ctx: &mut DeployContext) -> DeployResult<()> {
        let secrets = load_dotenv_file(&ctx.repo_root.join(DEPLOY_SECRETS_FILE))?;
        let deploy = load_dotenv_file(&ctx.repo_root.join(DEPLOY_FILE))?;
        let settings = resolve_settings(&self.options, &ctx.env, &secrets, &deploy)?;

        let missing: Vec<String> = Self::sync_paths(&ctx.repo_root, &settings)
            .into_iter()
            .filter(|p| !p.exists())
            .map(|p| p.display().to_string())
            .collect();
        if !missing.is_empty() {
            return Err(DeployError::FileNotFound(format!(
                "missing required files: {}",
                missing.join(", ")
            )));
        }

        ctx.env
            .insert(EnvKey::UbuntuSshHost.to_string(), settings.host.clone());
        ctx.env
            .insert(EnvKey::UbuntuRemoteDir.to_string(), settings.remote_dir.clone());
        ctx.env
            .insert(EnvKey::PortainerStackName.to_string(), settings.stack_name.clone());
        if let Some(image) = &settings.app_image {
            ctx.env.insert(EnvKey::AppImage.to_string(), image.clone());
        }
        self.settings = Some(settings);
        Ok(())
    }

    fn build_plan(&mut self, _ctx: &DeployContext) -> DeployResult<DeployPlan> {
        let settings = self.settings()?;
        let hostname = portainer::ssh_hostname(&settings.host);
        let mut plan = DeployPlan::new(
            &settings.stack_name,
            hostname,
            settings.app_image.as_deref().unwrap_or_default(),
        );
        plan.dns_label = hostname.to_string();
        plan.deploy_mode = "portainer".to_string();
        plan.extra_metadata
            .insert("remote_dir".into(), settings.remote_dir.clone().into());
        plan.extra_metadata.insert(
            "compose_files".into(),
            settings.compose_files.clone().into(),
        );
        Ok(plan)
    }

    fn prepare(&mut self, ctx: &DeployContext, plan: &mut DeployPlan) -> DeployResult<()> {
        let settings = self.settings()?.clone();
        let root = ctx.repo_root.as_path();

        if settings.build_push {
            info!("building and pushing {}", plan.app_image);
            Self::build_and_push(root, &settings)?;
        }

        info!("target {}, remote dir {}", settings.host, settings.remote_dir);
        let ssh = SshSession::new(&settings.host);
        ssh.check_connectivity()?;

        info!("ensuring remote directory exists");
        ssh.exec(&format!("mkdir -p {}", ssh::quote(&settings.remote_dir)))?;

        info!("syncing compose files and docker assets");
        let paths = Self::sync_paths(root, &settings);
        let refs: Vec<&Path> = paths.iter().map(PathBuf::as_path).collect();
        ssh.rsync_to(&refs, &settings.remote_dir)?;

        if settings.sync_secrets {
            Self::sync_env_files(root, &ssh, &settings.remote_dir)?;
        }

        info!("ensuring Portainer is running");
        ssh.exec(&portainer::ensure_running_command(settings.https_port))?;

        if let (true, Some((username, token))) = (settings.is_ghcr_image(), settings.ghcr_login()) {
            info!("logging into GHCR and pre-pulling the app image on the host");
            ssh.exec_with_stdin(
                &portainer::ghcr_login_pull_command(&plan.app_image, username),
                token,
            )?;
        }

        Self::ensure_central_proxy(root, &ssh)
    }

    /// The stack content Portainer receives: the merged compose
    /// config with local paths pointing at the remote directory
    /// and the app built from its pushed image.
    fn render(&mut self, ctx: &DeployContext, plan: &DeployPlan) -> DeployResult<String> {
        let settings = self.settings()?;
        let rendered = compose::render_compose_stack(&ctx.repo_root, &settings.compose_files)?;
        let remote = compose::rewrite_paths_for_remote(&rendered, &ctx.repo_root, &settings.remote_dir);
        compose::prepare_stack_for_portainer(&remote, &plan.app_image)
    }

    fn apply(
        &mut self,
        _ctx: &DeployContext,
        _plan: &DeployPlan,
        manifest_path: &Path,
    ) -> DeployResult<DeployOutcome> {
        let settings = self.settings()?.clone();
        let content = std::fs::read_to_string(manifest_path)?;
        let mut outcome = DeployOutcome {
            target: self.target().to_string(),
            url: Some(format!(
                "https://{}:{}/",
                portainer::ssh_hostname(&settings.host),
                settings.https_port
            )),
            details: vec![format!("stack: {}", settings.stack_name)],
        };

        let mut webhook_url = settings.webhook_url.clone();
        if let Some(token) = &settings.access_token {
            info!("deploying stack through the Portainer API");
            let ssh = SshSession::new(&settings.host);
            let client = PortainerClient::new(&settings.host, settings.https_port, token)
                .insecure(settings.webhook_insecure);
            let created = client.recreate_stack(
                &settings.stack_name,
                settings.endpoint_id.as_deref(),
                &content,
                |name| ssh.exec(&portainer::remove_container_command(name)).map(drop),
            )?;
            match created {
                Some(t) => {
                    webhook_url = portainer::webhook_urls(&settings.host, settings.https_port, &t)
                        .into_iter()
                        .next();
                }
                None => {
                    info!("stack deployed via API; no webhook token returned, skipping trigger");
                    outcome.details.push("deployed via API".into());
                    return Ok(outcome);
                }
            }
        }

        let urls = match (webhook_url, &settings.webhook_token) {
            (Some(url), _) => vec![url],
            (None, Some(token)) => portainer::webhook_urls(&settings.host, settings.https_port, token),
            (None, None) => {
                return Err(DeployError::Portainer("no webhook URL or token available".into()));
            }
        };
        info!("triggering Portainer webhook");
        portainer::trigger_webhook(&urls, settings.webhook_insecure, settings.has_api_auth())?;
        outcome.details.push("webhook triggered".into());
        Ok(outcome)
    }
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

    fn no_build() -> UbuntuOptions {
        UbuntuOptions {
            skip_build_push: true,
            ..UbuntuOptions::default()
        }
    }

    #[test]
    fn defaults_fill_in() {
        let deploy = map(&[("UBUNTU_SSH_HOST", "deploy@box"), ("PORTAINER_ACCESS_TOKEN", "ignored")]);
        let secrets = map(&[("PORTAINER_WEBHOOK_TOKEN", "tok")]);
        let s = resolve_settings(&no_build(), &EnvMap::new(), &secrets, &deploy).unwrap();
        assert_eq!(s.remote_dir, "/opt/protected-container");
        assert_eq!(s.stack_name, "protected-container");
        assert_eq!(
            s.compose_files,
            vec!["docker/docker-compose.yml", "docker/docker-compose.ubuntu.yml"]
        );
        assert_eq!(s.https_port, 9943);
        assert!(s.sync_secrets);
        assert!(!s.webhook_insecure);
        assert_eq!(s.webhook_token.as_deref(), Some("tok"));
        assert_eq!(s.access_token.as_deref(), Some("ignored"));
    }

    #[test]
    fn cli_beats_env_beats_files() {
        let deploy = map(&[("UBUNTU_SSH_HOST", "file"), ("UBUNTU_REMOTE_DIR", "/srv/file")]);
        let context = map(&[("UBUNTU_SSH_HOST", "env"), ("UBUNTU_REMOTE_DIR", "/srv/env")]);
        let options = UbuntuOptions {
            host: Some("cli".into()),
            webhook_url: Some("https://hook".into()),
            ..no_build()
        };
        let s = resolve_settings(&options, &context, &EnvMap::new(), &deploy).unwrap();
        assert_eq!(s.host, "cli");
        assert_eq!(s.remote_dir, "/srv/env");
        assert_eq!(s.stack_name, "env");
    }

    #[test]
    fn secret_keys_read_from_secrets_file_first() {
        let deploy = map(&[("UBUNTU_SSH_HOST", "h"), ("PORTAINER_WEBHOOK_URL", "https://deploy")]);
        let secrets = map(&[("PORTAINER_WEBHOOK_URL", "https://secret")]);
        let s = resolve_settings(&no_build(), &EnvMap::new(), &secrets, &deploy).unwrap();
        assert_eq!(s.webhook_url.as_deref(), Some("https://secret"));
    }

    #[test]
    fn missing_host_is_an_error() {
        let err = resolve_settings(&no_build(), &EnvMap::new(), &EnvMap::new(), &EnvMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("UBUNTU_SSH_HOST"));
    }

    #[test]
    fn webhook_or_api_auth_required() {
        let deploy = map(&[("UBUNTU_SSH_HOST", "h")]);
        let err = resolve_settings(&no_build(), &EnvMap::new(), &EnvMap::new(), &deploy).unwrap_err();
        assert!(err.to_string().contains("PORTAINER_ACCESS_TOKEN"));
    }

    #[test]
    fn port_range_checked() {
        let deploy = map(&[
            ("UBUNTU_SSH_HOST", "h"),
            ("PORTAINER_WEBHOOK_TOKEN", "t"),
            ("PORTAINER_HTTPS_PORT", "70000"),
        ]);
        let err = resolve_settings(&no_build(), &EnvMap::new(), &EnvMap::new(), &deploy).unwrap_err();
        assert!(err.to_string().contains("1-65535"));
    }

    #[test]
    fn build_push_needs_image_and_ghcr_login() {
        let deploy = map(&[("UBUNTU_SSH_HOST", "h"), ("PORTAINER_WEBHOOK_TOKEN", "t")]);
        let err = resolve_settings(&UbuntuOptions::default(), &EnvMap::new(), &EnvMap::new(), &deploy)
            .unwrap_err();
        assert!(err.to_string().contains("APP_IMAGE"));

        let deploy = map(&[
            ("UBUNTU_SSH_HOST", "h"),
            ("PORTAINER_WEBHOOK_TOKEN", "t"),
            ("APP_IMAGE", "ghcr.io/acme/app:1"),
        ]);
        let err = resolve_settings(&UbuntuOptions::default(), &EnvMap::new(), &EnvMap::new(), &deploy)
            .unwrap_err();
        assert!(err.to_string().contains("GHCR_TOKEN"));

        let deploy = map(&[
            ("UBUNTU_SSH_HOST", "h"),
            ("PORTAINER_WEBHOOK_TOKEN", "t"),
            ("APP_IMAGE", "ghcr.io/acme/app:1"),
            ("UBUNTU_BUILD_PUSH", "no"),
        ]);
        let s = resolve_settings(&UbuntuOptions::default(), &EnvMap::new(), &EnvMap::new(), &deploy)
            .unwrap();
        assert!(!s.build_push);
    }

    #[test]
    fn validate_reports_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(".env.deploy"),
            "UBUNTU_SSH_HOST=h\nPORTAINER_WEBHOOK_TOKEN=t\n",
        )
        .unwrap();
        let mut ctx = DeployContext::new(dir.path(), EnvMap::new());
        let err = PortainerDeployer::new(no_build())
            .validate(&mut ctx)
            .unwrap_err();
        assert!(matches!(err, DeployError::FileNotFound(_)));
        assert!(err.to_string().contains("docker-compose.yml"));
    }

    #[test]
    fn plan_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docker")).unwrap();
        std::fs::write(dir.path().join("docker/docker-compose.yml"), "services: {}\n").unwrap();
        let mut ctx = DeployContext::new(
            dir.path(),
            map(&[
                ("UBUNTU_SSH_HOST", "deploy@box"),
                ("UBUNTU_COMPOSE_FILES", "docker/docker-compose.yml"),
                ("PORTAINER_WEBHOOK_URL", "https://box:9943/api/webhooks/x"),
                ("APP_IMAGE", "ghcr.io/acme/app:1"),
            ]),
        );
        let mut deployer = PortainerDeployer::new(no_build());
        deployer.validate(&mut ctx).unwrap();
        let plan = deployer.build_plan(&ctx).unwrap();
        assert_eq!(plan.name, "protected-container");
        assert_eq!(plan.location, "box");
        assert_eq!(plan.app_image, "ghcr.io/acme/app:1");
        assert_eq!(ctx.env["PORTAINER_STACK_NAME"], "protected-container");
    }
}
