use std::io::BufRead;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use crate::auth;
use crate::deploy::aci::{
    self, AciDeployer, AciOptions, DEFAULT_CADDY_IMAGE, DEPLOY_ENV_FILE, RUNTIME_ENV_FILE,
};
use crate::deploy::portainer::{PortainerDeployer, UbuntuOptions};
use crate::env::dotenv::load_dotenv_file;
use crate::env::schema::{DEPLOY_SCHEMA, RUNTIME_SCHEMA, UBUNTU_SCHEMA};
use crate::env::validate::{validate_deploy_file, validate_runtime_file};
use crate::env::{EnvMap, process_overlay};
use crate::error::{DeployError, DeployResult};
use crate::gh::{self, GhItem, GhNukeOptions, GhSyncOptions};
use crate::hooks::{HookRunner, load_hooks};
use crate::pipeline::DeployPipeline;
use crate::plan::{DeployContext, DeployOutcome};

#[derive(Parser)]
#[command(name = "shieldlaunch")]
#[command(about = "Deploy a Basic-Auth protected container to Azure Container Instances or a Portainer host")]
pub struct Cli {
    /// More output (-v debug, -vv trace). `RUST_LOG` wins.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Repository root holding the env files and compose config
    #[arg(long, global = true, default_value = ".")]
    pub repo_root: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Validate the runtime and deploy env files
    ValidateEnv {
        #[arg(long, default_value = RUNTIME_ENV_FILE)]
        runtime: PathBuf,

        #[arg(long, default_value = DEPLOY_ENV_FILE)]
        deploy: PathBuf,

        /// Validate runtime defaults only
        #[arg(long)]
        no_runtime_file: bool,

        /// Validate the deploy schema from the environment only
        #[arg(long)]
        no_deploy_file: bool,
    },

    /// Deploy to Azure Container Instances
    DeployAci(AciArgs),

    /// Deploy to an Ubuntu host running Portainer
    DeployUbuntu(UbuntuArgs),

    /// Push env keys to GitHub Actions variables and secrets
    GhSync {
        /// `owner/repo`, default is the current repository
        #[arg(long)]
        repo: Option<String>,

        #[arg(long, default_value = RUNTIME_ENV_FILE)]
        runtime: PathBuf,

        #[arg(long, default_value = DEPLOY_ENV_FILE)]
        deploy: PathBuf,

        /// Print what would be set
        #[arg(long)]
        dry_run: bool,

        /// Leave the federated credentials of AZURE_CLIENT_ID alone
        #[arg(long)]
        no_federated_credential: bool,

        /// Trust exactly this token subject instead of the defaults
        #[arg(long)]
        oidc_subject: Option<String>,

        /// Also trust the currently checked out branch
        #[arg(long)]
        oidc_include_current_branch: bool,
    },

    /// Delete every GitHub Actions secret and variable of a repository
    GhNuke {
        /// `owner/repo`, default is the current repository
        #[arg(long)]
        repo: Option<String>,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// List what would be deleted
        #[arg(long)]
        dry_run: bool,
    },

    /// Upload a runtime env file to Key Vault as one secret
    UploadEnv {
        #[arg(long)]
        vault: String,

        #[arg(long, short = 'e', default_value = RUNTIME_ENV_FILE)]
        env_file: PathBuf,

        #[arg(long, short = 's', default_value = "env")]
        secret_name: String,
    },

    /// Print a Caddy-compatible bcrypt hash
    HashPassword {
        /// Read from stdin when omitted
        #[arg(long)]
        password: Option<String>,

        /// Double every `$` for compose files
        #[arg(long)]
        compose_escape: bool,

        /// bcrypt cost factor
        #[arg(long, default_value_t = auth::DEFAULT_COST, value_parser = clap::value_parser!(u32).range(4..=31))]
        cost: u32,
    },

    /// Print random v4 UUIDs
    Guid {
        #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        count: u32,
    },
}

#[derive(clap::Args, Serialize)]
pub struct HookArgs {
    /// Hooks executable, default `scripts/deploy/deploy_customizations`
    #[arg(long)]
    pub hooks: Option<PathBuf>,

    /// Log hook failures instead of aborting
    #[arg(long, overrides_with = "no_hooks_soft_fail")]
    pub hooks_soft_fail: bool,

    #[arg(long)]
    pub no_hooks_soft_fail: bool,
}

impl HookArgs {
    const fn soft_fail(&self) -> Option<bool> {
        if self.hooks_soft_fail {
            Some(true)
        } else if self.no_hooks_soft_fail {
            Some(false)
        } else {
            None
        }
    }
}

#[derive(clap::Args, Serialize)]
pub struct AciArgs {
    /// Deploy env file
    #[arg(long, default_value = DEPLOY_ENV_FILE)]
    pub env_file: PathBuf,

    #[command(flatten)]
    pub hooks: HookArgs,

    #[arg(long)]
    pub cpu: Option<f64>,

    /// Memory in GB
    #[arg(long)]
    pub memory: Option<f64>,

    /// App image, overrides CONTAINER_IMAGE and compose
    #[arg(long)]
    pub image: Option<String>,

    #[arg(long, default_value = DEFAULT_CADDY_IMAGE)]
    pub caddy_image: String,

    /// Build and push the app image (default unless --no-publish)
    #[arg(long)]
    pub build_push: bool,

    #[arg(long)]
    pub no_publish: bool,

    /// Hashed when BASIC_AUTH_HASH is not set
    #[arg(long)]
    #[serde(skip)]
    pub basic_auth_password: Option<String>,

    /// Skip uploading the runtime env to Key Vault
    #[arg(long)]
    pub no_upload_env: bool,

    /// Do not write resolved Azure ids back to the deploy file
    #[arg(long)]
    pub no_write_back: bool,

    /// Compose files to read services from (repeatable)
    #[arg(long = "compose-file")]
    pub compose_files: Vec<String>,

    /// GitHub Actions app registration, default `<repo dir>-github-actions-oidc`
    #[arg(long)]
    pub oidc_app_name: Option<String>,

    /// Do not create the app registration or its role assignments
    #[arg(long)]
    pub no_oidc: bool,

    /// Print the manifest without touching Azure
    #[arg(long)]
    pub dry_run: bool,
}

impl AciArgs {
    fn options(&self) -> AciOptions {
        AciOptions {
            deploy_env_file: Some(self.env_file.clone()),
            cpu: self.cpu,
            memory: self.memory,
            image: self.image.clone(),
            caddy_image: self.caddy_image.clone(),
            publish: self.build_push || !self.no_publish,
            basic_auth_password: self.basic_auth_password.clone(),
            upload_env: !self.no_upload_env,
            write_back: !self.no_write_back,
            compose_files: self.compose_files.clone(),
            ensure_oidc: !self.no_oidc,
            oidc_app_name: self.oidc_app_name.clone(),
            ..AciOptions::default()
        }
    }
}

#[derive(clap::Args, Serialize)]
pub struct UbuntuArgs {
    #[command(flatten)]
    pub hooks: HookArgs,

    /// SSH host (alias or user@host)
    #[arg(long)]
    pub host: Option<String>,

    #[arg(long)]
    pub remote_dir: Option<String>,

    /// Comma-separated compose files
    #[arg(long)]
    pub compose_files: Option<String>,

    /// Sync the env files to the host
    #[arg(long)]
    pub sync_secrets: bool,

    #[arg(long)]
    #[serde(skip)]
    pub portainer_webhook_url: Option<String>,

    #[arg(long)]
    #[serde(skip)]
    pub portainer_webhook_token: Option<String>,

    #[arg(long)]
    pub portainer_https_port: Option<u16>,

    /// Skip TLS verification for the webhook and API
    #[arg(long)]
    pub portainer_webhook_insecure: bool,

    #[arg(long)]
    pub skip_build_push: bool,
}

impl UbuntuArgs {
    fn options(&self) -> UbuntuOptions {
        UbuntuOptions {
            host: self.host.clone(),
            remote_dir: self.remote_dir.clone(),
            compose_files: self.compose_files.clone(),
            sync_secrets: self.sync_secrets,
            webhook_url: self.portainer_webhook_url.clone(),
            webhook_token: self.portainer_webhook_token.clone(),
            https_port: self.portainer_https_port,
            webhook_insecure: self.portainer_webhook_insecure,
            skip_build_push: self.skip_build_push,
        }
    }
}

/// Run one parsed command.
pub fn dispatch(cli: &Cli) -> DeployResult<()> {
    let root = cli.repo_root.as_path();
    match &cli.command {
        Command::ValidateEnv {
            runtime,
            deploy,
            no_runtime_file,
            no_deploy_file,
        } => validate_env(
            (!no_runtime_file).then(|| root.join(runtime)).as_deref(),
            (!no_deploy_file).then(|| root.join(deploy)).as_deref(),
        ),
        Command::DeployAci(args) => deploy_aci(root, args),
        Command::DeployUbuntu(args) => deploy_ubuntu(root, args),
        Command::GhSync {
            repo,
            runtime,
            deploy,
            dry_run,
            no_federated_credential,
            oidc_subject,
            oidc_include_current_branch,
        } => {
            let options = GhSyncOptions {
                repo: repo.clone(),
                repo_root: root.to_path_buf(),
                runtime_file: root.join(runtime),
                deploy_file: root.join(deploy),
                dry_run: *dry_run,
                federated_credentials: !no_federated_credential,
                oidc_subject: oidc_subject.clone(),
                include_current_branch: *oidc_include_current_branch,
            };
            gh::sync(&options, &process_overlay(DEPLOY_SCHEMA)).map(drop)
        }
        Command::GhNuke { repo, yes, dry_run } => {
            let options = GhNukeOptions {
                repo: repo.clone(),
                repo_root: root.to_path_buf(),
                dry_run: *dry_run,
            };
            let deleted = gh::nuke(&options, |repo, items| {
                if *yes {
                    Ok(true)
                } else {
                    confirm_delete(repo, items)
                }
            })?;
            if !dry_run {
                println!("deleted {} items", deleted.len());
            }
            Ok(())
        }
        Command::UploadEnv {
            vault,
            env_file,
            secret_name,
        } => aci::upload_env_file(vault, &root.join(env_file), secret_name).map(drop),
        Command::HashPassword {
            password,
            compose_escape,
            cost,
        } => {
            let password = match password {
                Some(p) => p.clone(),
                None => read_password()?,
            };
            let hash = auth::hash_password(&password, *cost)?;
            if *compose_escape {
                println!("{}", auth::compose_escape(&hash));
            } else {
                println!("{hash}");
            }
            Ok(())
        }
        Command::Guid { count } => {
            for _ in 0..*count {
                println!("{}", uuid::Uuid::new_v4());
            }
            Ok(())
        }
    }
}

fn validate_env(runtime: Option<&Path>, deploy: Option<&Path>) -> DeployResult<()> {
    validate_runtime_file(runtime)?;
    validate_deploy_file(deploy, &process_overlay(DEPLOY_SCHEMA))?;
    println!("[env] ok");
    Ok(())
}

fn deploy_aci(root: &Path, args: &AciArgs) -> DeployResult<()> {
    let mut env = process_overlay(RUNTIME_SCHEMA);
    env.extend(process_overlay(DEPLOY_SCHEMA));
    let hooks = hooks_for(root, &args.hooks, &root.join(&args.env_file))?;

    let mut ctx = DeployContext::new(root, env).with_args(args);
    let mut pipeline = DeployPipeline::new(AciDeployer::new(args.options())).hooks(hooks);
    if args.dry_run {
        let manifest = pipeline.render_only(&mut ctx)?;
        println!("{manifest}");
        return Ok(());
    }
    report(&pipeline.run(&mut ctx)?);
    Ok(())
}

fn deploy_ubuntu(root: &Path, args: &UbuntuArgs) -> DeployResult<()> {
    let hooks = hooks_for(root, &args.hooks, &root.join(DEPLOY_ENV_FILE))?;
    let mut ctx = DeployContext::new(root, process_overlay(UBUNTU_SCHEMA)).with_args(args);
    let mut pipeline = DeployPipeline::new(PortainerDeployer::new(args.options())).hooks(hooks);
    report(&pipeline.run(&mut ctx)?);
    Ok(())
}

/// Hooks are located before validation, so the deploy file is read
/// raw with the process environment on top.
fn hooks_for(root: &Path, args: &HookArgs, deploy_file: &Path) -> DeployResult<HookRunner> {
    let mut env: EnvMap = load_dotenv_file(deploy_file)?;
    env.extend(process_overlay(DEPLOY_SCHEMA));
    load_hooks(root, args.hooks.as_deref(), args.soft_fail(), &env)
}

fn report(outcome: &DeployOutcome) {
    info!("{} deploy finished", outcome.target);
    for line in &outcome.details {
        println!("{line}");
    }
    if let Some(url) = &outcome.url {
        println!("{url}");
    }
}

fn confirm_delete(repo: &str, items: &[GhItem]) -> DeployResult<bool> {
    for item in items {
        eprintln!("  {item}");
    }
    eprintln!("Type DELETE to remove these {} items from {repo}:", items.len());
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim() == "DELETE")
}

fn read_password() -> DeployResult<String> {
    eprintln!("Basic Auth password (one line on stdin):");
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.trim().is_empty() {
        return Err(DeployError::Other("password must be non-empty".into()));
    }
    Ok(password)
}
