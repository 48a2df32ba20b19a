use std::path::Path;

use tracing::{info, warn};

use crate::cmd;
use crate::error::{DeployError, DeployResult};

pub const GHCR: &str = "ghcr.io";

/// Build an image. `context` is the build context directory; the
/// Dockerfile defaults to `<context>/Dockerfile`.
pub fn build(image: &str, context: &Path, dockerfile: Option<&Path>) -> DeployResult<()> {
    info!("building image {image}");
    let context = context.to_string_lossy();
    let dockerfile = dockerfile.map(|p| p.to_string_lossy().into_owned());
    let mut args = vec!["build", "-t", image];
    if let Some(file) = &dockerfile {
        args.extend(["-f", file.as_str()]);
    }
    args.push(context.as_ref());
    cmd::run_interactive("docker", &args)
}

pub fn push(image: &str) -> DeployResult<()> {
    info!("pushing image {image}");
    cmd::run("docker", &["push", image])
        .inspect_err(|e| {
            if let Some(hint) = e.stderr().and_then(push_scope_hint) {
                warn!("{hint}");
            }
        })
        .map(drop)
}

pub fn pull(image: &str) -> DeployResult<()> {
    info!("pulling image {image}");
    cmd::run("docker", &["pull", image]).map(drop)
}

pub fn tag(source: &str, target: &str) -> DeployResult<()> {
    cmd::run("docker", &["tag", source, target]).map(drop)
}

/// Log in with the token piped through stdin.
pub fn login(registry: &str, username: &str, token: &str) -> DeployResult<()> {
    info!("logging into {registry} as {username}");
    cmd::run_with_stdin(
        "docker",
        &["login", registry, "-u", username, "--password-stdin"],
        token.as_bytes(),
    )
    .map(drop)
}

/// Owner segment of a `ghcr.io/<owner>/...` reference.
#[must_use]
pub fn ghcr_owner(image: &str) -> Option<&str> {
    image
        .strip_prefix("ghcr.io/")
        .and_then(|rest| rest.split('/').next())
        .filter(|owner| !owner.is_empty())
}

/// Repository path of an image in `registry`, without tag or
/// digest: `ghcr.io/acme/app:1` gives `ghcr.io/acme/app`.
#[must_use]
pub fn repo_prefix(image: &str, registry: &str) -> Option<String> {
    let rest = image.strip_prefix(registry)?.strip_prefix('/')?;
    let rest = rest.split('@').next().unwrap_or(rest);
    let rest = match rest.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => repo,
        _ => rest,
    };
    if rest.is_empty() {
        None
    } else {
        Some(format!("{registry}/{rest}"))
    }
}

/// Extra guidance for a GHCR push rejected over token scopes.
#[must_use]
pub fn push_scope_hint(stderr: &str) -> Option<&'static str> {
    let lowered = stderr.to_lowercase();
    if lowered.contains("permission_denied") || (lowered.contains("denied") && lowered.contains("scope")) {
        Some(
            "GHCR rejected the push. The token needs the write:packages scope, \
             and the package must grant this repository write access.",
        )
    } else {
        None
    }
}

/// Mirror `source` as `target` so every image of the group
/// comes from one registry. Returns the image to use.
pub fn mirror(source: &str, target: &str) -> DeployResult<String> {
    if source == target {
        info!("{source} already mirrored");
        return Ok(source.to_string());
    }
    info!("mirroring {source} to {target}");
    tag(source, target)?;
    push(target)?;
    Ok(target.to_string())
}

/// Fail early with a clear message when docker is missing.
pub fn require() -> DeployResult<()> {
    if cmd::command_exists("docker") {
        Ok(())
    } else {
        Err(DeployError::CommandNotFound(
            "docker (install Docker and ensure it is on PATH)".into(),
        ))
    }
}
