use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{DeployHooks, HookPoint};
use crate::cmd;
use crate::env::EnvMap;
use crate::error::{DeployError, DeployResult};
use crate::plan::{DeployContext, DeployOutcome, DeployPlan};

#[derive(Serialize)]
struct HookRequest<'a> {
    hook: &'static str,
    context: &'a DeployContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    plan: Option<&'a DeployPlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manifest_path: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a DeployOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<'a> HookRequest<'a> {
    const fn new(point: HookPoint, context: &'a DeployContext) -> Self {
        Self {
            hook: point.as_str(),
            context,
            plan: None,
            manifest: None,
            manifest_path: None,
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct HookResponse {
    env: Option<EnvMap>,
    plan: Option<DeployPlan>,
    manifest: Option<String>,
}

/// Hooks backed by an executable plugin.
///
/// `<plugin> hooks` prints a JSON array of the hook names it
/// implements. `<plugin> <hook>` gets a JSON request on stdin and
/// may print an object with `env`, `plan` and/or `manifest`; each
/// present field replaces the current value. Empty output means no
/// change and a non-zero exit is a failure.
#[derive(Debug, Clone)]
pub struct ExecHooks {
    program: PathBuf,
    implemented: HashSet<HookPoint>,
}

impl ExecHooks {
    /// Load a plugin and ask it which hooks it implements.
    pub fn load(path: &Path) -> DeployResult<Self> {
        let load_err = |message: String| DeployError::HookLoad {
            path: path.display().to_string(),
            message,
        };

        if !path.is_file() {
            return Err(load_err("hook plugin not found".into()));
        }

        let program = path.to_string_lossy();
        let listing = cmd::run(&program, &["hooks"]).map_err(|e| load_err(e.to_string()))?;
        let implemented = parse_capabilities(&listing).map_err(load_err)?;
        debug!(
            "hooks from {}: {:?}",
            path.display(),
            implemented.iter().map(|p| p.as_str()).collect::<Vec<_>>()
        );

        Ok(Self {
            program: path.to_path_buf(),
            implemented,
        })
    }

    #[must_use]
    pub fn implements(&self, point: HookPoint) -> bool {
        self.implemented.contains(&point)
    }

    fn call(&self, request: &HookRequest<'_>, point: HookPoint) -> anyhow::Result<HookResponse> {
        if !self.implements(point) {
            return Ok(HookResponse::default());
        }
        let body = serde_json::to_vec(request)?;
        let program = self.program.to_string_lossy();
        let out = cmd::run_with_stdin(&program, &[point.as_str()], &body)?;
        if out.trim().is_empty() {
            return Ok(HookResponse::default());
        }
        serde_json::from_str(&out).with_context(|| format!("invalid {point} response"))
    }
}

fn parse_capabilities(listing: &str) -> Result<HashSet<HookPoint>, String> {
    let names: Vec<String> = serde_json::from_str(listing.trim())
        .map_err(|e| format!("expected a JSON array of hook names: {e}"))?;
    names
        .iter()
        .map(|name| HookPoint::from_name(name).ok_or_else(|| format!("unknown hook name: {name}")))
        .collect()
}

impl DeployHooks for ExecHooks {
    fn pre_validate_env(&mut self, ctx: &mut DeployContext) -> anyhow::Result<()> {
        let request = HookRequest::new(HookPoint::PreValidateEnv, ctx);
        let response = self.call(&request, HookPoint::PreValidateEnv)?;
        if let Some(env) = response.env {
            ctx.env = env;
        }
        Ok(())
    }

    fn post_validate_env(&mut self, ctx: &DeployContext) -> anyhow::Result<()> {
        let request = HookRequest::new(HookPoint::PostValidateEnv, ctx);
        self.call(&request, HookPoint::PostValidateEnv)?;
        Ok(())
    }

    fn build_deploy_plan(&mut self, ctx: &DeployContext, plan: &mut DeployPlan) -> anyhow::Result<()> {
        let request = HookRequest {
            plan: Some(plan),
            ..HookRequest::new(HookPoint::BuildDeployPlan, ctx)
        };
        let response = self.call(&request, HookPoint::BuildDeployPlan)?;
        if let Some(updated) = response.plan {
            *plan = updated;
        }
        Ok(())
    }

    fn pre_render_yaml(&mut self, ctx: &DeployContext, plan: &mut DeployPlan) -> anyhow::Result<()> {
        let request = HookRequest {
            plan: Some(plan),
            ..HookRequest::new(HookPoint::PreRenderYaml, ctx)
        };
        let response = self.call(&request, HookPoint::PreRenderYaml)?;
        if let Some(updated) = response.plan {
            *plan = updated;
        }
        Ok(())
    }

    fn post_render_yaml(
        &mut self,
        ctx: &DeployContext,
        plan: &DeployPlan,
        manifest: &str,
    ) -> anyhow::Result<Option<String>> {
        let request = HookRequest {
            plan: Some(plan),
            manifest: Some(manifest),
            ..HookRequest::new(HookPoint::PostRenderYaml, ctx)
        };
        Ok(self.call(&request, HookPoint::PostRenderYaml)?.manifest)
    }

    fn pre_az_apply(
        &mut self,
        ctx: &DeployContext,
        plan: &DeployPlan,
        manifest_path: &Path,
    ) -> anyhow::Result<()> {
        let request = HookRequest {
            plan: Some(plan),
            manifest_path: Some(manifest_path),
            ..HookRequest::new(HookPoint::PreAzApply, ctx)
        };
        self.call(&request, HookPoint::PreAzApply)?;
        Ok(())
    }

    fn post_deploy(
        &mut self,
        ctx: &DeployContext,
        plan: &DeployPlan,
        outcome: &DeployOutcome,
    ) -> anyhow::Result<()> {
        let request = HookRequest {
            plan: Some(plan),
            result: Some(outcome),
            ..HookRequest::new(HookPoint::PostDeploy, ctx)
        };
        self.call(&request, HookPoint::PostDeploy)?;
        Ok(())
    }

    fn on_error(&mut self, ctx: &DeployContext, error: &DeployError) -> anyhow::Result<()> {
        let request = HookRequest {
            error: Some(error.to_string()),
            ..HookRequest::new(HookPoint::OnError, ctx)
        };
        self.call(&request, HookPoint::OnError)?;
        Ok(())
    }
}
