//! Deploy lifecycle hooks.
//!
//! A deploy run passes through seven extension points in a fixed
//! order, plus [`HookPoint::OnError`] which may fire from any of
//! them:
//!
//! 1. `pre_validate_env` - may add keys to the config map
//! 2. `post_validate_env`
//! 3. `build_deploy_plan` - may mutate the plan
//! 4. `pre_render_yaml`
//! 5. `post_render_yaml` - may replace the rendered manifest
//! 6. `pre_az_apply`
//! 7. `post_deploy`
//!
//! Extensions implement [`DeployHooks`]; every method defaults to a
//! no-op so an implementation only overrides what it needs. Out of
//! process extensions are executables loaded by [`load_hooks`] (see
//! [`ExecHooks`]).

pub mod exec;

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::env::EnvMap;
use crate::env::schema::EnvKey;
use crate::error::{DeployError, DeployResult};
use crate::plan::{DeployContext, DeployOutcome, DeployPlan};

pub use exec::ExecHooks;

/// Conventional plugin location, relative to the repo root.
pub const DEFAULT_HOOKS_PATH: &str = "scripts/deploy/deploy_customizations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreValidateEnv,
    PostValidateEnv,
    BuildDeployPlan,
    PreRenderYaml,
    PostRenderYaml,
    PreAzApply,
    PostDeploy,
    OnError,
}

impl HookPoint {
    pub const ALL: [Self; 8] = [
        Self::PreValidateEnv,
        Self::PostValidateEnv,
        Self::BuildDeployPlan,
        Self::PreRenderYaml,
        Self::PostRenderYaml,
        Self::PreAzApply,
        Self::PostDeploy,
        Self::OnError,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreValidateEnv => "pre_validate_env",
            Self::PostValidateEnv => "post_validate_env",
            Self::BuildDeployPlan => "build_deploy_plan",
            Self::PreRenderYaml => "pre_render_yaml",
            Self::PostRenderYaml => "post_render_yaml",
            Self::PreAzApply => "pre_az_apply",
            Self::PostDeploy => "post_deploy",
            Self::OnError => "on_error",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extension points of a deploy run. All methods are optional.
pub trait DeployHooks {
    fn pre_validate_env(&mut self, _ctx: &mut DeployContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_validate_env(&mut self, _ctx: &DeployContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn build_deploy_plan(
        &mut self,
        _ctx: &DeployContext,
        _plan: &mut DeployPlan,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn pre_render_yaml(&mut self, _ctx: &DeployContext, _plan: &mut DeployPlan) -> anyhow::Result<()> {
        Ok(())
    }

    /// Return `Some(text)` to replace the rendered manifest.
    fn post_render_yaml(
        &mut self,
        _ctx: &DeployContext,
        _plan: &DeployPlan,
        _manifest: &str,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn pre_az_apply(
        &mut self,
        _ctx: &DeployContext,
        _plan: &DeployPlan,
        _manifest_path: &Path,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn post_deploy(
        &mut self,
        _ctx: &DeployContext,
        _plan: &DeployPlan,
        _outcome: &DeployOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observe a failure. The run aborts afterwards regardless.
    fn on_error(&mut self, _ctx: &DeployContext, _error: &DeployError) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Holds the loaded hooks (if any) and wraps every call.
///
/// With soft-fail on, a failing hook is logged and treated as a
/// no-op. Otherwise it surfaces as [`DeployError::Hook`].
pub struct HookRunner {
    hooks: Option<Box<dyn DeployHooks>>,
    soft_fail: bool,
}

impl fmt::Debug for HookRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRunner")
            .field("active", &self.hooks.is_some())
            .field("soft_fail", &self.soft_fail)
            .finish()
    }
}

impl HookRunner {
    #[must_use]
    pub fn none() -> Self {
        Self {
            hooks: None,
            soft_fail: false,
        }
    }

    #[must_use]
    pub fn new(hooks: impl DeployHooks + 'static, soft_fail: bool) -> Self {
        Self {
            hooks: Some(Box::new(hooks)),
            soft_fail,
        }
    }

    #[must_use]
    pub fn from_boxed(hooks: Option<Box<dyn DeployHooks>>, soft_fail: bool) -> Self {
        Self { hooks, soft_fail }
    }

    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.hooks.is_some()
    }

    #[must_use]
    pub const fn soft_fail(&self) -> bool {
        self.soft_fail
    }

    fn guard<T: Default>(&self, point: HookPoint, result: anyhow::Result<T>) -> DeployResult<T> {
        match result {
            Ok(v) => Ok(v),
            Err(e) if self.soft_fail => {
                warn!("hook '{point}' failed: {e:#} (soft-fail enabled)");
                Ok(T::default())
            }
            Err(e) => {
                error!("hook '{point}' failed: {e:#}");
                Err(DeployError::Hook {
                    hook: point.to_string(),
                    message: format!("{e:#}"),
                })
            }
        }
    }

    pub fn pre_validate_env(&mut self, ctx: &mut DeployContext) -> DeployResult<()> {
        let Some(hooks) = self.hooks.as_mut() else {
            return Ok(());
        };
        let result = hooks.pre_validate_env(ctx);
        self.guard(HookPoint::PreValidateEnv, result)
    }

    pub fn post_validate_env(&mut self, ctx: &DeployContext) -> DeployResult<()> {
        let Some(hooks) = self.hooks.as_mut() else {
            return Ok(());
        };
        let result = hooks.post_validate_env(ctx);
        self.guard(HookPoint::PostValidateEnv, result)
    }

    pub fn build_deploy_plan(&mut self, ctx: &DeployContext, plan: &mut DeployPlan) -> DeployResult<()> {
        let Some(hooks) = self.hooks.as_mut() else {
            return Ok(());
        };
        let result = hooks.build_deploy_plan(ctx, plan);
        self.guard(HookPoint::BuildDeployPlan, result)
    }

    pub fn pre_render_yaml(&mut self, ctx: &DeployContext, plan: &mut DeployPlan) -> DeployResult<()> {
        let Some(hooks) = self.hooks.as_mut() else {
            return Ok(());
        };
        let result = hooks.pre_render_yaml(ctx, plan);
        self.guard(HookPoint::PreRenderYaml, result)
    }

    /// Returns the (possibly replaced) manifest text.
    pub fn post_render_yaml(
        &mut self,
        ctx: &DeployContext,
        plan: &DeployPlan,
        manifest: String,
    ) -> DeployResult<String> {
        let Some(hooks) = self.hooks.as_mut() else {
            return Ok(manifest);
        };
        let result = hooks.post_render_yaml(ctx, plan, &manifest);
        let replaced = self.guard(HookPoint::PostRenderYaml, result)?;
        Ok(replaced
            .filter(|text| !text.trim().is_empty())
            .unwrap_or(manifest))
    }

    pub fn pre_az_apply(
        &mut self,
        ctx: &DeployContext,
        plan: &DeployPlan,
        manifest_path: &Path,
    ) -> DeployResult<()> {
        let Some(hooks) = self.hooks.as_mut() else {
            return Ok(());
        };
        let result = hooks.pre_az_apply(ctx, plan, manifest_path);
        self.guard(HookPoint::PreAzApply, result)
    }

    pub fn post_deploy(
        &mut self,
        ctx: &DeployContext,
        plan: &DeployPlan,
        outcome: &DeployOutcome,
    ) -> DeployResult<()> {
        let Some(hooks) = self.hooks.as_mut() else {
            return Ok(());
        };
        let result = hooks.post_deploy(ctx, plan, outcome);
        self.guard(HookPoint::PostDeploy, result)
    }

    pub fn on_error(&mut self, ctx: &DeployContext, err: &DeployError) -> DeployResult<()> {
        let Some(hooks) = self.hooks.as_mut() else {
            return Ok(());
        };
        let result = hooks.on_error(ctx, err);
        self.guard(HookPoint::OnError, result)
    }
}

impl Default for HookRunner {
    fn default() -> Self {
        Self::none()
    }
}

/// Resolve and load hooks for a run.
///
/// Plugin resolution: `explicit` > `DEPLOY_HOOKS_MODULE` > the
/// conventional [`DEFAULT_HOOKS_PATH`] if it exists > no hooks.
/// Soft-fail resolution: `soft_fail_override` >
/// `DEPLOY_HOOKS_SOFT_FAIL=true` > off.
///
/// A plugin that was asked for (explicitly or through the
/// environment) must load. A conventional plugin that exists but
/// fails to load is an error too, unless soft-fail is on.
pub fn load_hooks(
    repo_root: &Path,
    explicit: Option<&Path>,
    soft_fail_override: Option<bool>,
    env: &EnvMap,
) -> DeployResult<HookRunner> {
    let soft_fail = soft_fail_override.unwrap_or_else(|| {
        crate::env::get(env, EnvKey::DeployHooksSoftFail)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    });

    let requested: Option<PathBuf> = explicit
        .map(Path::to_path_buf)
        .or_else(|| crate::env::get(env, EnvKey::DeployHooksModule).map(PathBuf::from));

    if let Some(path) = requested {
        let path = resolve_path(repo_root, &path);
        info!("loading hooks from {}", path.display());
        let hooks = ExecHooks::load(&path)?;
        return Ok(HookRunner::new(hooks, soft_fail));
    }

    let default_path = repo_root.join(DEFAULT_HOOKS_PATH);
    if !default_path.exists() {
        return Ok(HookRunner::from_boxed(None, soft_fail));
    }

    info!("loading hooks from {}", default_path.display());
    match ExecHooks::load(&default_path) {
        Ok(hooks) => Ok(HookRunner::new(hooks, soft_fail)),
        Err(e) if soft_fail => {
            warn!("{e} (soft-fail enabled)");
            Ok(HookRunner::from_boxed(None, soft_fail))
        }
        Err(e) => Err(e),
    }
}

fn resolve_path(repo_root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        repo_root.join(path)
    }
}
