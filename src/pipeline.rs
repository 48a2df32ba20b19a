use std::io::Write;

use tracing::{debug, error, info};

use crate::deploy::Deployer;
use crate::error::DeployResult;
use crate::hooks::HookRunner;
use crate::plan::{DeployContext, DeployOutcome, DeployPlan};

/// Runs one deployer through the lifecycle with hooks in between:
///
/// `pre_validate_env` > validate > `post_validate_env` > plan >
/// `build_deploy_plan` > prepare > `pre_render_yaml` > render >
/// `post_render_yaml` > write manifest > `pre_az_apply` > apply >
/// `post_deploy`.
///
/// Any failure calls `on_error` once and returns the original error.
pub struct DeployPipeline {
    hooks: HookRunner,
    deployer: Box<dyn Deployer>,
}

impl DeployPipeline {
    #[must_use]
    pub fn new(deployer: impl Deployer + 'static) -> Self {
        Self {
            hooks: HookRunner::none(),
            deployer: Box::new(deployer),
        }
    }

    #[must_use]
    pub fn hooks(mut self, hooks: HookRunner) -> Self {
        self.hooks = hooks;
        self
    }

    /// Full deploy.
    pub fn run(&mut self, ctx: &mut DeployContext) -> DeployResult<DeployOutcome> {
        let result = match self.stages(ctx, true) {
            Ok((plan, manifest)) => self.apply(ctx, &plan, &manifest),
            Err(e) => Err(e),
        };
        self.report(ctx, result)
    }

    /// Everything up to the rendered manifest, without `prepare`
    /// side effects. Used for dry runs.
    pub fn render_only(&mut self, ctx: &mut DeployContext) -> DeployResult<String> {
        let result = self.stages(ctx, false).map(|(_, manifest)| manifest);
        self.report(ctx, result)
    }

    fn report<T>(&mut self, ctx: &DeployContext, result: DeployResult<T>) -> DeployResult<T> {
        if let Err(err) = &result {
            error!("{} deploy failed: {err}", self.deployer.target());
            if let Err(hook_err) = self.hooks.on_error(ctx, err) {
                error!("{hook_err}");
            }
        }
        result
    }

    fn stages(&mut self, ctx: &mut DeployContext, prepare: bool) -> DeployResult<(DeployPlan, String)> {
        self.hooks.pre_validate_env(ctx)?;
        self.deployer.validate(ctx)?;
        self.hooks.post_validate_env(ctx)?;

        let mut plan = self.deployer.build_plan(ctx)?;
        self.hooks.build_deploy_plan(ctx, &mut plan)?;
        debug!("plan: {plan:?}");

        if prepare {
            self.deployer.prepare(ctx, &mut plan)?;
        }

        self.hooks.pre_render_yaml(ctx, &mut plan)?;
        let rendered = self.deployer.render(ctx, &plan)?;
        let manifest = self.hooks.post_render_yaml(ctx, &plan, rendered)?;
        Ok((plan, manifest))
    }

    fn apply(&mut self, ctx: &DeployContext, plan: &DeployPlan, manifest: &str) -> DeployResult<DeployOutcome> {
        let mut file = tempfile::Builder::new()
            .prefix("deploy-")
            .suffix(".yaml")
            .tempfile()?;
        file.write_all(manifest.as_bytes())?;
        file.flush()?;
        debug!("manifest written to {}", file.path().display());

        self.hooks.pre_az_apply(ctx, plan, file.path())?;
        info!("applying {} deploy for {}", self.deployer.target(), plan.name);
        let outcome = self.deployer.apply(ctx, plan, file.path())?;
        self.hooks.post_deploy(ctx, plan, &outcome)?;
        Ok(outcome)
    }
}
