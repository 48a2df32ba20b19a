pub mod aci;
pub mod portainer;

use std::path::Path;

use crate::error::DeployResult;
use crate::plan::{DeployContext, DeployOutcome, DeployPlan};

/// A deploy target: validates configuration, builds a plan,
/// renders it into a manifest and applies that manifest.
///
/// The pipeline calls these in order and runs the lifecycle
/// hooks between them.
pub trait Deployer {
    /// Short target name used in logs and outcomes.
    fn target(&self) -> &'static str;

    /// Validate configuration and merge the resolved values back
    /// into `ctx.env`.
    fn validate(&mut self, ctx: &mut DeployContext) -> DeployResult<()>;

    /// Derive the initial plan from the validated configuration.
    fn build_plan(&mut self, ctx: &DeployContext) -> DeployResult<DeployPlan>;

    /// Side effects needed before rendering: infrastructure,
    /// image build and push, credential lookups.
    fn prepare(&mut self, ctx: &DeployContext, plan: &mut DeployPlan) -> DeployResult<()>;

    /// Render the manifest. Must not have side effects, so it is
    /// also usable for dry runs.
    fn render(&mut self, ctx: &DeployContext, plan: &DeployPlan) -> DeployResult<String>;

    /// Apply the manifest written at `manifest_path`.
    fn apply(
        &mut self,
        ctx: &DeployContext,
        plan: &DeployPlan,
        manifest_path: &Path,
    ) -> DeployResult<DeployOutcome>;
}
