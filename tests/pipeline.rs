use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;

use shieldlaunch::deploy::Deployer;
use shieldlaunch::{
    DeployContext, DeployError, DeployHooks, DeployOutcome, DeployPipeline, DeployPlan, DeployResult,
    EnvMap, HookRunner,
};

type Log = Rc<RefCell<Vec<String>>>;

fn log_of(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

/// Records every call and optionally fails at one step.
struct FakeDeployer {
    log: Log,
    fail_at: Option<&'static str>,
}

impl FakeDeployer {
    fn step(&self, name: &'static str) -> DeployResult<()> {
        self.log.borrow_mut().push(format!("deployer:{name}"));
        if self.fail_at == Some(name) {
            return Err(DeployError::Other(format!("{name} failed")));
        }
        Ok(())
    }
}

impl Deployer for FakeDeployer {
    fn target(&self) -> &'static str {
        "fake"
    }

    fn validate(&mut self, ctx: &mut DeployContext) -> DeployResult<()> {
        self.step("validate")?;
        ctx.env.insert("VALIDATED".into(), "1".into());
        Ok(())
    }

    fn build_plan(&mut self, _ctx: &DeployContext) -> DeployResult<DeployPlan> {
        self.step("build_plan")?;
        Ok(DeployPlan::new("web", "westeurope", "img:1"))
    }

    fn prepare(&mut self, _ctx: &DeployContext, _plan: &mut DeployPlan) -> DeployResult<()> {
        self.step("prepare")
    }

    fn render(&mut self, _ctx: &DeployContext, plan: &DeployPlan) -> DeployResult<String> {
        self.step("render")?;
        Ok(format!("image: {}\n", plan.app_image))
    }

    fn apply(
        &mut self,
        _ctx: &DeployContext,
        plan: &DeployPlan,
        manifest_path: &Path,
    ) -> DeployResult<DeployOutcome> {
        self.step("apply")?;
        let manifest = std::fs::read_to_string(manifest_path)?;
        Ok(DeployOutcome {
            target: "fake".into(),
            url: Some(format!("https://{}/", plan.name)),
            details: vec![manifest],
        })
    }
}

struct Recorder {
    log: Log,
    fail_at: Option<&'static str>,
    replace_manifest: Option<String>,
}

impl Recorder {
    fn hit(&self, name: &'static str) -> anyhow::Result<()> {
        self.log.borrow_mut().push(format!("hook:{name}"));
        if self.fail_at == Some(name) {
            anyhow::bail!("{name} exploded");
        }
        Ok(())
    }
}

impl DeployHooks for Recorder {
    fn pre_validate_env(&mut self, ctx: &mut DeployContext) -> anyhow::Result<()> {
        self.hit("pre_validate_env")?;
        ctx.env.insert("FROM_HOOK".into(), "yes".into());
        Ok(())
    }

    fn post_validate_env(&mut self, ctx: &DeployContext) -> anyhow::Result<()> {
        assert_eq!(ctx.env.get("FROM_HOOK").map(String::as_str), Some("yes"));
        assert_eq!(ctx.env.get("VALIDATED").map(String::as_str), Some("1"));
        self.hit("post_validate_env")
    }

    fn build_deploy_plan(&mut self, _ctx: &DeployContext, plan: &mut DeployPlan) -> anyhow::Result<()> {
        self.hit("build_deploy_plan")?;
        plan.app_image = "img:hooked".into();
        Ok(())
    }

    fn pre_render_yaml(&mut self, _ctx: &DeployContext, _plan: &mut DeployPlan) -> anyhow::Result<()> {
        self.hit("pre_render_yaml")
    }

    fn post_render_yaml(
        &mut self,
        _ctx: &DeployContext,
        _plan: &DeployPlan,
        _manifest: &str,
    ) -> anyhow::Result<Option<String>> {
        self.hit("post_render_yaml")?;
        Ok(self.replace_manifest.clone())
    }

    fn pre_az_apply(
        &mut self,
        _ctx: &DeployContext,
        _plan: &DeployPlan,
        manifest_path: &Path,
    ) -> anyhow::Result<()> {
        assert!(manifest_path.is_file());
        self.hit("pre_az_apply")
    }

    fn post_deploy(
        &mut self,
        _ctx: &DeployContext,
        _plan: &DeployPlan,
        _outcome: &DeployOutcome,
    ) -> anyhow::Result<()> {
        self.hit("post_deploy")
    }

    fn on_error(&mut self, _ctx: &DeployContext, error: &DeployError) -> anyhow::Result<()> {
        self.log.borrow_mut().push(format!("hook:on_error:{error}"));
        Ok(())
    }
}

fn pipeline(
    deployer_fails: Option<&'static str>,
    hook_fails: Option<&'static str>,
    soft_fail: bool,
) -> (DeployPipeline, Log) {
    let log: Log = Rc::default();
    let deployer = FakeDeployer {
        log: Rc::clone(&log),
        fail_at: deployer_fails,
    };
    let hooks = Recorder {
        log: Rc::clone(&log),
        fail_at: hook_fails,
        replace_manifest: None,
    };
    let pipeline = DeployPipeline::new(deployer).hooks(HookRunner::new(hooks, soft_fail));
    (pipeline, log)
}

fn ctx() -> DeployContext {
    DeployContext::new(Path::new("/repo"), EnvMap::new())
}

#[test]
fn hooks_fire_in_lifecycle_order() {
    let (mut pipeline, log) = pipeline(None, None, false);
    let outcome = pipeline.run(&mut ctx()).unwrap();

    let hooks: Vec<_> = log_of(&log)
        .into_iter()
        .filter_map(|e| e.strip_prefix("hook:").map(str::to_string))
        .collect();
    assert_eq!(
        hooks,
        vec![
            "pre_validate_env",
            "post_validate_env",
            "build_deploy_plan",
            "pre_render_yaml",
            "post_render_yaml",
            "pre_az_apply",
            "post_deploy",
        ]
    );
    assert_eq!(outcome.details, vec!["image: img:hooked\n"]);
}

#[test]
fn deployer_steps_interleave_with_hooks() {
    let (mut pipeline, log) = pipeline(None, None, false);
    pipeline.run(&mut ctx()).unwrap();
    assert_eq!(
        log_of(&log),
        vec![
            "hook:pre_validate_env",
            "deployer:validate",
            "hook:post_validate_env",
            "deployer:build_plan",
            "hook:build_deploy_plan",
            "deployer:prepare",
            "hook:pre_render_yaml",
            "deployer:render",
            "hook:post_render_yaml",
            "hook:pre_az_apply",
            "deployer:apply",
            "hook:post_deploy",
        ]
    );
}

#[test]
fn render_only_skips_side_effects() {
    let (mut pipeline, log) = pipeline(None, None, false);
    let manifest = pipeline.render_only(&mut ctx()).unwrap();
    assert_eq!(manifest, "image: img:hooked\n");
    let log = log_of(&log);
    assert!(!log.contains(&"deployer:prepare".to_string()));
    assert!(!log.contains(&"deployer:apply".to_string()));
    assert_eq!(log.last().map(String::as_str), Some("hook:post_render_yaml"));
}

#[test]
fn step_failure_fires_on_error_once() {
    let (mut pipeline, log) = pipeline(Some("prepare"), None, true);
    let err = pipeline.run(&mut ctx()).unwrap_err();
    assert_eq!(err.to_string(), "prepare failed");

    let log = log_of(&log);
    assert_eq!(log.last().map(String::as_str), Some("hook:on_error:prepare failed"));
    assert_eq!(log.iter().filter(|e| e.starts_with("hook:on_error")).count(), 1);
    assert!(!log.contains(&"hook:pre_render_yaml".to_string()));
}

#[test]
fn hook_failure_aborts_without_soft_fail() {
    let (mut pipeline, log) = pipeline(None, Some("build_deploy_plan"), false);
    let err = pipeline.run(&mut ctx()).unwrap_err();
    assert!(matches!(&err, DeployError::Hook { hook, .. } if hook == "build_deploy_plan"));
    assert!(!log_of(&log).contains(&"deployer:prepare".to_string()));
}

#[test]
fn soft_fail_keeps_going() {
    let (mut pipeline, log) = pipeline(None, Some("pre_az_apply"), true);
    pipeline.run(&mut ctx()).unwrap();
    let log = log_of(&log);
    assert!(log.contains(&"deployer:apply".to_string()));
    assert!(!log.iter().any(|e| e.starts_with("hook:on_error")));
}

#[test]
fn post_render_replacement_reaches_apply() {
    let log: Log = Rc::default();
    let hooks = Recorder {
        log: Rc::clone(&log),
        fail_at: None,
        replace_manifest: Some("replaced: true\n".into()),
    };
    let deployer = FakeDeployer {
        log: Rc::clone(&log),
        fail_at: None,
    };
    let mut pipeline = DeployPipeline::new(deployer).hooks(HookRunner::new(hooks, false));
    let outcome = pipeline.run(&mut ctx()).unwrap();
    assert_eq!(outcome.details, vec!["replaced: true\n"]);
}

#[test]
fn blank_replacement_keeps_original() {
    let log: Log = Rc::default();
    let hooks = Recorder {
        log: Rc::clone(&log),
        fail_at: None,
        replace_manifest: Some("  \n".into()),
    };
    let deployer = FakeDeployer {
        log: Rc::clone(&log),
        fail_at: None,
    };
    let mut pipeline = DeployPipeline::new(deployer).hooks(HookRunner::new(hooks, false));
    assert_eq!(pipeline.render_only(&mut ctx()).unwrap(), "image: img:hooked\n");
}

#[test]
fn no_hooks_runs_deployer_only() {
    let log: Log = Rc::default();
    let deployer = FakeDeployer {
        log: Rc::clone(&log),
        fail_at: None,
    };
    let outcome = DeployPipeline::new(deployer).run(&mut ctx()).unwrap();
    assert_eq!(outcome.url.as_deref(), Some("https://web/"));
    assert!(log_of(&log).iter().all(|e| e.starts_with("deployer:")));
}
