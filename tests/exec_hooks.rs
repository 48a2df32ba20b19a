#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use shieldlaunch::hooks::{DEFAULT_HOOKS_PATH, ExecHooks, HookPoint, load_hooks};
use shieldlaunch::{DeployContext, DeployError, DeployPlan, EnvMap};

// Writing and executing scripts concurrently can fail with ETXTBSY.
static SERIAL: Mutex<()> = Mutex::new(());

const PLUGIN: &str = r#"#!/bin/sh
dir=$(dirname "$0")
case "$1" in
  hooks)
    printf '%s\n' '["pre_validate_env", "build_deploy_plan", "post_render_yaml", "pre_az_apply"]'
    ;;
  pre_validate_env)
    cat > /dev/null
    printf '%s\n' '{"env": {"PUBLIC_DOMAIN": "hooked.example.com", "EXTRA": "1"}}'
    ;;
  build_deploy_plan)
    cat > "$dir/request.json"
    ;;
  post_render_yaml)
    cat > /dev/null
    printf '%s\n' '{"manifest": "replaced: true\n"}'
    ;;
  pre_az_apply)
    cat > /dev/null
    echo "refusing" >&2
    exit 3
    ;;
  *)
    cat > /dev/null
    ;;
esac
"#;

fn write_script(path: &Path, body: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

fn plugin_in(dir: &Path) -> PathBuf {
    let path = dir.join("hooks.sh");
    write_script(&path, PLUGIN);
    path
}

fn ctx(root: &Path) -> DeployContext {
    let mut env = EnvMap::new();
    env.insert("PUBLIC_DOMAIN".into(), "app.example.com".into());
    DeployContext::new(root, env)
}

#[test]
fn capabilities_come_from_the_plugin() {
    let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    let hooks = ExecHooks::load(&plugin_in(dir.path())).unwrap();
    assert!(hooks.implements(HookPoint::PreValidateEnv));
    assert!(!hooks.implements(HookPoint::PostDeploy));
    assert!(!hooks.implements(HookPoint::OnError));
}

#[test]
fn env_and_manifest_replaced_by_plugin() {
    let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    let plugin = plugin_in(dir.path());
    let mut runner = load_hooks(dir.path(), Some(&plugin), None, &EnvMap::new()).unwrap();
    assert!(runner.is_active());

    let mut ctx = ctx(dir.path());
    runner.pre_validate_env(&mut ctx).unwrap();
    assert_eq!(ctx.env["PUBLIC_DOMAIN"], "hooked.example.com");
    assert_eq!(ctx.env["EXTRA"], "1");

    let plan = DeployPlan::new("web", "westeurope", "img:1");
    let manifest = runner
        .post_render_yaml(&ctx, &plan, "original: true\n".into())
        .unwrap();
    assert_eq!(manifest, "replaced: true\n");
}

#[test]
fn plugin_receives_json_request() {
    let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    let plugin = plugin_in(dir.path());
    let mut runner = load_hooks(dir.path(), Some(&plugin), None, &EnvMap::new()).unwrap();

    let ctx = ctx(dir.path());
    let mut plan = DeployPlan::new("web", "westeurope", "img:1");
    runner.build_deploy_plan(&ctx, &mut plan).unwrap();
    assert_eq!(plan.app_image, "img:1");

    let request: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("request.json")).unwrap()).unwrap();
    assert_eq!(request["hook"], "build_deploy_plan");
    assert_eq!(request["plan"]["name"], "web");
    assert_eq!(request["context"]["env"]["PUBLIC_DOMAIN"], "app.example.com");
}

#[test]
fn failing_hook_is_an_error_unless_soft() {
    let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    let plugin = plugin_in(dir.path());
    let ctx = ctx(dir.path());
    let plan = DeployPlan::new("web", "westeurope", "img:1");
    let manifest = dir.path().join("m.yaml");

    let mut strict = load_hooks(dir.path(), Some(&plugin), Some(false), &EnvMap::new()).unwrap();
    let err = strict.pre_az_apply(&ctx, &plan, &manifest).unwrap_err();
    assert!(matches!(&err, DeployError::Hook { hook, .. } if hook == "pre_az_apply"));

    let mut soft = load_hooks(dir.path(), Some(&plugin), Some(true), &EnvMap::new()).unwrap();
    assert!(soft.soft_fail());
    soft.pre_az_apply(&ctx, &plan, &manifest).unwrap();
}

#[test]
fn conventional_location_is_discovered() {
    let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    assert!(!load_hooks(dir.path(), None, None, &EnvMap::new()).unwrap().is_active());

    write_script(&dir.path().join(DEFAULT_HOOKS_PATH), PLUGIN);
    assert!(load_hooks(dir.path(), None, None, &EnvMap::new()).unwrap().is_active());
}

#[test]
fn module_and_soft_fail_from_env() {
    let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    plugin_in(dir.path());
    let mut env = EnvMap::new();
    env.insert("DEPLOY_HOOKS_MODULE".into(), "hooks.sh".into());
    env.insert("DEPLOY_HOOKS_SOFT_FAIL".into(), "true".into());

    let runner = load_hooks(dir.path(), None, None, &env).unwrap();
    assert!(runner.is_active());
    assert!(runner.soft_fail());
}

#[test]
fn broken_conventional_plugin() {
    let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    write_script(&dir.path().join(DEFAULT_HOOKS_PATH), "#!/bin/sh\nexit 1\n");

    let err = load_hooks(dir.path(), None, None, &EnvMap::new()).unwrap_err();
    assert!(matches!(err, DeployError::HookLoad { .. }));

    let runner = load_hooks(dir.path(), None, Some(true), &EnvMap::new()).unwrap();
    assert!(!runner.is_active());
}

#[test]
fn requested_plugin_must_exist() {
    let _guard = SERIAL.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let dir = tempfile::tempdir().unwrap();
    let err = load_hooks(dir.path(), Some(Path::new("missing.sh")), Some(true), &EnvMap::new())
        .unwrap_err();
    assert!(matches!(err, DeployError::HookLoad { .. }));
}
