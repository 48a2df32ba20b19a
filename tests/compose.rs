use serde_json::json;
use shieldlaunch::DeployPlan;
use shieldlaunch::compose::{
    apply_compose_to_plan, container_names, detect_services_by_role, normalize_command,
    prepare_stack_for_portainer, rewrite_paths_for_remote, service_environment,
};

fn sample() -> serde_json::Value {
    json!({
        "services": {
            "web": {
                "image": "ghcr.io/acme/web:2",
                "x-deploy-role": "app",
                "ports": [{"target": 8080, "published": "8081"}, "9000:9001"],
                "command": "exec ./serve --port 8080",
                "environment": {"MODE": "prod", "PASSTHROUGH": null}
            },
            "worker": {
                "image": "ghcr.io/acme/worker:2",
                "x-deploy-role": "sidecar"
            },
            "db": {
                "image": "postgres:16",
                "x-deploy-role": "database"
            },
            "untagged": {"image": "busybox"}
        }
    })
}

#[test]
fn roles_group_services() {
    let roles = detect_services_by_role(&sample());
    assert_eq!(roles["app"], vec!["web"]);
    assert_eq!(roles["sidecar"], vec!["worker"]);
    assert_eq!(roles["database"], vec!["db"]);
    assert_eq!(roles.len(), 3);
}

#[test]
fn app_and_sidecar_fold_into_plan() {
    let mut plan = DeployPlan::new("web", "westeurope", "ghcr.io/acme/old:1");
    apply_compose_to_plan(&sample(), &mut plan);

    assert_eq!(plan.app_image, "ghcr.io/acme/web:2");
    assert_eq!(plan.app_port, Some(8080));
    assert_eq!(plan.app_ports, vec![9001]);
    assert_eq!(
        plan.web_command,
        Some(vec!["sh".into(), "-lc".into(), "exec ./serve --port 8080".into()])
    );
    assert_eq!(plan.extra_env.get("MODE").map(String::as_str), Some("prod"));
    assert!(!plan.extra_env.contains_key("PASSTHROUGH"));
    assert_eq!(plan.compose_service_name, "web");
    assert_eq!(plan.other_image.as_deref(), Some("ghcr.io/acme/worker:2"));
}

#[test]
fn untagged_compose_leaves_plan_alone() {
    let compose = json!({"services": {"web": {"image": "nginx"}}});
    let mut plan = DeployPlan::new("web", "westeurope", "ghcr.io/acme/app:1");
    let before = plan.clone();
    apply_compose_to_plan(&compose, &mut plan);
    assert_eq!(plan, before);
}

#[test]
fn list_commands_are_kept() {
    let value = json!(["./serve", "--port", 8080]);
    assert_eq!(normalize_command(Some(&value)), vec!["./serve", "--port", "8080"]);
    assert!(normalize_command(Some(&json!("  "))).is_empty());
    assert!(normalize_command(None).is_empty());
}

#[test]
fn list_environment() {
    let service = json!({"environment": ["A=1", "B=x=y", "BARE"]});
    let env = service_environment(&service);
    assert_eq!(env.len(), 2);
    assert_eq!(env["B"], "x=y");
}

#[test]
fn paths_point_at_remote_dir() {
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().canonicalize().unwrap();
    let content = format!(
        "services:\n  app:\n    volumes:\n      - {}/docker/data:/data\n",
        local.display()
    );
    let rewritten = rewrite_paths_for_remote(&content, dir.path(), "/opt/protected-container");
    assert!(rewritten.contains("- /opt/protected-container/docker/data:/data"));
    assert!(!rewritten.contains(&local.display().to_string()));
}

#[test]
fn build_replaced_by_image_for_portainer() {
    let stack = "services:\n  app:\n    build:\n      context: .\n    container_name: app\n  proxy:\n    image: caddy:2-alpine\n";
    let out = prepare_stack_for_portainer(stack, "ghcr.io/acme/app:1").unwrap();
    let doc: serde_yaml::Value = serde_yaml::from_str(&out).unwrap();
    assert!(doc["services"]["app"].get("build").is_none());
    assert_eq!(doc["services"]["app"]["image"].as_str(), Some("ghcr.io/acme/app:1"));
    assert_eq!(doc["services"]["proxy"]["image"].as_str(), Some("caddy:2-alpine"));
}

#[test]
fn other_build_contexts_rejected() {
    let stack = "services:\n  app:\n    image: a\n  worker:\n    build: ./worker\n";
    let err = prepare_stack_for_portainer(stack, "ghcr.io/acme/app:1").unwrap_err();
    assert!(err.to_string().contains("worker"));

    let stack = "services:\n  app:\n    build: .\n";
    assert!(prepare_stack_for_portainer(stack, " ").is_err());
}

#[test]
fn stack_container_names() {
    let stack = "services:\n  app:\n    image: a\n    container_name: protected-app\n  proxy:\n    image: b\n";
    assert_eq!(container_names(stack).unwrap(), vec!["protected-app"]);
}
