use std::path::Path;

use super::EnvMap;
use super::dotenv::load_dotenv_file;
use super::schema::{DEPLOY_SCHEMA, EnvKey, EnvKeySpec, EnvTarget, RUNTIME_SCHEMA, filter_by_targets};
use crate::error::{DeployError, DeployResult, ValidationError};

const TRUTHY: [&str; 5] = ["1", "true", "yes", "y", "on"];
const FALSY: [&str; 5] = ["0", "false", "no", "n", "off"];

/// Case-insensitive truthiness used for stored flags such as
/// `GHCR_PRIVATE`. Blank and unknown values are false.
#[must_use]
pub fn truthy(value: Option<&str>) -> bool {
    value.is_some_and(|v| TRUTHY.contains(&v.trim().to_lowercase().as_str()))
}

/// Tri-state flag parsing: recognized true/false spellings win,
/// anything else (including blank) falls back to `default`.
#[must_use]
pub fn parse_boolish(value: Option<&str>, default: bool) -> bool {
    let normalized = value.unwrap_or_default().trim().to_lowercase();
    if TRUTHY.contains(&normalized.as_str()) {
        true
    } else if FALSY.contains(&normalized.as_str()) {
        false
    } else {
        default
    }
}

fn is_blank(kv: &EnvMap, key: &str) -> bool {
    kv.get(key).is_none_or(|v| v.trim().is_empty())
}

/// Reject every key that has no spec in `schema`, listing all of
/// them at once.
pub fn validate_known_keys(
    schema: &[EnvKeySpec],
    kv: &EnvMap,
    context: &str,
) -> Result<(), ValidationError> {
    let mut unknown: Vec<&str> = kv
        .keys()
        .map(String::as_str)
        .filter(|k| !schema.iter().any(|spec| spec.key.as_str() == *k))
        .collect();
    if unknown.is_empty() {
        return Ok(());
    }
    unknown.sort_unstable();
    Err(ValidationError::new(
        context,
        vec![format!("Unknown key(s): {}", unknown.join(", "))],
    ))
}

/// Fill absent or blank keys from their schema default. Present
/// non-blank values are never overwritten.
#[must_use]
pub fn apply_defaults(schema: &[EnvKeySpec], kv: &EnvMap) -> EnvMap {
    let mut out = kv.clone();
    for spec in schema {
        let Some(default) = spec.default else {
            continue;
        };
        if is_blank(&out, spec.key.as_str()) {
            out.insert(spec.key.as_str().to_string(), default.to_string());
        }
    }
    out
}

pub fn validate_required(
    schema: &[EnvKeySpec],
    kv: &EnvMap,
    context: &str,
) -> Result<(), ValidationError> {
    let mut missing: Vec<&str> = schema
        .iter()
        .filter(|spec| spec.mandatory && is_blank(kv, spec.key.as_str()))
        .map(|spec| spec.key.as_str())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    missing.sort_unstable();
    Err(ValidationError::new(
        context,
        vec![format!("Missing mandatory key(s): {}", missing.join(", "))],
    ))
}

/// Rules spanning several keys. All violations are reported
/// together.
pub fn validate_cross_field_rules(kv: &EnvMap, context: &str) -> Result<(), ValidationError> {
    let mut problems = Vec::new();

    if truthy(kv.get(EnvKey::GhcrPrivate.as_str()).map(String::as_str)) {
        for key in [EnvKey::GhcrUsername, EnvKey::GhcrToken] {
            if is_blank(kv, key.as_str()) {
                problems.push(format!("{key} is required when {}=true", EnvKey::GhcrPrivate));
            }
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::new(context, problems))
    }
}

/// Validate a runtime map (already parsed) and return it with
/// defaults applied.
pub fn resolve_runtime(kv: &EnvMap, context: &str) -> Result<EnvMap, ValidationError> {
    validate_known_keys(RUNTIME_SCHEMA, kv, context)?;
    let resolved = apply_defaults(RUNTIME_SCHEMA, kv);
    validate_required(RUNTIME_SCHEMA, &resolved, context)?;
    Ok(resolved)
}

/// Validate deploy settings: the file map is known-key checked,
/// then `overlay` (schema keys taken from the process environment)
/// is laid on top, defaults are applied, the DNS label is derived
/// and the required/cross-field checks run.
///
/// Only specs that belong in the deploy file are required here;
/// CI-only secrets are checked when syncing to CI.
pub fn resolve_deploy(
    file_kv: &EnvMap,
    overlay: &EnvMap,
    context: &str,
) -> Result<EnvMap, ValidationError> {
    validate_known_keys(DEPLOY_SCHEMA, file_kv, context)?;

    let mut merged = file_kv.clone();
    for (key, value) in overlay {
        if !value.trim().is_empty() {
            merged.insert(key.clone(), value.clone());
        }
    }
    let mut merged = apply_defaults(DEPLOY_SCHEMA, &merged);

    if is_blank(&merged, EnvKey::AzureDnsLabel.as_str()) {
        let name = merged
            .get(EnvKey::AzureContainerName.as_str())
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        merged.insert(EnvKey::AzureDnsLabel.as_str().to_string(), name);
    }

    let file_specs = filter_by_targets(DEPLOY_SCHEMA, &[EnvTarget::DotenvDeploy]);
    validate_required(&file_specs, &merged, context)?;
    validate_cross_field_rules(&merged, context)?;
    Ok(merged)
}

/// Load and validate a runtime file. `None` validates an empty
/// map (defaults only); a named file that is missing is an error.
pub fn validate_runtime_file(path: Option<&Path>) -> DeployResult<EnvMap> {
    let kv = match path {
        Some(p) if !p.exists() => {
            return Err(DeployError::FileNotFound(format!(
                "missing runtime env file: {}",
                p.display()
            )));
        }
        Some(p) => load_dotenv_file(p)?,
        None => EnvMap::new(),
    };
    Ok(resolve_runtime(&kv, &context_for("runtime", path))?)
}

/// Load and validate a deploy file with an environment overlay.
/// A missing deploy file is allowed: CI may supply everything
/// through the environment.
pub fn validate_deploy_file(path: Option<&Path>, overlay: &EnvMap) -> DeployResult<EnvMap> {
    let kv = match path {
        Some(p) => load_dotenv_file(p)?,
        None => EnvMap::new(),
    };
    let context = format!("{} + env", context_for("deploy", path));
    Ok(resolve_deploy(&kv, overlay, &context)?)
}

fn context_for(label: &str, path: Option<&Path>) -> String {
    match path.and_then(Path::file_name) {
        Some(name) => format!("{label} ({})", name.to_string_lossy()),
        None => label.to_string(),
    }
}
