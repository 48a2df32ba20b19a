pub mod dotenv;
pub mod schema;
pub mod validate;

use indexmap::IndexMap;

use schema::{EnvKey, EnvKeySpec};

/// Insertion-ordered key/value configuration.
pub type EnvMap = IndexMap<String, String>;

/// Read a schema key from the process environment. Blank values
/// are treated as unset.
#[must_use]
pub fn process_value(key: EnvKey) -> Option<String> {
    std::env::var(key.as_str())
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Collect every key of `schema` that is set (non-blank) in the
/// process environment.
#[must_use]
pub fn process_overlay(schema: &[EnvKeySpec]) -> EnvMap {
    schema
        .iter()
        .filter_map(|spec| process_value(spec.key).map(|v| (spec.key.as_str().to_string(), v)))
        .collect()
}

/// Look up a key in a resolved map, treating blank as unset.
#[must_use]
pub fn get(kv: &EnvMap, key: EnvKey) -> Option<&str> {
    kv.get(key.as_str())
        .map(String::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
