use tracing::info;

use crate::error::{DeployError, DeployResult};

/// bcrypt work factor used unless the caller picks another one.
pub const DEFAULT_COST: u32 = 14;

const BCRYPT_PREFIXES: [&str; 3] = ["$2a$", "$2b$", "$2y$"];
const BCRYPT_LEN: usize = 60;

#[must_use]
pub fn looks_like_bcrypt(value: &str) -> bool {
    let value = value.trim();
    value.len() == BCRYPT_LEN && BCRYPT_PREFIXES.iter().any(|p| value.starts_with(p))
}

/// Undo compose escaping (`$$` back to `$`).
#[must_use]
pub fn unescape_compose(value: &str) -> String {
    value.trim().replace("$$", "$")
}

/// Escape `$` for inclusion in a compose file.
#[must_use]
pub fn compose_escape(hash: &str) -> String {
    hash.replace('$', "$$")
}

/// Hash a password with bcrypt at `cost` (4-31). Caddy's
/// `basic_auth` accepts the result as is.
pub fn hash_password(password: &str, cost: u32) -> DeployResult<String> {
    let password = password.trim();
    if password.is_empty() {
        return Err(DeployError::Other("password must be non-empty".into()));
    }
    info!("hashing Basic Auth password (bcrypt cost {cost})");
    bcrypt::hash(password, cost).map_err(|e| DeployError::Other(format!("bcrypt failed: {e}")))
}

/// Use `value` as the hash when it already is one, otherwise
/// treat it as a password and hash it.
pub fn resolve_hash(value: &str) -> DeployResult<String> {
    let value = unescape_compose(value);
    if looks_like_bcrypt(&value) {
        Ok(value)
    } else {
        hash_password(&value, DEFAULT_COST)
    }
}
