use std::fs;
use std::path::Path;

use indexmap::IndexMap;

use super::EnvMap;
use crate::error::DeployResult;

const GENERATED_HEADER: &str = "# Generated/updated by shieldlaunch";

/// Parse `KEY=value` lines into a map.
///
/// Comment lines (`#`), blank lines and lines without `=` are
/// ignored. Keys and values are trimmed, empty values are kept,
/// and the last occurrence of a duplicate key wins.
#[must_use]
pub fn parse_dotenv(content: &str) -> EnvMap {
    let mut kv = EnvMap::new();
    for line in content.lines() {
        if let Some((key, value)) = split_assignment(line) {
            kv.insert(key.to_string(), value.trim().to_string());
        }
    }
    kv
}

/// Read and parse a dotenv file. A missing file yields an empty
/// map; callers decide whether absence matters.
pub fn load_dotenv_file(path: &Path) -> DeployResult<EnvMap> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_dotenv(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(EnvMap::new()),
        Err(e) => Err(e.into()),
    }
}

/// Patch `updates` into a dotenv file in place.
///
/// Untouched lines are copied verbatim. The first `KEY=` line for
/// each updated key is replaced; keys not found are appended in
/// key order after a blank separator. Blank update values are
/// skipped. A missing file is created (with a header) only when
/// `create` is set.
pub fn write_dotenv_values(
    path: &Path,
    updates: &IndexMap<String, String>,
    create: bool,
) -> DeployResult<()> {
    let mut remaining: IndexMap<&str, &str> = updates
        .iter()
        .filter(|(_, v)| !v.trim().is_empty())
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    if remaining.is_empty() {
        return Ok(());
    }

    let existing = if path.exists() {
        fs::read_to_string(path)?
    } else if create {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        format!("{GENERATED_HEADER}\n")
    } else {
        return Ok(());
    };

    let patched = patch_dotenv(&existing, &mut remaining);
    fs::write(path, patched)?;
    Ok(())
}

fn patch_dotenv(existing: &str, remaining: &mut IndexMap<&str, &str>) -> String {
    let newline = if existing.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out = String::with_capacity(existing.len());
    let mut last_blank = true;
    for raw in existing.split_inclusive('\n') {
        let body = raw.trim_end_matches(['\r', '\n']);
        let ending = &raw[body.len()..];
        match split_assignment(body).and_then(|(key, _)| remaining.shift_remove_entry(key)) {
            Some((key, value)) => {
                out.push_str(&format!("{key}={value}"));
                out.push_str(if ending.is_empty() { newline } else { ending });
            }
            None => {
                out.push_str(raw);
                if ending.is_empty() {
                    out.push_str(newline);
                }
            }
        }
        last_blank = body.trim().is_empty();
    }

    if !remaining.is_empty() {
        if !last_blank {
            out.push_str(newline);
        }
        remaining.sort_keys();
        for (key, value) in remaining.iter() {
            out.push_str(&format!("{key}={value}{newline}"));
        }
    }
    out
}

/// Split an assignment line into `(key, raw_value)`. Returns
/// `None` for comments, blanks and lines without `=`.
fn split_assignment(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}
