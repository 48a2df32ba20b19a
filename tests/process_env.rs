use std::fs;
use std::path::{Path, PathBuf};

fn rust_sources(dir: &Path, out: &mut Vec<PathBuf>) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            rust_sources(&path, out);
        } else if path.extension().is_some_and(|e| e == "rs") {
            out.push(path);
        }
    }
}

fn code_lines(source: &str) -> impl Iterator<Item = &str> {
    source
        .lines()
        .map(str::trim_start)
        .filter(|l| !l.starts_with("//"))
}

#[test]
fn process_environment_read_in_one_place() {
    let src = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
    let allowed = src.join("env").join("mod.rs");
    let mut files = Vec::new();
    rust_sources(&src, &mut files);
    assert!(files.contains(&allowed));

    let offenders: Vec<String> = files
        .iter()
        .filter(|path| **path != allowed)
        .filter(|path| {
            let source = fs::read_to_string(path).unwrap();
            code_lines(&source).any(|l| l.contains("std::env::var") || l.contains("env::vars("))
        })
        .map(|path| path.display().to_string())
        .collect();
    assert!(offenders.is_empty(), "process env read outside env/mod.rs: {offenders:?}");
}
