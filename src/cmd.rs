use std::path::Path;
use std::process::{Command, Output, Stdio};

use tracing::{debug, warn};

use crate::error::{DeployError, DeployResult};

/// Run a command and capture its output. Fails if the command
/// returns a non-zero exit code; stderr travels with the error.
pub fn run(program: &str, args: &[&str]) -> DeployResult<String> {
    debug!("{}", format_command(program, args));
    let output = spawn(program, args, None, None)?;
    finish(program, args, &output)
}

/// Like [`run`], with `dir` as the working directory.
pub fn run_in(dir: &Path, program: &str, args: &[&str]) -> DeployResult<String> {
    debug!("{} (in {})", format_command(program, args), dir.display());
    let output = spawn(program, args, None, Some(dir))?;
    finish(program, args, &output)
}

/// Like [`run`], but the logged and reported command line has
/// the listed argument values replaced with `***`.
pub fn run_redacted(program: &str, args: &[&str], secrets: &[&str]) -> DeployResult<String> {
    let shown = redact(args, secrets);
    let shown_refs: Vec<&str> = shown.iter().map(String::as_str).collect();
    debug!("{}", format_command(program, &shown_refs));
    let output = spawn(program, args, None, None)?;
    finish(program, &shown_refs, &output)
}

/// Run a command, returning `None` instead of failing when it
/// exits non-zero. Used for exploratory lookups.
pub fn run_optional(program: &str, args: &[&str]) -> DeployResult<Option<String>> {
    debug!("{}", format_command(program, args));
    let output = spawn(program, args, None, None)?;
    if output.status.success() {
        Ok(Some(stdout_of(&output)))
    } else {
        Ok(None)
    }
}

/// Run a command with stdin/stdout/stderr inherited (interactive).
pub fn run_interactive(program: &str, args: &[&str]) -> DeployResult<()> {
    debug!("{}", format_command(program, args));
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| not_found_or_io(program, e))?;

    if status.success() {
        Ok(())
    } else {
        Err(DeployError::ExternalTool {
            command: format_command(program, args),
            status,
            stderr: String::new(),
        })
    }
}

/// Run a command that pipes its stdin from a byte slice.
pub fn run_with_stdin(program: &str, args: &[&str], stdin_data: &[u8]) -> DeployResult<String> {
    debug!("{} (stdin: {} bytes)", format_command(program, args), stdin_data.len());
    let output = spawn(program, args, Some(stdin_data), None)?;
    finish(program, args, &output)
}

/// Check if a command exists on PATH.
#[must_use]
pub fn command_exists(program: &str) -> bool {
    Command::new("which")
        .arg(program)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn spawn(
    program: &str,
    args: &[&str],
    stdin_data: Option<&[u8]>,
    dir: Option<&Path>,
) -> DeployResult<Output> {
    use std::io::Write;

    let mut command = Command::new(program);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }
    let mut child = command
        .args(args)
        .stdin(if stdin_data.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| not_found_or_io(program, e))?;

    let stdin = child.stdin.take();
    // stdin is written while stdout and stderr are drained.
    std::thread::scope(|scope| -> DeployResult<Output> {
        let writer = match (stdin_data, stdin) {
            (Some(data), Some(mut stdin)) => Some(scope.spawn(move || stdin.write_all(data))),
            _ => None,
        };
        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            match writer.join() {
                Ok(Err(e)) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e.into()),
                Err(_) => return Err(DeployError::Other(format!("stdin writer for {program} panicked"))),
                Ok(_) => {}
            }
        }
        Ok(output)
    })
}

fn finish(program: &str, args: &[&str], output: &Output) -> DeployResult<String> {
    if output.status.success() {
        return Ok(stdout_of(output));
    }

    let mut stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        stderr = stdout_of(output);
    }
    let command = format_command(program, args);
    warn!("{command} exited with {}", output.status);
    if !stderr.is_empty() {
        warn!("stderr: {stderr}");
    }
    Err(DeployError::ExternalTool {
        command,
        status: output.status,
        stderr,
    })
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

fn not_found_or_io(program: &str, e: std::io::Error) -> DeployError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DeployError::CommandNotFound(program.to_string())
    } else {
        DeployError::Io(e)
    }
}

fn redact(args: &[&str], secrets: &[&str]) -> Vec<String> {
    args.iter()
        .map(|a| {
            if !a.is_empty() && secrets.contains(a) {
                "***".to_string()
            } else {
                (*a).to_string()
            }
        })
        .collect()
}

pub(crate) fn format_command(program: &str, args: &[&str]) -> String {
    let mut parts = vec![program.to_string()];
    parts.extend(args.iter().map(|a| (*a).to_string()));
    parts.join(" ")
}
