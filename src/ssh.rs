use std::path::Path;

use tracing::info;

use crate::cmd;
use crate::error::{DeployError, DeployResult};

/// SSH session wrapper for running commands on, and syncing files
/// to, a remote host. `host` is anything `ssh` accepts: an alias
/// from `~/.ssh/config`, `host` or `user@host`.
pub struct SshSession {
    host: String,
}

impl SshSession {
    #[must_use]
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
        }
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Execute a command on the remote host and capture output.
    pub fn exec(&self, command: &str) -> DeployResult<String> {
        let args = self.build_ssh_args(command);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run("ssh", &refs).map_err(|e| self.explain(e))
    }

    /// Execute a command that reads `input` on stdin. Secrets go
    /// this way so they never appear on a command line.
    pub fn exec_with_stdin(&self, command: &str, input: &str) -> DeployResult<String> {
        let args = self.build_ssh_args(command);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run_with_stdin("ssh", &refs, input.as_bytes()).map_err(|e| self.explain(e))
    }

    /// Check the host answers before doing any real work.
    pub fn check_connectivity(&self) -> DeployResult<()> {
        info!("checking SSH connectivity to {}", self.host);
        let out = self.exec("echo SSH_OK")?;
        if out.contains("SSH_OK") {
            Ok(())
        } else {
            Err(DeployError::SshFailed(format!(
                "unexpected reply from {}: {out}",
                self.host
            )))
        }
    }

    /// Copy local paths into `remote_dir` with rsync.
    pub fn rsync_to(&self, sources: &[&Path], remote_dir: &str) -> DeployResult<()> {
        let mut args = vec!["-az".to_string(), "--mkpath".to_string()];
        args.extend(sources.iter().map(|p| p.to_string_lossy().into_owned()));
        args.push(format!("{}:{remote_dir}/", self.host));

        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run("rsync", &refs).map(drop).map_err(|e| self.explain(e))
    }

    fn explain(&self, err: DeployError) -> DeployError {
        match err {
            DeployError::ExternalTool {
                command, stderr, ..
            } => {
                let mut message = format!("{command} failed on {}", self.host);
                if !stderr.is_empty() {
                    message.push_str(&format!(": {stderr}"));
                }
                if let Some(hint) = failure_hint(&stderr) {
                    message.push_str(&format!(". {hint}"));
                }
                DeployError::SshFailed(message)
            }
            other => other,
        }
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Self::ssh_base_args();
        args.push(self.host.clone());
        args.push(command.to_string());
        args
    }

    fn ssh_base_args() -> Vec<String> {
        ["-o", "StrictHostKeyChecking=accept-new", "-o", "ConnectTimeout=10"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

/// Quote a word for a POSIX shell on the remote side.
#[must_use]
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

/// Map common ssh stderr to an actionable hint.
#[must_use]
pub fn failure_hint(stderr: &str) -> Option<&'static str> {
    let lowered = stderr.to_lowercase();
    if lowered.contains("no route to host") {
        Some("No route to host. Check VPN/LAN reachability and UBUNTU_SSH_HOST.")
    } else if lowered.contains("connection timed out") {
        Some("SSH timed out. Verify the server is online and port 22 is reachable.")
    } else if lowered.contains("connection refused") {
        Some("SSH connection refused. Confirm the SSH daemon is running and port 22 is open.")
    } else if lowered.contains("permission denied") {
        Some("SSH authentication failed. Verify key access for the configured user.")
    } else if lowered.contains("could not resolve hostname") {
        Some("Host resolution failed. Check UBUNTU_SSH_HOST for typos or DNS issues.")
    } else {
        None
    }
}
