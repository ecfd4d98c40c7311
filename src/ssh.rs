use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cmd;
use crate::error::{DeployError, DeployResult};

/// Where and as whom to run remote commands. Recomputed from the host
/// address and the key file whenever needed; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub host: String,
    pub user: String,
    pub key: Option<PathBuf>,
}

impl Connection {
    #[must_use]
    pub fn new(host: &str, user: &str) -> Self {
        Self {
            host: host.to_string(),
            user: user.to_string(),
            key: None,
        }
    }

    #[must_use]
    pub fn with_key(mut self, key_path: &Path) -> Self {
        self.key = Some(key_path.to_path_buf());
        self
    }

    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by `ssh` and `scp`.
    ///
    /// Host keys are not pinned: the host is created by the same run
    /// and its key cannot be known in advance.
    #[must_use]
    pub fn ssh_options(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(key) = &self.key {
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        args
    }

    /// `ssh ... user@host` as a single shell-safe string, for use
    /// inside local pipelines.
    #[must_use]
    pub fn ssh_command_line(&self) -> String {
        let mut parts = vec!["ssh".to_string()];
        parts.extend(self.ssh_options().iter().map(|a| shell_quote(a)));
        parts.push(shell_quote(&self.destination()));
        parts.join(" ")
    }
}

/// Run commands and place files on a remote host.
pub trait RemoteExec {
    /// The connection this channel was opened for.
    fn connection(&self) -> &Connection;

    /// Run a shell script remotely and capture stdout. Failures are
    /// surfaced verbatim and never retried.
    fn run(&self, script: &str) -> DeployResult<String>;

    /// Copy a local file to `remote_path`.
    fn copy_file(&self, local: &Path, remote_path: &str) -> DeployResult<()>;

    /// Write `content` to `remote_path` with the given octal mode. The
    /// content travels over stdin, never the command line.
    fn write_file(&self, content: &[u8], remote_path: &str, mode: u32) -> DeployResult<()>;
}

/// Opens [`RemoteExec`] channels.
pub trait Connector {
    fn connect(&self, connection: &Connection) -> Box<dyn RemoteExec>;
}

/// SSH session wrapper for executing commands and transferring
/// files to a remote host.
pub struct SshSession {
    connection: Connection,
}

impl SshSession {
    #[must_use]
    pub const fn new(connection: Connection) -> Self {
        Self { connection }
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = self.connection.ssh_options();
        args.push(self.connection.destination());
        args.push(command.to_string());
        args
    }

    fn build_scp_args(&self, local: &Path, remote_path: &str) -> Vec<String> {
        let mut args = self.connection.ssh_options();
        args.push(local.to_string_lossy().to_string());
        args.push(format!("{}:{remote_path}", self.connection.destination()));
        args
    }
}

impl RemoteExec for SshSession {
    fn connection(&self) -> &Connection {
        &self.connection
    }

    fn run(&self, script: &str) -> DeployResult<String> {
        let args = self.build_ssh_args(script);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run("ssh", &refs)
    }

    fn copy_file(&self, local: &Path, remote_path: &str) -> DeployResult<()> {
        if !local.exists() {
            return Err(DeployError::FileNotFound(local.display().to_string()));
        }
        let args = self.build_scp_args(local, remote_path);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run("scp", &refs).map(|_| ())
    }

    fn write_file(&self, content: &[u8], remote_path: &str, mode: u32) -> DeployResult<()> {
        let quoted = shell_quote(remote_path);
        let parent = Path::new(remote_path)
            .parent()
            .map_or_else(|| ".".to_string(), |p| p.to_string_lossy().to_string());
        let command = format!(
            "umask 077 && mkdir -p {} && cat > {quoted}.tmp && chmod {mode:o} {quoted}.tmp && mv {quoted}.tmp {quoted}",
            shell_quote(&parent)
        );
        let args = self.build_ssh_args(&command);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd::run_with_stdin("ssh", &refs, content).map(|_| ())
    }
}

/// Opens real SSH sessions.
pub struct SshConnector;

impl Connector for SshConnector {
    fn connect(&self, connection: &Connection) -> Box<dyn RemoteExec> {
        Box::new(SshSession::new(connection.clone()))
    }
}

/// Bounded polling budget for readiness and health probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub attempts: u32,
    pub interval_secs: u64,
}

impl Probe {
    #[must_use]
    pub const fn new(attempts: u32, interval_secs: u64) -> Self {
        Self {
            attempts,
            interval_secs,
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for Probe {
    fn default() -> Self {
        Self::new(30, 10)
    }
}

/// Script that succeeds once the container engine socket accepts
/// connections.
pub const ENGINE_PROBE: &str = "nc -U -z /var/run/docker.sock";

/// Poll the host until the container engine answers, or give up with
/// [`DeployError::Connectivity`] after `probe.attempts` tries.
///
/// Host creation returns before the VM has booted and started its
/// services, so nothing remote may run before this succeeds.
pub fn wait_until_ready(remote: &dyn RemoteExec, probe: &Probe) -> DeployResult<()> {
    let host = remote.connection().host.clone();
    let mut last_error = String::new();

    for attempt in 1..=probe.attempts.max(1) {
        info!(host = %host, attempt, max = probe.attempts, "waiting for container engine");
        match remote.run(ENGINE_PROBE) {
            Ok(_) => {
                info!(host = %host, "container engine ready");
                return Ok(());
            }
            Err(e) => {
                debug!(error = %e, "engine probe failed");
                last_error = e.to_string();
            }
        }
        if attempt < probe.attempts {
            thread::sleep(probe.interval());
        }
    }

    Err(DeployError::Connectivity(format!(
        "container engine on {host} not ready after {} attempts: {last_error}",
        probe.attempts
    )))
}

/// Quote a string for POSIX `sh`.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=,+%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}
