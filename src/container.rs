//! Containers, volumes, and networks on the remote engine, driven
//! through `docker` over a [`RemoteExec`] channel.

use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::DeployResult;
use crate::ssh::{Probe, RemoteExec, shell_quote};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mount {
    Volume {
        name: String,
        target: String,
    },
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
}

impl Mount {
    #[must_use]
    pub fn volume(name: &str, target: &str) -> Self {
        Self::Volume {
            name: name.to_string(),
            target: target.to_string(),
        }
    }

    #[must_use]
    pub fn bind_ro(source: &str, target: &str) -> Self {
        Self::Bind {
            source: source.to_string(),
            target: target.to_string(),
            read_only: true,
        }
    }

    fn to_arg(&self) -> String {
        match self {
            Self::Volume { name, target } => format!("{name}:{target}"),
            Self::Bind {
                source,
                target,
                read_only,
            } => {
                if *read_only {
                    format!("{source}:{target}:ro")
                } else {
                    format!("{source}:{target}")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
}

impl RestartPolicy {
    const fn as_str(self) -> &'static str {
        match self {
            Self::No => "no",
            Self::Always => "always",
        }
    }
}

/// Liveness probe run by the engine itself. Failing past `retries`
/// marks the container unhealthy; nothing is rolled back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub test: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub retries: u32,
    pub start_period_secs: u64,
}

impl HealthCheck {
    #[must_use]
    pub fn new(test: &str) -> Self {
        Self {
            test: test.to_string(),
            interval_secs: 30,
            timeout_secs: 5,
            retries: 5,
            start_period_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Desired state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub networks: Vec<String>,
    pub command: Vec<String>,
    pub restart: RestartPolicy,
    pub healthcheck: Option<HealthCheck>,
    pub ports: Vec<PortMapping>,
    pub env: Vec<(String, String)>,
    pub env_file: Option<String>,
    /// Must run to successful completion instead of staying up.
    pub one_shot: bool,
}

impl ContainerSpec {
    #[must_use]
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            mounts: Vec::new(),
            networks: Vec::new(),
            command: Vec::new(),
            restart: RestartPolicy::No,
            healthcheck: None,
            ports: Vec::new(),
            env: Vec::new(),
            env_file: None,
            one_shot: false,
        }
    }

    #[must_use]
    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    #[must_use]
    pub fn network(mut self, name: &str) -> Self {
        self.networks.push(name.to_string());
        self
    }

    #[must_use]
    pub fn command(mut self, argv: &[String]) -> Self {
        self.command = argv.to_vec();
        self
    }

    #[must_use]
    pub const fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    #[must_use]
    pub fn healthcheck(mut self, check: HealthCheck) -> Self {
        self.healthcheck = Some(check);
        self
    }

    #[must_use]
    pub fn publish(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping { host, container });
        self
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn env_file(mut self, path: &str) -> Self {
        self.env_file = Some(path.to_string());
        self
    }

    #[must_use]
    pub const fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    /// Arguments to `docker` for creating and starting this
    /// container. Only the first network is attached here; the rest
    /// are connected afterwards.
    #[must_use]
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        if !self.one_shot {
            args.push("-d".to_string());
        }
        args.extend(["--name".to_string(), self.name.clone()]);
        if !self.one_shot {
            args.extend(["--restart".to_string(), self.restart.as_str().to_string()]);
        }
        if let Some(network) = self.networks.first() {
            args.extend(["--network".to_string(), network.clone()]);
        }
        for mount in &self.mounts {
            args.extend(["-v".to_string(), mount.to_arg()]);
        }
        for port in &self.ports {
            args.extend(["-p".to_string(), format!("{}:{}", port.host, port.container)]);
        }
        if let Some(file) = &self.env_file {
            args.extend(["--env-file".to_string(), file.clone()]);
        }
        for (k, v) in &self.env {
            args.extend(["-e".to_string(), format!("{k}={v}")]);
        }
        if let Some(hc) = &self.healthcheck {
            args.extend([
                "--health-cmd".to_string(),
                hc.test.clone(),
                "--health-interval".to_string(),
                format!("{}s", hc.interval_secs),
                "--health-timeout".to_string(),
                format!("{}s", hc.timeout_secs),
                "--health-retries".to_string(),
                hc.retries.to_string(),
                "--health-start-period".to_string(),
                format!("{}s", hc.start_period_secs),
            ]);
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Observed health after an ingress container starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy,
    NoHealthcheck,
    TimedOut(String),
}

/// `docker` on the far side of a remote channel.
pub struct DockerEngine<'a> {
    remote: &'a dyn RemoteExec,
}

impl<'a> DockerEngine<'a> {
    #[must_use]
    pub const fn new(remote: &'a dyn RemoteExec) -> Self {
        Self { remote }
    }

    pub fn ensure_volume(&self, name: &str) -> DeployResult<()> {
        let n = shell_quote(name);
        self.remote.run(&format!(
            "docker volume inspect {n} >/dev/null 2>&1 || docker volume create {n}"
        ))?;
        Ok(())
    }

    pub fn remove_volume(&self, name: &str) -> DeployResult<()> {
        let n = shell_quote(name);
        self.remote.run(&format!(
            "if docker volume inspect {n} >/dev/null 2>&1; then docker volume rm {n}; fi"
        ))?;
        Ok(())
    }

    pub fn ensure_network(&self, name: &str) -> DeployResult<()> {
        let n = shell_quote(name);
        self.remote.run(&format!(
            "docker network inspect {n} >/dev/null 2>&1 || docker network create {n}"
        ))?;
        Ok(())
    }

    pub fn remove_network(&self, name: &str) -> DeployResult<()> {
        let n = shell_quote(name);
        self.remote.run(&format!(
            "if docker network inspect {n} >/dev/null 2>&1; then docker network rm {n}; fi"
        ))?;
        Ok(())
    }

    /// Replace any container of the same name and run `spec` in the
    /// foreground. Returns once it exited with status zero; any other
    /// status is an error.
    pub fn run_to_completion(&self, spec: &ContainerSpec) -> DeployResult<String> {
        info!(container = %spec.name, "running one-shot container");
        self.remove(&spec.name)?;
        self.remote.run(&docker_line(&spec.run_args()))
    }

    /// Replace any container of the same name and start `spec`
    /// detached. Returns the new container id.
    pub fn run_detached(&self, spec: &ContainerSpec) -> DeployResult<String> {
        info!(container = %spec.name, image = %spec.image, "starting container");
        self.remove(&spec.name)?;
        let output = self.remote.run(&docker_line(&spec.run_args()))?;
        for network in spec.networks.iter().skip(1) {
            self.remote.run(&format!(
                "docker network connect {} {}",
                shell_quote(network),
                shell_quote(&spec.name)
            ))?;
        }
        Ok(output.lines().last().unwrap_or_default().trim().to_string())
    }

    pub fn remove(&self, name: &str) -> DeployResult<()> {
        let n = shell_quote(name);
        self.remote.run(&format!(
            "if docker container inspect {n} >/dev/null 2>&1; then docker rm -f {n} >/dev/null; fi"
        ))?;
        Ok(())
    }

    pub fn remove_image(&self, tag: &str) -> DeployResult<()> {
        let t = shell_quote(tag);
        self.remote.run(&format!(
            "if docker image inspect {t} >/dev/null 2>&1; then docker image rm -f {t} >/dev/null; fi"
        ))?;
        Ok(())
    }

    pub fn health_status(&self, name: &str) -> DeployResult<String> {
        let status = self.remote.run(&format!(
            "docker inspect --format '{{{{if .State.Health}}}}{{{{.State.Health.Status}}}}{{{{else}}}}none{{{{end}}}}' {}",
            shell_quote(name)
        ))?;
        Ok(status.trim().to_string())
    }

    /// Poll container health within `probe`'s budget.
    pub fn wait_healthy(&self, name: &str, probe: &Probe) -> Health {
        let mut last = String::from("unknown");

        for attempt in 1..=probe.attempts.max(1) {
            match self.health_status(name) {
                Ok(status) => {
                    debug!(container = name, attempt, status = %status, "health");
                    match status.as_str() {
                        "healthy" => return Health::Healthy,
                        "unhealthy" => {
                            warn!(container = name, "container reported unhealthy");
                            return Health::Unhealthy;
                        }
                        "none" => return Health::NoHealthcheck,
                        _ => last = status,
                    }
                }
                Err(e) => last = e.to_string(),
            }
            if attempt < probe.attempts {
                thread::sleep(probe.interval());
            }
        }

        Health::TimedOut(last)
    }

    /// Poll `argv` inside the running container until it exits zero.
    ///
    /// For images without a shell, where the engine's own health check
    /// cannot run.
    pub fn wait_exec_ready(&self, name: &str, argv: &[String], probe: &Probe) -> Health {
        let mut exec = vec!["exec".to_string(), name.to_string()];
        exec.extend(argv.iter().cloned());
        let line = docker_line(&exec);
        let mut last = String::from("unknown");

        for attempt in 1..=probe.attempts.max(1) {
            match self.remote.run(&line) {
                Ok(_) => return Health::Healthy,
                Err(e) => {
                    debug!(container = name, attempt, error = %e, "readiness probe failed");
                    last = e.to_string();
                }
            }
            if attempt < probe.attempts {
                thread::sleep(probe.interval());
            }
        }

        warn!(container = name, "container did not become ready");
        Health::TimedOut(last)
    }
}

fn docker_line(args: &[String]) -> String {
    let mut line = String::from("docker");
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line
}
