use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::error::{DeployError, DeployResult};
use crate::ingress::Ingress;
use crate::keys::KeyAlgorithm;
use crate::provision::{FirewallPolicy, FirewallRule, HostSpec};
use crate::ssh::Probe;

/// What `destroy` does with remote resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalPolicy {
    /// Leave remote resources in place; only local state and key
    /// material are removed.
    Retain,
    Remove,
}

impl RemovalPolicy {
    /// `production` keeps its resources, every other stage removes them.
    #[must_use]
    pub fn for_stage(stage: &str) -> Self {
        if stage == "production" {
            Self::Retain
        } else {
            Self::Remove
        }
    }
}

impl fmt::Display for RemovalPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Retain => "retain",
            Self::Remove => "remove",
        })
    }
}

/// Everything that describes one deployment.
///
/// Credentials are not part of it; they come from the environment.
///
/// # Example
///
/// ```
/// use trebuchet::{App, Deployment, Ingress};
///
/// let deployment = Deployment::new("shop")
///     .domain("shop.example")
///     .zone_id("0123456789abcdef")
///     .account_id("fedcba9876543210")
///     .app(App::new("app").port(3000))
///     .ingress(Ingress::tunnel());
///
/// assert!(deployment.validate().is_ok());
/// assert_eq!(deployment.resource_name(), "shop-dev");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Deployment {
    pub name: String,
    pub stage: String,
    pub domain: String,
    pub account_id: String,
    pub zone_id: String,
    pub location: String,
    pub server_type: String,
    pub server_image: String,
    pub ssh_user: String,
    pub key_algorithm: KeyAlgorithm,
    /// Ranges allowed to reach SSH.
    pub admin_sources: Vec<String>,
    /// Working directory on the host.
    pub remote_dir: String,
    /// Local directory for state, lock, and the run's key file.
    pub state_dir: PathBuf,
    pub readiness: Probe,
    /// Overrides the stage-derived policy.
    pub removal: Option<RemovalPolicy>,
    pub app: App,
    pub ingress: Ingress,
}

impl Default for Deployment {
    fn default() -> Self {
        Self::new("app")
    }
}

impl Deployment {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stage: "dev".to_string(),
            domain: String::new(),
            account_id: String::new(),
            zone_id: String::new(),
            location: "nbg1".to_string(),
            server_type: "cx22".to_string(),
            server_image: "docker-ce".to_string(),
            ssh_user: "root".to_string(),
            key_algorithm: KeyAlgorithm::default(),
            admin_sources: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            remote_dir: "/root/app".to_string(),
            state_dir: PathBuf::from(".trebuchet"),
            readiness: Probe::default(),
            removal: None,
            app: App::default(),
            ingress: Ingress::default(),
        }
    }

    pub fn from_yaml_str(yaml: &str) -> DeployResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: &Path) -> DeployResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DeployError::FileNotFound(path.display().to_string())
            } else {
                e.into()
            }
        })?;
        Self::from_yaml_str(&content)
    }

    #[must_use]
    pub fn stage(mut self, stage: &str) -> Self {
        self.stage = stage.to_string();
        self
    }

    #[must_use]
    pub fn domain(mut self, domain: &str) -> Self {
        self.domain = domain.to_string();
        self
    }

    #[must_use]
    pub fn account_id(mut self, id: &str) -> Self {
        self.account_id = id.to_string();
        self
    }

    #[must_use]
    pub fn zone_id(mut self, id: &str) -> Self {
        self.zone_id = id.to_string();
        self
    }

    #[must_use]
    pub fn location(mut self, location: &str) -> Self {
        self.location = location.to_string();
        self
    }

    #[must_use]
    pub fn server_type(mut self, server_type: &str) -> Self {
        self.server_type = server_type.to_string();
        self
    }

    #[must_use]
    pub fn server_image(mut self, image: &str) -> Self {
        self.server_image = image.to_string();
        self
    }

    #[must_use]
    pub fn ssh_user(mut self, user: &str) -> Self {
        self.ssh_user = user.to_string();
        self
    }

    #[must_use]
    pub const fn key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    #[must_use]
    pub fn admin_sources(mut self, ranges: &[&str]) -> Self {
        self.admin_sources = ranges.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn remote_dir(mut self, dir: &str) -> Self {
        self.remote_dir = dir.to_string();
        self
    }

    #[must_use]
    pub fn state_dir(mut self, dir: &Path) -> Self {
        self.state_dir = dir.to_path_buf();
        self
    }

    #[must_use]
    pub const fn readiness(mut self, probe: Probe) -> Self {
        self.readiness = probe;
        self
    }

    #[must_use]
    pub const fn removal(mut self, policy: RemovalPolicy) -> Self {
        self.removal = Some(policy);
        self
    }

    #[must_use]
    pub fn app(mut self, app: App) -> Self {
        self.app = app;
        self
    }

    #[must_use]
    pub fn ingress(mut self, ingress: Ingress) -> Self {
        self.ingress = ingress;
        self
    }

    /// Name given to provider-side resources: `<name>-<stage>`.
    #[must_use]
    pub fn resource_name(&self) -> String {
        format!("{}-{}", self.name, self.stage)
    }

    #[must_use]
    pub fn removal_policy(&self) -> RemovalPolicy {
        self.removal
            .unwrap_or_else(|| RemovalPolicy::for_stage(&self.stage))
    }

    #[must_use]
    pub fn tunnel_name(&self) -> String {
        match &self.ingress {
            Ingress::Tunnel(t) => t.tunnel_name.clone().unwrap_or_else(|| self.resource_name()),
            Ingress::DirectProxy(_) => self.resource_name(),
        }
    }

    /// Inbound policy: SSH always, HTTPS from anywhere only when the
    /// proxy is exposed directly.
    #[must_use]
    pub fn firewall_policy(&self) -> FirewallPolicy {
        let policy = FirewallPolicy::new(&self.resource_name(), &self.admin_sources);
        match &self.ingress {
            Ingress::DirectProxy(proxy) => policy.allow(FirewallRule::inbound_tcp(
                &proxy.https_port.to_string(),
                &["0.0.0.0/0".to_string(), "::/0".to_string()],
            )),
            Ingress::Tunnel(_) => policy,
        }
    }

    /// Server spec; SSH key ids are filled in by the provisioner.
    #[must_use]
    pub fn host_spec(&self) -> HostSpec {
        HostSpec {
            name: self.resource_name(),
            image: self.server_image.clone(),
            server_type: self.server_type.clone(),
            location: self.location.clone(),
            ssh_keys: Vec::new(),
        }
    }

    /// Public URL once applied.
    #[must_use]
    pub fn url(&self) -> String {
        format!("https://{}", self.domain)
    }

    /// Reject configurations that cannot be deployed.
    pub fn validate(&self) -> DeployResult<()> {
        check_name("name", &self.name)?;
        check_name("stage", &self.stage)?;
        check_name("app name", &self.app.name)?;

        if self.domain.is_empty() || !self.domain.contains('.') {
            return Err(DeployError::Config(format!(
                "domain '{}' is not a fully qualified name",
                self.domain
            )));
        }
        if self.zone_id.is_empty() {
            return Err(DeployError::Config("zone_id is required".into()));
        }
        if matches!(self.ingress, Ingress::Tunnel(_)) && self.account_id.is_empty() {
            return Err(DeployError::Config(
                "account_id is required for the tunnel ingress".into(),
            ));
        }
        if self.app.port == 0 {
            return Err(DeployError::Config("app port must be non-zero".into()));
        }
        check_remote_dir(&self.remote_dir)?;
        if self.readiness.attempts == 0 {
            return Err(DeployError::Config(
                "readiness probe needs at least one attempt".into(),
            ));
        }
        self.firewall_policy().validate()
    }
}

/// Top-level directories a deployment may never own.
const SYSTEM_ROOTS: [&str; 11] = [
    "bin", "boot", "dev", "etc", "lib", "lib64", "proc", "run", "sbin", "sys", "usr",
];

/// Shared directories that are only valid as a parent.
const SHARED_DIRS: [&str; 4] = ["/var/lib", "/var/log", "/var/www", "/opt/local"];

/// Check that `dir` is safe to hand to `rm -rf` on destroy: absolute,
/// at least two levels deep, no `.`/`..`, and outside system trees
/// and home directories.
pub fn check_remote_dir(dir: &str) -> DeployResult<()> {
    let reject = |why: &str| Err(DeployError::Config(format!("remote_dir '{dir}' {why}")));

    if !dir.starts_with('/') {
        return reject("must be absolute");
    }
    let parts: Vec<&str> = dir.split('/').filter(|p| !p.is_empty()).collect();
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return reject("must not contain '.' or '..'");
    }
    if parts.len() < 2 {
        return reject("must be at least two levels deep");
    }
    if SYSTEM_ROOTS.contains(&parts[0]) {
        return reject("is inside a system directory");
    }
    if parts[0] == "home" && parts.len() == 2 {
        return reject("is a home directory");
    }
    let normalized = format!("/{}", parts.join("/"));
    if SHARED_DIRS.contains(&normalized.as_str()) {
        return reject("is a shared system directory");
    }
    Ok(())
}

fn check_name(what: &str, value: &str) -> DeployResult<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && !value.starts_with('-');
    if valid {
        Ok(())
    } else {
        Err(DeployError::Config(format!(
            "{what} '{value}' must be lowercase letters, digits, '-' or '_'"
        )))
    }
}
