use std::io::Write;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cmd;
use crate::error::{DeployError, DeployResult};
use crate::provision::{FirewallPolicy, Host, HostProvider, HostSpec};

/// Hetzner Cloud provider using the `hcloud` CLI.
///
/// Authenticates through `HCLOUD_TOKEN` or the active `hcloud`
/// context.
pub struct Hetzner;

impl Hetzner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn list<T: for<'de> Deserialize<'de>>(resource: &str) -> DeployResult<Vec<T>> {
        let output = cmd::run("hcloud", &[resource, "list", "-o", "json"])?;
        parse_list(&output)
    }

    fn find_ssh_key(name: &str) -> DeployResult<Option<HcloudSshKey>> {
        Ok(Self::list::<HcloudSshKey>("ssh-key")?
            .into_iter()
            .find(|k| k.name == name))
    }

    fn find_firewall(name: &str) -> DeployResult<Option<HcloudFirewall>> {
        Ok(Self::list::<HcloudFirewall>("firewall")?
            .into_iter()
            .find(|f| f.name == name))
    }

    fn find_server(name: &str) -> DeployResult<Option<HcloudServer>> {
        Ok(Self::list::<HcloudServer>("server")?
            .into_iter()
            .find(|s| s.name == name))
    }

    fn with_rules_file<T>(
        policy: &FirewallPolicy,
        f: impl FnOnce(&str) -> DeployResult<T>,
    ) -> DeployResult<T> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(render_rules(policy)?.as_bytes())?;
        file.flush()?;
        let path = file.path().to_string_lossy().to_string();
        f(&path)
    }
}

impl Default for Hetzner {
    fn default() -> Self {
        Self::new()
    }
}

impl HostProvider for Hetzner {
    fn check_prerequisites(&self) -> DeployResult<()> {
        info!("checking host provider prerequisites");

        if !cmd::command_exists("hcloud") {
            return Err(DeployError::PrerequisiteMissing(
                "hcloud is not installed. \
                 See https://github.com/hetznercloud/cli"
                    .into(),
            ));
        }

        if std::env::var("HCLOUD_TOKEN").is_err() {
            cmd::run("hcloud", &["context", "active"]).map_err(|_| {
                DeployError::EnvMissing(
                    "HCLOUD_TOKEN not set and no active hcloud context".into(),
                )
            })?;
        }

        Ok(())
    }

    fn register_ssh_key(&self, name: &str, public_key: &str) -> DeployResult<String> {
        if let Some(existing) = Self::find_ssh_key(name)? {
            if existing.public_key.trim() == public_key.trim() {
                return Ok(existing.id.to_string());
            }
            warn!(key = name, "registered SSH key differs, replacing");
            cmd::run("hcloud", &["ssh-key", "delete", name])?;
        }

        info!(key = name, "registering SSH key");
        cmd::run(
            "hcloud",
            &["ssh-key", "create", "--name", name, "--public-key", public_key],
        )?;

        Self::find_ssh_key(name)?
            .map(|k| k.id.to_string())
            .ok_or_else(|| DeployError::Provisioning(format!("SSH key '{name}' missing after create")))
    }

    fn delete_ssh_key(&self, name: &str) -> DeployResult<()> {
        if Self::find_ssh_key(name)?.is_some() {
            cmd::run("hcloud", &["ssh-key", "delete", name])?;
            info!(key = name, "SSH key deleted");
        }
        Ok(())
    }

    fn create_firewall(&self, policy: &FirewallPolicy) -> DeployResult<String> {
        policy.validate()?;
        let name = policy.name.as_str();

        if Self::find_firewall(name)?.is_some() {
            info!(firewall = name, "updating firewall rules");
            Self::with_rules_file(policy, |path| {
                cmd::run("hcloud", &["firewall", "replace-rules", name, "--rules-file", path])
            })?;
        } else {
            info!(firewall = name, "creating firewall");
            Self::with_rules_file(policy, |path| {
                cmd::run("hcloud", &["firewall", "create", "--name", name, "--rules-file", path])
            })?;
        }

        Self::find_firewall(name)?
            .map(|f| f.id.to_string())
            .ok_or_else(|| DeployError::Provisioning(format!("firewall '{name}' missing after create")))
    }

    fn delete_firewall(&self, name: &str) -> DeployResult<()> {
        if Self::find_firewall(name)?.is_some() {
            cmd::run("hcloud", &["firewall", "delete", name])?;
            info!(firewall = name, "firewall deleted");
        }
        Ok(())
    }

    fn create_host(&self, spec: &HostSpec) -> DeployResult<Host> {
        if let Some(existing) = Self::find_server(&spec.name)? {
            info!(server = %spec.name, "server already exists");
            return existing.into_host();
        }

        info!(
            server = %spec.name,
            location = %spec.location,
            server_type = %spec.server_type,
            "creating server"
        );

        let mut args = vec![
            "server",
            "create",
            "--name",
            &spec.name,
            "--image",
            &spec.image,
            "--type",
            &spec.server_type,
            "--location",
            &spec.location,
        ];
        for key in &spec.ssh_keys {
            args.push("--ssh-key");
            args.push(key);
        }
        cmd::run("hcloud", &args)?;

        let host = Self::find_server(&spec.name)?
            .ok_or_else(|| DeployError::ServerNotFound(spec.name.clone()))?
            .into_host()?;
        info!(server = %host.name, address = %host.address, "server created");
        Ok(host)
    }

    fn delete_host(&self, name: &str) -> DeployResult<()> {
        if Self::find_server(name)?.is_some() {
            info!(server = name, "deleting server");
            cmd::run("hcloud", &["server", "delete", name])?;
        }
        Ok(())
    }

    fn attach_firewall(&self, firewall: &str, host: &str) -> DeployResult<()> {
        let server = Self::find_server(host)?
            .ok_or_else(|| DeployError::ServerNotFound(host.to_string()))?;
        let fw = Self::find_firewall(firewall)?.ok_or_else(|| {
            DeployError::Provisioning(format!("firewall '{firewall}' not found"))
        })?;

        if fw.is_applied_to(server.id) {
            return Ok(());
        }

        info!(firewall, server = host, "attaching firewall");
        cmd::run(
            "hcloud",
            &[
                "firewall",
                "apply-to-resource",
                firewall,
                "--type",
                "server",
                "--server",
                host,
            ],
        )
        .map(|_| ())
    }

    fn detach_firewall(&self, firewall: &str, host: &str) -> DeployResult<()> {
        let (Some(server), Some(fw)) = (Self::find_server(host)?, Self::find_firewall(firewall)?)
        else {
            return Ok(());
        };
        if !fw.is_applied_to(server.id) {
            return Ok(());
        }
        cmd::run(
            "hcloud",
            &[
                "firewall",
                "remove-from-resource",
                firewall,
                "--type",
                "server",
                "--server",
                host,
            ],
        )
        .map(|_| ())
    }
}

#[derive(Debug, Deserialize)]
pub struct HcloudSshKey {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub public_key: String,
}

#[derive(Debug, Deserialize)]
pub struct HcloudFirewall {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub applied_to: Vec<AppliedTo>,
}

impl HcloudFirewall {
    #[must_use]
    pub fn is_applied_to(&self, server_id: u64) -> bool {
        self.applied_to
            .iter()
            .any(|a| a.server.as_ref().is_some_and(|s| s.id == server_id))
    }
}

#[derive(Debug, Deserialize)]
pub struct AppliedTo {
    #[serde(rename = "type")]
    pub kind: String,
    pub server: Option<IdRef>,
}

#[derive(Debug, Deserialize)]
pub struct IdRef {
    pub id: u64,
}

#[derive(Debug, Deserialize)]
pub struct HcloudServer {
    pub id: u64,
    pub name: String,
    pub public_net: PublicNet,
    pub server_type: Named,
    pub image: Option<Named>,
    pub datacenter: Datacenter,
}

#[derive(Debug, Deserialize)]
pub struct PublicNet {
    pub ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
pub struct Ipv4 {
    pub ip: String,
}

#[derive(Debug, Deserialize)]
pub struct Named {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct Datacenter {
    pub location: Named,
}

impl HcloudServer {
    pub fn into_host(self) -> DeployResult<Host> {
        let address = self
            .public_net
            .ipv4
            .map(|v4| v4.ip)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| {
                DeployError::Provisioning(format!("server '{}' has no public IPv4", self.name))
            })?;

        Ok(Host {
            id: self.id.to_string(),
            name: self.name,
            address,
            image: self.image.map(|i| i.name).unwrap_or_default(),
            server_type: self.server_type.name,
            location: self.datacenter.location.name,
        })
    }
}

/// Parse `hcloud <resource> list -o json`, which prints `null` when
/// there is nothing to list.
pub fn parse_list<T: for<'de> Deserialize<'de>>(output: &str) -> DeployResult<Vec<T>> {
    let trimmed = output.trim();
    if trimmed.is_empty() || trimmed == "null" {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

#[derive(Serialize)]
struct RuleFileEntry<'a> {
    direction: &'a crate::provision::Direction,
    protocol: &'a crate::provision::Protocol,
    port: &'a str,
    source_ips: &'a [String],
}

/// Render a policy as an `hcloud --rules-file` document.
pub fn render_rules(policy: &FirewallPolicy) -> DeployResult<String> {
    let entries: Vec<RuleFileEntry<'_>> = policy
        .rules
        .iter()
        .map(|r| RuleFileEntry {
            direction: &r.direction,
            protocol: &r.protocol,
            port: &r.port,
            source_ips: &r.source_ranges,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&entries)?)
}
