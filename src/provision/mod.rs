pub mod hetzner;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DeployError, DeployResult};

/// Port that must stay open for remote execution to remain possible.
pub const ADMIN_PORT: &str = "22";

/// Everything needed to create a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub name: String,
    pub image: String,
    pub server_type: String,
    pub location: String,
    pub ssh_keys: Vec<String>,
}

/// A provisioned server. The address never changes once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    pub address: String,
    pub image: String,
    pub server_type: String,
    pub location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Icmp => "icmp",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    pub port: String,
    pub protocol: Protocol,
    pub direction: Direction,
    pub source_ranges: Vec<String>,
}

impl FirewallRule {
    #[must_use]
    pub fn inbound_tcp(port: &str, sources: &[String]) -> Self {
        Self {
            port: port.to_string(),
            protocol: Protocol::Tcp,
            direction: Direction::In,
            source_ranges: sources.to_vec(),
        }
    }
}

/// Named inbound policy. Always contains the admin port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPolicy {
    pub name: String,
    pub rules: Vec<FirewallRule>,
}

impl FirewallPolicy {
    /// A policy that only admits SSH from `admin_sources`.
    #[must_use]
    pub fn new(name: &str, admin_sources: &[String]) -> Self {
        Self {
            name: name.to_string(),
            rules: vec![FirewallRule::inbound_tcp(ADMIN_PORT, admin_sources)],
        }
    }

    #[must_use]
    pub fn allow(mut self, rule: FirewallRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Inbound ports opened by this policy.
    #[must_use]
    pub fn inbound_ports(&self) -> Vec<&str> {
        self.rules
            .iter()
            .filter(|r| r.direction == Direction::In)
            .map(|r| r.port.as_str())
            .collect()
    }

    /// Reject a policy that would lock us out of the host.
    pub fn validate(&self) -> DeployResult<()> {
        let admin_open = self.rules.iter().any(|r| {
            r.direction == Direction::In
                && r.protocol == Protocol::Tcp
                && r.port == ADMIN_PORT
                && !r.source_ranges.is_empty()
        });
        if admin_open {
            Ok(())
        } else {
            Err(DeployError::Config(format!(
                "firewall '{}' must admit tcp/{ADMIN_PORT} from at least one range",
                self.name
            )))
        }
    }
}

/// A host provider creates servers, firewalls, and SSH key
/// registrations, all keyed by logical name so repeated calls
/// converge on one resource.
pub trait HostProvider {
    /// Check that the provider tooling is installed and
    /// authenticated.
    fn check_prerequisites(&self) -> DeployResult<()>;

    /// Register a public key; returns the provider key id.
    fn register_ssh_key(&self, name: &str, public_key: &str) -> DeployResult<String>;

    fn delete_ssh_key(&self, name: &str) -> DeployResult<()>;

    /// Create the firewall, or bring an existing one's rules in line
    /// with `policy`. Returns the firewall id.
    fn create_firewall(&self, policy: &FirewallPolicy) -> DeployResult<String>;

    fn delete_firewall(&self, name: &str) -> DeployResult<()>;

    /// Create a server, or return the existing one with this name.
    fn create_host(&self, spec: &HostSpec) -> DeployResult<Host>;

    fn delete_host(&self, name: &str) -> DeployResult<()>;

    fn attach_firewall(&self, firewall: &str, host: &str) -> DeployResult<()>;

    fn detach_firewall(&self, firewall: &str, host: &str) -> DeployResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anywhere() -> Vec<String> {
        vec!["0.0.0.0/0".into(), "::/0".into()]
    }

    #[test]
    fn new_policy_admits_admin_port() {
        let policy = FirewallPolicy::new("fw", &anywhere());
        assert_eq!(policy.inbound_ports(), vec!["22"]);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn https_rule_is_appended() {
        let policy =
            FirewallPolicy::new("fw", &anywhere()).allow(FirewallRule::inbound_tcp("443", &anywhere()));
        assert_eq!(policy.inbound_ports(), vec!["22", "443"]);
    }

    #[test]
    fn policy_without_admin_sources_is_rejected() {
        let policy = FirewallPolicy::new("fw", &[]);
        assert!(matches!(policy.validate(), Err(DeployError::Config(_))));
    }
}
