pub mod cloudflare;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::dns::DnsProvider;
use crate::error::DeployResult;
use crate::ingress::tunnel::IngressRule;

/// Zone-wide TLS settings enforced at the edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZoneTlsPolicy {
    /// Edge-to-origin mode; `strict` validates the origin certificate.
    pub ssl: String,
    pub always_use_https: bool,
    pub tls_1_3: bool,
    pub min_tls_version: String,
}

impl Default for ZoneTlsPolicy {
    fn default() -> Self {
        Self {
            ssl: "strict".to_string(),
            always_use_https: true,
            tls_1_3: true,
            min_tls_version: "1.2".to_string(),
        }
    }
}

impl ZoneTlsPolicy {
    /// `(setting id, value)` pairs as the edge API names them.
    #[must_use]
    pub fn settings(&self) -> Vec<(&'static str, String)> {
        let on_off = |b: bool| if b { "on" } else { "off" }.to_string();
        vec![
            ("ssl", self.ssl.clone()),
            ("always_use_https", on_off(self.always_use_https)),
            ("tls_1_3", on_off(self.tls_1_3)),
            ("min_tls_version", self.min_tls_version.clone()),
        ]
    }
}

/// What to ask the edge for when issuing an origin certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub csr: String,
    pub hostnames: Vec<String>,
    pub validity_days: u32,
}

/// An issued origin certificate. The private key never leaves the
/// operator's side, so it is not part of this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginCertificate {
    pub id: String,
    pub certificate: String,
    pub expires_on: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: String,
    pub name: String,
}

/// The edge network in front of the origin: DNS, origin certificates,
/// authenticated origin pulls, zone TLS policy, and tunnels.
pub trait EdgeProvider: DnsProvider {
    /// Check that credentials and tooling are present.
    fn check_prerequisites(&self) -> DeployResult<()>;

    fn issue_origin_certificate(
        &self,
        request: &CertificateRequest,
    ) -> DeployResult<OriginCertificate>;

    fn revoke_origin_certificate(&self, id: &str) -> DeployResult<()>;

    /// The CA whose client certificates the edge presents to origins.
    fn fetch_origin_pull_ca(&self) -> DeployResult<String>;

    /// Turn zone-wide authenticated origin pulls on or off.
    fn set_origin_pulls(&self, enabled: bool) -> DeployResult<()>;

    fn apply_zone_tls_policy(&self, policy: &ZoneTlsPolicy) -> DeployResult<()>;

    /// Register a tunnel named `name` authenticated by `secret`. A
    /// leftover tunnel of the same name is replaced.
    fn create_tunnel(&self, name: &str, secret: &SecretString) -> DeployResult<TunnelInfo>;

    /// Replace the tunnel's ingress rules.
    fn configure_tunnel(&self, tunnel_id: &str, rules: &[IngressRule]) -> DeployResult<()>;

    fn delete_tunnel(&self, tunnel_id: &str) -> DeployResult<()>;

    /// Account the edge resources live in.
    fn account_id(&self) -> &str;
}

/// Hostname the edge assigns to a tunnel.
#[must_use]
pub fn tunnel_hostname(tunnel_id: &str) -> String {
    format!("{tunnel_id}.cfargotunnel.com")
}
