//! Origin certificate material for the direct-proxy variant.

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use secrecy::SecretString;

use crate::error::{DeployError, DeployResult};

/// Where the edge publishes the CA behind authenticated origin pulls.
pub const ORIGIN_PULL_CA_URL: &str =
    "https://developers.cloudflare.com/ssl/static/authenticated_origin_pull_ca.pem";

/// 15 years, the longest validity the edge issues.
pub const DEFAULT_VALIDITY_DAYS: u32 = 5475;

/// Locally generated origin key and the request to certify it.
pub struct OriginKey {
    pub key_pem: SecretString,
    pub csr_pem: String,
}

/// Generate an ECDSA P-256 key and a CSR with `organization` as its
/// subject. Hostnames are given to the issuer separately.
pub fn generate_origin_key(organization: &str) -> DeployResult<OriginKey> {
    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .map_err(|e| DeployError::Certificate(format!("origin key generation failed: {e}")))?;

    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| DeployError::Certificate(format!("certificate params: {e}")))?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, organization);
    params.distinguished_name = dn;

    let csr_pem = params
        .serialize_request(&key_pair)
        .and_then(|csr| csr.pem())
        .map_err(|e| DeployError::Certificate(format!("CSR serialization failed: {e}")))?;

    Ok(OriginKey {
        key_pem: SecretString::from(key_pair.serialize_pem()),
        csr_pem,
    })
}

/// The apex and its wildcard.
#[must_use]
pub fn origin_hostnames(domain: &str) -> Vec<String> {
    vec![format!("*.{domain}"), domain.to_string()]
}

/// Certificate file locations on the host and inside the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub host_dir: String,
    pub container_dir: String,
}

impl CertPaths {
    pub const KEY: &'static str = "origin.key.pem";
    pub const CERT: &'static str = "origin.cert.pem";
    pub const CA: &'static str = "authenticated_origin_pull_ca.pem";

    #[must_use]
    pub fn new(remote_dir: &str) -> Self {
        Self {
            host_dir: format!("{}/certs", remote_dir.trim_end_matches('/')),
            container_dir: "/certs".to_string(),
        }
    }

    #[must_use]
    pub fn on_host(&self, file: &str) -> String {
        format!("{}/{file}", self.host_dir)
    }

    #[must_use]
    pub fn in_container(&self, file: &str) -> String {
        format!("{}/{file}", self.container_dir)
    }
}
