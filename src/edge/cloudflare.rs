use std::io::Write;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::cmd;
use crate::dns::{self, DnsProvider, DnsRecord, RecordType};
use crate::edge::{CertificateRequest, EdgeProvider, OriginCertificate, TunnelInfo, ZoneTlsPolicy};
use crate::error::{DeployError, DeployResult};
use crate::ingress::origin::ORIGIN_PULL_CA_URL;
use crate::ingress::tunnel::IngressRule;

const CF_API: &str = "https://api.cloudflare.com/client/v4";

/// Record types a deployment owns under its name. Everything else at
/// that name (MX, TXT, CAA, ...) is left alone.
const MANAGED_TYPES: [RecordType; 2] = [RecordType::A, RecordType::Cname];

/// Cloudflare edge using the Cloudflare API via curl.
///
/// The token needs Account Settings:Read, Cloudflare Tunnel:Edit,
/// Zone Settings:Edit, SSL and Certificates:Edit, and DNS:Edit. It is
/// handed to curl through an owner-only header file, never as an
/// argument.
pub struct Cloudflare {
    account_id: String,
    zone_id: String,
    token: SecretString,
    curl: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CfRecord {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    proxied: bool,
}

#[derive(Debug, Deserialize)]
struct CfCertificate {
    id: String,
    certificate: String,
    #[serde(default)]
    expires_on: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CfTunnel {
    id: String,
    name: String,
    #[serde(default)]
    deleted_at: Option<String>,
}

impl Cloudflare {
    #[must_use]
    pub fn new(account_id: &str, zone_id: &str, token: SecretString) -> Self {
        Self {
            account_id: account_id.to_string(),
            zone_id: zone_id.to_string(),
            token,
            curl: "curl".to_string(),
        }
    }

    /// Use another `curl` binary.
    #[must_use]
    pub fn curl_program(mut self, program: &str) -> Self {
        self.curl = program.to_string();
        self
    }

    /// Read the token from `CLOUDFLARE_API_TOKEN`.
    pub fn from_env(account_id: &str, zone_id: &str) -> DeployResult<Self> {
        let token = std::env::var("CLOUDFLARE_API_TOKEN").map_err(|_| {
            DeployError::EnvMissing(
                "CLOUDFLARE_API_TOKEN not set. Create a token at: \
                 https://dash.cloudflare.com/profile/api-tokens"
                    .into(),
            )
        })?;
        Ok(Self::new(account_id, zone_id, SecretString::from(token)))
    }

    /// curl arguments for one API call. Headers come from
    /// `header_file`; a body, if any, is read from stdin.
    #[must_use]
    pub fn curl_args(method: &str, url: &str, header_file: &str, has_body: bool) -> Vec<String> {
        let mut args = vec![
            "-sS".to_string(),
            "-X".to_string(),
            method.to_string(),
            "-H".to_string(),
            format!("@{header_file}"),
        ];
        if has_body {
            args.push("--data-binary".to_string());
            args.push("@-".to_string());
        }
        args.push(url.to_string());
        args
    }

    fn header_file(&self) -> DeployResult<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "Authorization: Bearer {}", self.token.expose_secret())?;
        writeln!(file, "Content-Type: application/json")?;
        file.flush()?;
        Ok(file)
    }

    fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<&Value>,
    ) -> DeployResult<Option<T>> {
        let headers = self.header_file()?;
        let url = format!("{CF_API}{path}");
        let args = Self::curl_args(
            method,
            &url,
            &headers.path().to_string_lossy(),
            body.is_some(),
        );
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();

        debug!(method, path, "cloudflare api");
        let response = match body {
            Some(b) => cmd::run_with_stdin(&self.curl, &refs, &serde_json::to_vec(b)?)?,
            None => cmd::run(&self.curl, &refs)?,
        };
        parse_response(method, path, &response)
    }

    /// Records under `name` whose type is one of `types`.
    fn list_records(&self, name: &str, types: &[RecordType]) -> DeployResult<Vec<CfRecord>> {
        let path = format!("/zones/{}/dns_records?name={name}", self.zone_id);
        let all: Vec<CfRecord> = self.call("GET", &path, None)?.unwrap_or_default();
        Ok(all
            .into_iter()
            .filter(|r| types.iter().any(|t| t.as_str() == r.kind))
            .collect())
    }

    fn delete_record_id(&self, id: &str) -> DeployResult<()> {
        let path = format!("/zones/{}/dns_records/{id}", self.zone_id);
        self.call::<Value>("DELETE", &path, None)?;
        Ok(())
    }

    fn find_tunnels(&self, name: &str) -> DeployResult<Vec<CfTunnel>> {
        self.list_tunnels(&format!("name={name}"))
    }

    /// Live tunnels matching `filter`. An empty list means none; an
    /// API rejection is an error.
    fn list_tunnels(&self, filter: &str) -> DeployResult<Vec<CfTunnel>> {
        let path = format!(
            "/accounts/{}/cfd_tunnel?{filter}&is_deleted=false",
            self.account_id
        );
        Ok(self.call("GET", &path, None)?.unwrap_or_default())
    }
}

fn parse_response<T: DeserializeOwned>(
    method: &str,
    path: &str,
    response: &str,
) -> DeployResult<Option<T>> {
    let envelope: ApiEnvelope<T> = serde_json::from_str(response).map_err(|e| {
        DeployError::Other(format!("{method} {path}: unexpected response: {e}"))
    })?;
    if envelope.success {
        return Ok(envelope.result);
    }
    let reasons: Vec<String> = envelope
        .errors
        .iter()
        .map(|m| format!("{} ({})", m.message, m.code))
        .collect();
    Err(DeployError::Other(format!(
        "{method} {path} rejected: {}",
        reasons.join("; ")
    )))
}

fn record_body(record: &DnsRecord) -> Value {
    json!({
        "type": record.kind.as_str(),
        "name": record.name,
        "content": record.content,
        "ttl": 1,
        "proxied": record.proxied,
    })
}

impl DnsProvider for Cloudflare {
    fn upsert_record(&self, record: &DnsRecord) -> DeployResult<String> {
        info!(
            record = %dns::record_label(&record.name),
            kind = %record.kind,
            target = %record.content,
            "setting DNS record"
        );

        let body = record_body(record);
        let mut existing = self.list_records(&record.name, &MANAGED_TYPES)?;

        if let Some(pos) = existing.iter().position(|r| r.kind == record.kind.as_str()) {
            let current = existing.swap_remove(pos);
            for stale in existing {
                info!(kind = %stale.kind, id = %stale.id, "removing conflicting record");
                self.delete_record_id(&stale.id)?;
            }
            if current.content == record.content && current.proxied == record.proxied {
                return Ok(current.id);
            }
            let path = format!("/zones/{}/dns_records/{}", self.zone_id, current.id);
            self.call::<Value>("PUT", &path, Some(&body))?;
            return Ok(current.id);
        }

        for other in existing {
            info!(kind = %other.kind, "replacing record of another type");
            self.delete_record_id(&other.id)?;
        }

        let created: Option<CfRecord> = self.call(
            "POST",
            &format!("/zones/{}/dns_records", self.zone_id),
            Some(&body),
        )?;
        created
            .map(|r| r.id)
            .ok_or_else(|| DeployError::DnsError(format!("no record returned for {}", record.name)))
    }

    fn delete_record(&self, name: &str, kind: RecordType) -> DeployResult<()> {
        let existing = self.list_records(name, &[kind])?;
        if existing.is_empty() {
            info!(record = name, %kind, "no DNS record to delete");
        }
        for record in existing {
            self.delete_record_id(&record.id)?;
            info!(record = name, %kind, "DNS record deleted");
        }
        Ok(())
    }
}

impl EdgeProvider for Cloudflare {
    fn check_prerequisites(&self) -> DeployResult<()> {
        if !cmd::command_exists("curl") {
            return Err(DeployError::PrerequisiteMissing(
                "curl is not installed".into(),
            ));
        }
        if self.token.expose_secret().is_empty() {
            return Err(DeployError::EnvMissing("CLOUDFLARE_API_TOKEN is empty".into()));
        }
        self.call::<Value>("GET", "/user/tokens/verify", None)?;
        Ok(())
    }

    fn issue_origin_certificate(
        &self,
        request: &CertificateRequest,
    ) -> DeployResult<OriginCertificate> {
        info!(hostnames = ?request.hostnames, days = request.validity_days, "issuing origin certificate");
        let body = json!({
            "csr": request.csr,
            "hostnames": request.hostnames,
            "request_type": "origin-ecc",
            "requested_validity": request.validity_days,
        });
        let cert: CfCertificate = self
            .call("POST", "/certificates", Some(&body))?
            .ok_or_else(|| DeployError::Certificate("issuer returned no certificate".into()))?;
        Ok(OriginCertificate {
            id: cert.id,
            certificate: cert.certificate,
            expires_on: cert.expires_on,
        })
    }

    fn revoke_origin_certificate(&self, id: &str) -> DeployResult<()> {
        info!(certificate = id, "revoking origin certificate");
        self.call::<Value>("DELETE", &format!("/certificates/{id}"), None)?;
        Ok(())
    }

    fn fetch_origin_pull_ca(&self) -> DeployResult<String> {
        let pem = cmd::run("curl", &["-sSfL", ORIGIN_PULL_CA_URL])?;
        if !pem.contains("BEGIN CERTIFICATE") {
            return Err(DeployError::Certificate(format!(
                "{ORIGIN_PULL_CA_URL} did not return a PEM certificate"
            )));
        }
        Ok(pem)
    }

    fn set_origin_pulls(&self, enabled: bool) -> DeployResult<()> {
        let value = if enabled { "on" } else { "off" };
        info!(value, "authenticated origin pulls");
        self.call::<Value>(
            "PATCH",
            &format!("/zones/{}/settings/tls_client_auth", self.zone_id),
            Some(&json!({ "value": value })),
        )?;
        Ok(())
    }

    fn apply_zone_tls_policy(&self, policy: &ZoneTlsPolicy) -> DeployResult<()> {
        let items: Vec<Value> = policy
            .settings()
            .into_iter()
            .map(|(id, value)| json!({ "id": id, "value": value }))
            .collect();
        info!(ssl = %policy.ssl, min_tls = %policy.min_tls_version, "applying zone TLS policy");
        self.call::<Value>(
            "PATCH",
            &format!("/zones/{}/settings", self.zone_id),
            Some(&json!({ "items": items })),
        )?;
        Ok(())
    }

    fn create_tunnel(&self, name: &str, secret: &SecretString) -> DeployResult<TunnelInfo> {
        for leftover in self.find_tunnels(name)? {
            warn!(tunnel = %leftover.name, id = %leftover.id, "replacing leftover tunnel");
            self.delete_tunnel(&leftover.id)?;
        }

        info!(tunnel = name, "creating tunnel");
        let body = json!({
            "name": name,
            "tunnel_secret": secret.expose_secret(),
            "config_src": "cloudflare",
        });
        let tunnel: CfTunnel = self
            .call(
                "POST",
                &format!("/accounts/{}/cfd_tunnel", self.account_id),
                Some(&body),
            )?
            .ok_or_else(|| DeployError::Other(format!("no tunnel returned for {name}")))?;
        Ok(TunnelInfo {
            id: tunnel.id,
            name: tunnel.name,
        })
    }

    fn configure_tunnel(&self, tunnel_id: &str, rules: &[IngressRule]) -> DeployResult<()> {
        self.call::<Value>(
            "PUT",
            &format!(
                "/accounts/{}/cfd_tunnel/{tunnel_id}/configurations",
                self.account_id
            ),
            Some(&json!({ "config": { "ingress": rules } })),
        )?;
        Ok(())
    }

    fn delete_tunnel(&self, tunnel_id: &str) -> DeployResult<()> {
        let live = self
            .list_tunnels(&format!("uuid={tunnel_id}"))?
            .iter()
            .any(|t| t.id == tunnel_id && t.deleted_at.is_none());
        if !live {
            debug!(tunnel = tunnel_id, "tunnel already gone");
            return Ok(());
        }

        let path = format!("/accounts/{}/cfd_tunnel/{tunnel_id}", self.account_id);
        if let Err(e) = self.call::<Value>("DELETE", &format!("{path}/connections"), None) {
            debug!(error = %e, "no tunnel connections to clean up");
        }
        self.call::<Value>("DELETE", &path, None)?;
        info!(tunnel = tunnel_id, "tunnel deleted");
        Ok(())
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }
}
