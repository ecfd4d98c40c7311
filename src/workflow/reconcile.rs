//! What each resource kind means against the real systems.

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::kind::{
    BUILD_CONTAINER, CERT_FILES, CONTAINER, DNS_RECORD, ENGINE_READY, FIREWALL,
    FIREWALL_ATTACHMENT, HOST, IMAGE, NETWORK, ORIGIN_CERTIFICATE, ORIGIN_KEY, ORIGIN_PULL_CA,
    ORIGIN_PULLS, PROVIDER_SSH_KEY, PROXY_CONFIG, REMOTE_DIR, SSH_KEY, TUNNEL, TUNNEL_CONFIG,
    TUNNEL_ENV_FILE, TUNNEL_SECRET, VOLUME, ZONE_TLS_POLICY,
};
use super::{Backends, Readiness};
use crate::config::{self, Deployment};
use crate::container::{ContainerSpec, DockerEngine, Health};
use crate::deploy::BuiltImage;
use crate::dns::{DnsRecord, RecordType};
use crate::edge::{CertificateRequest, ZoneTlsPolicy, tunnel_hostname};
use crate::error::{DeployError, DeployResult};
use crate::graph::{Node, Reconciler};
use crate::ingress::origin::{self, CertPaths};
use crate::ingress::tunnel::{self, IngressRule};
use crate::keys::{self, KeyAlgorithm, WipeGuard, WipeList};
use crate::provision::{FirewallPolicy, HostSpec};
use crate::ssh::{self, Connection, Connector, RemoteExec, shell_quote};
use crate::state::{Record, State};

/// Map a failure to the error class of the resource kind that raised
/// it. Errors that already carry a class keep it.
#[must_use]
pub fn classify(kind: &str, err: DeployError) -> DeployError {
    if err.root().is_classified() {
        return err;
    }
    let msg = err.to_string();
    match kind {
        SSH_KEY => DeployError::KeyGeneration(msg),
        PROVIDER_SSH_KEY | FIREWALL | HOST | FIREWALL_ATTACHMENT | TUNNEL | TUNNEL_CONFIG => {
            DeployError::Provisioning(msg)
        }
        ENGINE_READY => DeployError::Connectivity(msg),
        IMAGE | BUILD_CONTAINER => DeployError::Build(msg),
        ORIGIN_KEY | ORIGIN_CERTIFICATE | ORIGIN_PULLS | ORIGIN_PULL_CA | ZONE_TLS_POLICY
        | CERT_FILES => DeployError::Certificate(msg),
        DNS_RECORD => DeployError::DnsError(msg),
        _ => err,
    }
}

/// The deployment's private key, written to disk only while a run
/// needs to reach the host, and wiped when the session drops.
pub struct KeySession {
    state_dir: PathBuf,
    resource_name: String,
    ssh_user: String,
    wipe: WipeList,
    guard: Option<WipeGuard>,
}

impl KeySession {
    #[must_use]
    pub fn new(deployment: &Deployment, wipe: WipeList) -> Self {
        Self {
            state_dir: deployment.state_dir.clone(),
            resource_name: deployment.resource_name(),
            ssh_user: deployment.ssh_user.clone(),
            wipe,
            guard: None,
        }
    }

    /// Path of the key file, writing it on first use.
    pub fn key_file(&mut self, state: &State) -> DeployResult<PathBuf> {
        if let Some(guard) = &self.guard {
            return Ok(guard.path().to_path_buf());
        }

        let algorithm: KeyAlgorithm = state.require(SSH_KEY, "algorithm")?.parse()?;
        let private_key = SecretString::from(state.require(SSH_KEY, "private_key")?.to_string());
        let path = keys::key_path(
            &self.state_dir,
            algorithm,
            &format!("{}_{}", self.resource_name, keys::random_suffix()),
        );

        // Registered before the write so an interrupt cannot leak it.
        let guard = self.wipe.schedule_wipe(&path);
        keys::persist_private_key(&private_key, &path)?;
        self.guard = Some(guard);
        Ok(path)
    }

    /// Wipe the key file now; the next use writes a fresh one.
    pub fn reset(&mut self) {
        self.guard = None;
    }

    /// Connection to the recorded host, if there is one.
    pub fn connection(&mut self, state: &State) -> DeployResult<Option<Connection>> {
        let Some(address) = state.output(HOST, "address") else {
            return Ok(None);
        };
        if !state.contains(SSH_KEY) {
            return Ok(None);
        }
        let address = address.to_string();
        let key = self.key_file(state)?;
        Ok(Some(Connection::new(&address, &self.ssh_user).with_key(&key)))
    }

    pub fn require_remote(
        &mut self,
        connector: &dyn Connector,
        state: &State,
    ) -> DeployResult<Box<dyn RemoteExec>> {
        self.connection(state)?
            .map(|c| connector.connect(&c))
            .ok_or_else(|| DeployError::Connectivity("no host has been provisioned".into()))
    }
}

pub struct DeployReconciler<'a> {
    deployment: &'a Deployment,
    backends: &'a Backends,
    keys: KeySession,
    warnings: Vec<String>,
}

#[derive(Deserialize)]
struct ContainerInputs {
    spec: ContainerSpec,
    readiness: Readiness,
}

impl<'a> DeployReconciler<'a> {
    #[must_use]
    pub fn new(deployment: &'a Deployment, backends: &'a Backends, wipe: WipeList) -> Self {
        Self {
            deployment,
            backends,
            keys: KeySession::new(deployment, wipe),
            warnings: Vec::new(),
        }
    }

    /// Non-fatal conditions gathered during the run.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    fn remote(&mut self, state: &State) -> DeployResult<Box<dyn RemoteExec>> {
        let connector = self.backends.connector.as_ref();
        self.keys.require_remote(connector, state)
    }

    /// The host may already be gone when tearing down.
    fn remote_if_any(&mut self, state: &State) -> DeployResult<Option<Box<dyn RemoteExec>>> {
        let connector = self.backends.connector.as_ref();
        Ok(self.keys.connection(state)?.map(|c| connector.connect(&c)))
    }

    fn input_str<'n>(node: &'n Node, key: &str) -> DeployResult<&'n str> {
        node.inputs.get(key).and_then(Value::as_str).ok_or_else(|| {
            DeployError::Other(format!("resource '{}' is missing input '{key}'", node.id))
        })
    }

    fn create_kind(&mut self, node: &Node, state: &State) -> DeployResult<Value> {
        let backends = self.backends;
        match node.kind.as_str() {
            SSH_KEY => {
                let algorithm = self.deployment.key_algorithm;
                let pair = backends
                    .keys
                    .generate(algorithm, &self.deployment.resource_name())?;
                self.keys.reset();
                Ok(json!({
                    "algorithm": algorithm.as_str(),
                    "public_key": pair.public_key,
                    "private_key": pair.private_key().expose_secret(),
                }))
            }
            PROVIDER_SSH_KEY => {
                let name = Self::input_str(node, "name")?;
                let public_key = state.require(SSH_KEY, "public_key")?;
                let id = backends.hosts.register_ssh_key(name, public_key)?;
                Ok(json!({ "id": id, "name": name }))
            }
            FIREWALL => {
                let policy: FirewallPolicy = serde_json::from_value(node.inputs.clone())?;
                let id = backends.hosts.create_firewall(&policy)?;
                Ok(json!({ "id": id, "name": policy.name }))
            }
            HOST => {
                let mut spec: HostSpec = serde_json::from_value(node.inputs.clone())?;
                spec.ssh_keys = vec![state.require(PROVIDER_SSH_KEY, "name")?.to_string()];
                let host = backends.hosts.create_host(&spec)?;
                info!(host = %host.name, address = %host.address, "host ready");
                Ok(serde_json::to_value(host)?)
            }
            FIREWALL_ATTACHMENT => {
                let firewall = state.require(FIREWALL, "name")?;
                let host = state.require(HOST, "name")?;
                backends.hosts.attach_firewall(firewall, host).map_err(|e| {
                    DeployError::Provisioning(format!(
                        "firewall '{firewall}' could not be attached to '{host}'; \
                         the host remains reachable with its default rules: {e}"
                    ))
                })?;
                Ok(json!({ "firewall": firewall, "host": host }))
            }
            ENGINE_READY => {
                let remote = self.remote(state)?;
                ssh::wait_until_ready(remote.as_ref(), &self.deployment.readiness)?;
                Ok(Value::Null)
            }
            REMOTE_DIR => {
                let path = Self::input_str(node, "path")?;
                let remote = self.remote(state)?;
                remote.run(&format!("mkdir -p {}", shell_quote(path)))?;
                Ok(json!({ "path": path }))
            }
            IMAGE => {
                let image = backends.images.build(&self.deployment.app)?;
                let connection = self.keys.connection(state)?.ok_or_else(|| {
                    DeployError::Connectivity("no host to transfer the image to".into())
                })?;
                backends.images.transfer(&image, &connection)?;
                Ok(serde_json::to_value(image)?)
            }
            VOLUME => {
                let name = Self::input_str(node, "name")?;
                let remote = self.remote(state)?;
                DockerEngine::new(remote.as_ref()).ensure_volume(name)?;
                Ok(json!({ "name": name }))
            }
            NETWORK => {
                let name = Self::input_str(node, "name")?;
                let remote = self.remote(state)?;
                DockerEngine::new(remote.as_ref()).ensure_network(name)?;
                Ok(json!({ "name": name }))
            }
            BUILD_CONTAINER => {
                let inputs: ContainerInputs = serde_json::from_value(node.inputs.clone())?;
                let remote = self.remote(state)?;
                DockerEngine::new(remote.as_ref()).run_to_completion(&inputs.spec)?;
                Ok(json!({ "name": inputs.spec.name }))
            }
            CONTAINER => {
                let inputs: ContainerInputs = serde_json::from_value(node.inputs.clone())?;
                let remote = self.remote(state)?;
                let engine = DockerEngine::new(remote.as_ref());
                let id = engine.run_detached(&inputs.spec)?;
                self.check_readiness(&engine, &inputs);
                Ok(json!({ "name": inputs.spec.name, "id": id }))
            }
            ORIGIN_KEY => {
                let organization = Self::input_str(node, "organization")?;
                let key = origin::generate_origin_key(organization)?;
                Ok(json!({
                    "key_pem": key.key_pem.expose_secret(),
                    "csr_pem": key.csr_pem,
                }))
            }
            ORIGIN_CERTIFICATE => {
                #[derive(Deserialize)]
                struct Inputs {
                    hostnames: Vec<String>,
                    validity_days: u32,
                }
                let inputs: Inputs = serde_json::from_value(node.inputs.clone())?;
                let request = CertificateRequest {
                    csr: state.require(ORIGIN_KEY, "csr_pem")?.to_string(),
                    hostnames: inputs.hostnames,
                    validity_days: inputs.validity_days,
                };
                let cert = backends.edge.issue_origin_certificate(&request)?;
                info!(id = %cert.id, expires_on = ?cert.expires_on, "origin certificate issued");
                Ok(serde_json::to_value(cert)?)
            }
            ORIGIN_PULLS => {
                backends.edge.set_origin_pulls(true)?;
                Ok(json!({ "enabled": true }))
            }
            ZONE_TLS_POLICY => {
                let policy: ZoneTlsPolicy = serde_json::from_value(node.inputs.clone())?;
                backends.edge.apply_zone_tls_policy(&policy)?;
                Ok(serde_json::to_value(policy)?)
            }
            ORIGIN_PULL_CA => {
                let pem = backends.edge.fetch_origin_pull_ca()?;
                Ok(json!({ "pem": pem }))
            }
            CERT_FILES => {
                let certs = CertPaths::new(&self.deployment.remote_dir);
                let key = state.require(ORIGIN_KEY, "key_pem")?;
                let cert = state.require(ORIGIN_CERTIFICATE, "certificate")?;
                let ca = state.require(ORIGIN_PULL_CA, "pem")?;
                let remote = self.remote(state)?;
                remote.write_file(key.as_bytes(), &certs.on_host(CertPaths::KEY), 0o600)?;
                remote.write_file(cert.as_bytes(), &certs.on_host(CertPaths::CERT), 0o644)?;
                remote.write_file(ca.as_bytes(), &certs.on_host(CertPaths::CA), 0o644)?;
                Ok(json!({ "dir": certs.host_dir }))
            }
            PROXY_CONFIG => {
                let path = Self::input_str(node, "path")?;
                let content = Self::input_str(node, "content")?;
                let remote = self.remote(state)?;
                remote.write_file(content.as_bytes(), path, 0o644)?;
                Ok(json!({ "path": path }))
            }
            TUNNEL_SECRET => {
                let secret = keys::generate_tunnel_secret()?;
                Ok(json!({ "secret": secret.expose_secret() }))
            }
            TUNNEL => {
                let name = Self::input_str(node, "name")?;
                let secret = SecretString::from(state.require(TUNNEL_SECRET, "secret")?.to_string());
                let info = backends.edge.create_tunnel(name, &secret)?;
                info!(tunnel = %info.name, id = %info.id, "tunnel created");
                Ok(json!({
                    "id": info.id,
                    "name": info.name,
                    "hostname": tunnel_hostname(&info.id),
                }))
            }
            TUNNEL_CONFIG => {
                #[derive(Deserialize)]
                struct Inputs {
                    rules: Vec<IngressRule>,
                }
                let inputs: Inputs = serde_json::from_value(node.inputs.clone())?;
                let tunnel_id = state.require(TUNNEL, "id")?;
                backends.edge.configure_tunnel(tunnel_id, &inputs.rules)?;
                Ok(json!({ "rules": inputs.rules.len() }))
            }
            TUNNEL_ENV_FILE => {
                let path = Self::input_str(node, "path")?;
                let secret = SecretString::from(state.require(TUNNEL_SECRET, "secret")?.to_string());
                let token = tunnel::tunnel_token(
                    backends.edge.account_id(),
                    state.require(TUNNEL, "id")?,
                    &secret,
                )?;
                let env = tunnel::agent_env_file(&token);
                let remote = self.remote(state)?;
                remote.write_file(env.expose_secret().as_bytes(), path, 0o600)?;
                Ok(json!({ "path": path }))
            }
            DNS_RECORD => {
                let name = Self::input_str(node, "name")?;
                let record = match Self::input_str(node, "type")? {
                    "A" => DnsRecord::a(name, state.require(HOST, "address")?),
                    "CNAME" => DnsRecord::cname(name, state.require(TUNNEL, "hostname")?),
                    other => {
                        return Err(DeployError::DnsError(format!(
                            "unsupported record type '{other}'"
                        )));
                    }
                };
                let id = backends.edge.upsert_record(&record)?;
                info!(name = %record.name, kind = %record.kind, content = %record.content, "DNS record set");
                Ok(json!({
                    "id": id,
                    "name": record.name,
                    "type": record.kind.as_str(),
                    "content": record.content,
                }))
            }
            other => Err(DeployError::Other(format!("unknown resource kind '{other}'"))),
        }
    }

    fn check_readiness(&mut self, engine: &DockerEngine<'_>, inputs: &ContainerInputs) {
        let budget = self.deployment.ingress.health_budget();
        let name = &inputs.spec.name;
        let health = match &inputs.readiness {
            Readiness::None => return,
            Readiness::Engine => engine.wait_healthy(name, &budget),
            Readiness::Exec { command } => engine.wait_exec_ready(name, command, &budget),
        };
        match health {
            Health::Healthy | Health::NoHealthcheck => {
                info!(container = %name, "container ready");
            }
            Health::Unhealthy => {
                self.warnings
                    .push(format!("container '{name}' reported unhealthy"));
            }
            Health::TimedOut(last) => {
                self.warnings.push(format!(
                    "container '{name}' not ready after {} attempts: {last}",
                    budget.attempts
                ));
            }
        }
    }

    fn delete_kind(&mut self, id: &str, record: &Record, state: &State) -> DeployResult<()> {
        let backends = self.backends;
        let output = |key: &str| {
            record.output(key).map(String::from).ok_or_else(|| {
                DeployError::Other(format!("resource '{id}' has no recorded '{key}'"))
            })
        };

        match record.kind.as_str() {
            SSH_KEY => {
                self.keys.reset();
                info!("deployment key discarded");
            }
            PROVIDER_SSH_KEY => backends.hosts.delete_ssh_key(&output("name")?)?,
            FIREWALL => backends.hosts.delete_firewall(&output("name")?)?,
            HOST => backends.hosts.delete_host(&output("name")?)?,
            FIREWALL_ATTACHMENT => backends
                .hosts
                .detach_firewall(&output("firewall")?, &output("host")?)?,
            REMOTE_DIR => {
                let path = output("path")?;
                config::check_remote_dir(&path)?;
                if let Some(remote) = self.remote_if_any(state)? {
                    remote.run(&format!("rm -rf {}", shell_quote(&path)))?;
                }
            }
            IMAGE => {
                let image: BuiltImage = serde_json::from_value(record.outputs.clone())?;
                if let Some(remote) = self.remote_if_any(state)? {
                    DockerEngine::new(remote.as_ref()).remove_image(&image.tag)?;
                }
            }
            VOLUME => {
                if let Some(remote) = self.remote_if_any(state)? {
                    DockerEngine::new(remote.as_ref()).remove_volume(&output("name")?)?;
                }
            }
            NETWORK => {
                if let Some(remote) = self.remote_if_any(state)? {
                    DockerEngine::new(remote.as_ref()).remove_network(&output("name")?)?;
                }
            }
            BUILD_CONTAINER | CONTAINER => {
                if let Some(remote) = self.remote_if_any(state)? {
                    DockerEngine::new(remote.as_ref()).remove(&output("name")?)?;
                }
            }
            ORIGIN_CERTIFICATE => backends.edge.revoke_origin_certificate(&output("id")?)?,
            ORIGIN_PULLS => backends.edge.set_origin_pulls(false)?,
            ZONE_TLS_POLICY => {
                info!("zone TLS policy left in place");
            }
            CERT_FILES => {
                let dir = output("dir")?;
                if let Some(remote) = self.remote_if_any(state)? {
                    let files = [CertPaths::KEY, CertPaths::CERT, CertPaths::CA]
                        .iter()
                        .map(|f| shell_quote(&format!("{}/{f}", dir.trim_end_matches('/'))))
                        .collect::<Vec<_>>()
                        .join(" ");
                    remote.run(&format!("rm -f {files}"))?;
                }
            }
            PROXY_CONFIG | TUNNEL_ENV_FILE => {
                if let Some(remote) = self.remote_if_any(state)? {
                    remote.run(&format!("rm -f {}", shell_quote(&output("path")?)))?;
                }
            }
            TUNNEL => backends.edge.delete_tunnel(&output("id")?)?,
            DNS_RECORD => {
                let kind: RecordType = serde_json::from_value(record.outputs["type"].clone())?;
                backends.edge.delete_record(&output("name")?, kind)?;
            }
            // Local material, or gone along with its owner.
            ENGINE_READY | ORIGIN_KEY | ORIGIN_PULL_CA | TUNNEL_SECRET | TUNNEL_CONFIG => {}
            other => {
                warn!(id, kind = other, "unknown resource kind; dropping from state");
            }
        }
        Ok(())
    }
}

impl Reconciler for DeployReconciler<'_> {
    fn create(&mut self, node: &Node, state: &State) -> DeployResult<Value> {
        self.create_kind(node, state)
            .map_err(|e| classify(&node.kind, e))
    }

    fn update(&mut self, node: &Node, previous: &Record, state: &State) -> DeployResult<Value> {
        match node.kind.as_str() {
            // Replaced outright.
            SSH_KEY | HOST | ORIGIN_KEY | ORIGIN_PULL_CA | TUNNEL_SECRET | TUNNEL => {
                self.delete(&node.id, previous, state)?;
                self.create(node, state)
            }
            // New certificate first, so the proxy is never without one.
            ORIGIN_CERTIFICATE => {
                let outputs = self.create(node, state)?;
                if let Some(old) = previous.output("id") {
                    if let Err(e) = self.backends.edge.revoke_origin_certificate(old) {
                        warn!(id = old, error = %e, "previous origin certificate not revoked");
                    }
                }
                Ok(outputs)
            }
            // Everything else converges in place.
            _ => self.create(node, state),
        }
    }

    fn delete(&mut self, id: &str, record: &Record, state: &State) -> DeployResult<()> {
        self.delete_kind(id, record, state)
            .map_err(|e| classify(&record.kind, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_are_classified_by_kind() {
        let raw = || DeployError::Other("boom".into());
        assert!(matches!(classify(SSH_KEY, raw()), DeployError::KeyGeneration(_)));
        assert!(matches!(classify(HOST, raw()), DeployError::Provisioning(_)));
        assert!(matches!(classify(TUNNEL, raw()), DeployError::Provisioning(_)));
        assert!(matches!(classify(ENGINE_READY, raw()), DeployError::Connectivity(_)));
        assert!(matches!(classify(IMAGE, raw()), DeployError::Build(_)));
        assert!(matches!(classify(CERT_FILES, raw()), DeployError::Certificate(_)));
        assert!(matches!(classify(DNS_RECORD, raw()), DeployError::DnsError(_)));
        assert!(matches!(classify(CONTAINER, raw()), DeployError::Other(_)));
    }

    #[test]
    fn classified_errors_keep_their_class() {
        let err = classify(DNS_RECORD, DeployError::Connectivity("ssh".into()));
        assert!(matches!(err, DeployError::Connectivity(_)));
    }
}
