//! The deployment as a resource graph, and the driver that applies or
//! destroys it under the run lock.

pub mod reconcile;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::app::App;
use crate::caddyfile;
use crate::config::{Deployment, RemovalPolicy};
use crate::container::{ContainerSpec, HealthCheck, Mount, RestartPolicy};
use crate::deploy::docker_save::DockerSaveLoad;
use crate::deploy::{self, ImageBuilder};
use crate::edge::EdgeProvider;
use crate::edge::cloudflare::Cloudflare;
use crate::error::DeployResult;
use crate::graph::{self, Graph, Node, PlannedStep, Report};
use crate::ingress::origin::{self, CertPaths, ORIGIN_PULL_CA_URL};
use crate::ingress::{DirectProxy, Ingress, Tunnel, tunnel};
use crate::keys::{self, KeyGenerator, SshKeygen, WipeList};
use crate::provision::HostProvider;
use crate::provision::hetzner::Hetzner;
use crate::ssh::{Connector, SshConnector};
use crate::state::{State, StateStore};

use self::reconcile::{DeployReconciler, KeySession};

/// Resource kinds, which double as ids for the single-instance ones.
pub mod kind {
    pub const SSH_KEY: &str = "ssh-key";
    pub const PROVIDER_SSH_KEY: &str = "provider-ssh-key";
    pub const FIREWALL: &str = "firewall";
    pub const HOST: &str = "host";
    pub const FIREWALL_ATTACHMENT: &str = "firewall-attachment";
    pub const ENGINE_READY: &str = "engine-ready";
    pub const REMOTE_DIR: &str = "app-dir";
    pub const IMAGE: &str = "image";
    pub const VOLUME: &str = "volume";
    pub const NETWORK: &str = "network";
    pub const BUILD_CONTAINER: &str = "build-container";
    pub const CONTAINER: &str = "container";
    pub const ORIGIN_KEY: &str = "origin-key";
    pub const ORIGIN_CERTIFICATE: &str = "origin-certificate";
    pub const ORIGIN_PULLS: &str = "origin-pulls";
    pub const ZONE_TLS_POLICY: &str = "zone-tls-policy";
    pub const ORIGIN_PULL_CA: &str = "origin-pull-ca";
    pub const CERT_FILES: &str = "cert-files";
    pub const PROXY_CONFIG: &str = "proxy-config";
    pub const TUNNEL_SECRET: &str = "tunnel-secret";
    pub const TUNNEL: &str = "tunnel";
    pub const TUNNEL_CONFIG: &str = "tunnel-config";
    pub const TUNNEL_ENV_FILE: &str = "tunnel-env-file";
    pub const DNS_RECORD: &str = "dns-record";
}

/// Ids of the resources that are not named after their kind.
pub mod id {
    pub const VOLUME_BUILD: &str = "volume-build";
    pub const NETWORK_PUBLIC: &str = "network-public";
    pub const NETWORK_INTERNAL: &str = "network-internal";
    pub const APP_CONTAINER: &str = "app-container";
    pub const PROXY_CONTAINER: &str = "proxy-container";
    pub const TUNNEL_CONTAINER: &str = "tunnel-container";
}

/// How a long-running container is judged ready after it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Readiness {
    None,
    /// The engine's own health check.
    Engine,
    /// A command run inside the container.
    Exec { command: Vec<String> },
}

/// The external systems a deployment talks to.
pub struct Backends {
    pub hosts: Box<dyn HostProvider>,
    pub edge: Box<dyn EdgeProvider>,
    pub images: Box<dyn ImageBuilder>,
    pub connector: Box<dyn Connector>,
    pub keys: Box<dyn KeyGenerator>,
}

impl Backends {
    /// Hetzner, Cloudflare, local docker, ssh and ssh-keygen.
    pub fn live(deployment: &Deployment) -> DeployResult<Self> {
        Ok(Self {
            hosts: Box::new(Hetzner::new()),
            edge: Box::new(Cloudflare::from_env(
                &deployment.account_id,
                &deployment.zone_id,
            )?),
            images: Box::new(DockerSaveLoad::new()),
            connector: Box::new(SshConnector),
            keys: Box::new(SshKeygen),
        })
    }
}

/// Where the deployment can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub url: String,
    pub mode: String,
    pub host_address: String,
    /// What the DNS record points at.
    pub dns_target: Option<String>,
    pub tunnel_hostname: Option<String>,
}

impl Endpoint {
    /// Read back from recorded state; `None` before the first apply.
    #[must_use]
    pub fn from_state(deployment: &Deployment, state: &State) -> Option<Self> {
        let host_address = state.output(kind::HOST, "address")?.to_string();
        Some(Self {
            url: deployment.url(),
            mode: deployment.ingress.mode().to_string(),
            host_address,
            dns_target: state.output(kind::DNS_RECORD, "content").map(String::from),
            tunnel_hostname: state.output(kind::TUNNEL, "hostname").map(String::from),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub report: Report,
    pub endpoint: Option<Endpoint>,
    /// Non-fatal conditions, such as an ingress container that never
    /// became healthy.
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Teardown {
    /// Deleted resource ids, in deletion order.
    pub deleted: Vec<String>,
    /// Remote resources were left in place.
    pub retained: bool,
}

/// Declare every resource of `deployment` and how they depend on each
/// other.
pub fn build_graph(deployment: &Deployment) -> DeployResult<Graph> {
    use self::id::{
        APP_CONTAINER, NETWORK_INTERNAL, NETWORK_PUBLIC, PROXY_CONTAINER, TUNNEL_CONTAINER,
        VOLUME_BUILD,
    };
    use self::kind::{
        BUILD_CONTAINER, CERT_FILES, CONTAINER, DNS_RECORD, ENGINE_READY, FIREWALL,
        FIREWALL_ATTACHMENT, HOST, IMAGE, NETWORK, ORIGIN_CERTIFICATE, ORIGIN_KEY,
        ORIGIN_PULL_CA, ORIGIN_PULLS, PROXY_CONFIG, PROVIDER_SSH_KEY, REMOTE_DIR, SSH_KEY,
        TUNNEL, TUNNEL_CONFIG, TUNNEL_ENV_FILE, TUNNEL_SECRET, VOLUME, ZONE_TLS_POLICY,
    };

    let app = &deployment.app;
    let mut g = Graph::new();

    // Keys and host
    g.add(Node::new(
        SSH_KEY,
        SSH_KEY,
        json!({ "algorithm": deployment.key_algorithm.as_str() }),
    ))?;
    g.add(
        Node::new(
            PROVIDER_SSH_KEY,
            PROVIDER_SSH_KEY,
            json!({ "name": deployment.resource_name() }),
        )
        .uses(&[SSH_KEY]),
    )?;
    g.add(Node::new(
        FIREWALL,
        FIREWALL,
        serde_json::to_value(deployment.firewall_policy())?,
    ))?;
    g.add(
        Node::new(HOST, HOST, serde_json::to_value(deployment.host_spec())?)
            .uses(&[PROVIDER_SSH_KEY]),
    )?;
    g.add(Node::new(FIREWALL_ATTACHMENT, FIREWALL_ATTACHMENT, json!({})).uses(&[FIREWALL, HOST]))?;
    g.add(
        Node::new(ENGINE_READY, ENGINE_READY, json!({}))
            .after(&[HOST, FIREWALL_ATTACHMENT])
            .ephemeral(),
    )?;
    g.add(
        Node::new(
            REMOTE_DIR,
            REMOTE_DIR,
            json!({ "path": deployment.remote_dir }),
        )
        .uses(&[HOST])
        .after(&[ENGINE_READY]),
    )?;

    // Image, volume, networks, containers
    g.add(
        Node::new(IMAGE, IMAGE, image_inputs(app)?)
            .uses(&[HOST])
            .after(&[ENGINE_READY]),
    )?;
    g.add(
        Node::new(VOLUME_BUILD, VOLUME, json!({ "name": app.build_volume() }))
            .uses(&[HOST])
            .after(&[ENGINE_READY]),
    )?;
    g.add(
        Node::new(NETWORK_PUBLIC, NETWORK, json!({ "name": app.public_network() }))
            .uses(&[HOST])
            .after(&[ENGINE_READY]),
    )?;
    g.add(
        Node::new(
            NETWORK_INTERNAL,
            NETWORK,
            json!({ "name": app.internal_network() }),
        )
        .uses(&[HOST])
        .after(&[ENGINE_READY]),
    )?;
    g.add(
        Node::new(
            BUILD_CONTAINER,
            BUILD_CONTAINER,
            json!({ "spec": build_container(app), "readiness": Readiness::None }),
        )
        .uses(&[IMAGE, VOLUME_BUILD]),
    )?;
    g.add(
        Node::new(
            APP_CONTAINER,
            CONTAINER,
            json!({ "spec": app_container(app), "readiness": Readiness::None }),
        )
        .uses(&[
            IMAGE,
            VOLUME_BUILD,
            NETWORK_PUBLIC,
            NETWORK_INTERNAL,
            BUILD_CONTAINER,
        ]),
    )?;

    // Ingress
    let domain = deployment.domain.as_str();
    match &deployment.ingress {
        Ingress::DirectProxy(proxy) => {
            let certs = CertPaths::new(&deployment.remote_dir);

            g.add(Node::new(
                ORIGIN_KEY,
                ORIGIN_KEY,
                json!({ "organization": proxy.organization, "algorithm": "ecdsa-p256" }),
            ))?;
            g.add(
                Node::new(
                    ORIGIN_CERTIFICATE,
                    ORIGIN_CERTIFICATE,
                    json!({
                        "hostnames": origin::origin_hostnames(domain),
                        "validity_days": proxy.validity_days,
                        "request_type": "origin-ecc",
                    }),
                )
                .uses(&[ORIGIN_KEY]),
            )?;
            g.add(Node::new(ORIGIN_PULLS, ORIGIN_PULLS, json!({ "enabled": true })))?;
            g.add(Node::new(
                ZONE_TLS_POLICY,
                ZONE_TLS_POLICY,
                serde_json::to_value(&proxy.zone_tls)?,
            ))?;
            g.add(Node::new(
                ORIGIN_PULL_CA,
                ORIGIN_PULL_CA,
                json!({ "url": ORIGIN_PULL_CA_URL }),
            ))?;
            g.add(
                Node::new(CERT_FILES, CERT_FILES, json!({ "dir": certs.host_dir }))
                    .uses(&[ORIGIN_KEY, ORIGIN_CERTIFICATE, ORIGIN_PULL_CA, HOST])
                    .after(&[REMOTE_DIR, ENGINE_READY]),
            )?;
            g.add(
                Node::new(
                    PROXY_CONFIG,
                    PROXY_CONFIG,
                    json!({
                        "path": DirectProxy::config_path(&deployment.remote_dir),
                        "content": caddyfile::render(&proxy.caddy(app, &certs), domain),
                    }),
                )
                .uses(&[HOST])
                .after(&[REMOTE_DIR, ENGINE_READY]),
            )?;
            g.add(
                Node::new(
                    PROXY_CONTAINER,
                    CONTAINER,
                    json!({
                        "spec": proxy.container(app, &deployment.remote_dir),
                        "readiness": Readiness::Engine,
                    }),
                )
                .uses(&[NETWORK_PUBLIC, CERT_FILES, PROXY_CONFIG])
                .after(&[APP_CONTAINER, ORIGIN_PULLS, ZONE_TLS_POLICY]),
            )?;
            g.add(
                Node::new(
                    DNS_RECORD,
                    DNS_RECORD,
                    json!({ "name": domain, "type": "A", "proxied": true }),
                )
                .uses(&[HOST])
                .after(&[PROXY_CONTAINER]),
            )?;
        }
        Ingress::Tunnel(agent) => {
            g.add(Node::new(TUNNEL_SECRET, TUNNEL_SECRET, json!({})))?;
            g.add(
                Node::new(
                    TUNNEL,
                    TUNNEL,
                    json!({ "name": deployment.tunnel_name() }),
                )
                .uses(&[TUNNEL_SECRET]),
            )?;
            g.add(
                Node::new(
                    TUNNEL_CONFIG,
                    TUNNEL_CONFIG,
                    json!({ "rules": tunnel::ingress_rules(domain, &Tunnel::service_url(app)) }),
                )
                .uses(&[TUNNEL]),
            )?;
            g.add(
                Node::new(
                    TUNNEL_ENV_FILE,
                    TUNNEL_ENV_FILE,
                    json!({ "path": Tunnel::env_file_path(&deployment.remote_dir) }),
                )
                .uses(&[TUNNEL, TUNNEL_SECRET, HOST])
                .after(&[REMOTE_DIR, ENGINE_READY]),
            )?;
            g.add(
                Node::new(
                    TUNNEL_CONTAINER,
                    CONTAINER,
                    json!({
                        "spec": agent.container(app, &deployment.remote_dir),
                        "readiness": Readiness::Exec { command: agent.ready_command() },
                    }),
                )
                .uses(&[NETWORK_PUBLIC, TUNNEL_ENV_FILE])
                .after(&[APP_CONTAINER, TUNNEL_CONFIG]),
            )?;
            g.add(
                Node::new(
                    DNS_RECORD,
                    DNS_RECORD,
                    json!({ "name": domain, "type": "CNAME", "proxied": true }),
                )
                .uses(&[TUNNEL])
                .after(&[TUNNEL_CONTAINER]),
            )?;
        }
    }

    Ok(g)
}

/// Image identity: the build context's content plus everything else
/// that changes what `docker build` produces.
fn image_inputs(app: &App) -> DeployResult<Value> {
    Ok(json!({
        "tag": app.image_tag(),
        "context_digest": deploy::context_digest(&app.context, &app.dockerfile)?,
        "dockerfile": app.dockerfile,
        "target": app.target,
        "platform": app.platform,
        "build_args": app.build_args,
    }))
}

/// The one-shot container that writes build output into the volume.
#[must_use]
pub fn build_container(app: &App) -> ContainerSpec {
    let mut spec = ContainerSpec::new(&app.build_container(), &app.image_tag())
        .mount(Mount::volume(&app.build_volume(), &app.build_output))
        .command(&app.build_command)
        .one_shot();
    for (k, v) in &app.env {
        spec = spec.env(k, v);
    }
    spec
}

/// The long-running app, on both networks, sharing the build volume.
#[must_use]
pub fn app_container(app: &App) -> ContainerSpec {
    let mut spec = ContainerSpec::new(&app.name, &app.image_tag())
        .mount(Mount::volume(&app.build_volume(), &app.build_output))
        .network(&app.public_network())
        .network(&app.internal_network())
        .command(&app.start_command)
        .restart(RestartPolicy::Always);
    if let Some(test) = &app.healthcheck {
        spec = spec.healthcheck(HealthCheck::new(test));
    }
    for (k, v) in &app.env {
        spec = spec.env(k, v);
    }
    spec
}

/// Applies, plans, and destroys one deployment.
pub struct Workflow<'a> {
    deployment: &'a Deployment,
    backends: &'a Backends,
    store: StateStore,
    wipe: WipeList,
}

impl<'a> Workflow<'a> {
    #[must_use]
    pub fn new(deployment: &'a Deployment, backends: &'a Backends) -> Self {
        Self {
            deployment,
            backends,
            store: StateStore::new(&deployment.state_dir, &deployment.name, &deployment.stage),
            wipe: WipeList::new(),
        }
    }

    /// Share the list of paths to wipe, e.g. with a Ctrl-C handler.
    #[must_use]
    pub fn with_wipe_list(mut self, wipe: WipeList) -> Self {
        self.wipe = wipe;
        self
    }

    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn state(&self) -> DeployResult<State> {
        self.store.load()
    }

    /// Converge the deployment. Safe to re-run: unchanged resources
    /// are left alone.
    pub fn apply(&self) -> DeployResult<Outcome> {
        self.deployment.validate()?;
        let _lock = self.store.lock()?;

        self.backends.hosts.check_prerequisites()?;
        self.backends.edge.check_prerequisites()?;

        let graph = build_graph(self.deployment)?;
        let mut state = self.store.load()?;

        info!(
            deployment = %self.deployment.resource_name(),
            mode = self.deployment.ingress.mode(),
            "applying"
        );

        let mut reconciler = self.reconciler();
        let store = &self.store;
        let report = graph.apply(&mut state, &mut reconciler, &mut |s| store.save(s))?;
        let warnings = reconciler.take_warnings();
        drop(reconciler);

        store.save(&state)?;
        info!(
            created = report.created.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            unchanged = report.unchanged.len(),
            "apply complete"
        );

        Ok(Outcome {
            report,
            endpoint: Endpoint::from_state(self.deployment, &state),
            warnings,
        })
    }

    /// What apply would do, without side effects.
    pub fn plan(&self) -> DeployResult<Vec<PlannedStep>> {
        self.deployment.validate()?;
        let graph = build_graph(self.deployment)?;
        graph.plan(&self.store.load()?)
    }

    /// Remove everything: DNS first, then containers, then host-level
    /// resources, and local key material last.
    pub fn destroy(&self) -> DeployResult<Teardown> {
        let _lock = self.store.lock()?;
        let mut state = self.store.load()?;

        let teardown = if self.deployment.removal_policy() == RemovalPolicy::Retain {
            warn!(
                stage = %self.deployment.stage,
                resources = state.resources.len(),
                "removal policy is retain: remote resources are left in place"
            );
            Teardown {
                deleted: Vec::new(),
                retained: true,
            }
        } else {
            self.backends.hosts.check_prerequisites()?;
            self.backends.edge.check_prerequisites()?;

            let mut reconciler = self.reconciler();
            let store = &self.store;
            let deleted = graph::destroy(&mut state, &mut reconciler, &mut |s| store.save(s))?;
            Teardown {
                deleted,
                retained: false,
            }
        };

        self.store.clear()?;
        for path in keys::sweep_key_files(&self.deployment.state_dir, &self.deployment.resource_name())? {
            info!(path = %path.display(), "removed leftover key file");
        }
        info!(deployment = %self.deployment.resource_name(), "destroyed");
        Ok(teardown)
    }

    /// `docker ps` on the host.
    pub fn status(&self) -> DeployResult<String> {
        let state = self.store.load()?;
        let mut session = KeySession::new(self.deployment, self.wipe.clone());
        let remote = session.require_remote(self.backends.connector.as_ref(), &state)?;
        remote.run("docker ps --format 'table {{.Names}}\\t{{.Image}}\\t{{.Status}}'")
    }

    /// The recorded endpoint, if the deployment has been applied.
    pub fn endpoint(&self) -> DeployResult<Option<Endpoint>> {
        Ok(Endpoint::from_state(self.deployment, &self.store.load()?))
    }

    fn reconciler(&self) -> DeployReconciler<'a> {
        DeployReconciler::new(self.deployment, self.backends, self.wipe.clone())
    }
}
