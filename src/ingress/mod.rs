//! The two ways traffic reaches the app. Exactly one is active per
//! deployment.

pub mod origin;
pub mod tunnel;

use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::caddy::Caddy;
use crate::container::{ContainerSpec, HealthCheck, Mount, RestartPolicy};
use crate::edge::ZoneTlsPolicy;
use crate::ingress::origin::{CertPaths, DEFAULT_VALIDITY_DAYS};
use crate::ssh::Probe;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Ingress {
    /// Reverse proxy on 443 terminating TLS with an origin certificate
    /// and only accepting the edge's client certificate.
    DirectProxy(DirectProxy),
    /// Outbound-only tunnel agent; no inbound port besides SSH.
    Tunnel(Tunnel),
}

impl Default for Ingress {
    fn default() -> Self {
        Self::DirectProxy(DirectProxy::default())
    }
}

impl Ingress {
    #[must_use]
    pub fn direct_proxy() -> Self {
        Self::DirectProxy(DirectProxy::default())
    }

    #[must_use]
    pub fn tunnel() -> Self {
        Self::Tunnel(Tunnel::default())
    }

    #[must_use]
    pub const fn mode(&self) -> &'static str {
        match self {
            Self::DirectProxy(_) => "direct-proxy",
            Self::Tunnel(_) => "tunnel",
        }
    }

    /// Whether the host must accept inbound HTTPS.
    #[must_use]
    pub const fn needs_inbound_https(&self) -> bool {
        matches!(self, Self::DirectProxy(_))
    }

    /// Budget for waiting on the ingress container after it starts.
    #[must_use]
    pub const fn health_budget(&self) -> Probe {
        match self {
            Self::DirectProxy(p) => p.health_budget,
            Self::Tunnel(t) => t.health_budget,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectProxy {
    pub proxy_image: String,
    pub https_port: u16,
    /// Subject organisation of the origin certificate request.
    pub organization: String,
    pub validity_days: u32,
    pub zone_tls: ZoneTlsPolicy,
    pub healthcheck: HealthCheck,
    pub health_budget: Probe,
    pub security_headers: bool,
}

impl Default for DirectProxy {
    fn default() -> Self {
        Self {
            proxy_image: "caddy:2-alpine".to_string(),
            https_port: 443,
            organization: "Trebuchet Origin".to_string(),
            validity_days: DEFAULT_VALIDITY_DAYS,
            zone_tls: ZoneTlsPolicy::default(),
            healthcheck: HealthCheck::new("wget -q --spider http://localhost:2019/config/"),
            health_budget: Probe::new(12, 10),
            security_headers: false,
        }
    }
}

impl DirectProxy {
    #[must_use]
    pub fn container_name(app: &App) -> String {
        format!("{}_container_proxy", app.name)
    }

    #[must_use]
    pub fn config_path(remote_dir: &str) -> String {
        format!("{}/Caddyfile", remote_dir.trim_end_matches('/'))
    }

    /// Proxy configuration: origin certificate, edge client auth, and
    /// the app as upstream.
    #[must_use]
    pub fn caddy(&self, app: &App, certs: &CertPaths) -> Caddy {
        let caddy = Caddy::new()
            .reverse_proxy(&app.upstream())
            .origin_tls(
                &certs.in_container(CertPaths::CERT),
                &certs.in_container(CertPaths::KEY),
            )
            .require_client_ca(&certs.in_container(CertPaths::CA))
            .gzip();
        if self.security_headers {
            caddy.security_headers()
        } else {
            caddy
        }
    }

    #[must_use]
    pub fn container(&self, app: &App, remote_dir: &str) -> ContainerSpec {
        let certs = CertPaths::new(remote_dir);
        ContainerSpec::new(&Self::container_name(app), &self.proxy_image)
            .network(&app.public_network())
            .mount(Mount::bind_ro(
                &Self::config_path(remote_dir),
                "/etc/caddy/Caddyfile",
            ))
            .mount(Mount::bind_ro(&certs.host_dir, &certs.container_dir))
            .publish(self.https_port, 443)
            .restart(RestartPolicy::Always)
            .healthcheck(self.healthcheck.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunnel {
    pub agent_image: String,
    /// Defaults to `<deployment>-<stage>`.
    pub tunnel_name: Option<String>,
    pub metrics_port: u16,
    pub health_budget: Probe,
}

impl Default for Tunnel {
    fn default() -> Self {
        Self {
            agent_image: "cloudflare/cloudflared:latest".to_string(),
            tunnel_name: None,
            metrics_port: 20241,
            health_budget: Probe::new(12, 10),
        }
    }
}

impl Tunnel {
    #[must_use]
    pub fn container_name(app: &App) -> String {
        format!("{}_container_tunnel", app.name)
    }

    #[must_use]
    pub fn env_file_path(remote_dir: &str) -> String {
        format!("{}/tunnel.env", remote_dir.trim_end_matches('/'))
    }

    /// Where the tunnel delivers requests.
    #[must_use]
    pub fn service_url(app: &App) -> String {
        format!("http://{}", app.upstream())
    }

    /// Readiness check run inside the agent, which has no shell.
    #[must_use]
    pub fn ready_command(&self) -> Vec<String> {
        vec![
            "cloudflared".to_string(),
            "tunnel".to_string(),
            "--metrics".to_string(),
            format!("localhost:{}", self.metrics_port),
            "ready".to_string(),
        ]
    }

    #[must_use]
    pub fn container(&self, app: &App, remote_dir: &str) -> ContainerSpec {
        ContainerSpec::new(&Self::container_name(app), &self.agent_image)
            .network(&app.public_network())
            .env_file(&Self::env_file_path(remote_dir))
            .command(&[
                "tunnel".to_string(),
                "--no-autoupdate".to_string(),
                "--metrics".to_string(),
                format!("0.0.0.0:{}", self.metrics_port),
                "run".to_string(),
            ])
            .restart(RestartPolicy::Always)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_direct_proxy() {
        let ingress = Ingress::default();
        assert_eq!(ingress.mode(), "direct-proxy");
        assert!(ingress.needs_inbound_https());
        assert!(!Ingress::tunnel().needs_inbound_https());
    }

    #[test]
    fn yaml_tagging() {
        let ingress: Ingress = serde_yaml::from_str("mode: tunnel\nmetrics_port: 9000\n").unwrap();
        match ingress {
            Ingress::Tunnel(t) => {
                assert_eq!(t.metrics_port, 9000);
                assert_eq!(t.agent_image, "cloudflare/cloudflared:latest");
            }
            Ingress::DirectProxy(_) => panic!("expected tunnel"),
        }
    }

    #[test]
    fn proxy_container_publishes_https_on_public_network_only() {
        let app = App::new("app");
        let spec = DirectProxy::default().container(&app, "/root/app");
        assert_eq!(spec.name, "app_container_proxy");
        assert_eq!(spec.networks, vec!["app_network_public"]);
        assert_eq!(spec.ports[0].host, 443);
        assert_eq!(spec.restart, RestartPolicy::Always);
        let hc = spec.healthcheck.unwrap();
        assert_eq!((hc.interval_secs, hc.timeout_secs, hc.retries, hc.start_period_secs), (30, 5, 5, 10));
    }

    #[test]
    fn caddy_points_at_app() {
        let app = App::new("app").port(3000);
        let caddy = DirectProxy::default().caddy(&app, &CertPaths::new("/root/app"));
        assert_eq!(caddy.reverse_proxy.as_deref(), Some("app:3000"));
        let tls = caddy.tls.unwrap();
        assert_eq!(tls.cert, "/certs/origin.cert.pem");
        assert_eq!(tls.client_ca.as_deref(), Some("/certs/authenticated_origin_pull_ca.pem"));
    }

    #[test]
    fn tunnel_container_has_no_ports_and_reads_token_from_file() {
        let app = App::new("app");
        let spec = Tunnel::default().container(&app, "/root/app");
        assert!(spec.ports.is_empty());
        assert_eq!(spec.env_file.as_deref(), Some("/root/app/tunnel.env"));
        assert!(spec.env.is_empty());
        assert_eq!(spec.command.last().map(String::as_str), Some("run"));
        assert_eq!(Tunnel::service_url(&app), "http://app:3000");
    }
}
