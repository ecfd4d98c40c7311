use serde::{Deserialize, Serialize};

/// Certificate paths as seen from inside the proxy container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginTls {
    pub cert: String,
    pub key: String,
    /// CA that client certificates must chain to. When set, the proxy
    /// refuses TLS clients that do not present one.
    pub client_ca: Option<String>,
}

/// Configuration for the Caddy reverse proxy container.
///
/// # Example
///
/// ```
/// use trebuchet::Caddy;
///
/// let caddy = Caddy::new()
///     .reverse_proxy("app:3000")
///     .origin_tls("/certs/origin.cert.pem", "/certs/origin.key.pem")
///     .require_client_ca("/certs/authenticated_origin_pull_ca.pem")
///     .gzip();
///
/// assert!(caddy.gzip);
/// assert!(caddy.tls.unwrap().client_ca.is_some());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Caddy {
    pub reverse_proxy: Option<String>,
    pub tls: Option<OriginTls>,
    pub gzip: bool,
    pub security_headers: bool,
    pub extra_directives: Vec<String>,
}

impl Caddy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reverse_proxy(mut self, upstream: &str) -> Self {
        self.reverse_proxy = Some(upstream.to_string());
        self
    }

    /// Serve with a fixed certificate instead of obtaining one.
    #[must_use]
    pub fn origin_tls(mut self, cert: &str, key: &str) -> Self {
        let client_ca = self.tls.take().and_then(|t| t.client_ca);
        self.tls = Some(OriginTls {
            cert: cert.to_string(),
            key: key.to_string(),
            client_ca,
        });
        self
    }

    /// Require client certificates issued by `ca`. Has no effect
    /// without [`Caddy::origin_tls`].
    #[must_use]
    pub fn require_client_ca(mut self, ca: &str) -> Self {
        if let Some(tls) = self.tls.as_mut() {
            tls.client_ca = Some(ca.to_string());
        }
        self
    }

    #[must_use]
    pub const fn gzip(mut self) -> Self {
        self.gzip = true;
        self
    }

    #[must_use]
    pub const fn security_headers(mut self) -> Self {
        self.security_headers = true;
        self
    }

    #[must_use]
    pub fn directive(mut self, raw: &str) -> Self {
        self.extra_directives.push(raw.to_string());
        self
    }
}
