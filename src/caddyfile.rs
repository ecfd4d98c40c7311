use caddyfile_rs::{Caddyfile, Directive, SiteBlock, format};

use crate::caddy::{Caddy, OriginTls};

/// Render a complete Caddyfile from the Caddy config.
#[must_use]
pub fn render(caddy: &Caddy, domain: &str) -> String {
    let mut site = SiteBlock::new(domain);

    if let Some(tls) = &caddy.tls {
        site = site.directive(tls_directive(tls));
    }

    if let Some(upstream) = &caddy.reverse_proxy {
        site = site.reverse_proxy(upstream);
    }

    if caddy.gzip {
        site = site.encode_gzip();
    }

    if caddy.security_headers {
        site = site.security_headers();
    }

    for d in &caddy.extra_directives {
        site = site.directive(Directive::new(d));
    }

    let caddyfile = Caddyfile::new().site(site);
    format(&caddyfile)
}

fn tls_directive(tls: &OriginTls) -> Directive {
    let directive = Directive::new("tls").arg(&tls.cert).arg(&tls.key);
    match &tls.client_ca {
        Some(ca) => directive.block(vec![Directive::new("client_auth").block(vec![
            Directive::new("mode").arg("require_and_verify"),
            Directive::new("trust_pool").arg("file").arg(ca),
        ])]),
        None => directive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Caddy {
        Caddy::new()
            .reverse_proxy("app:3000")
            .origin_tls("/certs/origin.cert.pem", "/certs/origin.key.pem")
            .require_client_ca("/certs/authenticated_origin_pull_ca.pem")
            .gzip()
    }

    #[test]
    fn origin_caddyfile() {
        let result = render(&origin(), "d.example");

        assert!(result.contains("d.example {"));
        assert!(result.contains("tls /certs/origin.cert.pem /certs/origin.key.pem {"));
        assert!(result.contains("client_auth {"));
        assert!(result.contains("mode require_and_verify"));
        assert!(result.contains("trust_pool file /certs/authenticated_origin_pull_ca.pem"));
        assert!(result.contains("reverse_proxy app:3000"));
        assert!(result.contains("encode gzip"));
    }

    #[test]
    fn client_auth_parses_as_a_nested_block() {
        let parsed = caddyfile_rs::parse_str(&render(&origin(), "d.example")).unwrap();
        let tls = parsed.sites[0]
            .directives
            .iter()
            .find(|d| d.name == "tls")
            .unwrap();
        let args: Vec<&str> = tls.arguments.iter().map(|a| a.value()).collect();
        assert_eq!(args, ["/certs/origin.cert.pem", "/certs/origin.key.pem"]);

        let block = tls.block.as_ref().unwrap();
        assert_eq!(block.len(), 1);
        assert_eq!(block[0].name, "client_auth");
        let inner: Vec<&str> = block[0]
            .block
            .as_ref()
            .unwrap()
            .iter()
            .map(|d| d.name.as_str())
            .collect();
        assert_eq!(inner, ["mode", "trust_pool"]);
    }

    #[test]
    fn tls_without_client_auth() {
        let caddy = Caddy::new()
            .reverse_proxy("app:3000")
            .origin_tls("/c/cert.pem", "/c/key.pem");

        let result = render(&caddy, "d.example");

        assert!(result.contains("tls /c/cert.pem /c/key.pem"));
        assert!(!result.contains("client_auth"));
    }

    #[test]
    fn minimal_caddyfile() {
        let caddy = Caddy::new().reverse_proxy("backend:8080");

        let result = render(&caddy, "test.dev");

        assert!(result.contains("test.dev {"));
        assert!(result.contains("reverse_proxy backend:8080"));
        assert!(!result.contains("tls"));
        assert!(!result.contains("encode gzip"));
    }

    #[test]
    fn extra_directives() {
        let caddy = Caddy::new().reverse_proxy("app:3000").directive("log");

        let result = render(&caddy, "local.dev");

        assert!(result.contains("\tlog"));
    }

    #[test]
    fn rendering_is_deterministic() {
        assert_eq!(render(&origin(), "d.example"), render(&origin(), "d.example"));
    }
}
