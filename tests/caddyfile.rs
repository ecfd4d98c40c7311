use caddyfile_rs::{Caddyfile, SiteBlock, format, parse, tokenize};
use trebuchet::caddyfile;
use trebuchet::ingress::origin::CertPaths;
use trebuchet::{App, Caddy, DirectProxy};

fn origin_caddyfile(domain: &str) -> String {
    let app = App::new("app").port(3000);
    let caddy = DirectProxy::default().caddy(&app, &CertPaths::new("/root/app"));
    caddyfile::render(&caddy, domain)
}

#[test]
fn origin_site_requires_edge_client_certificates() {
    let result = origin_caddyfile("shop.example.com");

    assert!(result.contains("shop.example.com {"));
    assert!(result.contains("tls /certs/origin.cert.pem /certs/origin.key.pem {"));
    assert!(result.contains("client_auth {"));
    assert!(result.contains("mode require_and_verify"));
    assert!(result.contains("trust_pool file /certs/authenticated_origin_pull_ca.pem"));
    assert!(result.contains("reverse_proxy app:3000"));
    assert!(result.contains("encode gzip"));
}

#[test]
fn origin_site_never_asks_for_public_certificates() {
    let result = origin_caddyfile("shop.example.com");

    assert!(!result.contains("tls internal"));
    assert!(!result.contains("acme"));
    assert!(!result.contains("email"));
}

#[test]
fn tls_block_precedes_proxying() {
    let result = origin_caddyfile("shop.example.com");

    let tls = result.find("tls ").unwrap();
    let proxy = result.find("reverse_proxy").unwrap();
    assert!(tls < proxy);
}

#[test]
fn origin_site_with_security_headers() {
    let app = App::new("app").port(3000);
    let proxy = DirectProxy {
        security_headers: true,
        ..DirectProxy::default()
    };
    let caddy = proxy.caddy(&app, &CertPaths::new("/root/app"));

    let result = caddyfile::render(&caddy, "shop.example.com");

    assert!(result.contains("X-Frame-Options"));
    assert!(result.contains("client_auth {"));
}

#[test]
fn security_headers_only() {
    let caddy = Caddy::new().security_headers();

    let result = caddyfile::render(&caddy, "secure.dev");

    assert!(result.contains("X-Content-Type-Options \"nosniff\""));
    assert!(result.contains("X-Frame-Options \"DENY\""));
    assert!(!result.contains("reverse_proxy"));
    assert!(!result.contains("encode gzip"));
}

#[test]
fn empty_caddy() {
    let result = caddyfile::render(&Caddy::new(), "empty.dev");

    assert!(result.contains("empty.dev {"));
    assert!(result.contains('}'));
    assert!(!result.contains("reverse_proxy"));
    assert!(!result.contains("encode"));
}

#[test]
fn builder_roundtrip() {
    let cf = Caddyfile::new().site(
        SiteBlock::new("example.com")
            .reverse_proxy("app:3000")
            .encode_gzip()
            .log(),
    );
    let formatted = format(&cf);
    let tokens = tokenize(&formatted).expect("tokenize failed");
    let parsed = parse(&tokens).expect("parse failed");

    assert_eq!(parsed.sites.len(), 1);
    assert_eq!(
        parsed.sites[0].directives.len(),
        cf.sites[0].directives.len()
    );
}
