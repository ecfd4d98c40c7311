use std::path::Path;

use trebuchet::{Deployment, Ingress, KeyAlgorithm, RemovalPolicy};

fn demo_config() -> Deployment {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/deploy.yaml");
    Deployment::from_yaml_file(&path).unwrap()
}

#[test]
fn demo_config_is_deployable() {
    let d = demo_config();

    assert!(d.validate().is_ok());
    assert_eq!(d.resource_name(), "shop-dev");
    assert_eq!(d.location, "fsn1");
    assert_eq!(d.key_algorithm, KeyAlgorithm::Ed25519);
    assert_eq!(d.admin_sources, vec!["198.51.100.0/24"]);
    assert_eq!(d.app.image_tag(), "shop/web:latest");
    assert_eq!(d.app.target.as_deref(), Some("production"));
    assert_eq!(d.url(), "https://shop.example.com");
}

#[test]
fn demo_config_uses_direct_proxy() {
    let d = demo_config();

    let Ingress::DirectProxy(proxy) = &d.ingress else {
        panic!("expected direct proxy, got {}", d.ingress.mode());
    };
    assert!(proxy.security_headers);
    assert_eq!(proxy.https_port, 443);
    assert_eq!(d.firewall_policy().inbound_ports(), vec!["22", "443"]);
}

#[test]
fn production_stage_from_yaml_retains() {
    let yaml = "\
name: shop
stage: production
domain: shop.example.com
zone_id: z1
";
    let d = Deployment::from_yaml_str(yaml).unwrap();
    assert_eq!(d.removal_policy(), RemovalPolicy::Retain);

    let d = Deployment::from_yaml_str(&format!("{yaml}removal: remove\n")).unwrap();
    assert_eq!(d.removal_policy(), RemovalPolicy::Remove);
}

#[test]
fn tunnel_options_from_yaml() {
    let yaml = "\
name: shop
domain: shop.example.com
zone_id: z1
account_id: a1
ingress:
  mode: tunnel
  tunnel_name: shop-edge
  metrics_port: 20300
";
    let d = Deployment::from_yaml_str(yaml).unwrap();

    assert_eq!(d.tunnel_name(), "shop-edge");
    assert_eq!(d.firewall_policy().inbound_ports(), vec!["22"]);
    let Ingress::Tunnel(tunnel) = &d.ingress else {
        panic!("expected tunnel");
    };
    assert!(tunnel.ready_command().contains(&"localhost:20300".to_string()));
}

#[test]
fn unknown_ingress_mode_is_rejected() {
    let yaml = "ingress:\n  mode: load_balancer\n";
    assert!(Deployment::from_yaml_str(yaml).is_err());
}
