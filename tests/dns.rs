use trebuchet::dns::{DnsRecord, RecordType, record_label, split_domain};

#[test]
fn split_fqdn() {
    let (zone, sub) = split_domain("app.example.com");
    assert_eq!(zone, "example.com");
    assert_eq!(sub, "app");
}

#[test]
fn split_bare_domain() {
    let (zone, sub) = split_domain("example.com");
    assert_eq!(zone, "example.com");
    assert_eq!(sub, "");
}

#[test]
fn split_deep_subdomain() {
    let (zone, sub) = split_domain("a.b.example.com");
    assert_eq!(zone, "example.com");
    assert_eq!(sub, "a.b");
}

#[test]
fn apex_label() {
    assert_eq!(record_label("example.com"), "@");
    assert_eq!(record_label("a.b.example.com"), "a.b");
}

#[test]
fn a_record_points_at_the_host() {
    let record = DnsRecord::a("shop.example.com", "203.0.113.10");

    assert_eq!(record.kind, RecordType::A);
    assert_eq!(record.content, "203.0.113.10");
    assert!(record.proxied);
}

#[test]
fn cname_record_points_at_the_tunnel() {
    let record = DnsRecord::cname("shop.example.com", "abc.cfargotunnel.com");

    assert_eq!(record.kind.to_string(), "CNAME");
    let json = serde_json::to_string(&record).unwrap();
    let back: DnsRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, record);
}
