use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DeployResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordType {
    A,
    #[serde(rename = "CNAME")]
    Cname,
}

impl RecordType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Cname => "CNAME",
        }
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One DNS record. Proxied records resolve to the edge network, not
/// to `content`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RecordType,
    pub content: String,
    pub proxied: bool,
}

impl DnsRecord {
    /// A proxied `A` record for `name`.
    #[must_use]
    pub fn a(name: &str, address: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: RecordType::A,
            content: address.to_string(),
            proxied: true,
        }
    }

    /// A proxied `CNAME` record for `name`.
    #[must_use]
    pub fn cname(name: &str, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: RecordType::Cname,
            content: target.to_string(),
            proxied: true,
        }
    }
}

/// A DNS provider that keeps one `A` or `CNAME` record per name.
/// Records of other types under the same name (MX, TXT, ...) are
/// never touched.
pub trait DnsProvider {
    /// Create or update the record named `record.name`. An `A` or
    /// `CNAME` of the other type under the same name is replaced.
    /// Returns the provider's record id.
    fn upsert_record(&self, record: &DnsRecord) -> DeployResult<String>;

    /// Delete the `kind` record for `name`. Absent is not an error.
    fn delete_record(&self, name: &str, kind: RecordType) -> DeployResult<()>;
}

/// Split an FQDN into (zone, subdomain).
///
/// Example: `"app.example.com"` -> `("example.com", "app")`
///
/// If the domain has no subdomain (e.g. `"example.com"`), the
/// subdomain is returned as an empty string.
#[must_use]
pub fn split_domain(fqdn: &str) -> (String, String) {
    let parts: Vec<&str> = fqdn.split('.').collect();
    if parts.len() <= 2 {
        return (fqdn.to_string(), String::new());
    }
    let zone = format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1]);
    let subdomain = parts[..parts.len() - 2].join(".");
    (zone, subdomain)
}

/// Label shown for a record: `@` for the zone apex.
#[must_use]
pub fn record_label(fqdn: &str) -> String {
    let (_, subdomain) = split_domain(fqdn);
    if subdomain.is_empty() {
        "@".to_string()
    } else {
        subdomain
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors_are_proxied() {
        let a = DnsRecord::a("d.example", "1.2.3.4");
        assert_eq!(a.kind, RecordType::A);
        assert!(a.proxied);

        let c = DnsRecord::cname("d.example", "abc.cfargotunnel.com");
        assert_eq!(c.kind, RecordType::Cname);
        assert_eq!(c.content, "abc.cfargotunnel.com");
        assert!(c.proxied);
    }

    #[test]
    fn record_serializes_type_field() {
        let json = serde_json::to_value(DnsRecord::cname("d.example", "t")).unwrap();
        assert_eq!(json["type"], "CNAME");
        assert_eq!(json["name"], "d.example");
    }

    #[test]
    fn labels() {
        assert_eq!(record_label("example.com"), "@");
        assert_eq!(record_label("app.example.com"), "app");
    }
}
