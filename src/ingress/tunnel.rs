//! Tunnel identity and routing for the tunnel variant.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::DeployResult;

/// One ingress rule of a tunnel. A rule without a hostname matches
/// everything and must come last.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub service: String,
}

/// Route `domain` to `service`, and answer 404 for anything else.
#[must_use]
pub fn ingress_rules(domain: &str, service: &str) -> Vec<IngressRule> {
    vec![
        IngressRule {
            hostname: Some(domain.to_string()),
            service: service.to_string(),
        },
        IngressRule {
            hostname: None,
            service: "http_status:404".to_string(),
        },
    ]
}

#[derive(Serialize)]
struct TokenClaims<'a> {
    a: &'a str,
    t: &'a str,
    s: &'a str,
}

/// The token the agent runs with: base64 of the account, tunnel id and
/// secret. Derived locally, so it never has to be fetched.
pub fn tunnel_token(
    account_id: &str,
    tunnel_id: &str,
    secret: &SecretString,
) -> DeployResult<SecretString> {
    let claims = serde_json::to_vec(&TokenClaims {
        a: account_id,
        t: tunnel_id,
        s: secret.expose_secret(),
    })?;
    Ok(SecretString::from(STANDARD.encode(claims)))
}

/// Contents of the agent's env file.
#[must_use]
pub fn agent_env_file(token: &SecretString) -> SecretString {
    SecretString::from(format!("TUNNEL_TOKEN={}\n", token.expose_secret()))
}
