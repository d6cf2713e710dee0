//! Authorization discovery against well-known metadata locations.
//!
//! Mirrors what well-behaved MCP servers publish: either RFC 9728 protected
//! resource metadata or RFC 8414 authorization server metadata at the origin.
//! Both locations are probed in parallel under a bounded timeout; either one
//! validating is taken as "authorization required". Probe failures of any
//! kind mean "not required" - discovery never blocks a connection attempt.

use serde::Deserialize;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    authorization_servers: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AuthServerMetadata {
    #[serde(default)]
    authorization_endpoint: Option<String>,
    #[serde(default)]
    token_endpoint: Option<String>,
}

/// Probe `server_url`'s origin for OAuth metadata. Returns whether the
/// backend requires authorization.
pub async fn detect_authorization_required(
    http: &reqwest::Client,
    server_name: &str,
    server_url: &str,
    timeout: Duration,
) -> bool {
    let Ok(parsed) = Url::parse(server_url) else {
        return false;
    };
    let Some(origin) = origin_of(&parsed) else {
        return false;
    };

    let protected_resource = async {
        let url = format!("{origin}/.well-known/oauth-protected-resource");
        let response = http.get(&url).timeout(timeout).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let meta: ProtectedResourceMetadata = response.json().await.ok()?;
        Some(!meta.authorization_servers.is_empty())
    };

    let auth_server = async {
        let url = format!("{origin}/.well-known/oauth-authorization-server");
        let response = http.get(&url).timeout(timeout).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let meta: AuthServerMetadata = response.json().await.ok()?;
        Some(meta.authorization_endpoint.is_some() || meta.token_endpoint.is_some())
    };

    let (protected_resource, auth_server) = tokio::join!(protected_resource, auth_server);
    let required =
        protected_resource.unwrap_or(false) || auth_server.unwrap_or(false);
    debug!(
        name = server_name,
        required,
        protected_resource = ?protected_resource,
        auth_server = ?auth_server,
        "authorization discovery complete"
    );
    required
}

fn origin_of(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let mut origin = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{port}"));
    }
    Some(origin)
}
