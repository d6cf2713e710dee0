//! Per-backend OAuth provider.
//!
//! One provider per authorization-gated backend. Tokens, client
//! registrations and PKCE verifiers are persisted as JSON files in a
//! durable directory so completed authorizations survive restarts.

use base64::Engine;
use manifold_core::{GatewayError, GatewayResult, SharedClock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use url::Url;

/// Leeway subtracted from token expiry so a token about to lapse is not
/// treated as usable.
const EXPIRY_SKEW: Duration = Duration::from_secs(30);

/// Persisted OAuth tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Bearer access token
    pub access_token: String,
    /// Token type (always "Bearer" in practice)
    #[serde(default)]
    pub token_type: Option<String>,
    /// Lifetime in seconds, as reported by the token endpoint
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Refresh token, if issued
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Epoch millis at which the tokens were obtained
    #[serde(default)]
    pub obtained_at: u64,
}

impl OAuthTokens {
    fn is_valid_at(&self, now_millis: u64) -> bool {
        match self.expires_in {
            None => true,
            Some(expires_in) => {
                let deadline = self
                    .obtained_at
                    .saturating_add(expires_in.saturating_mul(1_000))
                    .saturating_sub(EXPIRY_SKEW.as_millis() as u64);
                now_millis < deadline
            }
        }
    }
}

/// Stored client registration (static or pre-registered out of band).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ClientRegistration {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthServerEndpoints {
    authorization_endpoint: String,
    token_endpoint: String,
}

/// OAuth provider for one backend server.
pub struct OAuthProvider {
    server_name: String,
    server_url: Url,
    callback_url: String,
    tokens_dir: PathBuf,
    http: reqwest::Client,
    clock: SharedClock,
    endpoints: RwLock<Option<AuthServerEndpoints>>,
    request_timeout: Duration,
}

impl OAuthProvider {
    /// Provider for `server_name` at `server_url`, persisting under
    /// `tokens_dir` and redirecting to `callback_url`.
    pub fn new(
        server_name: impl Into<String>,
        server_url: Url,
        callback_url: impl Into<String>,
        tokens_dir: impl Into<PathBuf>,
        http: reqwest::Client,
        clock: SharedClock,
        request_timeout: Duration,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            server_url,
            callback_url: callback_url.into(),
            tokens_dir: tokens_dir.into(),
            http,
            clock,
            endpoints: RwLock::new(None),
            request_timeout,
        }
    }

    /// Backend name this provider serves.
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// Valid (non-expired) persisted tokens, if any.
    pub async fn valid_tokens(&self) -> Option<OAuthTokens> {
        let tokens: OAuthTokens = self.read_json(&self.tokens_path()).await?;
        if tokens.is_valid_at(self.clock.now_millis()) {
            Some(tokens)
        } else {
            debug!(name = self.server_name, "persisted tokens are expired");
            None
        }
    }

    /// Build the authorization URL for a new flow identified by `state`,
    /// generating and persisting a fresh PKCE verifier.
    pub async fn authorization_url(&self, state: &str) -> GatewayResult<Url> {
        let endpoints = self.discover_endpoints().await?;

        let verifier = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        self.write_text(&self.verifier_path(), &verifier).await?;
        let challenge = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(Sha256::digest(verifier.as_bytes()));

        let client_id = self.client_id().await;
        let mut url = Url::parse(&endpoints.authorization_endpoint)
            .map_err(|e| GatewayError::auth(format!("invalid authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client_id)
            .append_pair("redirect_uri", &self.callback_url)
            .append_pair("state", state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("resource", self.server_url.as_str());
        Ok(url)
    }

    /// Exchange an authorization code for tokens and persist them.
    pub async fn exchange_code(&self, code: &str) -> GatewayResult<OAuthTokens> {
        let endpoints = self.discover_endpoints().await?;
        let verifier: String = self
            .read_text(&self.verifier_path())
            .await
            .ok_or_else(|| GatewayError::auth("no PKCE verifier for pending authorization"))?;
        let client_id = self.client_id().await;

        let mut form = vec![
            ("grant_type", "authorization_code".to_owned()),
            ("code", code.to_owned()),
            ("redirect_uri", self.callback_url.clone()),
            ("client_id", client_id),
            ("code_verifier", verifier),
            ("resource", self.server_url.to_string()),
        ];
        if let Some(secret) = self.client_secret().await {
            form.push(("client_secret", secret));
        }

        let response = self
            .http
            .post(&endpoints.token_endpoint)
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| GatewayError::auth(format!("token endpoint unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::auth(format!(
                "token exchange failed with {status}: {body}"
            )));
        }
        let mut tokens: OAuthTokens = response
            .json()
            .await
            .map_err(|e| GatewayError::auth(format!("malformed token response: {e}")))?;
        tokens.obtained_at = self.clock.now_millis();

        self.write_json(&self.tokens_path(), &tokens).await?;
        info!(name = self.server_name, "OAuth tokens obtained and persisted");
        Ok(tokens)
    }

    /// Drop persisted tokens (e.g. after the backend rejected them).
    pub async fn clear_tokens(&self) {
        if let Err(e) = tokio::fs::remove_file(self.tokens_path()).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(name = self.server_name, error = %e, "failed to clear tokens");
            }
        }
    }

    async fn discover_endpoints(&self) -> GatewayResult<AuthServerEndpoints> {
        if let Some(endpoints) = self.endpoints.read().await.clone() {
            return Ok(endpoints);
        }
        let origin = {
            let url = &self.server_url;
            let host = url
                .host_str()
                .ok_or_else(|| GatewayError::auth("server URL has no host"))?;
            match url.port() {
                Some(port) => format!("{}://{host}:{port}", url.scheme()),
                None => format!("{}://{host}", url.scheme()),
            }
        };
        let metadata_url = format!("{origin}/.well-known/oauth-authorization-server");
        let endpoints: AuthServerEndpoints = self
            .http
            .get(&metadata_url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| GatewayError::auth(format!("metadata fetch failed: {e}")))?
            .error_for_status()
            .map_err(|e| GatewayError::auth(format!("metadata fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| GatewayError::auth(format!("malformed authorization metadata: {e}")))?;

        *self.endpoints.write().await = Some(endpoints.clone());
        Ok(endpoints)
    }

    async fn client_id(&self) -> String {
        self.read_json::<ClientRegistration>(&self.client_path())
            .await
            .map(|r| r.client_id)
            .unwrap_or_else(|| "manifold-gateway".to_owned())
    }

    async fn client_secret(&self) -> Option<String> {
        self.read_json::<ClientRegistration>(&self.client_path())
            .await
            .and_then(|r| r.client_secret)
    }

    fn tokens_path(&self) -> PathBuf {
        self.tokens_dir
            .join(format!("{}-tokens.json", self.server_name))
    }

    fn client_path(&self) -> PathBuf {
        self.tokens_dir
            .join(format!("{}-client.json", self.server_name))
    }

    fn verifier_path(&self) -> PathBuf {
        self.tokens_dir
            .join(format!("{}-verifier.txt", self.server_name))
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &PathBuf) -> Option<T> {
        let raw = tokio::fs::read_to_string(path).await.ok()?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(name = self.server_name, path = %path.display(), error = %e, "failed to parse persisted file");
                None
            }
        }
    }

    async fn read_text(&self, path: &PathBuf) -> Option<String> {
        tokio::fs::read_to_string(path).await.ok()
    }

    async fn write_json<T: Serialize>(&self, path: &PathBuf, value: &T) -> GatewayResult<()> {
        let rendered = serde_json::to_string_pretty(value)
            .map_err(|e| GatewayError::internal(format!("failed to render {}: {e}", path.display())))?;
        self.write_text(path, &rendered).await
    }

    async fn write_text(&self, path: &PathBuf, contents: &str) -> GatewayResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}
