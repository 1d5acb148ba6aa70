//! Azure AD client for the v2.0 token and authorize endpoints.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use url::Url;

use super::callback_server::{self, CallbackResult};
use super::provider::{IdentityProvider, TokenResponse};
use crate::config::Config;
use crate::error::AuthError;
use crate::secure::SecureString;

/// HTTP request timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// HTTP connection timeout.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// PKCE code verifier and challenge pair.
#[derive(Debug)]
pub struct PkceChallenge {
    /// The code verifier (kept locally, sent in the token exchange).
    pub verifier: String,
    /// The code challenge (SHA256 of the verifier, sent in the auth request).
    pub challenge: String,
}

impl PkceChallenge {
    /// Generate a new PKCE challenge pair.
    pub fn new() -> Self {
        let mut rng = rand::thread_rng();
        let verifier_bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
        let verifier = URL_SAFE_NO_PAD.encode(&verifier_bytes);

        // challenge = BASE64URL(SHA256(verifier))
        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self {
            verifier,
            challenge,
        }
    }
}

impl Default for PkceChallenge {
    fn default() -> Self {
        Self::new()
    }
}

/// Error body returned by the token endpoint.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    error_description: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
}

/// Identity provider backed by Azure AD.
pub struct AzureAdClient {
    client_id: String,
    client_secret: Option<SecureString>,
    auth_url: String,
    token_url: String,
    redirect_uri: String,
    redirect_port: u16,
    http_client: reqwest::Client,
}

impl AzureAdClient {
    /// Create a new client from configuration.
    pub fn new(config: &Config) -> Result<Self, AuthError> {
        let client_id = config
            .client_id
            .clone()
            .ok_or_else(|| AuthError::OAuthFailed("CLIENT_ID is not configured".into()))?;

        Url::parse(&config.authority).map_err(|e| AuthError::InvalidAuthority(format!("{}: {}", config.authority, e)))?;

        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AuthError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client_id,
            client_secret: config.client_secret.clone().filter(|s| !s.is_empty()),
            auth_url: config.auth_url(),
            token_url: config.token_url(),
            redirect_uri: config.redirect_uri(),
            redirect_port: config.redirect_port,
            http_client,
        })
    }

    /// Generate the authorization URL for browser-based sign-in.
    ///
    /// Returns the URL and a CSRF state token that must be verified in the callback.
    pub fn authorization_url(&self, scopes: &[String], pkce: &PkceChallenge) -> Result<(Url, String), AuthError> {
        let mut rng = rand::thread_rng();
        let state_bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
        let state = URL_SAFE_NO_PAD.encode(&state_bytes);

        let mut url = Url::parse(&self.auth_url).map_err(|e| AuthError::InvalidAuthority(e.to_string()))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", &self.redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("code_challenge", &pkce.challenge)
            .append_pair("code_challenge_method", "S256");

        Ok((url, state))
    }

    /// Exchange an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        pkce_verifier: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError> {
        let scope = scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("code_verifier", pkce_verifier),
            ("scope", scope.as_str()),
        ];

        self.post_token_request("authorization_code", &params).await
    }

    /// POST a form to the token endpoint and decode the result.
    async fn post_token_request(&self, grant: &str, params: &[(&str, &str)]) -> Result<TokenResponse, AuthError> {
        let response = self
            .http_client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Token request ({}) failed: HTTP {} - {}", grant, status, body);
            return Err(parse_error_body(status.as_u16(), &body));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Transport(format!("Invalid token response: {}", e)))?;

        debug!("Token request ({}) succeeded, expires in {}s", grant, token_response.expires_in);
        Ok(token_response)
    }
}

impl IdentityProvider for AzureAdClient {
    async fn client_credentials(&self, scopes: &[String]) -> Result<TokenResponse, AuthError> {
        let secret = self.client_secret.as_ref().ok_or(AuthError::MissingClientSecret)?;
        let scope = scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", scope.as_str()),
        ];

        info!("Requesting app-only token for {}", scope);
        self.post_token_request("client_credentials", &params).await
    }

    async fn redeem_refresh_token(&self, refresh_token: &str, scopes: &[String]) -> Result<TokenResponse, AuthError> {
        let scope = scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scope.as_str()),
        ];

        self.post_token_request("refresh_token", &params).await
    }

    async fn interactive(&self, scopes: &[String]) -> Result<TokenResponse, AuthError> {
        let pkce = PkceChallenge::new();
        let (auth_url, expected_state) = self.authorization_url(scopes, &pkce)?;

        // Bind before the browser opens so the redirect cannot race the listener.
        let listener = callback_server::bind(self.redirect_port)?;
        let (_cancel_tx, cancel_rx) = std::sync::mpsc::channel();
        let server = tokio::task::spawn_blocking(move || callback_server::wait_for_callback(listener, cancel_rx));

        info!("Opening browser for interactive sign-in");
        if let Err(e) = open::that(auth_url.as_str()) {
            warn!("Failed to open browser: {}", e);
            eprintln!("Open this URL in a browser to sign in:\n  {}", auth_url);
        }

        let callback = server
            .await
            .map_err(|e| AuthError::CallbackServer(e.to_string()))?;

        let code = authorization_code(callback, &expected_state)?;
        self.exchange_code(&code, &pkce.verifier, scopes).await
    }
}

/// Authorization code from a finished callback wait, after the CSRF state
/// check.
fn authorization_code(callback: CallbackResult, expected_state: &str) -> Result<String, AuthError> {
    let url_string = match callback {
        CallbackResult::Success(url) => url,
        CallbackResult::Cancelled => return Err(AuthError::UserCancelled),
        CallbackResult::Error(e) => return Err(AuthError::CallbackServer(e)),
    };

    let (code, state) = parse_callback_url(&url_string)?;
    if state != expected_state {
        warn!("Callback state does not match the authorization request");
        return Err(AuthError::StateValidationFailed);
    }
    Ok(code)
}

/// Turn a token endpoint error body into a provider error.
fn parse_error_body(status: u16, body: &str) -> AuthError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => {
            if let Some(correlation_id) = &parsed.correlation_id {
                debug!("Token endpoint correlation id: {}", correlation_id);
            }
            AuthError::Provider {
                error: parsed.error,
                description: parsed.error_description,
            }
        }
        Err(_) => AuthError::Provider {
            error: format!("http_{}", status),
            description: Some(body.trim().chars().take(500).collect::<String>()).filter(|d| !d.is_empty()),
        },
    }
}

/// Parse OAuth callback URL to extract code and state.
pub fn parse_callback_url(url_string: &str) -> Result<(String, String), AuthError> {
    let url = Url::parse(url_string).map_err(|_| AuthError::InvalidAuthCode)?;

    let params: HashMap<_, _> = url.query_pairs().collect();

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        return Err(AuthError::Provider {
            error: error.to_string(),
            description,
        });
    }

    let code = params
        .get("code")
        .ok_or(AuthError::InvalidAuthCode)?
        .to_string();

    let state = params
        .get("state")
        .ok_or(AuthError::StateValidationFailed)?
        .to_string();

    Ok((code, state))
}
