//! The network seam of the identity layer.

use serde::Deserialize;
use zeroize::Zeroize;

use crate::error::AuthError;

/// Token response from the identity platform.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: u64,
    pub refresh_token: Option<String>,
    /// Space-separated scopes actually granted. Absent for client credentials.
    #[serde(default)]
    pub scope: String,
    pub id_token: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Zeroize for TokenResponse {
    fn zeroize(&mut self) {
        self.access_token.zeroize();
        if let Some(ref mut rt) = self.refresh_token {
            rt.zeroize();
        }
    }
}

impl Drop for TokenResponse {
    fn drop(&mut self) {
        self.zeroize();
    }
}

/// Remote operations an identity provider offers.
///
/// Implementations make exactly one remote exchange per call. Caching and
/// fallback ordering live above this trait.
#[allow(async_fn_in_trait)]
pub trait IdentityProvider {
    /// App-only exchange: client id + secret + scopes.
    async fn client_credentials(&self, scopes: &[String]) -> Result<TokenResponse, AuthError>;

    /// Redeem a refresh token for a new access token.
    async fn redeem_refresh_token(
        &self,
        refresh_token: &str,
        scopes: &[String],
    ) -> Result<TokenResponse, AuthError>;

    /// User-facing consent flow. Blocks until the user finishes or abandons it.
    async fn interactive(&self, scopes: &[String]) -> Result<TokenResponse, AuthError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory provider that counts remote exchanges.

    use super::*;
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeState {
        client_credentials_calls: usize,
        refresh_calls: usize,
        interactive_calls: usize,
        issued: usize,
        client_credentials_error: Option<(String, Option<String>)>,
        interactive_error: Option<(String, Option<String>)>,
        refresh_fails: bool,
        expires_in: Option<u64>,
    }

    /// Cloning shares the counters, so a test can keep a handle after moving
    /// the provider into a broker.
    #[derive(Clone, Default)]
    pub struct FakeProvider {
        state: Arc<Mutex<FakeState>>,
    }

    pub const USER_OID: &str = "00000000-0000-0000-0000-0000000000aa";
    pub const USER_TID: &str = "11111111-1111-1111-1111-111111111111";
    pub const USER_NAME: &str = "adele@contoso.onmicrosoft.com";

    impl FakeProvider {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn client_credentials_calls(&self) -> usize {
            self.state.lock().unwrap().client_credentials_calls
        }

        pub fn refresh_calls(&self) -> usize {
            self.state.lock().unwrap().refresh_calls
        }

        pub fn interactive_calls(&self) -> usize {
            self.state.lock().unwrap().interactive_calls
        }

        pub fn network_calls(&self) -> usize {
            self.client_credentials_calls() + self.refresh_calls() + self.interactive_calls()
        }

        pub fn fail_client_credentials(&self, error: &str, description: Option<&str>) {
            self.state.lock().unwrap().client_credentials_error =
                Some((error.to_string(), description.map(str::to_string)));
        }

        pub fn fail_interactive(&self, error: &str, description: Option<&str>) {
            self.state.lock().unwrap().interactive_error =
                Some((error.to_string(), description.map(str::to_string)));
        }

        pub fn fail_refresh(&self) {
            self.state.lock().unwrap().refresh_fails = true;
        }

        /// Lifetime of tokens issued from now on.
        pub fn issue_expiring_in(&self, seconds: u64) {
            self.state.lock().unwrap().expires_in = Some(seconds);
        }

        fn issue(&self, prefix: &str, scopes: &[String], user: bool) -> TokenResponse {
            let mut state = self.state.lock().unwrap();
            state.issued += 1;
            let n = state.issued;
            TokenResponse {
                access_token: format!("{}-{}", prefix, n),
                token_type: "Bearer".into(),
                expires_in: state.expires_in.unwrap_or(3600),
                refresh_token: user.then(|| format!("refresh-{}", n)),
                scope: if user { scopes.join(" ") } else { String::new() },
                id_token: user.then(|| id_token(USER_OID, USER_TID, USER_NAME)),
            }
        }
    }

    /// Unsigned id token carrying the claims the cache reads.
    pub fn id_token(oid: &str, tid: &str, username: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
        let claims = serde_json::json!({
            "oid": oid,
            "tid": tid,
            "preferred_username": username,
        });
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.", header, payload)
    }

    fn provider_error(err: &(String, Option<String>)) -> AuthError {
        AuthError::Provider {
            error: err.0.clone(),
            description: err.1.clone(),
        }
    }

    impl IdentityProvider for FakeProvider {
        async fn client_credentials(&self, scopes: &[String]) -> Result<TokenResponse, AuthError> {
            let failure = {
                let mut state = self.state.lock().unwrap();
                state.client_credentials_calls += 1;
                state.client_credentials_error.as_ref().map(provider_error)
            };
            match failure {
                Some(err) => Err(err),
                None => Ok(self.issue("app-token", scopes, false)),
            }
        }

        async fn redeem_refresh_token(
            &self,
            _refresh_token: &str,
            scopes: &[String],
        ) -> Result<TokenResponse, AuthError> {
            let fails = {
                let mut state = self.state.lock().unwrap();
                state.refresh_calls += 1;
                state.refresh_fails
            };
            if fails {
                return Err(AuthError::Provider {
                    error: "invalid_grant".into(),
                    description: Some("AADSTS70008: The refresh token has expired.".into()),
                });
            }
            Ok(self.issue("refreshed-token", scopes, true))
        }

        async fn interactive(&self, scopes: &[String]) -> Result<TokenResponse, AuthError> {
            let failure = {
                let mut state = self.state.lock().unwrap();
                state.interactive_calls += 1;
                state.interactive_error.as_ref().map(provider_error)
            };
            match failure {
                Some(err) => Err(err),
                None => Ok(self.issue("user-token", scopes, true)),
            }
        }
    }
}
