//! Client application: an identity provider paired with a token cache.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use zeroize::Zeroizing;

use super::cache::{is_oidc_scope, Account, CacheKey, TokenCache, OIDC_SCOPES};
use super::provider::{IdentityProvider, TokenResponse};
use crate::error::AuthError;
use crate::secure::SecureString;

/// Where a token handed out by [`ClientApplication`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Served from the cache without any network call.
    Cache,
    /// Obtained by redeeming a cached refresh token.
    RefreshToken,
    ClientCredentials,
    Interactive,
}

impl TokenSource {
    /// True when obtaining the token changed the cache.
    pub fn updated_cache(&self) -> bool {
        !matches!(self, Self::Cache)
    }
}

/// A bearer token with its granted scopes and expiry.
#[derive(Debug, Clone)]
pub struct AccessToken {
    secret: SecureString,
    scopes: Vec<String>,
    expires_at: DateTime<Utc>,
    account: Option<Account>,
    source: TokenSource,
}

impl AccessToken {
    pub fn as_str(&self) -> &str {
        self.secret.as_str()
    }

    /// Value for an `Authorization` header.
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.secret.as_str())
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// The signed-in user, `None` for app-only tokens.
    pub fn account(&self) -> Option<&Account> {
        self.account.as_ref()
    }

    pub fn source(&self) -> TokenSource {
        self.source
    }

    /// First `len` characters followed by an ellipsis, for display.
    pub fn preview(&self, len: usize) -> String {
        let head: String = self.secret.as_str().chars().take(len).collect();
        format!("{}...", head)
    }
}

/// Claims read from an id token. The token is not validated; it arrived
/// over TLS straight from the token endpoint.
#[derive(Debug, Default, Deserialize)]
struct IdTokenClaims {
    oid: Option<String>,
    sub: Option<String>,
    tid: Option<String>,
    preferred_username: Option<String>,
    upn: Option<String>,
    email: Option<String>,
}

/// Identity provider plus token cache for a single client id and authority.
pub struct ClientApplication<P> {
    client_id: String,
    authority: String,
    provider: P,
    cache: TokenCache,
}

impl<P: IdentityProvider> ClientApplication<P> {
    /// Cache entries are read and written under `client_id` and `authority`.
    pub fn new(client_id: impl Into<String>, authority: impl Into<String>, provider: P, cache: TokenCache) -> Self {
        Self {
            client_id: client_id.into(),
            authority: authority.into(),
            provider,
            cache,
        }
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Accounts previously signed in through this client and authority.
    pub fn accounts(&self) -> Vec<Account> {
        self.cache.accounts(self.key())
    }

    fn key(&self) -> CacheKey<'_> {
        CacheKey {
            client_id: &self.client_id,
            authority: &self.authority,
        }
    }

    /// Acquire a token without user interaction.
    ///
    /// With no account only app-only tokens in the cache are considered and
    /// the network is never touched. With an account, an expired access token
    /// is renewed by redeeming the account's refresh token. `Ok(None)` means
    /// nothing usable was found.
    pub async fn acquire_token_silent(
        &mut self,
        scopes: &[String],
        account: Option<&Account>,
    ) -> Result<Option<AccessToken>, AuthError> {
        let home_account_id = account.map(|a| a.home_account_id.as_str());

        if let Some(entry) = self
            .cache
            .find_access_token(self.key(), home_account_id, scopes, Utc::now())
        {
            debug!("Serving access token from cache");
            return Ok(Some(AccessToken {
                secret: SecureString::new(entry.secret.clone()),
                scopes: entry.scopes.clone(),
                expires_at: entry.expires_at,
                account: account.cloned(),
                source: TokenSource::Cache,
            }));
        }

        let Some(account) = account else {
            return Ok(None);
        };

        let Some(refresh_token) = self
            .cache
            .refresh_token(self.key(), &account.home_account_id)
            .map(|t| Zeroizing::new(t.to_string()))
        else {
            debug!("No refresh token cached for {}", account.username);
            return Ok(None);
        };

        debug!("Redeeming refresh token for {}", account.username);
        let response = self
            .provider
            .redeem_refresh_token(&refresh_token, &with_oidc_scopes(scopes))
            .await?;

        Ok(Some(self.record(Some(account.clone()), &response, scopes, TokenSource::RefreshToken)))
    }

    /// App-only client-credentials exchange. Always hits the network.
    pub async fn acquire_token_for_client(&mut self, scopes: &[String]) -> Result<AccessToken, AuthError> {
        let response = self.provider.client_credentials(scopes).await?;
        Ok(self.record(None, &response, scopes, TokenSource::ClientCredentials))
    }

    /// Interactive consent. Blocks until the user completes the flow.
    pub async fn acquire_token_interactive(&mut self, scopes: &[String]) -> Result<AccessToken, AuthError> {
        let response = self.provider.interactive(&with_oidc_scopes(scopes)).await?;
        let account = account_from_id_token(response.id_token.as_deref());
        debug!("Interactive sign-in completed for {}", account.username);
        Ok(self.record(Some(account), &response, scopes, TokenSource::Interactive))
    }

    fn record(
        &mut self,
        account: Option<Account>,
        response: &TokenResponse,
        requested: &[String],
        source: TokenSource,
    ) -> AccessToken {
        let key = CacheKey {
            client_id: &self.client_id,
            authority: &self.authority,
        };
        let (scopes, expires_at) = self
            .cache
            .store(key, account.as_ref(), response, requested, Utc::now());

        AccessToken {
            secret: SecureString::new(response.access_token.clone()),
            scopes,
            expires_at,
            account,
            source,
        }
    }
}

/// Requested scopes plus `openid profile offline_access`, so that delegated
/// responses carry an id token and a refresh token.
fn with_oidc_scopes(scopes: &[String]) -> Vec<String> {
    let mut request: Vec<String> = scopes.iter().filter(|s| !is_oidc_scope(s)).cloned().collect();
    request.extend(OIDC_SCOPES.iter().map(|s| s.to_string()));
    request
}

fn account_from_id_token(id_token: Option<&str>) -> Account {
    let claims = id_token.and_then(decode_claims).unwrap_or_default();

    let object_id = claims.oid.or(claims.sub).unwrap_or_else(|| "unknown".to_string());
    let home_account_id = match &claims.tid {
        Some(tid) => format!("{}.{}", object_id, tid),
        None => object_id,
    };
    let username = claims
        .preferred_username
        .or(claims.upn)
        .or(claims.email)
        .unwrap_or_else(|| "unknown user".to_string());

    Account {
        home_account_id,
        username,
        tenant_id: claims.tid,
    }
}

fn decode_claims(id_token: &str) -> Option<IdTokenClaims> {
    let payload = id_token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}
