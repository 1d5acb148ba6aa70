//! Serializable token cache.
//!
//! Holds accounts, access tokens and refresh tokens for any number of client
//! ids and authorities. Every entry is scoped by a [`CacheKey`]; an entry
//! written under one authority is never returned under another. Code outside the identity layer moves it only through
//! [`TokenCache::deserialize`] and [`TokenCache::serialize`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::provider::TokenResponse;

/// Access tokens this close to expiry are treated as expired.
const EXPIRY_SKEW_SECONDS: i64 = 300;

/// Upper bound on a token lifetime reported by the provider.
const MAX_LIFETIME_SECONDS: u64 = 365 * 24 * 3600;

/// Scopes the identity platform adds to every delegated request.
pub(crate) const OIDC_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Graph scopes are granted in short form (`User.Read`) but may be requested
/// fully qualified.
const GRAPH_RESOURCE_PREFIX: &str = "https://graph.microsoft.com/";

/// A signed-in user known to the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// `<oid>.<tid>`, stable across sign-ins.
    pub home_account_id: String,
    pub username: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// Client id plus resolved authority URL. Authorities compare
/// case-insensitively.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheKey<'a> {
    pub client_id: &'a str,
    pub authority: &'a str,
}

impl CacheKey<'_> {
    fn matches(&self, client_id: &str, authority: &str) -> bool {
        self.client_id == client_id && self.authority.eq_ignore_ascii_case(authority)
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct AccountEntry {
    pub client_id: String,
    /// Entries written before authorities were recorded have none and match
    /// no key.
    #[serde(default)]
    pub authority: String,
    #[serde(flatten)]
    pub account: Account,
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct AccessTokenEntry {
    pub client_id: String,
    #[serde(default)]
    pub authority: String,
    /// `None` for app-only tokens.
    pub home_account_id: Option<String>,
    pub secret: String,
    pub scopes: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

impl AccessTokenEntry {
    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_SKEW_SECONDS) > now
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct RefreshTokenEntry {
    pub client_id: String,
    #[serde(default)]
    pub authority: String,
    pub home_account_id: String,
    pub secret: String,
}

/// Token cache persisted between runs.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TokenCache {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
    #[serde(default)]
    access_tokens: Vec<AccessTokenEntry>,
    #[serde(default)]
    refresh_tokens: Vec<RefreshTokenEntry>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("accounts", &self.accounts.len())
            .field("access_tokens", &self.access_tokens.len())
            .field("refresh_tokens", &self.refresh_tokens.len())
            .finish()
    }
}

impl TokenCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a cache from bytes produced by [`TokenCache::serialize`].
    pub fn deserialize(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.access_tokens.is_empty() && self.refresh_tokens.is_empty()
    }

    /// Accounts signed in under `key`, oldest first.
    pub(crate) fn accounts(&self, key: CacheKey<'_>) -> Vec<Account> {
        self.accounts
            .iter()
            .filter(|e| key.matches(&e.client_id, &e.authority))
            .map(|e| e.account.clone())
            .collect()
    }

    /// An unexpired access token covering every requested scope.
    pub(crate) fn find_access_token(
        &self,
        key: CacheKey<'_>,
        home_account_id: Option<&str>,
        scopes: &[String],
        now: DateTime<Utc>,
    ) -> Option<&AccessTokenEntry> {
        self.access_tokens.iter().find(|e| {
            key.matches(&e.client_id, &e.authority)
                && e.home_account_id.as_deref() == home_account_id
                && e.is_valid(now)
                && covers(&e.scopes, scopes)
        })
    }

    pub(crate) fn refresh_token(&self, key: CacheKey<'_>, home_account_id: &str) -> Option<&str> {
        self.refresh_tokens
            .iter()
            .find(|e| key.matches(&e.client_id, &e.authority) && e.home_account_id == home_account_id)
            .map(|e| e.secret.as_str())
    }

    /// Record a token response. Returns the granted scopes and expiry.
    ///
    /// Older access tokens of the same account whose scopes overlap the new
    /// grant are replaced.
    pub(crate) fn store(
        &mut self,
        key: CacheKey<'_>,
        account: Option<&Account>,
        response: &TokenResponse,
        requested: &[String],
        now: DateTime<Utc>,
    ) -> (Vec<String>, DateTime<Utc>) {
        let mut granted: Vec<String> = response
            .scope
            .split_whitespace()
            .filter(|s| !is_oidc_scope(s))
            .map(str::to_string)
            .collect();
        if granted.is_empty() {
            granted = requested
                .iter()
                .filter(|s| !is_oidc_scope(s))
                .cloned()
                .collect();
        }

        let expires_in = response.expires_in.min(MAX_LIFETIME_SECONDS) as i64;
        let expires_at = now + Duration::seconds(expires_in);
        let home_account_id = account.map(|a| a.home_account_id.clone());

        self.access_tokens.retain(|e| {
            !(key.matches(&e.client_id, &e.authority)
                && e.home_account_id == home_account_id
                && overlaps(&e.scopes, &granted))
        });
        self.access_tokens.push(AccessTokenEntry {
            client_id: key.client_id.to_string(),
            authority: key.authority.to_string(),
            home_account_id: home_account_id.clone(),
            secret: response.access_token.clone(),
            scopes: granted.clone(),
            expires_at,
        });

        if let Some(account) = account {
            match self
                .accounts
                .iter_mut()
                .find(|e| key.matches(&e.client_id, &e.authority) && e.account.home_account_id == account.home_account_id)
            {
                Some(entry) => entry.account = account.clone(),
                None => self.accounts.push(AccountEntry {
                    client_id: key.client_id.to_string(),
                    authority: key.authority.to_string(),
                    account: account.clone(),
                }),
            }

            if let Some(refresh_token) = &response.refresh_token {
                self.refresh_tokens
                    .retain(|e| !(key.matches(&e.client_id, &e.authority) && e.home_account_id == account.home_account_id));
                self.refresh_tokens.push(RefreshTokenEntry {
                    client_id: key.client_id.to_string(),
                    authority: key.authority.to_string(),
                    home_account_id: account.home_account_id.clone(),
                    secret: refresh_token.clone(),
                });
            }
        }

        (granted, expires_at)
    }
}

pub(crate) fn is_oidc_scope(scope: &str) -> bool {
    OIDC_SCOPES.iter().any(|s| s.eq_ignore_ascii_case(scope.trim()))
}

fn normalize_scope(scope: &str) -> String {
    let lower = scope.trim().to_ascii_lowercase();
    match lower.strip_prefix(GRAPH_RESOURCE_PREFIX) {
        Some(short) => short.to_string(),
        None => lower,
    }
}

/// True when `granted` includes every non-OIDC scope in `requested`.
pub(crate) fn covers(granted: &[String], requested: &[String]) -> bool {
    let granted: HashSet<String> = granted.iter().map(|s| normalize_scope(s)).collect();
    requested
        .iter()
        .filter(|s| !is_oidc_scope(s))
        .all(|s| granted.contains(&normalize_scope(s)))
}

fn overlaps(a: &[String], b: &[String]) -> bool {
    let a: HashSet<String> = a.iter().map(|s| normalize_scope(s)).collect();
    b.iter().any(|s| a.contains(&normalize_scope(s)))
}
