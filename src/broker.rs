//! Token broker with silent-first acquisition and a persisted cache.
//!
//! A [`TokenBroker`] runs in exactly one [`Mode`] for its whole lifetime,
//! picked at construction from whether a client secret is configured:
//!
//! - [`Mode::AppOnly`]: cached app token, else a client-credentials exchange.
//! - [`Mode::DelegatedInteractive`]: cached account token (refreshed if
//!   needed), else interactive consent in the browser.
//!
//! Every successful acquisition that changed the cache is written back to the
//! cache file. One broker owns the file; concurrent use of the same path from
//! several processes is unsupported and may lose entries.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{AcquisitionFailure, BrokerError};
use crate::identity::{AccessToken, AzureAdClient, ClientApplication, IdentityProvider, TokenCache};

/// Default scope for app-only tokens: every application permission granted
/// to the app on Microsoft Graph.
pub const DEFAULT_APP_SCOPES: &[&str] = &["https://graph.microsoft.com/.default"];

/// Default scopes for [`TokenBroker::acquire_delegated_token`].
pub const DEFAULT_DELEGATED_SCOPES: &[&str] = &["User.Read", "Files.ReadWrite.All"];

/// Default scopes for [`TokenBroker::get_token`] in delegated mode.
pub const DEFAULT_PROFILE_SCOPES: &[&str] = &["User.Read"];

/// Authentication mode, fixed for the lifetime of a broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// The application acts as itself (client credentials).
    AppOnly,
    /// The application acts for a signed-in user.
    DelegatedInteractive,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::AppOnly => f.write_str("app-only"),
            Mode::DelegatedInteractive => f.write_str("delegated-interactive"),
        }
    }
}

pub struct TokenBroker<P = AzureAdClient> {
    mode: Mode,
    app: ClientApplication<P>,
    cache_path: PathBuf,
    current: Option<AccessToken>,
}

impl TokenBroker<AzureAdClient> {
    /// Build a broker talking to Azure AD.
    pub fn from_config(config: &Config) -> Result<Self, BrokerError> {
        require_client_id(config)?;
        let provider = AzureAdClient::new(config).map_err(|e| BrokerError::Configuration(e.to_string()))?;
        Self::new(config, provider)
    }
}

impl<P: IdentityProvider> TokenBroker<P> {
    /// Build a broker over any identity provider.
    ///
    /// Fails only when no client id is configured. A missing or unreadable
    /// cache file yields an empty cache.
    pub fn new(config: &Config, provider: P) -> Result<Self, BrokerError> {
        let client_id = require_client_id(config)?;

        let mode = if config.has_client_secret() {
            Mode::AppOnly
        } else {
            Mode::DelegatedInteractive
        };

        let cache = load_cache(&config.cache_path);
        info!("Token broker ready in {} mode (cache: {})", mode, config.cache_path.display());

        Ok(Self {
            mode,
            app: ClientApplication::new(client_id, config.authority.as_str(), provider, cache),
            cache_path: config.cache_path.clone(),
            current: None,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// The last token successfully acquired by this broker.
    pub fn current_token(&self) -> Option<&AccessToken> {
        self.current.as_ref()
    }

    /// Acquire an app-only token: cache first, then a client-credentials
    /// exchange. Empty `scopes` means [`DEFAULT_APP_SCOPES`].
    pub async fn acquire_app_only_token(&mut self, scopes: &[&str]) -> Result<AccessToken, BrokerError> {
        self.require_mode(Mode::AppOnly, "acquire_app_only_token")?;
        let scopes = scopes_or_default(scopes, DEFAULT_APP_SCOPES);

        let cached = match self.app.acquire_token_silent(&scopes, None).await {
            Ok(token) => token,
            Err(e) => {
                debug!("Silent app-only acquisition failed: {}", e);
                None
            }
        };

        let token = match cached {
            Some(token) => token,
            None => match self.app.acquire_token_for_client(&scopes).await {
                Ok(token) => token,
                Err(e) => {
                    let failure = AcquisitionFailure::from(e);
                    error!("Client credentials exchange failed: {}", failure);
                    return Err(failure.into());
                }
            },
        };

        Ok(self.accept(token))
    }

    /// Acquire a delegated token: silent against the first cached account,
    /// then interactive consent. Empty `scopes` means
    /// [`DEFAULT_DELEGATED_SCOPES`].
    pub async fn acquire_delegated_token(&mut self, scopes: &[&str]) -> Result<AccessToken, BrokerError> {
        self.require_mode(Mode::DelegatedInteractive, "acquire_delegated_token")?;
        let scopes = scopes_or_default(scopes, DEFAULT_DELEGATED_SCOPES);

        if let Some(token) = self.try_silent_delegated(&scopes).await {
            return Ok(token);
        }

        self.acquire_interactive(&scopes).await
    }

    /// Return a usable token for either mode.
    ///
    /// App-only mode always runs [`Self::acquire_app_only_token`]. Delegated
    /// mode only tries silent acquisition unless `interactive` is set; with no
    /// cached account and `interactive == false` this returns `Ok(None)`
    /// without prompting. Empty `scopes` means [`DEFAULT_PROFILE_SCOPES`] in
    /// delegated mode.
    pub async fn get_token(&mut self, scopes: &[&str], interactive: bool) -> Result<Option<AccessToken>, BrokerError> {
        match self.mode {
            Mode::AppOnly => self.acquire_app_only_token(scopes).await.map(Some),
            Mode::DelegatedInteractive => {
                let scopes = scopes_or_default(scopes, DEFAULT_PROFILE_SCOPES);

                if let Some(token) = self.try_silent_delegated(&scopes).await {
                    return Ok(Some(token));
                }

                if interactive {
                    self.acquire_interactive(&scopes).await.map(Some)
                } else {
                    debug!("No cached token and interactive sign-in not requested");
                    Ok(None)
                }
            }
        }
    }

    /// Silent acquisition against the first cached account. Every failure is
    /// soft and yields `None`.
    async fn try_silent_delegated(&mut self, scopes: &[String]) -> Option<AccessToken> {
        let account = self.app.accounts().into_iter().next()?;

        match self.app.acquire_token_silent(scopes, Some(&account)).await {
            Ok(Some(token)) => Some(self.accept(token)),
            Ok(None) => {
                debug!("No usable cached token for {}", account.username);
                None
            }
            Err(e) => {
                debug!("Silent acquisition for {} failed: {}", account.username, e);
                None
            }
        }
    }

    async fn acquire_interactive(&mut self, scopes: &[String]) -> Result<AccessToken, BrokerError> {
        info!("Starting interactive sign-in for {}", scopes.join(" "));
        match self.app.acquire_token_interactive(scopes).await {
            Ok(token) => {
                if let Some(account) = token.account() {
                    info!("Signed in as {}", account.username);
                }
                Ok(self.accept(token))
            }
            Err(e) => {
                let failure = AcquisitionFailure::from(e);
                error!("Interactive sign-in failed: {}", failure);
                Err(failure.into())
            }
        }
    }

    /// Remember a successful token and persist the cache if it changed.
    fn accept(&mut self, token: AccessToken) -> AccessToken {
        if token.source().updated_cache() {
            self.save_cache();
        }
        self.current = Some(token.clone());
        token
    }

    fn require_mode(&self, required: Mode, operation: &'static str) -> Result<(), BrokerError> {
        if self.mode == required {
            Ok(())
        } else {
            Err(BrokerError::Mode {
                operation,
                mode: self.mode,
            })
        }
    }

    /// Write the cache to disk. Failures are logged, never returned.
    fn save_cache(&self) {
        let bytes = match self.app.cache().serialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to serialize token cache: {}", e);
                return;
            }
        };

        match write_cache(&self.cache_path, &bytes) {
            Ok(()) => debug!("Saved token cache to {}", self.cache_path.display()),
            Err(e) => warn!("Failed to save token cache to {}: {}", self.cache_path.display(), e),
        }
    }
}

fn require_client_id(config: &Config) -> Result<String, BrokerError> {
    config
        .client_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| BrokerError::Configuration("CLIENT_ID must be set via environment or configuration file".into()))
}

fn scopes_or_default(scopes: &[&str], default: &[&str]) -> Vec<String> {
    let chosen = if scopes.is_empty() { default } else { scopes };
    chosen.iter().map(|s| s.to_string()).collect()
}

/// Read the cache file. Anything short of a readable, valid cache yields an
/// empty one.
fn load_cache(path: &Path) -> TokenCache {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("No token cache at {}, starting empty", path.display());
            return TokenCache::new();
        }
        Err(e) => {
            warn!("Failed to read token cache {}: {}, starting empty", path.display(), e);
            return TokenCache::new();
        }
    };

    if bytes.is_empty() {
        return TokenCache::new();
    }

    match TokenCache::deserialize(&bytes) {
        Ok(cache) => {
            debug!("Loaded token cache from {}", path.display());
            cache
        }
        Err(e) => {
            warn!("Ignoring unreadable token cache {}: {}", path.display(), e);
            TokenCache::new()
        }
    }
}

/// Write through a temporary file in the same directory, then rename over the
/// target. The file holds refresh tokens, so it is owner-only on unix.
fn write_cache(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            parent.to_path_buf()
        }
        None => PathBuf::from("."),
    };

    let tmp_path = dir.join(format!(".token_cache.tmp.{}", std::process::id()));
    fs::write(&tmp_path, bytes)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use crate::identity::provider::testing::{FakeProvider, USER_NAME};
    use crate::identity::TokenSource;
    use tempfile::TempDir;

    fn config(dir: &TempDir, env: &[(&str, &str)]) -> Config {
        let cache_path = dir.path().join("token_cache.bin");
        let env: Vec<(String, String)> = env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        let mut config = Config::resolve(FileConfig::default(), move |key: &str| {
            env.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
        })
        .unwrap();
        config.cache_path = cache_path;
        config
    }

    fn app_only(dir: &TempDir) -> Config {
        config(dir, &[("CLIENT_ID", "app-123"), ("CLIENT_SECRET", "s3cret")])
    }

    fn delegated(dir: &TempDir) -> Config {
        config(dir, &[("CLIENT_ID", "app-123")])
    }

    #[test]
    fn test_missing_client_id_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let result = TokenBroker::new(&config(&dir, &[("CLIENT_SECRET", "s3cret")]), FakeProvider::new());
        assert!(matches!(result, Err(BrokerError::Configuration(_))));

        let result = TokenBroker::from_config(&config(&dir, &[]));
        assert!(matches!(result, Err(BrokerError::Configuration(_))));
    }

    #[test]
    fn test_mode_selection() {
        let dir = TempDir::new().unwrap();
        let broker = TokenBroker::new(&app_only(&dir), FakeProvider::new()).unwrap();
        assert_eq!(broker.mode(), Mode::AppOnly);

        let broker = TokenBroker::new(&delegated(&dir), FakeProvider::new()).unwrap();
        assert_eq!(broker.mode(), Mode::DelegatedInteractive);

        let blank_secret = config(&dir, &[("CLIENT_ID", "app-123"), ("CLIENT_SECRET", "   ")]);
        let broker = TokenBroker::new(&blank_secret, FakeProvider::new()).unwrap();
        assert_eq!(broker.mode(), Mode::DelegatedInteractive);
    }

    #[tokio::test]
    async fn test_wrong_mode_is_rejected() {
        let dir = TempDir::new().unwrap();
        let provider = FakeProvider::new();

        let mut broker = TokenBroker::new(&delegated(&dir), provider.clone()).unwrap();
        let err = broker.acquire_app_only_token(&[]).await.unwrap_err();
        assert!(matches!(err, BrokerError::Mode { mode: Mode::DelegatedInteractive, .. }));

        let mut broker = TokenBroker::new(&app_only(&dir), provider.clone()).unwrap();
        let err = broker.acquire_delegated_token(&[]).await.unwrap_err();
        assert!(matches!(err, BrokerError::Mode { mode: Mode::AppOnly, .. }));
        assert!(err.is_fatal());
        assert_eq!(provider.network_calls(), 0);
    }

    #[tokio::test]
    async fn test_app_only_writes_cache_file() {
        let dir = TempDir::new().unwrap();
        let config = app_only(&dir);
        let mut broker = TokenBroker::new(&config, FakeProvider::new()).unwrap();

        let token = broker
            .acquire_app_only_token(&["https://graph.microsoft.com/.default"])
            .await
            .unwrap();

        assert_eq!(token.source(), TokenSource::ClientCredentials);
        assert!(token.account().is_none());
        assert_eq!(broker.current_token().map(|t| t.as_str()), Some(token.as_str()));
        assert!(!fs::read(&config.cache_path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_app_only_second_call_hits_cache() {
        let dir = TempDir::new().unwrap();
        let provider = FakeProvider::new();
        let mut broker = TokenBroker::new(&app_only(&dir), provider.clone()).unwrap();

        let first = broker.acquire_app_only_token(&[]).await.unwrap();
        let second = broker.acquire_app_only_token(&[]).await.unwrap();

        assert_eq!(first.as_str(), second.as_str());
        assert_eq!(second.source(), TokenSource::Cache);
        assert_eq!(provider.client_credentials_calls(), 1);
    }

    #[tokio::test]
    async fn test_app_only_failure_carries_provider_text() {
        let dir = TempDir::new().unwrap();
        let config = app_only(&dir);
        let provider = FakeProvider::new();
        provider.fail_client_credentials("invalid_client", Some("AADSTS7000215: Invalid client secret provided."));
        let mut broker = TokenBroker::new(&config, provider).unwrap();

        match broker.get_token(&[], false).await {
            Err(BrokerError::Acquisition(failure)) => {
                assert_eq!(failure.error, "invalid_client");
                assert!(failure.description.contains("AADSTS7000215"));
            }
            other => panic!("unexpected result: {:?}", other.map(|t| t.is_some())),
        }
        assert!(broker.current_token().is_none());
        assert!(!config.cache_path.exists());
    }

    #[tokio::test]
    async fn test_get_token_without_account_does_not_prompt() {
        let dir = TempDir::new().unwrap();
        let provider = FakeProvider::new();
        let mut broker = TokenBroker::new(&delegated(&dir), provider.clone()).unwrap();

        let token = broker.get_token(&[], false).await.unwrap();
        assert!(token.is_none());
        assert_eq!(provider.interactive_calls(), 0);
    }

    #[tokio::test]
    async fn test_get_token_interactive_opt_in() {
        let dir = TempDir::new().unwrap();
        let config = delegated(&dir);
        let provider = FakeProvider::new();
        let mut broker = TokenBroker::new(&config, provider.clone()).unwrap();

        let token = broker.get_token(&[], true).await.unwrap().unwrap();
        assert_eq!(token.source(), TokenSource::Interactive);
        assert_eq!(token.account().map(|a| a.username.as_str()), Some(USER_NAME));
        assert_eq!(provider.interactive_calls(), 1);
        assert!(config.cache_path.exists());
    }

    #[tokio::test]
    async fn test_interactive_failure_is_soft() {
        let dir = TempDir::new().unwrap();
        let provider = FakeProvider::new();
        provider.fail_interactive("access_denied", None);
        let mut broker = TokenBroker::new(&delegated(&dir), provider).unwrap();

        let err = broker.get_token(&[], true).await.unwrap_err();
        assert!(!err.is_fatal());
        match err {
            BrokerError::Acquisition(failure) => {
                assert_eq!(failure.error, "access_denied");
                assert_eq!(failure.description, "no result");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delegated_silent_first() {
        let dir = TempDir::new().unwrap();
        let provider = FakeProvider::new();
        let mut broker = TokenBroker::new(&delegated(&dir), provider.clone()).unwrap();

        let first = broker.acquire_delegated_token(&[]).await.unwrap();
        let second = broker.acquire_delegated_token(&[]).await.unwrap();

        assert_eq!(first.as_str(), second.as_str());
        assert_eq!(second.source(), TokenSource::Cache);
        assert_eq!(provider.interactive_calls(), 1);
    }

    #[tokio::test]
    async fn test_delegated_falls_back_to_interactive_when_refresh_fails() {
        let dir = TempDir::new().unwrap();
        let provider = FakeProvider::new();
        provider.issue_expiring_in(60);
        provider.fail_refresh();
        let mut broker = TokenBroker::new(&delegated(&dir), provider.clone()).unwrap();

        broker.acquire_delegated_token(&[]).await.unwrap();
        let token = broker.acquire_delegated_token(&[]).await.unwrap();

        assert_eq!(token.source(), TokenSource::Interactive);
        assert_eq!(provider.refresh_calls(), 1);
        assert_eq!(provider.interactive_calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_round_trip_across_instances() {
        let dir = TempDir::new().unwrap();
        let config = delegated(&dir);
        let provider = FakeProvider::new();

        let mut broker = TokenBroker::new(&config, provider.clone()).unwrap();
        let signed_in = broker.get_token(&["User.Read"], true).await.unwrap().unwrap();
        drop(broker);

        let mut restored = TokenBroker::new(&config, provider.clone()).unwrap();
        let token = restored.get_token(&["User.Read"], false).await.unwrap().unwrap();

        assert_eq!(token.as_str(), signed_in.as_str());
        assert_eq!(provider.interactive_calls(), 1);
    }

    #[tokio::test]
    async fn test_app_token_not_reused_across_tenants() {
        let dir = TempDir::new().unwrap();
        let provider = FakeProvider::new();
        let tenant_a = config(&dir, &[("CLIENT_ID", "app-123"), ("CLIENT_SECRET", "s3cret"), ("TENANT_ID", "tenant-a")]);
        let tenant_b = config(&dir, &[("CLIENT_ID", "app-123"), ("CLIENT_SECRET", "s3cret"), ("TENANT_ID", "tenant-b")]);

        let mut broker = TokenBroker::new(&tenant_a, provider.clone()).unwrap();
        let first = broker.acquire_app_only_token(&[]).await.unwrap();
        drop(broker);

        let mut broker = TokenBroker::new(&tenant_b, provider.clone()).unwrap();
        let second = broker.acquire_app_only_token(&[]).await.unwrap();
        assert_ne!(first.as_str(), second.as_str());
        assert_eq!(second.source(), TokenSource::ClientCredentials);
        assert_eq!(provider.client_credentials_calls(), 2);
        drop(broker);

        // Both tenants now live in the same file
        let mut broker = TokenBroker::new(&tenant_a, provider.clone()).unwrap();
        let again = broker.acquire_app_only_token(&[]).await.unwrap();
        assert_eq!(again.as_str(), first.as_str());
        assert_eq!(again.source(), TokenSource::Cache);
        assert_eq!(provider.client_credentials_calls(), 2);
    }

    #[tokio::test]
    async fn test_account_not_reused_across_tenants() {
        let dir = TempDir::new().unwrap();
        let provider = FakeProvider::new();
        let tenant_a = config(&dir, &[("CLIENT_ID", "app-123"), ("TENANT_ID", "tenant-a")]);
        let tenant_b = config(&dir, &[("CLIENT_ID", "app-123"), ("AUTHORITY", "https://login.microsoftonline.com/tenant-b")]);

        let mut broker = TokenBroker::new(&tenant_a, provider.clone()).unwrap();
        broker.get_token(&[], true).await.unwrap().unwrap();
        drop(broker);

        let mut broker = TokenBroker::new(&tenant_b, provider.clone()).unwrap();
        assert!(broker.get_token(&[], false).await.unwrap().is_none());
        assert_eq!(provider.refresh_calls(), 0);
        assert_eq!(provider.interactive_calls(), 1);
    }

    #[tokio::test]
    async fn test_restored_account_refreshes_silently() {
        let dir = TempDir::new().unwrap();
        let config = delegated(&dir);
        let provider = FakeProvider::new();
        provider.issue_expiring_in(60);

        let mut broker = TokenBroker::new(&config, provider.clone()).unwrap();
        broker.get_token(&[], true).await.unwrap().unwrap();
        drop(broker);

        let mut restored = TokenBroker::new(&config, provider.clone()).unwrap();
        let token = restored.get_token(&[], false).await.unwrap().unwrap();

        assert_eq!(token.source(), TokenSource::RefreshToken);
        assert_eq!(provider.interactive_calls(), 1);
        assert_eq!(provider.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_cache_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let config = delegated(&dir);
        fs::write(&config.cache_path, b"{ this is not a token cache").unwrap();

        let provider = FakeProvider::new();
        let mut broker = TokenBroker::new(&config, provider.clone()).unwrap();
        assert!(broker.get_token(&[], false).await.unwrap().is_none());

        broker.get_token(&[], true).await.unwrap().unwrap();
        let rewritten = fs::read(&config.cache_path).unwrap();
        assert!(TokenCache::deserialize(&rewritten).is_ok());
    }

    #[test]
    fn test_missing_and_empty_cache_files() {
        let dir = TempDir::new().unwrap();
        assert!(load_cache(&dir.path().join("absent.bin")).is_empty());

        let empty = dir.path().join("empty.bin");
        fs::write(&empty, b"").unwrap();
        assert!(load_cache(&empty).is_empty());
    }

    #[tokio::test]
    async fn test_save_failure_does_not_fail_acquisition() {
        let dir = TempDir::new().unwrap();
        let mut config = app_only(&dir);
        // A directory where the cache file should be
        config.cache_path = dir.path().to_path_buf();
        let mut broker = TokenBroker::new(&config, FakeProvider::new()).unwrap();

        let token = broker.acquire_app_only_token(&[]).await;
        assert!(token.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn test_cache_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("cache.bin");
        write_cache(&path, b"{}").unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_scopes_or_default() {
        assert_eq!(scopes_or_default(&[], DEFAULT_APP_SCOPES), vec!["https://graph.microsoft.com/.default"]);
        assert_eq!(scopes_or_default(&["Mail.Read"], DEFAULT_PROFILE_SCOPES), vec!["Mail.Read"]);
    }
}
