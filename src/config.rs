//! Configuration loading and management.
//!
//! Built-in defaults are embedded from config.toml. An optional TOML file
//! (`graphbroker.toml` or `--config <path>`) fills in values, and environment
//! variables take precedence over both. The environment is read once here;
//! the rest of the crate only sees the resulting [`Config`].

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

use crate::secure::SecureString;

/// Embedded configuration file content.
const CONFIG_TOML: &str = include_str!("../config.toml");

/// Configuration file picked up from the working directory when present.
pub const DEFAULT_CONFIG_FILE: &str = "graphbroker.toml";

/// Host of the Microsoft identity platform.
pub const AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Multi-tenant authority used when neither tenant nor authority is set.
pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/common";

/// Values as they appear in a configuration file. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub tenant_id: Option<String>,
    pub authority: Option<String>,
    pub cache_path: Option<PathBuf>,
    pub redirect_port: Option<u16>,
    #[serde(default)]
    pub logging: FileLoggingConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileLoggingConfig {
    pub level: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl FileConfig {
    /// Parse a TOML configuration document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration")
    }

    /// Values set in `other` replace the ones in `self`.
    fn overlay(self, other: FileConfig) -> FileConfig {
        FileConfig {
            client_id: other.client_id.or(self.client_id),
            client_secret: other.client_secret.or(self.client_secret),
            tenant_id: other.tenant_id.or(self.tenant_id),
            authority: other.authority.or(self.authority),
            cache_path: other.cache_path.or(self.cache_path),
            redirect_port: other.redirect_port.or(self.redirect_port),
            logging: FileLoggingConfig {
                level: other.logging.level.or(self.logging.level),
                log_dir: other.logging.log_dir.or(self.logging.log_dir),
            },
        }
    }
}

/// Resolved, immutable configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Application (client) id. Absence is reported by the broker, not here.
    pub client_id: Option<String>,
    /// Presence of a non-empty secret selects app-only mode.
    pub client_secret: Option<SecureString>,
    pub tenant_id: Option<String>,
    /// Fully resolved authority URL, without a trailing slash.
    pub authority: String,
    pub cache_path: PathBuf,
    /// Port of the loopback redirect URI used by interactive sign-in.
    pub redirect_port: u16,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub log_dir: PathBuf,
}

impl Config {
    /// Load configuration from the embedded defaults, an optional file and
    /// the process environment.
    ///
    /// An explicit `path` must exist. Without one, `graphbroker.toml` in the
    /// working directory is used if present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut file = FileConfig::from_toml(CONFIG_TOML).context("Failed to parse embedded config.toml")?;

        let user_file = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };

        if let Some(p) = user_file {
            let content = std::fs::read_to_string(&p)
                .with_context(|| format!("Failed to read configuration file {}", p.display()))?;
            let parsed = FileConfig::from_toml(&content)
                .with_context(|| format!("Invalid configuration file {}", p.display()))?;
            file = file.overlay(parsed);
        }

        Self::resolve(file, |key| env::var(key).ok())
    }

    /// Combine file values with environment lookups. Environment wins; blank
    /// values count as unset.
    pub fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let file_value = |v: Option<String>| v.filter(|v| !v.trim().is_empty());

        let client_id = lookup("CLIENT_ID").or_else(|| file_value(file.client_id));
        let client_secret = lookup("CLIENT_SECRET")
            .or_else(|| file_value(file.client_secret))
            .map(SecureString::new);
        let tenant_id = lookup("TENANT_ID").or_else(|| file_value(file.tenant_id));
        let authority = lookup("AUTHORITY").or_else(|| file_value(file.authority));
        let authority = resolve_authority(authority.as_deref(), tenant_id.as_deref());

        let cache_path = lookup("GRAPHBROKER_CACHE_PATH")
            .map(PathBuf::from)
            .or(file.cache_path)
            .unwrap_or_else(|| PathBuf::from("token_cache.bin"));

        let redirect_port = match lookup("GRAPHBROKER_REDIRECT_PORT") {
            Some(port) => port
                .trim()
                .parse()
                .with_context(|| format!("GRAPHBROKER_REDIRECT_PORT is not a valid port: {}", port))?,
            None => file.redirect_port.unwrap_or(28491),
        };

        let level = lookup("LOG_LEVEL")
            .or_else(|| lookup("RUST_LOG"))
            .or(file.logging.level)
            .unwrap_or_else(|| "info".to_string());

        Ok(Config {
            client_id,
            client_secret,
            tenant_id,
            authority,
            cache_path,
            redirect_port,
            logging: LoggingConfig {
                level: normalize_level(&level),
                log_dir: file.logging.log_dir.unwrap_or_else(|| PathBuf::from("logs")),
            },
        })
    }

    /// True when a non-empty client secret is configured.
    pub fn has_client_secret(&self) -> bool {
        self.client_secret.as_ref().is_some_and(|s| !s.is_empty())
    }

    /// Get the authorization URL for Azure AD.
    pub fn auth_url(&self) -> String {
        format!("{}/oauth2/v2.0/authorize", self.authority)
    }

    /// Get the token URL for Azure AD.
    pub fn token_url(&self) -> String {
        format!("{}/oauth2/v2.0/token", self.authority)
    }

    /// Loopback redirect URI registered for interactive sign-in.
    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/callback", self.redirect_port)
    }
}

/// Explicit authority first, then the tenant, then the multi-tenant endpoint.
fn resolve_authority(authority: Option<&str>, tenant_id: Option<&str>) -> String {
    match (authority, tenant_id) {
        (Some(authority), _) => authority.trim().trim_end_matches('/').to_string(),
        (None, Some(tenant)) => format!("{}/{}", AUTHORITY_HOST, tenant.trim()),
        (None, None) => DEFAULT_AUTHORITY.to_string(),
    }
}

/// Accept level names such as `WARNING` and `CRITICAL` alongside
/// `tracing` filter directives.
fn normalize_level(level: &str) -> String {
    match level.trim().to_ascii_lowercase().as_str() {
        "warning" => "warn".to_string(),
        "critical" | "fatal" => "error".to_string(),
        "notset" => "trace".to_string(),
        other => other.to_string(),
    }
}
