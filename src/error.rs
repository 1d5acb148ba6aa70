//! Error types for graphbroker.
//!
//! Uses `thiserror` for library-style errors with automatic `Display` and `Error` implementations.

use thiserror::Error;

use crate::broker::Mode;

/// Diagnostic used when the identity provider gave no detail at all.
pub const NO_RESULT: &str = "no result";

/// Errors returned by [`crate::TokenBroker`].
///
/// `Configuration` and `Mode` are caller mistakes and fatal. `Acquisition`
/// is the soft outcome of the last strategy in an acquisition chain; callers
/// may retry or prompt the user again.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{operation} is not available in {mode} mode")]
    Mode { operation: &'static str, mode: Mode },

    #[error("Token acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionFailure),
}

impl BrokerError {
    /// Returns true for errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Acquisition(_))
    }

    /// Returns a user-friendly message for display on the console.
    pub fn user_message(&self) -> &str {
        match self {
            Self::Configuration(_) => "Configuration error. Set CLIENT_ID (and CLIENT_SECRET for app-only access).",
            Self::Mode { mode: Mode::AppOnly, .. } => {
                "This operation needs a delegated client. Remove CLIENT_SECRET to sign in as a user."
            }
            Self::Mode { .. } => "This operation needs CLIENT_SECRET (app-only client).",
            Self::Acquisition(_) => "Could not obtain an access token. Check your app registration and try again.",
        }
    }
}

/// Structured failure of the final acquisition strategy, carrying whatever
/// the identity provider said.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{error}: {description}")]
pub struct AcquisitionFailure {
    pub error: String,
    pub description: String,
}

impl From<AuthError> for AcquisitionFailure {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Provider { error, description } => Self {
                error,
                description: description
                    .filter(|d| !d.trim().is_empty())
                    .unwrap_or_else(|| NO_RESULT.to_string()),
            },
            other => Self {
                error: other.code().to_string(),
                description: other.to_string(),
            },
        }
    }
}

/// Identity-layer errors.
#[derive(Error, Debug)]
pub enum AuthError {
    /// The token endpoint answered with an OAuth error body.
    #[error("{error}: {}", .description.as_deref().unwrap_or(NO_RESULT))]
    Provider {
        error: String,
        description: Option<String>,
    },

    #[error("Token request failed: {0}")]
    Transport(String),

    #[error("OAuth2 authorization failed: {0}")]
    OAuthFailed(String),

    #[error("Invalid authorization code")]
    InvalidAuthCode,

    #[error("State validation failed (possible CSRF attack)")]
    StateValidationFailed,

    #[error("Callback server error: {0}")]
    CallbackServer(String),

    #[error("User cancelled authentication")]
    UserCancelled,

    #[error("Client credentials flow requires a client secret")]
    MissingClientSecret,

    #[error("Invalid authority URL: {0}")]
    InvalidAuthority(String),
}

impl AuthError {
    /// Short machine-readable code, in the style of OAuth `error` values.
    pub fn code(&self) -> &str {
        match self {
            Self::Provider { error, .. } => error,
            Self::Transport(_) => "transport_error",
            Self::OAuthFailed(_) => "authorization_failed",
            Self::InvalidAuthCode => "invalid_callback",
            Self::StateValidationFailed => "state_mismatch",
            Self::CallbackServer(_) => "callback_server_error",
            Self::UserCancelled => "user_cancelled",
            Self::MissingClientSecret => "missing_client_secret",
            Self::InvalidAuthority(_) => "invalid_authority",
        }
    }
}

/// Microsoft Graph request errors.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Failed to create HTTP client: {0}")]
    Client(String),

    #[error("Graph API request failed: {0}")]
    GraphRequestFailed(String),
}
