//! Microsoft Graph permission probe.
//!
//! Calls a handful of Graph endpoints with a bearer token and reports, per
//! endpoint, whether the call went through or was refused.

use reqwest::StatusCode;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::broker::Mode;
use crate::error::ApiError;
use crate::identity::AccessToken;

/// Base URL for Microsoft Graph API.
pub const GRAPH_BASE_URL: &str = "https://graph.microsoft.com/v1.0";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters of a successful response kept in the report.
const SAMPLE_LEN: usize = 1000;
/// Characters of an error body kept in the report.
const BODY_LEN: usize = 500;

/// A Graph endpoint and the permission it exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub name: &'static str,
    pub path: &'static str,
    pub description: &'static str,
}

pub const ENDPOINTS: &[Endpoint] = &[
    Endpoint {
        name: "users_list",
        path: "/users?$top=1",
        description: "Read all users' full profiles (User.Read.All)",
    },
    Endpoint {
        name: "me_profile",
        path: "/me",
        description: "Sign in and read user profile (User.Read)",
    },
    Endpoint {
        name: "drive_root",
        path: "/me/drive/root",
        description: "Files access (Files.Read.All or Files.ReadWrite.All)",
    },
    Endpoint {
        name: "sites_search",
        path: "/sites?search=*",
        description: "Site collections access (Sites.FullControl.All)",
    },
];

/// Scopes to request before probing, by client mode.
pub fn scopes_for(mode: Mode) -> &'static [&'static str] {
    match mode {
        Mode::AppOnly => &["https://graph.microsoft.com/.default"],
        Mode::DelegatedInteractive => &["User.Read", "Files.Read.All", "Sites.FullControl.All"],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStatus {
    /// 200: the permission is granted.
    Pass,
    /// 401 or 403: the permission is likely missing.
    Fail,
    /// Any other HTTP status.
    Warn,
    /// The request never got an HTTP answer.
    Error,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Result of probing one endpoint.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub endpoint: Endpoint,
    pub status: ProbeStatus,
    /// HTTP status line, e.g. `403 Forbidden`. Empty for transport errors.
    pub http_status: String,
    /// Truncated response sample, error body, or transport error text.
    pub detail: String,
}

impl ProbeOutcome {
    fn from_response(endpoint: Endpoint, status: StatusCode, body: &str) -> Self {
        let (probe_status, detail) = classify(status, body);
        Self {
            endpoint,
            status: probe_status,
            http_status: status_line(status),
            detail,
        }
    }

    fn from_error(endpoint: Endpoint, err: ApiError) -> Self {
        Self {
            endpoint,
            status: ProbeStatus::Error,
            http_status: String::new(),
            detail: err.to_string(),
        }
    }
}

impl fmt::Display for ProbeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Endpoint { name, description, .. } = self.endpoint;
        match self.status {
            ProbeStatus::Pass => write!(
                f,
                "[PASS] {}: {} -> {}\n  sample: {}",
                name, description, self.http_status, self.detail
            ),
            ProbeStatus::Fail => write!(
                f,
                "[FAIL] {}: {} -> {} (likely missing permission)\n  body: {}",
                name, description, self.http_status, self.detail
            ),
            ProbeStatus::Warn => write!(
                f,
                "[WARN] {}: {} -> {}\n  body: {}",
                name, description, self.http_status, self.detail
            ),
            ProbeStatus::Error => write!(f, "[ERROR] {}: request to {} failed: {}", name, self.endpoint.path, self.detail),
        }
    }
}

/// Classify a Graph response and pick the text worth showing.
pub fn classify(status: StatusCode, body: &str) -> (ProbeStatus, String) {
    match status.as_u16() {
        200 => (ProbeStatus::Pass, truncate(&json_sample(body), SAMPLE_LEN)),
        401 | 403 => (ProbeStatus::Fail, truncate(body, BODY_LEN)),
        _ => (ProbeStatus::Warn, truncate(body, BODY_LEN)),
    }
}

fn status_line(status: StatusCode) -> String {
    match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    }
}

/// Pretty-printed JSON body. Non-object JSON is wrapped as `{"result": ...}`;
/// anything that is not JSON is returned as is.
fn json_sample(body: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(value) => {
            let value = if value.is_object() {
                value
            } else {
                serde_json::json!({ "result": value })
            };
            serde_json::to_string_pretty(&value).unwrap_or_else(|_| body.to_string())
        }
        Err(_) => body.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Microsoft Graph client used by the probe.
pub struct GraphClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl GraphClient {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_url(GRAPH_BASE_URL)
    }

    /// Client against another Graph root, e.g. a national cloud.
    pub fn with_base_url(base_url: &str) -> Result<Self, ApiError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Client(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Probe a single endpoint. Never fails; transport errors become
    /// [`ProbeStatus::Error`].
    pub async fn probe(&self, token: &AccessToken, endpoint: Endpoint) -> ProbeOutcome {
        let url = format!("{}{}", self.base_url, endpoint.path);
        debug!("Probing {}", url);

        match self.get(token, &url).await {
            Ok((status, body)) => {
                let outcome = ProbeOutcome::from_response(endpoint, status, &body);
                debug!("{} -> {}", endpoint.name, outcome.status);
                outcome
            }
            Err(e) => {
                warn!("Probe of {} failed: {}", endpoint.name, e);
                ProbeOutcome::from_error(endpoint, e)
            }
        }
    }

    /// Probe every endpoint in [`ENDPOINTS`], in order.
    pub async fn probe_all(&self, token: &AccessToken) -> Vec<ProbeOutcome> {
        let mut outcomes = Vec::with_capacity(ENDPOINTS.len());
        for endpoint in ENDPOINTS {
            outcomes.push(self.probe(token, *endpoint).await);
        }
        outcomes
    }

    async fn get(&self, token: &AccessToken, url: &str) -> Result<(StatusCode, String), ApiError> {
        let response = self
            .http_client
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token.bearer_header())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| ApiError::GraphRequestFailed(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::GraphRequestFailed(e.to_string()))?;
        Ok((status, body))
    }
}
