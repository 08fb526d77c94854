//! HTTP transport for the tally client.
//!
//! Delivers events to the collector's tracking API and performs token
//! rotation and revocation. Responses are classified for the flush logic:
//!
//! | Outcome                              | Result                              |
//! |--------------------------------------|-------------------------------------|
//! | 2xx                                  | success                             |
//! | 408, 429, 5xx, network failure       | [`TransportError::Retryable`]       |
//! | 401, 403, missing credentials        | [`TransportError::Unauthorized`]    |
//! | any other status                     | [`TransportError::Permanent`]       |

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tally_core::{CustomerIds, EventRecord, ProjectToken, Properties, Transport, TransportError};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Default request timeout for collector calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_BASE_URL: &str = "https://api.exponea.com";

/// Errors building a transport.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("invalid base url {url}: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    /// The URL parses but cannot carry a path (e.g. `mailto:`).
    #[error("base url {url} cannot be used for http requests")]
    UnsupportedBaseUrl { url: String },
    /// The provided authorization was invalid.
    #[error("invalid authorization: {reason}")]
    InvalidAuthorization { reason: &'static str },
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Collector client.
///
/// # Thread Safety
///
/// The transport is safe to share across tasks. Clones share the
/// underlying HTTP connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    authorization: Option<String>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .field(
                "authorization",
                &self.authorization.as_ref().map(|_| "[REDACTED]"),
            )
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct TrackEventBody<'a> {
    customer_ids: &'a CustomerIds,
    event_type: &'a str,
    /// Unix seconds.
    timestamp: f64,
    properties: &'a Properties,
}

#[derive(Debug, Deserialize)]
struct RotateResponse {
    token: String,
}

impl HttpTransport {
    /// Creates a transport for the collector at `base_url`.
    ///
    /// `authorization` is only needed for token operations; event tracking
    /// works without it.
    pub fn new(base_url: &str, authorization: Option<String>) -> Result<Self, HttpError> {
        Self::with_timeout(base_url, authorization, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: &str,
        authorization: Option<String>,
        timeout: Duration,
    ) -> Result<Self, HttpError> {
        let parsed = Url::parse(base_url).map_err(|source| HttpError::InvalidBaseUrl {
            url: base_url.to_string(),
            source,
        })?;
        if parsed.cannot_be_a_base() {
            return Err(HttpError::UnsupportedBaseUrl {
                url: base_url.to_string(),
            });
        }

        if let Some(auth) = &authorization {
            if auth.trim().is_empty() {
                return Err(HttpError::InvalidAuthorization {
                    reason: "authorization cannot be empty or whitespace-only",
                });
            }
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HttpError::ClientBuild)?;

        Ok(Self {
            http,
            base_url: parsed,
            authorization,
        })
    }

    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in the constructor; cannot-be-a-base URLs are rejected.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn authorization(&self) -> Result<String, TransportError> {
        self.authorization
            .as_deref()
            .map(|auth| format!("Token {auth}"))
            .ok_or_else(|| TransportError::Unauthorized("no authorization configured".to_string()))
    }

    async fn post(
        &self,
        url: Url,
        body: Option<&impl Serialize>,
        require_auth: bool,
    ) -> Result<String, TransportError> {
        let mut request = self.http.post(url.clone());
        if require_auth || self.authorization.is_some() {
            request = request.header(AUTHORIZATION, self.authorization()?);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(classify_request_error)?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        debug!(%url, %status, "collector responded");
        if status.is_success() {
            Ok(body)
        } else {
            Err(classify_status(status, &body))
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, event: &EventRecord) -> Result<(), TransportError> {
        let url = self.endpoint(&[
            "track",
            "v2",
            "projects",
            event.project_token.as_str(),
            "customers",
            "events",
        ]);
        let body = TrackEventBody {
            customer_ids: &event.customer_ids,
            event_type: event.event_type.as_str(),
            timestamp: unix_seconds(event),
            properties: &event.properties,
        };
        self.post(url, Some(&body), false).await?;
        Ok(())
    }

    async fn rotate_token(&self, token: &ProjectToken) -> Result<String, TransportError> {
        let url = self.endpoint(&["data", "v2", token.as_str(), "tokens", "rotate"]);
        let body = self.post(url, None::<&()>, true).await?;
        let payload: RotateResponse =
            serde_json::from_str(&body).map_err(|err| TransportError::Other(Box::new(err)))?;
        Ok(payload.token)
    }

    async fn revoke_token(&self, token: &ProjectToken) -> Result<(), TransportError> {
        let url = self.endpoint(&["data", "v2", token.as_str(), "tokens", "revoke"]);
        self.post(url, None::<&()>, true).await?;
        Ok(())
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "millisecond unix timestamps fit f64's exact integer range"
)]
fn unix_seconds(event: &EventRecord) -> f64 {
    event.timestamp.timestamp_millis() as f64 / 1000.0
}

fn classify_request_error(err: reqwest::Error) -> TransportError {
    if err.is_builder() {
        TransportError::Permanent(err.to_string())
    } else {
        TransportError::Retryable(err.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> TransportError {
    let message = parse_api_error(body).unwrap_or_else(|| format!("status {status}: {body}"));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransportError::Retryable(message)
        }
        status if status.is_server_error() => TransportError::Retryable(message),
        _ => TransportError::Permanent(message),
    }
}

/// Extracts the collector's error message, if the body carries one.
fn parse_api_error(body: &str) -> Option<String> {
    #[derive(Deserialize)]
    struct ErrorPayload {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        errors: Vec<serde_json::Value>,
    }

    let payload = serde_json::from_str::<ErrorPayload>(body).ok()?;
    if let Some(error) = payload.error {
        return Some(error);
    }
    let messages: Vec<String> = payload
        .errors
        .into_iter()
        .map(|value| match value {
            serde_json::Value::String(message) => message,
            other => other.to_string(),
        })
        .collect();
    (!messages.is_empty()).then(|| messages.join("; "))
}
