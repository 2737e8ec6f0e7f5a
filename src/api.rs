use crate::config::{AppConfig, DashboardId};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::error::Error as _;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const LOGIN_PATH: &str = "/api/v1/security/login";
pub const GUEST_TOKEN_PATH: &str = "/api/v1/security/guest_token/";
pub const HEALTH_PATH: &str = "/health";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("request timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("request failed: {}", error_chain(.0))]
    Transport(#[source] reqwest::Error),
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ApiError {
    pub fn is_config(&self) -> bool {
        matches!(self, ApiError::InvalidBaseUrl { .. })
    }
}

/// Flattens an error and its sources into one line; reqwest keeps the
/// useful part (connection refused, dns failure) in the source chain.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Everything the checks need from one response, fully read.
#[derive(Debug, Clone)]
pub struct HttpSnapshot {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpSnapshot {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_str(&self.body)?)
    }

    pub fn body_excerpt(&self, max_chars: usize) -> String {
        excerpt(&self.body, max_chars)
    }
}

pub fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

pub fn parse_base_url(raw: &str) -> Result<Url, ApiError> {
    let invalid = |reason: String| ApiError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {:?}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(url)
}

pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}

/// HTTP client for the Superset REST API. Every call carries the
/// configured timeout; nothing is retried.
#[derive(Clone)]
pub struct SupersetClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl SupersetClient {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
            timeout: config.timeout,
        })
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn base_url(&self) -> Result<Url, ApiError> {
        parse_base_url(&self.base_url)
    }

    pub fn server_origin(&self) -> Result<String, ApiError> {
        Ok(origin_of(&self.base_url()?))
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        let base = self.base_url()?;
        let joined = format!("{}{}", base.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|e| ApiError::InvalidBaseUrl {
            url: self.base_url.clone(),
            reason: e.to_string(),
        })
    }

    /// Standalone dashboard page; the guest token is never part of the URL.
    pub fn dashboard_url(&self, id: &DashboardId) -> Result<Url, ApiError> {
        let mut url = self.endpoint("/superset/dashboard/")?;
        url.path_segments_mut()
            .map_err(|()| ApiError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: "base URL cannot carry a path".to_string(),
            })?
            .pop_if_empty()
            .push(&id.to_string())
            .push("");
        url.query_pairs_mut().append_pair("standalone", "1");
        Ok(url)
    }

    pub async fn get(&self, url: Url) -> Result<HttpSnapshot, ApiError> {
        debug!(%url, "GET");
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.snapshot(resp).await
    }

    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: Url,
        bearer: Option<&str>,
        body: &B,
    ) -> Result<HttpSnapshot, ApiError> {
        debug!(%url, "POST");
        let mut request = self.http.post(url).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let resp = request.send().await.map_err(|e| self.map_err(e))?;
        self.snapshot(resp).await
    }

    async fn snapshot(&self, resp: reqwest::Response) -> Result<HttpSnapshot, ApiError> {
        let status = resp.status();
        let headers = resp.headers().clone();
        debug!(url = %resp.url(), %status, "response received");
        let body = resp.text().await.map_err(|e| self.map_err(e))?;
        Ok(HttpSnapshot {
            status,
            headers,
            body,
        })
    }

    pub fn map_err(&self, err: reqwest::Error) -> ApiError {
        if err.is_timeout() {
            ApiError::Timeout(self.timeout)
        } else if err.is_builder() {
            ApiError::InvalidBaseUrl {
                url: self.base_url.clone(),
                reason: err
                    .source()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| err.to_string()),
            }
        } else {
            ApiError::Transport(err)
        }
    }
}
