use crate::api::{ApiError, LOGIN_PATH, SupersetClient};
use crate::config::AppConfig;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("login rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("login response did not contain an access token")]
    MissingToken,
    #[error(transparent)]
    Api(#[from] ApiError),
}

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
    pub provider: &'static str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    access_token: Option<String>,
}

/// Bearer token for the Superset API, absent until a login succeeds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub bearer_token: Option<String>,
}

/// Owns the single session of one embedder or one diagnostic run.
pub struct SessionManager {
    client: SupersetClient,
    credentials: LoginRequest,
    session: Session,
}

impl SessionManager {
    pub fn new(client: SupersetClient, config: &AppConfig) -> Self {
        Self {
            client,
            credentials: LoginRequest {
                username: config.username.clone(),
                password: config.password.clone(),
                provider: "db",
            },
            session: Session::default(),
        }
    }

    pub fn client(&self) -> &SupersetClient {
        &self.client
    }

    pub fn bearer(&self) -> Option<&str> {
        self.session.bearer_token.as_deref()
    }

    pub fn reset(&mut self) {
        self.session = Session::default();
    }

    /// Logs in unless a token is already held. `false` means the single
    /// login attempt failed; the caller may call again later.
    pub async fn ensure_session(&mut self) -> bool {
        self.ensure().await.is_ok()
    }

    /// Like [`ensure_session`](Self::ensure_session) but keeps the reason.
    pub async fn ensure(&mut self) -> Result<&str, SessionError> {
        if self.session.bearer_token.is_some() {
            debug!("reusing existing access token");
            return Ok(self.bearer().unwrap_or_default());
        }
        match self.login().await {
            Ok(token) => {
                info!(user = %self.credentials.username, "login successful; access token obtained");
                self.session.bearer_token = Some(token);
                Ok(self.bearer().unwrap_or_default())
            }
            Err(err) => {
                warn!(user = %self.credentials.username, %err, "login failed");
                self.reset();
                Err(err)
            }
        }
    }

    async fn login(&self) -> Result<String, SessionError> {
        debug!(user = %self.credentials.username, "attempting login");
        let url = self.client.endpoint(LOGIN_PATH)?;
        let resp = self.client.post_json(url, None, &self.credentials).await?;
        if !resp.is_success() {
            return Err(SessionError::Rejected {
                status: resp.status,
                body: resp.body_excerpt(200),
            });
        }
        let body: LoginResponse = resp.json()?;
        body.access_token
            .filter(|t| !t.is_empty())
            .ok_or(SessionError::MissingToken)
    }
}
