use crate::api::{ApiError, GUEST_TOKEN_PATH};
use crate::auth::{SessionError, SessionManager};
use crate::config::DashboardId;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Identity presented to the guest-token endpoint. Not validated locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GuestUser {
    pub username: String,
    pub first_name: String,
    pub last_name: String,
}

impl GuestUser {
    pub fn new(username: &str, first_name: &str, last_name: &str) -> Self {
        Self {
            username: username.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
        }
    }

    /// Fixed identity used by the diagnostic checks.
    pub fn diagnostic() -> Self {
        Self::new("embed-bot-diag", "Embed", "Bot")
    }

    /// Template identity with a millisecond suffix so each embed gets its own guest.
    pub fn unique_from(template: &GuestUser) -> Self {
        Self {
            username: format!(
                "{}-{}",
                template.username,
                chrono::Utc::now().timestamp_millis()
            ),
            ..template.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Dashboard,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub kind: ResourceKind,
    pub id: String,
}

impl ResourceRef {
    /// The endpoint expects the id as a string whether it is numeric or a slug.
    pub fn dashboard(id: &DashboardId) -> Self {
        Self {
            kind: ResourceKind::Dashboard,
            id: id.to_string(),
        }
    }
}

/// Row-level security rule attached to a guest token. Accepted by the
/// request shape, never populated here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RlsRule {
    pub clause: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GuestTokenRequest {
    pub user: GuestUser,
    pub resources: Vec<ResourceRef>,
    pub rls: Vec<RlsRule>,
}

impl GuestTokenRequest {
    pub fn new(resource: ResourceRef, user: GuestUser) -> Self {
        Self {
            user,
            resources: vec![resource],
            rls: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GuestTokenResponse {
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Error)]
pub enum GuestTokenError {
    #[error("login failed: {0}")]
    Login(#[source] SessionError),
    #[error("guest token request rejected with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("guest token response (status {status}) did not contain a token")]
    MissingToken { status: StatusCode },
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Best-effort reading of vendor error text; never decides pass/fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureHint {
    MissingCsrfToken,
}

impl GuestTokenError {
    pub fn hint(&self) -> Option<FailureHint> {
        match self {
            GuestTokenError::Rejected { body, .. } if mentions_missing_csrf(body) => {
                Some(FailureHint::MissingCsrfToken)
            }
            _ => None,
        }
    }
}

fn mentions_missing_csrf(body: &str) -> bool {
    body.to_ascii_lowercase().contains("csrf token is missing")
}

/// Requests a guest token, logging in first when no session is held.
pub async fn issue_guest_token(
    sessions: &mut SessionManager,
    resource: ResourceRef,
    user: GuestUser,
) -> Result<String, GuestTokenError> {
    let bearer = sessions
        .ensure()
        .await
        .map_err(GuestTokenError::Login)?
        .to_string();

    debug!(resource = %resource.id, guest = %user.username, "requesting guest token");
    let client = sessions.client();
    let url = client.endpoint(GUEST_TOKEN_PATH)?;
    let body = GuestTokenRequest::new(resource, user);
    let resp = client.post_json(url, Some(&bearer), &body).await?;
    if !resp.is_success() {
        return Err(GuestTokenError::Rejected {
            status: resp.status,
            body: resp.body_excerpt(200),
        });
    }
    let parsed: GuestTokenResponse = resp.json()?;
    parsed
        .token
        .filter(|t| !t.is_empty())
        .ok_or(GuestTokenError::MissingToken {
            status: resp.status,
        })
}

/// Sentinel form used by the embedding path: any failure is `None`.
pub async fn request_guest_token(
    sessions: &mut SessionManager,
    resource: ResourceRef,
    user: GuestUser,
) -> Option<String> {
    match issue_guest_token(sessions, resource, user).await {
        Ok(token) => {
            info!(token = %token_preview(&token), "guest token obtained");
            Some(token)
        }
        Err(err) => {
            warn!(%err, "failed to obtain guest token");
            None
        }
    }
}

/// First characters of a token, for logs.
pub fn token_preview(token: &str) -> String {
    let head: String = token.chars().take(20).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SupersetClient;
    use crate::testing::{GUEST_TOKEN, GuestBehavior, StubBehavior, StubSuperset};
    use std::sync::atomic::Ordering;

    fn sessions_for(stub: &StubSuperset) -> SessionManager {
        let config = stub.config();
        SessionManager::new(SupersetClient::new(&config).unwrap(), &config)
    }

    #[test]
    fn request_body_matches_the_endpoint_contract() {
        let body = GuestTokenRequest::new(
            ResourceRef::dashboard(&DashboardId::Numeric(12)),
            GuestUser::diagnostic(),
        );
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({
                "user": {"username": "embed-bot-diag", "first_name": "Embed", "last_name": "Bot"},
                "resources": [{"type": "dashboard", "id": "12"}],
                "rls": []
            })
        );
    }

    #[test]
    fn unique_guest_keeps_the_template_names() {
        let user = GuestUser::unique_from(&GuestUser::new("embed-user", "Embed", "User"));
        assert!(user.username.starts_with("embed-user-"));
        assert_eq!(user.last_name, "User");
    }

    #[tokio::test]
    async fn returns_exactly_the_issued_token() {
        let stub = StubSuperset::spawn(StubBehavior::default()).await;
        let mut sessions = sessions_for(&stub);
        let token = request_guest_token(
            &mut sessions,
            ResourceRef::dashboard(&DashboardId::Numeric(12)),
            GuestUser::diagnostic(),
        )
        .await;
        assert_eq!(token.as_deref(), Some(GUEST_TOKEN));
        assert_eq!(stub.login_hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            stub.last_guest_request().unwrap()["resources"][0]["id"],
            serde_json::json!("12")
        );
    }

    #[tokio::test]
    async fn ok_response_without_token_is_none() {
        let stub = StubSuperset::spawn(StubBehavior {
            guest: GuestBehavior::NoToken,
            ..StubBehavior::default()
        })
        .await;
        let mut sessions = sessions_for(&stub);
        let resource = ResourceRef::dashboard(&DashboardId::Numeric(12));

        let err = issue_guest_token(&mut sessions, resource.clone(), GuestUser::diagnostic())
            .await
            .unwrap_err();
        assert!(matches!(err, GuestTokenError::MissingToken { .. }));
        assert!(
            request_guest_token(&mut sessions, resource, GuestUser::diagnostic())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn csrf_rejection_is_classified() {
        let stub = StubSuperset::spawn(StubBehavior {
            guest: GuestBehavior::Reject(400, "400 Bad Request: The CSRF token is missing.".into()),
            ..StubBehavior::default()
        })
        .await;
        let mut sessions = sessions_for(&stub);
        let err = issue_guest_token(
            &mut sessions,
            ResourceRef::dashboard(&DashboardId::Numeric(12)),
            GuestUser::diagnostic(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.hint(), Some(FailureHint::MissingCsrfToken));
    }

    #[tokio::test]
    async fn failed_login_skips_the_token_call() {
        let stub = StubSuperset::spawn(StubBehavior {
            login_ok: false,
            ..StubBehavior::default()
        })
        .await;
        let mut sessions = sessions_for(&stub);
        let err = issue_guest_token(
            &mut sessions,
            ResourceRef::dashboard(&DashboardId::Numeric(12)),
            GuestUser::diagnostic(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, GuestTokenError::Login(_)));
        assert_eq!(stub.guest_hits.load(Ordering::SeqCst), 0);
    }
}
