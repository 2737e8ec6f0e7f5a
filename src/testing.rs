//! In-process Superset stand-in for tests.

use crate::config::AppConfig;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const ACCESS_TOKEN: &str = "access-token-123";
pub const GUEST_TOKEN: &str = "guest-token-abcdefghijklmnopqrstuvwxyz";
pub const EMBED_ORIGIN: &str = "http://localhost:5500";
pub const ESM_SDK: &str = "var e=function(t){return t};export{e as embedDashboard};";
pub const CJS_SDK: &str = "\"use strict\";Object.defineProperty(exports,\"__esModule\",{value:!0});exports.embedDashboard=function(t){return t};";

#[derive(Debug, Clone)]
pub enum GuestBehavior {
    Token,
    NoToken,
    Reject(u16, String),
}

#[derive(Debug, Clone)]
pub struct StubBehavior {
    pub login_ok: bool,
    pub guest: GuestBehavior,
    pub health_status: u16,
    pub health_body: String,
    pub health_delay: Option<Duration>,
    pub allow_origin: Option<String>,
    pub frame_options: Option<String>,
    pub csp: Option<String>,
    pub sdk_source: String,
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            login_ok: true,
            guest: GuestBehavior::Token,
            health_status: 200,
            health_body: "OK".to_string(),
            health_delay: None,
            allow_origin: Some(EMBED_ORIGIN.to_string()),
            frame_options: None,
            csp: Some(format!("frame-ancestors 'self' {EMBED_ORIGIN};")),
            sdk_source: ESM_SDK.to_string(),
        }
    }
}

struct StubState {
    behavior: StubBehavior,
    login_hits: Arc<AtomicUsize>,
    guest_hits: Arc<AtomicUsize>,
    last_guest: Mutex<Option<Value>>,
}

pub struct StubSuperset {
    pub base_url: String,
    pub login_hits: Arc<AtomicUsize>,
    pub guest_hits: Arc<AtomicUsize>,
    state: Arc<StubState>,
}

impl StubSuperset {
    pub async fn spawn(behavior: StubBehavior) -> Self {
        let login_hits = Arc::new(AtomicUsize::new(0));
        let guest_hits = Arc::new(AtomicUsize::new(0));
        let state = Arc::new(StubState {
            behavior,
            login_hits: login_hits.clone(),
            guest_hits: guest_hits.clone(),
            last_guest: Mutex::new(None),
        });
        let app = Router::new()
            .route("/health", get(health))
            .route("/api/v1/security/login", post(login))
            .route("/api/v1/security/guest_token/", post(guest_token))
            .route("/superset/dashboard/{id}/", get(dashboard))
            .route("/sdk/index.js", get(sdk))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            base_url: format!("http://{addr}"),
            login_hits,
            guest_hits,
            state,
        }
    }

    /// Config pointing every URL at this stub.
    pub fn config(&self) -> AppConfig {
        AppConfig {
            base_url: self.base_url.clone(),
            sdk_url: format!("{}/sdk/index.js", self.base_url),
            embed_origin: EMBED_ORIGIN.to_string(),
            timeout: Duration::from_secs(2),
            ..AppConfig::default()
        }
    }

    pub fn last_guest_request(&self) -> Option<Value> {
        self.state.last_guest.lock().unwrap().clone()
    }
}

/// A loopback address nothing listens on.
pub async fn unreachable_base_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}")
}

/// Raw TCP server that answers every connection with `reply` after the
/// request arrives, or holds it open without a word when `reply` is `None`.
pub async fn raw_tcp_base_url(reply: Option<&'static [u8]>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((mut socket, _)) = listener.accept().await {
            if let Some(reply) = reply {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(reply).await;
            }
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

fn with_cors(behavior: &StubBehavior, body: String) -> Response {
    let mut resp = body.into_response();
    if let Some(origin) = &behavior.allow_origin {
        resp.headers_mut().insert(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_str(origin).unwrap(),
        );
    }
    resp
}

async fn health(State(state): State<Arc<StubState>>) -> Response {
    if let Some(delay) = state.behavior.health_delay {
        tokio::time::sleep(delay).await;
    }
    let mut resp = with_cors(&state.behavior, state.behavior.health_body.clone());
    *resp.status_mut() = StatusCode::from_u16(state.behavior.health_status).unwrap();
    resp
}

async fn dashboard(State(state): State<Arc<StubState>>) -> Response {
    let mut resp = with_cors(
        &state.behavior,
        "<html><body><div id=\"app\"></div></body></html>".to_string(),
    );
    let headers = resp.headers_mut();
    if let Some(xfo) = &state.behavior.frame_options {
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_str(xfo).unwrap());
    }
    if let Some(csp) = &state.behavior.csp {
        headers.insert(
            header::CONTENT_SECURITY_POLICY,
            HeaderValue::from_str(csp).unwrap(),
        );
    }
    resp
}

async fn sdk(State(state): State<Arc<StubState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        state.behavior.sdk_source.clone(),
    )
        .into_response()
}

async fn login(State(state): State<Arc<StubState>>, Json(body): Json<Value>) -> Response {
    state.login_hits.fetch_add(1, Ordering::SeqCst);
    if state.behavior.login_ok && body["provider"] == "db" {
        Json(json!({ "access_token": ACCESS_TOKEN })).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Invalid login" })),
        )
            .into_response()
    }
}

async fn guest_token(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.guest_hits.fetch_add(1, Ordering::SeqCst);
    *state.last_guest.lock().unwrap() = Some(body);

    let expected = format!("Bearer {ACCESS_TOKEN}");
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if presented != Some(expected.as_str()) {
        return (StatusCode::UNAUTHORIZED, "missing bearer").into_response();
    }

    match &state.behavior.guest {
        GuestBehavior::Token => Json(json!({ "token": GUEST_TOKEN })).into_response(),
        GuestBehavior::NoToken => Json(json!({})).into_response(),
        GuestBehavior::Reject(code, text) => (
            StatusCode::from_u16(*code).unwrap(),
            text.clone(),
        )
            .into_response(),
    }
}
