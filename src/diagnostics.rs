//! Ordered health checks for an embedding setup.
//!
//! Each check turns every failure it can observe into a [`CheckResult`];
//! nothing here returns an error to the caller.

use crate::api::{ApiError, HEALTH_PATH, HttpSnapshot, SupersetClient, excerpt};
use crate::auth::SessionManager;
use crate::config::AppConfig;
use crate::frame::{
    ANY_ORIGIN, FrameHost, FrameHandshake, GuestTokenMessage, HttpFrameHost, frame_handshake,
};
use crate::guest::{FailureHint, GuestTokenError, GuestUser, ResourceRef, issue_guest_token};
use crate::policy::{FrameAncestors, FrameOptions, frame_ancestors, frame_options};
use crate::sdk::{ENTRY_POINT, HttpSdkLoader, SdkError, SdkLoader};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::header::{
    ACCESS_CONTROL_ALLOW_ORIGIN, CONNECTION, CONTENT_SECURITY_POLICY, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, UPGRADE, X_FRAME_OPTIONS,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

pub const REACHABILITY: &str = "Superset Reachability";
pub const CORS: &str = "CORS Headers";
pub const FRAME_OPTIONS: &str = "X-Frame-Options Header";
pub const FRAME_ANCESTORS: &str = "CSP frame-ancestors";
pub const GUEST_TOKEN_API: &str = "Guest-Token API";
pub const EMBEDDED_SDK: &str = "Superset Embedded SDK";
pub const MANUAL_IFRAME: &str = "Manual Iframe Embedding";
pub const PORT_REACHABILITY: &str = "Superset Port Reachability (WebSocket)";

/// The port check runs only when more than this many of the first five
/// checks failed.
const PORT_CHECK_THRESHOLD: usize = 1;
const BASIC_CHECKS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    pub fn icon(self) -> &'static str {
        match self {
            CheckStatus::Pass => "✅",
            CheckStatus::Warn => "⚠️",
            CheckStatus::Fail => "❌",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub check_name: String,
    pub status: CheckStatus,
    pub details: String,
    pub suggestion: String,
}

impl CheckResult {
    fn new(
        name: &str,
        status: CheckStatus,
        details: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            check_name: name.to_string(),
            status,
            details: details.into(),
            suggestion: suggestion.into(),
        }
    }

    fn pass(name: &str, details: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Pass, details, "")
    }

    fn warn(name: &str, details: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warn, details, suggestion)
    }

    fn fail(name: &str, details: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Fail, details, suggestion)
    }
}

pub struct Diagnostics {
    config: AppConfig,
    client: SupersetClient,
    sdk: Arc<dyn SdkLoader>,
    frames: Arc<dyn FrameHost>,
}

impl Diagnostics {
    pub fn new(
        config: AppConfig,
        client: SupersetClient,
        sdk: Arc<dyn SdkLoader>,
        frames: Arc<dyn FrameHost>,
    ) -> Self {
        Self {
            config,
            client,
            sdk,
            frames,
        }
    }

    /// Suite wired to the HTTP-backed SDK loader and frame host.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let client = SupersetClient::new(&config)?;
        let sdk = Arc::new(HttpSdkLoader::new(client.http().clone()));
        let frames = Arc::new(HttpFrameHost::new(
            client.http().clone(),
            &config.embed_origin,
        ));
        Ok(Self::new(config, client, sdk, frames))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Runs every check in order. Each run logs in afresh.
    pub async fn run(&self) -> Vec<CheckResult> {
        let mut sessions = SessionManager::new(self.client.clone(), &self.config);
        let mut results = Vec::with_capacity(8);

        info!(base_url = %self.config.base_url, origin = %self.config.embed_origin, "starting diagnostics");
        results.push(
            self.check_reachability()
                .instrument(info_span!("check", check = REACHABILITY))
                .await,
        );
        results.push(
            self.check_cors()
                .instrument(info_span!("check", check = CORS))
                .await,
        );
        results.push(
            self.check_frame_options()
                .instrument(info_span!("check", check = FRAME_OPTIONS))
                .await,
        );
        results.push(
            self.check_frame_ancestors()
                .instrument(info_span!("check", check = FRAME_ANCESTORS))
                .await,
        );
        results.push(
            self.check_guest_token(&mut sessions)
                .instrument(info_span!("check", check = GUEST_TOKEN_API))
                .await,
        );
        results.push(
            self.check_sdk()
                .instrument(info_span!("check", check = EMBEDDED_SDK))
                .await,
        );
        results.push(
            self.check_iframe(&mut sessions)
                .instrument(info_span!("check", check = MANUAL_IFRAME))
                .await,
        );

        let basic_failures = results[..BASIC_CHECKS]
            .iter()
            .filter(|r| r.status == CheckStatus::Fail)
            .count();
        if basic_failures > PORT_CHECK_THRESHOLD {
            info!(basic_failures, "probing the server port");
            results.push(
                self.check_port()
                    .instrument(info_span!("check", check = PORT_REACHABILITY))
                    .await,
            );
        } else {
            results.push(CheckResult::warn(
                PORT_REACHABILITY,
                "Skipped. Basic HTTP checks were mostly successful or did not indicate a port-level issue.",
                "Run if other checks fail unexpectedly.",
            ));
        }

        for result in &results {
            match result.status {
                CheckStatus::Pass => debug!(check = %result.check_name, "pass"),
                CheckStatus::Warn => warn!(check = %result.check_name, details = %result.details, "warn"),
                CheckStatus::Fail => warn!(check = %result.check_name, details = %result.details, "fail"),
            }
        }
        results
    }

    async fn check_reachability(&self) -> CheckResult {
        let base = &self.config.base_url;
        let resp = match self.get(HEALTH_PATH).await {
            Ok(resp) => resp,
            Err(err) => {
                let suggestion = if err.is_config() {
                    "Fix base_url in config; it must be an absolute http(s) URL."
                } else {
                    "Verify Superset URL, ensure backend is running, check for firewall/proxy issues, and DNS resolution."
                };
                return CheckResult::fail(
                    REACHABILITY,
                    format!("Error reaching {base}/health: {err}"),
                    suggestion,
                );
            }
        };
        if !resp.is_success() {
            return CheckResult::fail(
                REACHABILITY,
                format!("Failed to reach {base}/health. Status: {}", resp.status),
                "Verify Superset URL, ensure backend is running, and check network connectivity.",
            );
        }
        if resp.body.trim().eq_ignore_ascii_case("ok") {
            CheckResult::pass(
                REACHABILITY,
                format!(
                    "Successfully reached {base}/health. Status: {}. Response: \"OK\"",
                    resp.status
                ),
            )
        } else {
            CheckResult::warn(
                REACHABILITY,
                format!(
                    "Reached {base}/health, but response was not \"OK\". Status: {}. Response: {}",
                    resp.status,
                    resp.body_excerpt(100)
                ),
                "Ensure Superset backend is healthy and /health endpoint is standard.",
            )
        }
    }

    async fn check_cors(&self) -> CheckResult {
        let origin = &self.config.embed_origin;
        let resp = match self.get(HEALTH_PATH).await {
            Ok(resp) => resp,
            Err(err) => {
                return CheckResult::fail(
                    CORS,
                    format!("Error checking CORS headers (could not fetch /health): {err}"),
                    "Resolve reachability issues first. This check depends on a successful GET request to Superset.",
                );
            }
        };
        match resp.header(ACCESS_CONTROL_ALLOW_ORIGIN.as_str()) {
            Some(allowed) if allowed == "*" || allowed == origin => CheckResult::pass(
                CORS,
                format!(
                    "Access-Control-Allow-Origin: \"{allowed}\". Correctly allows this origin ({origin})."
                ),
            ),
            Some(allowed) => CheckResult::fail(
                CORS,
                format!(
                    "Access-Control-Allow-Origin: \"{allowed}\". Does NOT allow this origin ({origin})."
                ),
                format!(
                    "In superset_config.py, ensure ENABLE_CORS = True and CORS_OPTIONS includes '{origin}' in 'origins'."
                ),
            ),
            None => CheckResult::fail(
                CORS,
                "Access-Control-Allow-Origin header is MISSING.",
                format!(
                    "In superset_config.py, set ENABLE_CORS = True and configure CORS_OPTIONS to include this origin ('{origin}') in the 'origins' list."
                ),
            ),
        }
    }

    async fn check_frame_options(&self) -> CheckResult {
        let resp = match self.get_dashboard().await {
            Ok(resp) => resp,
            Err(err) => {
                return CheckResult::fail(
                    FRAME_OPTIONS,
                    format!("Error checking X-Frame-Options (could not fetch dashboard URL): {err}"),
                    "Resolve dashboard reachability. This check depends on fetching the dashboard page. Ensure dashboard ID is correct.",
                );
            }
        };
        match frame_options(
            resp.header(X_FRAME_OPTIONS.as_str()),
            &self.config.embed_origin,
        ) {
            FrameOptions::Absent => CheckResult::pass(
                FRAME_OPTIONS,
                "X-Frame-Options header is ABSENT (good for embedding).",
            ),
            FrameOptions::Blocking(value) => CheckResult::fail(
                FRAME_OPTIONS,
                format!("X-Frame-Options: \"{value}\". This PREVENTS embedding from different origins."),
                "If Flask-Talisman is enabled, try setting `TALISMAN_ENABLED = False` in `superset_config.py`. \
                 Alternatively, configure Talisman with `{\"frame_options\": \"ALLOW-FROM\", \"frame_options_allow_from\": \"your-domain.com\"}` \
                 or ensure `EMBEDDED_SUPERSET = True` correctly modifies headers. If not using Talisman, try setting \
                 `HTTP_HEADERS = {\"X-Frame-Options\": None}` or use CSP frame-ancestors (see next check).",
            ),
            FrameOptions::AllowsEmbedder(value) => CheckResult::new(
                FRAME_OPTIONS,
                CheckStatus::Pass,
                format!("X-Frame-Options: \"{value}\". Allows this origin (though ALLOW-FROM is deprecated)."),
                "Consider migrating to Content-Security-Policy frame-ancestors for better compatibility.",
            ),
            FrameOptions::Unrecognized(value) => CheckResult::warn(
                FRAME_OPTIONS,
                format!("X-Frame-Options: \"{value}\". Unusual value. Embedding might be affected."),
                "Ideally, this header should be absent or managed by Content-Security-Policy frame-ancestors for embedded content.",
            ),
        }
    }

    async fn check_frame_ancestors(&self) -> CheckResult {
        let origin = &self.config.embed_origin;
        let resp = match self.get_dashboard().await {
            Ok(resp) => resp,
            Err(err) => {
                return CheckResult::fail(
                    FRAME_ANCESTORS,
                    format!("Error checking CSP (could not fetch dashboard URL): {err}"),
                    "Resolve dashboard reachability. This check depends on fetching the dashboard page.",
                );
            }
        };
        let server_origin = self.client.server_origin().ok();
        match frame_ancestors(
            resp.header(CONTENT_SECURITY_POLICY.as_str()),
            origin,
            server_origin.as_deref(),
        ) {
            FrameAncestors::MissingPolicy => CheckResult::warn(
                FRAME_ANCESTORS,
                "Content-Security-Policy header is MISSING.",
                format!(
                    "If X-Frame-Options is also restrictive (check #3), embedding will fail. Consider adding CSP with frame-ancestors. \
                     If Talisman is enabled and causing XFO issues, setting `TALISMAN_ENABLED = False` might be needed. \
                     Suggested `superset_config.py` entry for CSP:\n{}",
                    csp_snippet(&format!("frame-ancestors 'self' {origin};"))
                ),
            ),
            FrameAncestors::MissingDirective { policy } => CheckResult::warn(
                FRAME_ANCESTORS,
                format!(
                    "Content-Security-Policy: \"{}\". Directive 'frame-ancestors' is MISSING.",
                    excerpt(&policy, 100)
                ),
                format!(
                    "If X-Frame-Options is restrictive (check #3), embedding will fail. Add frame-ancestors to CSP. \
                     If Talisman is enabled and causing XFO issues, setting `TALISMAN_ENABLED = False` might be needed. \
                     Suggested `superset_config.py` entry for CSP:\n{}",
                    csp_snippet(&format!("frame-ancestors 'self' {origin}; {policy}"))
                ),
            ),
            FrameAncestors::Denied { sources } => CheckResult::fail(
                FRAME_ANCESTORS,
                format!("CSP frame-ancestors: \"{sources}\". Contains 'none', PREVENTING embedding."),
                format!(
                    "Remove 'none' from frame-ancestors and add this origin. Suggested `superset_config.py` entry:\n{}",
                    csp_snippet(&format!("frame-ancestors 'self' {origin};"))
                ),
            ),
            FrameAncestors::Allowed { sources } => CheckResult::pass(
                FRAME_ANCESTORS,
                format!("CSP frame-ancestors: \"{sources}\". Allows this origin."),
            ),
            FrameAncestors::Excluded { sources } => CheckResult::fail(
                FRAME_ANCESTORS,
                format!("CSP frame-ancestors: \"{sources}\". Does NOT allow this origin ({origin})."),
                format!(
                    "Add this origin to frame-ancestors. Suggested `superset_config.py` entry:\n{}",
                    csp_snippet(&format!("frame-ancestors 'self' {origin} {sources};"))
                ),
            ),
        }
    }

    async fn check_guest_token(&self, sessions: &mut SessionManager) -> CheckResult {
        if let Err(err) = sessions.ensure().await {
            debug!(%err, "login failed");
            return CheckResult::fail(
                GUEST_TOKEN_API,
                format!("Login failed, cannot test Guest-Token API. {err}"),
                "Fix Superset login (URL, credentials, CORS for login endpoint).",
            );
        }
        match issue_guest_token(sessions, self.resource(), GuestUser::diagnostic()).await {
            Ok(_) => CheckResult::pass(
                GUEST_TOKEN_API,
                "Guest-Token API call successful. Token received.",
            ),
            Err(GuestTokenError::MissingToken { status }) => CheckResult::warn(
                GUEST_TOKEN_API,
                format!("Guest-Token API call returned {status}, but no token in response."),
                "Check Superset logs for guest token generation errors.",
            ),
            Err(err @ GuestTokenError::Rejected { .. }) => {
                let suggestion = match err.hint() {
                    Some(FailureHint::MissingCsrfToken) => {
                        "The /api/v1/security/guest_token/ endpoint requires a CSRF token. Either implement CSRF token \
                         fetching in your embed solution or exempt this route from CSRF protection in Superset \
                         (e.g., via `@csrf.exempt` in `superset/security/api.py`)."
                    }
                    None => {
                        "Ensure Superset is configured for guest tokens (e.g., `GUEST_TOKEN_JWT_SECRET` in config), \
                         user has permissions, dashboard ID is valid. Check Superset logs."
                    }
                };
                CheckResult::fail(
                    GUEST_TOKEN_API,
                    format!("Guest-Token API call failed. {err}"),
                    suggestion,
                )
            }
            Err(GuestTokenError::Login(err)) => CheckResult::fail(
                GUEST_TOKEN_API,
                format!("Login failed, cannot test Guest-Token API. {err}"),
                "Fix Superset login (URL, credentials, CORS for login endpoint).",
            ),
            Err(GuestTokenError::Api(err)) => CheckResult::fail(
                GUEST_TOKEN_API,
                format!("Error calling Guest-Token API: {err}"),
                "Check network, Superset logs, and ensure the API path is correct.",
            ),
        }
    }

    async fn check_sdk(&self) -> CheckResult {
        let url = &self.config.sdk_url;
        let loaded = match self.sdk.load(url).await {
            Ok(module) => module.entry_point().map(|_| ()),
            Err(err) => Err(err),
        };
        match loaded {
            Ok(()) => CheckResult::pass(
                EMBEDDED_SDK,
                format!("Successfully imported '{ENTRY_POINT}' function from SDK ({url})."),
            ),
            Err(SdkError::MissingEntryPoint { .. }) => CheckResult::fail(
                EMBEDDED_SDK,
                format!("'{ENTRY_POINT}' function not found in SDK module from {url}."),
                "Verify SDK URL or try a different build (e.g., UMD version).",
            ),
            Err(err @ SdkError::CommonJs { .. }) => CheckResult::fail(
                EMBEDDED_SDK,
                format!("Failed to load or use Embedded SDK. Error: {err}"),
                format!(
                    "The SDK script from {url} is in CommonJS format and cannot be imported as a module. \
                     Try using a UMD build of the SDK if available, or integrate Superset embedding using a build tool \
                     (Webpack, Vite, Parcel) that handles different module formats. If using <script type=\"module\">, \
                     ensure the CDN serves an ES Module."
                ),
            ),
            Err(err) => CheckResult::fail(
                EMBEDDED_SDK,
                format!("Failed to load or use Embedded SDK. Error: {err}"),
                format!("Failed to import or use SDK from {url}. Check the URL and network access."),
            ),
        }
    }

    async fn check_iframe(&self, sessions: &mut SessionManager) -> CheckResult {
        if !sessions.ensure_session().await {
            return CheckResult::warn(
                MANUAL_IFRAME,
                "Skipped: Login failed, cannot obtain guest token for iframe test.",
                "Fix login issues first.",
            );
        }
        let token = match issue_guest_token(sessions, self.resource(), GuestUser::diagnostic()).await
        {
            Ok(token) => token,
            Err(err) => {
                return CheckResult::warn(
                    MANUAL_IFRAME,
                    format!("Skipped: Failed to get guest token for iframe test: {err}"),
                    "Fix Guest-Token API issues first.",
                );
            }
        };
        let src = match self.client.dashboard_url(&self.config.dashboard_id) {
            Ok(src) => src,
            Err(err) => {
                return CheckResult::fail(
                    MANUAL_IFRAME,
                    format!("Iframe failed to load: {err}"),
                    "Check dashboard URL, network issues, or X-Frame-Options/CSP blocking.",
                );
            }
        };

        let wait = self.config.timeout / 2;
        let message = GuestTokenMessage::new(&token);
        match frame_handshake(self.frames.as_ref(), &src, &message, ANY_ORIGIN, wait).await {
            FrameHandshake::Delivered {
                origin: Some(origin),
            } => CheckResult::new(
                MANUAL_IFRAME,
                CheckStatus::Pass,
                format!(
                    "Iframe loaded from {origin} and postMessage sent successfully (using targetOrigin \"{ANY_ORIGIN}\")."
                ),
                "For production, use a specific targetOrigin in postMessage instead of \"*\".",
            ),
            FrameHandshake::Delivered { origin: None } => CheckResult::fail(
                MANUAL_IFRAME,
                "Iframe loaded, but its origin is 'null'. This usually means X-Frame-Options or CSP blocked the content. postMessage would fail.",
                "Fix X-Frame-Options/CSP issues (Checks #3 and #4).",
            ),
            FrameHandshake::PostFailed(err) => CheckResult::fail(
                MANUAL_IFRAME,
                format!("Iframe loaded, but postMessage failed: {err}"),
                "This might be due to X-Frame-Options/CSP blocking, or other iframe security issues.",
            ),
            FrameHandshake::LoadFailed(err) => CheckResult::fail(
                MANUAL_IFRAME,
                format!("Iframe failed to load: {err}"),
                "Check dashboard URL, network issues, or X-Frame-Options/CSP blocking.",
            ),
            FrameHandshake::TimedOut => CheckResult::fail(
                MANUAL_IFRAME,
                "Iframe loading or postMessage timed out.",
                "Check X-Frame-Options/CSP. If those are fine, inspect iframe content manually. Ensure dashboard ID is correct and dashboard is published.",
            ),
        }
    }

    /// Attempts a WebSocket upgrade against the server's host and port.
    async fn check_port(&self) -> CheckResult {
        let base = match self.client.base_url() {
            Ok(base) => base,
            Err(err) => {
                return CheckResult::fail(
                    PORT_REACHABILITY,
                    format!("Invalid base URL: {}. Error: {err}", self.config.base_url),
                    "Fix base_url in config.",
                );
            }
        };
        let host = base.host_str().unwrap_or_default();
        let port = base.port_or_known_default().unwrap_or(80);
        let ws_scheme = if base.scheme() == "https" { "wss" } else { "ws" };
        let ws_url = format!("{ws_scheme}://{host}:{port}");
        let http_url = format!("{}://{host}:{port}/", base.scheme());

        let key = BASE64.encode(Uuid::new_v4().as_bytes());
        let request = self
            .client
            .http()
            .get(&http_url)
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "websocket")
            .header(SEC_WEBSOCKET_VERSION, "13")
            .header(SEC_WEBSOCKET_KEY, key);

        let wait = self.config.timeout / 2;
        debug!(%ws_url, ?wait, "attempting websocket upgrade");
        match tokio::time::timeout(wait, request.send()).await {
            Ok(Ok(resp)) if resp.status() == StatusCode::SWITCHING_PROTOCOLS => CheckResult::pass(
                PORT_REACHABILITY,
                format!("Successfully connected to {ws_url} via WebSocket. Port is open."),
            ),
            Ok(Ok(resp)) => CheckResult::warn(
                PORT_REACHABILITY,
                format!(
                    "Port {port} answered HTTP {} at {ws_url}, but the WebSocket upgrade was refused. The port is open.",
                    resp.status()
                ),
                "The port is reachable; look at the failing HTTP checks above for the actual problem.",
            ),
            Ok(Err(err)) if !err.is_timeout() => CheckResult::fail(
                PORT_REACHABILITY,
                format!(
                    "WebSocket connection to {ws_url} failed. Port might be closed, firewalled, or Superset not running/accepting connections. {}",
                    self.client.map_err(err)
                ),
                "Ensure Superset is running on the correct port, port is open, and no firewall is blocking. If using HTTPS, ensure SSL certificate is valid.",
            ),
            Ok(Err(_)) | Err(_) => CheckResult::fail(
                PORT_REACHABILITY,
                format!("WebSocket connection to {ws_url} timed out. Port might be closed or firewalled."),
                "Ensure Superset port is open and accessible. Check firewalls or if Superset is bound to localhost only.",
            ),
        }
    }

    fn resource(&self) -> ResourceRef {
        ResourceRef::dashboard(&self.config.dashboard_id)
    }

    async fn get(&self, path: &str) -> Result<HttpSnapshot, ApiError> {
        let url = self.client.endpoint(path)?;
        self.client.get(url).await
    }

    async fn get_dashboard(&self) -> Result<HttpSnapshot, ApiError> {
        let url = self.client.dashboard_url(&self.config.dashboard_id)?;
        self.client.get(url).await
    }
}

fn csp_snippet(policy: &str) -> String {
    format!(
        "```python\nHTTP_HEADERS = {{\n    \"Content-Security-Policy\": \"{policy}\"\n}}\nTALISMAN_ENABLED = False  # if Talisman is overriding X-Frame-Options\n```"
    )
}
