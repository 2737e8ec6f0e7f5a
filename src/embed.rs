use crate::api::{ApiError, SupersetClient};
use crate::auth::SessionManager;
use crate::config::{AppConfig, DashboardId, DashboardUiConfig, FilterBarConfig};
use crate::frame::GuestTokenMessage;
use crate::guest::{GuestUser, ResourceRef, request_guest_token};
use crate::mount::{ElementSpec, MOUNT_ELEMENT_ID, MountPoint, Page};
use crate::sdk::{HttpSdkLoader, SdkError, SdkLoader};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

pub const FRAME_ELEMENT_ID: &str = "supersetFrame";

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error(transparent)]
    Sdk(#[from] SdkError),
    #[error("failed to render embed script: {0}")]
    Render(#[from] serde_json::Error),
}

/// Everything a strategy needs to produce the mount markup.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub dashboard_id: DashboardId,
    /// Base URL as configured, handed to the SDK as `supersetDomain`.
    pub server: String,
    pub server_origin: String,
    pub dashboard_url: Url,
    pub mount_id: String,
    pub token: String,
    pub ui: DashboardUiConfig,
}

/// One way of putting a dashboard into the mount element.
#[async_trait]
pub trait EmbedStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Elements for the mount point, or an error if this strategy cannot run.
    async fn prepare(&self, request: &EmbedRequest) -> Result<Vec<ElementSpec>, EmbedError>;
}

/// Loads the vendor SDK and calls its `embedDashboard` entry point.
pub struct SdkStrategy {
    loader: Arc<dyn SdkLoader>,
    sdk_url: String,
}

impl SdkStrategy {
    pub fn new(loader: Arc<dyn SdkLoader>, sdk_url: &str) -> Self {
        Self {
            loader,
            sdk_url: sdk_url.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SdkOptions<'a> {
    id: String,
    superset_domain: &'a str,
    dashboard_ui_config: UiConfigJs<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UiConfigJs<'a> {
    hide_title: bool,
    hide_tab: bool,
    hide_chart_controls: bool,
    filters: &'a FilterBarConfig,
}

#[async_trait]
impl EmbedStrategy for SdkStrategy {
    fn name(&self) -> &'static str {
        "sdk"
    }

    async fn prepare(&self, request: &EmbedRequest) -> Result<Vec<ElementSpec>, EmbedError> {
        let module = self.loader.load(&self.sdk_url).await?;
        let entry_point = module.entry_point()?;
        let options = SdkOptions {
            id: request.dashboard_id.to_string(),
            superset_domain: &request.server,
            dashboard_ui_config: UiConfigJs {
                hide_title: request.ui.hide_title,
                hide_tab: request.ui.hide_tab,
                hide_chart_controls: request.ui.hide_chart_controls,
                filters: &request.ui.filters,
            },
        };
        // The supplier hands back the token already obtained; it never refetches.
        let script = format!(
            "\nimport {{ {entry_point} }} from {sdk_url};\nconst token = {token};\nconst options = {options};\noptions.mountPoint = document.getElementById({mount_id});\noptions.fetchGuestToken = () => Promise.resolve(token);\n{entry_point}(options);\n",
            sdk_url = script_json(&self.sdk_url)?,
            token = script_json(&request.token)?,
            options = script_json(&options)?,
            mount_id = script_json(&request.mount_id)?,
        );
        Ok(vec![
            ElementSpec::new("script")
                .attr("type", "module")
                .text(script),
        ])
    }
}

/// Plain iframe at the standalone dashboard URL; the token is posted to the
/// frame on load, addressed to the server origin.
pub struct IframeStrategy;

#[async_trait]
impl EmbedStrategy for IframeStrategy {
    fn name(&self) -> &'static str {
        "iframe"
    }

    async fn prepare(&self, request: &EmbedRequest) -> Result<Vec<ElementSpec>, EmbedError> {
        let message = GuestTokenMessage::new(&request.token);
        let frame = ElementSpec::new("iframe")
            .attr("id", FRAME_ELEMENT_ID)
            .attr("src", request.dashboard_url.as_str())
            .attr("style", "width: 100%; height: 100%; border: none;");
        let script = format!(
            "\n(function () {{\n  var frame = document.getElementById({frame_id});\n  var message = {message};\n  frame.addEventListener(\"load\", function () {{\n    try {{\n      frame.contentWindow.postMessage(message, {target});\n    }} catch (err) {{\n      console.error(\"Failed to send guest token to the dashboard frame.\", err);\n    }}\n  }});\n  frame.addEventListener(\"error\", function (err) {{\n    console.error(\"Failed to load the dashboard frame.\", err);\n  }});\n}})();\n",
            frame_id = script_json(FRAME_ELEMENT_ID)?,
            message = script_json(&message)?,
            target = script_json(&request.server_origin)?,
        );
        Ok(vec![frame, ElementSpec::new("script").text(script)])
    }
}

/// JSON literal safe to place inside a `<script>` element.
fn script_json<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    Ok(serde_json::to_string(value)?.replace('<', "\\u003c"))
}

/// Mounts dashboards into a page. Owns its session; every embed fetches a
/// fresh guest token. Failures are logged and leave the mount empty.
pub struct Embedder {
    config: AppConfig,
    sessions: SessionManager,
    strategies: Vec<Box<dyn EmbedStrategy>>,
}

impl Embedder {
    /// SDK first, manual iframe as the fallback.
    pub fn new(config: AppConfig, client: SupersetClient, loader: Arc<dyn SdkLoader>) -> Self {
        let strategies: Vec<Box<dyn EmbedStrategy>> = vec![
            Box::new(SdkStrategy::new(loader, &config.sdk_url)),
            Box::new(IframeStrategy),
        ];
        Self::with_strategies(config, client, strategies)
    }

    /// Embedder backed by the HTTP SDK loader.
    pub fn from_config(config: AppConfig) -> anyhow::Result<Self> {
        let client = SupersetClient::new(&config)?;
        let loader = Arc::new(HttpSdkLoader::new(client.http().clone()));
        Ok(Self::new(config, client, loader))
    }

    pub fn with_strategies(
        config: AppConfig,
        client: SupersetClient,
        strategies: Vec<Box<dyn EmbedStrategy>>,
    ) -> Self {
        let sessions = SessionManager::new(client, &config);
        Self {
            config,
            sessions,
            strategies,
        }
    }

    fn request(&self, token: &str, mount_id: &str) -> Result<EmbedRequest, ApiError> {
        let client = self.sessions.client();
        Ok(EmbedRequest {
            dashboard_id: self.config.dashboard_id.clone(),
            server: client.base_url()?.as_str().trim_end_matches('/').to_string(),
            server_origin: client.server_origin()?,
            dashboard_url: client.dashboard_url(&self.config.dashboard_id)?,
            mount_id: mount_id.to_string(),
            token: token.to_string(),
            ui: self.config.ui.clone(),
        })
    }

    /// Clears `mount` and fills it using the first strategy that works.
    /// Returns the name of that strategy.
    pub async fn embed(&self, token: &str, mount: &MountPoint) -> Option<&'static str> {
        if token.is_empty() {
            error!("cannot embed dashboard without a guest token");
            return None;
        }
        mount.clear();

        let request = match self.request(token, mount.id()) {
            Ok(request) => request,
            Err(err) => {
                error!(%err, "cannot embed dashboard");
                return None;
            }
        };

        for strategy in &self.strategies {
            debug!(strategy = strategy.name(), "attempting to embed dashboard");
            let elements = match strategy.prepare(&request).await {
                Ok(elements) => elements,
                Err(err) => {
                    warn!(strategy = strategy.name(), %err, "embedding strategy failed; trying next");
                    continue;
                }
            };
            mount.append(&elements);
            info!(strategy = strategy.name(), dashboard = %request.dashboard_id, "dashboard embedding initiated");
            return Some(strategy.name());
        }
        error!("no embedding strategy succeeded; mount left empty");
        None
    }

    /// Fetches a guest token and embeds into the well-known mount element.
    pub async fn init_embed(&mut self, page: &Page) -> Option<&'static str> {
        info!(dashboard = %self.config.dashboard_id, "initializing dashboard embed");
        self.embed_fresh(page).await
    }

    /// Full re-embed with a new guest token; prior frame/SDK state is discarded.
    pub async fn refresh_embed(&mut self, page: &Page) -> Option<&'static str> {
        info!(dashboard = %self.config.dashboard_id, "refreshing dashboard embed");
        self.embed_fresh(page).await
    }

    async fn embed_fresh(&mut self, page: &Page) -> Option<&'static str> {
        let Some(token) = self.fetch_token().await else {
            error!("failed to obtain guest token; dashboard cannot be embedded");
            return None;
        };
        let Some(mount) = page.mount(MOUNT_ELEMENT_ID) else {
            error!(mount = MOUNT_ELEMENT_ID, "mount element not found in page");
            return None;
        };
        self.embed(&token, &mount).await
    }

    /// A fresh guest token for the configured dashboard.
    pub async fn fetch_token(&mut self) -> Option<String> {
        let resource = ResourceRef::dashboard(&self.config.dashboard_id);
        let user = GuestUser::unique_from(&self.config.guest_user);
        request_guest_token(&mut self.sessions, resource, user).await
    }
}
