use crate::guest::GuestUser;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8088";
pub const DEFAULT_SDK_URL: &str =
    "https://cdn.jsdelivr.net/npm/@superset-ui/embedded-sdk@0.1.0-alpha.10/lib/index.min.js";
pub const DEFAULT_EMBED_ORIGIN: &str = "http://localhost:5500";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

/// Runtime configuration shared by the embedding and diagnostics paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Kept as a raw string; a malformed value is reported by the checks
    /// that use it rather than rejected at load time.
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub dashboard_id: DashboardId,
    pub guest_user: GuestUser,
    pub timeout: Duration,
    pub sdk_url: String,
    /// Origin of the page hosting the dashboard.
    pub embed_origin: String,
    pub ui: DashboardUiConfig,
}

/// Dashboard reference as configured: numeric id or slug.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DashboardId {
    Numeric(u64),
    Slug(String),
}

impl DashboardId {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        raw.parse::<u64>()
            .map(DashboardId::Numeric)
            .unwrap_or_else(|_| DashboardId::Slug(raw.to_string()))
    }
}

impl fmt::Display for DashboardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DashboardId::Numeric(id) => write!(f, "{id}"),
            DashboardId::Slug(slug) => f.write_str(slug),
        }
    }
}

/// Options forwarded to the embedded SDK as `dashboardUiConfig`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DashboardUiConfig {
    pub hide_title: bool,
    pub hide_tab: bool,
    pub hide_chart_controls: bool,
    pub filters: FilterBarConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilterBarConfig {
    pub visible: bool,
    pub expanded: bool,
}

impl Default for FilterBarConfig {
    fn default() -> Self {
        Self {
            visible: true,
            expanded: true,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            username: "superset".to_string(),
            password: "superset".to_string(),
            dashboard_id: DashboardId::Numeric(12),
            guest_user: GuestUser::new("embed-user", "Embed", "User"),
            timeout: DEFAULT_TIMEOUT,
            sdk_url: DEFAULT_SDK_URL.to_string(),
            embed_origin: DEFAULT_EMBED_ORIGIN.to_string(),
            ui: DashboardUiConfig::default(),
        }
    }
}

/// One configuration layer. Every field is optional; set fields replace
/// the corresponding value of the layer below.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigOverlay {
    pub base_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub dashboard_id: Option<DashboardId>,
    pub guest_user: Option<GuestUser>,
    pub timeout_ms: Option<u64>,
    pub sdk_url: Option<String>,
    pub embed_origin: Option<String>,
    pub ui: Option<DashboardUiConfig>,
}

impl ConfigOverlay {
    pub fn from_toml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let timeout_ms = lookup("SUPERSET_DIAG_TIMEOUT_MS")
            .map(|v| {
                v.trim()
                    .parse::<u64>()
                    .context("failed to parse SUPERSET_DIAG_TIMEOUT_MS")
            })
            .transpose()?;

        Ok(Self {
            base_url: lookup("SUPERSET_BASE_URL"),
            username: lookup("SUPERSET_USERNAME"),
            password: lookup("SUPERSET_PASSWORD"),
            dashboard_id: lookup("SUPERSET_DASHBOARD_ID").map(|v| DashboardId::parse(&v)),
            guest_user: None,
            timeout_ms,
            sdk_url: lookup("SUPERSET_SDK_URL"),
            embed_origin: lookup("SUPERSET_EMBED_ORIGIN"),
            ui: None,
        })
    }
}

impl AppConfig {
    /// Defaults, then the optional config file, then the environment, then `cli`.
    pub fn load(file: Option<&Path>, cli: ConfigOverlay) -> anyhow::Result<Self> {
        let mut config = AppConfig::default();
        if let Some(path) = file {
            config.apply(ConfigOverlay::from_toml_file(path)?);
        }
        config.apply(ConfigOverlay::from_env()?);
        config.apply(cli);
        Ok(config)
    }

    pub fn apply(&mut self, overlay: ConfigOverlay) {
        if let Some(v) = overlay.base_url {
            self.base_url = v.trim().to_string();
        }
        if let Some(v) = overlay.username {
            self.username = v;
        }
        if let Some(v) = overlay.password {
            self.password = v;
        }
        if let Some(v) = overlay.dashboard_id {
            self.dashboard_id = v;
        }
        if let Some(v) = overlay.guest_user {
            self.guest_user = v;
        }
        if let Some(ms) = overlay.timeout_ms {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(v) = overlay.sdk_url {
            self.sdk_url = v;
        }
        if let Some(v) = overlay.embed_origin {
            self.embed_origin = v.trim().trim_end_matches('/').to_string();
        }
        if let Some(v) = overlay.ui {
            self.ui = v;
        }
    }
}
