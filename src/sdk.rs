use crate::api::error_chain;
use async_trait::async_trait;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;
use thiserror::Error;
use tracing::debug;

/// Export the embedding path calls.
pub const ENTRY_POINT: &str = "embedDashboard";

static EXPORT_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s*\{([^}]*)\}").expect("valid regex"));
static EXPORT_DECL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bexport\s+(?:async\s+)?(?:function\s*\*?|const|let|var|class)\s*([A-Za-z_$][\w$]*)")
        .expect("valid regex")
});
static EXPORT_DEFAULT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s+default\b").expect("valid regex"));
static EXPORT_STAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s*\*\s*from\b").expect("valid regex"));
static COMMONJS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bmodule\.exports\b|\bexports\.[A-Za-z_$]|Object\.defineProperty\(\s*exports\b|\brequire\(")
        .expect("valid regex")
});

#[derive(Debug, Error)]
pub enum SdkError {
    #[error("failed to fetch SDK module from {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("SDK module at {url} responded with status {status}")]
    Status { url: String, status: u16 },
    /// What a browser reports as "exports is not defined" when importing it.
    #[error("SDK module at {url} is CommonJS, not an ES module")]
    CommonJs { url: String },
    #[error("'embedDashboard' is not exported by the SDK module at {url}")]
    MissingEntryPoint { url: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    EsModule,
    CommonJs,
    Unknown,
}

/// A loaded SDK module: where it came from and what it exports.
#[derive(Debug, Clone)]
pub struct SdkModule {
    pub url: String,
    pub format: ModuleFormat,
    pub exports: BTreeSet<String>,
}

impl SdkModule {
    pub fn parse(url: &str, source: &str) -> Self {
        let mut exports = BTreeSet::new();
        for caps in EXPORT_LIST.captures_iter(source) {
            for item in caps[1].split(',') {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let name = item.rsplit_once(" as ").map_or(item, |(_, alias)| alias);
                exports.insert(name.trim().to_string());
            }
        }
        for caps in EXPORT_DECL.captures_iter(source) {
            exports.insert(caps[1].to_string());
        }
        if EXPORT_DEFAULT.is_match(source) {
            exports.insert("default".to_string());
        }

        let format = if !exports.is_empty() || EXPORT_STAR.is_match(source) {
            ModuleFormat::EsModule
        } else if COMMONJS.is_match(source) {
            ModuleFormat::CommonJs
        } else {
            ModuleFormat::Unknown
        };

        Self {
            url: url.to_string(),
            format,
            exports,
        }
    }

    pub fn entry_point(&self) -> Result<&'static str, SdkError> {
        if self.exports.contains(ENTRY_POINT) {
            Ok(ENTRY_POINT)
        } else {
            Err(SdkError::MissingEntryPoint {
                url: self.url.clone(),
            })
        }
    }
}

/// Loads the SDK module the way a browser `import()` would resolve it.
#[async_trait]
pub trait SdkLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<SdkModule, SdkError>;
}

/// Fetches the module over HTTP and inspects its source.
#[derive(Clone)]
pub struct HttpSdkLoader {
    client: reqwest::Client,
}

impl HttpSdkLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SdkLoader for HttpSdkLoader {
    async fn load(&self, url: &str) -> Result<SdkModule, SdkError> {
        let fetch_err = |reason: String| SdkError::Fetch {
            url: url.to_string(),
            reason,
        };
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| fetch_err(describe(e)))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SdkError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let source = resp.text().await.map_err(|e| fetch_err(describe(e)))?;
        let module = SdkModule::parse(url, &source);
        debug!(%url, format = ?module.format, exports = ?module.exports, "SDK module loaded");
        if module.format == ModuleFormat::CommonJs {
            return Err(SdkError::CommonJs {
                url: url.to_string(),
            });
        }
        Ok(module)
    }
}

fn describe(err: reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else {
        error_chain(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CJS_SDK, ESM_SDK, StubBehavior, StubSuperset};

    #[test]
    fn finds_aliased_exports_in_minified_bundles() {
        let module = SdkModule::parse("sdk.js", ESM_SDK);
        assert_eq!(module.format, ModuleFormat::EsModule);
        assert_eq!(module.entry_point().unwrap(), ENTRY_POINT);
    }

    #[test]
    fn finds_declared_exports() {
        let source = "export async function embedDashboard(opts) {}\nexport const version = '1';";
        let module = SdkModule::parse("sdk.js", source);
        assert!(module.exports.contains("embedDashboard"));
        assert!(module.exports.contains("version"));
    }

    #[test]
    fn commonjs_bundle_is_detected() {
        let module = SdkModule::parse("sdk.js", CJS_SDK);
        assert_eq!(module.format, ModuleFormat::CommonJs);
        assert!(module.exports.is_empty());
    }

    #[test]
    fn missing_entry_point_is_an_error() {
        let module = SdkModule::parse("sdk.js", "export default function () {}");
        assert!(matches!(
            module.entry_point(),
            Err(SdkError::MissingEntryPoint { .. })
        ));
    }

    #[tokio::test]
    async fn http_loader_rejects_commonjs() {
        let stub = StubSuperset::spawn(StubBehavior {
            sdk_source: CJS_SDK.to_string(),
            ..StubBehavior::default()
        })
        .await;
        let loader = HttpSdkLoader::new(reqwest::Client::new());
        let err = loader.load(&stub.config().sdk_url).await.unwrap_err();
        assert!(matches!(err, SdkError::CommonJs { .. }));
    }

    #[tokio::test]
    async fn http_loader_reports_missing_module() {
        let stub = StubSuperset::spawn(StubBehavior::default()).await;
        let loader = HttpSdkLoader::new(reqwest::Client::new());
        let err = loader
            .load(&format!("{}/sdk/missing.js", stub.base_url))
            .await
            .unwrap_err();
        assert!(matches!(err, SdkError::Status { status: 404, .. }));
    }
}
