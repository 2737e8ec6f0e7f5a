use crate::api::{error_chain, origin_of};
use crate::policy::framing_allowed;
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

/// `postMessage` target that matches any recipient origin.
pub const ANY_ORIGIN: &str = "*";

/// Payload handed to the dashboard frame once it has loaded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct GuestTokenMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub token: String,
}

impl GuestTokenMessage {
    pub fn new(token: &str) -> Self {
        Self {
            kind: "guestToken",
            token: token.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame failed to load {url}: {reason}")]
    Load { url: String, reason: String },
    #[error(
        "postMessage with target origin {target} failed: recipient window's origin is ('{origin}')"
    )]
    PostMessage { target: String, origin: String },
}

/// A loaded frame. `origin` is `None` when the content was blocked and the
/// window reports an opaque (`null`) origin.
pub trait Frame: Send {
    fn origin(&self) -> Option<&str>;
    fn post_message(
        &mut self,
        message: &GuestTokenMessage,
        target_origin: &str,
    ) -> Result<(), FrameError>;
}

#[async_trait]
pub trait FrameHost: Send + Sync {
    /// Resolves when the frame's load event would fire.
    async fn open(&self, src: &Url) -> Result<Box<dyn Frame>, FrameError>;
}

/// Loads frame content over HTTP and applies the browser's framing rules
/// for the configured embedder origin.
#[derive(Clone)]
pub struct HttpFrameHost {
    client: reqwest::Client,
    embedder_origin: String,
}

impl HttpFrameHost {
    pub fn new(client: reqwest::Client, embedder_origin: &str) -> Self {
        Self {
            client,
            embedder_origin: embedder_origin.to_string(),
        }
    }
}

#[async_trait]
impl FrameHost for HttpFrameHost {
    async fn open(&self, src: &Url) -> Result<Box<dyn Frame>, FrameError> {
        let resp = self
            .client
            .get(src.clone())
            .send()
            .await
            .map_err(|e| FrameError::Load {
                url: src.to_string(),
                reason: if e.is_timeout() {
                    "request timed out".to_string()
                } else {
                    error_chain(&e)
                },
            })?;
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let frame_options = header("x-frame-options");
        let policy = header("content-security-policy");
        let content_origin = origin_of(resp.url());
        let allowed = framing_allowed(
            frame_options.as_deref(),
            policy.as_deref(),
            &self.embedder_origin,
            Some(&content_origin),
        );
        debug!(url = %src, allowed, "frame loaded");
        Ok(Box::new(LoadedFrame {
            origin: allowed.then_some(content_origin),
        }))
    }
}

struct LoadedFrame {
    origin: Option<String>,
}

impl Frame for LoadedFrame {
    fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    fn post_message(
        &mut self,
        _message: &GuestTokenMessage,
        target_origin: &str,
    ) -> Result<(), FrameError> {
        let target = target_origin.trim_end_matches('/');
        match &self.origin {
            Some(origin) if target == ANY_ORIGIN || target.eq_ignore_ascii_case(origin) => Ok(()),
            // blocked content: a wildcard post is accepted and silently dropped
            None if target == ANY_ORIGIN => Ok(()),
            other => Err(FrameError::PostMessage {
                target: target_origin.to_string(),
                origin: other.clone().unwrap_or_else(|| "null".to_string()),
            }),
        }
    }
}

/// How a frame handshake attempt ended. Exactly one per attempt.
#[derive(Debug)]
pub enum FrameHandshake {
    Delivered { origin: Option<String> },
    LoadFailed(FrameError),
    PostFailed(FrameError),
    TimedOut,
}

/// Opens `src`, posts `message` on load, and races the whole handshake
/// against `wait`. Whichever finishes first is the outcome; the other
/// branch is dropped.
pub async fn frame_handshake(
    host: &dyn FrameHost,
    src: &Url,
    message: &GuestTokenMessage,
    target_origin: &str,
    wait: Duration,
) -> FrameHandshake {
    let handshake = async {
        let mut frame = match host.open(src).await {
            Ok(frame) => frame,
            Err(err) => return FrameHandshake::LoadFailed(err),
        };
        match frame.post_message(message, target_origin) {
            Ok(()) => FrameHandshake::Delivered {
                origin: frame.origin().map(str::to_string),
            },
            Err(err) => FrameHandshake::PostFailed(err),
        }
    };
    tokio::select! {
        outcome = handshake => outcome,
        _ = tokio::time::sleep(wait) => FrameHandshake::TimedOut,
    }
}
