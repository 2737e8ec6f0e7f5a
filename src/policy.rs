//! Framing rules: how `X-Frame-Options` and CSP `frame-ancestors`
//! decide whether a page may be framed by the embedder origin.

use regex::Regex;
use std::sync::LazyLock;

static FRAME_ANCESTORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)frame-ancestors\s+([^;]+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOptions {
    Absent,
    /// `DENY` or `SAMEORIGIN`.
    Blocking(String),
    /// Deprecated `ALLOW-FROM` naming the embedder origin.
    AllowsEmbedder(String),
    Unrecognized(String),
}

pub fn frame_options(header: Option<&str>, embedder_origin: &str) -> FrameOptions {
    let Some(value) = header.map(str::trim).filter(|v| !v.is_empty()) else {
        return FrameOptions::Absent;
    };
    let upper = value.to_ascii_uppercase();
    if upper == "DENY" || upper == "SAMEORIGIN" {
        return FrameOptions::Blocking(value.to_string());
    }
    if let Some(rest) = upper.strip_prefix("ALLOW-FROM")
        && same_origin(rest.trim(), embedder_origin)
    {
        return FrameOptions::AllowsEmbedder(value.to_string());
    }
    FrameOptions::Unrecognized(value.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameAncestors {
    MissingPolicy,
    MissingDirective { policy: String },
    /// Directive contains `'none'`.
    Denied { sources: String },
    Allowed { sources: String },
    Excluded { sources: String },
}

impl FrameAncestors {
    pub fn directive_present(&self) -> bool {
        !matches!(
            self,
            FrameAncestors::MissingPolicy | FrameAncestors::MissingDirective { .. }
        )
    }
}

/// `server_origin` decides whether `'self'` covers the embedder.
pub fn frame_ancestors(
    policy: Option<&str>,
    embedder_origin: &str,
    server_origin: Option<&str>,
) -> FrameAncestors {
    let Some(policy) = policy.map(str::trim).filter(|v| !v.is_empty()) else {
        return FrameAncestors::MissingPolicy;
    };
    let Some(captures) = FRAME_ANCESTORS.captures(policy) else {
        return FrameAncestors::MissingDirective {
            policy: policy.to_string(),
        };
    };
    let sources = captures[1].trim().to_string();
    let tokens: Vec<String> = sources
        .split_whitespace()
        .map(|t| t.to_ascii_lowercase())
        .collect();

    if tokens.iter().any(|t| t == "'none'") {
        return FrameAncestors::Denied { sources };
    }
    let self_matches = server_origin.is_some_and(|server| same_origin(server, embedder_origin));
    let allowed = tokens.iter().any(|token| match token.as_str() {
        "'self'" => self_matches,
        other => source_matches(other, embedder_origin),
    });
    if allowed {
        FrameAncestors::Allowed { sources }
    } else {
        FrameAncestors::Excluded { sources }
    }
}

/// Whether a browser would render the page inside a frame on the embedder
/// origin. A `frame-ancestors` directive takes precedence over
/// `X-Frame-Options`; unrecognized `X-Frame-Options` values are ignored.
pub fn framing_allowed(
    frame_options_header: Option<&str>,
    policy: Option<&str>,
    embedder_origin: &str,
    server_origin: Option<&str>,
) -> bool {
    let ancestors = frame_ancestors(policy, embedder_origin, server_origin);
    if ancestors.directive_present() {
        return matches!(ancestors, FrameAncestors::Allowed { .. });
    }
    !matches!(
        frame_options(frame_options_header, embedder_origin),
        FrameOptions::Blocking(_)
    )
}

fn normalize(origin: &str) -> String {
    origin.trim().trim_end_matches('/').to_ascii_lowercase()
}

fn same_origin(a: &str, b: &str) -> bool {
    let a = normalize(a);
    !a.is_empty() && a == normalize(b)
}

/// One CSP source expression against an origin: `*`, exact origin, or a
/// `scheme://*.host` wildcard.
fn source_matches(source: &str, origin: &str) -> bool {
    let source = normalize(source);
    let origin = normalize(origin);
    if source == "*" || source == origin {
        return true;
    }
    let (Some((src_scheme, src_host)), Some((org_scheme, org_host))) =
        (source.split_once("://"), origin.split_once("://"))
    else {
        return false;
    };
    if src_scheme != org_scheme {
        return false;
    }
    match src_host.strip_prefix("*.") {
        Some(suffix) => org_host.ends_with(&format!(".{suffix}")),
        None => false,
    }
}
