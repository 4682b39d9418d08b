//! Header and body helpers shared by every relay destination

use hyper::header::{HeaderMap, HeaderName, HeaderValue};

/// Headers that never cross the relay
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Header carrying capability tokens
pub const BETA_HEADER: &str = "anthropic-beta";

/// Remove hop-by-hop headers plus the ones the outbound client must set itself
pub fn prepare_outbound(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    headers.remove(hyper::header::HOST);
    headers.remove(hyper::header::CONTENT_LENGTH);
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Add `token` to the beta header, keeping any values already present
pub fn append_beta(headers: &mut HeaderMap, token: &str) {
    let existing = headers
        .get_all(BETA_HEADER)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(String::from)
        .collect::<Vec<_>>();

    if existing.iter().any(|v| v == token) {
        return;
    }

    let combined = if existing.is_empty() {
        token.to_string()
    } else {
        format!("{},{}", existing.join(","), token)
    };

    if let Ok(value) = HeaderValue::from_str(&combined) {
        headers.insert(HeaderName::from_static(BETA_HEADER), value);
    }
}

/// Rewrites applied to responses from the third-party upstream so that
/// redirects and cookies stay on the local relay
#[derive(Debug, Clone)]
pub struct UpstreamRewriter {
    origins: Vec<String>,
    cookie_domains: Vec<String>,
}

impl UpstreamRewriter {
    /// `authority` is the upstream's `host[:port]`
    pub fn new(authority: &str) -> Self {
        let host = authority.split(':').next().unwrap_or(authority);
        Self {
            origins: vec![
                format!("https://{}/", authority),
                format!("http://{}/", authority),
            ],
            cookie_domains: vec![format!("Domain=.{}", host), format!("Domain={}", host)],
        }
    }

    /// Point absolute upstream URLs at the local API namespace
    pub fn rewrite_location(&self, value: &str) -> String {
        self.origins
            .iter()
            .fold(value.to_string(), |acc, origin| acc.replace(origin.as_str(), "/api/"))
    }

    /// Scope cookies to the local host
    pub fn rewrite_cookie(&self, value: &str) -> String {
        self.cookie_domains
            .iter()
            .fold(value.to_string(), |acc, domain| acc.replace(domain.as_str(), "Domain=localhost"))
    }

    /// Apply both substitutions to a text body embedding raw headers or URLs
    pub fn rewrite_body(&self, body: &str) -> String {
        let mut text = body.to_string();
        for origin in &self.origins {
            text = text.replace(&format!("\r\nLocation: {}", origin), "\r\nLocation: /api/");
        }
        self.rewrite_cookie(&text)
    }
}

/// Whether a content type is safe to treat as text
pub fn is_text_content(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("text") || ct.contains("json") || ct.contains("html")
}
