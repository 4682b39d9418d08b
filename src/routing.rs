//! Path classification for the relay
//!
//! Every request lands in exactly one of three places: a redirect to the
//! upstream's hosted login page, the third-party upstream itself, or the
//! local dispatch path (thinking transform, then gateway or backend).

/// Login paths the upstream CLI opens in a browser
const LOGIN_PREFIXES: &[&str] = &["/auth/cli-login", "/api/auth/cli-login"];
/// Short provider paths that need the API namespace
const PROVIDER_PREFIX: &str = "/provider/";
/// Namespace prefix used by the backend and the upstream API
pub const API_PREFIX: &str = "/api";

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// 302 to the upstream's hosted login page
    Redirect { location: String },
    /// Forward verbatim to the third-party upstream
    Upstream { path: String },
    /// Thinking transform, then cloud gateway or local backend
    Local { path: String },
}

/// Classify a request path. The query string is carried through every rewrite.
pub fn classify(path: &str, query: Option<&str>, upstream_base: &str) -> Route {
    if LOGIN_PREFIXES.iter().any(|p| path.starts_with(p)) {
        let login_path = path.strip_prefix(API_PREFIX).unwrap_or(path);
        return Route::Redirect {
            location: format!(
                "{}{}",
                upstream_base.trim_end_matches('/'),
                with_query(login_path, query)
            ),
        };
    }

    let path = if path.starts_with(PROVIDER_PREFIX) {
        format!("{}{}", API_PREFIX, path)
    } else {
        path.to_string()
    };

    let is_provider_path = path.starts_with("/api/provider/");
    let is_backend_path = path.starts_with("/v1/") || path.starts_with("/api/v1/");
    let forward = with_query(&path, query);

    if is_provider_path || is_backend_path {
        Route::Local { path: forward }
    } else {
        Route::Upstream { path: forward }
    }
}

fn with_query(path: &str, query: Option<&str>) -> String {
    match query {
        Some(q) if !q.is_empty() => format!("{}?{}", path, q),
        _ => path.to_string(),
    }
}

/// Whether a backend 404 on `path` earns one retry under the API namespace
pub fn should_retry_namespaced(path: &str) -> bool {
    !path.starts_with("/api/")
}

/// The API-namespaced form of `path`
pub fn namespaced(path: &str) -> String {
    format!("{}{}", API_PREFIX, path)
}
