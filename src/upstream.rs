//! Outbound TLS dispatch: the cloud model gateway and the third-party upstream

use crate::error::{full_body, json_error_response, BoxError, ProxyBody, ProxyErrorCode};
use crate::headers::{is_hop_by_hop, is_text_content, UpstreamRewriter};
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::header::HeaderMap;
use hyper::{Method, Response};
use std::time::Duration;
use tracing::debug;

/// Default cloud gateway origin
pub const DEFAULT_GATEWAY_BASE: &str = "https://ai-gateway.vercel.sh";
/// Default third-party upstream origin
pub const DEFAULT_UPSTREAM_BASE: &str = "https://ampcode.com";
/// API version header value sent to the gateway
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

const GATEWAY_MESSAGES_PATH: &str = "/v1/messages";

/// reqwest-backed client for both remote destinations
pub struct UpstreamClient {
    client: reqwest::Client,
    gateway_base: String,
    upstream_base: String,
    rewriter: UpstreamRewriter,
}

impl UpstreamClient {
    pub fn new(gateway_base: &str, upstream_base: &str, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        let upstream_base = upstream_base.trim_end_matches('/').to_string();
        let authority = upstream_base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&upstream_base)
            .to_string();

        Ok(Self {
            client,
            gateway_base: gateway_base.trim_end_matches('/').to_string(),
            rewriter: UpstreamRewriter::new(&authority),
            upstream_base,
        })
    }

    pub fn upstream_base(&self) -> &str {
        &self.upstream_base
    }

    /// POST a messages request to the cloud gateway. The response is streamed back.
    pub async fn send_gateway(
        &self,
        headers: &HeaderMap,
        body: Bytes,
        api_key: &str,
    ) -> Result<Response<ProxyBody>, reqwest::Error> {
        let url = format!("{}{}", self.gateway_base, GATEWAY_MESSAGES_PATH);
        let mut outbound = to_reqwest_headers(headers);
        set_header(&mut outbound, "x-api-key", api_key);
        set_header(&mut outbound, "anthropic-version", ANTHROPIC_VERSION);
        set_header(&mut outbound, "content-type", "application/json");

        debug!(%url, "Dispatching to cloud gateway");
        let response = self
            .client
            .post(&url)
            .headers(outbound)
            .body(body)
            .send()
            .await?;

        Ok(streamed_response(response))
    }

    /// Forward a request verbatim to the third-party upstream and rewrite the
    /// response so redirects and cookies point back at the relay.
    pub async fn send_upstream(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<ProxyBody>, reqwest::Error> {
        let url = format!("{}{}", self.upstream_base, path_and_query);
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::GET);

        debug!(%url, %method, "Dispatching to upstream");
        let response = self
            .client
            .request(method, &url)
            .headers(to_reqwest_headers(headers))
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let upstream_headers = response.headers().clone();
        let content_type = upstream_headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let raw = response.bytes().await?;

        let body: Bytes = if is_text_content(&content_type) {
            match std::str::from_utf8(&raw) {
                Ok(text) => Bytes::from(self.rewriter.rewrite_body(text)),
                Err(_) => raw,
            }
        } else {
            raw
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in upstream_headers.iter() {
            let name = name.as_str();
            if name.eq_ignore_ascii_case("content-length") || is_hop_by_hop(name) {
                continue;
            }
            let rewritten = match (name, value.to_str()) {
                ("location", Ok(v)) => Some(self.rewriter.rewrite_location(v)),
                ("set-cookie", Ok(v)) => Some(self.rewriter.rewrite_cookie(v)),
                _ => None,
            };
            builder = match rewritten {
                Some(v) => builder.header(name, v),
                None => builder.header(name, value.as_bytes()),
            };
        }
        builder = builder.header("content-length", body.len().to_string());

        Ok(builder
            .body(full_body(body))
            .unwrap_or_else(|e| {
                json_error_response(
                    ProxyErrorCode::InternalError,
                    format!("Invalid upstream response: {}", e),
                )
            }))
    }
}

/// Convert a reqwest response into a streaming relay response
fn streamed_response(response: reqwest::Response) -> Response<ProxyBody> {
    let mut builder = Response::builder().status(response.status().as_u16());
    for (name, value) in response.headers().iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }

    let stream = response
        .bytes_stream()
        .map(|chunk| chunk.map(Frame::data).map_err(|e| Box::new(e) as BoxError));
    let body = StreamBody::new(stream).boxed_unsync();

    builder.body(body).unwrap_or_else(|e| {
        json_error_response(
            ProxyErrorCode::InternalError,
            format!("Invalid gateway response: {}", e),
        )
    })
}

fn to_reqwest_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes());
        let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes());
        if let (Ok(name), Ok(value)) = (name, value) {
            out.append(name, value);
        }
    }
    out
}

fn set_header(headers: &mut reqwest::header::HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
        headers.insert(reqwest::header::HeaderName::from_static(name), value);
    }
}
