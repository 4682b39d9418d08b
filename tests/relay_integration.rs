//! End-to-end tests for the relay against in-process mock servers

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use modelgate::gateway::GatewayConfig;
use modelgate::proxy::{ProxyServer, RelaySettings};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

/// A request as seen by a mock server
#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    headers: HeaderMap,
    body: Bytes,
}

impl Recorded {
    fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("recorded body is JSON")
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

type Responder = Arc<dyn Fn(&Recorded) -> Response<Full<Bytes>> + Send + Sync>;

struct MockServer {
    port: u16,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl MockServer {
    fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().clone()
    }
}

/// Start a mock HTTP/1.1 server that records every request
async fn spawn_mock(responder: Responder) -> MockServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let requests = Arc::new(Mutex::new(Vec::new()));

    let recorded = Arc::clone(&requests);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let recorded = Arc::clone(&recorded);
            let responder = Arc::clone(&responder);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let recorded = Arc::clone(&recorded);
                    let responder = Arc::clone(&responder);
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                        let request = Recorded {
                            method: parts.method.to_string(),
                            path: parts
                                .uri
                                .path_and_query()
                                .map(|pq| pq.as_str().to_string())
                                .unwrap_or_default(),
                            headers: parts.headers,
                            body,
                        };
                        let response = responder(&request);
                        recorded.lock().push(request);
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    MockServer { port, requests }
}

fn json_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

fn ok_responder() -> Responder {
    Arc::new(|_: &Recorded| json_response(StatusCode::OK, r#"{"ok":true}"#))
}

/// A port nothing listens on
async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct Relay {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
}

impl Drop for Relay {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

async fn start_relay(backend_port: u16, gateway_base: &str, upstream_base: &str, gateway_config: Option<&Path>) -> Relay {
    let settings = RelaySettings {
        listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        target_port: backend_port,
        gateway_config: gateway_config.map(Path::to_path_buf),
        gateway_base: gateway_base.to_string(),
        upstream_base: upstream_base.to_string(),
        connect_timeout: Duration::from_secs(2),
        ..RelaySettings::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind(settings, shutdown_rx).await.unwrap();
    let port = server.local_addr().unwrap().port();
    tokio::spawn(server.run());

    Relay { port, shutdown_tx }
}

/// Raw HTTP response split into its parts
struct RawResponse {
    status: u16,
    head: String,
    body: String,
}

impl RawResponse {
    fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
            .map(|line| line[prefix.len()..].trim().to_string())
    }
}

/// Send an HTTP/1.1 request and read the whole response
async fn http_request(
    port: u16,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Result<RawResponse, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let mut request = format!(
        "{} {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\nContent-Length: {}\r\n",
        method,
        path,
        port,
        body.len()
    );
    for (name, value) in headers {
        request.push_str(&format!("{}: {}\r\n", name, value));
    }
    request.push_str("\r\n");
    request.push_str(body);
    stream.write_all(request.as_bytes()).await?;

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await?;

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or("missing status line")?;

    Ok(RawResponse {
        status,
        head: head.to_string(),
        body: body.to_string(),
    })
}

#[tokio::test]
async fn test_thinking_budget_injected_for_backend() {
    let backend = spawn_mock(ok_responder()).await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    let body = r#"{"model":"claude-sonnet-4-5-thinking-5000","max_tokens":1000,"messages":[]}"#;
    let response = http_request(
        relay.port,
        "POST",
        "/v1/messages",
        &[("content-type", "application/json")],
        body,
    )
    .await
    .unwrap();
    assert_eq!(response.status, 200);

    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    let forwarded = &requests[0];
    assert_eq!(forwarded.method, "POST");
    assert_eq!(forwarded.path, "/v1/messages");
    assert_eq!(forwarded.header("anthropic-beta"), Some("interleaved-thinking-2025-05-14"));

    let payload = forwarded.json();
    assert_eq!(payload["model"], "claude-sonnet-4-5");
    assert_eq!(payload["thinking"]["type"], "enabled");
    assert_eq!(payload["thinking"]["budget_tokens"], 5000);
    assert_eq!(payload["max_tokens"], 6024);
}

#[tokio::test]
async fn test_beta_header_appended_to_existing_values() {
    let backend = spawn_mock(ok_responder()).await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    let body = r#"{"model":"claude-opus-4-thinking","max_tokens":1000}"#;
    http_request(
        relay.port,
        "POST",
        "/v1/messages",
        &[("anthropic-beta", "prompt-caching-2024-07-31")],
        body,
    )
    .await
    .unwrap();

    let forwarded = &backend.requests()[0];
    assert_eq!(
        forwarded.header("anthropic-beta"),
        Some("prompt-caching-2024-07-31,interleaved-thinking-2025-05-14")
    );
    // A bare marker leaves the body alone
    assert_eq!(forwarded.json()["model"], "claude-opus-4-thinking");
}

#[tokio::test]
async fn test_non_thinking_request_passes_through() {
    let backend = spawn_mock(ok_responder()).await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    let body = r#"{"model":"gpt-5","max_tokens":10}"#;
    http_request(relay.port, "POST", "/v1/chat/completions?stream=false", &[], body)
        .await
        .unwrap();

    let forwarded = &backend.requests()[0];
    assert_eq!(forwarded.path, "/v1/chat/completions?stream=false");
    assert_eq!(forwarded.body, Bytes::from(body));
    assert!(forwarded.header("anthropic-beta").is_none());
}

#[tokio::test]
async fn test_backend_404_retried_under_api_namespace() {
    let backend = spawn_mock(Arc::new(|req: &Recorded| {
        if req.path.starts_with("/api/") {
            json_response(StatusCode::OK, r#"{"retried":true}"#)
        } else {
            json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#)
        }
    }))
    .await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    let response = http_request(relay.port, "GET", "/v1/models", &[], "").await.unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.contains("retried"));

    let paths: Vec<String> = backend.requests().into_iter().map(|r| r.path).collect();
    assert_eq!(paths, vec!["/v1/models", "/api/v1/models"]);
}

#[tokio::test]
async fn test_namespaced_404_not_retried() {
    let backend = spawn_mock(Arc::new(|_: &Recorded| {
        json_response(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#)
    }))
    .await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    let response = http_request(relay.port, "GET", "/api/v1/models", &[], "").await.unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test]
async fn test_backend_errors_other_than_404_not_retried() {
    let backend = spawn_mock(Arc::new(|_: &Recorded| {
        json_response(StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#)
    }))
    .await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    let response = http_request(relay.port, "GET", "/v1/models", &[], "").await.unwrap();
    assert_eq!(response.status, 500);
    assert_eq!(backend.requests().len(), 1);
}

#[tokio::test]
async fn test_request_id_propagated() {
    let backend = spawn_mock(ok_responder()).await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    http_request(relay.port, "GET", "/v1/models", &[("x-request-id", "req-42")], "")
        .await
        .unwrap();
    http_request(relay.port, "GET", "/v1/models", &[], "").await.unwrap();

    let requests = backend.requests();
    assert_eq!(requests[0].header("x-request-id"), Some("req-42"));
    let generated = requests[1].header("x-request-id").unwrap();
    assert_eq!(generated.len(), 36);
}

#[tokio::test]
async fn test_provider_path_namespaced_for_backend() {
    let backend = spawn_mock(ok_responder()).await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    http_request(relay.port, "POST", "/provider/anthropic/v1/messages", &[], r#"{"model":"gpt-5"}"#)
        .await
        .unwrap();

    assert_eq!(backend.requests()[0].path, "/api/provider/anthropic/v1/messages");
}

#[tokio::test]
async fn test_login_redirects_to_upstream() {
    let backend = spawn_mock(ok_responder()).await;
    let relay = start_relay(backend.port, "http://127.0.0.1:1", "https://ampcode.com", None).await;

    let response = http_request(relay.port, "GET", "/api/auth/cli-login?token=abc", &[], "")
        .await
        .unwrap();
    assert_eq!(response.status, 302);
    assert_eq!(
        response.header("location").as_deref(),
        Some("https://ampcode.com/auth/cli-login?token=abc")
    );
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn test_upstream_response_rewritten() {
    // The upstream names its own origin (from Host) in headers and body
    let upstream = spawn_mock(Arc::new(|req: &Recorded| {
        let origin = format!("http://{}", req.header("host").unwrap_or_default());
        Response::builder()
            .status(StatusCode::FOUND)
            .header("location", format!("{}/settings", origin))
            .header("set-cookie", "session=1; Domain=127.0.0.1; Path=/")
            .header("content-type", "text/plain")
            .body(Full::new(Bytes::from(format!(
                "moved\r\nLocation: {}/settings\r\nSet-Cookie: a=b; Domain=127.0.0.1",
                origin
            ))))
            .unwrap()
    }))
    .await;
    let relay = start_relay(closed_port().await, "http://127.0.0.1:1", &upstream.base_url(), None).await;

    let response = http_request(relay.port, "GET", "/threads/T-1?x=1", &[], "").await.unwrap();

    let requests = upstream.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].path, "/threads/T-1?x=1");

    assert_eq!(response.status, 302);
    assert_eq!(response.header("location").as_deref(), Some("/api/settings"));
    assert_eq!(
        response.header("set-cookie").as_deref(),
        Some("session=1; Domain=localhost; Path=/")
    );
    assert!(response.body.contains("Location: /api/settings"));
    assert!(response.body.contains("Domain=localhost"));
    let content_length: usize = response.header("content-length").unwrap().parse().unwrap();
    assert_eq!(content_length, response.body.len());
}

#[tokio::test]
async fn test_gateway_used_when_enabled() {
    let dir = tempfile::TempDir::new().unwrap();
    let gateway_path = dir.path().join("gateway-config.json");
    GatewayConfig::new(true, "  gw-key  ").write(&gateway_path).unwrap();

    let backend = spawn_mock(ok_responder()).await;
    let gateway = spawn_mock(Arc::new(|_: &Recorded| {
        json_response(StatusCode::OK, r#"{"type":"message","via":"gateway"}"#)
    }))
    .await;
    let relay = start_relay(backend.port, &gateway.base_url(), "http://127.0.0.1:1", Some(&gateway_path)).await;

    let body = r#"{"model":"claude-sonnet-4-5-thinking-2000","max_tokens":100}"#;
    let response = http_request(relay.port, "POST", "/api/provider/anthropic/v1/messages", &[], body)
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert!(response.body.contains("gateway"));
    assert!(backend.requests().is_empty());

    let requests = gateway.requests();
    assert_eq!(requests.len(), 1);
    let forwarded = &requests[0];
    assert_eq!(forwarded.path, "/v1/messages");
    assert_eq!(forwarded.header("x-api-key"), Some("gw-key"));
    assert_eq!(forwarded.header("anthropic-version"), Some("2023-06-01"));
    assert_eq!(forwarded.json()["model"], "claude-sonnet-4-5");
    assert_eq!(forwarded.json()["thinking"]["budget_tokens"], 2000);
}

#[tokio::test]
async fn test_gateway_skipped_when_disabled_or_keyless() {
    let dir = tempfile::TempDir::new().unwrap();
    let gateway_path = dir.path().join("gateway-config.json");
    GatewayConfig::new(true, "   ").write(&gateway_path).unwrap();

    let backend = spawn_mock(ok_responder()).await;
    let gateway = spawn_mock(ok_responder()).await;
    let relay = start_relay(backend.port, &gateway.base_url(), "http://127.0.0.1:1", Some(&gateway_path)).await;

    let body = r#"{"model":"claude-sonnet-4-5","max_tokens":100}"#;
    http_request(relay.port, "POST", "/v1/messages", &[], body).await.unwrap();
    assert_eq!(backend.requests().len(), 1);
    assert!(gateway.requests().is_empty());

    // Non-Claude models never use the gateway
    GatewayConfig::new(true, "gw-key").write(&gateway_path).unwrap();
    http_request(relay.port, "POST", "/v1/messages", &[], r#"{"model":"gpt-5"}"#)
        .await
        .unwrap();
    assert_eq!(backend.requests().len(), 2);
    assert!(gateway.requests().is_empty());
}

#[tokio::test]
async fn test_backend_unreachable_returns_502() {
    let relay = start_relay(closed_port().await, "http://127.0.0.1:1", "http://127.0.0.1:1", None).await;

    let response = http_request(relay.port, "GET", "/v1/models", &[], "").await.unwrap();
    assert_eq!(response.status, 502);
    assert_eq!(response.header("x-proxy-error").as_deref(), Some("BAD_GATEWAY"));
    let payload: Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(payload["code"], "BAD_GATEWAY");
}

#[tokio::test]
async fn test_upstream_unreachable_returns_502() {
    let upstream_base = format!("http://127.0.0.1:{}", closed_port().await);
    let relay = start_relay(closed_port().await, "http://127.0.0.1:1", &upstream_base, None).await;

    let response = http_request(relay.port, "GET", "/threads", &[], "").await.unwrap();
    assert_eq!(response.status, 502);
}
