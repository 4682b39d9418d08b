//! Relay server
//!
//! Accepts client traffic on the relay port, classifies it and dispatches to
//! one of three destinations: the local backend engine, the cloud gateway or
//! the third-party upstream. Requests aimed at the local path pass through the
//! thinking transform first.

use crate::error::{full_body, json_error_response, BoxError, ProxyBody, ProxyErrorCode};
use crate::gateway::GatewayConfigCache;
use crate::headers::{append_beta, prepare_outbound, strip_hop_by_hop};
use crate::pool::{BackendPool, PoolConfig};
use crate::routing::{classify, Route};
use crate::thinking::{apply_thinking, is_gateway_eligible, THINKING_BETA};
use crate::upstream::{UpstreamClient, DEFAULT_GATEWAY_BASE, DEFAULT_UPSTREAM_BASE};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

/// Default relay listen port
pub const DEFAULT_RELAY_PORT: u16 = 8317;
/// Default backend engine port
pub const DEFAULT_BACKEND_PORT: u16 = 8318;

/// Everything the relay needs to know at startup
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub listen: SocketAddr,
    pub target_port: u16,
    /// Gateway config file; `None` keeps the gateway permanently off
    pub gateway_config: Option<PathBuf>,
    pub gateway_base: String,
    pub upstream_base: String,
    pub connect_timeout: Duration,
    pub pool: PoolConfig,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_RELAY_PORT)),
            target_port: DEFAULT_BACKEND_PORT,
            gateway_config: None,
            gateway_base: DEFAULT_GATEWAY_BASE.to_string(),
            upstream_base: DEFAULT_UPSTREAM_BASE.to_string(),
            connect_timeout: Duration::from_secs(10),
            pool: PoolConfig::default(),
        }
    }
}

/// Shared per-relay state handed to every request
struct RelayContext {
    backend: BackendPool,
    upstream: UpstreamClient,
    gateway: GatewayConfigCache,
}

/// The relay server
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<RelayContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listen address. Port 0 picks an ephemeral port.
    pub async fn bind(settings: RelaySettings, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(settings.listen).await?;

        let gateway = match &settings.gateway_config {
            Some(path) => GatewayConfigCache::new(path),
            None => GatewayConfigCache::disabled(),
        };

        let context = Arc::new(RelayContext {
            backend: BackendPool::new(settings.target_port, settings.pool.clone()),
            upstream: UpstreamClient::new(
                &settings.gateway_base,
                &settings.upstream_base,
                settings.connect_timeout,
            )?,
            gateway,
        });

        Ok(Self {
            listener,
            context,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(
            addr = %addr,
            target_port = self.context.backend.port(),
            upstream = self.context.upstream.upstream_base(),
            "Relay listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Relay shutting down");
                        break;
                    }
                }
            }
        }

        let stats = self.context.backend.stats();
        info!(
            backend_requests = stats.requests(),
            retries = stats.retries(),
            "Relay stopped"
        );
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, context: Arc<RelayContext>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<RelayContext>,
    client_addr: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(request_id, error = %e, "Failed to read request body");
            return Ok(json_error_response(
                ProxyErrorCode::BodyReadFailed,
                "Failed to read request body",
            ));
        }
    };

    let route = classify(
        parts.uri.path(),
        parts.uri.query(),
        context.upstream.upstream_base(),
    );
    debug!(
        request_id,
        client = %client_addr,
        method = %parts.method,
        uri = %parts.uri,
        route = ?route,
        "Incoming request"
    );

    let mut headers = parts.headers;
    prepare_outbound(&mut headers);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    let response = match route {
        Route::Redirect { location } => redirect(&location),
        Route::Upstream { path } => {
            match context.upstream.send_upstream(&parts.method, &path, &headers, body).await {
                Ok(response) => response,
                Err(e) => {
                    error!(request_id, path, error = %e, "Upstream request failed");
                    json_error_response(ProxyErrorCode::BadGateway, "Failed to reach upstream")
                }
            }
        }
        Route::Local { path } => dispatch_local(&context, &parts.method, &path, headers, body, &request_id).await,
    };

    Ok(response)
}

/// Thinking transform, then cloud gateway or local backend
async fn dispatch_local(
    context: &RelayContext,
    method: &Method,
    path: &str,
    mut headers: HeaderMap,
    body: Bytes,
    request_id: &str,
) -> Response<ProxyBody> {
    let mut body = body;

    if method == Method::POST && !body.is_empty() {
        let transformed = apply_thinking(&body);
        if let Some(rewritten) = transformed.body {
            body = Bytes::from(rewritten);
        }
        if transformed.beta_required {
            append_beta(&mut headers, THINKING_BETA);
        }
    }

    if method == Method::POST && is_gateway_eligible(&body) {
        let gateway = context.gateway.load();
        if gateway.is_active() {
            info!(request_id, path, "Routing to cloud gateway");
            return match context.upstream.send_gateway(&headers, body, gateway.api_key.trim()).await {
                Ok(response) => response,
                Err(e) => {
                    error!(request_id, error = %e, "Cloud gateway request failed");
                    json_error_response(ProxyErrorCode::BadGateway, "Failed to reach cloud gateway")
                }
            };
        }
    }

    match context.backend.send_with_retry(method, path, &headers, body).await {
        Ok(response) => {
            let (mut parts, incoming) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            if parts.status == StatusCode::NOT_FOUND {
                debug!(request_id, path, "Backend returned 404");
            }
            Response::from_parts(parts, incoming.map_err(BoxError::from).boxed_unsync())
        }
        Err(e) => {
            error!(request_id, port = context.backend.port(), path, error = %e, "Backend request failed");
            json_error_response(ProxyErrorCode::BadGateway, "Failed to connect to backend")
        }
    }
}

fn redirect(location: &str) -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(hyper::header::LOCATION, location)
        .body(full_body(Bytes::new()))
        .unwrap_or_else(|e| {
            json_error_response(ProxyErrorCode::InternalError, format!("Invalid redirect: {}", e))
        })
}
