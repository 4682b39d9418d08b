//! Connection pool for the local backend engine
//!
//! Requests to the backend reuse pooled HTTP/1.1 connections. Bodies are
//! already buffered by the relay, so the client is built over `Full<Bytes>`
//! and a request can be replayed for the namespaced retry.

use crate::routing::{namespaced, should_retry_namespaced};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderMap;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Failure talking to the backend engine
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("invalid backend request: {0}")]
    RequestBuild(#[from] hyper::http::Error),
}

/// Counters kept for the shutdown summary
#[derive(Debug, Default)]
pub struct PoolStats {
    requests: AtomicU64,
    retries: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Requests sent to the backend, retries included
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Namespaced retries after a 404
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Pooled client for the backend engine on the loopback interface
pub struct BackendPool {
    client: Client<HttpConnector, Full<Bytes>>,
    port: u16,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl BackendPool {
    pub fn new(port: u16, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            port,
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend connection pool initialized"
        );

        Self {
            client,
            port,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Send one request to `path_and_query` on the backend
    pub async fn send(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>, PoolError> {
        let uri = format!("http://127.0.0.1:{}{}", self.port, path_and_query);

        let mut builder = Request::builder().method(method.clone()).uri(&uri);
        for (key, value) in headers.iter() {
            builder = builder.header(key, value);
        }

        let request = builder.body(Full::new(body))?;

        self.stats.record_request();
        Ok(self.client.request(request).await?)
    }

    /// Send a request; on a 404 for a path outside the API namespace, retry
    /// exactly once under `/api` and return whatever that yields.
    pub async fn send_with_retry(
        &self,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response<Incoming>, PoolError> {
        let response = self.send(method, path_and_query, headers, body.clone()).await?;

        if response.status() != StatusCode::NOT_FOUND || !should_retry_namespaced(path_and_query) {
            return Ok(response);
        }

        // Release the first connection before retrying
        drop(response);

        let retry_path = namespaced(path_and_query);
        info!(path = %path_and_query, retry = %retry_path, "Backend returned 404, retrying under API namespace");
        self.stats.record_retry();
        self.send(method, &retry_path, headers, body).await
    }
}
