//! Pooled HTTP client for the engine's local port
//!
//! Non-upgrade requests under the forwarded prefix go through here. The Host
//! header is rewritten to the upstream authority and the client's original
//! host is kept in `X-Forwarded-Host`.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Error type for upstream requests
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept to the engine
    pub max_idle: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Client for the single upstream the gateway forwards to
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    upstream_port: u16,
    forwarded: AtomicU64,
}

impl ConnectionPool {
    pub fn new(upstream_port: u16, config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            upstream_port,
            max_idle = config.max_idle,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Upstream connection pool initialized"
        );

        Self {
            client,
            upstream_port,
            forwarded: AtomicU64::new(0),
        }
    }

    /// `host:port` of the engine's listener
    pub fn upstream_authority(&self) -> String {
        format!("127.0.0.1:{}", self.upstream_port)
    }

    /// Number of requests forwarded so far
    pub fn forwarded_requests(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Forward `req` to the engine, keeping its full path and query
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", self.upstream_authority(), path);

        let (mut parts, body) = req.into_parts();
        parts.uri = uri
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| PoolError::RequestBuild(e.to_string()))?;
        // The upstream connection is always HTTP/1.1, even for h2 clients
        parts.version = hyper::Version::HTTP_11;
        rewrite_forwarding_headers(&mut parts.headers, &self.upstream_authority(), client_addr, is_tls);

        self.forwarded.fetch_add(1, Ordering::Relaxed);

        let response = self.client.request(Request::from_parts(parts, body)).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Point Host at the upstream and record where the request came from.
///
/// X-Forwarded-* values are overwritten, not appended, so clients cannot spoof them.
pub fn rewrite_forwarding_headers(
    headers: &mut hyper::HeaderMap,
    upstream_authority: &str,
    client_addr: SocketAddr,
    is_tls: bool,
) {
    if let Some(host) = headers.get(HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if let Ok(value) = HeaderValue::from_str(upstream_authority) {
        headers.insert(HOST, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}
