use crate::config::Settings;
use crate::error::{json_error_response, no_content_response, not_found_response, ProxyErrorCode};
use crate::pool::{rewrite_forwarding_headers, ConnectionPool, PoolConfig};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Unauthenticated liveness path, answered by the gateway itself
pub const HEALTH_CHECK_PATH: &str = "/generate_204";

/// Upper bound on the upstream's upgrade response head
const MAX_UPGRADE_RESPONSE_HEAD: usize = 16 * 1024;

/// Where a request is dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    HealthCheck,
    Upstream,
    NotFound,
}

/// Routing table of the gateway: one forwarded prefix, one health path, 404 otherwise
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRoutes {
    prefix: String,
}

impl GatewayRoutes {
    /// Trailing slashes are ignored; `""` and `"/"` forward every path
    pub fn new(path_prefix: &str) -> Self {
        Self {
            prefix: path_prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `path` is the prefix itself or lies below it
    pub fn matches_prefix(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    pub fn route(&self, method: &Method, path: &str) -> Route {
        if path == HEALTH_CHECK_PATH && (method == Method::GET || method == Method::HEAD) {
            return Route::HealthCheck;
        }
        if self.matches_prefix(path) {
            return Route::Upstream;
        }
        Route::NotFound
    }
}

/// Everything a connection task needs, shared across connections
struct GatewayState {
    routes: GatewayRoutes,
    pool: ConnectionPool,
}

/// The public front door, forwarding the configured prefix to the engine
pub struct ReverseProxyGateway {
    listener: TcpListener,
    state: Arc<GatewayState>,
    shutdown_rx: watch::Receiver<bool>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl ReverseProxyGateway {
    /// Bind the listening socket. Failure here is fatal for the caller.
    pub async fn bind(
        bind_addr: SocketAddr,
        routes: GatewayRoutes,
        upstream_port: u16,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind gateway on {}: {}", bind_addr, e))?;

        Ok(Self {
            listener,
            state: Arc::new(GatewayState {
                routes,
                pool: ConnectionPool::new(upstream_port, PoolConfig::default()),
            }),
            shutdown_rx,
            tls_acceptor: None,
        })
    }

    /// Bind using the public port, bind address and prefix from settings
    pub async fn from_settings(
        settings: &Settings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let ip: IpAddr = settings
            .bind
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address {}: {}", settings.bind, e))?;
        let bind_addr = SocketAddr::new(ip, settings.public_port);

        Self::bind(
            bind_addr,
            GatewayRoutes::new(&settings.path_prefix),
            settings.internal_port,
            shutdown_rx,
        )
        .await
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        let protocol = if self.tls_acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %addr,
            protocol,
            prefix = %self.state.routes.prefix(),
            upstream = %self.state.pool.upstream_authority(),
            "Gateway listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let tls_acceptor = self.tls_acceptor.clone();

                            tokio::spawn(async move {
                                if let Some(acceptor) = tls_acceptor {
                                    match acceptor.accept(stream).await {
                                        Ok(tls_stream) => {
                                            if let Err(e) = handle_connection(tls_stream, addr, state, true).await {
                                                debug!(addr = %addr, error = %e, "TLS connection error");
                                            }
                                        }
                                        Err(e) => {
                                            debug!(addr = %addr, error = %e, "TLS handshake failed");
                                        }
                                    }
                                } else if let Err(e) = handle_connection(stream, addr, state, false).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(
                            forwarded_requests = self.state.pool.forwarded_requests(),
                            "Gateway shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    state: Arc<GatewayState>,
    is_tls: bool,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, addr, is_tls).await }
    });

    // Upgrades have to be enabled on the connection itself; the request
    // handler only sees the handshake.
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let route = state.routes.route(req.method(), req.uri().path());
    debug!(method = %req.method(), uri = %req.uri(), ?route, "Incoming request");

    match route {
        Route::HealthCheck => Ok(no_content_response()),
        Route::NotFound => Ok(not_found_response()),
        Route::Upstream if is_upgrade_request(&req) => {
            handle_upgrade(req, state, client_addr, is_tls).await
        }
        Route::Upstream => match state.pool.send_request(req, client_addr, is_tls).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(upstream = %state.pool.upstream_authority(), error = %e, "Failed to forward request");
                Ok(json_error_response(
                    ProxyErrorCode::UpstreamUnavailable,
                    "Failed to connect to upstream",
                ))
            }
        },
    }
}

/// Check if a request is a WebSocket/HTTP upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Build the raw HTTP/1.1 upgrade request sent to the upstream
fn build_upgrade_request<B>(req: &Request<B>, upstream_authority: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    if !req.headers().contains_key(hyper::header::HOST) {
        request.push_str(&format!("host: {}\r\n", upstream_authority));
    }
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the upstream's response head: status and headers
fn parse_upgrade_response(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(head).ok()?;
    let mut lines = head.lines();

    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }
    let status = StatusCode::from_u16(parts[1].parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Read until the end of the response head.
///
/// Returns the head and any bytes the upstream already sent past it.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upstream closed connection before responding",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return Ok((buf, rest));
        }
        if buf.len() > MAX_UPGRADE_RESPONSE_HEAD {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "upstream response head too large",
            ));
        }
    }
}

/// Forward an upgrade handshake to the upstream and splice the two connections
async fn handle_upgrade(
    mut req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upstream = state.pool.upstream_authority();
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(upgrade_type = %upgrade_type, path = %req.uri().path(), "Handling upgrade request");

    rewrite_forwarding_headers(req.headers_mut(), &upstream, client_addr, is_tls);
    let raw_request = build_upgrade_request(&req, &upstream);

    let mut upstream_stream = match TcpStream::connect(&upstream).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(upstream = %upstream, error = %e, "Failed to connect to upstream for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::UpstreamUnavailable,
                format!("Failed to connect to upstream: {}", e),
            ));
        }
    };

    if let Err(e) = upstream_stream.write_all(&raw_request).await {
        warn!(upstream = %upstream, error = %e, "Failed to send upgrade request");
        return Ok(json_error_response(
            ProxyErrorCode::UpgradeFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let (head, early_data) = match read_response_head(&mut upstream_stream).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(upstream = %upstream, error = %e, "Failed to read upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                format!("Failed to read upstream response: {}", e),
            ));
        }
    };

    let (status, response_headers) = match parse_upgrade_response(&head) {
        Some(parsed) => parsed,
        None => {
            warn!(upstream = %upstream, "Failed to parse upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::UpgradeFailed,
                "Invalid upgrade response from upstream",
            ));
        }
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        debug!(status = %status, "Upstream declined upgrade");
        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        return Ok(response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .unwrap_or_else(|_| {
                json_error_response(ProxyErrorCode::InternalError, "Invalid upstream response")
            }));
    }

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in &response_headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            continue;
        }
        if let Ok(hv) = HeaderValue::from_str(value) {
            response = response.header(name.as_str(), hv);
        }
    }
    let response = match response.body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed()) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "Failed to build upgrade response");
            return Ok(json_error_response(
                ProxyErrorCode::InternalError,
                "Failed to build upgrade response",
            ));
        }
    };

    debug!(upgrade_type = %upgrade_type, "Upgrade accepted by upstream");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, upstream_stream, early_data).await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to upgrade client connection");
            }
        }
    });

    Ok(response)
}

/// Copy bytes both ways until either side closes
async fn forward_bidirectional(client: Upgraded, mut upstream: TcpStream, early_data: Vec<u8>) {
    let mut client_io = TokioIo::new(client);

    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(error = %e, "Failed to relay early upstream data");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(client_to_upstream, upstream_to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(error = %e, "Upgraded connection closed with error");
        }
    }
}
