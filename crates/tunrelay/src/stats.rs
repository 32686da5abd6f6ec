//! Connection statistics and the HTTP endpoint that exposes them.
//!
//! [`Statistics`] is shared by the relay workers. [`StatsServer`] serves a
//! JSON view of it over HTTP/1:
//!
//! - `GET /traffic`: byte and connection counters
//! - `GET /connections`: currently relayed connections
//! - `GET /version`: crate version
//!
//! With a non-empty token every request must carry
//! `Authorization: Bearer <token>`.

use crate::adapter::{Metadata, Network};
use bytes::Bytes;
use dashmap::DashMap;
use http_body_util::Full;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

/// Pause before accepting again after a failed `accept`.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// Counters
// ============================================================================

/// Snapshot of one active connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub network: Network,
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub proxy: String,
    /// Unix timestamp (seconds) the relay started.
    pub start: u64,
    pub upload: u64,
    pub download: u64,
}

/// Snapshot of the global counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficSnapshot {
    pub uploaded: u64,
    pub downloaded: u64,
    pub tcp_total: u64,
    pub udp_total: u64,
    pub dial_failures: u64,
    pub active: u64,
}

/// Traffic and connection counters.
#[derive(Debug, Default)]
pub struct Statistics {
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    tcp_total: AtomicU64,
    udp_total: AtomicU64,
    dial_failures: AtomicU64,
    next_id: AtomicU64,
    active: DashMap<u64, ConnectionInfo>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a connection. The entry is removed when the returned
    /// guard is dropped.
    pub fn track(self: &Arc<Self>, metadata: &Metadata, proxy: &str) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        match metadata.network {
            Network::Tcp => self.tcp_total.fetch_add(1, Ordering::Relaxed),
            Network::Udp => self.udp_total.fetch_add(1, Ordering::Relaxed),
        };
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.active.insert(
            id,
            ConnectionInfo {
                id,
                network: metadata.network,
                source: metadata.src,
                destination: metadata.dst,
                proxy: proxy.to_string(),
                start,
                upload: 0,
                download: 0,
            },
        );
        ConnectionGuard {
            id,
            stats: self.clone(),
        }
    }

    /// Count a failed upstream dial.
    pub fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the global counters.
    pub fn snapshot(&self) -> TrafficSnapshot {
        TrafficSnapshot {
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            tcp_total: self.tcp_total.load(Ordering::Relaxed),
            udp_total: self.udp_total.load(Ordering::Relaxed),
            dial_failures: self.dial_failures.load(Ordering::Relaxed),
            active: self.active.len() as u64,
        }
    }

    /// Get the active connections, oldest first.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<_> = self.active.iter().map(|e| e.value().clone()).collect();
        list.sort_by_key(|c| c.id);
        list
    }
}

/// Keeps one connection listed in [`Statistics`] while alive.
pub struct ConnectionGuard {
    id: u64,
    stats: Arc<Statistics>,
}

impl ConnectionGuard {
    /// Record relayed bytes.
    pub fn add_traffic(&self, upload: u64, download: u64) {
        self.stats.uploaded.fetch_add(upload, Ordering::Relaxed);
        self.stats.downloaded.fetch_add(download, Ordering::Relaxed);
        if let Some(mut entry) = self.stats.active.get_mut(&self.id) {
            entry.upload += upload;
            entry.download += download;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active.remove(&self.id);
    }
}

// ============================================================================
// HTTP server
// ============================================================================

#[derive(Serialize)]
struct ConnectionsBody {
    total: usize,
    connections: Vec<ConnectionInfo>,
}

#[derive(Serialize)]
struct VersionBody {
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorBody {
    message: &'static str,
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}

fn authorized<B>(req: &Request<B>, token: &str) -> bool {
    if token.is_empty() {
        return true;
    }
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|v| v == token)
}

/// Route one request.
pub fn handle_request<B>(req: &Request<B>, token: &str, stats: &Statistics) -> Response<Full<Bytes>> {
    if !authorized(req, token) {
        return json_response(StatusCode::UNAUTHORIZED, &ErrorBody { message: "Unauthorized" });
    }
    if req.method() != Method::GET {
        return json_response(
            StatusCode::METHOD_NOT_ALLOWED,
            &ErrorBody { message: "Method Not Allowed" },
        );
    }

    match req.uri().path() {
        "/traffic" => json_response(StatusCode::OK, &stats.snapshot()),
        "/connections" => {
            let connections = stats.connections();
            json_response(
                StatusCode::OK,
                &ConnectionsBody {
                    total: connections.len(),
                    connections,
                },
            )
        }
        "/version" => json_response(
            StatusCode::OK,
            &VersionBody {
                version: crate::VERSION,
            },
        ),
        _ => json_response(StatusCode::NOT_FOUND, &ErrorBody { message: "Not Found" }),
    }
}

/// HTTP server exposing [`Statistics`].
pub struct StatsServer {
    addr: SocketAddr,
    token: Arc<str>,
    stats: Arc<Statistics>,
}

impl StatsServer {
    pub fn new(addr: SocketAddr, token: &str, stats: Arc<Statistics>) -> Self {
        Self {
            addr,
            token: Arc::from(token),
            stats,
        }
    }

    /// Bind the configured address and serve until the task is aborted.
    pub async fn run(self) -> io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        log::info!("[STATS] Serving statistics on http://{}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections accepted on `listener`.
    pub async fn serve(self, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = accept_with_retry(|| listener.accept()).await;

            let token = self.token.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let response = handle_request(&req, &token, &stats);
                    async move { Ok::<_, Infallible>(response) }
                });
                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    log::debug!("[STATS] Connection from {} ended: {}", peer, e);
                }
            });
        }
    }
}

/// Call `accept` until it succeeds, backing off after each failure so a
/// persistent error (e.g. out of file descriptors) does not spin.
async fn accept_with_retry<T, F, Fut>(mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                log::warn!("[STATS] Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
