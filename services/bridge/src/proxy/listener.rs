//! TCP listener and connection handling.
//!
//! Accepts client connections and hands each one to the entry point of the
//! configured mode:
//! - `direct`: tunnel through the chain and relay; dial failures get a 502
//! - `tls`: SNI hijack to `<sni>:443` through the chain
//! - `http`: HTTP proxy adapter forwarding to the last peer

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::hijack::{HijackOutcome, SniHijacker};
use super::http::HttpProxy;
use super::peer::PeerChain;
use super::pool::ConnectionPool;
use super::relay::{relay, RelayStats};
use super::sni::{SniConfig, SniInspector};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Which entry point accepted connections are handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerMode {
    /// Tunnel every connection to the last peer.
    Direct,
    /// Hijack TLS connections by SNI.
    Tls,
    /// Act as an HTTP proxy.
    Http,
}

impl FromStr for ListenerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ListenerMode::Direct),
            "tls" => Ok(ListenerMode::Tls),
            "http" => Ok(ListenerMode::Http),
            other => Err(format!(
                "unknown mode '{}' (expected direct, tls or http)",
                other
            )),
        }
    }
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerMode::Direct => f.write_str("direct"),
            ListenerMode::Tls => f.write_str("tls"),
            ListenerMode::Http => f.write_str("http"),
        }
    }
}

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Entry point for accepted connections.
    pub mode: ListenerMode,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// SNI inspection configuration (tls mode).
    pub sni_config: SniConfig,
    /// Start the chain's background dialer when the listener starts.
    pub prewarm: bool,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr, mode: ListenerMode) -> Self {
        Self {
            bind_addr,
            mode,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            sni_config: SniConfig::default(),
            prewarm: true,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Tunnels established and relayed.
    pub tunnels_established: AtomicU64,
    /// Connections closed because no tunnel could be established.
    pub tunnel_failures: AtomicU64,
    /// Bytes relayed from clients into tunnels.
    pub bytes_up: AtomicU64,
    /// Bytes relayed from tunnels back to clients.
    pub bytes_down: AtomicU64,
}

impl ListenerStats {
    fn record_relay(&self, stats: RelayStats) {
        self.tunnels_established.fetch_add(1, Ordering::Relaxed);
        self.bytes_up.fetch_add(stats.a_to_b, Ordering::Relaxed);
        self.bytes_down.fetch_add(stats.b_to_a, Ordering::Relaxed);
    }
}

/// A TCP listener in front of a peer chain.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    chain: PeerChain,
    pool: Arc<ConnectionPool>,
    hijacker: SniHijacker,
    http: HttpProxy,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind a listener for `chain`, dialing through `pool`.
    pub async fn bind(
        config: ListenerConfig,
        chain: PeerChain,
        pool: Arc<ConnectionPool>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            mode = %config.mode,
            max_connections = config.max_connections,
            "Listener bound"
        );

        let inspector = SniInspector::with_config(config.sni_config.clone());
        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            hijacker: SniHijacker::new(chain.clone(), Arc::clone(&pool), inspector),
            http: HttpProxy::new(chain.clone(), Arc::clone(&pool)),
            listener,
            config,
            chain,
            pool,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(
            "Forwarding {}: {} → {}",
            self.config.mode, local_addr, self.chain
        );

        if self.config.prewarm {
            self.pool.warm(&self.chain).await;
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream).await {
                                debug!(error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, client: TcpStream) -> io::Result<()> {
        let _ = client.set_nodelay(true);

        match self.config.mode {
            ListenerMode::Direct => self.handle_direct(client).await,
            ListenerMode::Tls => {
                match self.hijacker.handle(client).await {
                    HijackOutcome::Relayed(stats) => self.stats.record_relay(stats),
                    HijackOutcome::Failed(_) | HijackOutcome::Rejected(_) => {
                        self.stats.tunnel_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(())
            }
            ListenerMode::Http => {
                match self.http.handle(client).await {
                    Ok(stats) => self.stats.record_relay(stats),
                    Err(e) => {
                        self.stats.tunnel_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "HTTP proxy request failed");
                    }
                }
                Ok(())
            }
        }
    }

    /// Tunnel to the last peer, or answer with a 502 carrying the error.
    async fn handle_direct(&self, mut client: TcpStream) -> io::Result<()> {
        let tunnel = match self.pool.acquire(&self.chain).await {
            Ok(tunnel) => tunnel,
            Err(failure) => {
                let error = failure.close().await;
                self.stats.tunnel_failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %error, reason = error.reason_code(), "Dial failed");

                write_error_response(&mut client, 502, &format!("Error: {}", error)).await?;
                client.shutdown().await?;
                return Ok(());
            }
        };

        debug!(tunnel_peer = ?tunnel.peer_addr().ok(), "Tunnel established");
        let stats = relay(client, tunnel).await;
        self.stats.record_relay(stats);

        debug!(
            bytes_up = stats.a_to_b,
            bytes_down = stats.b_to_a,
            "Connection closed"
        );
        Ok(())
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Write a minimal HTTP/1.0 plain-text response.
pub async fn write_error_response<W>(writer: &mut W, status: u16, body: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.0 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await
}
