//! Chained CONNECT proxying.
//!
//! This module provides:
//! - Multi-hop HTTP CONNECT dialing with optional TLS per hop
//! - Pre-warmed tunnel pool keyed by chain fingerprint
//! - SNI inspection for transparent TLS hijacking
//! - HTTP proxy adapter
//! - Bidirectional relay with paired close
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> (SNI Hijacker | HTTP Adapter) -> Pool -> Dialer
//!                                                                  |
//!                                  peer 1 -> CONNECT -> ... -> peer n
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use bridgeproxy::proxy::{ChainDialer, ConnectionPool, Listener, ListenerConfig, ListenerMode};
//!
//! let pool = Arc::new(ConnectionPool::new(ChainDialer::new()));
//! let config = ListenerConfig::new("127.0.0.1:8080".parse()?, ListenerMode::Direct);
//! let listener = Listener::bind(config, chain, pool).await?;
//! Arc::new(listener).run().await?;
//! ```

mod dialer;
mod hijack;
mod http;
mod listener;
mod peer;
mod pool;
mod relay;
pub mod sni;
mod tunnel;

pub use dialer::{
    connect_request, http_connect, is_success_status, read_line, ChainDialer, DialTimeouts,
    MAX_LINE_LENGTH, MAX_RESPONSE_HEAD,
};
pub use hijack::{HijackOutcome, SniHijacker, HTTPS_PORT};
pub use http::{
    absolute_uri, add_extra_headers, connect_target, ChainConnector, HttpError, HttpProxy,
    UpstreamConn, IDLE_TIMEOUT, MAX_IDLE_PER_HOST, MAX_REQUEST_HEAD,
};
pub use listener::{
    write_error_response, Listener, ListenerConfig, ListenerMode, ListenerStats,
    DEFAULT_MAX_CONNECTIONS,
};
pub use peer::{format_authority, EmptyChain, Peer, PeerChain, PeerTls};
pub use pool::{ConnectionPool, PoolStats};
pub use relay::{relay, RelayStats, SHUTDOWN_GRACE};
pub use sni::{parse_client_hello, SniConfig, SniInspector, SniResult, Sniffed};
pub use tunnel::Tunnel;
