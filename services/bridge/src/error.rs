//! Error types for chain dialing and SNI hijacking.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::proxy::Tunnel;

/// Stage of a hop at which a deadline elapsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialStage {
    /// TCP connect to the first peer.
    Connect,
    /// CONNECT request/response exchange.
    Tunnel,
    /// TLS client handshake.
    Handshake,
}

impl fmt::Display for DialStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialStage::Connect => f.write_str("connect"),
            DialStage::Tunnel => f.write_str("tunnel"),
            DialStage::Handshake => f.write_str("handshake"),
        }
    }
}

/// Chain errors. Every dial-related variant names the failing peer as `host:port`.
#[derive(Debug, Error)]
pub enum ChainError {
    /// TCP connect to the first hop failed.
    #[error("dial failed: {peer}: {source}")]
    Dial {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// CONNECT response was not a 200.
    #[error("tunnel rejected: connecting to {peer}: {status}")]
    TunnelRejected { peer: String, status: String },

    /// CONNECT request could not be written or the response could not be read.
    #[error("tunnel failed: connecting to {peer}: {source}")]
    TunnelIo {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// TLS handshake with a hop failed.
    #[error("handshake with {peer} failed: {source}")]
    Handshake {
        peer: String,
        #[source]
        source: io::Error,
    },

    /// TLS server name is not a valid DNS name or IP address.
    #[error("invalid TLS server name for {peer}: {name}")]
    InvalidServerName { peer: String, name: String },

    /// A configured deadline elapsed.
    #[error("timeout during {stage} with {peer}")]
    Timeout { peer: String, stage: DialStage },

    /// Client hello carried no server name.
    #[error("no SNI in client hello")]
    NoSni,

    /// The background dialer for a chain has stopped.
    #[error("connection pool closed for {fingerprint}")]
    PoolClosed { fingerprint: String },
}

impl ChainError {
    /// Short reason code for logs and stats.
    pub fn reason_code(&self) -> &'static str {
        match self {
            ChainError::Dial { .. } => "dial_failed",
            ChainError::TunnelRejected { .. } => "tunnel_rejected",
            ChainError::TunnelIo { .. } => "tunnel_io",
            ChainError::Handshake { .. } => "handshake_failed",
            ChainError::InvalidServerName { .. } => "invalid_server_name",
            ChainError::Timeout { .. } => "timeout",
            ChainError::NoSni => "no_sni",
            ChainError::PoolClosed { .. } => "pool_closed",
        }
    }
}

/// A failed dial together with whatever connection was established before
/// the failure. The connection is never dropped silently; release it with
/// [`DialFailure::close`] or take it with [`DialFailure::into_parts`].
#[derive(Error)]
#[error("{error}")]
pub struct DialFailure {
    #[source]
    pub error: ChainError,
    pub conn: Option<Tunnel>,
}

impl DialFailure {
    /// Failure with no connection to clean up.
    pub fn new(error: ChainError) -> Self {
        Self { error, conn: None }
    }

    /// Failure carrying the partially established connection.
    pub fn with_conn(error: ChainError, conn: Tunnel) -> Self {
        Self {
            error,
            conn: Some(conn),
        }
    }

    pub fn into_parts(self) -> (ChainError, Option<Tunnel>) {
        (self.error, self.conn)
    }

    /// Shut down the partial connection, if any, and return the error.
    pub async fn close(self) -> ChainError {
        use tokio::io::AsyncWriteExt;

        if let Some(mut conn) = self.conn {
            let _ = conn.shutdown().await;
        }
        self.error
    }
}

impl fmt::Debug for DialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialFailure")
            .field("error", &self.error)
            .field("has_conn", &self.conn.is_some())
            .finish()
    }
}
