//! Layered tunnel stream.
//!
//! A chain dial starts with a raw TCP socket and replaces it with a TLS
//! session whenever a hop requires encryption. TLS sessions nest: the TLS
//! session to hop 2 runs inside the TLS session to hop 1.
//!
//! A pooled tunnel is checked for a remote close before it is handed out.
//! Bytes the check had to read out of a TLS session are replayed by a
//! [`Tunnel::Replay`] layer.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;

use super::sni::Sniffed;

const LIVENESS_READ_SIZE: usize = 16 * 1024;

/// Duplex connection established through a chain.
#[derive(Debug)]
pub enum Tunnel {
    /// Raw socket to the first peer, possibly carrying plaintext CONNECT tunnels.
    Tcp(TcpStream),
    /// TLS session layered over an inner tunnel.
    Tls(Box<TlsStream<Tunnel>>),
    /// Plaintext read ahead by [`Tunnel::into_live`], replayed before the inner tunnel.
    Replay(Box<Sniffed<Tunnel>>),
}

impl Tunnel {
    /// Whether the outermost layer is TLS.
    pub fn is_tls(&self) -> bool {
        match self {
            Tunnel::Tcp(_) => false,
            Tunnel::Tls(_) => true,
            Tunnel::Replay(replay) => replay.get_ref().is_tls(),
        }
    }

    /// Number of TLS layers wrapped around the socket.
    pub fn tls_depth(&self) -> usize {
        match self {
            Tunnel::Tcp(_) => 0,
            Tunnel::Tls(tls) => 1 + tls.get_ref().0.tls_depth(),
            Tunnel::Replay(replay) => replay.get_ref().tls_depth(),
        }
    }

    /// The underlying socket to the first peer.
    pub fn tcp(&self) -> &TcpStream {
        match self {
            Tunnel::Tcp(tcp) => tcp,
            Tunnel::Tls(tls) => tls.get_ref().0.tcp(),
            Tunnel::Replay(replay) => replay.get_ref().tcp(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    /// Non-blocking liveness check. Returns `None` if the remote has closed.
    ///
    /// A plain socket is peeked without consuming anything. A TLS tunnel is
    /// read through every layer, because a graceful close arrives as an
    /// encrypted close_notify that looks like data on the socket. Plaintext
    /// read this way is replayed before anything else.
    pub fn into_live(mut self) -> Option<Tunnel> {
        if let Tunnel::Tcp(tcp) = &self {
            let open = socket_open(tcp);
            return open.then_some(self);
        }
        if let Tunnel::Replay(_) = &self {
            return Some(self);
        }

        let mut buf = vec![0u8; LIVENESS_READ_SIZE];
        let polled = self.read(&mut buf).now_or_never();
        match polled {
            None => Some(self),
            Some(Ok(0)) | Some(Err(_)) => None,
            Some(Ok(n)) => {
                buf.truncate(n);
                let replay = Sniffed::new(Bytes::from(buf), self);
                Some(Tunnel::Replay(Box::new(replay)))
            }
        }
    }
}

fn socket_open(tcp: &TcpStream) -> bool {
    let mut byte = [0u8; 1];
    match tcp.peek(&mut byte).now_or_never() {
        None => true,
        Some(Ok(0)) => false,
        Some(Ok(_)) => true,
        Some(Err(e)) => e.kind() == io::ErrorKind::WouldBlock,
    }
}

impl From<TcpStream> for Tunnel {
    fn from(stream: TcpStream) -> Self {
        Tunnel::Tcp(stream)
    }
}

impl AsyncRead for Tunnel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Tcp(tcp) => Pin::new(tcp).poll_read(cx, buf),
            Tunnel::Tls(tls) => Pin::new(tls.as_mut()).poll_read(cx, buf),
            Tunnel::Replay(replay) => Pin::new(replay.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Tunnel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Tunnel::Tcp(tcp) => Pin::new(tcp).poll_write(cx, buf),
            Tunnel::Tls(tls) => Pin::new(tls.as_mut()).poll_write(cx, buf),
            Tunnel::Replay(replay) => Pin::new(replay.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Tcp(tcp) => Pin::new(tcp).poll_flush(cx),
            Tunnel::Tls(tls) => Pin::new(tls.as_mut()).poll_flush(cx),
            Tunnel::Replay(replay) => Pin::new(replay.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Tunnel::Tcp(tcp) => Pin::new(tcp).poll_shutdown(cx),
            Tunnel::Tls(tls) => Pin::new(tls.as_mut()).poll_shutdown(cx),
            Tunnel::Replay(replay) => Pin::new(replay.as_mut()).poll_shutdown(cx),
        }
    }
}
