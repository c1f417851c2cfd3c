//! Chain dialer.
//!
//! Establishes a single duplex connection through every peer of a chain:
//! TCP to the first peer, then one `CONNECT` per further peer, wrapping the
//! connection in a TLS client session whenever a peer declares TLS.
//!
//! CONNECT responses are read one byte at a time. The socket may be handed
//! to a TLS client right after the response, so nothing past the final
//! line terminator may be consumed.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::peer::{format_authority, Peer, PeerChain};
use super::tunnel::Tunnel;
use crate::error::{ChainError, DialFailure, DialStage};

/// Maximum length of a single CONNECT response line.
pub const MAX_LINE_LENGTH: usize = 8192;

/// Maximum total size of a CONNECT response header block.
pub const MAX_RESPONSE_HEAD: usize = 8192;

/// Optional deadlines for each dial stage. `None` waits indefinitely.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialTimeouts {
    /// TCP connect to the first peer.
    pub connect: Option<Duration>,
    /// TLS handshake with any peer.
    pub handshake: Option<Duration>,
    /// CONNECT request and response exchange.
    pub response: Option<Duration>,
}

/// Dials peer chains.
#[derive(Debug, Clone, Default)]
pub struct ChainDialer {
    timeouts: DialTimeouts,
}

impl ChainDialer {
    /// Create a dialer without deadlines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dialer with custom deadlines.
    pub fn with_timeouts(timeouts: DialTimeouts) -> Self {
        Self { timeouts }
    }

    pub fn timeouts(&self) -> DialTimeouts {
        self.timeouts
    }

    /// Dial every peer of the chain in order.
    ///
    /// On failure the connection established so far, if any, is returned
    /// inside the [`DialFailure`].
    pub async fn dial(&self, chain: &PeerChain) -> Result<Tunnel, DialFailure> {
        let first = chain.first();
        let tcp = self.connect(first).await.map_err(DialFailure::new)?;
        let mut conn = self.handshake(Tunnel::Tcp(tcp), first).await?;

        for hop in chain.peers().windows(2) {
            let (via, next) = (&hop[0], &hop[1]);
            if let Err(e) = self.connect_through(&mut conn, &next.host, next.port, via).await {
                return Err(DialFailure::with_conn(e, conn));
            }
            conn = self.handshake(conn, next).await?;
        }

        debug!(chain = %chain, tls_depth = conn.tls_depth(), "Chain established");
        Ok(conn)
    }

    /// Issue a CONNECT to `host:port` over an established connection to `via`,
    /// sending `via`'s extra headers.
    pub async fn connect_through<S>(
        &self,
        conn: &mut S,
        host: &str,
        port: u16,
        via: &Peer,
    ) -> Result<(), ChainError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = format_authority(host, port);
        debug!(via = %via, target = %target, "Sending CONNECT");
        self.connect_with_headers(conn, &target, &via.connect_extra)
            .await
    }

    /// Issue a CONNECT to `target` carrying exactly `headers`.
    pub async fn connect_with_headers<S>(
        &self,
        conn: &mut S,
        target: &str,
        headers: &BTreeMap<String, Vec<String>>,
    ) -> Result<(), ChainError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        with_deadline(
            self.timeouts.response,
            target,
            DialStage::Tunnel,
            http_connect(conn, target, headers),
        )
        .await
    }

    async fn connect(&self, peer: &Peer) -> Result<TcpStream, ChainError> {
        let authority = peer.authority();
        debug!(peer = %authority, "Dialing first peer");

        let tcp = with_deadline(self.timeouts.connect, &authority, DialStage::Connect, async {
            TcpStream::connect(authority.as_str())
                .await
                .map_err(|source| ChainError::Dial {
                    peer: authority.clone(),
                    source,
                })
        })
        .await?;

        let _ = tcp.set_nodelay(true);
        Ok(tcp)
    }

    /// Wrap `conn` in a TLS session if `peer` declares TLS.
    async fn handshake(&self, conn: Tunnel, peer: &Peer) -> Result<Tunnel, DialFailure> {
        let (Some(tls), Some(name)) = (peer.tls.as_ref(), peer.tls_server_name()) else {
            return Ok(conn);
        };

        let server_name = match ServerName::try_from(name.to_string()) {
            Ok(server_name) => server_name,
            Err(_) => {
                let error = ChainError::InvalidServerName {
                    peer: peer.authority(),
                    name: name.to_string(),
                };
                return Err(DialFailure::with_conn(error, conn));
            }
        };

        debug!(peer = %peer, server_name = %name, "TLS handshake");
        let connect = TlsConnector::from(tls.client_config())
            .connect(server_name, conn)
            .into_fallible();

        let result = match self.timeouts.handshake {
            Some(limit) => match timeout(limit, connect).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(DialFailure::new(ChainError::Timeout {
                        peer: peer.authority(),
                        stage: DialStage::Handshake,
                    }))
                }
            },
            None => connect.await,
        };

        match result {
            Ok(stream) => Ok(Tunnel::Tls(Box::new(stream))),
            Err((source, conn)) => Err(DialFailure::with_conn(
                ChainError::Handshake {
                    peer: peer.authority(),
                    source,
                },
                conn,
            )),
        }
    }
}

async fn with_deadline<T, F>(
    limit: Option<Duration>,
    peer: &str,
    stage: DialStage,
    fut: F,
) -> Result<T, ChainError>
where
    F: Future<Output = Result<T, ChainError>>,
{
    match limit {
        Some(limit) => timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(ChainError::Timeout {
                peer: peer.to_string(),
                stage,
            })
        }),
        None => fut.await,
    }
}

/// Build a CONNECT request for `target` (`host:port`).
///
/// Multi-valued headers produce one line per value.
pub fn connect_request(target: &str, extra: &BTreeMap<String, Vec<String>>) -> String {
    let mut request = format!("CONNECT {} HTTP/1.0\r\n", target);
    for (name, values) in extra {
        for value in values {
            request.push_str(name);
            request.push_str(": ");
            request.push_str(value);
            request.push_str("\r\n");
        }
    }
    request.push_str("\r\n");
    request
}

/// Perform a CONNECT handshake on `stream`.
///
/// Succeeds only on an `HTTP/1.0 200` or `HTTP/1.1 200` status line, after
/// consuming the response header block up to and including its blank line.
pub async fn http_connect<S>(
    stream: &mut S,
    target: &str,
    extra: &BTreeMap<String, Vec<String>>,
) -> Result<(), ChainError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let io_err = |source: io::Error| ChainError::TunnelIo {
        peer: target.to_string(),
        source,
    };

    let request = connect_request(target, extra);
    stream.write_all(request.as_bytes()).await.map_err(io_err)?;
    stream.flush().await.map_err(io_err)?;

    let status = read_line(stream, MAX_LINE_LENGTH).await.map_err(io_err)?;
    if !is_success_status(&status) {
        return Err(ChainError::TunnelRejected {
            peer: target.to_string(),
            status,
        });
    }

    let mut head_len = status.len();
    loop {
        let line = read_line(stream, MAX_LINE_LENGTH).await.map_err(io_err)?;
        if line.is_empty() {
            break;
        }
        head_len += line.len();
        if head_len > MAX_RESPONSE_HEAD {
            return Err(io_err(io::Error::new(
                io::ErrorKind::InvalidData,
                "CONNECT response head too large",
            )));
        }
    }

    Ok(())
}

/// Whether a CONNECT status line reports success.
pub fn is_success_status(line: &str) -> bool {
    ["HTTP/1.0 200", "HTTP/1.1 200"].iter().any(|prefix| {
        line.strip_prefix(prefix)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(' '))
    })
}

/// Read one line without buffering past its `\n`.
///
/// The terminator (`\r\n` or `\n`) is consumed and stripped.
pub async fn read_line<R>(reader: &mut R, limit: usize) -> io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut line = Vec::new();
    loop {
        let byte = reader.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        if line.len() >= limit {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "line exceeds maximum length",
            ));
        }
        line.push(byte);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in pairs {
            map.entry(name.to_string())
                .or_default()
                .push(value.to_string());
        }
        map
    }

    #[test]
    fn test_connect_request_bytes() {
        let extra = headers(&[
            ("Proxy-Authorization", "Basic dXNlcjpwYXNz"),
            ("X-Hop", "one"),
            ("X-Hop", "two"),
        ]);
        assert_eq!(
            connect_request("target.example:443", &extra),
            "CONNECT target.example:443 HTTP/1.0\r\n\
             Proxy-Authorization: Basic dXNlcjpwYXNz\r\n\
             X-Hop: one\r\n\
             X-Hop: two\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_connect_request_without_headers() {
        assert_eq!(
            connect_request("a:1", &BTreeMap::new()),
            "CONNECT a:1 HTTP/1.0\r\n\r\n"
        );
    }

    #[test]
    fn test_success_status() {
        assert!(is_success_status("HTTP/1.0 200 Connection established"));
        assert!(is_success_status("HTTP/1.1 200 OK"));
        assert!(is_success_status("HTTP/1.1 200"));
        assert!(!is_success_status("HTTP/1.1 2000 Weird"));
        assert!(!is_success_status("HTTP/1.1 404 Not Found"));
        assert!(!is_success_status("HTTP/2 200"));
        assert!(!is_success_status(""));
    }

    #[tokio::test]
    async fn test_http_connect_leaves_trailing_bytes() {
        let mut mock = Builder::new()
            .write(b"CONNECT target:443 HTTP/1.0\r\n\r\n")
            .read(b"HTTP/1.1 200 Connection established\r\n\r\n\x16\x03\x03")
            .build();

        http_connect(&mut mock, "target:443", &BTreeMap::new())
            .await
            .unwrap();

        let mut rest = [0u8; 3];
        mock.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"\x16\x03\x03");
    }

    #[tokio::test]
    async fn test_http_connect_consumes_response_headers() {
        let mut mock = Builder::new()
            .write(b"CONNECT target:443 HTTP/1.0\r\nX-Auth: t\r\n\r\n")
            .read(b"HTTP/1.0 200 OK\r\nProxy-Agent: test\r\nVia: 1.0 a\r\n\r\nDATA")
            .build();

        http_connect(&mut mock, "target:443", &headers(&[("X-Auth", "t")]))
            .await
            .unwrap();

        let mut rest = [0u8; 4];
        mock.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"DATA");
    }

    #[tokio::test]
    async fn test_http_connect_rejected() {
        let mut mock = Builder::new()
            .write(b"CONNECT target:443 HTTP/1.0\r\n\r\n")
            .read(b"HTTP/1.1 404 Not Found\r\n")
            .build();

        let err = http_connect(&mut mock, "target:443", &BTreeMap::new())
            .await
            .unwrap_err();
        match err {
            ChainError::TunnelRejected { peer, status } => {
                assert_eq!(peer, "target:443");
                assert_eq!(status, "HTTP/1.1 404 Not Found");
            }
            other => panic!("Expected TunnelRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_http_connect_eof() {
        let mut mock = Builder::new()
            .write(b"CONNECT target:443 HTTP/1.0\r\n\r\n")
            .read(b"HTTP/1.1 200")
            .build();

        let err = http_connect(&mut mock, "target:443", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::TunnelIo { .. }));
    }

    #[tokio::test]
    async fn test_read_line_limit() {
        let mut mock = Builder::new().read(b"abcdefgh\r\n").build();
        let err = read_line(&mut mock, 4).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_read_line_accepts_bare_newline() {
        let mut mock = Builder::new().read(b"one\ntwo\r\n").build();
        assert_eq!(read_line(&mut mock, 64).await.unwrap(), "one");
        assert_eq!(read_line(&mut mock, 64).await.unwrap(), "two");
    }

    #[tokio::test]
    async fn test_dial_unreachable_first_peer() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let chain = PeerChain::new(vec![Peer::new("127.0.0.1", port)]).unwrap();
        let failure = ChainDialer::new().dial(&chain).await.unwrap_err();
        assert!(failure.conn.is_none());
        match failure.error {
            ChainError::Dial { peer, .. } => assert_eq!(peer, format!("127.0.0.1:{}", port)),
            other => panic!("Expected Dial, got {:?}", other),
        }
    }
}
