//! Transparent TLS hijacking by SNI.
//!
//! A raw client connection is sniffed for the ClientHello server name, a
//! pooled tunnel through the chain is taken, and one final CONNECT to
//! `<sni>:443` is issued through it. From then on bytes are relayed
//! untouched; the TLS session is never decrypted.
//!
//! ```text
//! ACCEPTED -> SNI_PARSED -> CHAIN_DIALED -> RELAYING
//!     \            \              \
//!      REJECTED     FAILED         FAILED
//! ```

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::peer::PeerChain;
use super::pool::ConnectionPool;
use super::relay::{relay, RelayStats};
use super::sni::{SniInspector, SniResult};
use crate::error::ChainError;

/// Port every hijacked connection is tunneled to.
pub const HTTPS_PORT: u16 = 443;

/// Terminal state of a hijacked connection.
#[derive(Debug)]
pub enum HijackOutcome {
    /// No usable server name; closed without dialing.
    Rejected(SniResult),
    /// Chain or final CONNECT failed; closed.
    Failed(ChainError),
    /// Bytes were relayed until one side closed.
    Relayed(RelayStats),
}

/// Tunnels TLS clients to the host named in their ClientHello.
pub struct SniHijacker {
    chain: PeerChain,
    pool: Arc<ConnectionPool>,
    inspector: SniInspector,
}

impl SniHijacker {
    pub fn new(chain: PeerChain, pool: Arc<ConnectionPool>, inspector: SniInspector) -> Self {
        Self {
            chain,
            pool,
            inspector,
        }
    }

    /// Handle one client connection. Every failure is logged and closes the
    /// connection; nothing is written back to the client.
    pub async fn handle<S>(&self, client: S) -> HijackOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (result, mut client) = self.inspector.inspect(client).await;
        let host = match result {
            SniResult::Found(host) => host,
            other => {
                warn!(result = ?other, "Cannot support non-SNI enabled clients");
                let _ = client.shutdown().await;
                return HijackOutcome::Rejected(other);
            }
        };
        debug!(sni = %host, "SNI parsed");

        let mut tunnel = match self.pool.acquire(&self.chain).await {
            Ok(tunnel) => tunnel,
            Err(failure) => {
                let error = failure.close().await;
                warn!(sni = %host, error = %error, "Cannot dial proxy");
                let _ = client.shutdown().await;
                return HijackOutcome::Failed(error);
            }
        };

        if let Err(error) = self
            .pool
            .dialer()
            .connect_through(&mut tunnel, &host, HTTPS_PORT, self.chain.last())
            .await
        {
            warn!(sni = %host, error = %error, "Cannot do final HTTP connect");
            let _ = tunnel.shutdown().await;
            let _ = client.shutdown().await;
            return HijackOutcome::Failed(error);
        }

        debug!(sni = %host, "Relaying");
        HijackOutcome::Relayed(relay(client, tunnel).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ChainDialer, Peer};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn counting_listener() -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        });
        (port, accepted)
    }

    fn hijacker(port: u16) -> SniHijacker {
        let chain = PeerChain::new(vec![Peer::new("127.0.0.1", port)]).unwrap();
        let pool = Arc::new(ConnectionPool::new(ChainDialer::new()));
        SniHijacker::new(chain, pool, SniInspector::new())
    }

    #[tokio::test]
    async fn test_plain_bytes_rejected_without_dial() {
        let (port, accepted) = counting_listener().await;
        let hijacker = hijacker(port);

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let outcome = hijacker.handle(server).await;
        assert!(matches!(
            outcome,
            HijackOutcome::Rejected(SniResult::NotTls)
        ));

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_hello_without_sni_rejected() {
        let (port, accepted) = counting_listener().await;
        let hijacker = hijacker(port);

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(&crate::proxy::sni::client_hello(None))
            .await
            .unwrap();

        let outcome = hijacker.handle(server).await;
        assert!(matches!(outcome, HijackOutcome::Rejected(SniResult::NoSni)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(accepted.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let hijacker = hijacker(port);

        let (mut client, server) = tokio::io::duplex(1024);
        client
            .write_all(&crate::proxy::sni::client_hello(Some("example.com")))
            .await
            .unwrap();

        let outcome = hijacker.handle(server).await;
        assert!(matches!(
            outcome,
            HijackOutcome::Failed(ChainError::Dial { .. })
        ));

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }
}
