//! Peer and peer chain model.
//!
//! A peer is one hop: an intermediate HTTP(S) proxy or the final server.
//! The first peer of a chain is reached by TCP; every later peer is reached
//! by issuing `CONNECT` through the connection to the previous one, sending
//! the previous peer's `connect_extra` headers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use thiserror::Error;

/// TLS parameters for a hop.
#[derive(Debug, Clone)]
pub struct PeerTls {
    /// Expected server name. Defaults to the peer's host name.
    pub server_name: Option<String>,
    /// Whether certificate verification is skipped.
    pub insecure_skip_verify: bool,
    config: Arc<ClientConfig>,
}

impl PeerTls {
    /// Verify against the bundled webpki roots.
    pub fn webpki(server_name: Option<String>) -> Result<Self, rustls::Error> {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        Self::with_roots(server_name, roots)
    }

    /// Verify against an explicit root store.
    pub fn with_roots(
        server_name: Option<String>,
        roots: RootCertStore,
    ) -> Result<Self, rustls::Error> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(Self {
            server_name,
            insecure_skip_verify: false,
            config: Arc::new(config),
        })
    }

    /// Accept any server certificate.
    pub fn insecure(server_name: Option<String>) -> Result<Self, rustls::Error> {
        let provider = provider();
        let config = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier(provider)))
            .with_no_client_auth();

        Ok(Self {
            server_name,
            insecure_skip_verify: true,
            config: Arc::new(config),
        })
    }

    /// The rustls client configuration used for the handshake.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate verifier for `insecure_skip_verify` hops.
#[derive(Debug)]
struct NoVerifier(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// One hop of a chain.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// TLS parameters. `None` means the hop is plaintext.
    pub tls: Option<PeerTls>,
    /// Extra headers sent on the CONNECT issued through this peer to reach the next one.
    pub connect_extra: BTreeMap<String, Vec<String>>,
}

impl Peer {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: None,
            connect_extra: BTreeMap::new(),
        }
    }

    pub fn with_tls(mut self, tls: PeerTls) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Append a value for a CONNECT header sent through this peer.
    pub fn with_connect_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_extra
            .entry(name.into())
            .or_default()
            .push(value.into());
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        format_authority(&self.host, self.port)
    }

    /// Server name presented in the TLS handshake with this peer.
    pub fn tls_server_name(&self) -> Option<&str> {
        self.tls
            .as_ref()
            .map(|tls| tls.server_name.as_deref().unwrap_or(&self.host))
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Format `host:port` for a CONNECT request line.
pub fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// A chain was built without any peers.
#[derive(Debug, Error)]
#[error("peer chain must contain at least one peer")]
pub struct EmptyChain;

/// Non-empty ordered sequence of peers.
#[derive(Debug, Clone)]
pub struct PeerChain {
    peers: Vec<Peer>,
}

impl PeerChain {
    pub fn new(peers: Vec<Peer>) -> Result<Self, EmptyChain> {
        if peers.is_empty() {
            return Err(EmptyChain);
        }
        Ok(Self { peers })
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn first(&self) -> &Peer {
        &self.peers[0]
    }

    pub fn last(&self) -> &Peer {
        &self.peers[self.peers.len() - 1]
    }

    /// Pool key: every peer's `host:port` in order, each followed by `/`.
    pub fn fingerprint(&self) -> String {
        let mut fingerprint = String::new();
        for peer in &self.peers {
            fingerprint.push_str(&peer.authority());
            fingerprint.push('/');
        }
        fingerprint
    }
}

impl fmt::Display for PeerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, peer) in self.peers.iter().enumerate() {
            if i > 0 {
                f.write_str(" → ")?;
            }
            write!(f, "{}", peer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_chain_rejected() {
        assert!(PeerChain::new(Vec::new()).is_err());
    }

    #[test]
    fn test_fingerprint_is_ordered() {
        let ab = PeerChain::new(vec![Peer::new("a", 1), Peer::new("b", 2)]).unwrap();
        let ba = PeerChain::new(vec![Peer::new("b", 2), Peer::new("a", 1)]).unwrap();
        let ab_again = PeerChain::new(vec![Peer::new("a", 1), Peer::new("b", 2)]).unwrap();

        assert_eq!(ab.fingerprint(), "a:1/b:2/");
        assert_eq!(ab.fingerprint(), ab_again.fingerprint());
        assert_ne!(ab.fingerprint(), ba.fingerprint());
    }

    #[test]
    fn test_fingerprint_separates_hops() {
        // "a:11" + "1:2" must not collide with "a:1" + "11:2"
        let one = PeerChain::new(vec![Peer::new("a", 11), Peer::new("1", 2)]).unwrap();
        let two = PeerChain::new(vec![Peer::new("a", 1), Peer::new("11", 2)]).unwrap();
        assert_ne!(one.fingerprint(), two.fingerprint());
    }

    #[test]
    fn test_authority_brackets_ipv6() {
        assert_eq!(Peer::new("::1", 3128).authority(), "[::1]:3128");
        assert_eq!(Peer::new("[::1]", 3128).authority(), "[::1]:3128");
        assert_eq!(Peer::new("proxy", 3128).authority(), "proxy:3128");
    }

    #[test]
    fn test_connect_headers_accumulate() {
        let peer = Peer::new("proxy", 3128)
            .with_connect_header("X-Token", "a")
            .with_connect_header("X-Token", "b");
        assert_eq!(peer.connect_extra["X-Token"], vec!["a", "b"]);
    }

    #[test]
    fn test_tls_server_name_defaults_to_host() {
        let plain = Peer::new("proxy", 3128);
        assert!(plain.tls_server_name().is_none());

        let tls = Peer::new("secure", 443).with_tls(PeerTls::insecure(None).unwrap());
        assert_eq!(tls.tls_server_name(), Some("secure"));

        let named = Peer::new("10.0.0.1", 443)
            .with_tls(PeerTls::insecure(Some("secure.example".to_string())).unwrap());
        assert_eq!(named.tls_server_name(), Some("secure.example"));
    }

    #[test]
    fn test_chain_display() {
        let chain = PeerChain::new(vec![Peer::new("a", 1), Peer::new("b", 2)]).unwrap();
        assert_eq!(chain.to_string(), "a:1 → b:2");
    }
}
