//! Bridge configuration.
//!
//! Loaded from a TOML file; `listen`, `mode` and `log_level` can be
//! overridden from the command line.

use std::collections::BTreeMap;
use std::fs;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rustls::RootCertStore;
use serde::Deserialize;

use crate::proxy::{
    DialTimeouts, ListenerMode, Peer, PeerChain, PeerTls, SniConfig, DEFAULT_MAX_CONNECTIONS,
};

const DEFAULT_LISTEN: &str = "127.0.0.1:8080";

/// Raw file contents.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub listen: Option<SocketAddr>,
    pub mode: Option<ListenerMode>,
    pub log_level: Option<String>,
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
}

/// Deadlines in milliseconds. Absent means no deadline.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub connect_ms: Option<u64>,
    pub handshake_ms: Option<u64>,
    pub response_ms: Option<u64>,
    pub sniff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub connect_extra: BTreeMap<String, HeaderValues>,
    pub tls: Option<PeerTlsConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerTlsConfig {
    pub server_name: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    pub ca_file: Option<PathBuf>,
}

/// A header given as a single value or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

impl HeaderValues {
    fn into_vec(self) -> Vec<String> {
        match self {
            HeaderValues::One(value) => vec![value],
            HeaderValues::Many(values) => values,
        }
    }
}

/// Values taken from the command line or environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen: Option<SocketAddr>,
    pub mode: Option<ListenerMode>,
    pub log_level: Option<String>,
}

/// Validated bridge configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    pub mode: ListenerMode,
    pub log_level: String,
    pub max_connections: usize,
    pub timeouts: DialTimeouts,
    pub sni: SniConfig,
    pub chain: PeerChain,
}

impl Config {
    /// Read and validate a configuration file.
    pub fn load(path: &Path, overrides: Overrides) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text, overrides)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse and validate configuration text.
    pub fn from_toml(text: &str, overrides: Overrides) -> Result<Self> {
        let file: FileConfig = toml::from_str(text).context("Failed to parse TOML")?;
        Self::from_file_config(file, overrides)
    }

    pub fn from_file_config(file: FileConfig, overrides: Overrides) -> Result<Self> {
        let listen = match overrides.listen.or(file.listen) {
            Some(addr) => addr,
            None => DEFAULT_LISTEN
                .parse()
                .context("Invalid default listen address")?,
        };

        let max_connections = file.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max_connections == 0 {
            bail!("max_connections must be at least 1");
        }

        if file.peers.is_empty() {
            bail!("At least one [[peers]] entry is required");
        }
        let peers = file
            .peers
            .into_iter()
            .enumerate()
            .map(|(index, peer)| {
                build_peer(peer).with_context(|| format!("Invalid peer #{}", index + 1))
            })
            .collect::<Result<Vec<_>>>()?;
        let chain = PeerChain::new(peers)?;

        let millis = |ms: Option<u64>| ms.map(Duration::from_millis);
        let timeouts = DialTimeouts {
            connect: millis(file.timeouts.connect_ms),
            handshake: millis(file.timeouts.handshake_ms),
            response: millis(file.timeouts.response_ms),
        };

        let sni = SniConfig {
            timeout: millis(file.timeouts.sniff_ms),
            ..SniConfig::default()
        };

        Ok(Self {
            listen,
            mode: overrides.mode.or(file.mode).unwrap_or(ListenerMode::Direct),
            log_level: overrides
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| "info".to_string()),
            max_connections,
            timeouts,
            sni,
            chain,
        })
    }
}

fn build_peer(config: PeerConfig) -> Result<Peer> {
    if config.host.trim().is_empty() {
        bail!("host must not be empty");
    }
    if config.port == 0 {
        bail!("port must be between 1 and 65535");
    }

    let mut peer = Peer::new(config.host, config.port);
    for (name, values) in config.connect_extra {
        for value in values.into_vec() {
            peer = peer.with_connect_header(name.clone(), value);
        }
    }

    if let Some(tls) = config.tls {
        peer = peer.with_tls(build_tls(tls)?);
    }
    Ok(peer)
}

fn build_tls(config: PeerTlsConfig) -> Result<PeerTls> {
    if config.insecure_skip_verify {
        return PeerTls::insecure(config.server_name).context("Failed to build TLS config");
    }

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    if let Some(path) = &config.ca_file {
        let added = add_pem_roots(&mut roots, path)
            .with_context(|| format!("Failed to load ca_file {}", path.display()))?;
        if added == 0 {
            bail!("ca_file {} contains no certificates", path.display());
        }
    }

    PeerTls::with_roots(config.server_name, roots).context("Failed to build TLS config")
}

fn add_pem_roots(roots: &mut RootCertStore, path: &Path) -> Result<usize> {
    let file = fs::File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        roots.add(cert?)?;
        added += 1;
    }
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [[peers]]
        host = "127.0.0.1"
        port = 3128
    "#;

    #[test]
    fn test_defaults() {
        let config = Config::from_toml(MINIMAL, Overrides::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.mode, ListenerMode::Direct);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.timeouts, DialTimeouts::default());
        assert_eq!(config.sni.timeout, None);
        assert_eq!(config.chain.len(), 1);
    }

    #[test]
    fn test_full_file() {
        let text = r#"
            listen = "0.0.0.0:9000"
            mode = "tls"
            log_level = "debug"
            max_connections = 50

            [timeouts]
            connect_ms = 1500
            sniff_ms = 500

            [[peers]]
            host = "proxy.corp.example"
            port = 3128
            [peers.connect_extra]
            "Proxy-Authorization" = "Basic dXNlcjpwYXNz"
            "X-Trace" = ["a", "b"]

            [[peers]]
            host = "tls-proxy.example"
            port = 443
            [peers.tls]
            insecure_skip_verify = true
        "#;

        let config = Config::from_toml(text, Overrides::default()).unwrap();
        assert_eq!(config.mode, ListenerMode::Tls);
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.timeouts.connect, Some(Duration::from_millis(1500)));
        assert_eq!(config.timeouts.handshake, None);
        assert_eq!(config.sni.timeout, Some(Duration::from_millis(500)));

        let first = config.chain.first();
        assert_eq!(
            first.connect_extra.get("Proxy-Authorization"),
            Some(&vec!["Basic dXNlcjpwYXNz".to_string()])
        );
        assert_eq!(first.connect_extra.get("X-Trace").map(Vec::len), Some(2));

        let last = config.chain.last();
        assert!(last.tls.as_ref().unwrap().insecure_skip_verify);
        assert_eq!(last.tls_server_name(), Some("tls-proxy.example"));
    }

    #[test]
    fn test_overrides_win() {
        let overrides = Overrides {
            listen: Some("127.0.0.1:1".parse().unwrap()),
            mode: Some(ListenerMode::Http),
            log_level: Some("warn".to_string()),
        };
        let config = Config::from_toml(MINIMAL, overrides).unwrap();
        assert_eq!(config.listen.port(), 1);
        assert_eq!(config.mode, ListenerMode::Http);
        assert_eq!(config.log_level, "warn");
    }

    #[test]
    fn test_validation_errors() {
        assert!(Config::from_toml("listen = \"127.0.0.1:1\"", Overrides::default()).is_err());
        assert!(Config::from_toml(
            "[[peers]]\nhost = \"a\"\nport = 0\n",
            Overrides::default()
        )
        .is_err());
        assert!(Config::from_toml("mode = \"socks\"\n", Overrides::default()).is_err());
        assert!(Config::from_toml(
            "[[peers]]\nhost = \"a\"\nport = 1\nbogus = 1\n",
            Overrides::default()
        )
        .is_err());
    }

    #[test]
    fn test_ca_file_loaded() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let mut pem = tempfile::NamedTempFile::new().unwrap();
        pem.write_all(cert.cert.pem().as_bytes()).unwrap();

        let text = format!(
            "[[peers]]\nhost = \"localhost\"\nport = 443\n[peers.tls]\nca_file = \"{}\"\n",
            pem.path().display()
        );
        let config = Config::from_toml(&text, Overrides::default()).unwrap();
        let tls = config.chain.first().tls.as_ref().unwrap();
        assert!(!tls.insecure_skip_verify);
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let mut pem = tempfile::NamedTempFile::new().unwrap();
        pem.write_all(b"not a certificate\n").unwrap();

        let text = format!(
            "[[peers]]\nhost = \"localhost\"\nport = 443\n[peers.tls]\nca_file = \"{}\"\n",
            pem.path().display()
        );
        assert!(Config::from_toml(&text, Overrides::default()).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("missing.toml"), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
