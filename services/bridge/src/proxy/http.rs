//! HTTP proxy adapter.
//!
//! Exposes the chain as a plain HTTP proxy served by hyper. Client
//! connections are kept alive across requests. Every request gets the last
//! peer's `connect_extra` headers (they authenticate against the last
//! proxy). Ordinary requests are sent in absolute form through a keep-alive
//! client whose connector takes tunnels from the pool, so idle tunnels to
//! the last proxy are reused. CONNECT requests are forwarded over their own
//! pooled tunnel and the upgraded client connection is relayed to it.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::hijack::HTTPS_PORT;
use super::peer::{format_authority, PeerChain};
use super::pool::ConnectionPool;
use super::relay::{relay, RelayStats};
use super::tunnel::Tunnel;
use crate::error::ChainError;

/// Read buffer limit for client request heads.
pub const MAX_REQUEST_HEAD: usize = 8192;

/// Idle upstream tunnels kept per last proxy.
pub const MAX_IDLE_PER_HOST: usize = 64;

/// How long an idle upstream tunnel is kept.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;
type TunnelTasks = Mutex<Vec<JoinHandle<RelayStats>>>;

/// HTTP adapter errors.
#[derive(Debug, Error)]
pub enum HttpError {
    /// Origin-form request without a Host header.
    #[error("request has no Host header")]
    MissingHost,

    /// Request target could not be turned into an upstream URI.
    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    /// A configured header name or value is not valid HTTP.
    #[error("invalid header: {0}")]
    InvalidHeader(String),

    /// Tunnel through the chain could not be established.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// Forwarded request failed.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    /// Client connection failed.
    #[error("client connection error: {0}")]
    Http(#[from] hyper::Error),
}

/// Connector handing pooled tunnels to the hyper client.
#[derive(Clone)]
pub struct ChainConnector {
    chain: PeerChain,
    pool: Arc<ConnectionPool>,
}

impl ChainConnector {
    pub fn new(chain: PeerChain, pool: Arc<ConnectionPool>) -> Self {
        Self { chain, pool }
    }
}

impl tower_service::Service<Uri> for ChainConnector {
    type Response = UpstreamConn;
    type Error = ChainError;
    type Future = Pin<Box<dyn Future<Output = Result<UpstreamConn, ChainError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, destination: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move {
            debug!(destination = %destination, chain = %connector.chain, "Opening upstream tunnel");
            match connector.pool.acquire(&connector.chain).await {
                Ok(tunnel) => Ok(UpstreamConn(TokioIo::new(tunnel))),
                Err(failure) => Err(failure.close().await),
            }
        })
    }
}

/// A tunnel to the last peer, as used by the hyper client.
pub struct UpstreamConn(TokioIo<Tunnel>);

impl Connection for UpstreamConn {
    fn connected(&self) -> Connected {
        // Requests keep their absolute-form target
        Connected::new().proxy(true)
    }
}

impl hyper::rt::Read for UpstreamConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        hyper::rt::Read::poll_read(Pin::new(&mut self.get_mut().0), cx, buf)
    }
}

impl hyper::rt::Write for UpstreamConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        hyper::rt::Write::poll_write(Pin::new(&mut self.get_mut().0), cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_flush(Pin::new(&mut self.get_mut().0), cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        hyper::rt::Write::poll_shutdown(Pin::new(&mut self.get_mut().0), cx)
    }
}

/// Serves client connections as an HTTP proxy in front of the chain.
pub struct HttpProxy {
    chain: PeerChain,
    pool: Arc<ConnectionPool>,
    client: Client<ChainConnector, Incoming>,
}

impl HttpProxy {
    pub fn new(chain: PeerChain, pool: Arc<ConnectionPool>) -> Self {
        let connector = ChainConnector::new(chain.clone(), Arc::clone(&pool));
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Self {
            chain,
            pool,
            client,
        }
    }

    /// Serve one client connection until it closes.
    ///
    /// A request that cannot be forwarded closes the connection without a
    /// response. Returns the bytes relayed by CONNECT tunnels opened on the
    /// connection.
    pub async fn handle<S>(&self, client: S) -> Result<RelayStats, HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tunnels: TunnelTasks = Mutex::new(Vec::new());
        let tasks = &tunnels;
        let served = http1::Builder::new()
            .max_buf_size(MAX_REQUEST_HEAD)
            .serve_connection(
                TokioIo::new(client),
                service_fn(move |request| self.serve(request, tasks)),
            )
            .with_upgrades()
            .await;

        let mut stats = RelayStats::default();
        let tasks = tunnels.into_inner().unwrap_or_else(PoisonError::into_inner);
        for task in tasks {
            if let Ok(relayed) = task.await {
                stats.a_to_b += relayed.a_to_b;
                stats.b_to_a += relayed.b_to_a;
            }
        }

        served?;
        Ok(stats)
    }

    async fn serve(
        &self,
        mut request: Request<Incoming>,
        tunnels: &TunnelTasks,
    ) -> Result<Response<ProxyBody>, HttpError> {
        add_extra_headers(request.headers_mut(), &self.chain.last().connect_extra)?;
        request.headers_mut().remove("proxy-connection");

        if request.method() == Method::CONNECT {
            let (response, task) = self.open_tunnel(request).await?;
            tunnels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(task);
            return Ok(response);
        }

        *request.uri_mut() = absolute_uri(&request)?;
        debug!(method = %request.method(), uri = %request.uri(), "Forwarding request");
        let response = self.client.request(request).await?;
        Ok(response.map(BodyExt::boxed_unsync))
    }

    /// Forward a CONNECT over a fresh tunnel, then relay the upgraded client.
    async fn open_tunnel(
        &self,
        request: Request<Incoming>,
    ) -> Result<(Response<ProxyBody>, JoinHandle<RelayStats>), HttpError> {
        let target = connect_target(request.uri())?;
        debug!(target = %target, "Forwarding CONNECT");

        let mut tunnel = match self.pool.acquire(&self.chain).await {
            Ok(tunnel) => tunnel,
            Err(failure) => return Err(failure.close().await.into()),
        };

        let headers = header_lists(request.headers());
        if let Err(e) = self
            .pool
            .dialer()
            .connect_with_headers(&mut tunnel, &target, &headers)
            .await
        {
            let _ = tunnel.shutdown().await;
            return Err(e.into());
        }

        let task = tokio::spawn(async move {
            match hyper::upgrade::on(request).await {
                Ok(upgraded) => relay(TokioIo::new(upgraded), tunnel).await,
                Err(e) => {
                    warn!(error = %e, "Client connection was not upgraded");
                    let _ = tunnel.shutdown().await;
                    RelayStats::default()
                }
            }
        });

        Ok((Response::new(empty()), task))
    }
}

/// Add each configured header the request does not already carry.
pub fn add_extra_headers(
    headers: &mut HeaderMap,
    extra: &BTreeMap<String, Vec<String>>,
) -> Result<(), HttpError> {
    for (name, values) in extra {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| HttpError::InvalidHeader(name.clone()))?;
        if headers.contains_key(&header) {
            continue;
        }
        for value in values {
            let value = HeaderValue::from_str(value)
                .map_err(|_| HttpError::InvalidHeader(name.clone()))?;
            headers.append(header.clone(), value);
        }
    }
    Ok(())
}

/// Absolute-form URI for a request, taking the authority from `Host` when
/// the target is in origin form.
pub fn absolute_uri<B>(request: &Request<B>) -> Result<Uri, HttpError> {
    let uri = request.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.clone());
    }

    let host = request
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .ok_or(HttpError::MissingHost)?;
    let path = uri.path_and_query().map_or("/", |p| p.as_str());

    Uri::builder()
        .scheme("http")
        .authority(host)
        .path_and_query(path)
        .build()
        .map_err(|e| HttpError::InvalidTarget(e.to_string()))
}

/// `host:port` of a CONNECT target; the port defaults to 443.
pub fn connect_target(uri: &Uri) -> Result<String, HttpError> {
    let authority = uri
        .authority()
        .ok_or_else(|| HttpError::InvalidTarget(uri.to_string()))?;
    let host = authority.host();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok(format_authority(
        host,
        authority.port_u16().unwrap_or(HTTPS_PORT),
    ))
}

fn header_lists(headers: &HeaderMap) -> BTreeMap<String, Vec<String>> {
    let mut lists: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            lists
                .entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    lists
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ChainDialer, Peer};
    use tokio::io::AsyncReadExt;

    fn extra(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in pairs {
            map.entry(name.to_string()).or_default().push(value.to_string());
        }
        map
    }

    #[test]
    fn test_extra_headers_added() {
        let mut headers = HeaderMap::new();
        let extra = extra(&[
            ("Proxy-Authorization", "Basic YWJj"),
            ("X-Trace", "a"),
            ("X-Trace", "b"),
        ]);

        add_extra_headers(&mut headers, &extra).unwrap();
        assert_eq!(headers.get("proxy-authorization").unwrap(), "Basic YWJj");
        assert_eq!(headers.get_all("x-trace").iter().count(), 2);
    }

    #[test]
    fn test_client_header_not_overridden() {
        let mut headers = HeaderMap::new();
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic Y2xpZW50"));

        add_extra_headers(&mut headers, &extra(&[("Proxy-Authorization", "Basic YWJj")])).unwrap();
        assert_eq!(headers.get_all("proxy-authorization").iter().count(), 1);
        assert_eq!(headers.get("proxy-authorization").unwrap(), "Basic Y2xpZW50");
    }

    #[test]
    fn test_invalid_extra_header() {
        let mut headers = HeaderMap::new();
        let err = add_extra_headers(&mut headers, &extra(&[("Bad Name", "x")])).unwrap_err();
        assert!(matches!(err, HttpError::InvalidHeader(name) if name == "Bad Name"));
    }

    #[test]
    fn test_origin_form_made_absolute() {
        let request = Request::builder()
            .uri("/index.html?q=1")
            .header(HOST, "example.com:8080")
            .body(())
            .unwrap();
        assert_eq!(
            absolute_uri(&request).unwrap().to_string(),
            "http://example.com:8080/index.html?q=1"
        );
    }

    #[test]
    fn test_absolute_form_kept() {
        let request = Request::builder()
            .uri("http://other.example/path")
            .header(HOST, "example.com")
            .body(())
            .unwrap();
        assert_eq!(
            absolute_uri(&request).unwrap().to_string(),
            "http://other.example/path"
        );
    }

    #[test]
    fn test_origin_form_without_host() {
        let request = Request::builder().uri("/").body(()).unwrap();
        assert!(matches!(absolute_uri(&request), Err(HttpError::MissingHost)));
    }

    #[test]
    fn test_connect_target() {
        let uri: Uri = "example.com:8443".parse().unwrap();
        assert_eq!(connect_target(&uri).unwrap(), "example.com:8443");

        let uri: Uri = "[::1]:9000".parse().unwrap();
        assert_eq!(connect_target(&uri).unwrap(), "[::1]:9000");

        let uri = Uri::builder()
            .authority("example.com")
            .build()
            .unwrap();
        assert_eq!(connect_target(&uri).unwrap(), "example.com:443");
    }

    #[tokio::test]
    async fn test_dial_failure_closes_client() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let chain = PeerChain::new(vec![Peer::new("127.0.0.1", port)]).unwrap();
        let pool = Arc::new(ConnectionPool::new(ChainDialer::new()));
        let proxy = HttpProxy::new(chain, pool);

        let (mut client, server) = tokio::io::duplex(4096);
        client
            .write_all(b"GET http://example.com/ HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();

        let result = proxy.handle(server).await;
        assert!(result.is_err());

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert!(out.is_empty());
    }
}
