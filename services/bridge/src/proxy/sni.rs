//! Server Name Indication sniffing.
//!
//! Reads the first TLS record of a client connection, extracts the
//! `server_name` extension from the ClientHello and hands back a
//! [`Sniffed`] stream that replays every byte read so far. The handshake
//! itself is never completed or terminated here.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Default maximum bytes to read when sniffing for SNI.
pub const DEFAULT_MAX_SNIFF_BYTES: usize = 8192;

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Result of SNI inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SniResult {
    /// Host name from the ClientHello, lowercased without a trailing dot.
    Found(String),
    /// ClientHello without a server_name extension.
    NoSni,
    /// First bytes are not a TLS handshake record.
    NotTls,
    /// Client did not send enough data in time.
    Timeout,
    /// Read failed.
    IoError(String),
    /// ClientHello truncated or inconsistent.
    Malformed,
}

impl SniResult {
    pub fn host(&self) -> Option<&str> {
        match self {
            SniResult::Found(host) => Some(host),
            _ => None,
        }
    }
}

/// Configuration for SNI inspection.
#[derive(Debug, Clone)]
pub struct SniConfig {
    /// Maximum time to wait for the ClientHello. `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Maximum bytes to read.
    pub max_bytes: usize,
}

impl Default for SniConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            max_bytes: DEFAULT_MAX_SNIFF_BYTES,
        }
    }
}

/// Reads a ClientHello and extracts its server name.
#[derive(Debug, Clone, Default)]
pub struct SniInspector {
    config: SniConfig,
}

impl SniInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SniConfig) -> Self {
        Self { config }
    }

    /// Sniff `stream` for SNI.
    ///
    /// Whatever the outcome, the returned stream yields the sniffed bytes
    /// before anything else.
    pub async fn inspect<S>(&self, mut stream: S) -> (SniResult, Sniffed<S>)
    where
        S: AsyncRead + Unpin,
    {
        let mut buffer =
            BytesMut::with_capacity(self.config.max_bytes.min(DEFAULT_MAX_SNIFF_BYTES));
        let sniff = read_client_hello(&mut stream, &mut buffer, self.config.max_bytes);
        let read_result = match self.config.timeout {
            Some(limit) => timeout(limit, sniff).await,
            None => Ok(sniff.await),
        };

        let result = match read_result {
            Ok(Ok(())) => parse_client_hello(&buffer),
            Ok(Err(e)) => SniResult::IoError(e.to_string()),
            Err(_) => {
                warn!(bytes_read = buffer.len(), "SNI sniff timeout");
                SniResult::Timeout
            }
        };

        debug!(bytes_read = buffer.len(), result = ?result, "SNI inspected");
        (result, Sniffed::new(buffer.freeze(), stream))
    }
}

/// Read the record header, then the rest of the first record (bounded by `max`).
async fn read_client_hello<R>(stream: &mut R, buffer: &mut BytesMut, max: usize) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    while buffer.len() < RECORD_HEADER_LEN {
        if fill(stream, buffer, RECORD_HEADER_LEN.min(max)).await? == 0 {
            return Ok(());
        }
    }

    if buffer[0] != CONTENT_TYPE_HANDSHAKE {
        return Ok(());
    }

    let record_len = u16::from_be_bytes([buffer[3], buffer[4]]) as usize;
    let target = (RECORD_HEADER_LEN + record_len).min(max);
    while buffer.len() < target {
        if fill(stream, buffer, target).await? == 0 {
            break;
        }
    }
    Ok(())
}

async fn fill<R>(stream: &mut R, buffer: &mut BytesMut, limit: usize) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let room = limit.saturating_sub(buffer.len());
    if room == 0 {
        return Ok(0);
    }
    (&mut *stream).take(room as u64).read_buf(buffer).await
}

/// Bounds-checked big-endian reader over a byte slice.
struct Cursor<'a> {
    data: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.data.len() {
            return None;
        }
        let (head, tail) = self.data.split_at(n);
        self.data = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.bytes(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.bytes(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    /// Length-prefixed vector with a one-byte length.
    fn vec8(&mut self) -> Option<&'a [u8]> {
        let len = self.u8()? as usize;
        self.bytes(len)
    }

    /// Length-prefixed vector with a two-byte length.
    fn vec16(&mut self) -> Option<&'a [u8]> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }
}

/// Parse SNI from the first TLS record of a connection.
pub fn parse_client_hello(data: &[u8]) -> SniResult {
    if data.len() < RECORD_HEADER_LEN + 4 {
        if data.first().is_some_and(|&b| b != CONTENT_TYPE_HANDSHAKE) {
            return SniResult::NotTls;
        }
        return SniResult::Malformed;
    }
    if data[0] != CONTENT_TYPE_HANDSHAKE {
        return SniResult::NotTls;
    }

    // Tolerate a record shorter than declared; parse what was read
    let record_len = u16::from_be_bytes([data[3], data[4]]) as usize;
    let record = &data[RECORD_HEADER_LEN..data.len().min(RECORD_HEADER_LEN + record_len)];
    if record.first() != Some(&HANDSHAKE_CLIENT_HELLO) {
        return SniResult::NotTls;
    }
    if record.len() < 4 {
        return SniResult::Malformed;
    }

    client_hello_server_name(&record[4..]).unwrap_or(SniResult::Malformed)
}

/// Walk a ClientHello body: version, random, session id, cipher suites,
/// compression methods, extensions.
fn client_hello_server_name(body: &[u8]) -> Option<SniResult> {
    let mut hello = Cursor::new(body);
    hello.bytes(2 + 32)?;
    hello.vec8()?;
    hello.vec16()?;
    hello.vec8()?;

    if hello.is_empty() {
        return Some(SniResult::NoSni);
    }

    let mut extensions = Cursor::new(hello.vec16()?);
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let ext_data = extensions.vec16()?;
        if ext_type == EXTENSION_SERVER_NAME {
            return server_name_extension(ext_data);
        }
    }

    Some(SniResult::NoSni)
}

fn server_name_extension(data: &[u8]) -> Option<SniResult> {
    let mut list = Cursor::new(Cursor::new(data).vec16()?);
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.vec16()?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let host = std::str::from_utf8(name).ok()?;
        let host = host.trim_end_matches('.').to_lowercase();
        if host.is_empty() {
            return Some(SniResult::NoSni);
        }
        return Some(SniResult::Found(host));
    }
    Some(SniResult::NoSni)
}

/// A stream that replays sniffed bytes before reading from the inner stream.
/// Writes go straight to the inner stream.
#[derive(Debug)]
pub struct Sniffed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Sniffed<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }

    /// Bytes not yet replayed.
    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_parts(self) -> (Bytes, S) {
        (self.prefix, self.inner)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Sniffed<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix.is_empty() {
            return Pin::new(&mut this.inner).poll_read(cx, out);
        }
        let n = this.prefix.len().min(out.remaining());
        let chunk = this.prefix.split_to(n);
        out.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Sniffed<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Build a minimal TLS 1.2 ClientHello record, optionally with SNI.
#[cfg(test)]
pub(crate) fn client_hello(server_name: Option<&str>) -> Vec<u8> {
    let mut extensions = Vec::new();
    if let Some(name) = server_name {
        let name = name.as_bytes();
        let mut entry = vec![NAME_TYPE_HOST_NAME];
        entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
        entry.extend_from_slice(name);

        let mut ext = (entry.len() as u16).to_be_bytes().to_vec();
        ext.extend_from_slice(&entry);

        extensions.extend_from_slice(&EXTENSION_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&ext);
    }
    // supported_groups: x25519
    extensions.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x1d]);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x42; 32]);
    body.push(0x00); // session id
    body.extend_from_slice(&[0x00, 0x02, 0x00, 0x2f]); // one cipher suite
    body.extend_from_slice(&[0x01, 0x00]); // null compression
    body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    body.extend_from_slice(&extensions);

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&body);

    let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}
