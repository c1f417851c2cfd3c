//! Bidirectional byte relay with paired close.
//!
//! Both directions are copied concurrently. As soon as either direction
//! sees EOF or an error, the other is cancelled and both streams are shut
//! down and dropped, which unblocks any pending read on the far side.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// Upper bound on each write-half shutdown once a direction ends.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes forwarded in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Relay bytes between `a` and `b` until either side ends, then close both.
pub async fn relay<A, B>(a: A, b: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut stats = RelayStats::default();

    {
        let a_to_b = copy_half(&mut a_read, &mut b_write, &mut stats.a_to_b);
        let b_to_a = copy_half(&mut b_read, &mut a_write, &mut stats.b_to_a);
        tokio::pin!(a_to_b, b_to_a);

        let (direction, result) = tokio::select! {
            result = &mut a_to_b => ("a_to_b", result),
            result = &mut b_to_a => ("b_to_a", result),
        };
        match result {
            Ok(()) => debug!(direction, "Relay reached EOF"),
            Err(e) => debug!(direction, error = %e, "Could not forward"),
        }
    }

    let _ = timeout(SHUTDOWN_GRACE, b_write.shutdown()).await;
    let _ = timeout(SHUTDOWN_GRACE, a_write.shutdown()).await;

    debug!(
        a_to_b = stats.a_to_b,
        b_to_a = stats.b_to_a,
        "Relay closed"
    );
    stats
}

async fn copy_half<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}
