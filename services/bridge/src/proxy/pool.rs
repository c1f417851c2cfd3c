//! Pre-warmed tunnel pool.
//!
//! One background dialer per distinct chain fingerprint. Each dialer
//! reserves a slot in a single-capacity channel before dialing, so it runs
//! exactly one connection ahead of demand and blocks until that connection
//! is claimed. Consumers take results in arrival order; each result is
//! delivered to exactly one consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::dialer::ChainDialer;
use super::peer::PeerChain;
use super::tunnel::Tunnel;
use crate::error::{ChainError, DialFailure};

type DialResult = Result<Tunnel, DialFailure>;

/// Counters shared between the pool and its background dialers.
#[derive(Debug, Default)]
struct PoolCounters {
    dials_succeeded: AtomicU64,
    dials_failed: AtomicU64,
    stale_discarded: AtomicU64,
    acquired: AtomicU64,
}

/// Statistics for a connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub dials_succeeded: u64,
    pub dials_failed: u64,
    pub stale_discarded: u64,
    pub acquired: u64,
}

/// Per-fingerprint state: the receiving end of the dialer's channel.
struct PoolEntry {
    fingerprint: String,
    results: Mutex<mpsc::Receiver<DialResult>>,
    task: JoinHandle<()>,
}

impl Drop for PoolEntry {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Keyed cache of pre-dialed tunnels.
pub struct ConnectionPool {
    dialer: Arc<ChainDialer>,
    entries: RwLock<HashMap<String, Arc<PoolEntry>>>,
    counters: Arc<PoolCounters>,
}

impl ConnectionPool {
    /// Create a pool dialing with the given dialer.
    pub fn new(dialer: ChainDialer) -> Self {
        Self {
            dialer: Arc::new(dialer),
            entries: RwLock::new(HashMap::new()),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// The dialer used by the background tasks.
    pub fn dialer(&self) -> &ChainDialer {
        &self.dialer
    }

    /// Take the next pre-dialed tunnel for `chain`.
    ///
    /// Dial errors are returned as-is; the background dialer has already
    /// moved on to the next attempt. Tunnels whose remote end closed while
    /// queued are discarded and the next result is taken instead.
    pub async fn acquire(&self, chain: &PeerChain) -> Result<Tunnel, DialFailure> {
        let started = Instant::now();
        let entry = self.entry(chain).await;
        let mut results = entry.results.lock().await;

        loop {
            match results.recv().await {
                None => {
                    return Err(DialFailure::new(ChainError::PoolClosed {
                        fingerprint: entry.fingerprint.clone(),
                    }))
                }
                Some(Err(failure)) => return Err(failure),
                Some(Ok(conn)) => {
                    let Some(conn) = conn.into_live() else {
                        self.counters.stale_discarded.fetch_add(1, Ordering::Relaxed);
                        debug!(fingerprint = %entry.fingerprint, "Discarding closed pooled connection");
                        continue;
                    };

                    self.counters.acquired.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        fingerprint = %entry.fingerprint,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Acquired pooled connection"
                    );
                    return Ok(conn);
                }
            }
        }
    }

    /// Start the background dialer for `chain` without claiming a connection.
    pub async fn warm(&self, chain: &PeerChain) {
        self.entry(chain).await;
    }

    /// Fingerprints with a running background dialer.
    pub async fn fingerprints(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            dials_succeeded: self.counters.dials_succeeded.load(Ordering::Relaxed),
            dials_failed: self.counters.dials_failed.load(Ordering::Relaxed),
            stale_discarded: self.counters.stale_discarded.load(Ordering::Relaxed),
            acquired: self.counters.acquired.load(Ordering::Relaxed),
        }
    }

    /// Get or register the entry for a chain. Registration happens under the
    /// write lock so only one dialer is ever started per fingerprint.
    async fn entry(&self, chain: &PeerChain) -> Arc<PoolEntry> {
        let fingerprint = chain.fingerprint();

        // Fast path: read lock
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(&fingerprint) {
                return Arc::clone(entry);
            }
        }

        // Slow path: write lock
        let mut entries = self.entries.write().await;
        entries
            .entry(fingerprint.clone())
            .or_insert_with(|| {
                info!(fingerprint = %fingerprint, "Starting background dialer");
                let (tx, rx) = mpsc::channel(1);
                let task = tokio::spawn(
                    run_dialer(
                        chain.clone(),
                        Arc::clone(&self.dialer),
                        tx,
                        Arc::clone(&self.counters),
                    )
                    .instrument(tracing::info_span!("dialer", fingerprint = %fingerprint)),
                );
                Arc::new(PoolEntry {
                    fingerprint: fingerprint.clone(),
                    results: Mutex::new(rx),
                    task,
                })
            })
            .clone()
    }
}

/// Dial forever, one result ahead of demand.
async fn run_dialer(
    chain: PeerChain,
    dialer: Arc<ChainDialer>,
    tx: mpsc::Sender<DialResult>,
    counters: Arc<PoolCounters>,
) {
    loop {
        // Wait until the previous result has been claimed
        let permit = match tx.reserve().await {
            Ok(permit) => permit,
            Err(_) => {
                debug!("Pool entry dropped, stopping dialer");
                return;
            }
        };

        let started = Instant::now();
        let result = dialer.dial(&chain).await;
        match &result {
            Ok(_) => {
                counters.dials_succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Established in the background"
                );
            }
            Err(failure) => {
                counters.dials_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %failure.error,
                    reason = failure.error.reason_code(),
                    "Background dial failed"
                );
            }
        }
        permit.send(result);
    }
}
