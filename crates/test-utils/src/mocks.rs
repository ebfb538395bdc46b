//! In-memory connections and dialers for exercising caches and pools.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use dnsfleet_client::{Closer, Dialer};
use parking_lot::Mutex;

/// A fake connection that records whether it was closed.
#[derive(Clone)]
pub struct MockConn {
    id: usize,
    addr: String,
    closed: Arc<AtomicBool>,
}

impl MockConn {
    /// Creates an open connection.
    pub fn new(id: usize, addr: impl Into<String>) -> Self {
        Self { id, addr: addr.into(), closed: Arc::new(AtomicBool::new(false)) }
    }

    /// Dial sequence number, unique per dialer.
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Closer for MockConn {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for MockConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConn")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Error returned by [`CountingDialer`] for addresses marked as failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDialError {
    pub addr: String,
}

impl fmt::Display for MockDialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dial {}: connection refused", self.addr)
    }
}

impl std::error::Error for MockDialError {}

/// A [`Dialer`] that hands out [`MockConn`]s and counts every dial.
///
/// Clones share state, so a test can keep one handle while a cache owns another.
#[derive(Clone, Default)]
pub struct CountingDialer {
    inner: Arc<DialerState>,
}

#[derive(Default)]
struct DialerState {
    next_id: AtomicUsize,
    delay: Mutex<Option<Duration>>,
    failing: Mutex<HashSet<String>>,
    dials: Mutex<HashMap<String, usize>>,
    conns: Mutex<Vec<MockConn>>,
}

impl CountingDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every dial sleep for `delay` before completing.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.inner.delay.lock() = Some(delay);
        self
    }

    /// Makes dials to `addr` fail.
    pub fn fail(&self, addr: &str) {
        self.inner.failing.lock().insert(addr.to_string());
    }

    /// Makes dials to `addr` succeed again.
    pub fn heal(&self, addr: &str) {
        self.inner.failing.lock().remove(addr);
    }

    /// Number of dials started for `addr`, including failed ones.
    pub fn dials(&self, addr: &str) -> usize {
        self.inner.dials.lock().get(addr).copied().unwrap_or(0)
    }

    /// Number of dials started for any address.
    pub fn total_dials(&self) -> usize {
        self.inner.dials.lock().values().sum()
    }

    /// Every connection handed out so far, in dial order.
    pub fn conns(&self) -> Vec<MockConn> {
        self.inner.conns.lock().clone()
    }

    /// Number of handed-out connections that have been closed.
    pub fn closed_count(&self) -> usize {
        self.inner.conns.lock().iter().filter(|c| c.is_closed()).count()
    }
}

impl Dialer for CountingDialer {
    type Conn = MockConn;
    type Error = MockDialError;

    async fn dial(&self, addr: &str) -> Result<MockConn, MockDialError> {
        *self.inner.dials.lock().entry(addr.to_string()).or_default() += 1;

        let delay = *self.inner.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.inner.failing.lock().contains(addr) {
            return Err(MockDialError { addr: addr.to_string() });
        }

        let conn = MockConn::new(self.inner.next_id.fetch_add(1, Ordering::SeqCst), addr);
        self.inner.conns.lock().push(conn.clone());
        Ok(conn)
    }
}

impl fmt::Debug for CountingDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountingDialer").field("total_dials", &self.total_dials()).finish()
    }
}
