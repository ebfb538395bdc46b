//! Keyed connection cache with dial deduplication, leases, and idle eviction.
//!
//! [`ConnSet`] caches one connection per address. Concurrent [`ConnSet::get`] calls for an
//! address that is not cached may each dial; the first to finish wins the cache slot and every
//! other freshly dialed connection is closed in the background. Each successful `get` takes a
//! lease that [`ConnSet::release`] gives back. A background evictor removes connections that
//! hold no lease and have been idle longer than the TTL.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use dnsfleet_client::{Closer, ConnSet};
//!
//! #[derive(Clone)]
//! struct Socket;
//!
//! impl Closer for Socket {
//!     async fn close(&self) {}
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let set = ConnSet::new(
//!     |_addr: String| async move { Ok::<_, std::io::Error>(Socket) },
//!     Some(Duration::from_secs(60)),
//! );
//!
//! let conn = set.get("10.0.0.1:443").await?;
//! // ... use conn ...
//! set.release("10.0.0.1:443")?;
//! set.close().await;
//! # Ok(())
//! # }
//! ```

use std::{
    collections::{HashMap, HashSet, hash_map::Entry},
    fmt,
    future::Future,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ConnSetError;

/// Shortest interval between eviction scans.
const MIN_EVICTION_PERIOD: Duration = Duration::from_millis(1);

/// A resource with a single asynchronous close operation.
pub trait Closer: Send + Sync + 'static {
    /// Closes the resource. Errors are the implementation's to log.
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Opens connections to addresses for a [`ConnSet`].
///
/// Implemented for any `Fn(String) -> impl Future<Output = Result<Conn, Error>>`.
pub trait Dialer: Send + Sync + 'static {
    /// The connection handle. Clones must refer to the same underlying connection.
    type Conn: Closer + Clone;
    /// The dial failure type, returned verbatim by [`ConnSet::get`].
    type Error: std::error::Error + Send + Sync + 'static;

    /// Dials `addr`.
    fn dial(&self, addr: &str) -> impl Future<Output = Result<Self::Conn, Self::Error>> + Send;
}

impl<F, Fut, C, E> Dialer for F
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<C, E>> + Send,
    C: Closer + Clone,
    E: std::error::Error + Send + Sync + 'static,
{
    type Conn = C;
    type Error = E;

    fn dial(&self, addr: &str) -> impl Future<Output = Result<C, E>> + Send {
        self(addr.to_string())
    }
}

struct TrackedConn<C> {
    conn: C,
    leases: u32,
    last_used: Instant,
}

impl<C> TrackedConn<C> {
    fn new(conn: C) -> Self {
        Self { conn, leases: 0, last_used: Instant::now() }
    }

    fn acquire(&mut self) {
        self.leases = self.leases.saturating_add(1);
        self.last_used = Instant::now();
    }

    fn release(&mut self) {
        // Releases without a matching acquire (e.g. after a pre-warm) are tolerated.
        self.leases = self.leases.saturating_sub(1);
        self.last_used = Instant::now();
    }

    fn is_idle(&self, now: Instant, ttl: Duration) -> bool {
        self.leases == 0 && now.saturating_duration_since(self.last_used) > ttl
    }
}

/// Connection cache keyed by address.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct ConnSet<D: Dialer> {
    inner: Arc<Inner<D>>,
}

struct Inner<D: Dialer> {
    dialer: D,
    conns: Mutex<HashMap<String, TrackedConn<D::Conn>>>,
    warming: Mutex<HashSet<String>>,
    // Written only while `conns` is locked.
    closed: AtomicBool,
    shutdown: CancellationToken,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Dialer> ConnSet<D> {
    /// Creates a cache that dials through `dialer`.
    ///
    /// With `Some(ttl)`, connections holding no lease are closed once idle for longer than
    /// `ttl`; the cache is scanned every `ttl / 3`. `None` disables eviction. Must be called
    /// within a Tokio runtime when eviction is enabled.
    pub fn new(dialer: D, ttl: Option<Duration>) -> Self {
        let inner = Arc::new(Inner {
            dialer,
            conns: Mutex::new(HashMap::new()),
            warming: Mutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            evictor: Mutex::new(None),
        });
        if let Some(ttl) = ttl {
            let task = spawn_evictor(&inner, ttl);
            *inner.evictor.lock() = Some(task);
        }
        Self { inner }
    }

    /// Pre-warms a connection to `addr` without taking a lease.
    ///
    /// Returns immediately if `addr` is cached or another pre-warm for it is in flight.
    /// Concurrent [`get`](Self::get) calls are never blocked by a pre-warm. A pre-warmed
    /// connection holds no lease, so it may be evicted before anyone claims it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnSetError::Closed`] after [`close`](Self::close), or the dialer's error.
    pub async fn dial(&self, addr: &str) -> Result<(), ConnSetError<D::Error>> {
        if self.is_closed() {
            return Err(ConnSetError::Closed);
        }
        if self.inner.conns.lock().contains_key(addr) {
            return Ok(());
        }
        let Some(_warming) = WarmingGuard::claim(&self.inner.warming, addr) else {
            return Ok(());
        };
        self.inner.get(addr, false).await.map(drop)
    }

    /// Returns the cached connection for `addr`, dialing if absent, and takes a lease on it.
    ///
    /// The dial runs without holding the cache lock. If another caller cached a connection for
    /// `addr` while this dial was in flight, the fresh connection is closed in the background
    /// and the cached one is returned. Dropping the returned future cancels only this caller's
    /// dial.
    ///
    /// # Errors
    ///
    /// Returns [`ConnSetError::Closed`] after [`close`](Self::close), or
    /// [`ConnSetError::Dial`] with the dialer's error. Nothing is cached on failure.
    pub async fn get(&self, addr: &str) -> Result<D::Conn, ConnSetError<D::Error>> {
        self.inner.get(addr, true).await
    }

    /// Gives back one lease on `addr`.
    ///
    /// Unknown addresses and leases already at zero are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`ConnSetError::Closed`] after [`close`](Self::close).
    pub fn release(&self, addr: &str) -> Result<(), ConnSetError<D::Error>> {
        if self.is_closed() {
            return Err(ConnSetError::Closed);
        }
        if let Some(tracked) = self.inner.conns.lock().get_mut(addr) {
            tracked.release();
        }
        Ok(())
    }

    /// Closes every cached connection and stops the evictor.
    ///
    /// Later calls to [`get`](Self::get), [`dial`](Self::dial), and
    /// [`release`](Self::release) fail with [`ConnSetError::Closed`]. Calling `close` again is
    /// a no-op.
    pub async fn close(&self) {
        let drained: Vec<D::Conn> = {
            let mut conns = self.inner.conns.lock();
            self.inner.closed.store(true, Ordering::Release);
            conns.drain().map(|(_, tracked)| tracked.conn).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "Closing cached connections");
        }
        for conn in drained {
            spawn_close(conn);
        }

        self.inner.shutdown.cancel();
        let evictor = self.inner.evictor.lock().take();
        if let Some(task) = evictor
            && let Err(e) = task.await
        {
            warn!(error = %e, "Connection evictor ended abnormally");
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of cached connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.conns.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding leases on `addr`, or `None` if it is not cached.
    #[must_use]
    pub fn leases(&self, addr: &str) -> Option<u32> {
        self.inner.conns.lock().get(addr).map(|tracked| tracked.leases)
    }
}

impl<D: Dialer> Clone for ConnSet<D> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<D: Dialer> fmt::Debug for ConnSet<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnSet")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<D: Dialer> Inner<D> {
    async fn get(&self, addr: &str, track: bool) -> Result<D::Conn, ConnSetError<D::Error>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConnSetError::Closed);
        }

        if let Some(tracked) = self.conns.lock().get_mut(addr) {
            if track {
                tracked.acquire();
            }
            return Ok(tracked.conn.clone());
        }

        let conn = self.dialer.dial(addr).await.map_err(|source| ConnSetError::Dial { source })?;

        let mut conns = self.conns.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(conns);
            spawn_close(conn);
            return Err(ConnSetError::Closed);
        }

        let tracked = match conns.entry(addr.to_string()) {
            Entry::Occupied(entry) => {
                debug!(addr, "Lost dial race, closing duplicate connection");
                spawn_close(conn);
                entry.into_mut()
            },
            Entry::Vacant(entry) => entry.insert(TrackedConn::new(conn)),
        };
        if track {
            tracked.acquire();
        }
        Ok(tracked.conn.clone())
    }

    fn evict_idle(&self, ttl: Duration) {
        let now = Instant::now();
        let expired: Vec<(String, TrackedConn<D::Conn>)> =
            self.conns.lock().extract_if(|_, tracked| tracked.is_idle(now, ttl)).collect();
        for (addr, tracked) in expired {
            debug!(addr = %addr, "Evicting idle connection");
            spawn_close(tracked.conn);
        }
    }
}

impl<D: Dialer> Drop for Inner<D> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Marks an address as being pre-warmed for as long as it lives.
struct WarmingGuard<'a> {
    warming: &'a Mutex<HashSet<String>>,
    addr: String,
}

impl<'a> WarmingGuard<'a> {
    fn claim(warming: &'a Mutex<HashSet<String>>, addr: &str) -> Option<Self> {
        warming.lock().insert(addr.to_string()).then(|| Self { warming, addr: addr.to_string() })
    }
}

impl Drop for WarmingGuard<'_> {
    fn drop(&mut self) {
        self.warming.lock().remove(&self.addr);
    }
}

fn spawn_close<C: Closer>(conn: C) {
    tokio::spawn(async move { conn.close().await });
}

fn spawn_evictor<D: Dialer>(inner: &Arc<Inner<D>>, ttl: Duration) -> JoinHandle<()> {
    let weak: Weak<Inner<D>> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    let period = (ttl / 3).max(MIN_EVICTION_PERIOD);

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {},
            }
            let Some(inner) = weak.upgrade() else { break };
            inner.evict_idle(ttl);
        }
    })
}
