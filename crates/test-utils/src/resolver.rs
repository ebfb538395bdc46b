//! Scripted DNS lookups and a recording update sink.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use dnsfleet_client::{
    ConnectError, HostLookup, LookupError, LookupErrorKind, ResolverState, UpdateSink,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;

type LookupResult = Result<Vec<String>, LookupError>;

/// A [`HostLookup`] that replays queued responses.
///
/// Each lookup pops the next queued response; once the queue is down to its last entry that
/// entry is repeated. With nothing queued, lookups return an empty address list.
#[derive(Clone, Default)]
pub struct FakeLookup {
    inner: Arc<LookupState>,
}

#[derive(Default)]
struct LookupState {
    script: Mutex<VecDeque<(LookupKind, Vec<String>)>>,
    calls: AtomicUsize,
    hosts: Mutex<Vec<String>>,
    called: Notify,
}

#[derive(Clone, Copy)]
enum LookupKind {
    Ok,
    Err(LookupErrorKind),
}

impl FakeLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a lookup that always returns `addrs`.
    pub fn returning(addrs: &[&str]) -> Self {
        let lookup = Self::new();
        lookup.push_ok(addrs);
        lookup
    }

    /// Queues a successful response.
    pub fn push_ok(&self, addrs: &[&str]) {
        let addrs = addrs.iter().map(|a| (*a).to_string()).collect();
        self.inner.script.lock().push_back((LookupKind::Ok, addrs));
    }

    /// Queues a failure of the given kind.
    pub fn push_err(&self, kind: LookupErrorKind) {
        self.inner.script.lock().push_back((LookupKind::Err(kind), Vec::new()));
    }

    /// Number of lookups performed.
    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    /// Hosts looked up, in order.
    pub fn hosts(&self) -> Vec<String> {
        self.inner.hosts.lock().clone()
    }

    /// Waits until at least `n` lookups have been performed.
    pub async fn wait_for_calls(&self, n: usize) {
        loop {
            let called = self.inner.called.notified();
            if self.calls() >= n {
                return;
            }
            called.await;
        }
    }

    fn next_response(&self) -> LookupResult {
        let mut script = self.inner.script.lock();
        let entry = if script.len() > 1 { script.pop_front() } else { script.front().cloned() };
        match entry {
            None => Ok(Vec::new()),
            Some((LookupKind::Ok, addrs)) => Ok(addrs),
            Some((LookupKind::Err(kind), _)) => {
                Err(LookupError::new(kind, format!("scripted {kind:?} failure")))
            },
        }
    }
}

impl HostLookup for FakeLookup {
    fn lookup_host<'a>(&'a self, host: &'a str) -> BoxFuture<'a, LookupResult> {
        Box::pin(async move {
            self.inner.hosts.lock().push(host.to_string());
            let response = self.next_response();
            self.inner.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.called.notify_waiters();
            response
        })
    }
}

impl fmt::Debug for FakeLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeLookup").field("calls", &self.calls()).finish()
    }
}

/// An [`UpdateSink`] that keeps every state and error it receives.
#[derive(Clone, Default)]
pub struct RecordingSink {
    inner: Arc<SinkState>,
}

#[derive(Default)]
struct SinkState {
    states: Mutex<Vec<ResolverState>>,
    errors: Mutex<Vec<String>>,
    changed: Notify,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pushed state, oldest first.
    pub fn states(&self) -> Vec<ResolverState> {
        self.inner.states.lock().clone()
    }

    pub fn state_count(&self) -> usize {
        self.inner.states.lock().len()
    }

    /// Addresses of the most recent state.
    pub fn last_addresses(&self) -> Option<Vec<String>> {
        self.inner
            .states
            .lock()
            .last()
            .map(|state| state.addresses().iter().map(ToString::to_string).collect())
    }

    /// Messages of every reported error, oldest first.
    pub fn errors(&self) -> Vec<String> {
        self.inner.errors.lock().clone()
    }

    /// Waits until at least `n` states have been pushed.
    pub async fn wait_for_states(&self, n: usize) {
        loop {
            let changed = self.inner.changed.notified();
            if self.state_count() >= n {
                return;
            }
            changed.await;
        }
    }

    /// Waits until at least `n` errors have been reported.
    pub async fn wait_for_errors(&self, n: usize) {
        loop {
            let changed = self.inner.changed.notified();
            if self.inner.errors.lock().len() >= n {
                return;
            }
            changed.await;
        }
    }
}

impl UpdateSink for RecordingSink {
    fn update_state(&self, state: ResolverState) {
        self.inner.states.lock().push(state);
        self.inner.changed.notify_waiters();
    }

    fn report_error(&self, err: ConnectError) {
        self.inner.errors.lock().push(err.to_string());
        self.inner.changed.notify_waiters();
    }
}

impl fmt::Debug for RecordingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSink")
            .field("states", &self.state_count())
            .field("errors", &self.inner.errors.lock().len())
            .finish()
    }
}
