//! The `ps-dns` resolver: periodic DNS re-resolution with prefix filtering.

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    AddrPrefix, HickoryLookup, HostLookup, ResolvedAddress, Resolver, ResolverBuilder,
    ResolverState, Target, UpdateSink, format_addr, format_ip, parse_target,
};
use crate::error::{AddressParseSnafu, ConnectError, Result};

/// URI scheme handled by [`DnsResolverBuilder`].
pub const SCHEME: &str = "ps-dns";

/// Port used when a target does not name one.
pub const DEFAULT_PORT: &str = "443";

/// Builds `ps-dns` resolvers.
///
/// An IP-literal target yields its single address immediately. A target with no refresh
/// interval, the catch-all prefix and no DNS server override is resolved once at build and
/// again per [`Resolver::resolve_now`], with no background loop. Anything else runs a
/// resolution loop until closed.
#[derive(Clone)]
pub struct DnsResolverBuilder {
    default_port: String,
    lookup: Option<Arc<dyn HostLookup>>,
}

impl DnsResolverBuilder {
    /// Creates a builder using the system DNS configuration and port 443.
    #[must_use]
    pub fn new() -> Self {
        Self { default_port: DEFAULT_PORT.to_string(), lookup: None }
    }

    /// Overrides the port used for targets without one.
    #[must_use]
    pub fn with_default_port(mut self, port: impl Into<String>) -> Self {
        self.default_port = port.into();
        self
    }

    /// Routes every lookup through `lookup`, ignoring any `resolver` query parameter.
    #[must_use]
    pub fn with_lookup(mut self, lookup: Arc<dyn HostLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    fn lookup_for(&self, target: &Target) -> Result<Arc<dyn HostLookup>> {
        if let Some(lookup) = &self.lookup {
            return Ok(Arc::clone(lookup));
        }
        Ok(match target.resolver_address() {
            Some(server) => Arc::new(HickoryLookup::with_name_server(server)),
            None => Arc::new(HickoryLookup::from_system_conf()?),
        })
    }
}

impl Default for DnsResolverBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DnsResolverBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsResolverBuilder")
            .field("default_port", &self.default_port)
            .field("custom_lookup", &self.lookup.is_some())
            .finish()
    }
}

impl ResolverBuilder for DnsResolverBuilder {
    fn scheme(&self) -> &str {
        SCHEME
    }

    fn build(&self, target: &Target, sink: Arc<dyn UpdateSink>) -> Result<Box<dyn Resolver>> {
        let (host, port) = parse_target(target.endpoint(), &self.default_port)?;

        if let Some(ip) = format_ip(&host) {
            debug!(uri = %target, "Target is an IP literal, skipping DNS");
            sink.update_state(ResolverState::new(vec![ResolvedAddress::new(format!(
                "{ip}:{port}"
            ))]));
            return Ok(Box::new(StaticResolver));
        }

        // A zero interval resolves once and then only on resolve_now.
        let refresh = (!target.refresh().is_zero()).then_some(target.refresh());
        let watcher = Watcher {
            host,
            port,
            refresh,
            prefix: target.prefix(),
            lookup: self.lookup_for(target)?,
            sink,
        };

        if refresh.is_none() && target.prefix().is_catch_all() && target.resolver_address().is_none()
        {
            debug!(uri = %target, "Plain target, resolving on demand only");
            return Ok(Box::new(OneShotResolver::start(watcher)));
        }
        debug!(uri = %target, ?refresh, "Starting DNS resolver");
        Ok(Box::new(DnsResolver::spawn(watcher)))
    }
}

/// Resolver for IP-literal targets. It never calls back after build.
#[derive(Debug)]
struct StaticResolver;

impl Resolver for StaticResolver {
    fn resolve_now(&self) {}

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(std::future::ready(()))
    }
}

/// Resolver for plain targets: every pass is a single spawned lookup.
struct OneShotResolver {
    watcher: Arc<Watcher>,
    in_flight: Arc<AtomicBool>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OneShotResolver {
    fn start(watcher: Watcher) -> Self {
        let resolver = Self {
            watcher: Arc::new(watcher),
            in_flight: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        };
        resolver.resolve_now();
        resolver
    }
}

impl Resolver for OneShotResolver {
    fn resolve_now(&self) {
        if self.shutdown.is_cancelled() || self.in_flight.swap(true, Ordering::AcqRel) {
            return;
        }
        let watcher = Arc::clone(&self.watcher);
        let in_flight = Arc::clone(&self.in_flight);
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {},
                () = watcher.pass() => {},
            }
            in_flight.store(false, Ordering::Release);
        });
        *self.task.lock() = Some(task);
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        Box::pin(async move {
            if let Some(task) = task
                && let Err(e) = task.await
            {
                warn!(error = %e, "DNS lookup task ended abnormally");
            }
        })
    }
}

impl Drop for OneShotResolver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Handle to a background resolution loop.
struct DnsResolver {
    resolve_now: Arc<Notify>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DnsResolver {
    fn spawn(watcher: Watcher) -> Self {
        let resolve_now = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(watcher.run(Arc::clone(&resolve_now), shutdown.clone()));
        Self { resolve_now, shutdown, task: Mutex::new(Some(task)) }
    }
}

impl Resolver for DnsResolver {
    fn resolve_now(&self) {
        // Stores at most one permit, so repeated calls collapse into one wake.
        self.resolve_now.notify_one();
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.shutdown.cancel();
        let task = self.task.lock().take();
        Box::pin(async move {
            if let Some(task) = task
                && let Err(e) = task.await
            {
                warn!(error = %e, "DNS resolver task ended abnormally");
            }
        })
    }
}

impl Drop for DnsResolver {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Watcher {
    host: String,
    port: String,
    refresh: Option<Duration>,
    prefix: AddrPrefix,
    lookup: Arc<dyn HostLookup>,
    sink: Arc<dyn UpdateSink>,
}

impl Watcher {
    async fn run(self, resolve_now: Arc<Notify>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = self.pass() => {},
            }

            let refresh = async {
                match self.refresh {
                    Some(interval) => tokio::time::sleep(interval).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                () = resolve_now.notified() => {},
                () = refresh => {},
            }
        }
        debug!(host = %self.host, "DNS resolver stopped");
    }

    /// Runs one lookup and pushes the outcome to the sink.
    async fn pass(&self) {
        match self.resolve().await {
            Ok(Some(state)) => {
                debug!(host = %self.host, addresses = state.len(), "Resolved addresses");
                self.sink.update_state(state);
            },
            Ok(None) => {},
            Err(e) => {
                warn!(host = %self.host, error = %e, "DNS resolution failed");
                self.sink.report_error(e);
            },
        }
    }

    /// One lookup pass. `Ok(None)` means the failure was suppressed and nothing should be
    /// pushed.
    async fn resolve(&self) -> Result<Option<ResolverState>> {
        let records = match self.lookup.lookup_host(&self.host).await {
            Ok(records) => records,
            Err(e) if e.is_reportable() => {
                return Err(ConnectError::DnsLookup {
                    host: self.host.clone(),
                    message: e.to_string(),
                });
            },
            Err(e) => {
                debug!(host = %self.host, error = %e, "Suppressing DNS lookup failure");
                return Ok(None);
            },
        };
        let addresses = filter_addresses(&records, self.prefix, &self.port)?;
        Ok(Some(ResolverState::new(addresses)))
    }
}

/// Parses lookup results and applies the prefix filter.
///
/// When a non-catch-all prefix matches nothing, every address is returned unfiltered.
pub(super) fn filter_addresses(
    records: &[String],
    prefix: AddrPrefix,
    port: &str,
) -> Result<Vec<ResolvedAddress>> {
    let ips = records
        .iter()
        .map(|record| record.parse::<IpAddr>().context(AddressParseSnafu { address: record }))
        .collect::<Result<Vec<_>>>()?;

    let to_address = |ip: &IpAddr| ResolvedAddress::new(format!("{}:{port}", format_addr(*ip)));

    let matched: Vec<_> = if prefix.is_catch_all() {
        ips.iter().map(to_address).collect()
    } else {
        ips.iter().filter(|ip| prefix.contains(**ip)).map(to_address).collect()
    };

    if !prefix.is_catch_all() && matched.is_empty() && !ips.is_empty() {
        debug!(%prefix, count = ips.len(), "No address matched prefix, using all");
        return Ok(ips.iter().map(to_address).collect());
    }
    Ok(matched)
}
