//! Connection pools over tonic channels.
//!
//! [`dial`] turns an address and [`ClientOptions`] into a [`ConnPool`] of [`ClientConn`]s. A
//! connection either talks to the address directly, or, when a refresh interval, address prefix
//! or DNS server is configured, runs a `ps-dns` resolver and keeps one lazily connected channel
//! per resolved address.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use dnsfleet_client::{ClientOptions, Registry, TlsConfig, dial};
//!
//! # async fn example() -> Result<(), dnsfleet_client::ConnectError> {
//! let registry = Registry::with_defaults();
//! let options = ClientOptions::builder()
//!     .pool_size(4)
//!     .refresh_interval(Duration::from_secs(30))
//!     .address_prefix("10.0.0.0/8".to_string())
//!     .tls(TlsConfig::with_native_roots())
//!     .build()?;
//!
//! let pool = dial(&registry, "db.fleet.internal", &options).await?;
//! let channel = pool.get().authorized_channel().await?;
//! // ... build a generated client on `channel` ...
//! pool.close().await;
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use snafu::ResultExt;
use tokio::sync::watch;
use tonic::{
    client::Grpc,
    codec::CompressionEncoding,
    service::interceptor::InterceptedService,
    transport::{Channel, Endpoint, Uri},
};
use tracing::{debug, warn};

use crate::{
    auth::AuthInterceptor,
    connset::Closer,
    error::{ConnectError, InvalidEndpointSnafu, Result, TransportSnafu},
    options::{ClientOptions, EndpointOption},
    registry::Registry,
    resolver::{
        AddrPrefix, ResolvedAddress, Resolver, ResolverState, SCHEME, Target, UpdateSink,
        host_of, parse_resolver_address,
    },
    retry::with_retry,
    tls::parse_server_name,
    transport::TransportConnector,
};

/// Default port for addresses dialed with TLS.
const TLS_PORT: &str = "443";
/// Default port for plaintext addresses.
const PLAINTEXT_PORT: &str = "80";

// =========================================================================
// ConnPool
// =========================================================================

/// A fixed set of connections to one target.
#[derive(Debug)]
pub enum ConnPool<C> {
    /// A single connection.
    Single(C),
    /// Several connections handed out in rotation.
    RoundRobin(RoundRobin<C>),
}

/// Two or more pool members in dial order, handed out in rotation.
///
/// Only [`ConnPool::establish`] builds one, so it never holds zero members.
#[derive(Debug)]
pub struct RoundRobin<C> {
    conns: Vec<C>,
    next: AtomicUsize,
}

impl<C> RoundRobin<C> {
    fn new(conns: Vec<C>) -> Self {
        debug_assert!(!conns.is_empty());
        Self { conns, next: AtomicUsize::new(0) }
    }

    /// Returns the next member, wrapping after the last.
    pub fn next(&self) -> &C {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.conns.len();
        &self.conns[index]
    }

    /// Members in dial order.
    pub fn members(&self) -> &[C] {
        &self.conns
    }
}

impl<C: Closer> ConnPool<C> {
    /// Establishes `size` connections one after another with `dial_one`.
    ///
    /// A size of zero or one yields [`ConnPool::Single`]. If any dial fails, every connection
    /// established so far is closed before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the first dial error.
    pub async fn establish<F, Fut, E>(size: usize, mut dial_one: F) -> Result<Self, E>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        if size <= 1 {
            return dial_one(0).await.map(Self::Single);
        }

        let mut conns = Vec::with_capacity(size);
        for index in 0..size {
            match dial_one(index).await {
                Ok(conn) => conns.push(conn),
                Err(err) => {
                    debug!(index, established = conns.len(), "Pool dial failed, closing members");
                    futures::future::join_all(conns.iter().map(|conn| conn.close())).await;
                    return Err(err);
                },
            }
        }
        Ok(Self::RoundRobin(RoundRobin::new(conns)))
    }

    /// Closes every member.
    pub async fn close(&self) {
        match self {
            Self::Single(conn) => conn.close().await,
            Self::RoundRobin(set) => {
                futures::future::join_all(set.conns.iter().map(|conn| conn.close())).await;
            },
        }
    }
}

impl<C> ConnPool<C> {
    /// Returns the next connection. Rotates through members in fixed order.
    pub fn get(&self) -> &C {
        match self {
            Self::Single(conn) => conn,
            Self::RoundRobin(set) => set.next(),
        }
    }

    /// Returns the number of connections.
    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::RoundRobin(set) => set.conns.len(),
        }
    }

    /// Always false: a pool holds at least one connection.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the members in dial order.
    pub fn iter(&self) -> impl Iterator<Item = &C> {
        let conns = match self {
            Self::Single(conn) => std::slice::from_ref(conn),
            Self::RoundRobin(set) => set.members(),
        };
        conns.iter()
    }
}

// =========================================================================
// ClientConn
// =========================================================================

/// Per-call settings every client built on a [`ClientConn`] should apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    compression: Option<CompressionEncoding>,
    max_message_size: usize,
}

impl CallPolicy {
    /// The encoding used to compress requests, if compression is on.
    #[must_use]
    pub fn compression(&self) -> Option<CompressionEncoding> {
        self.compression
    }

    /// Maximum encoded and decoded message size.
    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Applies the policy to a low-level gRPC client.
    #[must_use]
    pub fn apply<T>(&self, grpc: Grpc<T>) -> Grpc<T> {
        let grpc = grpc
            .max_decoding_message_size(self.max_message_size)
            .max_encoding_message_size(self.max_message_size);
        match self.compression {
            Some(encoding) => grpc.send_compressed(encoding).accept_compressed(encoding),
            None => grpc,
        }
    }
}

/// A logical connection to a target.
///
/// Cloning is cheap and yields a handle to the same connection.
#[derive(Clone)]
pub struct ClientConn {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    target: String,
    kind: ConnKind,
    policy: CallPolicy,
    interceptor: AuthInterceptor,
    closed: AtomicBool,
}

enum ConnKind {
    Direct(Channel),
    Resolved { channels: Arc<ResolvedChannels>, resolver: Box<dyn Resolver> },
}

impl ClientConn {
    /// The address this connection was dialed with, port included.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.inner.target
    }

    /// Returns true if addresses come from a resolver.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(self.inner.kind, ConnKind::Resolved { .. })
    }

    #[must_use]
    pub fn call_policy(&self) -> CallPolicy {
        self.inner.policy
    }

    /// Returns a channel for the next call.
    ///
    /// Resolved connections pick among the current addresses (in rotation when round-robin is
    /// on, the first address otherwise). Before the first resolution completes this waits up
    /// to the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::ConnectionClosed`] after [`close`](Self::close), or
    /// [`ConnectError::NoAddresses`] if nothing resolved in time.
    pub async fn channel(&self) -> Result<Channel> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ConnectError::ConnectionClosed);
        }
        match &self.inner.kind {
            ConnKind::Direct(channel) => Ok(channel.clone()),
            ConnKind::Resolved { channels, resolver } => {
                if let Some(channel) = channels.pick() {
                    return Ok(channel);
                }
                resolver.resolve_now();
                channels.wait_ready().await
            },
        }
    }

    /// Returns a channel that attaches the configured credentials and headers to every call.
    ///
    /// # Errors
    ///
    /// As [`channel`](Self::channel).
    pub async fn authorized_channel(&self) -> Result<InterceptedService<Channel, AuthInterceptor>> {
        let channel = self.channel().await?;
        Ok(InterceptedService::new(channel, self.inner.interceptor.clone()))
    }

    /// Returns a low-level gRPC client with credentials and the call policy applied.
    ///
    /// # Errors
    ///
    /// As [`channel`](Self::channel).
    pub async fn grpc(&self) -> Result<Grpc<InterceptedService<Channel, AuthInterceptor>>> {
        let service = self.authorized_channel().await?;
        Ok(self.inner.policy.apply(Grpc::new(service)))
    }

    /// Closes the connection. Resolved connections stop their resolver and drop every
    /// channel. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(target_addr = %self.inner.target, "Closing connection");
        if let ConnKind::Resolved { channels, resolver } = &self.inner.kind {
            resolver.close().await;
            channels.clear();
        }
    }

    /// Addresses currently known to a resolved connection, in resolution order. Empty for
    /// direct connections.
    #[must_use]
    pub fn resolved_addresses(&self) -> Vec<ResolvedAddress> {
        match &self.inner.kind {
            ConnKind::Direct(_) => Vec::new(),
            ConnKind::Resolved { channels, .. } => channels.addresses(),
        }
    }

    /// Returns true once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl Closer for ClientConn {
    fn close(&self) -> impl Future<Output = ()> + Send {
        ClientConn::close(self)
    }
}

impl fmt::Debug for ClientConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConn")
            .field("target", &self.inner.target)
            .field("resolved", &self.is_resolved())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// =========================================================================
// Channel construction
// =========================================================================

/// Endpoint settings shared by every channel of a connection.
#[derive(Clone)]
struct EndpointTemplate {
    origin: Uri,
    connect_timeout: Duration,
    keepalive_time: Duration,
    keepalive_timeout: Duration,
    extra: Vec<EndpointOption>,
    connector: TransportConnector,
}

impl EndpointTemplate {
    fn new(target: &str, options: &ClientOptions, connector: TransportConnector) -> Result<Self> {
        let origin_uri = format!("http://{target}");
        let origin = origin_uri.parse::<Uri>().map_err(|e| ConnectError::InvalidTarget {
            target: target.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            origin,
            connect_timeout: options.connect_timeout(),
            keepalive_time: options.keepalive_time(),
            keepalive_timeout: options.keepalive_timeout(),
            extra: options.endpoint_options().to_vec(),
            connector,
        })
    }

    fn endpoint(&self, addr: &str) -> Result<Endpoint> {
        let uri = format!("http://{addr}");
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .context(InvalidEndpointSnafu { uri })?
            .origin(self.origin.clone())
            .connect_timeout(self.connect_timeout);

        let keepalive = Keepalive::from_settings(self.keepalive_time, self.keepalive_timeout);
        if let Some(keepalive) = keepalive {
            if let Some(interval) = keepalive.interval {
                endpoint = endpoint.http2_keep_alive_interval(interval);
            }
            if let Some(timeout) = keepalive.timeout {
                endpoint = endpoint.keep_alive_timeout(timeout);
            }
            endpoint = endpoint.keep_alive_while_idle(true);
        }

        Ok(self.extra.iter().fold(endpoint, |endpoint, option| option.apply(endpoint)))
    }

    fn lazy_channel(&self, addr: &str) -> Result<Channel> {
        Ok(self.endpoint(addr)?.connect_with_connector_lazy(self.connector.clone()))
    }

    async fn connect(&self, addr: &str) -> Result<Channel> {
        self.endpoint(addr)?.connect_with_connector(self.connector.clone()).await.context(TransportSnafu)
    }
}

/// HTTP/2 keepalive to apply to an endpoint. Zero durations mean "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Keepalive {
    interval: Option<Duration>,
    timeout: Option<Duration>,
}

impl Keepalive {
    /// `None` when both durations are zero: the endpoint keeps tonic's defaults and idle pings
    /// stay off.
    fn from_settings(time: Duration, timeout: Duration) -> Option<Self> {
        let nonzero = |d: Duration| (!d.is_zero()).then_some(d);
        let keepalive = Self { interval: nonzero(time), timeout: nonzero(timeout) };
        (keepalive.interval.is_some() || keepalive.timeout.is_some()).then_some(keepalive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Resolution {
    Pending,
    Ready,
    Failed(String),
}

/// Channels for the addresses of a resolved target, kept in resolution order.
struct ResolvedChannels {
    target: String,
    template: EndpointTemplate,
    round_robin: bool,
    channels: Mutex<Vec<(ResolvedAddress, Channel)>>,
    next: AtomicUsize,
    resolution: watch::Sender<Resolution>,
}

impl ResolvedChannels {
    fn new(target: &str, template: EndpointTemplate, round_robin: bool) -> Self {
        let (resolution, _) = watch::channel(Resolution::Pending);
        Self {
            target: target.to_string(),
            template,
            round_robin,
            channels: Mutex::new(Vec::new()),
            next: AtomicUsize::new(0),
            resolution,
        }
    }

    fn pick(&self) -> Option<Channel> {
        let channels = self.channels.lock();
        if channels.is_empty() {
            return None;
        }
        let index = if self.round_robin {
            self.next.fetch_add(1, Ordering::Relaxed) % channels.len()
        } else {
            0
        };
        Some(channels[index].1.clone())
    }

    async fn wait_ready(&self) -> Result<Channel> {
        let mut rx = self.resolution.subscribe();
        let wait = rx.wait_for(|r| *r == Resolution::Ready);
        let resolved =
            tokio::time::timeout(self.template.connect_timeout, wait).await.is_ok_and(|r| r.is_ok());
        if resolved && let Some(channel) = self.pick() {
            return Ok(channel);
        }
        if let Resolution::Failed(message) = &*self.resolution.borrow() {
            warn!(target_addr = %self.target, error = %message, "No addresses resolved");
        }
        Err(ConnectError::NoAddresses { target: self.target.clone() })
    }

    fn addresses(&self) -> Vec<ResolvedAddress> {
        self.channels.lock().iter().map(|(addr, _)| addr.clone()).collect()
    }

    fn clear(&self) {
        self.channels.lock().clear();
    }
}

impl UpdateSink for ResolvedChannels {
    fn update_state(&self, state: ResolverState) {
        let mut channels = self.channels.lock();
        let mut previous = std::mem::take(&mut *channels);

        for addr in state.addresses() {
            if let Some(pos) = previous.iter().position(|(known, _)| known == addr) {
                channels.push(previous.swap_remove(pos));
                continue;
            }
            match self.template.lazy_channel(addr.as_str()) {
                Ok(channel) => channels.push((addr.clone(), channel)),
                Err(err) => warn!(addr = %addr, error = %err, "Dropping unusable address"),
            }
        }
        debug!(
            target_addr = %self.target,
            addresses = channels.len(),
            removed = previous.len(),
            "Resolved addresses updated"
        );

        let resolution = if channels.is_empty() {
            Resolution::Failed("resolver produced no addresses".to_string())
        } else {
            Resolution::Ready
        };
        drop(channels);
        self.resolution.send_replace(resolution);
    }

    fn report_error(&self, err: ConnectError) {
        let message = err.to_string();
        // Known addresses stay usable across transient failures.
        self.resolution.send_if_modified(|current| {
            if *current == Resolution::Ready {
                return false;
            }
            *current = Resolution::Failed(message);
            true
        });
    }
}

// =========================================================================
// Dialing
// =========================================================================

/// Appends the default port when `addr` has no colon: 443 with TLS, 80 without.
pub(crate) fn with_default_port(addr: &str, tls: bool) -> String {
    if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{}", if tls { TLS_PORT } else { PLAINTEXT_PORT })
    }
}

/// Dials a pool of connections to `addr`.
///
/// # Errors
///
/// Returns [`ConnectError::UnregisteredCompressor`] if compression is requested with an unknown
/// compressor, configuration and TLS errors from the options, resolver build errors, and, when
/// connecting eagerly, the connection error once the retry policy is exhausted.
pub async fn dial(
    registry: &Registry,
    addr: &str,
    options: &ClientOptions,
) -> Result<ConnPool<ClientConn>> {
    let compression = if options.compression() {
        let encoding = registry.compressor(options.compressor()).ok_or_else(|| {
            ConnectError::UnregisteredCompressor { name: options.compressor().to_string() }
        })?;
        Some(encoding)
    } else {
        None
    };
    let policy = CallPolicy { compression, max_message_size: options.max_message_size() };

    let target = with_default_port(addr, options.tls().is_some());
    let connector = match options.tls() {
        Some(tls) => {
            let server_name = tls.server_name_for(host_of(&target));
            TransportConnector::tls(tls.client_config()?, parse_server_name(&server_name)?)
        },
        None => TransportConnector::plaintext(),
    };
    let template = EndpointTemplate::new(&target, options, connector)?;
    let interceptor = AuthInterceptor::new(options.authorization(), options.headers())?;
    let resolver_uri = resolver_uri(&target, options)?;

    debug!(
        target_addr = %target,
        pool_size = options.pool_size(),
        resolver = resolver_uri.as_deref().unwrap_or("none"),
        tls = options.tls().is_some(),
        "Dialing connection pool"
    );

    let dialer = ConnDialer {
        registry,
        target: &target,
        options,
        template: &template,
        policy,
        interceptor: &interceptor,
        resolver_uri: resolver_uri.as_deref(),
    };
    ConnPool::establish(options.pool_size(), |_| dialer.dial_one()).await
}

/// Builds the `ps-dns` target URI when the options call for a resolver.
fn resolver_uri(target: &str, options: &ClientOptions) -> Result<Option<String>> {
    if !options.uses_resolver() {
        return Ok(None);
    }
    let mut uri = Target::new(SCHEME, target).with_refresh(options.refresh_interval());
    if let Some(prefix) = options.address_prefix() {
        uri = uri.with_prefix(prefix.parse::<AddrPrefix>()?);
    }
    if let Some(resolver) = options.resolver_address() {
        uri = uri.with_resolver_address(parse_resolver_address(resolver)?);
    }
    Ok(Some(uri.to_string()))
}

struct ConnDialer<'a> {
    registry: &'a Registry,
    target: &'a str,
    options: &'a ClientOptions,
    template: &'a EndpointTemplate,
    policy: CallPolicy,
    interceptor: &'a AuthInterceptor,
    resolver_uri: Option<&'a str>,
}

impl ConnDialer<'_> {
    async fn dial_one(&self) -> Result<ClientConn> {
        let kind = match self.resolver_uri {
            None => ConnKind::Direct(self.direct_channel().await?),
            Some(uri) => {
                let channels = Arc::new(ResolvedChannels::new(
                    self.target,
                    self.template.clone(),
                    self.options.round_robin(),
                ));
                let resolver = self
                    .registry
                    .build_resolver(uri, Arc::clone(&channels) as Arc<dyn UpdateSink>)?;
                ConnKind::Resolved { channels, resolver }
            },
        };

        let conn = ClientConn {
            inner: Arc::new(ConnInner {
                target: self.target.to_string(),
                kind,
                policy: self.policy,
                interceptor: self.interceptor.clone(),
                closed: AtomicBool::new(false),
            }),
        };

        if self.options.connect_eagerly() && conn.is_resolved() {
            let ready = with_retry(self.options.retry_policy(), || conn.channel()).await;
            if let Err(err) = ready {
                conn.close().await;
                return Err(err);
            }
        }
        Ok(conn)
    }

    async fn direct_channel(&self) -> Result<Channel> {
        if !self.options.connect_eagerly() {
            return self.template.lazy_channel(self.target);
        }
        with_retry(self.options.retry_policy(), || self.template.connect(self.target)).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::{options::RetryPolicy, tls::TlsConfig};

    #[derive(Clone, Default)]
    struct Member {
        closed: Arc<AtomicBool>,
    }

    impl Closer for Member {
        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn template(round_robin: bool) -> ResolvedChannels {
        let options = ClientOptions::default();
        let template =
            EndpointTemplate::new("db.internal:443", &options, TransportConnector::plaintext())
                .unwrap();
        ResolvedChannels::new("db.internal:443", template, round_robin)
    }

    fn state(addrs: &[&str]) -> ResolverState {
        ResolverState::new(addrs.iter().map(|a| ResolvedAddress::from(*a)).collect())
    }

    // =========================================================================
    // ConnPool tests
    // =========================================================================

    #[tokio::test]
    async fn test_pool_of_one_is_single() {
        let pool = ConnPool::establish(1, |_| async { Ok::<_, ConnectError>(Member::default()) })
            .await
            .unwrap();
        assert!(matches!(pool, ConnPool::Single(_)));
        assert_eq!(pool.len(), 1);

        let pool = ConnPool::establish(0, |_| async { Ok::<_, ConnectError>(Member::default()) })
            .await
            .unwrap();
        assert!(matches!(pool, ConnPool::Single(_)));
    }

    #[test]
    fn test_round_robin_rotates_in_order() {
        let pool = ConnPool::RoundRobin(RoundRobin::new(vec![10, 20, 30]));
        let order: Vec<_> = (0..6).map(|_| *pool.get()).collect();
        assert_eq!(order, vec![10, 20, 30, 10, 20, 30]);
        assert_eq!(pool.iter().copied().collect::<Vec<_>>(), vec![10, 20, 30]);
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn test_multi_member_pool_rotates_through_members() {
        let pool = ConnPool::establish(2, |_| async { Ok::<_, ConnectError>(Member::default()) })
            .await
            .unwrap();
        let ConnPool::RoundRobin(set) = &pool else { panic!("expected a round-robin pool") };
        assert_eq!(set.members().len(), 2);
        assert!(std::ptr::eq(set.next(), &set.members()[0]));
        assert!(std::ptr::eq(set.next(), &set.members()[1]));
        assert!(std::ptr::eq(set.next(), &set.members()[0]));
        assert!(!pool.is_empty());
    }

    #[tokio::test]
    async fn test_failed_dial_closes_established_members() {
        let first = Member::default();
        let first_closed = Arc::clone(&first.closed);

        let result = ConnPool::establish(3, |index| {
            let member = first.clone();
            async move {
                match index {
                    0 => Ok(member),
                    _ => Err(ConnectError::NoAddresses { target: "db:443".to_string() }),
                }
            }
        })
        .await;

        assert!(matches!(result, Err(ConnectError::NoAddresses { .. })));
        assert!(first_closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_pool_close_closes_every_member() {
        let members: Vec<Member> = (0..3).map(|_| Member::default()).collect();
        let flags: Vec<_> = members.iter().map(|m| Arc::clone(&m.closed)).collect();
        let mut queue = members.into_iter();

        let pool = ConnPool::establish(3, |_| {
            let member = queue.next().unwrap();
            async move { Ok::<_, ConnectError>(member) }
        })
        .await
        .unwrap();
        pool.close().await;

        assert!(flags.iter().all(|f| f.load(Ordering::SeqCst)));
    }

    // =========================================================================
    // Dial policy tests
    // =========================================================================

    #[test]
    fn test_default_port_injection() {
        assert_eq!(with_default_port("db.internal", true), "db.internal:443");
        assert_eq!(with_default_port("db.internal", false), "db.internal:80");
        assert_eq!(with_default_port("db.internal:3306", true), "db.internal:3306");
    }

    #[test]
    fn test_resolver_uri_only_when_needed() {
        let plain = ClientOptions::default();
        assert_eq!(resolver_uri("db:443", &plain).unwrap(), None);

        let options = ClientOptions::builder()
            .refresh_interval(Duration::from_secs(30))
            .address_prefix("10.0.0.0/8".to_string())
            .build()
            .unwrap();
        let uri = resolver_uri("db:443", &options).unwrap().unwrap();
        assert_eq!(uri, "ps-dns:///db:443?refresh=30000ms&prefix=10.0.0.0%2F8");

        let parsed = Target::parse(&uri).unwrap();
        assert_eq!(parsed.refresh(), Duration::from_secs(30));
        assert_eq!(parsed.prefix().to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_resolver_uri_carries_dns_server() {
        let options =
            ClientOptions::builder().resolver_address("10.0.0.2".to_string()).build().unwrap();
        let uri = resolver_uri("db:443", &options).unwrap().unwrap();
        let parsed = Target::parse(&uri).unwrap();
        assert_eq!(parsed.resolver_address(), Some("10.0.0.2:53".parse().unwrap()));
        assert_eq!(parsed.refresh(), Duration::ZERO);
    }

    #[test]
    fn test_call_policy_defaults() {
        let policy = CallPolicy { compression: None, max_message_size: 1024 };
        assert_eq!(policy.compression(), None);
        assert_eq!(policy.max_message_size(), 1024);
    }

    #[tokio::test]
    async fn test_unregistered_compressor_rejected() {
        let options = ClientOptions::builder()
            .compression(true)
            .compressor("snappy")
            .build()
            .unwrap();
        let err = dial(&Registry::with_defaults(), "127.0.0.1:1", &options).await.unwrap_err();
        assert_eq!(err.to_string(), "snappy compressor not installed");
    }

    #[tokio::test]
    async fn test_lazy_direct_dial_succeeds_without_server() {
        let options = ClientOptions::builder().pool_size(2).build().unwrap();
        let pool = dial(&Registry::with_defaults(), "127.0.0.1:1", &options).await.unwrap();
        assert_eq!(pool.len(), 2);
        let conn = pool.get();
        assert!(!conn.is_resolved());
        assert_eq!(conn.target(), "127.0.0.1:1");
        assert!(conn.channel().await.is_ok());

        pool.close().await;
        assert!(matches!(conn.channel().await, Err(ConnectError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_eager_direct_dial_exhausts_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = ClientOptions::builder()
            .connect_eagerly(true)
            .retry_policy(
                RetryPolicy::builder()
                    .with_max_attempts(2)
                    .with_initial_backoff(Duration::from_millis(1))
                    .with_jitter(0.0)
                    .build(),
            )
            .build()
            .unwrap();
        let err = dial(&Registry::with_defaults(), &addr.to_string(), &options).await.unwrap_err();
        assert!(matches!(err, ConnectError::RetryExhausted { attempts: 2, .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_tls_dial_uses_default_tls_port() {
        let options = ClientOptions::builder()
            .tls(TlsConfig::new().with_insecure_skip_verify())
            .build()
            .unwrap();
        let pool = dial(&Registry::with_defaults(), "127.0.0.1", &options).await.unwrap();
        assert_eq!(pool.get().target(), "127.0.0.1:443");
    }

    #[tokio::test]
    async fn test_resolved_ip_literal_is_ready_immediately() {
        let options = ClientOptions::builder()
            .address_prefix("10.0.0.0/8".to_string())
            .build()
            .unwrap();
        let pool = dial(&Registry::with_defaults(), "10.1.2.3:3306", &options).await.unwrap();
        let conn = pool.get();
        assert!(conn.is_resolved());
        assert_eq!(conn.resolved_addresses(), vec![ResolvedAddress::from("10.1.2.3:3306")]);
        assert!(conn.authorized_channel().await.is_ok());
        conn.close().await;
        assert!(conn.resolved_addresses().is_empty());
    }

    #[test]
    fn test_keepalive_applied_only_when_configured() {
        let secs = Duration::from_secs;
        assert_eq!(Keepalive::from_settings(Duration::ZERO, Duration::ZERO), None);
        assert_eq!(
            Keepalive::from_settings(secs(10), secs(20)),
            Some(Keepalive { interval: Some(secs(10)), timeout: Some(secs(20)) })
        );
        assert_eq!(
            Keepalive::from_settings(secs(10), Duration::ZERO),
            Some(Keepalive { interval: Some(secs(10)), timeout: None })
        );
        assert_eq!(
            Keepalive::from_settings(Duration::ZERO, secs(5)),
            Some(Keepalive { interval: None, timeout: Some(secs(5)) })
        );
    }

    // =========================================================================
    // ResolvedChannels tests
    // =========================================================================

    #[tokio::test]
    async fn test_update_keeps_resolution_order_and_reuses_channels() {
        let channels = template(true);
        channels.update_state(state(&["10.0.0.1:443", "10.0.0.2:443"]));
        channels.update_state(state(&["10.0.0.3:443", "10.0.0.1:443"]));

        let addrs: Vec<_> = channels.addresses().iter().map(|a| a.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.3:443", "10.0.0.1:443"]);
        assert_eq!(*channels.resolution.borrow(), Resolution::Ready);
    }

    #[tokio::test]
    async fn test_empty_update_marks_failed() {
        let channels = template(true);
        channels.update_state(state(&[]));
        assert!(matches!(*channels.resolution.borrow(), Resolution::Failed(_)));
        assert!(channels.pick().is_none());
    }

    #[tokio::test]
    async fn test_reported_error_keeps_known_addresses() {
        let channels = template(false);
        channels.update_state(state(&["10.0.0.1:443"]));
        channels.report_error(ConnectError::DnsLookup {
            host: "db.internal".to_string(),
            message: "timed out".to_string(),
        });
        assert_eq!(*channels.resolution.borrow(), Resolution::Ready);
        assert!(channels.pick().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out_without_addresses() {
        let channels = template(true);
        channels.report_error(ConnectError::DnsLookup {
            host: "db.internal".to_string(),
            message: "timed out".to_string(),
        });
        let err = channels.wait_ready().await.unwrap_err();
        assert!(matches!(err, ConnectError::NoAddresses { ref target } if target == "db.internal:443"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_returns_once_resolved() {
        let channels = Arc::new(template(true));
        let waiter = {
            let channels = Arc::clone(&channels);
            tokio::spawn(async move { channels.wait_ready().await.is_ok() })
        };
        tokio::task::yield_now().await;
        channels.update_state(state(&["10.0.0.1:443"]));
        assert!(waiter.await.unwrap());
    }
}
