//! Name resolution for DNS-addressed fleets.
//!
//! A [`Resolver`] turns a logical target into a list of live addresses and pushes every
//! resolution to an [`UpdateSink`]. The [`DnsResolverBuilder`] implements the `ps-dns` scheme:
//!
//! ```text
//! ps-dns:///<host:port>?refresh=<duration>&prefix=<CIDR>&resolver=<dns-server>
//! ```
//!
//! - `refresh`: how often DNS is re-queried (`30s`, `1500ms`). Zero or absent disables periodic
//!   refresh; the target is then resolved once and again only on [`Resolver::resolve_now`].
//! - `prefix`: only addresses inside this CIDR prefix are kept. When nothing matches, every
//!   address is used instead.
//! - `resolver`: a DNS server (`ip:port` or bare IP on port 53) queried instead of the system
//!   resolver.
//!
//! IP-literal targets skip DNS entirely: a single address is pushed at build time.

mod dns;
mod lookup;
mod prefix;
mod target;

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

pub use dns::{DEFAULT_PORT, DnsResolverBuilder, SCHEME};
use futures::future::BoxFuture;
pub use lookup::{HickoryLookup, HostLookup, LookupError, LookupErrorKind};
pub use prefix::AddrPrefix;
use snafu::ResultExt;
pub(crate) use target::{format_addr, host_of};
pub use target::{format_ip, parse_target};

use crate::error::{ConnectError, InvalidRefreshSnafu, Result};

/// A resolved `host:port` address. IPv6 hosts are bracketed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedAddress(String);

impl ResolvedAddress {
    /// Wraps an address string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResolvedAddress {
    fn from(addr: &str) -> Self {
        Self(addr.to_string())
    }
}

/// The full set of addresses for a target at one point in time.
///
/// Each successful resolution replaces the previous state wholesale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    addresses: Vec<ResolvedAddress>,
}

impl ResolverState {
    /// Creates a state from an ordered address list.
    #[must_use]
    pub fn new(addresses: Vec<ResolvedAddress>) -> Self {
        Self { addresses }
    }

    /// Returns the addresses in resolution order.
    #[must_use]
    pub fn addresses(&self) -> &[ResolvedAddress] {
        &self.addresses
    }

    /// Returns the number of addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Returns true when no address was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }
}

/// Receives the output of a resolver.
///
/// Both methods are called from the resolver's background task only, never after
/// [`Resolver::close`] has returned.
pub trait UpdateSink: Send + Sync + 'static {
    /// Replaces the known addresses for the target.
    fn update_state(&self, state: ResolverState);

    /// Reports a transient resolution failure.
    fn report_error(&self, err: ConnectError);
}

/// A running resolver.
pub trait Resolver: Send + Sync {
    /// Asks for an immediate re-resolution. Never blocks; duplicate requests made while one is
    /// pending are coalesced.
    fn resolve_now(&self);

    /// Stops the resolver and waits for its background task to exit.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Creates resolvers for one URI scheme.
pub trait ResolverBuilder: Send + Sync {
    /// The scheme this builder handles.
    fn scheme(&self) -> &str;

    /// Builds a resolver for `target`, reporting into `sink`.
    ///
    /// Must be called within a Tokio runtime: resolvers may spawn a background task.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the target cannot be resolved at all.
    fn build(&self, target: &Target, sink: Arc<dyn UpdateSink>) -> Result<Box<dyn Resolver>>;
}

/// A parsed resolver target URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    scheme: String,
    endpoint: String,
    refresh: Duration,
    prefix: AddrPrefix,
    resolver_address: Option<SocketAddr>,
}

impl Target {
    /// Creates a target with default options: no refresh, catch-all prefix, system DNS.
    pub fn new(scheme: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            endpoint: endpoint.into(),
            refresh: Duration::ZERO,
            prefix: AddrPrefix::CATCH_ALL,
            resolver_address: None,
        }
    }

    /// Parses `scheme:///endpoint?refresh=..&prefix=..&resolver=..`.
    ///
    /// Missing and empty query values take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::InvalidTarget`] for a malformed URI,
    /// [`ConnectError::NegativeRefresh`] or [`ConnectError::InvalidRefresh`] for a bad refresh
    /// interval, [`ConnectError::InvalidPrefix`] for a bad prefix, and
    /// [`ConnectError::InvalidResolverAddress`] for a bad resolver address.
    pub fn parse(uri: &str) -> Result<Self> {
        let url = url::Url::parse(uri).map_err(|e| ConnectError::InvalidTarget {
            target: uri.to_string(),
            message: e.to_string(),
        })?;

        let path = url.path();
        let endpoint = path.strip_prefix('/').unwrap_or(path);
        let mut target = Self::new(url.scheme(), endpoint);

        let query = |key: &str| {
            url.query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(refresh) = query("refresh") {
            target.refresh = parse_refresh(&refresh)?;
        }
        if let Some(prefix) = query("prefix") {
            target.prefix = prefix.parse()?;
        }
        if let Some(resolver) = query("resolver") {
            target.resolver_address = Some(parse_resolver_address(&resolver)?);
        }
        Ok(target)
    }

    /// Sets the refresh interval.
    #[must_use]
    pub fn with_refresh(mut self, refresh: Duration) -> Self {
        self.refresh = refresh;
        self
    }

    /// Sets the address prefix filter.
    #[must_use]
    pub fn with_prefix(mut self, prefix: AddrPrefix) -> Self {
        self.prefix = prefix;
        self
    }

    /// Sets the DNS server override.
    #[must_use]
    pub fn with_resolver_address(mut self, addr: SocketAddr) -> Self {
        self.resolver_address = Some(addr);
        self
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The `host:port` part of the URI.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn refresh(&self) -> Duration {
        self.refresh
    }

    pub fn prefix(&self) -> AddrPrefix {
        self.prefix
    }

    pub fn resolver_address(&self) -> Option<SocketAddr> {
        self.resolver_address
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:///{}", self.scheme, self.endpoint)?;

        let mut query = url::form_urlencoded::Serializer::new(String::new());
        if !self.refresh.is_zero() {
            query.append_pair("refresh", &format!("{}ms", self.refresh.as_millis()));
        }
        if !self.prefix.is_catch_all() {
            query.append_pair("prefix", &self.prefix.to_string());
        }
        if let Some(resolver) = self.resolver_address {
            query.append_pair("resolver", &resolver.to_string());
        }
        let query = query.finish();
        if !query.is_empty() {
            write!(f, "?{query}")?;
        }
        Ok(())
    }
}

/// Parses a refresh interval. A leading `-` marks a negative interval, which is rejected unless
/// it is zero.
fn parse_refresh(value: &str) -> Result<Duration> {
    let (negative, magnitude) = match value.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, value.strip_prefix('+').unwrap_or(value)),
    };
    let refresh = humantime::parse_duration(magnitude).context(InvalidRefreshSnafu { value })?;
    if negative && !refresh.is_zero() {
        return Err(ConnectError::NegativeRefresh);
    }
    Ok(refresh)
}

/// Parses a DNS server address: `ip:port`, `[ipv6]:port`, or a bare IP on port 53.
///
/// # Errors
///
/// Returns [`ConnectError::InvalidResolverAddress`] for anything else.
pub fn parse_resolver_address(addr: &str) -> Result<SocketAddr> {
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok(socket);
    }
    addr.parse::<std::net::IpAddr>()
        .map(|ip| SocketAddr::new(ip, 53))
        .map_err(|_| ConnectError::InvalidResolverAddress { address: addr.to_string() })
}
