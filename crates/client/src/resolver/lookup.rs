//! Host lookups backed by hickory-resolver.

use std::net::SocketAddr;

use futures::future::BoxFuture;
use hickory_resolver::{
    ResolveError, ResolveErrorKind, Resolver, TokioResolver,
    config::{NameServerConfigGroup, ResolverConfig},
    name_server::TokioConnectionProvider,
    proto::ProtoErrorKind,
};
use snafu::{ResultExt, Snafu};

use crate::error::{DnsConfigSnafu, Result};

/// How a failed lookup should be treated by the resolution loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupErrorKind {
    /// The query timed out.
    Timeout,
    /// A transient failure such as a refused connection or a busy server.
    Temporary,
    /// The name exists without the requested records, or does not exist.
    NotFound,
    /// Any other failure.
    Other,
}

/// A failed host lookup.
#[derive(Debug, Snafu)]
#[snafu(display("{message}"))]
pub struct LookupError {
    kind: LookupErrorKind,
    message: String,
}

impl LookupError {
    /// Creates a lookup error of the given kind.
    pub fn new(kind: LookupErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Returns the failure classification.
    #[must_use]
    pub fn kind(&self) -> LookupErrorKind {
        self.kind
    }

    /// Returns true if the failure should be reported upstream.
    ///
    /// Timeouts and temporary failures are reported so callers can back off and retry. Other
    /// failures usually mean the record type is absent and are suppressed.
    #[must_use]
    pub fn is_reportable(&self) -> bool {
        matches!(self.kind, LookupErrorKind::Timeout | LookupErrorKind::Temporary)
    }
}

impl From<ResolveError> for LookupError {
    fn from(err: ResolveError) -> Self {
        let kind = if err.is_no_records_found() || err.is_nx_domain() {
            LookupErrorKind::NotFound
        } else {
            match err.kind() {
                ResolveErrorKind::Proto(proto) => match proto.kind() {
                    ProtoErrorKind::Timeout => LookupErrorKind::Timeout,
                    ProtoErrorKind::Io(_) | ProtoErrorKind::Busy | ProtoErrorKind::NoConnections => {
                        LookupErrorKind::Temporary
                    },
                    _ => LookupErrorKind::Other,
                },
                _ => LookupErrorKind::Other,
            }
        };
        Self { kind, message: err.to_string() }
    }
}

/// Resolves host names to textual IP addresses.
///
/// Implementations return address strings rather than parsed IPs; the resolution loop parses
/// them and rejects a batch containing anything that is not an IP.
pub trait HostLookup: Send + Sync + 'static {
    /// Looks up all addresses for `host`.
    fn lookup_host<'a>(
        &'a self,
        host: &'a str,
    ) -> BoxFuture<'a, std::result::Result<Vec<String>, LookupError>>;
}

/// [`HostLookup`] that queries DNS directly, bypassing any caching.
pub struct HickoryLookup {
    resolver: TokioResolver,
}

impl HickoryLookup {
    /// Builds a lookup from the system configuration (`/etc/resolv.conf` or platform
    /// equivalent).
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::DnsConfig`](crate::ConnectError::DnsConfig) if the system
    /// configuration cannot be read.
    pub fn from_system_conf() -> Result<Self> {
        let mut builder = TokioResolver::builder_tokio().context(DnsConfigSnafu)?;
        builder.options_mut().cache_size = 0;
        Ok(Self { resolver: builder.build() })
    }

    /// Builds a lookup that sends every query to a single plaintext name server.
    #[must_use]
    pub fn with_name_server(server: SocketAddr) -> Self {
        let group = NameServerConfigGroup::from_ips_clear(&[server.ip()], server.port(), true);
        let config = ResolverConfig::from_parts(None, vec![], group);
        let mut builder =
            Resolver::builder_with_config(config, TokioConnectionProvider::default());
        builder.options_mut().cache_size = 0;
        Self { resolver: builder.build() }
    }
}

impl std::fmt::Debug for HickoryLookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HickoryLookup").finish_non_exhaustive()
    }
}

impl HostLookup for HickoryLookup {
    fn lookup_host<'a>(
        &'a self,
        host: &'a str,
    ) -> BoxFuture<'a, std::result::Result<Vec<String>, LookupError>> {
        Box::pin(async move {
            let lookup = self.resolver.lookup_ip(host).await?;
            Ok(lookup.iter().map(|ip| ip.to_string()).collect())
        })
    }
}
