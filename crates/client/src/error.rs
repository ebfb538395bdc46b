//! Error types for resolution, caching, and dialing.
//!
//! Two error families are exposed:
//! - [`ConnectError`]: configuration, DNS, TLS and transport failures raised while building
//!   resolvers and dialing pools.
//! - [`ConnSetError`]: failures of the [`ConnSet`](crate::ConnSet) cache, which carry the
//!   injected dialer's error verbatim.

use std::net::AddrParseError;

use snafu::{Location, Snafu};

/// Result type alias for connectivity operations.
pub type Result<T, E = ConnectError> = std::result::Result<T, E>;

/// Errors raised while building resolvers and establishing connections.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConnectError {
    /// The target string was empty.
    #[snafu(display("dns resolver: missing address"))]
    MissingAddress,

    /// The target ended with the host/port separator but carried no port.
    #[snafu(display("dns resolver: missing port after port-separator colon"))]
    EndsWithColon,

    /// A negative refresh interval was requested.
    #[snafu(display("dns resolver: negative refresh interval"))]
    NegativeRefresh,

    /// The target could not be split into host and port.
    #[snafu(display("invalid target address {target}: {message}"))]
    InvalidTarget {
        /// The rejected target.
        target: String,
        /// Why the split failed.
        message: String,
    },

    /// The `refresh` query value was not a duration.
    #[snafu(display("dns resolver: invalid refresh interval '{value}': {source}"))]
    InvalidRefresh {
        /// The rejected value.
        value: String,
        /// Parse failure.
        source: humantime::DurationError,
    },

    /// The address prefix was not valid CIDR notation.
    #[snafu(display("invalid address prefix '{prefix}': {message}"))]
    InvalidPrefix {
        /// The rejected prefix.
        prefix: String,
        /// Why parsing failed.
        message: String,
    },

    /// The resolver override was neither `ip:port` nor a bare IP.
    #[snafu(display("invalid resolver address '{address}'"))]
    InvalidResolverAddress {
        /// The rejected address.
        address: String,
    },

    /// No resolver builder is registered for the target's scheme.
    #[snafu(display("no resolver registered for scheme '{scheme}'"))]
    UnknownScheme {
        /// The unregistered scheme.
        scheme: String,
    },

    /// A DNS lookup failed with a reportable (transient) error.
    #[snafu(display("dns: A record lookup error for {host}: {message}"))]
    DnsLookup {
        /// Host being resolved.
        host: String,
        /// Failure description.
        message: String,
    },

    /// A lookup returned something that is not an IP address.
    #[snafu(display("dns: error parsing A record IP address {address}: {source}"))]
    AddressParse {
        /// The unparsable record value.
        address: String,
        /// Parse failure.
        source: AddrParseError,
    },

    /// The DNS client could not be constructed.
    #[snafu(display("dns: resolver configuration error: {source}"))]
    DnsConfig {
        /// Underlying resolver error.
        source: hickory_resolver::ResolveError,
    },

    /// No resolved address became available before the connect timeout.
    #[snafu(display("no addresses resolved for {target}"))]
    NoAddresses {
        /// Target awaiting resolution.
        target: String,
    },

    /// Compression was requested with a compressor missing from the registry.
    #[snafu(display("{name} compressor not installed"))]
    UnregisteredCompressor {
        /// Requested compressor name.
        name: String,
    },

    /// The transport endpoint could not be built from a URI.
    #[snafu(display("invalid endpoint '{uri}': {source}"))]
    InvalidEndpoint {
        /// Rejected URI.
        uri: String,
        /// Underlying transport error.
        source: tonic::transport::Error,
    },

    /// Transport-level error (TCP, HTTP/2).
    #[snafu(display("Transport error at {location}: {source}"))]
    Transport {
        /// Underlying transport error.
        source: tonic::transport::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// TLS material could not be loaded or applied.
    #[snafu(display("TLS error: {message}"))]
    Tls {
        /// Error description.
        message: String,
    },

    /// Configuration validation error.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },

    /// An `Authorization` value could not be parsed.
    #[snafu(display("malformed Authorization"))]
    MalformedAuthorization,

    /// The MySQL password hash length matched no known algorithm.
    #[snafu(display("unknown MySQL password hashing algorithm"))]
    InvalidMysqlAlgorithm,

    /// The connection was closed with [`ClientConn::close`](crate::ClientConn::close).
    #[snafu(display("connection is closed"))]
    ConnectionClosed,

    /// Connection establishment kept failing until the retry budget ran out.
    #[snafu(display("Retry exhausted after {attempts} attempts: {last_error}"))]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Last error message before giving up.
        last_error: String,
    },
}

impl ConnectError {
    /// Returns true if establishing the connection again may succeed.
    ///
    /// Transport failures and transient DNS failures are retryable; configuration and
    /// credential errors are not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::DnsLookup { .. } | Self::NoAddresses { .. } => true,
            Self::MissingAddress
            | Self::EndsWithColon
            | Self::NegativeRefresh
            | Self::InvalidTarget { .. }
            | Self::InvalidRefresh { .. }
            | Self::InvalidPrefix { .. }
            | Self::InvalidResolverAddress { .. }
            | Self::UnknownScheme { .. }
            | Self::AddressParse { .. }
            | Self::DnsConfig { .. }
            | Self::UnregisteredCompressor { .. }
            | Self::InvalidEndpoint { .. }
            | Self::Tls { .. }
            | Self::Config { .. }
            | Self::MalformedAuthorization
            | Self::InvalidMysqlAlgorithm
            | Self::ConnectionClosed
            | Self::RetryExhausted { .. } => false,
        }
    }
}

/// Errors returned by [`ConnSet`](crate::ConnSet) operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConnSetError<E>
where
    E: std::error::Error + 'static,
{
    /// The set was closed with [`ConnSet::close`](crate::ConnSet::close).
    #[snafu(display("connset is closed"))]
    Closed,

    /// The injected dialer failed.
    #[snafu(display("{source}"))]
    Dial {
        /// The dialer's error, unmodified.
        source: E,
    },
}

impl<E> ConnSetError<E>
where
    E: std::error::Error + 'static,
{
    /// Returns true if this is the closed-set error.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Returns the dialer error, if this wraps one.
    #[must_use]
    pub fn dial_error(&self) -> Option<&E> {
        match self {
            Self::Dial { source } => Some(source),
            Self::Closed => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_resolver_error_messages() {
        assert_eq!(ConnectError::MissingAddress.to_string(), "dns resolver: missing address");
        assert_eq!(
            ConnectError::EndsWithColon.to_string(),
            "dns resolver: missing port after port-separator colon"
        );
        assert_eq!(
            ConnectError::NegativeRefresh.to_string(),
            "dns resolver: negative refresh interval"
        );
    }

    #[test]
    fn test_compressor_error_names_compressor() {
        let err = ConnectError::UnregisteredCompressor { name: "snappy".to_string() };
        assert_eq!(err.to_string(), "snappy compressor not installed");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(
            ConnectError::DnsLookup { host: "db".into(), message: "timed out".into() }
                .is_retryable()
        );
        assert!(ConnectError::NoAddresses { target: "db:443".into() }.is_retryable());
        assert!(!ConnectError::MissingAddress.is_retryable());
        assert!(!ConnectError::Config { message: "bad".into() }.is_retryable());
        assert!(!ConnectError::MalformedAuthorization.is_retryable());
    }

    #[test]
    fn test_connset_closed_display() {
        let err: ConnSetError<std::io::Error> = ConnSetError::Closed;
        assert_eq!(err.to_string(), "connset is closed");
        assert!(err.is_closed());
        assert!(err.dial_error().is_none());
    }

    #[test]
    fn test_connset_dial_error_is_verbatim() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = ConnSetError::Dial { source: io };
        assert_eq!(err.to_string(), "refused");
        assert_eq!(
            err.dial_error().map(std::io::Error::kind),
            Some(std::io::ErrorKind::ConnectionRefused)
        );
    }
}
