//! Dial options for connection pools.
//!
//! [`ClientOptions`] carries everything [`dial`](crate::dial) needs. It is built through a
//! validating builder, or converted from [`ClientSettings`], the serializable subset loaded from
//! configuration files.

use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tonic::transport::Endpoint;

use crate::{
    auth::Authorization,
    error::{ConnectError, Result},
    resolver::{AddrPrefix, parse_resolver_address},
    tls::TlsConfig,
};

/// Default maximum size of a single RPC message (100 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Extra endpoint configuration applied after the built-in settings.
#[derive(Clone)]
pub struct EndpointOption(Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>);

impl EndpointOption {
    /// Wraps an endpoint transformation.
    pub fn new(f: impl Fn(Endpoint) -> Endpoint + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub(crate) fn apply(&self, endpoint: Endpoint) -> Endpoint {
        (self.0)(endpoint)
    }
}

impl fmt::Debug for EndpointOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EndpointOption(..)")
    }
}

/// Options controlling how a pool is dialed.
///
/// # Validation Rules
///
/// - `connect_timeout` must be > 0
/// - `max_message_size` must be > 0
/// - `address_prefix` must be CIDR notation
/// - `resolver_address` must be `ip:port` or a bare IP
///
/// # Example
///
/// ```no_run
/// # use std::time::Duration;
/// # use dnsfleet_client::ClientOptions;
/// let options = ClientOptions::builder()
///     .pool_size(4)
///     .refresh_interval(Duration::from_secs(30))
///     .address_prefix("10.0.0.0/8".to_string())
///     .build()
///     .expect("valid options");
/// ```
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pool_size: usize,
    refresh_interval: Duration,
    address_prefix: Option<String>,
    keepalive_time: Duration,
    keepalive_timeout: Duration,
    compression: bool,
    compressor: String,
    round_robin: bool,
    connect_timeout: Duration,
    resolver_address: Option<String>,
    max_message_size: usize,
    connect_eagerly: bool,
    tls: Option<TlsConfig>,
    authorization: Option<Authorization>,
    headers: Vec<(String, String)>,
    endpoint_options: Vec<EndpointOption>,
    retry_policy: RetryPolicy,
}

#[bon::bon]
impl ClientOptions {
    /// Creates validated dial options.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Config`] if a value is out of range,
    /// [`ConnectError::InvalidPrefix`] for a malformed prefix, or
    /// [`ConnectError::InvalidResolverAddress`] for a malformed resolver address.
    #[builder]
    pub fn new(
        #[builder(default = default_pool_size())] pool_size: usize,
        #[builder(default)] refresh_interval: Duration,
        address_prefix: Option<String>,
        #[builder(default = default_keepalive())] keepalive_time: Duration,
        #[builder(default = default_keepalive())] keepalive_timeout: Duration,
        #[builder(default)] compression: bool,
        #[builder(default = default_compressor(), into)] compressor: String,
        #[builder(default = true)] round_robin: bool,
        #[builder(default = default_connect_timeout())] connect_timeout: Duration,
        resolver_address: Option<String>,
        #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)] max_message_size: usize,
        #[builder(default)] connect_eagerly: bool,
        tls: Option<TlsConfig>,
        authorization: Option<Authorization>,
        #[builder(default)] headers: Vec<(String, String)>,
        #[builder(default)] endpoint_options: Vec<EndpointOption>,
        #[builder(default)] retry_policy: RetryPolicy,
    ) -> Result<Self> {
        let options = Self {
            pool_size,
            refresh_interval,
            address_prefix,
            keepalive_time,
            keepalive_timeout,
            compression,
            compressor,
            round_robin,
            connect_timeout,
            resolver_address,
            max_message_size,
            connect_eagerly,
            tls,
            authorization,
            headers,
            endpoint_options,
            retry_policy,
        };
        options.validate()?;
        Ok(options)
    }
}

impl ClientOptions {
    /// Validates the option values.
    ///
    /// # Errors
    ///
    /// See [`ClientOptions::new`].
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(ConnectError::Config {
                message: "connect_timeout cannot be zero".to_string(),
            });
        }
        if self.max_message_size == 0 {
            return Err(ConnectError::Config {
                message: "max_message_size must be > 0".to_string(),
            });
        }
        if self.compressor.is_empty() {
            return Err(ConnectError::Config { message: "compressor cannot be empty".to_string() });
        }
        if let Some(prefix) = self.address_prefix.as_deref().filter(|p| !p.is_empty()) {
            prefix.parse::<AddrPrefix>()?;
        }
        if let Some(resolver) = &self.resolver_address {
            parse_resolver_address(resolver)?;
        }
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        Ok(())
    }

    /// Number of connections in the pool. Zero and one both mean a single connection.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// DNS refresh interval; zero disables periodic refresh.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// CIDR prefix resolved addresses must fall into. Empty means no filtering.
    #[must_use]
    pub fn address_prefix(&self) -> Option<&str> {
        self.address_prefix.as_deref().filter(|p| !p.is_empty())
    }

    #[must_use]
    pub fn keepalive_time(&self) -> Duration {
        self.keepalive_time
    }

    #[must_use]
    pub fn keepalive_timeout(&self) -> Duration {
        self.keepalive_timeout
    }

    /// Whether calls are compressed with [`compressor`](Self::compressor).
    #[must_use]
    pub fn compression(&self) -> bool {
        self.compression
    }

    #[must_use]
    pub fn compressor(&self) -> &str {
        &self.compressor
    }

    /// Whether a pool hands out its members in rotation.
    #[must_use]
    pub fn round_robin(&self) -> bool {
        self.round_robin
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn resolver_address(&self) -> Option<&str> {
        self.resolver_address.as_deref()
    }

    #[must_use]
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Whether [`dial`](crate::dial) establishes every connection before returning, retrying
    /// under [`retry_policy`](Self::retry_policy). Otherwise connections are made on first use.
    #[must_use]
    pub fn connect_eagerly(&self) -> bool {
        self.connect_eagerly
    }

    #[must_use]
    pub fn tls(&self) -> Option<&TlsConfig> {
        self.tls.as_ref()
    }

    #[must_use]
    pub fn authorization(&self) -> Option<&Authorization> {
        self.authorization.as_ref()
    }

    /// Extra headers attached to every call.
    #[must_use]
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    #[must_use]
    pub fn endpoint_options(&self) -> &[EndpointOption] {
        &self.endpoint_options
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Returns true if dialing goes through the `ps-dns` resolver rather than a direct
    /// connection.
    #[must_use]
    pub fn uses_resolver(&self) -> bool {
        !self.refresh_interval.is_zero()
            || self.address_prefix().is_some()
            || self.resolver_address.is_some()
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            refresh_interval: Duration::ZERO,
            address_prefix: None,
            keepalive_time: default_keepalive(),
            keepalive_timeout: default_keepalive(),
            compression: false,
            compressor: default_compressor(),
            round_robin: true,
            connect_timeout: default_connect_timeout(),
            resolver_address: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_eagerly: false,
            tls: None,
            authorization: None,
            headers: Vec::new(),
            endpoint_options: Vec::new(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

fn default_pool_size() -> usize {
    1
}

fn default_keepalive() -> Duration {
    Duration::from_secs(10)
}

fn default_compressor() -> String {
    "gzip".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(5)
}

// =========================================================================
// ClientSettings
// =========================================================================

/// Serializable dial settings, as found in configuration files.
///
/// TLS material, credentials and endpoint hooks are not representable here; attach them with
/// the [`ClientOptions`] builder instead.
///
/// ```
/// # use dnsfleet_client::ClientSettings;
/// let settings: ClientSettings = serde_json::from_str(
///     r#"{"pool_size": 4, "refresh_interval": "30s", "address_prefix": "10.0.0.0/8"}"#,
/// )
/// .expect("valid settings");
/// let options = settings.into_options().expect("valid options");
/// assert_eq!(options.pool_size(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSettings {
    /// Number of connections in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// DNS refresh interval; `0s` disables periodic refresh.
    #[serde(default)]
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// CIDR prefix resolved addresses must fall into.
    #[serde(default)]
    pub address_prefix: Option<String>,
    /// Interval between keepalive pings.
    #[serde(default = "default_keepalive")]
    #[serde(with = "humantime_serde")]
    pub keepalive_time: Duration,
    /// How long to wait for a keepalive acknowledgement.
    #[serde(default = "default_keepalive")]
    #[serde(with = "humantime_serde")]
    pub keepalive_timeout: Duration,
    /// Whether to compress calls.
    #[serde(default)]
    pub compression: bool,
    /// Registered compressor name.
    #[serde(default = "default_compressor")]
    pub compressor: String,
    /// Whether to rotate through pool members.
    #[serde(default = "default_round_robin")]
    pub round_robin: bool,
    /// Connection establishment timeout.
    #[serde(default = "default_connect_timeout")]
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// DNS server to query instead of the system resolver.
    #[serde(default)]
    pub resolver_address: Option<String>,
    /// Maximum message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// Whether to connect before `dial` returns.
    #[serde(default)]
    pub connect_eagerly: bool,
}

fn default_round_robin() -> bool {
    true
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            refresh_interval: Duration::ZERO,
            address_prefix: None,
            keepalive_time: default_keepalive(),
            keepalive_timeout: default_keepalive(),
            compression: false,
            compressor: default_compressor(),
            round_robin: true,
            connect_timeout: default_connect_timeout(),
            resolver_address: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_eagerly: false,
        }
    }
}

impl ClientSettings {
    /// Converts the settings into validated [`ClientOptions`].
    ///
    /// # Errors
    ///
    /// See [`ClientOptions::new`].
    pub fn into_options(self) -> Result<ClientOptions> {
        ClientOptions::builder()
            .pool_size(self.pool_size)
            .refresh_interval(self.refresh_interval)
            .maybe_address_prefix(self.address_prefix)
            .keepalive_time(self.keepalive_time)
            .keepalive_timeout(self.keepalive_timeout)
            .compression(self.compression)
            .compressor(self.compressor)
            .round_robin(self.round_robin)
            .connect_timeout(self.connect_timeout)
            .maybe_resolver_address(self.resolver_address)
            .max_message_size(self.max_message_size)
            .connect_eagerly(self.connect_eagerly)
            .build()
    }
}

impl TryFrom<ClientSettings> for ClientOptions {
    type Error = ConnectError;

    fn try_from(settings: ClientSettings) -> Result<Self> {
        settings.into_options()
    }
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

// =========================================================================
// RetryPolicy
// =========================================================================

/// Retry policy for connection establishment.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    pub max_attempts: u32,

    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    pub max_backoff: Duration,

    /// Backoff multiplier for exponential increase.
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0) for randomizing backoff.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy builder.
    #[must_use]
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Creates a policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self { max_attempts: 1, ..Default::default() }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Sets the maximum number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Sets the initial backoff duration.
    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    /// Sets the maximum backoff duration.
    #[must_use]
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Sets the jitter factor (0.0 to 1.0).
    #[must_use]
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Builds the retry policy.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            initial_backoff: self.initial_backoff.unwrap_or(defaults.initial_backoff),
            max_backoff: self.max_backoff.unwrap_or(defaults.max_backoff),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
            jitter: self.jitter.unwrap_or(defaults.jitter),
        }
    }
}
