//! Client-side RPC connectivity for services addressed through DNS.
//!
//! A fleet of servers behind one DNS name is reached by resolving the name periodically,
//! filtering the answers to a network prefix, and keeping one HTTP/2 channel per address.
//!
//! # Features
//!
//! - **`ps-dns` resolver**: periodic DNS refresh, CIDR prefix filtering with fallback, custom DNS
//!   server, on-demand re-resolution
//! - **Connection cache**: [`ConnSet`] deduplicates dials per address, tracks leases, and evicts
//!   idle connections
//! - **Connection pools**: [`dial`] builds a single connection or a round-robin pool with TLS,
//!   keepalive, compression, and per-call credentials
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use dnsfleet_client::{Authorization, ClientOptions, Registry, dial};
//!
//! # async fn example() -> dnsfleet_client::Result<()> {
//! let options = ClientOptions::builder()
//!     .pool_size(2)
//!     .refresh_interval(Duration::from_secs(30))
//!     .address_prefix("10.0.0.0/8".to_string())
//!     .authorization(Authorization::basic("app", "secret"))
//!     .build()?;
//!
//! let pool = dial(&Registry::with_defaults(), "db.fleet.internal:3306", &options).await?;
//! let grpc = pool.get().grpc().await?;
//! // ... issue calls with `grpc` or a generated client ...
//! pool.close().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ConnPool<ClientConn> (dial)                 │
//! │   Round-robin members │ Auth interceptor │ Call policy      │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Registry                                  │
//! │   Resolver builders by scheme │ Compressors by name         │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   ps-dns Resolver                           │
//! │   Refresh loop │ Prefix filter │ resolve_now coalescing     │
//! ├─────────────────────────────────────────────────────────────┤
//! │                   Transport                                 │
//! │   TCP connector │ rustls handshake │ Lazy tonic channels    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]

mod auth;
mod client_cache;
mod config;
mod connset;
mod error;
mod options;
mod pool;
mod registry;
pub mod resolver;
mod retry;
mod tls;
mod transport;

pub use auth::{AuthInterceptor, AuthType, Authorization};
pub use client_cache::ClientCache;
pub use config::ConnectionConfig;
pub use connset::{Closer, ConnSet, Dialer};
pub use error::{ConnSetError, ConnectError, Result};
pub use options::{
    ClientOptions, ClientSettings, DEFAULT_MAX_MESSAGE_SIZE, EndpointOption, RetryPolicy,
    RetryPolicyBuilder,
};
pub use pool::{CallPolicy, ClientConn, ConnPool, RoundRobin, dial};
pub use registry::Registry;
pub use resolver::{
    AddrPrefix, DnsResolverBuilder, HickoryLookup, HostLookup, LookupError, LookupErrorKind,
    ResolvedAddress, Resolver, ResolverBuilder, ResolverState, Target, UpdateSink,
};
pub use retry::with_retry;
pub use tls::{CertificateData, TlsConfig};
pub use transport::{MaybeTlsStream, TransportConnector};
