//! Resolver and compressor registration.

use std::{collections::HashMap, fmt, sync::Arc};

use tonic::codec::CompressionEncoding;
use tracing::debug;

use crate::{
    error::{ConnectError, Result},
    resolver::{DnsResolverBuilder, Resolver, ResolverBuilder, Target, UpdateSink},
};

/// Resolver builders by URI scheme and compression encodings by name.
///
/// Dial sites take a registry by reference, so tests and embedders can install their own
/// resolvers without touching process-wide state.
#[derive(Clone, Default)]
pub struct Registry {
    resolvers: HashMap<String, Arc<dyn ResolverBuilder>>,
    compressors: HashMap<String, CompressionEncoding>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the `ps-dns` resolver and the `gzip` and `zstd` compressors.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_resolver(Arc::new(DnsResolverBuilder::new()));
        registry.register_compressor("gzip", CompressionEncoding::Gzip);
        registry.register_compressor("zstd", CompressionEncoding::Zstd);
        registry
    }

    /// Registers a resolver builder under its scheme, replacing any previous one.
    pub fn register_resolver(&mut self, builder: Arc<dyn ResolverBuilder>) {
        let scheme = builder.scheme().to_string();
        debug!(scheme = %scheme, "Registering resolver");
        self.resolvers.insert(scheme, builder);
    }

    /// Registers a compression encoding under `name`.
    pub fn register_compressor(&mut self, name: impl Into<String>, encoding: CompressionEncoding) {
        self.compressors.insert(name.into(), encoding);
    }

    /// Looks up a compressor.
    #[must_use]
    pub fn compressor(&self, name: &str) -> Option<CompressionEncoding> {
        self.compressors.get(name).copied()
    }

    /// Looks up the resolver builder for a scheme.
    #[must_use]
    pub fn resolver_builder(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.resolvers.get(scheme).cloned()
    }

    /// Parses `uri` and builds a resolver with the builder registered for its scheme.
    ///
    /// # Errors
    ///
    /// Returns the target parse error, [`ConnectError::UnknownScheme`] if nothing is registered
    /// for the scheme, or the builder's own error.
    pub fn build_resolver(
        &self,
        uri: &str,
        sink: Arc<dyn UpdateSink>,
    ) -> Result<Box<dyn Resolver>> {
        let target = Target::parse(uri)?;
        let builder = self
            .resolvers
            .get(target.scheme())
            .ok_or_else(|| ConnectError::UnknownScheme { scheme: target.scheme().to_string() })?;
        builder.build(&target, sink)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.resolvers.keys().collect();
        schemes.sort();
        let mut compressors: Vec<_> = self.compressors.keys().collect();
        compressors.sort();
        f.debug_struct("Registry")
            .field("schemes", &schemes)
            .field("compressors", &compressors)
            .finish()
    }
}
