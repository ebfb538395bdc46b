//! TLS configuration for fleet connections.
//!
//! The transport speaks plaintext HTTP/2 at the framework layer; when a [`TlsConfig`] is present
//! the connector performs the TLS handshake itself on every new socket, using the
//! `rustls::ClientConfig` built here.

use std::{path::Path, sync::Arc};

use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
};
use tracing::warn;

use crate::error::{ConnectError, Result};

/// TLS configuration for secure connections.
///
/// # Example
///
/// ```no_run
/// # use dnsfleet_client::TlsConfig;
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // Server verification against a private CA
/// let tls = TlsConfig::new().with_ca_cert_pem_file("/etc/fleet/ca.pem")?;
///
/// // Mutual TLS with a pinned server name
/// let mtls = TlsConfig::with_native_roots()
///     .with_client_cert_pem_bytes(std::fs::read("client.pem")?, std::fs::read("client.key")?)
///     .with_server_name("db.fleet.internal");
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA certificate for server verification.
    ca_cert: Option<CertificateData>,

    /// Client certificate for mutual TLS.
    client_cert: Option<CertificateData>,

    /// Client private key (PEM) for mutual TLS.
    client_key: Option<Vec<u8>>,

    /// Name to verify the server certificate against.
    /// If not set, the host of the dial target is used.
    server_name: Option<String>,

    /// Whether to trust the platform's native root certificates.
    use_native_roots: bool,

    /// Skips server certificate verification entirely.
    insecure_skip_verify: bool,
}

/// Certificate data that can be either PEM or DER encoded.
#[derive(Debug, Clone)]
pub enum CertificateData {
    /// PEM-encoded certificate data, possibly holding a chain.
    Pem(Vec<u8>),
    /// A single DER-encoded certificate.
    Der(Vec<u8>),
}

impl CertificateData {
    /// Decodes the data into DER certificates.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Tls`] if the PEM is malformed or holds no certificate.
    pub fn to_der_chain(&self) -> Result<Vec<CertificateDer<'static>>> {
        match self {
            Self::Pem(pem) => {
                let certs = rustls_pemfile::certs(&mut pem.as_slice())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| ConnectError::Tls { message: format!("invalid PEM: {e}") })?;
                if certs.is_empty() {
                    return Err(ConnectError::Tls { message: "no certificates found".to_string() });
                }
                Ok(certs)
            },
            Self::Der(der) => Ok(vec![CertificateDer::from(der.clone())]),
        }
    }
}

impl TlsConfig {
    /// Creates an empty TLS configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a TLS configuration that trusts the platform's native root certificates.
    #[must_use]
    pub fn with_native_roots() -> Self {
        Self { use_native_roots: true, ..Self::default() }
    }

    /// Sets the CA certificate from a PEM file.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Tls`] if the file cannot be read or holds no certificate.
    pub fn with_ca_cert_pem_file(mut self, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let pem = std::fs::read(path).map_err(|e| ConnectError::Tls {
            message: format!("reading {}: {e}", path.display()),
        })?;
        let cert = CertificateData::Pem(pem);
        cert.to_der_chain()?;
        self.ca_cert = Some(cert);
        Ok(self)
    }

    /// Sets the CA certificate from PEM bytes.
    #[must_use]
    pub fn with_ca_cert_pem_bytes(mut self, pem: impl AsRef<[u8]>) -> Self {
        self.ca_cert = Some(CertificateData::Pem(pem.as_ref().to_vec()));
        self
    }

    /// Sets the CA certificate from DER bytes.
    #[must_use]
    pub fn with_ca_cert_der_bytes(mut self, der: impl AsRef<[u8]>) -> Self {
        self.ca_cert = Some(CertificateData::Der(der.as_ref().to_vec()));
        self
    }

    /// Sets the client certificate and PEM private key for mutual TLS.
    #[must_use]
    pub fn with_client_cert_pem_bytes(
        mut self,
        cert: impl AsRef<[u8]>,
        key: impl AsRef<[u8]>,
    ) -> Self {
        self.client_cert = Some(CertificateData::Pem(cert.as_ref().to_vec()));
        self.client_key = Some(key.as_ref().to_vec());
        self
    }

    /// Sets the name the server certificate must match.
    #[must_use]
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    /// Disables server certificate verification. Only for tests and debugging.
    #[must_use]
    pub fn with_insecure_skip_verify(mut self) -> Self {
        self.insecure_skip_verify = true;
        self
    }

    /// Returns the server name override, if any.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.server_name.as_deref()
    }

    #[must_use]
    pub fn insecure_skip_verify(&self) -> bool {
        self.insecure_skip_verify
    }

    /// Validates the TLS configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Config`] if a client certificate has no key, or if there is no
    /// way to verify the server (no CA, no native roots, verification not disabled).
    pub fn validate(&self) -> Result<()> {
        if self.client_cert.is_some() && self.client_key.is_none() {
            return Err(ConnectError::Config {
                message: "client certificate requires a private key".to_string(),
            });
        }
        if self.ca_cert.is_none() && !self.use_native_roots && !self.insecure_skip_verify {
            return Err(ConnectError::Config {
                message: "TLS requires either a CA certificate or native roots".to_string(),
            });
        }
        Ok(())
    }

    /// Picks the name to verify for a dial target host.
    ///
    /// The explicit override wins; otherwise the target host is used.
    pub(crate) fn server_name_for(&self, target_host: &str) -> String {
        self.server_name.clone().unwrap_or_else(|| target_host.to_string())
    }

    /// Builds the rustls client configuration, advertising HTTP/2 over ALPN.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Config`] from [`validate`](Self::validate), or
    /// [`ConnectError::Tls`] if certificates or keys cannot be loaded.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        self.validate()?;

        let provider = Arc::new(ring::default_provider());
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .map_err(tls_error)?;

        let builder = if self.insecure_skip_verify {
            warn!("TLS server certificate verification is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
        } else {
            builder.with_root_certificates(self.root_store()?)
        };

        let mut config = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => {
                let key = load_private_key(key)?;
                builder.with_client_auth_cert(cert.to_der_chain()?, key).map_err(tls_error)?
            },
            _ => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Arc::new(config))
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        if let Some(ca) = &self.ca_cert {
            for cert in ca.to_der_chain()? {
                roots.add(cert).map_err(tls_error)?;
            }
        }
        if self.use_native_roots {
            let native = rustls_native_certs::load_native_certs();
            for err in &native.errors {
                warn!(error = %err, "Error loading native certificate");
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            if ignored > 0 {
                warn!(added, ignored, "Some native root certificates were unusable");
            }
        }
        Ok(roots)
    }
}

fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| ConnectError::Tls { message: format!("invalid private key PEM: {e}") })?
        .ok_or_else(|| ConnectError::Tls { message: "no private key found".to_string() })
}

fn tls_error(err: rustls::Error) -> ConnectError {
    ConnectError::Tls { message: err.to_string() }
}

/// Parses `name` into a rustls server name (DNS name or IP address).
pub(crate) fn parse_server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| ConnectError::Tls { message: format!("invalid server name '{name}': {e}") })
}

/// Accepts any server certificate. Signatures are still checked with the provider's
/// algorithms so the handshake stays well-formed.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
