//! Socket connector used by every channel.
//!
//! Channels are built with plaintext `http://` URIs; TLS, when configured, is layered on here
//! so each resolved address can be dialed by IP while the certificate is still checked against
//! the original host name.

use std::{
    future::Future,
    io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use hyper_util::rt::TokioIo;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{ClientConfig, pki_types::ServerName},
};
use tonic::transport::Uri;
use tower::Service;
use tracing::trace;

/// A TCP stream, optionally wrapped in a client TLS session.
#[derive(Debug)]
pub enum MaybeTlsStream {
    /// Plaintext TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Clone)]
struct TlsSettings {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

/// Connector for tonic channels: TCP with `TCP_NODELAY`, then an optional TLS handshake.
#[derive(Clone, Default)]
pub struct TransportConnector {
    tls: Option<TlsSettings>,
}

impl TransportConnector {
    /// Creates a plaintext connector.
    #[must_use]
    pub fn plaintext() -> Self {
        Self::default()
    }

    /// Creates a connector that performs a TLS handshake verifying `server_name`.
    #[must_use]
    pub fn tls(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Self {
        Self { tls: Some(TlsSettings { config, server_name }) }
    }

    /// Returns true if connections are wrapped in TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }
}

impl std::fmt::Debug for TransportConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConnector")
            .field("server_name", &self.tls.as_ref().map(|t| &t.server_name))
            .finish()
    }
}

impl Service<Uri> for TransportConnector {
    type Response = TokioIo<MaybeTlsStream>;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let tls = self.tls.clone();
        Box::pin(async move {
            let host = uri.host().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "missing host in URI")
            })?;
            let port = uri.port_u16().unwrap_or(if tls.is_some() { 443 } else { 80 });
            let addr = format!("{host}:{port}");

            let stream = TcpStream::connect(&addr).await?;
            stream.set_nodelay(true)?;
            trace!(addr = %addr, tls = tls.is_some(), "TCP connection established");

            let stream = match tls {
                Some(TlsSettings { config, server_name }) => {
                    let tls_stream = TlsConnector::from(config).connect(server_name, stream).await?;
                    MaybeTlsStream::Tls(Box::new(tls_stream))
                },
                None => MaybeTlsStream::Plain(stream),
            };
            Ok(TokioIo::new(stream))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::disallowed_methods)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tls::{TlsConfig, parse_server_name};

    #[tokio::test]
    async fn test_plaintext_connector_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let mut connector = TransportConnector::plaintext();
        let uri: Uri = format!("http://{addr}").parse().unwrap();
        let io = connector.call(uri).await.unwrap();
        let mut stream = io.into_inner();
        assert!(matches!(stream, MaybeTlsStream::Plain(_)));
        stream.write_all(b"ping").await.unwrap();

        assert_eq!(&server.await.unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connector_reports_refused_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut connector = TransportConnector::plaintext();
        let uri: Uri = format!("http://{addr}").parse().unwrap();
        assert!(connector.call(uri).await.is_err());
    }

    #[test]
    fn test_tls_connector_debug_shows_server_name() {
        let config = TlsConfig::new().with_insecure_skip_verify().client_config().unwrap();
        let connector = TransportConnector::tls(config, parse_server_name("db.internal").unwrap());
        assert!(connector.is_tls());
        assert!(format!("{connector:?}").contains("db.internal"));
        assert!(!TransportConnector::plaintext().is_tls());
    }
}
