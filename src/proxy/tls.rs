//! Client-facing TLS termination under a forged identity.

use std::sync::Arc;

use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tracing::debug;

use crate::ca::ForgedCertificate;

/// TLS acceptor presenting a single forged certificate.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    /// Creates an acceptor that serves `forged` to every client.
    pub fn new(forged: Arc<ForgedCertificate>) -> Self {
        let config = Self::create_config(forged);
        Self {
            inner: tokio_rustls::TlsAcceptor::from(config),
        }
    }

    fn create_config(forged: Arc<ForgedCertificate>) -> Arc<ServerConfig> {
        let resolver = Arc::new(CertResolver { forged });
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Arc::new(config)
    }

    /// Runs the server handshake on `stream` under the forged certificate.
    ///
    /// The server name the client asked for comes back alongside the
    /// decrypted stream; it does not affect which certificate is served.
    pub async fn accept<IO>(
        &self,
        stream: IO,
    ) -> Result<(TlsStream<IO>, Option<String>), std::io::Error>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let stream = self.inner.accept(stream).await?;
        let requested = stream.get_ref().1.server_name().map(str::to_string);
        debug!("client handshake done (requested name: {:?})", requested);
        Ok((stream, requested))
    }
}

/// Resolver that always answers with the session's forged certificate.
struct CertResolver {
    forged: Arc<ForgedCertificate>,
}

impl std::fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertResolver")
            .field("host", &self.forged.host())
            .finish()
    }
}

impl rustls::server::ResolvesServerCert for CertResolver {
    fn resolve(
        &self,
        client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<rustls::sign::CertifiedKey>> {
        if let Some(sni) = client_hello.server_name()
            && !sni.eq_ignore_ascii_case(self.forged.host())
        {
            debug!(
                "client SNI {} differs from tunnel host {}",
                sni,
                self.forged.host()
            );
        }
        Some(Arc::clone(self.forged.certified_key()))
    }
}
