//! Upstream connections and the duplex byte relay.

use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Dials origin servers, plain or TLS.
///
/// Origin certificates are never verified: the proxy exists to observe
/// traffic, not to authenticate origins.
#[derive(Clone)]
pub struct Tunnel {
    client_config: Arc<ClientConfig>,
    connect_timeout: Option<Duration>,
}

impl Tunnel {
    /// Creates a tunnel. `connect_timeout` bounds TCP dials when set.
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Self {
            client_config: Arc::new(config),
            connect_timeout,
        }
    }

    /// Opens a TCP connection to `host:port`.
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, TunnelError> {
        debug!("connecting to upstream {}:{}", host, port);

        let connect = TcpStream::connect((host, port));
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| TunnelError::Timeout(limit))?,
            None => connect.await,
        }
        .map_err(TunnelError::Connect)?;

        Ok(stream)
    }

    /// Runs a TLS client handshake with the origin over an open connection.
    pub async fn secure(
        &self,
        stream: TcpStream,
        host: &str,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, TunnelError> {
        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| TunnelError::InvalidSni(host.to_string()))?;

        let connector = TlsConnector::from(Arc::clone(&self.client_config));
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(TunnelError::TlsHandshake)?;

        debug!("upstream TLS connection established to {}", host);

        Ok(tls_stream)
    }

    /// Relays bytes both ways between `client` and `upstream`.
    ///
    /// End of input from the client is passed on as a write shutdown, and the
    /// relay keeps going until the upstream side finishes. An error in either
    /// direction, or the end of the upstream stream, tears down both sides.
    /// Returns the byte counts (client to upstream, upstream to client).
    pub async fn relay<C, U>(client: C, upstream: U) -> Result<(u64, u64), TunnelError>
    where
        C: AsyncRead + AsyncWrite,
        U: AsyncRead + AsyncWrite,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
        let mut sent = 0u64;
        let mut received = 0u64;

        let outcome = {
            let client_to_upstream = async {
                pump(&mut client_read, &mut upstream_write, &mut sent).await?;
                upstream_write.shutdown().await
            };
            let upstream_to_client = async {
                let result = pump(&mut upstream_read, &mut client_write, &mut received).await;
                let _ = client_write.shutdown().await;
                result
            };
            tokio::pin!(client_to_upstream, upstream_to_client);

            let mut client_done = false;
            loop {
                tokio::select! {
                    result = &mut client_to_upstream, if !client_done => {
                        if let Err(e) = result {
                            break Err(e);
                        }
                        client_done = true;
                    }
                    result = &mut upstream_to_client => break result,
                }
            }
        };

        debug!(
            "tunnel closed: {} bytes client->upstream, {} bytes upstream->client",
            sent, received
        );

        outcome.map(|()| (sent, received)).map_err(TunnelError::Io)
    }
}

/// Copies `reader` into `writer` until end of input, counting bytes.
async fn pump<R, W>(reader: &mut R, writer: &mut W, total: &mut u64) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *total += n as u64;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] std::io::Error),
    #[error("connecting to upstream timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid SNI: {0}")]
    InvalidSni(String),
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(#[source] std::io::Error),
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

/// Certificate verifier that accepts any origin certificate.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
