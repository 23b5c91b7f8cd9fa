//! Proxy listener and per-connection dispatch.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use super::request::{MAX_REQUEST_LINE, ParseError, RequestLine, read_line};
use super::tunnel::{Tunnel, TunnelError};
use super::{mitm, plain};
use crate::ca::{CaIdentity, CertificateForger, LeafForger};
use crate::capture::CaptureStore;
use crate::config::ProxyConfig;

/// Pause after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Shared state for the proxy server.
pub struct ProxyState {
    /// Where captured requests go.
    store: Arc<CaptureStore>,
    /// Leaf forger, absent when no CA could be loaded.
    forger: Option<Arc<dyn CertificateForger>>,
    /// Dialer for origin connections.
    tunnel: Tunnel,
}

impl ProxyState {
    /// Creates a new proxy state. Without a forger every CONNECT is tunneled
    /// blindly.
    pub fn new(
        store: Arc<CaptureStore>,
        forger: Option<Arc<dyn CertificateForger>>,
        tunnel: Tunnel,
    ) -> Self {
        Self {
            store,
            forger,
            tunnel,
        }
    }

    /// Builds the state from configuration, loading the CA from disk.
    ///
    /// A CA that cannot be loaded is reported once and leaves the proxy in
    /// degraded mode rather than failing.
    pub fn from_config(config: &ProxyConfig, store: Arc<CaptureStore>) -> Self {
        let forger = match CaIdentity::load_files(config.ca_cert_path(), config.ca_key_path()) {
            Ok(ca) => {
                info!("loaded CA from {}", config.ca_dir.display());
                let forger = LeafForger::new(Arc::new(ca));
                let forger: Arc<dyn CertificateForger> = match config.leaf_cache_ttl() {
                    Some(ttl) => Arc::new(forger.with_cache(ttl)),
                    None => Arc::new(forger),
                };
                Some(forger)
            }
            Err(e) => {
                warn!(
                    "CA not loaded, HTTPS will be tunneled without interception: {}",
                    e
                );
                None
            }
        };

        Self::new(store, forger, Tunnel::new(config.connect_timeout()))
    }

    pub fn store(&self) -> &Arc<CaptureStore> {
        &self.store
    }

    pub fn forger(&self) -> Option<&Arc<dyn CertificateForger>> {
        self.forger.as_ref()
    }

    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Whether HTTPS traffic passes through uninspected.
    pub fn is_degraded(&self) -> bool {
        self.forger.is_none()
    }
}

/// The proxy server.
pub struct ProxyServer {
    state: Arc<ProxyState>,
    listener: TcpListener,
}

impl ProxyServer {
    /// Binds the proxy listener to `addr`.
    pub async fn bind(addr: SocketAddr, state: Arc<ProxyState>) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("proxy server listening on {}", local_addr);

        Ok(Self { state, listener })
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> &Arc<ProxyState> {
        &self.state
    }

    /// Runs the proxy server, accepting connections forever.
    pub async fn run(self) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };
            debug!("accepted connection from {}", peer_addr);

            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, state).await {
                    error!("connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Reads the request line and hands the connection to the matching handler.
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ProxyState>,
) -> Result<(), ConnectionError> {
    let mut client = BufReader::new(stream);

    let Some(line) = read_line(&mut client, MAX_REQUEST_LINE).await? else {
        return Err(ConnectionError::ClosedBeforeRequest);
    };
    let line = std::str::from_utf8(&line).map_err(|_| ParseError::NotUtf8)?;
    let request = RequestLine::parse(line)?;

    debug!(
        "{} {} {} from {}",
        request.method, request.target, request.version, peer_addr
    );

    if request.is_connect() {
        mitm::handle_connect(client, request, &state).await
    } else {
        plain::relay_plain(client, request, &state).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection closed before a request line was read")]
    ClosedBeforeRequest,
    #[error("malformed request: {0}")]
    Parse(#[from] ParseError),
    #[error("request has no host to connect to")]
    MissingHost,
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
    #[error("client TLS handshake failed: {0}")]
    ClientHandshake(#[source] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(#[source] hyper::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::{CaError, CaResult, ForgedCertificate};
    use crate::ca::test_support::{generate_test_ca, test_ca};
    use crate::proxy::TlsAcceptor;
    use http::Method;
    use rustls::pki_types::ServerName;
    use rustls::{ClientConfig, RootCertStore};
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
    use tokio::sync::oneshot;
    use tokio_rustls::TlsConnector;

    const TEST_TIMEOUT: Duration = Duration::from_secs(30);
    const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

    async fn start_proxy(
        forger: Option<Arc<dyn CertificateForger>>,
    ) -> (SocketAddr, Arc<CaptureStore>) {
        let store = Arc::new(CaptureStore::new());
        let state = Arc::new(ProxyState::new(
            Arc::clone(&store),
            forger,
            Tunnel::new(Some(Duration::from_secs(5))),
        ));
        let server = ProxyServer::bind("127.0.0.1:0".parse().unwrap(), state)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, store)
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    async fn read_until<S: AsyncRead + Unpin>(stream: &mut S, needle: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        while !contains(&buf, needle) {
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "stream closed before {:?}", String::from_utf8_lossy(needle));
            buf.extend_from_slice(&chunk[..n]);
        }
        buf
    }

    /// Plain origin: reads until `until`, reports what it saw, answers with
    /// `response` and closes.
    async fn plain_origin(
        until: &'static [u8],
        response: &'static [u8],
    ) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let seen = read_until(&mut stream, until).await;
            let _ = tx.send(seen);
            stream.write_all(response).await.unwrap();
        });
        (addr, rx)
    }

    /// TLS origin for `localhost` whose certificate is issued by `ca`.
    async fn tls_origin(
        ca: &CaIdentity,
        response: &'static [u8],
    ) -> (SocketAddr, Arc<ForgedCertificate>, oneshot::Receiver<Vec<u8>>) {
        let cert = Arc::new(ca.forge_leaf("localhost").unwrap());
        let acceptor = TlsAcceptor::new(Arc::clone(&cert));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (mut tls, _) = acceptor.accept(stream).await.unwrap();
            let seen = read_until(&mut tls, b"\r\n\r\n").await;
            let _ = tx.send(seen);
            tls.write_all(response).await.unwrap();
            let _ = tls.shutdown().await;
        });
        (addr, cert, rx)
    }

    fn trusting(ca: &CaIdentity) -> TlsConnector {
        let mut roots = RootCertStore::empty();
        roots.add(ca.cert_der().clone()).unwrap();
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }

    /// Sends a CONNECT through the proxy and checks the exact reply.
    async fn open_tunnel(proxy: SocketAddr, port: u16) -> TcpStream {
        let mut client = TcpStream::connect(proxy).await.unwrap();
        let connect = format!(
            "CONNECT localhost:{port} HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n"
        );
        client.write_all(connect.as_bytes()).await.unwrap();

        let mut reply = vec![0u8; ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, ESTABLISHED);
        client
    }

    /// Tests that a plain request is captured and reaches the origin in
    /// origin-form without proxy headers, and the response flows back.
    #[tokio::test]
    async fn plain_request_is_captured_and_relayed() {
        tokio::time::timeout(TEST_TIMEOUT, async {
            let (origin, seen) = plain_origin(
                b"\r\n\r\n",
                b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
            )
            .await;
            let (proxy, store) = start_proxy(None).await;

            let mut client = TcpStream::connect(proxy).await.unwrap();
            let url = format!("http://127.0.0.1:{}/foo?bar=1", origin.port());
            let request = format!(
                "GET {url} HTTP/1.1\r\nHost: 127.0.0.1\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\nX Odd Name: 1\r\n\r\n"
            );
            client.write_all(request.as_bytes()).await.unwrap();

            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
            assert!(response.ends_with(b"ok"));

            let seen = String::from_utf8(seen.await.unwrap()).unwrap();
            assert!(seen.starts_with("GET /foo?bar=1 HTTP/1.1\r\n"));
            assert!(seen.contains("Accept: */*\r\n"));
            assert!(seen.contains("X Odd Name: 1\r\n"));
            assert!(!seen.to_ascii_lowercase().contains("proxy-connection"));

            let records = store.list();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].id, 0);
            assert_eq!(records[0].method, Method::GET);
            assert_eq!(records[0].url, url);
            assert!(records[0].body.is_empty());
        })
        .await
        .unwrap();
    }

    /// Tests that exactly Content-Length bytes of a POST body are captured
    /// and forwarded before the relay takes over.
    #[tokio::test]
    async fn post_body_is_captured() {
        tokio::time::timeout(TEST_TIMEOUT, async {
            let (origin, seen) = plain_origin(
                b"abcdeEXTRA",
                b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            )
            .await;
            let (proxy, store) = start_proxy(None).await;

            let mut client = TcpStream::connect(proxy).await.unwrap();
            let request = format!(
                "POST http://127.0.0.1:{}/submit HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: 5\r\n\r\nabcdeEXTRA",
                origin.port()
            );
            client.write_all(request.as_bytes()).await.unwrap();

            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            assert!(response.starts_with(b"HTTP/1.1 201 Created\r\n"));

            let seen = seen.await.unwrap();
            assert!(seen.ends_with(b"\r\n\r\nabcdeEXTRA"));

            let record = store.get(0).unwrap();
            assert_eq!(record.method, Method::POST);
            assert_eq!(&record.body[..], b"abcde");
            assert_eq!(record.headers.get("content-length").unwrap(), "5");
        })
        .await
        .unwrap();
    }

    /// Tests that a malformed request line closes the connection without a
    /// response or capture.
    #[tokio::test]
    async fn malformed_request_line_closes() {
        tokio::time::timeout(TEST_TIMEOUT, async {
            let (proxy, store) = start_proxy(None).await;

            let mut client = TcpStream::connect(proxy).await.unwrap();
            client.write_all(b"GARBAGE\r\n").await.unwrap();

            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            assert!(response.is_empty());
            assert!(store.is_empty());
        })
        .await
        .unwrap();
    }

    /// Tests that an unreachable CONNECT target ends the session right after
    /// the established reply.
    #[tokio::test]
    async fn connect_to_unreachable_origin_closes() {
        tokio::time::timeout(TEST_TIMEOUT, async {
            let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = closed.local_addr().unwrap().port();
            drop(closed);
            let (proxy, store) = start_proxy(None).await;

            let mut client = TcpStream::connect(proxy).await.unwrap();
            let connect = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\n\r\n");
            client.write_all(connect.as_bytes()).await.unwrap();

            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            assert_eq!(response, ESTABLISHED);
            assert!(store.is_empty());
        })
        .await
        .unwrap();
    }

    /// Tests interception: the client sees a forged certificate, the origin
    /// gets the decrypted request, and the request is captured as HTTPS.
    #[tokio::test]
    async fn connect_is_intercepted_and_captured() {
        tokio::time::timeout(TEST_TIMEOUT, async {
            let ca = Arc::new(test_ca());
            let (origin, origin_cert, seen) = tls_origin(
                &ca,
                b"HTTP/1.1 200 OK\r\nX-Custom: A\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
            )
            .await;
            let forger: Arc<dyn CertificateForger> = Arc::new(LeafForger::new(Arc::clone(&ca)));
            let (proxy, store) = start_proxy(Some(forger)).await;

            let tunnel = open_tunnel(proxy, origin.port()).await;
            let mut tls = trusting(&ca)
                .connect(ServerName::try_from("localhost").unwrap(), tunnel)
                .await
                .unwrap();
            let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
            assert_ne!(presented, origin_cert.chain()[0]);

            tls.write_all(b"GET /hello?x=1 HTTP/1.1\r\nHost: localhost\r\nUser-Agent: capture-test\r\n\r\n")
                .await
                .unwrap();
            let response = read_until(&mut tls, b"hello world").await;
            assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
            let head = String::from_utf8_lossy(&response).to_string();
            assert!(head.contains("X-Custom: A\r\n"), "{head}");
            assert!(!head.to_ascii_lowercase().contains("date:"), "{head}");

            let seen = String::from_utf8(seen.await.unwrap()).unwrap();
            assert!(seen.starts_with("GET /hello?x=1 HTTP/1.1\r\n"));
            assert!(seen.contains("User-Agent: capture-test\r\n"), "{seen}");

            let records = store.list();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].method, Method::GET);
            assert_eq!(
                records[0].url,
                format!("https://localhost:{}/hello?x=1", origin.port())
            );
            assert_eq!(records[0].headers.get("user-agent").unwrap(), "capture-test");
        })
        .await
        .unwrap();
    }

    /// Opens a CONNECT tunnel to a TLS origin through a proxy using `forger`
    /// and checks the TLS session is end to end and nothing is captured.
    async fn assert_blind_tunnel(forger: Option<Arc<dyn CertificateForger>>) {
        let ca = test_ca();
        let (origin, origin_cert, seen) = tls_origin(
            &ca,
            b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (proxy, store) = start_proxy(forger).await;

        let tunnel = open_tunnel(proxy, origin.port()).await;
        let mut tls = trusting(&ca)
            .connect(ServerName::try_from("localhost").unwrap(), tunnel)
            .await
            .unwrap();
        let presented = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
        assert_eq!(presented, origin_cert.chain()[0]);

        tls.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = read_until(&mut tls, b"\r\n\r\n").await;
        assert!(response.starts_with(b"HTTP/1.1 204 No Content\r\n"));

        seen.await.unwrap();
        assert!(store.is_empty());
    }

    /// Forger standing in for a CA that cannot sign for any host.
    struct RefusingForger;

    impl CertificateForger for RefusingForger {
        fn forge(&self, host: &str) -> CaResult<Arc<ForgedCertificate>> {
            Err(CaError::InvalidDnsName(host.to_string()))
        }
    }

    /// Tests degraded mode: without a CA the tunnel is end-to-end and
    /// nothing is captured.
    #[tokio::test]
    async fn connect_without_ca_tunnels_blindly() {
        tokio::time::timeout(TEST_TIMEOUT, assert_blind_tunnel(None))
            .await
            .unwrap();
    }

    /// Tests that a forge failure for one host falls back to a blind tunnel
    /// even though a CA is loaded.
    #[tokio::test]
    async fn forge_failure_tunnels_blindly() {
        let forger: Arc<dyn CertificateForger> = Arc::new(RefusingForger);
        tokio::time::timeout(TEST_TIMEOUT, assert_blind_tunnel(Some(forger)))
            .await
            .unwrap();
    }

    /// Tests that a CA directory without a key leaves the state degraded.
    #[test]
    fn missing_ca_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig {
            ca_dir: dir.path().to_path_buf(),
            ..ProxyConfig::default()
        };
        let state = ProxyState::from_config(&config, Arc::new(CaptureStore::new()));
        assert!(state.is_degraded());

        let (cert_pem, key_pem) = generate_test_ca();
        std::fs::write(config.ca_cert_path(), cert_pem).unwrap();
        std::fs::write(config.ca_key_path(), key_pem).unwrap();
        let state = ProxyState::from_config(&config, Arc::new(CaptureStore::new()));
        assert!(!state.is_degraded());
    }
}
