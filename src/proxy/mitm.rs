//! CONNECT handling: TLS interception with a blind tunnel fallback.
//!
//! A session moves through these stages:
//!
//! 1. headers of the CONNECT request are drained and `200 Connection
//!    established` is sent back;
//! 2. a TCP connection to the origin is opened (failure ends the session);
//! 3. a leaf certificate for the target host is forged. Without a CA, or if
//!    forging fails, bytes are relayed untouched over the TCP connection;
//! 4. TLS is set up towards the origin and then towards the client under the
//!    forged identity. A failed client handshake ends the session;
//! 5. each decrypted request is captured and forwarded to the origin, and the
//!    origin's response is passed back unmodified.

use std::sync::Arc;

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::request::{RequestLine, read_headers};
use super::server::{ConnectionError, ProxyState};
use super::tls::TlsAcceptor;
use super::tunnel::Tunnel;
use crate::ca::{CaError, ForgedCertificate};
use crate::capture::CaptureStore;

const DEFAULT_HTTPS_PORT: u16 = 443;

/// Runs a CONNECT session. `client` must be positioned just after the request
/// line.
pub(crate) async fn handle_connect(
    mut client: BufReader<TcpStream>,
    request: RequestLine,
    state: &ProxyState,
) -> Result<(), ConnectionError> {
    read_headers(&mut client).await?;
    let established = format!("{} 200 Connection established\r\n\r\n", request.version);
    client.write_all(established.as_bytes()).await?;
    client.flush().await?;

    let target = TunnelTarget::from_uri(&request.target)?;
    let origin = state.tunnel().dial(&target.host, target.port).await?;

    let Some(forged) = forge(state, &target.host).await else {
        Tunnel::relay(client, origin).await?;
        return Ok(());
    };

    let origin = state.tunnel().secure(origin, &target.host).await?;
    let (client, sni) = TlsAcceptor::new(forged)
        .accept(client)
        .await
        .map_err(ConnectionError::ClientHandshake)?;
    debug!(
        "intercepting {} (client SNI: {:?})",
        target.authority, sni
    );

    intercept(client, origin, target.authority, Arc::clone(state.store())).await
}

/// Host and port of a CONNECT target, plus the authority used in captured
/// URLs (`:443` omitted).
#[derive(Debug, Clone, PartialEq, Eq)]
struct TunnelTarget {
    host: String,
    port: u16,
    authority: String,
}

impl TunnelTarget {
    fn from_uri(uri: &Uri) -> Result<Self, ConnectionError> {
        let raw_host = uri.host().ok_or(ConnectionError::MissingHost)?;
        let port = uri.port_u16().unwrap_or(DEFAULT_HTTPS_PORT);
        let authority = if port == DEFAULT_HTTPS_PORT {
            raw_host.to_string()
        } else {
            format!("{}:{}", raw_host, port)
        };

        Ok(Self {
            host: super::bare_host(raw_host).to_string(),
            port,
            authority,
        })
    }
}

/// Forges a leaf for `host` off the async runtime. `None` means the session
/// should fall back to a blind tunnel.
async fn forge(state: &ProxyState, host: &str) -> Option<Arc<ForgedCertificate>> {
    let Some(forger) = state.forger() else {
        debug!("no CA loaded, tunneling {} blindly", host);
        return None;
    };

    let forger = Arc::clone(forger);
    let owned_host = host.to_string();
    let result = tokio::task::spawn_blocking(move || forger.forge(&owned_host))
        .await
        .unwrap_or_else(|e| Err(CaError::Task(e.to_string())));

    match result {
        Ok(forged) => Some(forged),
        Err(e) => {
            warn!(
                "failed to forge certificate for {}, tunneling blindly: {}",
                host, e
            );
            None
        }
    }
}

/// Serves decrypted HTTP/1.1 from `client`, forwarding every request over a
/// single connection to `origin`.
async fn intercept<C, O>(
    client: C,
    origin: O,
    authority: String,
    store: Arc<CaptureStore>,
) -> Result<(), ConnectionError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    O: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .handshake(TokioIo::new(origin))
        .await
        .map_err(ConnectionError::Http)?;
    let driver = tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("origin connection closed: {}", e);
        }
    });

    let session = Arc::new(InterceptSession {
        authority,
        store,
        sender: Mutex::new(sender),
    });
    let service = service_fn(move |req: Request<Incoming>| {
        let session = Arc::clone(&session);
        async move {
            session.forward(req).await.inspect_err(|e| {
                warn!("failed to forward intercepted request: {}", e);
            })
        }
    });

    // Responses go back as the origin sent them: no added Date, original
    // header name case on both legs.
    let served = http1::Builder::new()
        .auto_date_header(false)
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(client), service)
        .await;
    driver.abort();

    if let Err(e) = served {
        debug!("intercepted session ended: {}", e);
    }
    Ok(())
}

/// Per-tunnel forwarding state.
struct InterceptSession {
    authority: String,
    store: Arc<CaptureStore>,
    sender: Mutex<SendRequest<Full<Bytes>>>,
}

impl InterceptSession {
    async fn forward(&self, req: Request<Incoming>) -> Result<Response<Incoming>, ForwardError> {
        let (mut parts, body) = req.into_parts();
        let body = body.collect().await.map_err(ForwardError::Body)?.to_bytes();

        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .to_string();
        let url = format!("https://{}{}", self.authority, path);
        let id = self.store.add(
            parts.method.clone(),
            url.clone(),
            parts.headers.clone(),
            body.clone(),
        );
        info!("[HTTPS] #{} => {} {}", id, parts.method, url);

        parts.uri = Uri::try_from(path).map_err(ForwardError::Uri)?;
        if !parts.headers.contains_key(HOST)
            && let Ok(host) = HeaderValue::from_str(&self.authority)
        {
            parts.headers.insert(HOST, host);
        }
        let request = Request::from_parts(parts, Full::new(body));

        let mut sender = self.sender.lock().await;
        sender.ready().await.map_err(ForwardError::Origin)?;
        sender
            .send_request(request)
            .await
            .map_err(ForwardError::Origin)
    }
}

#[derive(Debug, thiserror::Error)]
enum ForwardError {
    #[error("failed to read request body: {0}")]
    Body(#[source] hyper::Error),
    #[error("invalid request target: {0}")]
    Uri(#[source] http::uri::InvalidUri),
    #[error("origin request failed: {0}")]
    Origin(#[source] hyper::Error),
}
