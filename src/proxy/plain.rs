//! Plain HTTP relay for absolute-form proxy requests.

use bytes::Bytes;
use http::HeaderMap;
use http::header::HOST;
use http::uri::Authority;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::info;

use super::request::{HeaderBlock, RequestLine, read_body, read_headers};
use super::server::{ConnectionError, ProxyState};
use super::tunnel::{Tunnel, TunnelError};

const DEFAULT_HTTP_PORT: u16 = 80;

/// Captures a plain HTTP request, forwards it to the origin in origin-form and
/// then relays both directions until the origin side finishes.
///
/// `client` must be positioned just after the request line.
pub(crate) async fn relay_plain(
    mut client: BufReader<TcpStream>,
    request: RequestLine,
    state: &ProxyState,
) -> Result<(), ConnectionError> {
    let block = read_headers(&mut client).await?;
    let body = match block.body_len(&request.method) {
        Some(len) => read_body(&mut client, len).await?,
        None => Bytes::new(),
    };

    let origin = Origin::resolve(&request, &block.headers)?;
    let id = state.store().add(
        request.method.clone(),
        origin.url.clone(),
        block.headers.clone(),
        body.clone(),
    );
    info!("[HTTP] #{} => {} {}", id, request.method, origin.url);

    let mut upstream = state.tunnel().dial(&origin.host, origin.port).await?;
    upstream
        .write_all(&encode_head(&request, &block, &body))
        .await
        .map_err(TunnelError::Io)?;

    Tunnel::relay(client, upstream).await?;
    Ok(())
}

/// Where a plain request goes, and the URL it is captured under.
#[derive(Debug)]
struct Origin {
    host: String,
    port: u16,
    url: String,
}

impl Origin {
    /// Uses the target's authority, or the `Host` header for origin-form
    /// targets.
    fn resolve(request: &RequestLine, headers: &HeaderMap) -> Result<Self, ConnectionError> {
        if let Some(authority) = request.target.authority() {
            return Ok(Self {
                host: super::bare_host(authority.host()).to_string(),
                port: authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
                url: request.target.to_string(),
            });
        }

        let authority: Authority = headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse().ok())
            .ok_or(ConnectionError::MissingHost)?;

        Ok(Self {
            host: super::bare_host(authority.host()).to_string(),
            port: authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
            url: format!("http://{}{}", authority, request.path_and_query()),
        })
    }
}

/// Request line in origin-form, the retained header lines, a blank line and
/// the body.
fn encode_head(request: &RequestLine, block: &HeaderBlock, body: &[u8]) -> Vec<u8> {
    let mut head = format!(
        "{} {} {}\r\n",
        request.method,
        request.path_and_query(),
        request.version
    )
    .into_bytes();
    for line in block.lines() {
        head.extend_from_slice(line);
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head.extend_from_slice(body);
    head
}
