//! Forward proxy with TLS interception.
//!
//! Plain HTTP requests are captured and relayed to the origin. CONNECT
//! tunnels are terminated with a forged certificate, every decrypted request
//! is captured, and traffic is forwarded to the origin over its own TLS
//! session. Without a CA, tunnels are relayed blindly.

mod mitm;
mod plain;
mod request;
mod server;
mod tls;
mod tunnel;

pub use request::{
    HeaderBlock, MAX_HEADER_BLOCK, MAX_REQUEST_LINE, ParseError, RequestLine, read_body,
    read_headers, read_line,
};
pub use server::{ConnectionError, ProxyServer, ProxyState};
pub use tls::TlsAcceptor;
pub use tunnel::{Tunnel, TunnelError};

/// Strips the brackets `http` keeps around IPv6 literals.
pub(crate) fn bare_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
