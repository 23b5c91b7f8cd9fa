//! Intercepting HTTP/HTTPS proxy that records every request it relays.
//!
//! Clients point their HTTP proxy setting at the listener. Plain requests are
//! captured and relayed to the origin. CONNECT tunnels are terminated with a
//! leaf certificate forged on the fly and signed by a locally trusted CA, so
//! the requests inside can be captured before being forwarded to the origin
//! over a fresh TLS session.
//!
//! # Architecture
//!
//! - [`ca`] loads the CA from disk and forges per-host leaf certificates.
//! - [`capture`] holds captured requests in insertion order.
//! - [`proxy`] accepts connections, parses the request line and dispatches to
//!   the plain relay or the CONNECT engine.
//! - [`config`] describes the YAML configuration file.
//!
//! Without a usable CA the proxy still runs: CONNECT tunnels are relayed
//! byte for byte and only plain HTTP is captured.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mitm_capture::{CaptureStore, ProxyConfig, ProxyServer, ProxyState};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ProxyConfig::load("mitm-capture.yaml")?;
//! let store = Arc::new(CaptureStore::new());
//! let state = Arc::new(ProxyState::from_config(&config, Arc::clone(&store)));
//! let server = ProxyServer::bind(config.listen, state).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod ca;
pub mod capture;
pub mod config;
pub mod proxy;

pub use ca::{CaError, CaIdentity, CertificateForger, ForgedCertificate, LeafForger};
pub use capture::{CaptureId, CaptureStore, CapturedRequest};
pub use config::{ConfigError, ProxyConfig};
pub use proxy::{ConnectionError, ProxyServer, ProxyState};
