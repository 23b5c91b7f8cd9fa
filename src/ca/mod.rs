//! Local certificate authority for TLS interception.
//!
//! This module loads the persisted root CA and forges per-host leaf
//! certificates signed by it.

mod generator;
mod loader;

pub use generator::{CertificateForger, ForgedCertificate, LeafForger};
pub use loader::{CA_CERT_FILE, CA_KEY_FILE, CaError, CaIdentity, CaResult};
