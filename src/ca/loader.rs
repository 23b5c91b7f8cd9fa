//! Loading of the persisted root CA used to sign forged leaf certificates.

use std::fs;
use std::path::{Path, PathBuf};

use rcgen::{Issuer, KeyPair};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tracing::debug;

/// Default file name of the CA certificate inside the CA directory.
pub const CA_CERT_FILE: &str = "ca.crt";
/// Default file name of the CA private key inside the CA directory.
pub const CA_KEY_FILE: &str = "ca.key";

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse PEM block in {0}")]
    Pem(&'static str),
    #[error("CA key is not a usable RSA private key: {0}")]
    NotRsa(#[source] rcgen::Error),
    #[error("cannot parse CA certificate: {0}")]
    Certificate(#[source] rcgen::Error),
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(#[source] rcgen::Error),
    #[error("failed to sign certificate: {0}")]
    Signing(#[source] rcgen::Error),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
    #[error("certificate forging task failed: {0}")]
    Task(String),
}

/// Root certificate and private key of the local CA.
///
/// Loaded once at startup and shared read-only between sessions. The key must
/// be RSA, encoded as either PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8
/// (`PRIVATE KEY`).
pub struct CaIdentity {
    /// Issuer built from the CA certificate and its key, used for signing.
    issuer: Issuer<'static, KeyPair>,
    /// The CA certificate in DER format, appended to every forged chain.
    cert_der: CertificateDer<'static>,
}

impl std::fmt::Debug for CaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaIdentity").finish_non_exhaustive()
    }
}

impl CaIdentity {
    /// Loads `ca.crt` and `ca.key` from the given directory.
    pub fn load(dir: impl AsRef<Path>) -> CaResult<Self> {
        let dir = dir.as_ref();
        Self::load_files(dir.join(CA_CERT_FILE), dir.join(CA_KEY_FILE))
    }

    /// Loads the CA from explicit certificate and key paths.
    pub fn load_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> CaResult<Self> {
        let key_pem = read_file(key_path.as_ref())?;
        let cert_pem = read_file(cert_path.as_ref())?;
        let ca = Self::from_pem(&cert_pem, &key_pem)?;
        debug!("loaded CA certificate from {}", cert_path.as_ref().display());
        Ok(ca)
    }

    /// Builds the CA from PEM-encoded certificate and key material.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> CaResult<Self> {
        let key_der =
            PrivateKeyDer::from_pem_slice(key_pem.as_bytes()).map_err(|_| CaError::Pem("ca.key"))?;
        let key_pair = KeyPair::from_der_and_sign_algo(&key_der, &rcgen::PKCS_RSA_SHA256)
            .map_err(CaError::NotRsa)?;

        let cert_der = CertificateDer::from_pem_slice(cert_pem.as_bytes())
            .map_err(|_| CaError::Pem("ca.crt"))?;
        let issuer =
            Issuer::from_ca_cert_der(&cert_der, key_pair).map_err(CaError::Certificate)?;

        Ok(Self { issuer, cert_der })
    }

    /// Returns the CA certificate in DER format.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

fn read_file(path: &Path) -> CaResult<String> {
    fs::read_to_string(path).map_err(|source| CaError::Read {
        path: path.to_path_buf(),
        source,
    })
}
