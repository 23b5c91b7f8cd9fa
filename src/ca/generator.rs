//! Per-host leaf certificate forging using rcgen.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use super::loader::{CaError, CaIdentity, CaResult};

/// Backdating applied to `not_before` to tolerate client clock skew.
const NOT_BEFORE_SKEW: Duration = Duration::hours(1);
/// Lifetime of a forged leaf certificate.
const VALIDITY_YEARS: i32 = 10;

/// A leaf certificate and key bound to a single host, signed by the local CA.
pub struct ForgedCertificate {
    host: String,
    serial: u64,
    /// Chain (leaf, then CA) and signing key, ready for rustls.
    certified_key: Arc<CertifiedKey>,
}

impl std::fmt::Debug for ForgedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForgedCertificate")
            .field("host", &self.host)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

impl ForgedCertificate {
    /// Host the certificate was issued for.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Serial number of the leaf certificate.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Certificate chain presented to clients: the leaf followed by the CA.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// The chain together with the leaf's signing key.
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }
}

impl CaIdentity {
    /// Forges a leaf certificate for `host`, signed by this CA.
    ///
    /// A fresh 2048-bit RSA key and a random serial are generated on every
    /// call. IP literals get an IP address SAN, anything else a DNS SAN.
    pub fn forge_leaf(&self, host: &str) -> CaResult<ForgedCertificate> {
        let serial = random_serial();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, host);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(serial.into());
        params.subject_alt_names = match host.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(
                host.try_into()
                    .map_err(|_| CaError::InvalidDnsName(host.to_string()))?,
            )],
        };
        params.key_usages = vec![
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyAgreement,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.is_ca = IsCa::ExplicitNoCa;

        let now = OffsetDateTime::now_utc();
        params.not_before = now - NOT_BEFORE_SKEW;
        params.not_after = years_after(now, VALIDITY_YEARS);

        // aws-lc-rs generates 2048-bit moduli for PKCS_RSA_SHA256.
        let host_key_pair =
            KeyPair::generate_for(&rcgen::PKCS_RSA_SHA256).map_err(CaError::KeyGeneration)?;
        let host_cert = params
            .signed_by(&host_key_pair, self.issuer())
            .map_err(CaError::Signing)?;

        let cert_der = host_cert.der().clone();
        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(host_key_pair.serialize_der()));
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der)
            .map_err(CaError::SigningKey)?;

        debug!("forged certificate for {} (serial {:#x})", host, serial);

        Ok(ForgedCertificate {
            host: host.to_string(),
            serial,
            certified_key: Arc::new(CertifiedKey::new(
                vec![cert_der, self.cert_der().clone()],
                signing_key,
            )),
        })
    }
}

/// Random, strictly positive 63-bit serial number.
fn random_serial() -> u64 {
    let mut rng = rand::thread_rng();
    loop {
        let serial = rng.r#gen::<u64>() >> 1;
        if serial != 0 {
            return serial;
        }
    }
}

fn years_after(now: OffsetDateTime, years: i32) -> OffsetDateTime {
    // Feb 29 has no counterpart in non-leap target years.
    now.replace_year(now.year() + years)
        .unwrap_or_else(|_| now + Duration::days(365 * i64::from(years) + 3))
}

/// Forges leaf certificates from a loaded CA, optionally through a host-keyed
/// cache.
///
/// Without a cache every call produces a brand new certificate and key. With
/// one, certificates are reused per host until the cache TTL expires.
pub struct LeafForger {
    ca: Arc<CaIdentity>,
    cache: Option<LeafCache>,
}

impl LeafForger {
    /// Creates a forger that signs a new certificate on every call.
    pub fn new(ca: Arc<CaIdentity>) -> Self {
        Self { ca, cache: None }
    }

    /// Enables caching of forged certificates for `ttl`.
    pub fn with_cache(mut self, ttl: std::time::Duration) -> Self {
        self.cache = Some(LeafCache::new(ttl));
        self
    }
}

/// Source of the certificate presented to a client for an intercepted host.
pub trait CertificateForger: Send + Sync {
    /// Returns the certificate to present for `host`.
    fn forge(&self, host: &str) -> CaResult<Arc<ForgedCertificate>>;
}

impl CertificateForger for LeafForger {
    fn forge(&self, host: &str) -> CaResult<Arc<ForgedCertificate>> {
        match &self.cache {
            Some(cache) => cache.get_or_forge(&self.ca, host),
            None => Ok(Arc::new(self.ca.forge_leaf(host)?)),
        }
    }
}

/// Cache of forged certificates keyed by host.
struct LeafCache {
    ttl: std::time::Duration,
    entries: RwLock<HashMap<String, (Instant, Arc<ForgedCertificate>)>>,
}

impl LeafCache {
    fn new(ttl: std::time::Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get_or_forge(&self, ca: &CaIdentity, host: &str) -> CaResult<Arc<ForgedCertificate>> {
        if let Ok(entries) = self.entries.read()
            && let Some((created, cert)) = entries.get(host)
            && created.elapsed() < self.ttl
        {
            return Ok(Arc::clone(cert));
        }

        let cert = Arc::new(ca.forge_leaf(host)?);

        if let Ok(mut entries) = self.entries.write() {
            let ttl = self.ttl;
            entries.retain(|_, (created, _)| created.elapsed() < ttl);
            entries.insert(host.to_string(), (Instant::now(), Arc::clone(&cert)));
        }

        Ok(cert)
    }
}
