mod openssl_authority;

use crate::Error;
use std::{
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio_rustls::rustls::sign::CertifiedKey;

pub use openssl_authority::*;

pub(crate) const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Lifetime requested for every leaf certificate.
pub const LEAF_TTL: Duration = Duration::from_secs(14 * 24 * 60 * 60);
/// How long a leaf is served from the cache. One day shorter than [`LEAF_TTL`] so a cached leaf is
/// replaced before the certificate itself lapses.
pub const CACHE_TTL: Duration = LEAF_TTL.saturating_sub(ONE_DAY);
/// Lifetime of a freshly generated issuing certificate.
pub const ISSUER_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);
/// An issuing certificate expiring within this window is regenerated on startup.
pub const ISSUER_RENEWAL_WINDOW: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub(crate) const NOT_BEFORE_OFFSET: i64 = 60;
pub(crate) const RSA_BITS: u32 = 2048;

/// Where the signing identity lives on disk and what it is called.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IdentityConfig {
    /// Organization of the issuing certificate and of every leaf.
    pub organization: String,
    /// Common name of the issuing certificate.
    pub common_name: String,
    /// PEM-encoded PKCS#8 private key.
    pub key_file: PathBuf,
    /// PEM-encoded issuing certificate.
    pub cert_file: PathBuf,
}

impl IdentityConfig {
    pub fn new(key_file: impl Into<PathBuf>, cert_file: impl Into<PathBuf>) -> Self {
        Self {
            organization: String::new(),
            common_name: String::new(),
            key_file: key_file.into(),
            cert_file: cert_file.into(),
        }
    }

    pub(crate) fn organization(&self) -> String {
        if self.organization.is_empty() {
            format!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        } else {
            self.organization.clone()
        }
    }

    pub(crate) fn common_name(&self) -> String {
        if self.common_name.is_empty() {
            env!("CARGO_PKG_NAME").to_owned()
        } else {
            self.common_name.clone()
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self::new(
            concat!(env!("CARGO_PKG_NAME"), "-ca-pk.pem"),
            concat!(env!("CARGO_PKG_NAME"), "-ca-cert.pem"),
        )
    }
}

/// A leaf certificate for one host, paired with the signing key it was issued for.
#[derive(Clone, Debug)]
pub struct LeafCertificate {
    key: Arc<CertifiedKey>,
    not_after: SystemTime,
}

impl LeafCertificate {
    pub fn new(key: Arc<CertifiedKey>, not_after: SystemTime) -> Self {
        Self { key, not_after }
    }

    /// Certificate chain and signing key, ready to hand to rustls.
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.key
    }

    pub fn not_after(&self) -> SystemTime {
        self.not_after
    }
}

/// Issues certificates for use when communicating with clients.
///
/// Clients should be configured to trust the issuing certificate, which has to be installed into
/// their trust store by hand.
pub trait CertificateAuthority: Send + Sync + 'static {
    /// Issue a certificate for `host`, signed by the issuing certificate and valid until at most
    /// `valid_until`.
    ///
    /// The returned validity never extends past the issuing certificate's own validity.
    fn issue_leaf(&self, host: &str, valid_until: SystemTime) -> Result<LeafCertificate, Error>;
}

impl<T: CertificateAuthority> CertificateAuthority for Arc<T> {
    fn issue_leaf(&self, host: &str, valid_until: SystemTime) -> Result<LeafCertificate, Error> {
        (**self).issue_leaf(host, valid_until)
    }
}
