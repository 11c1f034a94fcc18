use crate::{
    Error,
    certificate_authority::{
        CertificateAuthority, ISSUER_RENEWAL_WINDOW, ISSUER_TTL, IdentityConfig, LeafCertificate,
        NOT_BEFORE_OFFSET, RSA_BITS,
    },
};
use openssl::{
    asn1::{Asn1Integer, Asn1Time, Asn1TimeRef},
    bn::BigNum,
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rand,
    rsa::Rsa,
    x509::{
        X509, X509Builder, X509NameBuilder,
        extension::{BasicConstraints, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier},
    },
};
use std::{
    fs,
    io::{self, Write},
    net::IpAddr,
    path::Path,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio_rustls::rustls::{
    ServerConfig,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    sign::{CertifiedKey, SigningKey},
};
use tracing::{debug, info, warn};

/// Signing identity backed by the `openssl` crate.
///
/// Holds an RSA private key and the self-signed issuing certificate bound to it. Every leaf is
/// issued for the same key, so a single rustls signing key is loaded once and shared by all
/// leaves.
///
/// # Examples
///
/// ```rust,no_run
/// use interloper::{
///     certificate_authority::{IdentityConfig, OpensslAuthority},
///     rustls::crypto::aws_lc_rs,
/// };
///
/// let ca = OpensslAuthority::ensure_identity(
///     &IdentityConfig::default(),
///     aws_lc_rs::default_provider(),
/// )
/// .expect("proxy cannot run without a signing identity");
/// ```
pub struct OpensslAuthority {
    pkey: PKey<Private>,
    private_key: PrivateKeyDer<'static>,
    signing_key: Arc<dyn SigningKey>,
    ca_cert: X509,
    organization: String,
    hash: MessageDigest,
    not_before: i64,
    not_after: i64,
    provider: Arc<CryptoProvider>,
}

impl OpensslAuthority {
    /// Creates an authority from an existing key and issuing certificate.
    ///
    /// # Errors
    ///
    /// This will return an error if the certificate's public key does not match `pkey`, or if the
    /// key cannot be loaded by `provider`.
    pub fn new(
        pkey: PKey<Private>,
        ca_cert: X509,
        organization: impl Into<String>,
        hash: MessageDigest,
        provider: CryptoProvider,
    ) -> Result<Self, Error> {
        let identity = |e: ErrorStack| Error::Identity(e.to_string());

        if !ca_cert.public_key().map_err(identity)?.public_eq(&pkey) {
            return Err(Error::Identity(
                "issuing certificate does not match private key".to_owned(),
            ));
        }

        let private_key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
            pkey.private_key_to_pkcs8().map_err(identity)?,
        ));
        let provider = Arc::new(provider);
        let signing_key = provider
            .key_provider
            .load_private_key(private_key.clone_key())?;

        let not_before = unix_time(ca_cert.not_before()).map_err(identity)?;
        let not_after = unix_time(ca_cert.not_after()).map_err(identity)?;

        Ok(Self {
            pkey,
            private_key,
            signing_key,
            ca_cert,
            organization: organization.into(),
            hash,
            not_before,
            not_after,
            provider,
        })
    }

    /// Loads the signing identity described by `config`, generating and persisting whatever is
    /// missing or unusable.
    ///
    /// A new RSA key is generated when the key file is absent, unreadable or weaker than 2048
    /// bits. A new self-signed issuing certificate, valid for one year, is generated when the
    /// certificate file is absent or unreadable, does not match the key, or expires within a
    /// month. Regenerated artifacts overwrite the previous files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyGeneration`] or [`Error::CertGeneration`] when generation fails, and
    /// [`Error::Io`] when the artifacts cannot be written back.
    pub fn ensure_identity(
        config: &IdentityConfig,
        provider: CryptoProvider,
    ) -> Result<Self, Error> {
        let organization = config.organization();
        let common_name = config.common_name();

        let (pkey, fresh_key) = match load_private_key(&config.key_file) {
            Some(pkey) => (pkey, false),
            None => {
                info!("Generating signing key at {}", config.key_file.display());
                let pkey = generate_private_key().map_err(Error::KeyGeneration)?;
                let pem = pkey
                    .private_key_to_pem_pkcs8()
                    .map_err(Error::KeyGeneration)?;
                write_private_key(&config.key_file, &pem)?;
                (pkey, true)
            }
        };

        let loaded = if fresh_key {
            None
        } else {
            load_certificate(&config.cert_file, &pkey)
        };

        let ca_cert = match loaded {
            Some(ca_cert) => ca_cert,
            None => {
                info!(
                    "Generating issuing certificate at {}",
                    config.cert_file.display()
                );
                let now = unix_now();
                let ca_cert = self_signed(
                    &pkey,
                    &organization,
                    &common_name,
                    now - NOT_BEFORE_OFFSET,
                    now + ISSUER_TTL.as_secs() as i64,
                )
                .map_err(Error::CertGeneration)?;
                let pem = ca_cert.to_pem().map_err(Error::CertGeneration)?;
                create_parent(&config.cert_file)?;
                fs::write(&config.cert_file, pem)?;
                ca_cert
            }
        };

        Self::new(
            pkey,
            ca_cert,
            organization,
            MessageDigest::sha256(),
            provider,
        )
    }

    /// The self-signed issuing certificate clients have to trust.
    pub fn issuing_certificate(&self) -> &X509 {
        &self.ca_cert
    }

    /// DER encoding of the issuing certificate.
    pub fn issuer_der(&self) -> Result<CertificateDer<'static>, Error> {
        let der = self
            .ca_cert
            .to_der()
            .map_err(|e| Error::Identity(e.to_string()))?;
        Ok(CertificateDer::from(der))
    }

    /// Validity window of the issuing certificate.
    pub fn issuer_validity(&self) -> (SystemTime, SystemTime) {
        (system_time(self.not_before), system_time(self.not_after))
    }

    /// Server configuration presenting the issuing certificate itself, used when the listener
    /// accepts TLS from clients.
    pub fn inbound_server_config(&self) -> Result<ServerConfig, Error> {
        let server_cfg = ServerConfig::builder_with_provider(Arc::clone(&self.provider))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![self.issuer_der()?], self.private_key.clone_key())?;

        Ok(server_cfg)
    }

    fn gen_cert(
        &self,
        host: &str,
        not_before: i64,
        not_after: i64,
    ) -> Result<CertificateDer<'static>, ErrorStack> {
        let mut name_builder = X509NameBuilder::new()?;
        name_builder.append_entry_by_text("O", &self.organization)?;
        name_builder.append_entry_by_text("CN", host)?;
        let name = name_builder.build();

        let mut x509_builder = X509Builder::new()?;
        x509_builder.set_subject_name(&name)?;
        x509_builder.set_version(2)?;

        x509_builder.set_not_before(Asn1Time::from_unix(not_before)?.as_ref())?;
        x509_builder.set_not_after(Asn1Time::from_unix(not_after)?.as_ref())?;

        x509_builder.set_pubkey(&self.pkey)?;
        x509_builder.set_issuer_name(self.ca_cert.subject_name())?;

        let mut alternative_name = SubjectAlternativeName::new();
        if host.parse::<IpAddr>().is_ok() {
            alternative_name.ip(host);
        } else {
            alternative_name.dns(host);
        }
        let alternative_name =
            alternative_name.build(&x509_builder.x509v3_context(Some(&self.ca_cert), None))?;
        x509_builder.append_extension(alternative_name)?;

        let serial_number = random_serial()?;
        x509_builder.set_serial_number(&serial_number)?;

        x509_builder.sign(&self.pkey, self.hash)?;
        let x509 = x509_builder.build();
        Ok(CertificateDer::from(x509.to_der()?))
    }
}

impl CertificateAuthority for OpensslAuthority {
    fn issue_leaf(&self, host: &str, valid_until: SystemTime) -> Result<LeafCertificate, Error> {
        let now = unix_now();
        if self.not_after <= now {
            return Err(Error::IssuerExpired);
        }

        let not_before = (now - NOT_BEFORE_OFFSET).max(self.not_before);
        let not_after = system_to_unix(valid_until).min(self.not_after);

        debug!("Issuing certificate for {}", host);
        let cert = self
            .gen_cert(host, not_before, not_after)
            .map_err(Error::Issuance)?;
        let key = CertifiedKey::new(vec![cert], Arc::clone(&self.signing_key));

        Ok(LeafCertificate::new(Arc::new(key), system_time(not_after)))
    }
}

fn generate_private_key() -> Result<PKey<Private>, ErrorStack> {
    PKey::from_rsa(Rsa::generate(RSA_BITS)?)
}

fn load_private_key(path: &Path) -> Option<PKey<Private>> {
    let pem = fs::read(path)
        .inspect_err(|e| debug!("Unable to read {}: {}", path.display(), e))
        .ok()?;

    match PKey::private_key_from_pem(&pem) {
        Ok(pkey) if pkey.rsa().is_ok() && pkey.bits() >= RSA_BITS => Some(pkey),
        Ok(_) => {
            warn!(
                "Ignoring {}: not an RSA key of at least {} bits",
                path.display(),
                RSA_BITS
            );
            None
        }
        Err(e) => {
            warn!("Ignoring {}: {}", path.display(), e);
            None
        }
    }
}

fn load_certificate(path: &Path, pkey: &PKey<Private>) -> Option<X509> {
    let pem = fs::read(path)
        .inspect_err(|e| debug!("Unable to read {}: {}", path.display(), e))
        .ok()?;

    let check = || -> Result<Option<X509>, ErrorStack> {
        let cert = X509::from_pem(&pem)?;

        if !cert.public_key()?.public_eq(pkey) {
            warn!("Ignoring {}: does not match signing key", path.display());
            return Ok(None);
        }

        let renew_after =
            Asn1Time::from_unix(unix_now() + ISSUER_RENEWAL_WINDOW.as_secs() as i64)?;
        if cert.not_after() < renew_after.as_ref() {
            info!("Issuing certificate {} is about to expire", path.display());
            return Ok(None);
        }

        Ok(Some(cert))
    };

    check()
        .inspect_err(|e| warn!("Ignoring {}: {}", path.display(), e))
        .ok()
        .flatten()
}

fn write_private_key(path: &Path, pem: &[u8]) -> io::Result<()> {
    create_parent(path)?;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    // An existing file keeps its mode on open.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    file.write_all(pem)
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

pub(crate) fn self_signed(
    pkey: &PKey<Private>,
    organization: &str,
    common_name: &str,
    not_before: i64,
    not_after: i64,
) -> Result<X509, ErrorStack> {
    let mut name_builder = X509NameBuilder::new()?;
    name_builder.append_entry_by_text("O", organization)?;
    name_builder.append_entry_by_text("CN", common_name)?;
    let name = name_builder.build();

    let mut x509_builder = X509Builder::new()?;
    x509_builder.set_version(2)?;
    let serial_number = random_serial()?;
    x509_builder.set_serial_number(&serial_number)?;
    x509_builder.set_subject_name(&name)?;
    x509_builder.set_issuer_name(&name)?;
    x509_builder.set_pubkey(pkey)?;
    x509_builder.set_not_before(Asn1Time::from_unix(not_before)?.as_ref())?;
    x509_builder.set_not_after(Asn1Time::from_unix(not_after)?.as_ref())?;

    x509_builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
    x509_builder.append_extension(
        KeyUsage::new()
            .critical()
            .key_cert_sign()
            .crl_sign()
            .digital_signature()
            .build()?,
    )?;
    let subject_key_identifier =
        SubjectKeyIdentifier::new().build(&x509_builder.x509v3_context(None, None))?;
    x509_builder.append_extension(subject_key_identifier)?;

    x509_builder.sign(pkey, MessageDigest::sha256())?;
    Ok(x509_builder.build())
}

fn random_serial() -> Result<Asn1Integer, ErrorStack> {
    let mut serial_number = [0; 16];
    rand::rand_bytes(&mut serial_number)?;

    let serial_number = BigNum::from_slice(&serial_number)?;
    Asn1Integer::from_bn(&serial_number)
}

fn unix_time(time: &Asn1TimeRef) -> Result<i64, ErrorStack> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    Ok(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

fn unix_now() -> i64 {
    system_to_unix(SystemTime::now())
}

fn system_to_unix(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

fn system_time(unix: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(unix.max(0) as u64)
}
