//! X.509 codec: key generation, CSR construction, self-signed "snake oil"
//! certificates, and PEM load/save.
//!
//! This module is the daemon's only place that touches `rcgen`/`x509-parser`
//! directly; everything above it works with the types defined here.

use std::path::Path;
use std::time::{Duration, SystemTime};

use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use thiserror::Error;
use x509_parser::prelude::*;

/// Closed set of key types the daemon issues material for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    EcPrime256v1,
    Rsa2048,
}

impl KeyType {
    pub const ALL: [KeyType; 2] = [KeyType::EcPrime256v1, KeyType::Rsa2048];

    /// Stable identifier used in paths and configuration.
    pub fn id(&self) -> &'static str {
        match self {
            KeyType::EcPrime256v1 => "ec-prime256v1",
            KeyType::Rsa2048 => "rsa-2048",
        }
    }

    /// Generates a fresh private key of this type.
    ///
    /// `rcgen` doesn't expose RSA key generation directly (it has no RSA
    /// keypair generator), so RSA keys are generated with `rsa` and wrapped
    /// as a `KeyPair` via its DER `TryFrom`.
    pub fn generate(&self) -> Result<KeyPair, X509Error> {
        match self {
            KeyType::EcPrime256v1 => {
                KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| X509Error::KeyGen(e.to_string()))
            }
            KeyType::Rsa2048 => generate_rsa_2048(),
        }
    }
}

fn generate_rsa_2048() -> Result<KeyPair, X509Error> {
    use rsa::pkcs8::EncodePrivateKey;
    use rsa::RsaPrivateKey;

    let mut rng = rand::rngs::OsRng;
    let private_key =
        RsaPrivateKey::new(&mut rng, 2048).map_err(|e| X509Error::KeyGen(format!("rsa keygen: {e}")))?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(|e| X509Error::KeyGen(format!("rsa pkcs8 encode: {e}")))?;
    KeyPair::try_from(der.as_bytes()).map_err(|e| X509Error::KeyGen(e.to_string()))
}

/// Variants of public certificate material, differing only in how much of
/// the chain is written out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateType {
    /// Leaf certificate only.
    CertOnly,
    /// Leaf plus intermediates, no root.
    Chain,
    /// Leaf plus intermediates plus the issuing root, as delivered by the CA.
    FullChain,
}

impl CertificateType {
    pub const ALL: [CertificateType; 3] =
        [CertificateType::CertOnly, CertificateType::Chain, CertificateType::FullChain];

    pub fn id(&self) -> &'static str {
        match self {
            CertificateType::CertOnly => "cert_only",
            CertificateType::Chain => "chain",
            CertificateType::FullChain => "full_chain",
        }
    }
}

#[derive(Debug, Error)]
pub enum X509Error {
    #[error("key generation failed: {0}")]
    KeyGen(String),

    #[error("CSR construction failed: {0}")]
    Csr(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PEM contains no certificate")]
    EmptyChain,

    #[error("certificate parse error: {0}")]
    Parse(String),
}

/// An in-memory PEM-encoded certificate chain (one or more CERTIFICATE
/// blocks, leaf first).
#[derive(Debug, Clone)]
pub struct CertificateChain {
    /// Each element is one `-----BEGIN CERTIFICATE-----` block, in order.
    pub blocks: Vec<String>,
}

impl CertificateChain {
    pub fn from_pem(pem: &str) -> Result<Self, X509Error> {
        let blocks = split_pem_blocks(pem);
        if blocks.is_empty() {
            return Err(X509Error::EmptyChain);
        }
        Ok(Self { blocks })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, X509Error> {
        let pem = std::fs::read_to_string(path)?;
        Self::from_pem(&pem)
    }

    pub fn save(&self, path: impl AsRef<Path>, variant: CertificateType) -> Result<(), X509Error> {
        let selected: &[String] = match variant {
            CertificateType::CertOnly => &self.blocks[..1.min(self.blocks.len())],
            CertificateType::Chain | CertificateType::FullChain => &self.blocks,
        };
        let joined = selected.join("\n");
        write_atomic(path, joined.as_bytes())
    }

    /// Parses the leaf (first) certificate for subject/validity inspection.
    pub fn leaf(&self) -> Result<ParsedCertificate<'_>, X509Error> {
        let pem = self
            .blocks
            .first()
            .ok_or(X509Error::EmptyChain)?;
        ParsedCertificate::from_pem_block(pem)
    }
}

/// Borrowed view over the parsed leaf certificate of a chain.
pub struct ParsedCertificate<'a> {
    der: Vec<u8>,
    _marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> ParsedCertificate<'a> {
    fn from_pem_block(pem: &str) -> Result<Self, X509Error> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| X509Error::Parse(e.to_string()))?;
        Ok(Self {
            der: pem.contents,
            _marker: std::marker::PhantomData,
        })
    }

    fn parsed(&self) -> Result<X509Certificate<'_>, X509Error> {
        let (_, cert) = X509Certificate::from_der(&self.der).map_err(|e| X509Error::Parse(e.to_string()))?;
        Ok(cert)
    }

    pub fn common_name(&self) -> Result<String, X509Error> {
        let cert = self.parsed()?;
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(cn)
    }

    pub fn subject_alt_names(&self) -> Result<Vec<String>, X509Error> {
        let cert = self.parsed()?;
        let mut names = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    names.push(dns.to_string());
                }
            }
        }
        Ok(names)
    }

    pub fn is_self_signed(&self) -> Result<bool, X509Error> {
        let cert = self.parsed()?;
        Ok(cert.subject() == cert.issuer())
    }

    pub fn not_before(&self) -> Result<SystemTime, X509Error> {
        let cert = self.parsed()?;
        Ok(asn1_time_to_system_time(cert.validity().not_before))
    }

    pub fn not_after(&self) -> Result<SystemTime, X509Error> {
        let cert = self.parsed()?;
        Ok(asn1_time_to_system_time(cert.validity().not_after))
    }

    pub fn is_expired(&self, now: SystemTime) -> Result<bool, X509Error> {
        Ok(self.not_after()? <= now)
    }

    /// Fires when less than a third of the certificate's lifetime remains.
    pub fn needs_renewal(&self, now: SystemTime) -> Result<bool, X509Error> {
        let not_before = self.not_before()?;
        let not_after = self.not_after()?;
        let lifetime = not_after
            .duration_since(not_before)
            .unwrap_or(Duration::ZERO);
        let remaining = not_after.duration_since(now).unwrap_or(Duration::ZERO);
        Ok(remaining.as_secs_f64() < lifetime.as_secs_f64() / 3.0)
    }
}

fn asn1_time_to_system_time(t: ASN1Time) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(t.timestamp().max(0) as u64)
}

fn split_pem_blocks(pem: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut in_block = false;
    for line in pem.lines() {
        if line.starts_with("-----BEGIN CERTIFICATE-----") {
            in_block = true;
            current.clear();
        }
        if in_block {
            current.push_str(line);
            current.push('\n');
        }
        if line.starts_with("-----END CERTIFICATE-----") {
            in_block = false;
            blocks.push(std::mem::take(&mut current));
        }
    }
    blocks
}

/// Writes `contents` to `path` via a temp-file-then-rename so a reader never
/// observes a partially written file (crash-safety for `live/` updates).
pub fn write_atomic(path: impl AsRef<Path>, contents: &[u8]) -> Result<(), X509Error> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!(
        "{}.tmp",
        path.extension().and_then(|e| e.to_str()).unwrap_or("new")
    ));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Saves a private key as PEM (atomic write).
pub fn save_private_key(key: &KeyPair, path: impl AsRef<Path>) -> Result<(), X509Error> {
    write_atomic(path, key.serialize_pem().as_bytes())
}

/// Loads a PEM-encoded private key.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<KeyPair, X509Error> {
    let pem = std::fs::read_to_string(path)?;
    KeyPair::from_pem(&pem).map_err(|e| X509Error::Parse(e.to_string()))
}

/// Builds a DER-encoded CSR for the given CN/SAN set and key.
///
/// The algorithm is inferred from the key: RSA keys produce an
/// RSA-SHA256-signed CSR, everything else (our only other key type is
/// P-256) an ECDSA-SHA256-signed one.
pub fn build_csr(cn: &str, sni: &[String], key: &KeyPair) -> Result<Vec<u8>, X509Error> {
    let mut params = CertificateParams::new(sni.to_vec()).map_err(|e| X509Error::Csr(e.to_string()))?;
    params.distinguished_name.push(DnType::CommonName, cn);
    let csr = params
        .serialize_request(key)
        .map_err(|e| X509Error::Csr(e.to_string()))?;
    Ok(csr.der().to_vec())
}

/// Generates a locally self-signed placeholder ("snake oil") certificate,
/// valid for a week, so consumers always have something to read before the
/// first real issuance completes.
pub fn snake_oil_certificate(key: &KeyPair) -> Result<CertificateChain, X509Error> {
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(|e| X509Error::Csr(e.to_string()))?;
    params.distinguished_name.push(DnType::CommonName, "Snakeoil cert");
    params.not_before = rcgen::date_time_ymd(2000, 1, 1);
    params.not_after = rcgen::date_time_ymd(2000, 1, 7);
    let cert = params
        .self_signed(key)
        .map_err(|e| X509Error::Csr(e.to_string()))?;
    CertificateChain::from_pem(&cert.pem())
}
