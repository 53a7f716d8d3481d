//! Path resolver.
//!
//! Pure mapping from `(cert-id, key-type, kind, public/private, cert-type)`
//! to a file under the certificates directory. No function in this module
//! touches the filesystem.

use std::path::{Path, PathBuf};

use certmarshal_tls::{CertificateType, KeyType};

/// Which tree a path lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// In-progress material, not yet promoted.
    New,
    /// Currently published material.
    Live,
}

impl Kind {
    fn dir_name(&self) -> &'static str {
        match self {
            Kind::New => "new",
            Kind::Live => "live",
        }
    }
}

/// Resolves paths under a certificates-directory root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to a private key. Ignores `cert_type` — a key type has exactly
    /// one private key regardless of how many public variants exist.
    pub fn private_key(&self, cert_id: &str, key_type: KeyType, kind: Kind) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join("private")
            .join(cert_id)
            .join(format!("{}.pem", key_type.id()))
    }

    /// Path to a public certificate variant.
    pub fn public_cert(
        &self,
        cert_id: &str,
        key_type: KeyType,
        kind: Kind,
        cert_type: CertificateType,
    ) -> PathBuf {
        self.root
            .join(kind.dir_name())
            .join("public")
            .join(cert_id)
            .join(format!("{}.{}.pem", key_type.id(), cert_type.id()))
    }

    /// Scratch directory for an in-flight CSR.
    pub fn csr(&self, cert_id: &str, key_type: KeyType) -> PathBuf {
        self.root
            .join("csrs")
            .join(cert_id)
            .join(format!("{}.csr", key_type.id()))
    }

    /// Published HTTP-01 challenge response file, keyed by token.
    pub fn http01_challenge(&self, token: &str) -> PathBuf {
        self.root.join("http-01").join(token)
    }

    /// Published DNS-01 challenge response file, keyed by validation domain.
    pub fn dns01_challenge(&self, validation_domain: &str) -> PathBuf {
        self.root.join("dns-01").join(validation_domain)
    }
}

/// Resolves account material under the (read-only, except for this
/// subtree) configuration directory.
#[derive(Debug, Clone)]
pub struct AccountPathResolver {
    config_root: PathBuf,
}

impl AccountPathResolver {
    pub fn new(config_root: impl Into<PathBuf>) -> Self {
        Self {
            config_root: config_root.into(),
        }
    }

    pub fn account_dir(&self, account_id: &str) -> PathBuf {
        self.config_root.join("accounts").join(account_id)
    }

    pub fn account_credentials(&self, account_id: &str) -> PathBuf {
        self.account_dir(account_id).join("credentials.json")
    }
}
