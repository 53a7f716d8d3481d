//! Error types for certmarshal-core.

use thiserror::Error;

/// Result type for certmarshal-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for certmarshal-core.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (propagated from `certmarshal-config`).
    #[error("configuration error: {0}")]
    Config(#[from] certmarshal_config::ConfigError),

    /// X.509/ACME codec error (propagated from `certmarshal-tls`).
    #[error("TLS error: {0}")]
    Tls(#[from] certmarshal_tls::X509Error),

    /// ACME session error (propagated from `certmarshal-tls`).
    #[error("ACME session error: {0}")]
    Session(#[from] certmarshal_tls::SessionError),

    /// DNS-01 zone update subprocess error.
    #[error("DNS-01 zone update error: {0}")]
    Dns01(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error that doesn't fit another variant.
    #[error("internal error: {0}")]
    Internal(String),
}
