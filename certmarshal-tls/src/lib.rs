//! X.509 codec and ACME session client for the certmarshal daemon.
//!
//! - [`codec`] turns key material, CSRs, and certificate chains into and
//!   out of PEM, and answers renewal/self-signed questions about a parsed
//!   leaf certificate.
//! - [`session`] wraps the RFC 8555 order/authorization/challenge/finalize
//!   flow behind a trait so the controller can be driven against a fake
//!   CA in tests.

pub mod codec;
pub mod session;

pub use codec::{CertificateChain, CertificateType, KeyType, ParsedCertificate, X509Error};
pub use session::{AcmeSession, ChallengeKind, ChallengeMap, ChallengeRecord, SessionError, SharedSession};
