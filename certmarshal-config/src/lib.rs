//! Configuration model and loader for certmarshal
//!
//! Parses the daemon's YAML configuration file plus its `conf.d/` directory
//! of supplementary authorization snippets, validates the result, and
//! exposes the access-check predicate consumed by the (out-of-scope)
//! client-facing authorization API.

mod model;
mod loader;

pub use model::{
    Account, CertificateConfig, ChallengeKind, Dns01Config, CertmarshalConfig,
};
pub use loader::{load, load_from_str, ConfigError};
