//! Certificate lifecycle state machine and controller for certmarshal.
//!
//! This crate holds the parts of the daemon that aren't specific to the
//! ACME wire protocol (`certmarshal-tls`) or configuration parsing
//! (`certmarshal-config`): the path layout, the retry/backoff policy, the
//! status classifier, the order-driver transition handlers, the
//! concurrent controller loop, the DNS-01 publisher, and the config
//! reloader.

pub mod classifier;
pub mod controller;
pub mod dns01;
pub mod driver;
pub mod error;
pub mod path;
pub mod reload;
pub mod state;

pub use error::{Error, Result};

/// certmarshal version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
