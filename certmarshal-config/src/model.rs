//! Typed configuration model.
//!
//! The raw YAML shape is deserialized into `Raw*` structs (private to
//! `loader`), then validated and folded into these public types. Nothing
//! outside `loader` constructs a `CertmarshalConfig` directly so the
//! invariants below always hold once a caller has one in hand.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

/// ACME challenge kind a certificate is configured to solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeKind {
    Http01,
    Dns01,
}

/// An ACME account: opaque id plus directory URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub directory: String,
    pub default: bool,
}

/// Per-certificate configuration record.
#[derive(Debug, Clone)]
pub struct CertificateConfig {
    pub cn: String,
    pub sni: Vec<String>,
    pub challenge: ChallengeKind,
    pub account: String,
    pub staging_time: Duration,
}

impl CertificateConfig {
    /// Case-folded, deduplicated SAN set used for subject comparisons.
    pub fn san_set(&self) -> HashSet<String> {
        self.sni.iter().map(|s| s.to_lowercase()).collect()
    }
}

/// DNS-01 zone-update integration settings.
#[derive(Debug, Clone)]
pub struct Dns01Config {
    pub validation_dns_servers: Vec<String>,
    pub sync_dns_servers: Vec<String>,
    pub zone_update_cmd: Option<String>,
    pub zone_update_cmd_timeout: Duration,
}

/// Fully validated daemon configuration.
#[derive(Debug, Clone)]
pub struct CertmarshalConfig {
    pub accounts: Vec<Account>,
    pub default_account: String,
    pub certificates: HashMap<String, CertificateConfig>,
    pub authorized_hosts: HashMap<String, HashSet<String>>,
    pub authorized_regexes: HashMap<String, Vec<Regex>>,
    pub dns01: Option<Dns01Config>,
}

impl CertmarshalConfig {
    /// True iff `host` is allowed to fetch the material for `cert_id`,
    /// either by exact hostname match or by matching one of the
    /// configured regular expressions (full-match semantics).
    ///
    /// Order-independent over both sets by construction (they're
    /// unordered collections).
    pub fn check_access(&self, host: &str, cert_id: &str) -> bool {
        if let Some(hosts) = self.authorized_hosts.get(cert_id) {
            if hosts.contains(host) {
                return true;
            }
        }

        if let Some(regexes) = self.authorized_regexes.get(cert_id) {
            for re in regexes {
                if re.is_match(host) && full_match(re, host) {
                    return true;
                }
            }
        }

        false
    }

    pub fn account(&self, id: &str) -> Option<&Account> {
        self.accounts.iter().find(|a| a.id == id)
    }
}

/// `Regex::is_match` is a substring search; full-match requires the match
/// to span the entire input.
fn full_match(re: &Regex, host: &str) -> bool {
    re.find(host)
        .map(|m| m.start() == 0 && m.end() == host.len())
        .unwrap_or(false)
}
