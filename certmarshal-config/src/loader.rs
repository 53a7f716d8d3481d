//! Loads, merges, and validates the daemon's YAML configuration.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::model::{Account, CertificateConfig, ChallengeKind, CertmarshalConfig, Dns01Config};

const DEFAULT_STAGING_TIME: Duration = Duration::from_secs(3600);
const DEFAULT_ZONE_UPDATE_CMD_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    accounts: Vec<RawAccount>,
    #[serde(default)]
    certificates: HashMap<String, RawCertificate>,
    #[serde(default)]
    challenges: RawChallenges,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    id: String,
    directory: String,
    #[serde(default)]
    default: bool,
}

#[derive(Debug, Deserialize)]
struct RawCertificate {
    #[serde(rename = "CN")]
    cn: String,
    #[serde(rename = "SNI")]
    sni: Vec<String>,
    challenge: ChallengeKind,
    account: Option<String>,
    staging_time: Option<u64>,
    #[serde(default)]
    authorized_hosts: Vec<String>,
    #[serde(default)]
    authorized_regexes: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChallenges {
    #[serde(rename = "dns-01")]
    dns01: Option<RawDns01>,
}

#[derive(Debug, Deserialize)]
struct RawDns01 {
    #[serde(default)]
    validation_dns_servers: Vec<String>,
    #[serde(default)]
    sync_dns_servers: Vec<String>,
    zone_update_cmd: Option<String>,
    zone_update_cmd_timeout: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ConfdEntry {
    certname: String,
    hostname: String,
}

/// Loads the main config file plus every YAML document under `confd_dir`,
/// validates the merged result, and returns it.
///
/// `confd_dir` need not exist; a missing directory is treated as empty.
pub fn load(config_path: impl AsRef<Path>, confd_dir: impl AsRef<Path>) -> Result<CertmarshalConfig, ConfigError> {
    let config_path = config_path.as_ref();
    let content = std::fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;

    let raw: RawConfig = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: config_path.to_path_buf(),
        source,
    })?;

    let confd_hosts = load_confd(confd_dir.as_ref())?;
    build(raw, confd_hosts)
}

/// Parses a single in-memory YAML document with no conf.d merging. Used by
/// tests and by `validate`-style one-shot checks against a string.
pub fn load_from_str(yaml: &str) -> Result<CertmarshalConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(yaml).map_err(|source| ConfigError::Parse {
        path: PathBuf::from("<memory>"),
        source,
    })?;
    build(raw, HashMap::new())
}

fn load_confd(confd_dir: &Path) -> Result<HashMap<String, Vec<String>>, ConfigError> {
    let mut hosts: HashMap<String, Vec<String>> = HashMap::new();

    let entries = match std::fs::read_dir(confd_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hosts),
        Err(source) => {
            return Err(ConfigError::Read {
                path: confd_dir.to_path_buf(),
                source,
            })
        }
    };

    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Read {
            path: confd_dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e == "yaml" || e == "yml")
            .unwrap_or(false);
        if !is_yaml {
            continue;
        }

        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let parsed: ConfdEntry = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

        hosts.entry(parsed.certname).or_default().push(parsed.hostname);
    }

    Ok(hosts)
}

fn build(raw: RawConfig, confd_hosts: HashMap<String, Vec<String>>) -> Result<CertmarshalConfig, ConfigError> {
    if raw.accounts.is_empty() {
        return Err(ConfigError::Invalid("at least one account must be configured".into()));
    }

    let explicit_defaults = raw.accounts.iter().filter(|a| a.default).count();
    if explicit_defaults > 1 {
        return Err(ConfigError::Invalid("at most one account may be marked default".into()));
    }

    let default_account = raw
        .accounts
        .iter()
        .find(|a| a.default)
        .or_else(|| raw.accounts.first())
        .map(|a| a.id.clone())
        .expect("accounts checked non-empty above");

    let accounts: Vec<Account> = raw
        .accounts
        .iter()
        .map(|a| Account {
            id: a.id.clone(),
            directory: a.directory.clone(),
            default: a.id == default_account,
        })
        .collect();
    let known_accounts: HashSet<&str> = accounts.iter().map(|a| a.id.as_str()).collect();

    let dns01 = match raw.challenges.dns01 {
        Some(raw_dns01) => {
            if let Some(cmd) = &raw_dns01.zone_update_cmd {
                verify_executable(cmd)?;
            }
            Some(Dns01Config {
                validation_dns_servers: raw_dns01.validation_dns_servers,
                sync_dns_servers: raw_dns01.sync_dns_servers,
                zone_update_cmd: raw_dns01.zone_update_cmd,
                zone_update_cmd_timeout: raw_dns01
                    .zone_update_cmd_timeout
                    .map(Duration::from_secs_f64)
                    .unwrap_or(DEFAULT_ZONE_UPDATE_CMD_TIMEOUT),
            })
        }
        None => None,
    };

    let mut certificates = HashMap::with_capacity(raw.certificates.len());
    let mut authorized_hosts: HashMap<String, HashSet<String>> = HashMap::new();
    let mut authorized_regexes: HashMap<String, Vec<Regex>> = HashMap::new();
    let mut seen_subjects: HashMap<(String, std::collections::BTreeSet<String>), String> = HashMap::new();

    for (cert_id, raw_cert) in raw.certificates {
        let account = raw_cert.account.clone().unwrap_or_else(|| default_account.clone());
        if !known_accounts.contains(account.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "certificate '{cert_id}' references unknown account '{account}'"
            )));
        }

        if raw_cert.challenge == ChallengeKind::Dns01 && dns01.is_none() {
            return Err(ConfigError::Invalid(format!(
                "certificate '{cert_id}' requests dns-01 but no challenges.dns-01 section is configured"
            )));
        }

        let subject_key = (
            raw_cert.cn.to_lowercase(),
            raw_cert.sni.iter().map(|s| s.to_lowercase()).collect(),
        );
        if let Some(existing) = seen_subjects.insert(subject_key, cert_id.clone()) {
            return Err(ConfigError::Invalid(format!(
                "certificates '{existing}' and '{cert_id}' differ only by case in CN/SNI"
            )));
        }

        let mut hosts: HashSet<String> = raw_cert.authorized_hosts.iter().cloned().collect();
        if let Some(confd) = confd_hosts.get(&cert_id) {
            hosts.extend(confd.iter().cloned());
        }
        authorized_hosts.insert(cert_id.clone(), hosts);

        let mut regexes = Vec::with_capacity(raw_cert.authorized_regexes.len());
        for pattern in &raw_cert.authorized_regexes {
            let re = Regex::new(pattern)
                .map_err(|e| ConfigError::Invalid(format!("certificate '{cert_id}' has an invalid regex '{pattern}': {e}")))?;
            regexes.push(re);
        }
        authorized_regexes.insert(cert_id.clone(), regexes);

        certificates.insert(
            cert_id,
            CertificateConfig {
                cn: raw_cert.cn,
                sni: raw_cert.sni,
                challenge: raw_cert.challenge,
                account,
                staging_time: raw_cert
                    .staging_time
                    .map(Duration::from_secs)
                    .unwrap_or(DEFAULT_STAGING_TIME),
            },
        );
    }

    Ok(CertmarshalConfig {
        accounts,
        default_account,
        certificates,
        authorized_hosts,
        authorized_regexes,
        dns01,
    })
}

#[cfg(unix)]
fn verify_executable(cmd: &str) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(cmd).map_err(|source| ConfigError::Read {
        path: PathBuf::from(cmd),
        source,
    })?;
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(ConfigError::Invalid(format!("zone-update command '{cmd}' is not executable")));
    }
    Ok(())
}

#[cfg(not(unix))]
fn verify_executable(cmd: &str) -> Result<(), ConfigError> {
    if !std::path::Path::new(cmd).exists() {
        return Err(ConfigError::Invalid(format!("zone-update command '{cmd}' does not exist")));
    }
    Ok(())
}
