//! Order driver.
//!
//! Per-status transition handlers implementing the ACME issuance pipeline.
//! Every handler is idempotent with respect to the files it reads and
//! writes: a crash between two handler calls loses at most the in-memory
//! status, not the material backing the order, because the CSR id is a
//! deterministic function of what's already on disk.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::SystemTime;

use certmarshal_config::{CertificateConfig, ChallengeKind as ConfigChallengeKind, Dns01Config};
use certmarshal_tls::codec::{build_csr, load_private_key, save_private_key, snake_oil_certificate, write_atomic};
use certmarshal_tls::{CertificateChain, CertificateType, KeyType};
use certmarshal_tls::session::{AcmeSession, ChallengeKind, ChallengeMap};
use sha2::{Digest, Sha256};

use crate::dns01::{self, Dns01Challenge};
use crate::path::{Kind, PathResolver};
use crate::state::Status;

fn to_session_challenge_kind(kind: ConfigChallengeKind) -> ChallengeKind {
    match kind {
        ConfigChallengeKind::Http01 => ChallengeKind::Http01,
        ConfigChallengeKind::Dns01 => ChallengeKind::Dns01,
    }
}

/// Deterministic fingerprint of (CN, sorted-unique SANs, SPKI bytes),
/// used to join an in-flight order across process restarts.
pub fn csr_id(cn: &str, sans: &HashSet<String>, spki_der: &[u8]) -> String {
    let mut sorted: Vec<&String> = sans.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    hasher.update(cn.to_lowercase().as_bytes());
    for san in sorted {
        hasher.update(b"\0");
        hasher.update(san.to_lowercase().as_bytes());
    }
    hasher.update(b"\0");
    hasher.update(spki_der);
    hex::encode(hasher.finalize())
}

/// Everything a handler needs: where files live, how to talk to the CA,
/// and how to publish DNS-01 records. One ACME session per account, since
/// each account is bound to its own signing key and directory URL.
pub struct DriverContext {
    pub paths: PathResolver,
    pub sessions: HashMap<String, Arc<dyn AcmeSession>>,
    pub dns01: Option<Dns01Config>,
}

impl DriverContext {
    fn session(&self, cert_id: &str, account: &str) -> Option<&Arc<dyn AcmeSession>> {
        let session = self.sessions.get(account);
        if session.is_none() {
            tracing::error!(cert_id, account, "no ACME session bound for account");
        }
        session
    }

    fn identifiers(config: &CertificateConfig) -> Vec<String> {
        let mut idents = vec![config.cn.clone()];
        for sni in &config.sni {
            if !idents.iter().any(|i| i.eq_ignore_ascii_case(sni)) {
                idents.push(sni.clone());
            }
        }
        idents
    }

    /// Starts a new issuance attempt: generates a key, builds and submits
    /// a CSR, and publishes any challenges the CA hands back.
    pub async fn new_certificate(
        &self,
        cert_id: &str,
        key_type: KeyType,
        config: &CertificateConfig,
    ) -> Status {
        let key = match key_type.generate() {
            Ok(key) => key,
            Err(err) => {
                tracing::error!(cert_id, ?key_type, error = %err, "key generation failed");
                return Status::AcmeChiefError;
            }
        };
        let private_key_path = self.paths.private_key(cert_id, key_type, Kind::New);
        if let Err(err) = save_private_key(&key, &private_key_path) {
            tracing::error!(cert_id, ?key_type, error = %err, "failed to persist new private key");
            return Status::AcmeChiefError;
        }

        let identifiers = Self::identifiers(config);
        let csr_der = match build_csr(&config.cn, &config.sni, &key) {
            Ok(der) => der,
            Err(err) => {
                tracing::error!(cert_id, ?key_type, error = %err, "CSR construction failed");
                return Status::AcmeChiefError;
            }
        };
        let id = csr_id(&config.cn, &config.san_set(), &key.public_key_der());

        let Some(session) = self.session(cert_id, &config.account) else {
            return Status::AcmeChiefError;
        };
        if let Err(err) = session.submit_csr(&id, csr_der, &identifiers).await {
            tracing::warn!(cert_id, ?key_type, error = %err, "CSR submission failed");
            return Status::CsrPushed;
        }

        self.publish_challenges(cert_id, &id, config).await
    }

    async fn publish_challenges(&self, cert_id: &str, id: &str, config: &CertificateConfig) -> Status {
        let Some(session) = self.session(cert_id, &config.account) else {
            return Status::AcmeChiefError;
        };
        let challenges = match session.challenges(id).await {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(cert_id, error = %err, "failed to fetch challenges for order");
                return Status::CsrPushed;
            }
        };

        if challenges.is_empty() {
            return Status::ChallengesPushed;
        }

        let configured = to_session_challenge_kind(config.challenge);
        let Some(records) = challenges.get(&configured) else {
            tracing::warn!(cert_id, "CA did not offer the configured challenge kind");
            return Status::CsrPushed;
        };

        match configured {
            ChallengeKind::Http01 => {
                for record in records {
                    let path = self.paths.http01_challenge(&record.token);
                    if write_atomic(&path, record.key_authorization.as_bytes()).is_err() {
                        return Status::CsrPushed;
                    }
                }
            }
            ChallengeKind::Dns01 => {
                let Some(dns01_config) = &self.dns01 else {
                    tracing::error!(cert_id, "DNS-01 challenge but no dns01 configuration loaded");
                    return Status::AcmeChiefError;
                };
                let published: Vec<Dns01Challenge> = records
                    .iter()
                    .map(|r| Dns01Challenge {
                        validation_domain: format!("_acme-challenge.{}", r.identifier),
                        value: r.key_authorization.clone(),
                    })
                    .collect();
                if !dns01::publish(dns01_config, &self.paths, &published).await {
                    return Status::CsrPushed;
                }
            }
        }

        Status::CsrPushed
    }

    /// Reloads the private key, recomputes the CSR id, and asks the CA
    /// for the challenge set again so it can be locally re-verified before
    /// being pushed as solved.
    pub async fn handle_pushed_csr(
        &self,
        cert_id: &str,
        key_type: KeyType,
        config: &CertificateConfig,
    ) -> Status {
        let private_key_path = self.paths.private_key(cert_id, key_type, Kind::New);
        let key = match load_private_key(&private_key_path) {
            Ok(key) => key,
            Err(err) => {
                tracing::error!(cert_id, ?key_type, error = %err, "failed to reload private key");
                return Status::AcmeChiefError;
            }
        };
        let id = csr_id(&config.cn, &config.san_set(), &key.public_key_der());

        let Some(session) = self.session(cert_id, &config.account) else {
            return Status::AcmeChiefError;
        };
        let challenges = match session.challenges(&id).await {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(cert_id, error = %err, "failed to refetch challenges");
                return Status::CsrPushed;
            }
        };

        if !self.locally_validate(&challenges, config) {
            return Status::ChallengesRejected;
        }

        tracing::info!(cert_id, ?key_type, status = "challenges_validated", "advancing within tick");
        self.handle_validated_challenges(cert_id, key_type, &id, config).await
    }

    fn locally_validate(&self, challenges: &ChallengeMap, config: &CertificateConfig) -> bool {
        let configured = to_session_challenge_kind(config.challenge);
        let Some(records) = challenges.get(&configured) else {
            return challenges.is_empty();
        };
        records.iter().all(|record| {
            let path = match configured {
                ChallengeKind::Http01 => self.paths.http01_challenge(&record.token),
                ChallengeKind::Dns01 => self
                    .paths
                    .dns01_challenge(&format!("_acme-challenge.{}", record.identifier)),
            };
            std::fs::read_to_string(&path)
                .map(|contents| contents == record.key_authorization)
                .unwrap_or(false)
        })
    }

    /// Tells the CA the challenges for `id` are ready to validate.
    pub async fn handle_validated_challenges(
        &self,
        cert_id: &str,
        key_type: KeyType,
        id: &str,
        config: &CertificateConfig,
    ) -> Status {
        let configured = to_session_challenge_kind(config.challenge);
        let Some(session) = self.session(cert_id, &config.account) else {
            return Status::AcmeChiefError;
        };
        if let Err(err) = session.push_solved_challenges(id, configured).await {
            tracing::warn!(cert_id, error = %err, "failed to push solved challenges");
            return Status::ChallengesPushed;
        }
        tracing::info!(cert_id, ?key_type, status = "challenges_pushed", "advancing within tick");
        self.handle_pushed_challenges(cert_id, key_type, id, &config.account).await
    }

    /// Finalizes the order once the CA has validated the pushed
    /// challenges.
    pub async fn handle_pushed_challenges(
        &self,
        cert_id: &str,
        key_type: KeyType,
        id: &str,
        account: &str,
    ) -> Status {
        use certmarshal_tls::SessionError;

        let Some(session) = self.session(cert_id, account) else {
            return Status::AcmeChiefError;
        };
        match session.finalize_order(id).await {
            Ok(()) => {
                tracing::info!(cert_id, ?key_type, status = "order_finalized", "advancing within tick");
                self.handle_order_finalized(cert_id, key_type, id, account).await
            }
            Err(SessionError::ChallengeNotValidated) => Status::ChallengesPushed,
            Err(SessionError::InvalidChallenge(reason)) => {
                tracing::warn!(cert_id, reason, "CA rejected challenge");
                Status::ChallengesRejected
            }
            Err(err) => {
                tracing::warn!(cert_id, error = %err, "order finalization failed");
                Status::ChallengesPushed
            }
        }
    }

    /// Downloads the issued certificate and writes every configured
    /// public variant under `new/`.
    pub async fn handle_order_finalized(
        &self,
        cert_id: &str,
        key_type: KeyType,
        id: &str,
        account: &str,
    ) -> Status {
        let Some(session) = self.session(cert_id, account) else {
            return Status::AcmeChiefError;
        };
        let chain = match session.get_certificate(id).await {
            Ok(chain) => chain,
            Err(err) => {
                tracing::warn!(cert_id, error = %err, "certificate not ready to download yet");
                return Status::CertificateIssued;
            }
        };

        for cert_type in CertificateType::ALL {
            let path = self.paths.public_cert(cert_id, key_type, Kind::New, cert_type);
            if let Err(err) = chain.save(&path, cert_type) {
                tracing::warn!(cert_id, ?key_type, ?cert_type, error = %err, "failed to write issued certificate");
                return Status::CertificateIssued;
            }
        }

        Status::ReadyToBePushed
    }

    /// Promotes `new/` material to `live/` once the staging time has
    /// elapsed.
    pub fn handle_ready_to_be_pushed(
        &self,
        cert_id: &str,
        key_type: KeyType,
        config: &CertificateConfig,
        now: SystemTime,
    ) -> Status {
        let new_path = self.paths.public_cert(cert_id, key_type, Kind::New, CertificateType::FullChain);
        let not_before = match CertificateChain::load(&new_path).and_then(|c| c.leaf().and_then(|l| l.not_before())) {
            Ok(t) => t,
            Err(_) => return Status::CertificateIssued,
        };

        if not_before + config.staging_time > now {
            return Status::ReadyToBePushed;
        }

        self.push_live_certificate(cert_id, key_type)
    }

    /// Re-serializes the `new/` private key and every public variant into
    /// `live/`.
    pub fn push_live_certificate(&self, cert_id: &str, key_type: KeyType) -> Status {
        let new_key_path = self.paths.private_key(cert_id, key_type, Kind::New);
        let key = match load_private_key(&new_key_path) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(cert_id, ?key_type, error = %err, "failed to reload new private key for promotion");
                return Status::CertificateIssued;
            }
        };
        let live_key_path = self.paths.private_key(cert_id, key_type, Kind::Live);
        if let Err(err) = save_private_key(&key, &live_key_path) {
            tracing::warn!(cert_id, ?key_type, error = %err, "failed to promote private key");
            return Status::CertificateIssued;
        }

        for cert_type in CertificateType::ALL {
            let new_path = self.paths.public_cert(cert_id, key_type, Kind::New, cert_type);
            let live_path = self.paths.public_cert(cert_id, key_type, Kind::Live, cert_type);
            let chain = match CertificateChain::load(&new_path) {
                Ok(chain) => chain,
                Err(err) => {
                    tracing::warn!(cert_id, ?key_type, ?cert_type, error = %err, "failed to reload new certificate for promotion");
                    return Status::CertificateIssued;
                }
            };
            if let Err(err) = chain.save(&live_path, cert_type) {
                tracing::warn!(cert_id, ?key_type, ?cert_type, error = %err, "failed to promote certificate");
                return Status::CertificateIssued;
            }
        }

        Status::Valid
    }

    /// Writes a self-signed placeholder so consumers always find valid
    /// file contents even before the first real issuance completes.
    pub fn create_initial_certs(&self, cert_id: &str, key_type: KeyType) -> Result<(), certmarshal_tls::X509Error> {
        let key = key_type.generate()?;
        let chain = snake_oil_certificate(&key)?;

        let live_key_path = self.paths.private_key(cert_id, key_type, Kind::Live);
        if live_key_path.exists() {
            return Ok(());
        }
        save_private_key(&key, &live_key_path)?;
        for cert_type in CertificateType::ALL {
            let path = self.paths.public_cert(cert_id, key_type, Kind::Live, cert_type);
            chain.save(&path, cert_type)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csr_id_is_deterministic_and_case_insensitive() {
        let spki = b"fake-spki-bytes";
        let sans: HashSet<String> = ["Example.org".to_string(), "www.example.org".to_string()]
            .into_iter()
            .collect();
        let a = csr_id("example.org", &sans, spki);
        let b = csr_id("EXAMPLE.ORG", &sans, spki);
        assert_eq!(a, b);
    }

    #[test]
    fn csr_id_changes_with_san_set() {
        let spki = b"fake-spki-bytes";
        let one: HashSet<String> = ["a.example.org".to_string()].into_iter().collect();
        let two: HashSet<String> = ["a.example.org".to_string(), "b.example.org".to_string()]
            .into_iter()
            .collect();
        assert_ne!(csr_id("example.org", &one, spki), csr_id("example.org", &two, spki));
    }
}
