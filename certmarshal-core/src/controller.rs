//! Controller.
//!
//! Owns the status map, fans transitions out concurrently one Tokio task
//! per eligible (cert-id, key-type) pair, joins before sleeping, and
//! serializes configuration reloads with tick boundaries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use certmarshal_config::CertmarshalConfig;
use certmarshal_tls::KeyType;
use tokio::sync::mpsc;

use crate::classifier::classify;
use crate::driver::DriverContext;
use crate::path::PathResolver;
use crate::state::{CertificateState, Status};

/// Default interval between ticks.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Key into the controller's status map.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatusKey {
    pub cert_id: String,
    pub key_type: KeyType,
}

/// Looks up the handler for `status` and runs it, returning the next
/// status. Mirrors the table in the order-driver section: idle statuses
/// return unchanged.
async fn run_handler(
    driver: &DriverContext,
    cert_id: &str,
    key_type: KeyType,
    config: &certmarshal_config::CertificateConfig,
    status: Status,
    now: SystemTime,
) -> Status {
    match status {
        Status::Initial | Status::SelfSigned | Status::NeedsRenewal | Status::Expired | Status::SubjectsChanged => {
            driver.new_certificate(cert_id, key_type, config).await
        }
        Status::CsrPushed => driver.handle_pushed_csr(cert_id, key_type, config).await,
        Status::ChallengesPushed => {
            let id = crate::driver::csr_id(
                &config.cn,
                &config.san_set(),
                &load_spki(driver, cert_id, key_type),
            );
            driver
                .handle_pushed_challenges(cert_id, key_type, &id, &config.account)
                .await
        }
        Status::ChallengesValidated => {
            let id = crate::driver::csr_id(
                &config.cn,
                &config.san_set(),
                &load_spki(driver, cert_id, key_type),
            );
            driver.handle_validated_challenges(cert_id, key_type, &id, config).await
        }
        Status::OrderFinalized | Status::CertificateIssued => {
            let id = crate::driver::csr_id(
                &config.cn,
                &config.san_set(),
                &load_spki(driver, cert_id, key_type),
            );
            driver
                .handle_order_finalized(cert_id, key_type, &id, &config.account)
                .await
        }
        Status::ReadyToBePushed => driver.handle_ready_to_be_pushed(cert_id, key_type, config, now),
        Status::Valid | Status::ChallengesRejected | Status::AcmeChiefError => status,
    }
}

fn load_spki(driver: &DriverContext, cert_id: &str, key_type: KeyType) -> Vec<u8> {
    use crate::path::Kind;
    let path = driver.paths.private_key(cert_id, key_type, Kind::New);
    certmarshal_tls::codec::load_private_key(&path)
        .map(|k| k.public_key_der())
        .unwrap_or_default()
}

/// A pending configuration reload, posted by the SIGHUP listener and
/// drained by the controller between ticks.
pub struct ReloadRequest;

/// Drives every configured (cert-id, key-type) pair to completion, tick
/// after tick, until told to stop.
pub struct Controller {
    driver: DriverContext,
    config: CertmarshalConfig,
    status: HashMap<StatusKey, CertificateState>,
}

impl Controller {
    pub fn new(driver: DriverContext, config: CertmarshalConfig) -> Self {
        let mut controller = Self {
            driver,
            config,
            status: HashMap::new(),
        };
        controller.rebuild_status_map(SystemTime::now());
        controller
    }

    /// Recomputes the status map from scratch via the classifier, for
    /// every configured cert-id and key type. Used at startup and after
    /// every reload.
    pub fn rebuild_status_map(&mut self, now: SystemTime) {
        let mut next = HashMap::new();
        for (cert_id, cert_config) in &self.config.certificates {
            for key_type in KeyType::ALL {
                let status = classify(&self.driver.paths, cert_id, key_type, cert_config, now);
                next.insert(
                    StatusKey {
                        cert_id: cert_id.clone(),
                        key_type,
                    },
                    CertificateState::new(status, now),
                );
            }
        }
        self.status = next;
    }

    /// Writes snake-oil placeholders for any pair currently `Initial` or
    /// `SelfSigned` so consumers always see *some* valid file.
    pub fn create_initial_certs(&self) {
        for (key, state) in &self.status {
            if matches!(state.status(), Status::Initial | Status::SelfSigned) {
                if let Err(err) = self.driver.create_initial_certs(&key.cert_id, key.key_type) {
                    tracing::error!(cert_id = %key.cert_id, ?key.key_type, error = %err, "failed to write snake-oil certificate");
                }
            }
        }
    }

    /// Runs one tick: dispatches every eligible pair concurrently, joins,
    /// and applies the returned statuses.
    pub async fn tick(&mut self) {
        let now = SystemTime::now();
        let eligible: Vec<StatusKey> = self
            .status
            .iter()
            .filter(|(_, state)| state.retry(now))
            .map(|(key, _)| key.clone())
            .collect();

        let mut tasks = Vec::with_capacity(eligible.len());
        for key in eligible {
            let Some(cert_config) = self.config.certificates.get(&key.cert_id).cloned() else {
                continue;
            };
            let current = self.status.get(&key).map(|s| s.status()).unwrap_or(Status::Initial);
            let driver = &self.driver;
            tasks.push(async move {
                let next = run_handler(driver, &key.cert_id, key.key_type, &cert_config, current, now).await;
                (key, next)
            });
        }

        let results = futures::future::join_all(tasks).await;
        for (key, next) in results {
            if let Some(state) = self.status.get_mut(&key) {
                tracing::info!(cert_id = %key.cert_id, key_type = ?key.key_type, from = ?state.status(), to = ?next, "status transition");
                state.set_status(next, now);
            }
        }

        self.create_initial_certs();
    }

    /// Replaces the configuration and recomputes the status map,
    /// preserving no prior state (per §4.7, the classifier re-derives
    /// everything from disk).
    pub fn reload(&mut self, config: CertmarshalConfig) {
        let removed: Vec<&String> = self
            .config
            .certificates
            .keys()
            .filter(|id| !config.certificates.contains_key(*id))
            .collect();
        let added: Vec<&String> = config
            .certificates
            .keys()
            .filter(|id| !self.config.certificates.contains_key(*id))
            .collect();
        tracing::info!(removed = ?removed, added = ?added, "configuration reloaded");

        self.config = config;
        self.rebuild_status_map(SystemTime::now());
        self.create_initial_certs();
    }

    /// Runs the main loop until `shutdown` resolves. Reload requests are
    /// drained only between ticks, never while handler tasks are running.
    pub async fn run(
        &mut self,
        mut reload_rx: mpsc::Receiver<CertmarshalConfig>,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) {
        self.create_initial_certs();
        loop {
            if shutdown.try_recv().is_ok() {
                tracing::info!("shutdown requested, exiting after in-flight tasks drain");
                return;
            }

            while let Ok(new_config) = reload_rx.try_recv() {
                self.reload(new_config);
            }

            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
                _ = &mut shutdown => {
                    tracing::info!("shutdown requested during sleep, exiting");
                    return;
                }
            }
        }
    }
}
