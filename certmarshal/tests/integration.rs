//! End-to-end scenarios for the certificate lifecycle, driven against an
//! in-process fake ACME session since no live CA is reachable from this
//! test suite.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use certmarshal_config::{load_from_str, CertificateConfig};
use certmarshal_core::classifier::classify;
use certmarshal_core::driver::DriverContext;
use certmarshal_core::path::{Kind, PathResolver};
use certmarshal_core::state::Status;
use certmarshal_tls::codec::{save_private_key, snake_oil_certificate};
use certmarshal_tls::session::{AcmeSession, ChallengeKind, ChallengeMap, ChallengeRecord, SessionError};
use certmarshal_tls::{CertificateChain, CertificateType, KeyType};
use tokio::sync::Mutex;

const CONFIG_YAML: &str = r#"
accounts:
  - id: letsencrypt
    directory: https://acme-staging-v02.api.letsencrypt.org/directory
    default: true
certificates:
  test:
    CN: acmechieftest.beta.wmflabs.org
    SNI:
      - acmechieftest.beta.wmflabs.org
    challenge: http-01
    staging_time: 0
"#;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Valid,
    NeverValidates,
    Invalid,
}

struct FakeOrder {
    identifiers: Vec<String>,
    outcome: Outcome,
    finalized: bool,
}

/// Resolves every order per a fixed outcome and a caller-supplied issued
/// chain, recording enough to assert on call shape.
struct FakeSession {
    outcome: Outcome,
    issued: CertificateChain,
    orders: Mutex<HashMap<String, FakeOrder>>,
}

impl FakeSession {
    fn new(outcome: Outcome, issued: CertificateChain) -> Self {
        Self {
            outcome,
            issued,
            orders: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl AcmeSession for FakeSession {
    async fn submit_csr(&self, csr_id: &str, _csr_der: Vec<u8>, identifiers: &[String]) -> Result<(), SessionError> {
        self.orders.lock().await.insert(
            csr_id.to_string(),
            FakeOrder {
                identifiers: identifiers.to_vec(),
                outcome: self.outcome,
                finalized: false,
            },
        );
        Ok(())
    }

    async fn challenges(&self, csr_id: &str) -> Result<ChallengeMap, SessionError> {
        let orders = self.orders.lock().await;
        let order = orders
            .get(csr_id)
            .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;
        let mut map: ChallengeMap = HashMap::new();
        for identifier in &order.identifiers {
            map.entry(ChallengeKind::Http01).or_default().push(ChallengeRecord {
                identifier: identifier.clone(),
                token: format!("token-{identifier}"),
                key_authorization: format!("key-auth-{identifier}"),
            });
        }
        Ok(map)
    }

    async fn push_solved_challenges(&self, csr_id: &str, _challenge_type: ChallengeKind) -> Result<(), SessionError> {
        self.orders
            .lock()
            .await
            .get(csr_id)
            .map(|_| ())
            .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))
    }

    async fn finalize_order(&self, csr_id: &str) -> Result<(), SessionError> {
        let mut orders = self.orders.lock().await;
        let order = orders
            .get_mut(csr_id)
            .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;
        match order.outcome {
            Outcome::Valid => {
                order.finalized = true;
                Ok(())
            }
            Outcome::NeverValidates => Err(SessionError::ChallengeNotValidated),
            Outcome::Invalid => Err(SessionError::InvalidChallenge("fake rejection".into())),
        }
    }

    async fn get_certificate(&self, csr_id: &str) -> Result<CertificateChain, SessionError> {
        let orders = self.orders.lock().await;
        let order = orders
            .get(csr_id)
            .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;
        if !order.finalized {
            return Err(SessionError::CertificateNotReady);
        }
        Ok(self.issued.clone())
    }
}

/// Builds a fake issued chain the way a real CA would hand one back: a
/// leaf cross-signed by a distinct CA key, not self-signed.
fn issued_chain(cn: &str, sni: &[String]) -> CertificateChain {
    let ca_key = KeyType::EcPrime256v1.generate().unwrap();
    let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "Fake Test CA");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.not_before = rcgen::date_time_ymd(2026, 1, 1);
    ca_params.not_after = rcgen::date_time_ymd(2030, 1, 1);
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let leaf_key = KeyType::EcPrime256v1.generate().unwrap();
    let mut params = rcgen::CertificateParams::new(sni.to_vec()).unwrap();
    params.distinguished_name.push(rcgen::DnType::CommonName, cn);
    params.not_before = rcgen::date_time_ymd(2026, 1, 1);
    params.not_after = rcgen::date_time_ymd(2030, 1, 1);
    let cert = params.signed_by(&leaf_key, &ca_cert, &ca_key).unwrap();
    CertificateChain::from_pem(&cert.pem()).unwrap()
}

fn test_driver(certs_dir: &std::path::Path, outcome: Outcome, cn: &str, sni: &[String]) -> DriverContext {
    let mut sessions: HashMap<String, Arc<dyn AcmeSession>> = HashMap::new();
    sessions.insert(
        "letsencrypt".to_string(),
        Arc::new(FakeSession::new(outcome, issued_chain(cn, sni))),
    );
    DriverContext {
        paths: PathResolver::new(certs_dir),
        sessions,
        dns01: None,
    }
}

fn test_config() -> CertificateConfig {
    let config = load_from_str(CONFIG_YAML).unwrap();
    config.certificates.get("test").unwrap().clone()
}

#[tokio::test]
async fn fresh_http01_issuance_reaches_valid() {
    let dir = tempfile::tempdir().unwrap();
    let cert_config = test_config();

    let driver = test_driver(dir.path(), Outcome::Valid, &cert_config.cn, &cert_config.sni);

    for key_type in KeyType::ALL {
        driver.create_initial_certs("test", key_type).unwrap();
        let now = SystemTime::now();
        let status = classify(&driver.paths, "test", key_type, &cert_config, now);
        assert_eq!(status, Status::SelfSigned);

        let next = driver.new_certificate("test", key_type, &cert_config).await;
        assert_eq!(next, Status::CsrPushed);

        let next = driver.handle_pushed_csr("test", key_type, &cert_config).await;

        let final_status = if next == Status::ReadyToBePushed {
            driver.handle_ready_to_be_pushed("test", key_type, &cert_config, now)
        } else {
            next
        };
        assert_eq!(final_status, Status::Valid);

        let live_path = driver.paths.public_cert("test", key_type, Kind::Live, CertificateType::FullChain);
        let live = CertificateChain::load(&live_path).unwrap();
        assert!(!live.leaf().unwrap().is_self_signed().unwrap());
    }
}

#[tokio::test]
async fn challenge_published_to_wrong_path_is_not_locally_validated() {
    let dir = tempfile::tempdir().unwrap();
    let cert_config = test_config();
    let driver = test_driver(dir.path(), Outcome::Valid, &cert_config.cn, &cert_config.sni);
    let key_type = KeyType::EcPrime256v1;

    let next = driver.new_certificate("test", key_type, &cert_config).await;
    assert_eq!(next, Status::CsrPushed);

    // Corrupt the http-01 challenge file so local validation fails.
    let path = driver.paths.http01_challenge("token-acmechieftest.beta.wmflabs.org");
    std::fs::write(&path, "wrong-value").unwrap();

    let rejected = driver.handle_pushed_csr("test", key_type, &cert_config).await;
    assert_eq!(rejected, Status::ChallengesRejected);
}

#[tokio::test]
async fn ca_side_validation_failure_is_terminal_for_the_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let cert_config = test_config();
    let driver = test_driver(dir.path(), Outcome::Invalid, &cert_config.cn, &cert_config.sni);
    let key_type = KeyType::EcPrime256v1;

    driver.new_certificate("test", key_type, &cert_config).await;
    let status = driver.handle_pushed_csr("test", key_type, &cert_config).await;
    assert_eq!(status, Status::ChallengesRejected);
}

#[tokio::test]
async fn order_that_never_validates_stays_in_challenges_pushed() {
    let dir = tempfile::tempdir().unwrap();
    let cert_config = test_config();
    let driver = test_driver(dir.path(), Outcome::NeverValidates, &cert_config.cn, &cert_config.sni);
    let key_type = KeyType::EcPrime256v1;

    driver.new_certificate("test", key_type, &cert_config).await;
    let status = driver.handle_pushed_csr("test", key_type, &cert_config).await;
    assert_eq!(status, Status::ChallengesPushed);
}

#[test]
fn zero_staging_time_promotes_on_first_check() {
    let dir = tempfile::tempdir().unwrap();
    let cn = "example.org".to_string();
    let sni = vec![cn.clone()];
    let driver = test_driver(dir.path(), Outcome::Valid, &cn, &sni);
    let key_type = KeyType::EcPrime256v1;

    let key = key_type.generate().unwrap();
    let chain = issued_chain(&cn, &sni);
    save_private_key(&key, &driver.paths.private_key("example", key_type, Kind::New)).unwrap();
    for cert_type in CertificateType::ALL {
        chain
            .save(driver.paths.public_cert("example", key_type, Kind::New, cert_type), cert_type)
            .unwrap();
    }

    let mut config = test_config();
    config.staging_time = Duration::from_secs(0);
    let status = driver.handle_ready_to_be_pushed("example", key_type, &config, SystemTime::now());
    assert_eq!(status, Status::Valid);
}

#[test]
fn snake_oil_material_classifies_as_self_signed() {
    let key = KeyType::EcPrime256v1.generate().unwrap();
    let chain = snake_oil_certificate(&key).unwrap();
    assert!(chain.leaf().unwrap().is_self_signed().unwrap());
}
