//! ACME session abstraction.
//!
//! Encapsulates the RFC 8555 state machine (order -> authorization ->
//! challenge -> finalize -> download) behind a small trait so the
//! controller never talks to `instant-acme` directly and tests can run
//! against a fake session with no network access.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType as InstantChallengeType,
    Identifier, NewAccount, NewOrder, Order, OrderStatus, RetryPolicy,
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::codec::CertificateChain;

/// ACME challenge kind, mirrored from `certmarshal-config` so this crate
/// doesn't depend on the config crate just for one enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeKind {
    Http01,
    Dns01,
}

impl ChallengeKind {
    fn to_instant(self) -> InstantChallengeType {
        match self {
            ChallengeKind::Http01 => InstantChallengeType::Http01,
            ChallengeKind::Dns01 => InstantChallengeType::Dns01,
        }
    }
}

/// One outstanding challenge offered by the CA for a single identifier.
#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub identifier: String,
    pub token: String,
    pub key_authorization: String,
}

/// All outstanding challenges for an order, keyed by the kind the daemon
/// is configured to solve.
pub type ChallengeMap = HashMap<ChallengeKind, Vec<ChallengeRecord>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("account error: {0}")]
    Account(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),

    /// The CA has not yet validated the pushed challenges; the caller
    /// should leave the certificate in its current status and retry later.
    #[error("challenges not yet validated")]
    ChallengeNotValidated,

    /// The CA rejected a challenge outright; the certificate should be
    /// marked as a failed order, not merely retried.
    #[error("challenge rejected by CA: {0}")]
    InvalidChallenge(String),

    /// The order finalized but the certificate isn't ready for download
    /// yet; the caller should retry in place.
    #[error("issued certificate not yet ready")]
    CertificateNotReady,

    #[error("certificate decode error: {0}")]
    Decode(#[from] crate::codec::X509Error),
}

/// Abstraction over one ACME account's interaction with a CA, scoped to
/// the operations the order driver needs. One implementor talks to a real
/// CA via `instant-acme`; tests use an in-memory fake.
#[async_trait]
pub trait AcmeSession: Send + Sync {
    /// Creates a new order for `identifiers` and associates it with
    /// `csr_id` for the lifetime of the issuance attempt, submitting
    /// `csr_der` so a later `finalize_order` call has something to send.
    async fn submit_csr(
        &self,
        csr_id: &str,
        csr_der: Vec<u8>,
        identifiers: &[String],
    ) -> Result<(), SessionError>;

    /// Returns the outstanding challenges for `csr_id`'s order, grouped by
    /// challenge kind.
    async fn challenges(&self, csr_id: &str) -> Result<ChallengeMap, SessionError>;

    /// Tells the CA the challenges of `challenge_type` for `csr_id` are
    /// ready to be validated.
    async fn push_solved_challenges(
        &self,
        csr_id: &str,
        challenge_type: ChallengeKind,
    ) -> Result<(), SessionError>;

    /// Polls validation status and, once authorized, finalizes the order
    /// with the CSR submitted earlier.
    async fn finalize_order(&self, csr_id: &str) -> Result<(), SessionError>;

    /// Downloads the issued certificate chain for a finalized order.
    async fn get_certificate(&self, csr_id: &str) -> Result<CertificateChain, SessionError>;
}

struct OrderHandle {
    order: Order,
    csr_der: Vec<u8>,
}

/// `AcmeSession` backed by a real ACME account and directory, via
/// `instant-acme`.
pub struct InstantAcmeSession {
    account: Account,
    orders: Mutex<HashMap<String, OrderHandle>>,
}

impl InstantAcmeSession {
    /// Loads an existing account from its saved credentials, or bootstraps
    /// a new one against `directory_url` and returns the credentials so
    /// the caller can persist them under `accounts/<id>/`.
    pub async fn load(credentials: AccountCredentials) -> Result<Self, SessionError> {
        let account = Account::builder()
            .map_err(|e| SessionError::Account(e.to_string()))?
            .from_credentials(credentials)
            .await
            .map_err(|e| SessionError::Account(e.to_string()))?;
        Ok(Self {
            account,
            orders: Mutex::new(HashMap::new()),
        })
    }

    /// Registers a brand new account and returns both the session and the
    /// credentials to persist.
    pub async fn register(
        directory_url: &str,
        contact_emails: &[String],
    ) -> Result<(Self, AccountCredentials), SessionError> {
        let contact: Vec<String> = contact_emails.iter().map(|e| format!("mailto:{e}")).collect();
        let contact_refs: Vec<&str> = contact.iter().map(String::as_str).collect();
        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let builder = Account::builder().map_err(|e| SessionError::Account(e.to_string()))?;
        let (account, credentials) = builder
            .create(&new_account, directory_url.to_string(), None)
            .await
            .map_err(|e| SessionError::Account(e.to_string()))?;
        Ok((
            Self {
                account,
                orders: Mutex::new(HashMap::new()),
            },
            credentials,
        ))
    }
}

#[async_trait]
impl AcmeSession for InstantAcmeSession {
    async fn submit_csr(
        &self,
        csr_id: &str,
        csr_der: Vec<u8>,
        identifiers: &[String],
    ) -> Result<(), SessionError> {
        let idents: Vec<Identifier> = identifiers.iter().cloned().map(Identifier::Dns).collect();
        let order = self.account.new_order(&NewOrder::new(&idents)).await?;
        tracing::info!(csr_id, url = order.url(), "ACME order created");
        self.orders
            .lock()
            .await
            .insert(csr_id.to_string(), OrderHandle { order, csr_der });
        Ok(())
    }

    async fn challenges(&self, csr_id: &str) -> Result<ChallengeMap, SessionError> {
        use futures::StreamExt;

        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(csr_id)
            .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;

        let mut map: ChallengeMap = HashMap::new();
        let mut stream = handle.order.authorizations();
        while let Some(auth) = stream.next().await {
            let mut auth = auth?;
            if auth.status == AuthorizationStatus::Valid {
                continue;
            }
            let identifier = auth.identifier().to_string();
            for kind in [ChallengeKind::Http01, ChallengeKind::Dns01] {
                if let Some(challenge) = auth.challenge(kind.to_instant()) {
                    let record = ChallengeRecord {
                        identifier: identifier.clone(),
                        token: challenge.token.clone(),
                        key_authorization: challenge.key_authorization().as_str().to_string(),
                    };
                    map.entry(kind).or_default().push(record);
                }
            }
        }
        Ok(map)
    }

    async fn push_solved_challenges(
        &self,
        csr_id: &str,
        challenge_type: ChallengeKind,
    ) -> Result<(), SessionError> {
        use futures::StreamExt;

        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(csr_id)
            .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;

        let mut stream = handle.order.authorizations();
        while let Some(auth) = stream.next().await {
            let mut auth = auth?;
            if auth.status == AuthorizationStatus::Valid {
                continue;
            }
            if let Some(mut challenge) = auth.challenge(challenge_type.to_instant()) {
                challenge.set_ready().await?;
            }
        }
        Ok(())
    }

    async fn finalize_order(&self, csr_id: &str) -> Result<(), SessionError> {
        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(csr_id)
            .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;

        let policy = RetryPolicy::default();
        let status = handle.order.poll_ready(&policy).await?;
        match status {
            OrderStatus::Ready | OrderStatus::Valid => {}
            OrderStatus::Invalid => {
                return Err(SessionError::InvalidChallenge(format!(
                    "order for {csr_id} is invalid"
                )))
            }
            _ => return Err(SessionError::ChallengeNotValidated),
        }

        handle.order.finalize(&handle.csr_der).await?;
        Ok(())
    }

    async fn get_certificate(&self, csr_id: &str) -> Result<CertificateChain, SessionError> {
        let mut orders = self.orders.lock().await;
        let handle = orders
            .get_mut(csr_id)
            .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;

        let policy = RetryPolicy::default();
        let pem = handle
            .order
            .poll_certificate(&policy)
            .await?
            .ok_or(SessionError::CertificateNotReady)?;
        let chain = CertificateChain::from_pem(&pem)?;
        orders.remove(csr_id);
        Ok(chain)
    }
}

/// Thread-safe handle suitable for sharing across the controller's
/// per-(cert-id, key-type) worker tasks.
pub type SharedSession = Arc<dyn AcmeSession>;

#[cfg(test)]
pub mod fake {
    //! In-memory fake used by integration tests so the order driver can
    //! be exercised without a reachable CA.

    use super::*;
    use std::collections::HashMap as Map;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Clone, Copy, PartialEq, Eq)]
    pub enum FakeOutcome {
        Valid,
        NeverValidates,
        Invalid,
    }

    struct FakeOrder {
        identifiers: Vec<String>,
        outcome: FakeOutcome,
        pushed: bool,
        finalized: bool,
    }

    /// Records every identifier it was ever asked to issue for so tests
    /// can assert on call shape, and resolves per a configured outcome.
    pub struct FakeSession {
        outcome: FakeOutcome,
        orders: AsyncMutex<Map<String, FakeOrder>>,
        issued: CertificateChain,
    }

    impl FakeSession {
        pub fn new(outcome: FakeOutcome, issued: CertificateChain) -> Self {
            Self {
                outcome,
                orders: AsyncMutex::new(Map::new()),
                issued,
            }
        }
    }

    #[async_trait]
    impl AcmeSession for FakeSession {
        async fn submit_csr(
            &self,
            csr_id: &str,
            _csr_der: Vec<u8>,
            identifiers: &[String],
        ) -> Result<(), SessionError> {
            self.orders.lock().await.insert(
                csr_id.to_string(),
                FakeOrder {
                    identifiers: identifiers.to_vec(),
                    outcome: self.outcome,
                    pushed: false,
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

        async fn push_solved_challenges(
            &self,
            csr_id: &str,
            _challenge_type: ChallengeKind,
        ) -> Result<(), SessionError> {
            let mut orders = self.orders.lock().await;
            let order = orders
                .get_mut(csr_id)
                .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;
            order.pushed = true;
            Ok(())
        }

        async fn finalize_order(&self, csr_id: &str) -> Result<(), SessionError> {
            let mut orders = self.orders.lock().await;
            let order = orders
                .get_mut(csr_id)
                .ok_or_else(|| SessionError::UnknownOrder(csr_id.to_string()))?;
            match order.outcome {
                FakeOutcome::Valid => {
                    order.finalized = true;
                    Ok(())
                }
                FakeOutcome::NeverValidates => Err(SessionError::ChallengeNotValidated),
                FakeOutcome::Invalid => Err(SessionError::InvalidChallenge("fake rejection".into())),
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
}
