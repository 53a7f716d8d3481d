//! Certificate state: status, retry counter, and the backoff policy that
//! governs transitions between them.

use std::time::{Duration, SystemTime};

/// Default slow-retry interval (§4.2).
pub const SLOW_RETRY: Duration = Duration::from_secs(3600);
/// Attempts at a fast-retry status that retry immediately before backoff
/// kicks in.
pub const MAX_CONSECUTIVE_RETRIES: u32 = 3;
/// Attempts after which a fast-retry status parks forever.
pub const MAX_RETRIES: u32 = 30;

/// Every status a (cert-id, key-type) pair can occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Initial,
    SelfSigned,
    CsrPushed,
    ChallengesPushed,
    ChallengesValidated,
    ChallengesRejected,
    OrderFinalized,
    CertificateIssued,
    ReadyToBePushed,
    Valid,
    NeedsRenewal,
    Expired,
    SubjectsChanged,
    AcmeChiefError,
}

/// Which backoff regime a status falls into when assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryClass {
    /// Always eligible; counters reset.
    Steady,
    /// Quiet wait; fixed long interval.
    SlowRetry,
    /// Transient failure or in-flight step; immediate retries then
    /// exponential backoff.
    FastRetry,
}

impl Status {
    fn retry_class(self) -> RetryClass {
        use Status::*;
        match self {
            Initial | SelfSigned | Valid | NeedsRenewal | Expired | SubjectsChanged => RetryClass::Steady,
            ChallengesRejected | AcmeChiefError => RetryClass::SlowRetry,
            CsrPushed | ChallengesPushed | ChallengesValidated | OrderFinalized | CertificateIssued
            | ReadyToBePushed => RetryClass::FastRetry,
        }
    }
}

/// State of one (cert-id, key-type) pair.
///
/// `retries` and `next_retry` are private: the only way to mutate them is
/// [`CertificateState::set_status`], which applies the §4.2 policy
/// atomically. This makes "retries drifted out of sync with next_retry"
/// unrepresentable.
#[derive(Debug, Clone)]
pub struct CertificateState {
    status: Status,
    retries: u32,
    next_retry: Option<SystemTime>,
}

impl CertificateState {
    /// A fresh state, as if just classified `Initial`.
    pub fn new(status: Status, now: SystemTime) -> Self {
        let mut state = Self {
            status: Status::Initial,
            retries: 0,
            next_retry: Some(now),
        };
        state.set_status(status, now);
        state
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// `None` means "never" — retry is permanently disabled until the next
    /// status assignment or configuration reload.
    pub fn next_retry(&self) -> Option<SystemTime> {
        self.next_retry
    }

    /// Whether this pair is eligible to run its handler at `now`.
    pub fn retry(&self, now: SystemTime) -> bool {
        matches!(self.next_retry, Some(t) if t <= now)
    }

    /// Assigns `status`, updating `retries` and `next_retry` per the §4.2
    /// policy. This is the only way those two fields change.
    pub fn set_status(&mut self, status: Status, now: SystemTime) {
        match status.retry_class() {
            RetryClass::Steady => {
                self.retries = 0;
                self.next_retry = Some(now);
            }
            RetryClass::SlowRetry => {
                self.retries += 1;
                self.next_retry = Some(now + SLOW_RETRY);
            }
            RetryClass::FastRetry => {
                self.retries += 1;
                if self.retries <= MAX_CONSECUTIVE_RETRIES {
                    self.next_retry = Some(now);
                } else if self.retries <= MAX_RETRIES {
                    let backoff = Duration::from_secs(2u64.saturating_pow(self.retries));
                    self.next_retry = Some(now + backoff);
                } else {
                    self.next_retry = None;
                }
            }
        }
        self.status = status;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_status_resets_retries_and_is_always_eligible() {
        let now = SystemTime::UNIX_EPOCH;
        let mut state = CertificateState::new(Status::CsrPushed, now);
        state.set_status(Status::CsrPushed, now);
        state.set_status(Status::CsrPushed, now);
        assert!(state.retries() > 0);

        state.set_status(Status::Valid, now);
        assert_eq!(state.retries(), 0);
        assert!(state.retry(now));
    }

    #[test]
    fn fast_retry_escalates_then_parks() {
        let now = SystemTime::UNIX_EPOCH;
        // Start from a steady status so retries is known to be 0.
        let mut state = CertificateState::new(Status::Initial, now);
        assert_eq!(state.retries(), 0);

        for _ in 0..MAX_CONSECUTIVE_RETRIES {
            let before = state.retries();
            state.set_status(Status::CsrPushed, now);
            assert_eq!(state.retries(), before + 1);
            assert_eq!(state.next_retry(), Some(now));
            assert!(state.retry(now));
        }
        assert_eq!(state.retries(), MAX_CONSECUTIVE_RETRIES);

        for retries in state.retries()..MAX_RETRIES {
            state.set_status(Status::CsrPushed, now);
            assert_eq!(state.retries(), retries + 1);
            assert_eq!(
                state.next_retry(),
                Some(now + Duration::from_secs(2u64.pow(retries + 1)))
            );
            assert!(!state.retry(now));
        }
        assert_eq!(state.retries(), MAX_RETRIES);

        state.set_status(Status::CsrPushed, now);
        assert_eq!(state.next_retry(), None);
        assert!(!state.retry(now));
    }

    #[test]
    fn slow_retry_waits_a_fixed_interval() {
        let now = SystemTime::UNIX_EPOCH;
        let mut state = CertificateState::new(Status::AcmeChiefError, now);
        assert_eq!(state.next_retry(), Some(now + SLOW_RETRY));
        assert!(!state.retry(now));
        assert!(state.retry(now + SLOW_RETRY));
    }
}
