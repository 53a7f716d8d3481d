//! Status classifier.
//!
//! Inspects the `live/` and `new/` trees for a (cert-id, key-type) pair and
//! computes the status it should occupy. Runs at startup and after every
//! reload; must be idempotent given unchanged files on disk.

use std::collections::HashSet;
use std::time::SystemTime;

use certmarshal_config::CertificateConfig;
use certmarshal_tls::{CertificateChain, CertificateType, KeyType};

use crate::path::{Kind, PathResolver};
use crate::state::Status;

/// Classifies the (cert-id, key-type) pair rooted at `paths` against
/// `config`, as of `now`.
pub fn classify(
    paths: &PathResolver,
    cert_id: &str,
    key_type: KeyType,
    config: &CertificateConfig,
    now: SystemTime,
) -> Status {
    let live_path = paths.public_cert(cert_id, key_type, Kind::Live, CertificateType::FullChain);
    let live = match CertificateChain::load(&live_path) {
        Ok(chain) => chain,
        Err(_) => return Status::Initial,
    };

    let leaf = match live.leaf() {
        Ok(leaf) => leaf,
        Err(_) => return Status::Initial,
    };

    if leaf.is_self_signed().unwrap_or(true) {
        return Status::SelfSigned;
    }

    if subjects_changed(&leaf, config) {
        return Status::SubjectsChanged;
    }

    if leaf.is_expired(now).unwrap_or(true) {
        return Status::Expired;
    }

    if leaf.needs_renewal(now).unwrap_or(false) {
        return Status::NeedsRenewal;
    }

    let new_path = paths.public_cert(cert_id, key_type, Kind::New, CertificateType::FullChain);
    if let Ok(new_chain) = CertificateChain::load(&new_path) {
        if let (Ok(new_leaf), Ok(live_not_before)) = (new_chain.leaf(), leaf.not_before()) {
            if let Ok(new_not_before) = new_leaf.not_before() {
                if new_not_before > live_not_before {
                    return Status::ReadyToBePushed;
                }
            }
        }
    }

    Status::Valid
}

fn subjects_changed(leaf: &certmarshal_tls::ParsedCertificate<'_>, config: &CertificateConfig) -> bool {
    let actual_cn = leaf.common_name().unwrap_or_default().to_lowercase();
    let expected_cn = config.cn.to_lowercase();
    if actual_cn != expected_cn {
        return true;
    }

    let actual_sans: HashSet<String> = leaf
        .subject_alt_names()
        .unwrap_or_default()
        .into_iter()
        .map(|s| s.to_lowercase())
        .collect();
    actual_sans != config.san_set()
}
