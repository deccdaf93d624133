//! Registries for MPC wallets and attestation keys.

pub mod key_store;
pub mod wallet_registry;

pub use key_store::{Key, KeyStore};
pub use wallet_registry::{MpcWallet, WalletRegistry};

use std::collections::BTreeSet;

use crate::error::{QuorumError, Result};
use crate::types::SignerId;

/// Checks a party list against a threshold and returns it as a set.
/// `kind` names the list in error messages ("signers", "authorized parties").
pub(crate) fn validate_party_set(
    parties: Vec<SignerId>,
    threshold: u32,
    kind: &str,
) -> Result<BTreeSet<SignerId>> {
    if parties.is_empty() {
        return Err(QuorumError::Validation(format!("{kind} must not be empty")));
    }
    if parties.iter().any(|p| p.as_str().trim().is_empty()) {
        return Err(QuorumError::Validation(format!("{kind} contain a blank identity")));
    }

    let count = parties.len();
    let set: BTreeSet<SignerId> = parties.into_iter().collect();
    if set.len() != count {
        return Err(QuorumError::Validation(format!("{kind} contain duplicates")));
    }

    if threshold == 0 || threshold as usize > set.len() {
        return Err(QuorumError::Validation(format!(
            "threshold {threshold} must be between 1 and {} {kind}",
            set.len()
        )));
    }
    Ok(set)
}
