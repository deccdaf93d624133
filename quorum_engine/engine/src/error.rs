//! Centralized quorum engine error types.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuorumError {
    /// Malformed threshold, signer set or authorized-party input.
    #[error("Validation error: {0}")]
    Validation(String),
    /// Unknown wallet, key or transaction.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Actor is not in the signer or authorized-party set.
    #[error("Authorization error: {0}")]
    Authorization(String),
    /// Operation attempted on a transaction that is no longer pending.
    #[error("State error: {0}")]
    State(String),
    /// Signer already contributed to this transaction.
    #[error("Signer {signer} already signed transaction {tx_id}")]
    AlreadySigned { tx_id: String, signer: String },
    /// Proposal against a deactivated wallet.
    #[error("Wallet {0} is inactive")]
    WalletInactive(String),
    /// Key or wallet id collision.
    #[error("Duplicate: {0}")]
    Duplicate(String),
    /// Proof rejected by the signature verifier.
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),
    /// Ledger submission failed after the local transition to Executed.
    #[error("Execution error: {0}")]
    Execution(String),
    /// Optimistic write lost the race too many times.
    #[error("Write conflict: {0}")]
    Conflict(String),
    /// Storage backend failure (lock poisoning, missing table row).
    #[error("Store error: {0}")]
    Store(String),
    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serde(String),
    /// Sealing or unsealing failure.
    #[error("Cryptographic error: {0}")]
    Crypto(String),
}

impl QuorumError {
    /// Caller mistakes are reported immediately and never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            QuorumError::Validation(_)
                | QuorumError::NotFound(_)
                | QuorumError::Authorization(_)
                | QuorumError::State(_)
                | QuorumError::AlreadySigned { .. }
                | QuorumError::WalletInactive(_)
                | QuorumError::Duplicate(_)
                | QuorumError::InvalidSignature(_)
        )
    }
}

impl From<serde_json::Error> for QuorumError {
    fn from(e: serde_json::Error) -> Self {
        QuorumError::Serde(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;
