//! Quorum Engine Core Library
//!
//! Threshold wallets and attestation keys for supply-chain operations:
//! proposals collect signatures until the wallet quorum is met, then execute
//! and are handed to an external ledger; product claims collect attestations
//! until a key's threshold is met.

pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod mpc;
pub mod notify;
pub mod registry;
pub mod store;
pub mod types;
pub mod verify;

pub use config::{EngineConfig, RetryPolicy};
pub use engine::{Collaborators, Engine};
pub use error::{QuorumError, Result};
pub use types::{KeyId, OperationType, SignerId, TxId, WalletId};

#[cfg(test)]
mod tests;
