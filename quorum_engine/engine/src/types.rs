//! Shared identifier and operation types: signer, wallet, transaction and key ids.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                $name(s)
            }
        }
    };
}

string_id!(
    /// Identity of a party as supplied by the identity provider. Trusted as given.
    SignerId
);
string_id!(
    /// Unique identifier of an MPC wallet (UUID v4).
    WalletId
);
string_id!(
    /// Unique identifier of a proposed transaction (UUID v4).
    TxId
);
string_id!(
    /// Caller-chosen identifier of an attestation key.
    KeyId
);

impl WalletId {
    pub fn generate() -> Self {
        WalletId(uuid::Uuid::new_v4().to_string())
    }
}

impl TxId {
    pub fn generate() -> Self {
        TxId(uuid::Uuid::new_v4().to_string())
    }
}

/// Privileged supply-chain operations gated behind a wallet quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Transfer,
    Mint,
    Recall,
    #[serde(rename = "iot_update")]
    IoTUpdate,
    /// Product-authenticity attestation anchored on the ledger.
    Attestation,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OperationType::Transfer => "TRANSFER",
            OperationType::Mint => "MINT",
            OperationType::Recall => "RECALL",
            OperationType::IoTUpdate => "IOT_UPDATE",
            OperationType::Attestation => "ATTESTATION",
        };
        f.write_str(label)
    }
}
