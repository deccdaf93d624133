//! External ledger boundary. The engine only submits executed operations;
//! the ledger is expected to treat a repeated `(wallet_id, nonce)` as the same operation.

pub mod dispatcher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{OperationType, TxId, WalletId};

pub use dispatcher::{DispatchHandle, Dispatcher};

/// One executed wallet operation as handed to the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSubmission {
    pub wallet_id: WalletId,
    pub nonce: u64,
    pub tx_id: TxId,
    pub to: String,
    pub value: u64,
    pub operation_type: OperationType,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerReceipt {
    /// Ledger-side transaction reference.
    pub reference: String,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit an operation. `Err` carries the ledger's failure reason.
    async fn submit(&self, submission: &LedgerSubmission) -> Result<LedgerReceipt, String>;
}
