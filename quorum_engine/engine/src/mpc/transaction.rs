use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QuorumError, Result};
use crate::ledger::LedgerSubmission;
use crate::store::{Record, Table};
use crate::types::{OperationType, SignerId, TxId, WalletId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    Pending,
    Executed,
    Rejected,
    Expired,
}

/// Ledger hand-off progress of an executed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubmissionState {
    /// Waiting for (another) submission attempt.
    Queued { attempts: u32 },
    Confirmed { reference: String, attempts: u32 },
    /// Retries exhausted; needs manual reconciliation. Status stays Executed.
    Failed { reason: String, attempts: u32 },
}

/// A proposed wallet operation and the signatures collected for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    pub tx_id: TxId,
    pub wallet_id: WalletId,
    pub proposer: SignerId,
    pub to: String,
    pub value: u64,
    pub operation_type: OperationType,
    #[serde(with = "hex_payload")]
    pub payload: Vec<u8>,
    /// Unique signers in signing order; the proposer is always first.
    pub signatures: Vec<SignerId>,
    /// Wallet threshold frozen at proposal time.
    pub required_signatures: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: TxStatus,
    /// Wallet nonce consumed when this transaction executed.
    pub executed_nonce: Option<u64>,
    pub rejected_by: Option<SignerId>,
    pub submission: Option<SubmissionState>,
}

mod hex_payload {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

impl Record for PendingTransaction {
    const TABLE: Table = Table::Transactions;

    fn record_id(&self) -> String {
        self.tx_id.0.clone()
    }
}

/// Which transaction consumed a wallet nonce. Written in the same batch as
/// the execution, so every nonce up to the wallet's counter has an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutedNonce {
    pub wallet_id: WalletId,
    pub nonce: u64,
    pub tx_id: TxId,
}

impl ExecutedNonce {
    pub fn storage_id(wallet_id: &WalletId, nonce: u64) -> String {
        format!("{wallet_id}/{nonce}")
    }
}

impl Record for ExecutedNonce {
    const TABLE: Table = Table::Nonces;

    fn record_id(&self) -> String {
        Self::storage_id(&self.wallet_id, self.nonce)
    }
}

impl PendingTransaction {
    /// Fresh proposal, already signed by the proposer.
    #[allow(clippy::too_many_arguments)]
    pub fn propose(
        wallet_id: WalletId,
        proposer: SignerId,
        to: String,
        value: u64,
        operation_type: OperationType,
        payload: Vec<u8>,
        required_signatures: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            tx_id: TxId::generate(),
            wallet_id,
            signatures: vec![proposer.clone()],
            proposer,
            to,
            value,
            operation_type,
            payload,
            required_signatures,
            created_at: now,
            updated_at: now,
            status: TxStatus::Pending,
            executed_nonce: None,
            rejected_by: None,
            submission: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TxStatus::Pending
    }

    pub fn has_signed(&self, signer: &SignerId) -> bool {
        self.signatures.contains(signer)
    }

    pub fn has_quorum(&self) -> bool {
        self.signatures.len() >= self.required_signatures as usize
    }

    pub fn ensure_pending(&self) -> Result<()> {
        if self.is_pending() {
            Ok(())
        } else {
            Err(QuorumError::State(format!(
                "transaction {} is {:?}, not pending",
                self.tx_id, self.status
            )))
        }
    }

    /// Adds a signature and reports whether quorum is now reached.
    pub fn add_signature(&mut self, signer: SignerId, now: DateTime<Utc>) -> Result<bool> {
        self.ensure_pending()?;
        if self.has_signed(&signer) {
            return Err(QuorumError::AlreadySigned {
                tx_id: self.tx_id.0.clone(),
                signer: signer.0,
            });
        }
        self.signatures.push(signer);
        self.updated_at = now;
        Ok(self.has_quorum())
    }

    pub fn mark_executed(&mut self, nonce: u64, now: DateTime<Utc>) {
        self.status = TxStatus::Executed;
        self.executed_nonce = Some(nonce);
        self.submission = Some(SubmissionState::Queued { attempts: 0 });
        self.updated_at = now;
    }

    pub fn reject(&mut self, by: SignerId, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.status = TxStatus::Rejected;
        self.rejected_by = Some(by);
        self.updated_at = now;
        Ok(())
    }

    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_pending()?;
        self.status = TxStatus::Expired;
        self.updated_at = now;
        Ok(())
    }

    /// Pending for longer than `ttl` as of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        self.is_pending() && now - self.created_at > ttl
    }

    pub fn awaiting_submission(&self) -> bool {
        self.status == TxStatus::Executed
            && matches!(self.submission, Some(SubmissionState::Queued { .. }))
    }

    pub fn submission_attempts(&self) -> u32 {
        match &self.submission {
            Some(SubmissionState::Queued { attempts })
            | Some(SubmissionState::Confirmed { attempts, .. })
            | Some(SubmissionState::Failed { attempts, .. }) => *attempts,
            None => 0,
        }
    }

    /// The ledger call for an executed transaction.
    pub fn ledger_submission(&self) -> Option<LedgerSubmission> {
        let nonce = self.executed_nonce?;
        Some(LedgerSubmission {
            wallet_id: self.wallet_id.clone(),
            nonce,
            tx_id: self.tx_id.clone(),
            to: self.to.clone(),
            value: self.value,
            operation_type: self.operation_type,
            payload: self.payload.clone(),
        })
    }
}
