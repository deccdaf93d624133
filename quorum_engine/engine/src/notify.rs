//! Notification sink for quorum and submission outcomes.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::types::{SignerId, TxId, WalletId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    QuorumReached {
        wallet_id: WalletId,
        tx_id: TxId,
        nonce: u64,
    },
    Rejected {
        wallet_id: WalletId,
        tx_id: TxId,
        by: SignerId,
    },
    Expired {
        wallet_id: WalletId,
        tx_id: TxId,
    },
    SubmissionConfirmed {
        wallet_id: WalletId,
        tx_id: TxId,
        nonce: u64,
        reference: String,
    },
    SubmissionFailed {
        wallet_id: WalletId,
        tx_id: TxId,
        nonce: u64,
        reason: String,
        attempts: u32,
    },
}

/// Delivery is fire-and-forget; a sink must not block the caller for long.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Default sink: writes every notification to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: &Notification) {
        match notification {
            Notification::QuorumReached { wallet_id, tx_id, nonce } => {
                info!(%wallet_id, %tx_id, nonce, "Quorum reached");
            }
            Notification::Rejected { wallet_id, tx_id, by } => {
                warn!(%wallet_id, %tx_id, %by, "Transaction rejected");
            }
            Notification::Expired { wallet_id, tx_id } => {
                warn!(%wallet_id, %tx_id, "Transaction expired without quorum");
            }
            Notification::SubmissionConfirmed {
                wallet_id,
                tx_id,
                nonce,
                reference,
            } => {
                info!(%wallet_id, %tx_id, nonce, %reference, "Ledger submission confirmed");
            }
            Notification::SubmissionFailed {
                wallet_id,
                tx_id,
                nonce,
                reason,
                attempts,
            } => {
                error!(%wallet_id, %tx_id, nonce, attempts, %reason, "Ledger submission failed, manual reconciliation required");
            }
        }
    }
}
