use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditRecord, AuditTrail};
use crate::error::{QuorumError, Result};
use crate::ledger::DispatchHandle;
use crate::mpc::transaction::{ExecutedNonce, PendingTransaction, TxStatus};
use crate::notify::{Notification, Notifier};
use crate::registry::{MpcWallet, WalletRegistry};
use crate::store::{RecordStore, Versioned, WriteBatch};
use crate::types::{OperationType, SignerId, TxId, WalletId};

/// Drives the proposal → signatures → quorum → execution lifecycle.
///
/// All writes are optimistic: a transaction (and, on the quorum-completing
/// signature, its wallet) is swapped against the version that was read. A
/// losing writer re-reads and re-validates, so at most one signer ever
/// commits the transition to `Executed` and the nonce moves exactly once.
pub struct TransactionCoordinator {
    store: RecordStore,
    wallets: Arc<WalletRegistry>,
    audit: Arc<AuditTrail>,
    notifier: Arc<dyn Notifier>,
    dispatch: DispatchHandle,
    pending_ttl: chrono::Duration,
    cas_retries: u32,
}

/// What to do once the write is committed.
enum Outcome {
    Pending,
    Executed(u64),
}

impl TransactionCoordinator {
    pub fn new(
        store: RecordStore,
        wallets: Arc<WalletRegistry>,
        audit: Arc<AuditTrail>,
        notifier: Arc<dyn Notifier>,
        dispatch: DispatchHandle,
        pending_ttl: chrono::Duration,
        cas_retries: u32,
    ) -> Self {
        Self {
            store,
            wallets,
            audit,
            notifier,
            dispatch,
            pending_ttl,
            cas_retries: cas_retries.max(1),
        }
    }

    /// Open a transaction against a wallet; the proposer counts as the first signature.
    pub fn propose_transaction(
        &self,
        wallet_id: &WalletId,
        proposer: &SignerId,
        to: &str,
        value: u64,
        operation_type: OperationType,
        payload: Vec<u8>,
    ) -> Result<TxId> {
        for attempt in 1..=self.cas_retries {
            let wallet = self.wallets.get_versioned(wallet_id)?;
            if !wallet.value.is_active {
                return Err(QuorumError::WalletInactive(wallet_id.0.clone()));
            }
            if !wallet.value.is_signer(proposer) {
                return Err(QuorumError::Authorization(format!(
                    "{proposer} is not a signer of wallet {wallet_id}"
                )));
            }

            let now = Utc::now();
            let mut tx = PendingTransaction::propose(
                wallet_id.clone(),
                proposer.clone(),
                to.to_string(),
                value,
                operation_type,
                payload.clone(),
                wallet.value.threshold,
                now,
            );

            // A 1-of-n wallet reaches quorum on the proposal itself.
            let (batch, outcome) = if tx.has_quorum() {
                self.stage_execution(&mut tx, None, &wallet, now)?
            } else {
                (WriteBatch::new().insert(&tx)?, Outcome::Pending)
            };

            match self.store.commit(batch) {
                Ok(()) => {
                    info!(tx = %tx.tx_id, wallet = %wallet_id, %proposer, op = %operation_type, value, "Transaction proposed");
                    self.audit.log(
                        AuditRecord::new(
                            AuditEventType::Proposal,
                            tx.tx_id.as_str(),
                            format!("{operation_type} of {value} to {to} on wallet {wallet_id}"),
                        )
                        .by(proposer.as_str()),
                    );
                    self.after_commit(&tx, outcome);
                    return Ok(tx.tx_id);
                }
                Err(QuorumError::Conflict(reason)) => {
                    debug!(wallet = %wallet_id, attempt, %reason, "Proposal lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(QuorumError::Conflict(format!("wallet {wallet_id} kept changing during proposal")))
    }

    /// Add a signature. The call that completes the quorum executes the
    /// transaction, consumes the wallet nonce and queues the ledger submission.
    pub fn sign_transaction(&self, tx_id: &TxId, signer: &SignerId) -> Result<PendingTransaction> {
        for attempt in 1..=self.cas_retries {
            let current = self.store.fetch::<PendingTransaction>(tx_id.as_str())?;
            current.value.ensure_pending()?;

            let wallet = self.wallets.get_versioned(&current.value.wallet_id)?;
            // A deactivated wallet keeps its pending transactions readable and
            // rejectable, but none of them can reach execution.
            if !wallet.value.is_active {
                return Err(QuorumError::WalletInactive(wallet.value.wallet_id.0.clone()));
            }
            if !wallet.value.is_signer(signer) {
                return Err(QuorumError::Authorization(format!(
                    "{signer} is not a signer of wallet {}",
                    wallet.value.wallet_id
                )));
            }

            let now = Utc::now();
            let mut next = current.value.clone();
            let reached = next.add_signature(signer.clone(), now)?;

            let (batch, outcome) = if reached {
                self.stage_execution(&mut next, Some(current.version), &wallet, now)?
            } else {
                (WriteBatch::new().swap(current.version, &next)?, Outcome::Pending)
            };

            match self.store.commit(batch) {
                Ok(()) => {
                    info!(
                        tx = %tx_id,
                        %signer,
                        signatures = next.signatures.len(),
                        required = next.required_signatures,
                        "Signature recorded"
                    );
                    self.audit.log(
                        AuditRecord::new(
                            AuditEventType::Signature,
                            tx_id.as_str(),
                            format!("{}/{} signatures", next.signatures.len(), next.required_signatures),
                        )
                        .by(signer.as_str()),
                    );
                    self.after_commit(&next, outcome);
                    return Ok(next);
                }
                Err(QuorumError::Conflict(reason)) => {
                    debug!(tx = %tx_id, %signer, attempt, %reason, "Signature lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(QuorumError::Conflict(format!("transaction {tx_id} kept changing while signing")))
    }

    /// Veto a pending transaction. Any wallet signer may reject.
    pub fn reject_transaction(&self, tx_id: &TxId, by: &SignerId) -> Result<PendingTransaction> {
        let current = self.store.fetch::<PendingTransaction>(tx_id.as_str())?;
        current.value.ensure_pending()?;

        let wallet = self.wallets.get_wallet(&current.value.wallet_id)?;
        if !wallet.is_signer(by) {
            return Err(QuorumError::Authorization(format!(
                "{by} is not a signer of wallet {}",
                wallet.wallet_id
            )));
        }

        let now = Utc::now();
        let rejected = self
            .store
            .modify::<PendingTransaction, _>(tx_id.as_str(), self.cas_retries, |tx| {
                tx.reject(by.clone(), now)
            })?;

        warn!(tx = %tx_id, %by, "Transaction rejected");
        self.audit.log(
            AuditRecord::new(AuditEventType::Rejection, tx_id.as_str(), "rejected before quorum")
                .by(by.as_str()),
        );
        self.notifier.notify(&Notification::Rejected {
            wallet_id: rejected.wallet_id.clone(),
            tx_id: rejected.tx_id.clone(),
            by: by.clone(),
        });
        Ok(rejected)
    }

    /// Expire every transaction still pending `pending_ttl` after creation.
    /// Returns the ids that were expired by this call.
    pub fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<TxId>> {
        let mut expired = Vec::new();

        for stale in self
            .store
            .scan::<PendingTransaction>()?
            .into_iter()
            .map(|v| v.value)
            .filter(|tx| tx.is_stale(now, self.pending_ttl))
        {
            let outcome = self
                .store
                .modify::<PendingTransaction, _>(stale.tx_id.as_str(), self.cas_retries, |tx| {
                    tx.expire(now)
                });

            match outcome {
                Ok(tx) => {
                    info!(tx = %tx.tx_id, wallet = %tx.wallet_id, "Transaction expired");
                    self.audit.log(AuditRecord::new(
                        AuditEventType::Expiry,
                        tx.tx_id.as_str(),
                        format!("expired with {}/{} signatures", tx.signatures.len(), tx.required_signatures),
                    ));
                    self.notifier.notify(&Notification::Expired {
                        wallet_id: tx.wallet_id.clone(),
                        tx_id: tx.tx_id.clone(),
                    });
                    expired.push(tx.tx_id);
                }
                // Finished by a signer or a veto between the scan and the swap.
                Err(QuorumError::State(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    pub fn get_transaction(&self, tx_id: &TxId) -> Result<PendingTransaction> {
        Ok(self.store.fetch::<PendingTransaction>(tx_id.as_str())?.value)
    }

    /// Pending transactions of a wallet, in creation order.
    pub fn list_pending(&self, wallet_id: &WalletId) -> Result<PendingTransactions<'_>> {
        self.wallets.get_wallet(wallet_id)?;
        Ok(PendingTransactions {
            store: &self.store,
            wallet_id: wallet_id.clone(),
        })
    }

    /// Mark `tx` executed and stage it together with the wallet nonce bump and
    /// its nonce index entry. `tx_version` is the version read before signing;
    /// `None` stages an insert.
    fn stage_execution(
        &self,
        tx: &mut PendingTransaction,
        tx_version: Option<u64>,
        wallet: &Versioned<MpcWallet>,
        now: DateTime<Utc>,
    ) -> Result<(WriteBatch, Outcome)> {
        let mut bumped = wallet.value.clone();
        bumped.nonce += 1;
        tx.mark_executed(bumped.nonce, now);

        let batch = match tx_version {
            Some(version) => WriteBatch::new().swap(version, tx)?,
            None => WriteBatch::new().insert(tx)?,
        };
        // Wallet swap before the index insert: a lost race must surface as a conflict.
        let batch = batch.swap(wallet.version, &bumped)?.insert(&ExecutedNonce {
            wallet_id: tx.wallet_id.clone(),
            nonce: bumped.nonce,
            tx_id: tx.tx_id.clone(),
        })?;
        Ok((batch, Outcome::Executed(bumped.nonce)))
    }

    fn after_commit(&self, tx: &PendingTransaction, outcome: Outcome) {
        let Outcome::Executed(nonce) = outcome else {
            return;
        };
        debug_assert_eq!(tx.status, TxStatus::Executed);

        info!(tx = %tx.tx_id, wallet = %tx.wallet_id, nonce, "Quorum reached, transaction executed");
        self.audit.log(AuditRecord::new(
            AuditEventType::Execution,
            tx.tx_id.as_str(),
            format!("executed at nonce {nonce}"),
        ));
        self.notifier.notify(&Notification::QuorumReached {
            wallet_id: tx.wallet_id.clone(),
            tx_id: tx.tx_id.clone(),
            nonce,
        });
        if let Err(e) = self.dispatch.wake(&tx.wallet_id, nonce) {
            warn!(tx = %tx.tx_id, "{e}; submission stays queued until recovery");
        }
    }
}

/// Lazy, restartable view over a wallet's pending transactions.
/// Each `iter()` takes a fresh snapshot of ids and loads records on demand.
pub struct PendingTransactions<'a> {
    store: &'a RecordStore,
    wallet_id: WalletId,
}

impl<'a> PendingTransactions<'a> {
    /// A failure to list ids is yielded as the first item, after which the
    /// iterator ends.
    pub fn iter(&self) -> PendingIter<'a> {
        let (ids, error) = match self.store.ids::<PendingTransaction>() {
            Ok(ids) => (ids, None),
            Err(e) => {
                warn!(wallet = %self.wallet_id, "Cannot list transactions: {e}");
                (Vec::new(), Some(e))
            }
        };
        PendingIter {
            store: self.store,
            wallet_id: self.wallet_id.clone(),
            ids: ids.into_iter(),
            error,
        }
    }
}

impl<'a, 'b> IntoIterator for &'b PendingTransactions<'a> {
    type Item = Result<PendingTransaction>;
    type IntoIter = PendingIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct PendingIter<'a> {
    store: &'a RecordStore,
    wallet_id: WalletId,
    ids: std::vec::IntoIter<String>,
    error: Option<QuorumError>,
}

impl Iterator for PendingIter<'_> {
    type Item = Result<PendingTransaction>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.error.take() {
            return Some(Err(e));
        }
        for id in self.ids.by_ref() {
            match self.store.load::<PendingTransaction>(&id) {
                Ok(Some(v)) if v.value.wallet_id == self.wallet_id && v.value.is_pending() => {
                    return Some(Ok(v.value));
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}
