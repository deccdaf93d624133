use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditEventType, AuditRecord, AuditTrail};
use crate::config::RetryPolicy;
use crate::error::{QuorumError, Result};
use crate::ledger::{Ledger, LedgerReceipt, LedgerSubmission};
use crate::mpc::transaction::{ExecutedNonce, PendingTransaction, SubmissionState};
use crate::notify::{Notification, Notifier};
use crate::store::RecordStore;
use crate::types::WalletId;

enum Command {
    /// The wallet executed a transaction at `nonce` that still needs submitting.
    Wake { wallet_id: WalletId, nonce: u64 },
    Shutdown,
}

/// Cloneable sender side of the dispatcher.
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl DispatchHandle {
    /// Hand an executed nonce to the wallet's worker.
    /// If the dispatcher is gone the work stays queued in the store for recovery.
    pub fn wake(&self, wallet_id: &WalletId, nonce: u64) -> Result<()> {
        self.tx
            .send(Command::Wake {
                wallet_id: wallet_id.clone(),
                nonce,
            })
            .map_err(|_| QuorumError::Execution("submission dispatcher is not running".into()))
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

struct Worker {
    nonces: mpsc::UnboundedSender<u64>,
    task: JoinHandle<()>,
}

/// Result of looking at one queued nonce.
enum Advance {
    Done,
    /// The previous nonce is still queued and has to go first.
    Behind,
}

/// Submits executed transactions to the ledger, one FIFO worker per wallet.
///
/// Workers look transactions up through the nonce index and never submit a
/// nonce while the one before it is still queued, so the ledger sees each
/// wallet's nonces strictly increasing regardless of wake-up order. A worker
/// with nothing left to do hands itself back to the router and exits.
pub struct Dispatcher {
    ledger: Arc<dyn Ledger>,
    store: RecordStore,
    notifier: Arc<dyn Notifier>,
    audit: Arc<AuditTrail>,
    retry: RetryPolicy,
    cas_retries: u32,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        store: RecordStore,
        notifier: Arc<dyn Notifier>,
        audit: Arc<AuditTrail>,
        retry: RetryPolicy,
        cas_retries: u32,
    ) -> Self {
        Self {
            ledger,
            store,
            notifier,
            audit,
            retry,
            cas_retries,
        }
    }

    /// Start the routing task. Must be called from within a tokio runtime.
    pub fn spawn(self) -> (DispatchHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Arc::new(self).run(rx));
        (DispatchHandle { tx }, task)
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Command>) {
        let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<WalletId>();
        let mut workers: HashMap<WalletId, Worker> = HashMap::new();
        // Workers that reported idle and may still be finishing buffered nonces.
        let mut retiring: HashMap<WalletId, JoinHandle<()>> = HashMap::new();

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Wake { wallet_id, nonce }) => {
                        let worker = workers.entry(wallet_id.clone()).or_insert_with(|| {
                            self.clone().start_worker(wallet_id.clone(), retiring.remove(&wallet_id), idle_tx.clone())
                        });
                        if worker.nonces.send(nonce).is_err() {
                            warn!(wallet = %wallet_id, nonce, "Submission worker is gone; nonce stays queued until recovery");
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(wallet_id) = idle_rx.recv() => {
                    if let Some(worker) = workers.remove(&wallet_id) {
                        debug!(wallet = %wallet_id, "Submission worker idle");
                        retiring.insert(wallet_id, worker.task);
                    }
                    retiring.retain(|_, task| !task.is_finished());
                }
            }
        }

        // Closing the channels lets each worker finish its buffered nonces and exit.
        let tasks = workers
            .into_iter()
            .map(|(wallet_id, worker)| (wallet_id, worker.task))
            .chain(retiring);
        for (wallet_id, task) in tasks {
            if let Err(e) = task.await {
                error!(wallet = %wallet_id, "Submission worker panicked: {e}");
            }
        }
        info!("Submission dispatcher stopped");
    }

    /// A new worker for a wallet waits for its retiring predecessor, so at most
    /// one worker submits for a wallet at any time.
    fn start_worker(
        self: Arc<Self>,
        wallet_id: WalletId,
        predecessor: Option<JoinHandle<()>>,
        idle: mpsc::UnboundedSender<WalletId>,
    ) -> Worker {
        let (nonces, rx) = mpsc::unbounded_channel();
        debug!(wallet = %wallet_id, "Starting submission worker");
        let task = tokio::spawn(async move {
            if let Some(previous) = predecessor {
                let _ = previous.await;
            }
            self.wallet_worker(wallet_id, rx, idle).await;
        });
        Worker { nonces, task }
    }

    async fn wallet_worker(
        self: Arc<Self>,
        wallet_id: WalletId,
        mut rx: mpsc::UnboundedReceiver<u64>,
        idle: mpsc::UnboundedSender<WalletId>,
    ) {
        let mut queue: BTreeSet<u64> = BTreeSet::new();
        let mut failures = 0u32;
        let mut reported_idle = false;

        loop {
            while let Ok(nonce) = rx.try_recv() {
                queue.insert(nonce);
            }
            let Some(nonce) = queue.pop_first() else {
                if !reported_idle {
                    reported_idle = true;
                    let _ = idle.send(wallet_id.clone());
                }
                match rx.recv().await {
                    Some(nonce) => {
                        queue.insert(nonce);
                        continue;
                    }
                    None => break,
                }
            };

            match self.advance(&wallet_id, nonce).await {
                Ok(Advance::Done) => failures = 0,
                Ok(Advance::Behind) => {
                    queue.insert(nonce);
                    queue.insert(nonce - 1);
                }
                Err(e) => {
                    failures += 1;
                    if failures >= self.retry.max_attempts {
                        error!(wallet = %wallet_id, nonce, failures, "{e}; leaving submissions queued until the next wake");
                        self.audit.log(AuditRecord::new(
                            AuditEventType::Error,
                            wallet_id.as_str(),
                            format!("nonce {nonce} left queued after {failures} store errors: {e}"),
                        ));
                        // Later nonces would only wait behind this one.
                        queue.clear();
                        failures = 0;
                    } else {
                        let delay = self.retry.backoff(failures);
                        warn!(wallet = %wallet_id, nonce, failures, delay_ms = delay.as_millis() as u64, "{e}; retrying");
                        queue.insert(nonce);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    async fn advance(&self, wallet_id: &WalletId, nonce: u64) -> Result<Advance> {
        let Some(tx) = self.queued_at(wallet_id, nonce)? else {
            return Ok(Advance::Done);
        };
        if nonce > 1 && self.queued_at(wallet_id, nonce - 1)?.is_some() {
            return Ok(Advance::Behind);
        }
        self.submit_with_retry(tx).await?;
        Ok(Advance::Done)
    }

    /// The transaction executed at `nonce`, if its submission is still outstanding.
    fn queued_at(&self, wallet_id: &WalletId, nonce: u64) -> Result<Option<PendingTransaction>> {
        let Some(entry) = self
            .store
            .load::<ExecutedNonce>(&ExecutedNonce::storage_id(wallet_id, nonce))?
        else {
            return Ok(None);
        };
        let tx = self.store.fetch::<PendingTransaction>(entry.value.tx_id.as_str())?.value;
        Ok(tx.awaiting_submission().then_some(tx))
    }

    async fn submit(&self, submission: &LedgerSubmission) -> std::result::Result<LedgerReceipt, String> {
        let timeout = self.retry.submit_timeout();
        match tokio::time::timeout(timeout, self.ledger.submit(submission)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(format!(
                "ledger submission timed out after {}ms",
                timeout.as_millis()
            )),
        }
    }

    async fn submit_with_retry(&self, tx: PendingTransaction) -> Result<()> {
        let submission = tx.ledger_submission().ok_or_else(|| {
            QuorumError::State(format!("transaction {} has no executed nonce", tx.tx_id))
        })?;
        let mut attempts = tx.submission_attempts();

        loop {
            attempts += 1;
            match self.submit(&submission).await {
                Ok(receipt) => {
                    self.set_submission(
                        &tx,
                        SubmissionState::Confirmed {
                            reference: receipt.reference.clone(),
                            attempts,
                        },
                    )?;
                    info!(tx = %tx.tx_id, nonce = submission.nonce, attempts, "Submitted to ledger");
                    self.audit.log(AuditRecord::new(
                        AuditEventType::Submission,
                        tx.tx_id.as_str(),
                        format!("nonce {} confirmed as {}", submission.nonce, receipt.reference),
                    ));
                    self.notifier.notify(&Notification::SubmissionConfirmed {
                        wallet_id: tx.wallet_id.clone(),
                        tx_id: tx.tx_id.clone(),
                        nonce: submission.nonce,
                        reference: receipt.reference,
                    });
                    return Ok(());
                }
                Err(reason) => {
                    let err = QuorumError::Execution(reason.clone());
                    if attempts >= self.retry.max_attempts {
                        self.set_submission(
                            &tx,
                            SubmissionState::Failed {
                                reason: reason.clone(),
                                attempts,
                            },
                        )?;
                        error!(tx = %tx.tx_id, nonce = submission.nonce, attempts, "{err}; giving up");
                        self.audit.log(AuditRecord::new(
                            AuditEventType::Error,
                            tx.tx_id.as_str(),
                            format!("nonce {} failed after {} attempts: {}", submission.nonce, attempts, err),
                        ));
                        self.notifier.notify(&Notification::SubmissionFailed {
                            wallet_id: tx.wallet_id.clone(),
                            tx_id: tx.tx_id.clone(),
                            nonce: submission.nonce,
                            reason,
                            attempts,
                        });
                        return Ok(());
                    }

                    self.set_submission(&tx, SubmissionState::Queued { attempts })?;
                    let delay = self.retry.backoff(attempts);
                    warn!(
                        tx = %tx.tx_id,
                        nonce = submission.nonce,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        "{err}; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn set_submission(&self, tx: &PendingTransaction, state: SubmissionState) -> Result<()> {
        self.store
            .modify::<PendingTransaction, _>(tx.tx_id.as_str(), self.cas_retries, |current| {
                if !current.awaiting_submission() {
                    return Err(QuorumError::State(format!(
                        "transaction {} is no longer awaiting submission",
                        current.tx_id
                    )));
                }
                current.submission = Some(state.clone());
                current.updated_at = Utc::now();
                Ok(())
            })?;
        Ok(())
    }
}

/// Executed transactions whose ledger submission is still outstanding.
/// Full scan, only used once at start.
pub(crate) fn queued_transactions(store: &RecordStore) -> Result<Vec<PendingTransaction>> {
    Ok(store
        .scan::<PendingTransaction>()?
        .into_iter()
        .map(|v| v.value)
        .filter(|tx| tx.awaiting_submission())
        .collect())
}
