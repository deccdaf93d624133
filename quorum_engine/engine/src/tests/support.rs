use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{EngineConfig, RetryPolicy};
use crate::engine::{Collaborators, Engine};
use crate::error::{QuorumError, Result as QuorumResult};
use crate::ledger::{Ledger, LedgerReceipt, LedgerSubmission};
use crate::notify::{Notification, Notifier};
use crate::store::memory::MemoryBackend;
use crate::store::{Mutation, RawRecord, RecordStore, StoreBackend, StoreMode, Table};
use crate::types::SignerId;
use crate::verify::SignatureVerifier;

/// Ledger double that records successful submissions and can fail on demand.
#[derive(Default)]
pub struct RecordingLedger {
    submissions: Mutex<Vec<LedgerSubmission>>,
    failures_remaining: AtomicU32,
    attempts: AtomicU32,
}

impl RecordingLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fails the next `n` calls, then succeeds.
    pub fn failing(n: u32) -> Arc<Self> {
        let ledger = Self::default();
        ledger.failures_remaining.store(n, Ordering::SeqCst);
        Arc::new(ledger)
    }

    pub fn submissions(&self) -> Vec<LedgerSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ledger for RecordingLedger {
    async fn submit(&self, submission: &LedgerSubmission) -> Result<LedgerReceipt, String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("ledger unavailable".to_string());
        }
        self.submissions.lock().unwrap().push(submission.clone());
        Ok(LedgerReceipt {
            reference: format!("ledger-{}-{}", submission.wallet_id, submission.nonce),
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Notification> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, notification: &Notification) {
        self.events.lock().unwrap().push(notification.clone());
    }
}

pub struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(&self, _public_key: &[u8], _message: &[u8], _proof: &[u8]) -> Result<(), String> {
        Ok(())
    }
}

pub struct RejectAll;

impl SignatureVerifier for RejectAll {
    fn verify(&self, _public_key: &[u8], _message: &[u8], _proof: &[u8]) -> Result<(), String> {
        Err("proof does not match key".to_string())
    }
}

/// Memory backend that can be told to fail single-row updates of one table,
/// or the id listing of the transaction table.
#[derive(Default)]
pub struct FlakyBackend {
    inner: MemoryBackend,
    swap_table: Mutex<Option<Table>>,
    swap_failures: AtomicU32,
    fail_ids: AtomicBool,
}

impl FlakyBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` batches that consist of one swap on `table`.
    pub fn fail_swaps(&self, table: Table, n: u32) {
        *self.swap_table.lock().unwrap() = Some(table);
        self.swap_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_transaction_ids(&self, fail: bool) {
        self.fail_ids.store(fail, Ordering::SeqCst);
    }

    pub fn store(self: &Arc<Self>) -> RecordStore {
        RecordStore::new(self.clone())
    }
}

impl StoreBackend for FlakyBackend {
    fn get(&self, table: Table, id: &str) -> QuorumResult<Option<RawRecord>> {
        self.inner.get(table, id)
    }

    fn ids(&self, table: Table) -> QuorumResult<Vec<String>> {
        if table == Table::Transactions && self.fail_ids.load(Ordering::SeqCst) {
            return Err(QuorumError::Store("transaction listing unavailable".to_string()));
        }
        self.inner.ids(table)
    }

    fn apply(&self, batch: Vec<Mutation>) -> QuorumResult<()> {
        let armed = *self.swap_table.lock().unwrap();
        if let (Some(target), [Mutation::Swap { table, .. }]) = (armed, batch.as_slice()) {
            let hit = *table == target
                && self
                    .swap_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if hit {
                return Err(QuorumError::Store(format!("write to {table} failed")));
            }
        }
        self.inner.apply(batch)
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        pending_ttl_secs: 60,
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            submit_timeout_ms: 20,
        },
        store_mode: StoreMode::Memory,
        cas_retries: 64,
        ..EngineConfig::default()
    }
}

pub struct Harness {
    pub engine: Engine,
    pub ledger: Arc<RecordingLedger>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn start(ledger: Arc<RecordingLedger>) -> Harness {
    start_on(RecordStore::open(StoreMode::Memory), ledger, Arc::new(AcceptAll))
}

pub fn start_on(
    store: RecordStore,
    ledger: Arc<RecordingLedger>,
    verifier: Arc<dyn SignatureVerifier>,
) -> Harness {
    let notifier = RecordingNotifier::new();
    let collaborators = Collaborators {
        ledger: ledger.clone(),
        verifier,
        notifier: notifier.clone(),
    };
    let engine = Engine::start_with_store(test_config(), store, collaborators).expect("engine start");
    Harness {
        engine,
        ledger,
        notifier,
    }
}

pub fn signers(names: &[&str]) -> Vec<SignerId> {
    names.iter().map(|n| SignerId::from(*n)).collect()
}

/// Polls until `condition` holds, failing the test after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
