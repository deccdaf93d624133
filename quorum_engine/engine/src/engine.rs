//! Service container: builds every component from a config plus injected
//! collaborators and owns the submission dispatcher's lifetime.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::audit::AuditTrail;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::ledger::dispatcher::queued_transactions;
use crate::ledger::{DispatchHandle, Dispatcher, Ledger};
use crate::mpc::TransactionCoordinator;
use crate::notify::{Notifier, TracingNotifier};
use crate::registry::{KeyStore, WalletRegistry};
use crate::store::RecordStore;
use crate::types::WalletId;
use crate::verify::{Ed25519Verifier, SignatureVerifier, VerificationService};

/// External capabilities the engine calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Ed25519 verification and log-only notifications around the given ledger.
    pub fn with_ledger(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            ledger,
            verifier: Arc::new(Ed25519Verifier),
            notifier: Arc::new(TracingNotifier),
        }
    }
}

pub struct Engine {
    pub config: EngineConfig,
    pub audit: Arc<AuditTrail>,
    pub wallets: Arc<WalletRegistry>,
    pub keys: Arc<KeyStore>,
    pub coordinator: Arc<TransactionCoordinator>,
    pub verification: Arc<VerificationService>,
    store: RecordStore,
    dispatch: DispatchHandle,
    dispatcher_task: JoinHandle<()>,
}

impl Engine {
    /// Start on a fresh store of the configured mode.
    pub fn start(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        let store = RecordStore::open(config.store_mode);
        Self::start_with_store(config, store, collaborators)
    }

    /// Start on an existing store, re-queuing any executed transaction whose
    /// ledger submission never completed. Must be called inside a tokio runtime.
    pub fn start_with_store(
        config: EngineConfig,
        store: RecordStore,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let audit = Arc::new(AuditTrail::new(config.audit_capacity));
        let wallets = Arc::new(WalletRegistry::new(store.clone(), audit.clone(), config.cas_retries));
        let keys = Arc::new(KeyStore::new(store.clone(), audit.clone(), config.cas_retries));

        let (dispatch, dispatcher_task) = Dispatcher::new(
            collaborators.ledger,
            store.clone(),
            collaborators.notifier.clone(),
            audit.clone(),
            config.retry,
            config.cas_retries,
        )
        .spawn();

        let coordinator = Arc::new(TransactionCoordinator::new(
            store.clone(),
            wallets.clone(),
            audit.clone(),
            collaborators.notifier,
            dispatch.clone(),
            config.pending_ttl(),
            config.cas_retries,
        ));
        let verification = Arc::new(VerificationService::new(
            store.clone(),
            keys.clone(),
            collaborators.verifier,
            audit.clone(),
            config.cas_retries,
        ));

        let engine = Self {
            config,
            audit,
            wallets,
            keys,
            coordinator,
            verification,
            store,
            dispatch,
            dispatcher_task,
        };
        let recovered = engine.recover()?;
        info!(
            store = ?engine.config.store_mode,
            recovered,
            "Quorum engine started"
        );
        Ok(engine)
    }

    /// Hand every unconfirmed execution back to the dispatcher.
    /// Returns how many transactions were waiting.
    fn recover(&self) -> Result<usize> {
        let queued = queued_transactions(&self.store)?;
        let mut wallets: BTreeSet<&WalletId> = BTreeSet::new();
        for tx in &queued {
            if let Some(nonce) = tx.executed_nonce {
                self.dispatch.wake(&tx.wallet_id, nonce)?;
                wallets.insert(&tx.wallet_id);
            }
        }
        if !queued.is_empty() {
            info!(transactions = queued.len(), wallets = wallets.len(), "Re-queued unconfirmed ledger submissions");
        }
        Ok(queued.len())
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Stop accepting submissions and wait for in-flight ones to finish.
    /// Anything still queued stays in the store for the next start.
    pub async fn shutdown(self) {
        self.dispatch.shutdown();
        if let Err(e) = self.dispatcher_task.await {
            error!("Submission dispatcher panicked: {e}");
        }
        info!("Quorum engine stopped");
    }
}
