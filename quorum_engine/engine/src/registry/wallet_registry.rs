use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::audit::{AuditEventType, AuditRecord, AuditTrail};
use crate::error::Result;
use crate::registry::validate_party_set;
use crate::store::{Record, RecordStore, Table, Versioned, WriteBatch};
use crate::types::{SignerId, WalletId};

/// A threshold wallet. Signers and threshold never change after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MpcWallet {
    pub wallet_id: WalletId,
    pub signers: BTreeSet<SignerId>,
    pub threshold: u32,
    /// Number of transactions executed so far.
    pub nonce: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl MpcWallet {
    pub fn is_signer(&self, signer: &SignerId) -> bool {
        self.signers.contains(signer)
    }
}

impl Record for MpcWallet {
    const TABLE: Table = Table::Wallets;

    fn record_id(&self) -> String {
        self.wallet_id.0.clone()
    }
}

/// Owns wallet records
pub struct WalletRegistry {
    store: RecordStore,
    audit: Arc<AuditTrail>,
    cas_retries: u32,
}

impl WalletRegistry {
    pub fn new(store: RecordStore, audit: Arc<AuditTrail>, cas_retries: u32) -> Self {
        Self {
            store,
            audit,
            cas_retries,
        }
    }

    /// Register a new wallet with nonce 0
    pub fn create_wallet(&self, signers: Vec<SignerId>, threshold: u32) -> Result<WalletId> {
        let signers = validate_party_set(signers, threshold, "signers")?;

        let wallet = MpcWallet {
            wallet_id: WalletId::generate(),
            signers,
            threshold,
            nonce: 0,
            is_active: true,
            created_at: Utc::now(),
        };
        self.store.commit(WriteBatch::new().insert(&wallet)?)?;

        info!(wallet = %wallet.wallet_id, threshold, signers = wallet.signers.len(), "Wallet created");
        self.audit.log(AuditRecord::new(
            AuditEventType::WalletCreated,
            wallet.wallet_id.as_str(),
            format!("{}-of-{} wallet", threshold, wallet.signers.len()),
        ));
        Ok(wallet.wallet_id)
    }

    pub fn get_wallet(&self, wallet_id: &WalletId) -> Result<MpcWallet> {
        Ok(self.store.fetch::<MpcWallet>(wallet_id.as_str())?.value)
    }

    pub(crate) fn get_versioned(&self, wallet_id: &WalletId) -> Result<Versioned<MpcWallet>> {
        self.store.fetch::<MpcWallet>(wallet_id.as_str())
    }

    /// Soft-disables a wallet; pending transactions keep their state.
    pub fn deactivate(&self, wallet_id: &WalletId) -> Result<()> {
        let mut changed = false;
        self.store
            .modify::<MpcWallet, _>(wallet_id.as_str(), self.cas_retries, |wallet| {
                changed = wallet.is_active;
                wallet.is_active = false;
                Ok(())
            })?;

        if changed {
            info!(wallet = %wallet_id, "Wallet deactivated");
            self.audit.log(AuditRecord::new(
                AuditEventType::WalletDeactivated,
                wallet_id.as_str(),
                "wallet deactivated",
            ));
        }
        Ok(())
    }

    /// All wallets in creation order
    pub fn list_wallets(&self) -> Result<Vec<MpcWallet>> {
        Ok(self
            .store
            .scan::<MpcWallet>()?
            .into_iter()
            .map(|v| v.value)
            .collect())
    }
}
