//! Key-based attestation tracking for product authenticity claims.
//!
//! Attestation is idempotent: the same party attesting twice leaves the record
//! unchanged, unlike transaction signing where a repeat signature is rejected.

pub mod signature;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audit::{AuditEventType, AuditRecord, AuditTrail};
use crate::error::{QuorumError, Result};
use crate::registry::{Key, KeyStore};
use crate::store::{Record, RecordStore, Table, WriteBatch};
use crate::types::{KeyId, SignerId};

pub use self::signature::{Ed25519Verifier, SignatureVerifier, attestation_message};

/// Attestations collected for one subject under one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub key_id: KeyId,
    pub subject_id: String,
    pub signer_set: BTreeSet<SignerId>,
    /// Latches to true once the key threshold is met.
    pub verified: bool,
    pub updated_at: DateTime<Utc>,
}

impl VerificationRecord {
    fn storage_id(key_id: &KeyId, subject_id: &str) -> String {
        format!("{}:{}/{}", key_id.as_str().len(), key_id, subject_id)
    }
}

impl Record for VerificationRecord {
    const TABLE: Table = Table::Verifications;

    fn record_id(&self) -> String {
        Self::storage_id(&self.key_id, &self.subject_id)
    }
}

pub struct VerificationService {
    store: RecordStore,
    keys: Arc<KeyStore>,
    verifier: Arc<dyn SignatureVerifier>,
    audit: Arc<AuditTrail>,
    cas_retries: u32,
}

impl VerificationService {
    pub fn new(
        store: RecordStore,
        keys: Arc<KeyStore>,
        verifier: Arc<dyn SignatureVerifier>,
        audit: Arc<AuditTrail>,
        cas_retries: u32,
    ) -> Self {
        Self {
            store,
            keys,
            verifier,
            audit,
            cas_retries: cas_retries.max(1),
        }
    }

    /// Record a party's attestation of `subject_id` and return whether the
    /// subject is now verified under the key.
    pub fn attest(
        &self,
        key_id: &KeyId,
        subject_id: &str,
        signer: &SignerId,
        signature_proof: &[u8],
    ) -> Result<bool> {
        let key = self.active_key(key_id)?;
        if !key.is_authorized(signer) {
            return Err(QuorumError::Authorization(format!(
                "{signer} is not an authorized party of key {key_id}"
            )));
        }

        let message = attestation_message(key_id, subject_id, signer);
        self.verifier
            .verify(&key.public_key, &message, signature_proof)
            .map_err(QuorumError::InvalidSignature)?;

        let record = self.add_signer(&key, subject_id, signer)?;

        // The attestation is committed; key bookkeeping is best effort from here.
        if let Err(e) = self
            .keys
            .set_signature_count(key_id, record.signer_set.len() as u32)
        {
            warn!(key = %key_id, subject = subject_id, "Signature count not updated: {e}");
        }
        if let Err(e) = self.keys.record_usage(key_id) {
            warn!(key = %key_id, subject = subject_id, "Key usage not recorded: {e}");
        }

        info!(
            key = %key_id,
            subject = subject_id,
            %signer,
            signers = record.signer_set.len(),
            threshold = key.threshold,
            verified = record.verified,
            "Attestation recorded"
        );
        self.audit.log(
            AuditRecord::new(
                AuditEventType::Attestation,
                key_id.as_str(),
                format!(
                    "subject {subject_id}: {}/{} attestations, verified={}",
                    record.signer_set.len(),
                    key.threshold,
                    record.verified
                ),
            )
            .by(signer.as_str()),
        );
        Ok(record.verified)
    }

    pub fn is_verified(&self, key_id: &KeyId, subject_id: &str) -> Result<bool> {
        Ok(self
            .get_record(key_id, subject_id)?
            .is_some_and(|r| r.verified))
    }

    pub fn get_record(&self, key_id: &KeyId, subject_id: &str) -> Result<Option<VerificationRecord>> {
        let id = VerificationRecord::storage_id(key_id, subject_id);
        Ok(self.store.load::<VerificationRecord>(&id)?.map(|v| v.value))
    }

    fn active_key(&self, key_id: &KeyId) -> Result<Key> {
        let key = self.keys.get_key(key_id)?;
        if !key.is_active {
            return Err(QuorumError::NotFound(format!("key {key_id} is inactive")));
        }
        Ok(key)
    }

    /// Insert-or-swap the subject's record with `signer` added.
    fn add_signer(&self, key: &Key, subject_id: &str, signer: &SignerId) -> Result<VerificationRecord> {
        let id = VerificationRecord::storage_id(&key.key_id, subject_id);
        let threshold = key.threshold as usize;

        for attempt in 1..=self.cas_retries {
            let now = Utc::now();
            let outcome = match self.store.load::<VerificationRecord>(&id)? {
                Some(current) if current.value.signer_set.contains(signer) => {
                    debug!(key = %key.key_id, subject = subject_id, %signer, "Repeat attestation ignored");
                    return Ok(current.value);
                }
                Some(current) => {
                    let mut next = current.value.clone();
                    next.signer_set.insert(signer.clone());
                    next.verified = next.verified || next.signer_set.len() >= threshold;
                    next.updated_at = now;
                    self.store
                        .commit(WriteBatch::new().swap(current.version, &next)?)
                        .map(|_| next)
                }
                None => {
                    let record = VerificationRecord {
                        key_id: key.key_id.clone(),
                        subject_id: subject_id.to_string(),
                        signer_set: BTreeSet::from([signer.clone()]),
                        verified: threshold <= 1,
                        updated_at: now,
                    };
                    self.store
                        .commit(WriteBatch::new().insert(&record)?)
                        .map(|_| record)
                }
            };

            match outcome {
                Ok(record) => return Ok(record),
                Err(QuorumError::Conflict(reason)) | Err(QuorumError::Duplicate(reason)) => {
                    debug!(key = %key.key_id, subject = subject_id, attempt, %reason, "Attestation lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(QuorumError::Conflict(format!(
            "verification record for {subject_id} under {} kept changing",
            key.key_id
        )))
    }
}
