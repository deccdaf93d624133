use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audit::{AuditEventType, AuditRecord, AuditTrail};
use crate::error::{QuorumError, Result};
use crate::registry::validate_party_set;
use crate::store::{Record, RecordStore, Table, WriteBatch};
use crate::types::{KeyId, SignerId};

/// Public key plus the parties allowed to attest under it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub key_id: KeyId,
    #[serde(with = "hex_bytes")]
    pub public_key: Vec<u8>,
    pub threshold: u32,
    pub authorized_parties: BTreeSet<SignerId>,
    pub purpose: String,
    /// Signer count of the most recently attested subject.
    pub current_signature_count: u32,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Key {
    pub fn is_authorized(&self, party: &SignerId) -> bool {
        self.authorized_parties.contains(party)
    }
}

impl Record for Key {
    const TABLE: Table = Table::Keys;

    fn record_id(&self) -> String {
        self.key_id.0.clone()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Owns attestation key records. Keys are never deleted, only deactivated.
pub struct KeyStore {
    store: RecordStore,
    audit: Arc<AuditTrail>,
    cas_retries: u32,
}

impl KeyStore {
    pub fn new(store: RecordStore, audit: Arc<AuditTrail>, cas_retries: u32) -> Self {
        Self {
            store,
            audit,
            cas_retries,
        }
    }

    pub fn create_key(
        &self,
        key_id: KeyId,
        public_key: Vec<u8>,
        threshold: u32,
        authorized_parties: Vec<SignerId>,
        purpose: &str,
    ) -> Result<Key> {
        if key_id.as_str().trim().is_empty() {
            return Err(QuorumError::Validation("key id must not be blank".into()));
        }
        if self.store.load::<Key>(key_id.as_str())?.is_some() {
            return Err(QuorumError::Duplicate(format!("key {key_id} already exists")));
        }
        let authorized_parties = validate_party_set(authorized_parties, threshold, "authorized parties")?;

        let key = Key {
            key_id,
            public_key,
            threshold,
            authorized_parties,
            purpose: purpose.to_string(),
            current_signature_count: 0,
            is_active: true,
            last_used_at: None,
            created_at: Utc::now(),
        };
        self.store.commit(WriteBatch::new().insert(&key)?)?;

        info!(key = %key.key_id, threshold, purpose, "Key created");
        self.audit.log(AuditRecord::new(
            AuditEventType::KeyCreated,
            key.key_id.as_str(),
            format!(
                "{}-of-{} key for {}",
                threshold,
                key.authorized_parties.len(),
                key.purpose
            ),
        ));
        Ok(key)
    }

    pub fn get_key(&self, key_id: &KeyId) -> Result<Key> {
        Ok(self.store.fetch::<Key>(key_id.as_str())?.value)
    }

    /// Stamp `last_used_at` after a verification event.
    pub fn record_usage(&self, key_id: &KeyId) -> Result<()> {
        let now = Utc::now();
        self.store
            .modify::<Key, _>(key_id.as_str(), self.cas_retries, |key| {
                key.last_used_at = Some(now);
                Ok(())
            })?;
        debug!(key = %key_id, "Key usage recorded");
        Ok(())
    }

    pub(crate) fn set_signature_count(&self, key_id: &KeyId, count: u32) -> Result<()> {
        self.store
            .modify::<Key, _>(key_id.as_str(), self.cas_retries, |key| {
                key.current_signature_count = count;
                Ok(())
            })?;
        Ok(())
    }

    pub fn deactivate(&self, key_id: &KeyId) -> Result<()> {
        let mut changed = false;
        self.store
            .modify::<Key, _>(key_id.as_str(), self.cas_retries, |key| {
                changed = key.is_active;
                key.is_active = false;
                Ok(())
            })?;

        if changed {
            info!(key = %key_id, "Key deactivated");
            self.audit.log(AuditRecord::new(
                AuditEventType::KeyDeactivated,
                key_id.as_str(),
                "key deactivated",
            ));
        }
        Ok(())
    }
}
