//! Record store abstraction for wallets, keys, transactions and verification records.
//! Backends hold opaque versioned blobs; this module layers typed records on top.
//! Every mutation goes through an atomic batch of inserts and compare-and-swaps.

pub mod memory;
pub mod sealed;

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{QuorumError, Result};
use memory::MemoryBackend;
use sealed::SealedBackend;

/// Logical tables, one per entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Wallets,
    Keys,
    Transactions,
    /// Per-wallet index from executed nonce to transaction.
    Nonces,
    Verifications,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Table::Wallets => "wallets",
            Table::Keys => "keys",
            Table::Transactions => "transactions",
            Table::Nonces => "nonces",
            Table::Verifications => "verifications",
        };
        f.write_str(name)
    }
}

/// A stored blob and the version it was written at. Versions start at 1.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub version: u64,
    pub bytes: Vec<u8>,
}

/// One write inside an atomic batch.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Create a row; fails with `Duplicate` if the id is taken.
    Insert { table: Table, id: String, bytes: Vec<u8> },
    /// Replace a row only if it is still at `expected_version`; fails with `Conflict` otherwise.
    Swap {
        table: Table,
        id: String,
        expected_version: u64,
        bytes: Vec<u8>,
    },
}

/// Pluggable storage backend. Implementations must apply a batch all-or-nothing
/// and return scans in insertion order.
pub trait StoreBackend: Send + Sync {
    fn get(&self, table: Table, id: &str) -> Result<Option<RawRecord>>;
    fn ids(&self, table: Table) -> Result<Vec<String>>;
    fn apply(&self, batch: Vec<Mutation>) -> Result<()>;
}

/// Which backend the engine should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    Memory,
    #[default]
    Sealed,
}

/// An entity that lives in one table under a string id.
pub trait Record: Serialize + DeserializeOwned {
    const TABLE: Table;
    fn record_id(&self) -> String;
}

/// A decoded record together with the version needed to swap it.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: T,
}

/// Builder for an atomic multi-record write.
#[derive(Debug, Default)]
pub struct WriteBatch {
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Record>(mut self, record: &T) -> Result<Self> {
        self.mutations.push(Mutation::Insert {
            table: T::TABLE,
            id: record.record_id(),
            bytes: serde_json::to_vec(record)?,
        });
        Ok(self)
    }

    pub fn swap<T: Record>(mut self, expected_version: u64, record: &T) -> Result<Self> {
        self.mutations.push(Mutation::Swap {
            table: T::TABLE,
            id: record.record_id(),
            expected_version,
            bytes: serde_json::to_vec(record)?,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Typed handle over a shared backend. Cheap to clone.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn StoreBackend>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    /// Build a fresh backend for the chosen mode.
    pub fn open(mode: StoreMode) -> Self {
        let backend: Arc<dyn StoreBackend> = match mode {
            StoreMode::Memory => Arc::new(MemoryBackend::new()),
            StoreMode::Sealed => Arc::new(SealedBackend::new()),
        };
        Self::new(backend)
    }

    pub fn load<T: Record>(&self, id: &str) -> Result<Option<Versioned<T>>> {
        match self.backend.get(T::TABLE, id)? {
            Some(raw) => {
                let value = serde_json::from_slice(&raw.bytes)?;
                Ok(Some(Versioned {
                    version: raw.version,
                    value,
                }))
            }
            None => Ok(None),
        }
    }

    /// Like `load`, but a missing row is a `NotFound` error.
    pub fn fetch<T: Record>(&self, id: &str) -> Result<Versioned<T>> {
        self.load(id)?
            .ok_or_else(|| QuorumError::NotFound(format!("{} {}", T::TABLE, id)))
    }

    /// Ids of one table in insertion order.
    pub fn ids<T: Record>(&self) -> Result<Vec<String>> {
        self.backend.ids(T::TABLE)
    }

    /// Every record of one table in insertion order.
    pub fn scan<T: Record>(&self) -> Result<Vec<Versioned<T>>> {
        let mut out = Vec::new();
        for id in self.backend.ids(T::TABLE)? {
            if let Some(record) = self.load::<T>(&id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        debug!(mutations = batch.len(), "Committing write batch");
        self.backend.apply(batch.mutations)
    }

    /// Read-modify-write of a single record under compare-and-swap.
    /// `f` runs against the latest version on every attempt and may abort with an error.
    pub fn modify<T, F>(&self, id: &str, attempts: u32, mut f: F) -> Result<T>
    where
        T: Record + Clone,
        F: FnMut(&mut T) -> Result<()>,
    {
        for attempt in 1..=attempts.max(1) {
            let current = self.fetch::<T>(id)?;
            let mut next = current.value.clone();
            f(&mut next)?;

            match self.commit(WriteBatch::new().swap(current.version, &next)?) {
                Ok(()) => return Ok(next),
                Err(QuorumError::Conflict(reason)) => {
                    debug!(table = %T::TABLE, id, attempt, %reason, "Swap lost a race, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(QuorumError::Conflict(format!(
            "{} {} kept changing under {} attempts",
            T::TABLE,
            id,
            attempts.max(1)
        )))
    }
}
