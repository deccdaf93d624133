use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{QuorumError, Result};
use crate::store::{Mutation, RawRecord, StoreBackend, Table};

#[derive(Default)]
struct TableData {
    rows: HashMap<String, RawRecord>,
    order: Vec<String>,
}

/// Plaintext in-process backend. One write lock covers a whole batch,
/// which is what makes multi-record compare-and-swap atomic.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, TableData>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> QuorumError {
    QuorumError::Store("Store lock poisoned".to_string())
}

impl StoreBackend for MemoryBackend {
    fn get(&self, table: Table, id: &str) -> Result<Option<RawRecord>> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.get(&table).and_then(|t| t.rows.get(id)).cloned())
    }

    fn ids(&self, table: Table) -> Result<Vec<String>> {
        let tables = self.tables.read().map_err(|_| poisoned())?;
        Ok(tables.get(&table).map(|t| t.order.clone()).unwrap_or_default())
    }

    fn apply(&self, batch: Vec<Mutation>) -> Result<()> {
        let mut tables = self.tables.write().map_err(|_| poisoned())?;

        // Validate the whole batch before touching anything.
        let mut pending: HashMap<(Table, &str), u64> = HashMap::new();
        for mutation in &batch {
            match mutation {
                Mutation::Insert { table, id, .. } => {
                    let taken = pending.contains_key(&(*table, id.as_str()))
                        || tables.get(table).is_some_and(|t| t.rows.contains_key(id));
                    if taken {
                        return Err(QuorumError::Duplicate(format!("{table} {id} already exists")));
                    }
                    pending.insert((*table, id.as_str()), 1);
                }
                Mutation::Swap {
                    table,
                    id,
                    expected_version,
                    ..
                } => {
                    let current = pending.get(&(*table, id.as_str())).copied().or_else(|| {
                        tables
                            .get(table)
                            .and_then(|t| t.rows.get(id))
                            .map(|r| r.version)
                    });
                    match current {
                        None => {
                            return Err(QuorumError::Store(format!("{table} {id} does not exist")));
                        }
                        Some(v) if v != *expected_version => {
                            return Err(QuorumError::Conflict(format!(
                                "{table} {id} is at version {v}, expected {expected_version}"
                            )));
                        }
                        Some(v) => {
                            pending.insert((*table, id.as_str()), v + 1);
                        }
                    }
                }
            }
        }
        drop(pending);

        for mutation in batch {
            match mutation {
                Mutation::Insert { table, id, bytes } => {
                    let data = tables.entry(table).or_default();
                    data.order.push(id.clone());
                    data.rows.insert(id, RawRecord { version: 1, bytes });
                }
                Mutation::Swap {
                    table,
                    id,
                    expected_version,
                    bytes,
                } => {
                    let data = tables.entry(table).or_default();
                    data.rows.insert(
                        id,
                        RawRecord {
                            version: expected_version + 1,
                            bytes,
                        },
                    );
                }
            }
        }
        Ok(())
    }
}
