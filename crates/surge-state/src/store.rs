//! StateStore — redb-backed state persistence for Surge.
//!
//! Provides typed CRUD operations over scaling targets plus an append-only
//! decision audit trail. All values are JSON-serialized into redb's `&[u8]`
//! value columns. The store supports both on-disk and in-memory backends
//! (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Flatten a backend error into the named `StateError` variant.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// redb-backed store handle; clones share one database.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open the on-disk store, creating the file on first run.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Open an ephemeral store with no backing file.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Ensure both tables exist before the first read.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // redb creates a table on first open inside a write transaction.
        txn.open_table(TARGETS).map_err(map_err!(Table))?;
        txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Targets ────────────────────────────────────────────────────

    /// Insert or update a scaling target.
    pub fn put_target(&self, target: &ScalingTarget) -> StateResult<()> {
        let value = serde_json::to_vec(target).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            table
                .insert(target.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(target = %target.name, replicas = target.current_replicas, "target stored");
        Ok(())
    }

    /// Get a target by name.
    pub fn get_target(&self, name: &str) -> StateResult<Option<ScalingTarget>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => {
                let target: ScalingTarget =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(target))
            }
            None => Ok(None),
        }
    }

    /// List all registered targets.
    pub fn list_targets(&self) -> StateResult<Vec<ScalingTarget>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let target: ScalingTarget =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(target);
        }
        Ok(results)
    }

    /// Delete a target by name. Returns true if it existed.
    pub fn delete_target(&self, name: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(TARGETS).map_err(map_err!(Table))?;
            existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(target = %name, existed, "target deleted");
        Ok(existed)
    }

    // ── Decisions ──────────────────────────────────────────────────

    /// Append a decision to a target's audit trail.
    ///
    /// Assigns the next sequence number for the target inside a single
    /// write transaction and returns the stored record.
    pub fn append_decision(
        &self,
        target: &str,
        decision: &ScalingDecision,
        observed: MetricValue,
    ) -> StateResult<DecisionRecord> {
        let prefix = format!("{target}/");
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record;
        {
            let mut table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;

            // Keys are zero-padded, so the last matching entry holds the
            // highest sequence number.
            let mut last: Option<Vec<u8>> = None;
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if key.value().starts_with(&prefix) {
                    last = Some(value.value().to_vec());
                }
            }
            let next_seq = match last {
                Some(bytes) => {
                    let prev: DecisionRecord =
                        serde_json::from_slice(&bytes).map_err(map_err!(Deserialize))?;
                    prev.seq + 1
                }
                None => 0,
            };

            record = DecisionRecord {
                target: target.to_string(),
                seq: next_seq,
                decision: decision.clone(),
                observed,
            };
            let key = record.table_key();
            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(record)
    }

    /// List the most recent decisions for a target, oldest first.
    pub fn list_decisions_for_target(
        &self,
        target: &str,
        limit: usize,
    ) -> StateResult<Vec<DecisionRecord>> {
        let prefix = format!("{target}/");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(&prefix) {
                let record: DecisionRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(record);
            }
        }
        if results.len() > limit {
            results = results.split_off(results.len() - limit);
        }
        Ok(results)
    }

    /// Drop all but the most recent `keep` decisions for a target.
    ///
    /// Returns the number of records removed.
    pub fn prune_decisions(&self, target: &str, keep: usize) -> StateResult<u32> {
        let prefix = format!("{target}/");
        // Collect matching keys in a read transaction first.
        let mut keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };
        if keys.len() <= keep {
            return Ok(0);
        }
        keys.truncate(keys.len() - keep);

        // Collected under a read txn; deleted under a write txn.
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = keys.len() as u32;
        {
            let mut table = txn.open_table(DECISIONS).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%target, pruned = count, "decision history pruned");
        Ok(count)
    }
}
