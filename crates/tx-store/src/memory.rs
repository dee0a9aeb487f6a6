use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{Database, Result, StoreError, Transaction};

/// Tables held by a [`MemoryDatabase`].
///
/// Each table is an ordered map from a string key to a JSON row, so keys
/// should be chosen to sort in the order rows are scanned (zero-padded
/// sequence numbers, `parent/index` composites).
#[derive(Debug, Clone, Default)]
pub struct MemoryTables {
    tables: HashMap<String, BTreeMap<String, Value>>,
    sequences: HashMap<String, i64>,
}

impl MemoryTables {
    /// Returns the next value of the table's sequence, starting at 1.
    pub fn next_sequence(&mut self, table: &str) -> i64 {
        let seq = self.sequences.entry(table.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Inserts or replaces a row, returning the previous one.
    pub fn upsert(&mut self, table: &str, key: impl Into<String>, row: Value) -> Option<Value> {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(key.into(), row)
    }

    /// Serializes `row` and upserts it.
    pub fn upsert_row<T: Serialize>(
        &mut self,
        table: &str,
        key: impl Into<String>,
        row: &T,
    ) -> Result<()> {
        let value = serde_json::to_value(row)?;
        self.upsert(table, key, value);
        Ok(())
    }

    /// Returns a row by key.
    pub fn get(&self, table: &str, key: &str) -> Option<&Value> {
        self.tables.get(table).and_then(|rows| rows.get(key))
    }

    /// Returns a row by key, decoded into `T`.
    pub fn get_row<T: DeserializeOwned>(&self, table: &str, key: &str) -> Result<Option<T>> {
        self.get(table, key)
            .map(|value| serde_json::from_value(value.clone()).map_err(StoreError::from))
            .transpose()
    }

    /// Returns a mutable row by key.
    pub fn get_mut(&mut self, table: &str, key: &str) -> Option<&mut Value> {
        self.tables.get_mut(table).and_then(|rows| rows.get_mut(key))
    }

    /// Iterates over every row of a table in key order.
    pub fn rows<'a>(&'a self, table: &str) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.tables
            .get(table)
            .into_iter()
            .flat_map(|rows| rows.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Iterates over the rows whose key starts with `prefix`, in key order.
    pub fn rows_with_prefix<'a>(
        &'a self,
        table: &str,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
        self.tables.get(table).into_iter().flat_map(move |rows| {
            rows.range(prefix.to_string()..)
                .take_while(move |(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.as_str(), v))
        })
    }

    /// Returns the number of rows in a table.
    pub fn len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Returns true if a table has no rows.
    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_commits: AtomicUsize,
    committed: AtomicUsize,
}

/// In-memory transactional store for testing.
///
/// Transactions are fully serialized: `begin` takes an exclusive lock that is
/// held until the transaction commits, rolls back or is dropped. Writes go to
/// a private copy of the tables and only replace the shared state on commit.
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<MemoryTables>>,
    faults: Arc<Faults>,
}

impl MemoryDatabase {
    /// Creates a new empty in-memory database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the committed tables.
    ///
    /// Waits for any open transaction to finish.
    pub async fn snapshot(&self) -> MemoryTables {
        self.tables.lock().await.clone()
    }

    /// Makes the next `count` commits fail with [`StoreError::CommitRejected`].
    pub fn fail_next_commits(&self, count: usize) {
        self.faults.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Returns how many transactions have been committed.
    pub fn commit_count(&self) -> usize {
        self.faults.committed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let guard = Arc::clone(&self.tables).lock_owned().await;
        let working = guard.clone();
        Ok(MemoryTransaction {
            guard,
            working,
            faults: Arc::clone(&self.faults),
        })
    }
}

/// An open in-memory transaction.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryTables>,
    working: MemoryTables,
    faults: Arc<Faults>,
}

impl MemoryTransaction {
    /// Returns the tables as seen by this transaction.
    pub fn tables(&self) -> &MemoryTables {
        &self.working
    }

    /// Returns the tables for writing.
    pub fn tables_mut(&mut self) -> &mut MemoryTables {
        &mut self.working
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self) -> Result<()> {
        let rejected = self
            .faults
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(StoreError::CommitRejected(
                "in-memory commit failure injected".to_string(),
            ));
        }

        let MemoryTransaction {
            mut guard,
            working,
            faults,
        } = self;
        *guard = working;
        faults.committed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}
