//! In-memory [`Store`] backed by DashMap tables.
//!
//! Transactions are snapshot based: `begin` copies every table and the
//! state blob, `rollback` restores the copy, `commit` drops it. Concurrent
//! runs sharing one store are serialized on the transaction lock, so a run
//! never observes another run's uncommitted writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

use super::{RECORD_ID_FIELD, Scope, Store, StoreError, StoreMetadata, StoreResult};
use crate::ast::RecordSchema;
use crate::eval::value::{Record, State, Value};

#[derive(Debug, Clone)]
struct StoredRow {
    scope: Scope,
    record: Record,
}

struct Transaction {
    _lock: OwnedMutexGuard<()>,
    tables: HashMap<String, Vec<StoredRow>>,
    state: Option<State>,
}

#[derive(Clone)]
pub struct InMemoryStore {
    tables: Arc<DashMap<String, Vec<StoredRow>>>,
    state: Arc<RwLock<Option<State>>>,
    next_id: Arc<AtomicU64>,
    tx_lock: Arc<Mutex<()>>,
    active: Arc<Mutex<Option<Transaction>>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(DashMap::new()),
            state: Arc::new(RwLock::new(None)),
            next_id: Arc::new(AtomicU64::new(1)),
            tx_lock: Arc::new(Mutex::new(())),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Seed the persisted state, as if a previous run had committed it.
    pub fn with_state(self, state: State) -> Self {
        if let Ok(mut slot) = self.state.try_write() {
            *slot = Some(state);
        }
        self
    }

    /// Number of committed or pending rows of `record`, across all scopes.
    pub fn count(&self, record: &str) -> usize {
        self.tables.get(record).map(|rows| rows.len()).unwrap_or(0)
    }

    pub async fn in_transaction(&self) -> bool {
        self.active.lock().await.is_some()
    }

    fn snapshot_tables(&self) -> HashMap<String, Vec<StoredRow>> {
        self.tables
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> StoreResult<()> {
        let lock = self.tx_lock.clone().lock_owned().await;
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(StoreError::TransactionActive);
        }
        *active = Some(Transaction {
            _lock: lock,
            tables: self.snapshot_tables(),
            state: self.state.read().await.clone(),
        });
        debug!("in-memory transaction opened");
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        let mut active = self.active.lock().await;
        match active.take() {
            Some(_) => {
                debug!("in-memory transaction committed");
                Ok(())
            }
            None => Err(StoreError::NoTransaction),
        }
    }

    async fn rollback(&self) -> StoreResult<()> {
        let mut active = self.active.lock().await;
        let tx = active.take().ok_or(StoreError::NoTransaction)?;
        self.tables.clear();
        for (name, rows) in tx.tables {
            self.tables.insert(name, rows);
        }
        *self.state.write().await = tx.state;
        debug!("in-memory transaction rolled back");
        Ok(())
    }

    async fn load_state(&self) -> StoreResult<Option<State>> {
        Ok(self.state.read().await.clone())
    }

    async fn save_state(&self, state: &State) -> StoreResult<()> {
        *self.state.write().await = Some(state.clone());
        Ok(())
    }

    async fn save(
        &self,
        schema: &RecordSchema,
        mut record: Record,
        scope: &Scope,
    ) -> StoreResult<Record> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        record.insert(RECORD_ID_FIELD.to_string(), Value::from(id as i64));
        self.tables
            .entry(schema.name.clone())
            .or_default()
            .push(StoredRow {
                scope: scope.clone(),
                record: record.clone(),
            });
        Ok(record)
    }

    async fn find(&self, schema: &RecordSchema, scope: &Scope) -> StoreResult<Vec<Record>> {
        Ok(self
            .tables
            .get(&schema.name)
            .map(|rows| {
                rows.iter()
                    .filter(|row| &row.scope == scope)
                    .map(|row| row.record.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn update(
        &self,
        schema: &RecordSchema,
        id: &Value,
        changes: &Record,
        scope: &Scope,
    ) -> StoreResult<Record> {
        let not_found = || StoreError::NotFound {
            record: schema.name.clone(),
            id: id.to_string(),
        };
        let mut rows = self.tables.get_mut(&schema.name).ok_or_else(not_found)?;
        let row = rows
            .iter_mut()
            .find(|row| &row.scope == scope && row.record.get(RECORD_ID_FIELD) == Some(id))
            .ok_or_else(not_found)?;
        for (key, value) in changes {
            row.record.insert(key.clone(), value.clone());
        }
        Ok(row.record.clone())
    }

    async fn delete(&self, schema: &RecordSchema, id: &Value, scope: &Scope) -> StoreResult<()> {
        let not_found = || StoreError::NotFound {
            record: schema.name.clone(),
            id: id.to_string(),
        };
        let mut rows = self.tables.get_mut(&schema.name).ok_or_else(not_found)?;
        let before = rows.len();
        rows.retain(|row| !(&row.scope == scope && row.record.get(RECORD_ID_FIELD) == Some(id)));
        if rows.len() == before {
            return Err(not_found());
        }
        Ok(())
    }

    fn metadata(&self) -> StoreMetadata {
        StoreMetadata {
            backend: "memory".to_string(),
            transactional: true,
        }
    }
}
