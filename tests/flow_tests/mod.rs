mod agent_test;
mod guard_test;
mod interpreter_test;
mod pipeline_test;
mod run_artifacts_test;
mod transaction_test;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use flowrun::ast::{RecordSchema, Statement, StatementKind};
use flowrun::store::{InMemoryStore, Scope, Store, StoreError, StoreMetadata, StoreResult};
use flowrun::trace::TraceEvent;
use flowrun::{Record, State};

pub fn stmt(kind: StatementKind) -> Statement {
    Statement::new(kind)
}

pub fn count_traces(traces: &[TraceEvent], type_name: &str) -> usize {
    traces.iter().filter(|t| t.type_name() == type_name).count()
}

/// Store that delegates to [`InMemoryStore`] but can be told to fail
/// `begin`, the n-th record save, `save_state`, the commit or the rollback.
#[derive(Clone, Default)]
pub struct FailingStore {
    pub inner: InMemoryStore,
    fail_begin: bool,
    fail_save_at: Option<usize>,
    fail_save_state: bool,
    fail_commit: bool,
    fail_rollback: bool,
    saves: Arc<AtomicUsize>,
}

impl FailingStore {
    pub fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn fail_begin(mut self) -> Self {
        self.fail_begin = true;
        self
    }

    pub fn fail_save_state(mut self) -> Self {
        self.fail_save_state = true;
        self
    }

    pub fn fail_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn fail_save_at(mut self, nth: usize) -> Self {
        self.fail_save_at = Some(nth);
        self
    }

    pub fn fail_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn begin(&self) -> StoreResult<()> {
        if self.fail_begin {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.begin().await
    }

    async fn commit(&self) -> StoreResult<()> {
        if self.fail_commit {
            return Err(StoreError::Unavailable("commit refused".to_string()));
        }
        self.inner.commit().await
    }

    async fn rollback(&self) -> StoreResult<()> {
        if self.fail_rollback {
            return Err(StoreError::Backend("rollback refused".to_string()));
        }
        self.inner.rollback().await
    }

    async fn load_state(&self) -> StoreResult<Option<State>> {
        self.inner.load_state().await
    }

    async fn save_state(&self, state: &State) -> StoreResult<()> {
        if self.fail_save_state {
            return Err(StoreError::Backend("state write failed".to_string()));
        }
        self.inner.save_state(state).await
    }

    async fn save(&self, schema: &RecordSchema, record: Record, scope: &Scope) -> StoreResult<Record> {
        let nth = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_save_at == Some(nth) {
            return Err(StoreError::Backend(format!("write {} failed", nth)));
        }
        self.inner.save(schema, record, scope).await
    }

    async fn find(&self, schema: &RecordSchema, scope: &Scope) -> StoreResult<Vec<Record>> {
        self.inner.find(schema, scope).await
    }

    async fn update(
        &self,
        schema: &RecordSchema,
        id: &flowrun::Value,
        changes: &Record,
        scope: &Scope,
    ) -> StoreResult<Record> {
        self.inner.update(schema, id, changes, scope).await
    }

    async fn delete(&self, schema: &RecordSchema, id: &flowrun::Value, scope: &Scope) -> StoreResult<()> {
        self.inner.delete(schema, id, scope).await
    }

    fn metadata(&self) -> StoreMetadata {
        self.inner.metadata()
    }
}
