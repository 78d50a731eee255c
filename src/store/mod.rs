//! Record and state persistence seam.
//!
//! The engine talks to persistence only through the [`Store`] trait. One
//! flow run owns at most one open transaction: the coordinator in
//! [`crate::runtime`] calls `begin` before the body runs and exactly one of
//! `commit` or `rollback` afterwards. Record operations issued by the
//! statement interpreter happen inside that transaction.
//!
//! # Scoping
//!
//! Records of a tenant-scoped schema carry the tenant derived from the run
//! identity ([`Scope`]); `find` only ever returns rows of the caller's scope.

pub mod in_memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ast::RecordSchema;
use crate::eval::value::{Record, State, Value};

pub use in_memory::InMemoryStore;

/// Field every stored record carries once saved.
pub const RECORD_ID_FIELD: &str = "id";

/// Tenant scope a record operation runs under.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub tenant: Option<String>,
}

impl Scope {
    pub fn global() -> Self {
        Self::default()
    }

    /// Derive the scope for `schema` from the run identity.
    pub fn for_schema(schema: &RecordSchema, identity: &Value) -> Self {
        let tenant = schema.tenant_key.as_ref().and_then(|key| {
            identity
                .as_map()
                .and_then(|map| map.get(key))
                .map(|value| value.to_string())
        });
        Self { tenant }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetadata {
    pub backend: String,
    pub transactional: bool,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("A transaction is already open")]
    TransactionActive,

    #[error("No transaction is open")]
    NoTransaction,

    #[error("Record '{record}' with id {id} not found")]
    NotFound { record: String, id: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence backend for records and the serialized state tree.
///
/// Implementations must be safe to share between concurrent runs; each run
/// issues its own `begin`/`commit`/`rollback` sequence.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> StoreResult<()>;

    async fn commit(&self) -> StoreResult<()>;

    async fn rollback(&self) -> StoreResult<()>;

    /// Load the persisted state, `None` when nothing was ever saved.
    async fn load_state(&self) -> StoreResult<Option<State>>;

    async fn save_state(&self, state: &State) -> StoreResult<()>;

    /// Insert a record, assigning its id. Returns the stored record.
    async fn save(&self, schema: &RecordSchema, record: Record, scope: &Scope)
    -> StoreResult<Record>;

    /// All records of `schema` visible in `scope`, in insertion order.
    async fn find(&self, schema: &RecordSchema, scope: &Scope) -> StoreResult<Vec<Record>>;

    /// Merge `changes` into the record with the given id.
    async fn update(
        &self,
        schema: &RecordSchema,
        id: &Value,
        changes: &Record,
        scope: &Scope,
    ) -> StoreResult<Record>;

    async fn delete(&self, schema: &RecordSchema, id: &Value, scope: &Scope) -> StoreResult<()>;

    fn metadata(&self) -> StoreMetadata;
}
