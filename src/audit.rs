//! Tamper-evident audit log for audited flows.
//!
//! Each entry's hash covers its content and the previous entry's hash, so
//! rewriting any entry breaks every hash after it.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::eval::context::RecordChange;
use crate::eval::value::State;

const GENESIS_HASH: &str = "genesis";

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    digest(&SHA256, bytes)
        .as_ref()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Top-level state keys touched by a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDiff {
    pub changed: Vec<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl StateDiff {
    pub fn between(before: &State, after: &State) -> Self {
        let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        let mut diff = StateDiff::default();
        for key in keys {
            match (before.get(key), after.get(key)) {
                (Some(old), Some(new)) if old != new => diff.changed.push(key.clone()),
                (None, Some(_)) => diff.added.push(key.clone()),
                (Some(_), None) => diff.removed.push(key.clone()),
                _ => {}
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: String,
    pub flow_name: String,
    pub actor: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub diff: StateDiff,
    pub record_changes: Vec<RecordChange>,
    pub previous_hash: String,
    pub hash: String,
}

impl AuditEntry {
    fn compute_hash(&self) -> String {
        let body = serde_json::json!({
            "entry_id": self.entry_id,
            "flow_name": self.flow_name,
            "actor": self.actor,
            "timestamp": self.timestamp.to_rfc3339(),
            "diff": self.diff,
            "record_changes": self.record_changes,
            "previous_hash": self.previous_hash,
        });
        sha256_hex(body.to_string().as_bytes())
    }
}

#[derive(Debug, Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    #[tracing::instrument(skip(self, actor, diff, record_changes), level = "debug")]
    pub async fn append(
        &self,
        flow_name: &str,
        actor: serde_json::Value,
        diff: StateDiff,
        record_changes: Vec<RecordChange>,
    ) -> AuditEntry {
        let mut entries = self.entries.write().await;
        let previous_hash = entries
            .last()
            .map(|entry| entry.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let mut entry = AuditEntry {
            entry_id: format!("audit-{}", Uuid::new_v4().simple()),
            flow_name: flow_name.to_string(),
            actor,
            timestamp: Utc::now(),
            diff,
            record_changes,
            previous_hash,
            hash: String::new(),
        };
        entry.hash = entry.compute_hash();
        debug!(entry_id = %entry.entry_id, "audit entry appended");
        entries.push(entry.clone());
        entry
    }

    /// True when every entry's hash and chain link still match.
    pub async fn verify(&self) -> bool {
        let entries = self.entries.read().await;
        let mut previous = GENESIS_HASH.to_string();
        for entry in entries.iter() {
            if entry.previous_hash != previous || entry.compute_hash() != entry.hash {
                return false;
            }
            previous = entry.hash.clone();
        }
        true
    }

    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }
}
