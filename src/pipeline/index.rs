//! Chunk index kept in run state.
//!
//! Chunks live under `state.index.chunks` and ingestion reports under
//! `state.ingestion.<upload_id>`, so an index written by a failed run is
//! rolled back with the rest of its state and never seen by another run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::eval::value::{State, Value};

pub const INDEX_STATE_KEY: &str = "index";
pub const INGESTION_STATE_KEY: &str = "ingestion";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum IndexError {
    #[error("Document index in state is malformed: {0}")]
    Malformed(String),
}

pub type IndexResult<T> = Result<T, IndexError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub upload_id: String,
    pub index: usize,
    pub text: String,
    pub checksum: String,
}

impl DocumentChunk {
    pub fn chunk_id(&self) -> String {
        format!("{}:{}", self.upload_id, self.index)
    }

    fn to_value(&self) -> Value {
        Value::map([
            ("upload_id", Value::from(self.upload_id.as_str())),
            ("chunk_index", Value::from(self.index)),
            ("text", Value::from(self.text.as_str())),
            ("checksum", Value::from(self.checksum.as_str())),
        ])
    }

    fn from_value(value: &Value) -> IndexResult<Self> {
        let map = value
            .as_map()
            .ok_or_else(|| IndexError::Malformed(format!("chunk is a {}", value.type_name())))?;
        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_text)
                .map(str::to_string)
                .ok_or_else(|| IndexError::Malformed(format!("chunk field '{}' is not text", key)))
        };
        let index = map
            .get("chunk_index")
            .and_then(Value::as_count)
            .ok_or_else(|| IndexError::Malformed("chunk_index is not a count".to_string()))?;
        Ok(Self {
            upload_id: text("upload_id")?,
            index: index as usize,
            text: text("text")?,
            checksum: text("checksum")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: DocumentChunk,
    pub score: usize,
}

impl ScoredChunk {
    pub fn to_value(&self) -> Value {
        Value::map([
            ("chunk_id", Value::from(self.chunk.chunk_id())),
            ("upload_id", Value::from(self.chunk.upload_id.as_str())),
            ("chunk_index", Value::from(self.chunk.index)),
            ("text", Value::from(self.chunk.text.as_str())),
            ("score", Value::from(self.score)),
        ])
    }
}

/// Working copy of the chunk index, read from and written back to state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentIndex {
    chunks: Vec<DocumentChunk>,
}

impl DocumentIndex {
    pub fn from_state(state: &State) -> IndexResult<Self> {
        let Some(index) = state.get(INDEX_STATE_KEY) else {
            return Ok(Self::default());
        };
        let chunks = match index.as_map().and_then(|m| m.get("chunks")) {
            None => return Ok(Self::default()),
            Some(Value::List(items)) => items
                .iter()
                .map(DocumentChunk::from_value)
                .collect::<IndexResult<Vec<_>>>()?,
            Some(other) => {
                return Err(IndexError::Malformed(format!(
                    "index.chunks is a {}",
                    other.type_name()
                )));
            }
        };
        Ok(Self { chunks })
    }

    /// Replace every chunk of `upload_id`, keeping other uploads in place.
    pub fn put(&mut self, upload_id: &str, chunks: Vec<DocumentChunk>) {
        self.chunks.retain(|chunk| chunk.upload_id != upload_id);
        self.chunks.extend(chunks);
    }

    /// Write the chunks to `state.index` and the report to `state.ingestion`.
    pub fn write_to(&self, state: &mut State, upload_id: &str, report: Value) {
        let mut index = match state.remove(INDEX_STATE_KEY) {
            Some(Value::Map(map)) => map,
            _ => BTreeMap::new(),
        };
        index.insert(
            "chunks".to_string(),
            Value::List(self.chunks.iter().map(DocumentChunk::to_value).collect()),
        );
        state.insert(INDEX_STATE_KEY.to_string(), Value::Map(index));

        let mut ingestion = match state.remove(INGESTION_STATE_KEY) {
            Some(Value::Map(map)) => map,
            _ => BTreeMap::new(),
        };
        ingestion.insert(upload_id.to_string(), report);
        state.insert(INGESTION_STATE_KEY.to_string(), Value::Map(ingestion));
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Best matches first; ties keep upload then chunk order.
    pub fn search(&self, query: &str, limit: usize) -> Vec<ScoredChunk> {
        let wanted = terms(query);
        let mut scored: Vec<ScoredChunk> = self
            .chunks
            .iter()
            .filter_map(|chunk| {
                let words = terms(&chunk.text);
                let score = wanted.iter().filter(|t| words.contains(t)).count();
                (score > 0).then(|| ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.chunk.upload_id.cmp(&b.chunk.upload_id))
                .then_with(|| a.chunk.index.cmp(&b.chunk.index))
        });
        scored.truncate(limit);
        scored
    }
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}
