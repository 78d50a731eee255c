use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Persisted application state: the root of the value tree.
pub type State = BTreeMap<String, Value>;

/// A single record row as handed to the [`crate::store::Store`].
pub type Record = BTreeMap<String, Value>;

/// Dynamic value produced by expressions and stored in state.
///
/// Serialized untagged so a `Value` reads and writes as plain JSON.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Number(f64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Reason a path walk stopped before reaching its leaf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathFault {
    /// The segment at `at` exists but is not a map.
    NotAMapping { at: String },
    /// The key at `at` is absent.
    Missing { at: String },
}

impl fmt::Display for PathFault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathFault::NotAMapping { at } => write!(f, "'{}' is not a mapping", at),
            PathFault::Missing { at } => write!(f, "'{}' is missing", at),
        }
    }
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::Text(_) => "text",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Non-negative whole number, as required by loop counts and clock steps.
    pub fn as_count(&self) -> Option<u64> {
        match self {
            Value::Number(n) if *n >= 0.0 && n.fract() == 0.0 && *n <= u64::MAX as f64 => {
                Some(*n as u64)
            }
            _ => None,
        }
    }

    pub fn map<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Walk `path` through nested maps.
    pub fn walk<'a>(&'a self, path: &[String]) -> Result<&'a Value, PathFault> {
        let mut current = self;
        for (depth, segment) in path.iter().enumerate() {
            let at = || path[..=depth].join(".");
            match current {
                Value::Map(map) => {
                    current = map.get(segment).ok_or_else(|| PathFault::Missing { at: at() })?;
                }
                _ => {
                    return Err(PathFault::NotAMapping {
                        at: path[..depth].join("."),
                    });
                }
            }
        }
        Ok(current)
    }
}

/// Walk `path` from a state root.
pub fn walk_state<'a>(state: &'a State, path: &[String]) -> Result<&'a Value, PathFault> {
    let (first, rest) = path.split_first().ok_or_else(|| PathFault::Missing {
        at: String::new(),
    })?;
    let root = state.get(first).ok_or_else(|| PathFault::Missing { at: first.clone() })?;
    match root.walk(rest) {
        Ok(value) => Ok(value),
        Err(PathFault::NotAMapping { at }) => Err(PathFault::NotAMapping {
            at: join_prefix(first, &at),
        }),
        Err(PathFault::Missing { at }) => Err(PathFault::Missing {
            at: join_prefix(first, &at),
        }),
    }
}

/// Assign `value` at `path`, creating intermediate maps on the way.
///
/// Fails when an intermediate segment already holds a non-map value.
pub fn assign_state(state: &mut State, path: &[String], value: Value) -> Result<(), PathFault> {
    let Some((leaf, parents)) = path.split_last() else {
        return Err(PathFault::Missing { at: String::new() });
    };
    let mut current = state;
    for (depth, segment) in parents.iter().enumerate() {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Map(BTreeMap::new()));
        match slot {
            Value::Map(map) => current = map,
            _ => {
                return Err(PathFault::NotAMapping {
                    at: path[..=depth].join("."),
                });
            }
        }
    }
    current.insert(leaf.clone(), value);
    Ok(())
}

fn join_prefix(first: &str, rest: &str) -> String {
    if rest.is_empty() {
        first.to_string()
    } else {
        format!("{}.{}", first, rest)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "{}", s),
            Value::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            other => match serde_json::to_string(other) {
                Ok(json) => write!(f, "{}", json),
                Err(_) => write!(f, "{:?}", other),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Boolean(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or_default()),
            serde_json::Value::String(s) => Value::Text(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&Value> for serde_json::Value {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Boolean(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(serde_json::Value::from).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}
