//! Memo payload values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::id::{EntityId, MemoId, RecordId};

/// Key prefix marking a payload field as a reference.
pub const REF_KEY_PREFIX: char = '$';

/// A memo payload: field name to value.
pub type Payload = BTreeMap<String, Value>;

/// Build a payload from key/value pairs.
///
/// ```
/// use strata_store::value::{payload, Value};
///
/// let p = payload([("animal_sound", "moo")]);
/// assert_eq!(p["animal_sound"], Value::from("moo"));
/// ```
pub fn payload<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Payload
where
    K: Into<String>,
    V: Into<Value>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Check that references sit exactly under `$` keys.
///
/// The wire form drops the distinction between a reference and its id
/// string, so the key prefix is the only thing that can restore it.
pub fn validate_payload(payload: &Payload) -> Result<()> {
    for (key, value) in payload {
        if key.starts_with(REF_KEY_PREFIX) != value.is_ref() {
            return Err(Error::InvalidPayload { field: key.clone() });
        }
    }
    Ok(())
}

/// A single payload value: a JSON scalar or a reference to another entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Scalar(serde_json::Value),
    Ref(EntityId),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(v) => v.as_str(),
            Value::Ref(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Scalar(v) => v.as_i64(),
            Value::Ref(_) => None,
        }
    }

    pub fn as_entity(&self) -> Option<&EntityId> {
        match self {
            Value::Ref(id) => Some(id),
            Value::Scalar(_) => None,
        }
    }

    pub fn is_ref(&self) -> bool {
        matches!(self, Value::Ref(_))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(serde_json::Value::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(serde_json::Value::from(s))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Scalar(serde_json::Value::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Scalar(serde_json::Value::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(serde_json::Value::from(b))
    }
}

impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        Value::Ref(id)
    }
}

impl From<MemoId> for Value {
    fn from(id: MemoId) -> Self {
        Value::Ref(EntityId::Memo(id))
    }
}

impl From<RecordId> for Value {
    fn from(id: RecordId) -> Self {
        Value::Ref(EntityId::Record(id))
    }
}
