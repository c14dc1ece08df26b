//! Documents and update log entries

use docio_common::{DocId, Error, LogPosition, Result, SequenceNumber};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the unique key field
pub const ID_FIELD: &str = "id";

/// A stored document
///
/// Fields are kept in a `BTreeMap` so the serialized form is stable across
/// replicas, which the content digest relies on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    id: DocId,
    fields: BTreeMap<String, Value>,
}

impl Document {
    /// Create an empty document with the given id
    #[must_use]
    pub const fn new(id: DocId) -> Self {
        Self {
            id,
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_field(name, value);
        self
    }

    /// Parse a JSON object into a document
    ///
    /// The object must carry a non-empty `id` (string or integer). All other
    /// keys become fields.
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::malformed("document must be a JSON object"));
        };
        let id = match map.remove(ID_FIELD) {
            Some(Value::String(s)) => DocId::new(s)?,
            Some(Value::Number(n)) => DocId::new(n.to_string())?,
            Some(other) => {
                return Err(Error::malformed(format!(
                    "document id must be a string or number, got {other}"
                )));
            }
            None => return Err(Error::malformed("document is missing required field 'id'")),
        };
        Ok(Self {
            id,
            fields: map.into_iter().collect(),
        })
    }

    /// Render as a JSON object including the `id` field
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(ID_FIELD.to_string(), Value::String(self.id.to_string()));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map)
    }

    #[must_use]
    pub const fn id(&self) -> &DocId {
        &self.id
    }

    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    #[must_use]
    pub const fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Apply a partial update: fields of `update` overwrite ours, `null`
    /// removes the field.
    pub fn merge(&mut self, update: &Self) {
        for (k, v) in &update.fields {
            if v.is_null() {
                self.fields.remove(k);
            } else {
                self.fields.insert(k.clone(), v.clone());
            }
        }
    }

    /// Canonical bytes used for digests and snapshot records
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// A single mutation of a shard
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOp {
    /// Insert or overwrite a whole document
    Add(Document),
    /// Merge fields into an existing document (inserts if absent)
    Update(Document),
    /// Remove a document by id
    Delete(DocId),
}

impl UpdateOp {
    /// Id of the document the operation targets
    #[must_use]
    pub const fn doc_id(&self) -> &DocId {
        match self {
            Self::Add(doc) | Self::Update(doc) => doc.id(),
            Self::Delete(id) => id,
        }
    }

    /// Short name for logs
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Add(_) => "add",
            Self::Update(_) => "update",
            Self::Delete(_) => "delete",
        }
    }

    /// Reject operations that can never be applied
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Add(doc) | Self::Update(doc) => {
                if doc.fields().contains_key(ID_FIELD) {
                    return Err(Error::malformed("field 'id' is reserved for the document id"));
                }
                if doc.fields().keys().any(String::is_empty) {
                    return Err(Error::malformed("field names cannot be empty"));
                }
                Ok(())
            }
            Self::Delete(_) => Ok(()),
        }
    }
}

/// An entry of a shard leader's update log
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    /// Sequence number assigned by the leader
    pub seq: SequenceNumber,
    /// Leader epoch that issued the entry
    pub epoch: u64,
    pub op: UpdateOp,
    pub timestamp_ms: u64,
}

impl UpdateLogEntry {
    #[must_use]
    pub fn new(seq: SequenceNumber, epoch: u64, op: UpdateOp) -> Self {
        Self {
            seq,
            epoch,
            op,
            timestamp_ms: now_millis(),
        }
    }

    #[must_use]
    pub const fn position(&self) -> LogPosition {
        LogPosition::new(self.seq, self.epoch)
    }
}

/// Milliseconds since the Unix epoch
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_json() {
        let doc = Document::from_json(json!({"id": 7, "t1": "hello", "n": 3})).unwrap();
        assert_eq!(doc.id().as_str(), "7");
        assert_eq!(doc.get("t1"), Some(&json!("hello")));
        assert!(doc.get("id").is_none());
        assert_eq!(doc.to_json()["id"], json!("7"));
    }

    #[test]
    fn test_from_json_without_id() {
        let err = Document::from_json(json!({"t1": "no id"})).unwrap_err();
        assert!(matches!(err, Error::MalformedDocument(_)));
        assert!(Document::from_json(json!({"id": ""})).is_err());
        assert!(Document::from_json(json!({"id": [1]})).is_err());
        assert!(Document::from_json(json!("scalar")).is_err());
    }

    #[test]
    fn test_merge() {
        let mut doc = Document::new(DocId::from(1))
            .with_field("a", 1)
            .with_field("b", "keep");
        let update = Document::new(DocId::from(1))
            .with_field("a", 2)
            .with_field("b", Value::Null)
            .with_field("c", true);
        doc.merge(&update);
        assert_eq!(doc.get("a"), Some(&json!(2)));
        assert!(doc.get("b").is_none());
        assert_eq!(doc.get("c"), Some(&json!(true)));
    }

    #[test]
    fn test_bytes_stable() {
        let a = Document::new(DocId::from(1)).with_field("x", 1).with_field("y", 2);
        let b = Document::new(DocId::from(1)).with_field("y", 2).with_field("x", 1);
        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
        assert_eq!(Document::from_bytes(&a.to_bytes().unwrap()).unwrap(), a);
    }

    #[test]
    fn test_op_validate() {
        let ok = UpdateOp::Add(Document::new(DocId::from(1)).with_field("t", "x"));
        assert!(ok.validate().is_ok());
        assert_eq!(ok.kind(), "add");

        let reserved = UpdateOp::Update(Document::new(DocId::from(1)).with_field("id", "2"));
        assert!(matches!(reserved.validate(), Err(Error::MalformedDocument(_))));
        assert!(UpdateOp::Delete(DocId::from(1)).validate().is_ok());
    }
}
