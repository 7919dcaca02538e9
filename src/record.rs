use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::UplinkError;

/// One entry in a collection: a store-assigned id plus caller-defined fields.
///
/// The store is schema-agnostic; callers decide what fields a path's records
/// carry. By convention (not enforced here) records include a numeric
/// `timestamp` field used for ordering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Fresh unique id for a locally created record.
    pub fn fresh_id() -> String {
        Uuid::new_v4().to_string()
    }

    fn timestamp(&self) -> f64 {
        self.fields
            .get("timestamp")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }
}

/// The id lives on the record itself, never in the field map; a stray `id`
/// key in the stored fields would otherwise collide with the flattened
/// serialization.
pub fn from_stored(id: &str, fields: &Map<String, Value>) -> Record {
    let mut fields = fields.clone();
    fields.remove("id");
    Record::new(id, fields)
}

/// Build the snapshot for a path from its id-keyed stored form, sorted the
/// way local mode presents collections: by the conventional `timestamp`
/// field, ties broken by id so the order is total.
pub fn snapshot_from_map<'a, I>(entries: I) -> Vec<Record>
where
    I: IntoIterator<Item = (&'a String, &'a Value)>,
{
    let mut records: Vec<Record> = entries
        .into_iter()
        .filter_map(|(id, value)| value.as_object().map(|fields| from_stored(id, fields)))
        .collect();
    records.sort_by(|a, b| {
        a.timestamp()
            .partial_cmp(&b.timestamp())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    records
}

/// Content fingerprint of a snapshot, used to suppress duplicate
/// notifications when the same state is observed through more than one
/// change channel (in-process hook and file watcher).
pub fn snapshot_fingerprint(records: &[Record]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for record in records {
        hasher.update(record.id.as_bytes());
        hasher.update([0u8]);
        // Map serialization preserves key order, which is stable for a
        // given stored representation.
        if let Ok(bytes) = serde_json::to_vec(&record.fields) {
            hasher.update(&bytes);
        }
        hasher.update([0xff]);
    }
    hasher.finalize().into()
}

/// Collection paths are opaque slash-segmented keys, but in local mode they
/// become file paths, so traversal segments are rejected outright.
pub fn validate_path(path: &str) -> crate::Result<()> {
    if path.is_empty() {
        return Err(UplinkError::InvalidPath("empty path".to_string()));
    }
    if path.contains('\\') || path.contains('\0') {
        return Err(UplinkError::InvalidPath(path.to_string()));
    }
    for segment in path.split('/') {
        if segment.is_empty() || segment.starts_with('.') {
            return Err(UplinkError::InvalidPath(path.to_string()));
        }
    }
    Ok(())
}
