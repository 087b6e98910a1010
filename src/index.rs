//! Secondary index subsystem.
//!
//! Maps a caller-chosen value string, scoped to a topic, onto an event
//! id. One live mapping exists per `(topic, value)` pair; later writes
//! replace earlier ones. Index entries live under their own keys and are
//! never touched when the event they point at is rewritten or migrated.

use chrono::{DateTime, Utc};
use rocksdb::WriteBatch;
use serde::{Deserialize, Serialize};

use crate::{
    error::{QueueError, Result},
    keys,
    store::Db,
};

/// Value stored under a current-schema index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexPayload {
    pub event_id: String,
    pub create_time: DateTime<Utc>,
}

/// Stages an index entry into `batch`, replacing any existing mapping
/// for `(topic, value)`.
pub(crate) fn stage(
    batch: &mut WriteBatch,
    topic: &str,
    value: &str,
    payload: &IndexPayload,
) -> Result<()> {
    let key = keys::index_key(topic, value, Vec::new())?;
    batch.put(key, serde_json::to_vec(payload)?);
    Ok(())
}

/// Reads the mapping for `(topic, value)`.
pub(crate) fn read(db: &Db, topic: &str, value: &str) -> Result<IndexPayload> {
    let key = keys::index_key(topic, value, Vec::new())?;
    let bytes = db
        .get(&key)
        .map_err(|err| QueueError::Storage(err.to_string()))?
        .ok_or(QueueError::IndexNotFound)?;
    serde_json::from_slice(&bytes).map_err(|err| {
        QueueError::Corruption(format!("index payload for {topic:?}/{value:?}: {err}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_payload_round_trip() {
        let payload = IndexPayload {
            event_id: "order-1".into(),
            create_time: Utc::now(),
        };
        let bytes = serde_json::to_vec(&payload).unwrap();
        let decoded: IndexPayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, payload);
    }
}
