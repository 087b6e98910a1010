//! On-disk schema upgrades.
//!
//! Runs exactly once, inside [`crate::EventStore::open`], before any
//! other operation touches the store. The only supported migration
//! rewrites 1.0.0-era index keys (`tag topic value id`) into the current
//! layout (`tag topic value` with a serialized payload). Batches commit
//! independently; because each batch deletes the legacy keys it
//! rewrote, a crashed migration resumes from a fresh scan without
//! duplicating work.

use rocksdb::{Direction, IteratorMode, WriteBatch};
use tracing::{info, warn};

use crate::{
    config::StoreOptions,
    error::{QueueError, Result},
    index::IndexPayload,
    keys,
    store::{Db, EventRecord, storage_err},
};

pub(crate) const CURRENT_VERSION: &str = "1.1.0";
pub(crate) const OLDEST_VERSION: &str = "1.0.0";

const BATCH_SIZE: usize = 500;

/// Brings the store's on-disk layout to [`CURRENT_VERSION`].
pub(crate) fn run(db: &Db, options: &StoreOptions) -> Result<()> {
    let version = read_version(db, options.repair_corrupt)?;
    match version.as_str() {
        CURRENT_VERSION => return Ok(()),
        OLDEST_VERSION => {
            info!(
                from = OLDEST_VERSION,
                to = CURRENT_VERSION,
                "upgrading event store schema"
            );
            let mut migration = UpgradeV1_0_0::default();
            while migration.next_batch(db, BATCH_SIZE, options.repair_corrupt)? {
                info!(
                    updated = migration.updated,
                    failed = migration.failed,
                    "index migration progress"
                );
            }
            info!(
                updated = migration.updated,
                failed = migration.failed,
                "index migration complete"
            );
        }
        other => return Err(QueueError::UnsupportedVersion(other.to_string())),
    }

    let mut batch = WriteBatch::default();
    batch.put(keys::DB_VERSION_KEY, CURRENT_VERSION);
    db.write(batch).map_err(storage_err)
}

/// Reads the persisted schema version; absence means the oldest
/// supported layout.
pub(crate) fn read_version(db: &Db, repair_corrupt: bool) -> Result<String> {
    match db.get(keys::DB_VERSION_KEY).map_err(storage_err)? {
        None => Ok(OLDEST_VERSION.to_string()),
        Some(bytes) => match String::from_utf8(bytes) {
            Ok(version) => Ok(version),
            Err(_) if repair_corrupt => {
                warn!("version marker is not valid UTF-8; treating store as {OLDEST_VERSION}");
                Ok(OLDEST_VERSION.to_string())
            }
            Err(_) => Err(QueueError::Corruption(
                "version marker is not valid UTF-8".into(),
            )),
        },
    }
}

/// Cursor-driven rewrite of 1.0.0 index entries.
#[derive(Default)]
pub(crate) struct UpgradeV1_0_0 {
    pub(crate) updated: u64,
    pub(crate) failed: u64,
    cursor: Vec<u8>,
}

impl UpgradeV1_0_0 {
    /// Migrates up to `batch_size` legacy entries in one committed
    /// batch. Returns `true` while more entries remain.
    ///
    /// A legacy entry that cannot be decoded, or whose event no longer
    /// exists, is logged and counted as failed; with `repair_corrupt`
    /// an undecodable key is deleted instead of left behind.
    pub(crate) fn next_batch(
        &mut self,
        db: &Db,
        batch_size: usize,
        repair_corrupt: bool,
    ) -> Result<bool> {
        let prefix = keys::legacy_index_prefix();
        let seek = if self.cursor.is_empty() {
            prefix.clone()
        } else {
            let mut seek = self.cursor.clone();
            seek.push(0);
            seek
        };

        let iter = db.iterator(IteratorMode::From(seek.as_slice(), Direction::Forward));
        let mut batch = WriteBatch::default();
        let mut seen = 0usize;
        let mut more = false;

        for item in iter {
            let (key, _) = item.map_err(storage_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            seen += 1;
            if seen > batch_size {
                more = true;
                break;
            }
            self.cursor = key.to_vec();

            let legacy = match keys::decode_legacy_index_key(&key) {
                Ok(legacy) => legacy,
                Err(err) => {
                    warn!(error = %err, "skipping malformed legacy index key");
                    self.failed += 1;
                    if repair_corrupt {
                        batch.delete(&key);
                    }
                    continue;
                }
            };

            match rewrite_entry(db, &mut batch, &legacy) {
                Ok(()) => {
                    batch.delete(&key);
                    self.updated += 1;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        topic = %legacy.topic,
                        value = %legacy.value,
                        "failed to migrate legacy index entry"
                    );
                    self.failed += 1;
                }
            }
        }

        db.write(batch).map_err(storage_err)?;
        Ok(more)
    }
}

fn rewrite_entry(db: &Db, batch: &mut WriteBatch, legacy: &keys::LegacyIndexKey) -> Result<()> {
    let event_key = keys::event_key(&legacy.topic, &legacy.id, Vec::new())?;
    let bytes = db
        .get(&event_key)
        .map_err(storage_err)?
        .ok_or(QueueError::EventNotFound)?;
    let record: EventRecord = serde_json::from_slice(&bytes)
        .map_err(|err| QueueError::Corruption(format!("event record: {err}")))?;

    let new_key = keys::index_key(&legacy.topic, &legacy.value, Vec::new())?;
    let payload = IndexPayload {
        event_id: legacy.id.clone(),
        create_time: record.create_time,
    };
    batch.put(new_key, serde_json::to_vec(&payload)?);
    Ok(())
}
