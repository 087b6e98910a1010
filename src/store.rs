//! Event store and facade over the embedded key-value engine.
//!
//! All mutating operations are read-modify-write spans serialized by an
//! internal write lock and committed through a single atomic
//! [`WriteBatch`], so a failed operation is never partially visible.
//! The schema upgrade engine runs inside [`EventStore::open`], before
//! the handle exists, which gives it exclusive access to the data
//! directory.

use std::{collections::BTreeSet, path::PathBuf, time::Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use parking_lot::Mutex;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options, WriteBatch};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    config::StoreOptions,
    error::{QueueError, Result},
    event::{AckOutcome, Event, EventState},
    index::{self, IndexPayload},
    keys, upgrade,
};

pub(crate) type Db = DBWithThreadMode<MultiThreaded>;

/// Value stored under an event key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EventRecord {
    pub payload: Vec<u8>,
    pub create_time: DateTime<Utc>,
    #[serde(default)]
    pub indexes: Vec<String>,
    #[serde(default)]
    pub default_state: EventState,
}

/// Value stored under a channel key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct ChannelRecord {
    pub state: EventState,
    pub requeue_count: u32,
}

/// Query for the set of channel names known for a topic.
///
/// A channel is known once any event on the topic has recorded state for
/// it. Fan-out at publish time only talks to this interface, so the
/// backing strategy can change without touching the publish path.
pub trait ChannelDirectory {
    fn channels(&self, topic: &str) -> Result<BTreeSet<String>>;
}

/// [`ChannelDirectory`] backed by a bounded prefix scan over the
/// topic's channel keys.
pub(crate) struct ChannelScan<'a> {
    db: &'a Db,
}

impl ChannelDirectory for ChannelScan<'_> {
    fn channels(&self, topic: &str) -> Result<BTreeSet<String>> {
        let prefix = keys::channel_topic_prefix(topic);
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));

        let mut names = BTreeSet::new();
        for item in iter {
            let (key, _) = item.map_err(storage_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            names.insert(keys::decode_channel_key(&key)?.channel);
        }
        Ok(names)
    }
}

pub struct EventStore {
    db: Db,
    write_lock: Mutex<()>,
    options: StoreOptions,
}

impl EventStore {
    /// Opens (creating if necessary) the store at `path` and brings its
    /// on-disk schema to the current version before returning.
    pub fn open(path: impl Into<PathBuf>, options: StoreOptions) -> Result<Self> {
        let path = path.into();
        let mut db_options = Options::default();
        db_options.create_if_missing(true);
        let db = Db::open(&db_options, &path).map_err(storage_err)?;

        upgrade::run(&db, &options)?;
        info!(path = %path.display(), "event store open");

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
            options,
        })
    }

    /// Releases the underlying engine. Consumes the handle, so a second
    /// close cannot be expressed; dropping the store has the same effect.
    pub fn close(self) {}

    /// Writes an event, its time-index entry, its index entries, and the
    /// per-channel fan-out records in one atomic batch.
    ///
    /// The first write of a `(topic, id)` pair fixes its `create_time`;
    /// republishing overwrites the payload but keeps the original
    /// timestamp and never resets channel state that was recorded in the
    /// meantime. Channels already known for the topic are stamped with
    /// the event's `default_state`; channels first seen later resolve to
    /// [`EventState::Queued`] instead.
    pub fn publish(&self, mut event: Event) -> Result<Event> {
        timed("publish", || {
            self.publish_inner(&mut event)?;
            event.state = EventState::Unspecified;
            event.requeue_count = 0;
            Ok(event)
        })
    }

    fn publish_inner(&self, event: &mut Event) -> Result<()> {
        event.validate()?;
        let _guard = self.write_lock.lock();

        let event_key = keys::event_key(&event.topic, &event.id, Vec::new())?;
        if let Some(existing) = self.read_event_record(&event_key)? {
            event.create_time = existing.create_time;
        }

        let record = EventRecord {
            payload: event.payload.clone(),
            create_time: event.create_time,
            indexes: event.indexes.clone(),
            default_state: event.default_state,
        };

        let mut batch = WriteBatch::default();
        batch.put(&event_key, serde_json::to_vec(&record)?);
        batch.put(
            keys::time_key(event.create_time, &event.id, Vec::new())?,
            b"",
        );

        for value in &event.indexes {
            let payload = IndexPayload {
                event_id: event.id.clone(),
                create_time: event.create_time,
            };
            index::stage(&mut batch, &event.topic, value, &payload)?;
        }

        let fanned_state = match event.default_state {
            EventState::Unspecified => EventState::Queued,
            other => other,
        };
        let directory = ChannelScan { db: &self.db };
        let mut key_buf = Vec::new();
        for channel in directory.channels(&event.topic)? {
            key_buf = keys::channel_key(&event.topic, &channel, &event.id, key_buf)?;
            if self.db.get(&key_buf).map_err(storage_err)?.is_some() {
                // Explicit state already recorded for this id; a
                // republish must not reset it.
                continue;
            }
            let fanned = ChannelRecord {
                state: fanned_state,
                requeue_count: 0,
            };
            batch.put(&key_buf, serde_json::to_vec(&fanned)?);
        }

        self.write_batch(batch)
    }

    /// Reads an event as seen from `channel`, resolving the channel's
    /// effective state.
    pub fn get(&self, topic: &str, id: &str, channel: &str) -> Result<Event> {
        timed("get", || {
            let event_key = keys::event_key(topic, id, Vec::new())?;
            let record = self
                .read_event_record(&event_key)?
                .ok_or(QueueError::EventNotFound)?;
            let channel_state = self.resolve_channel(topic, id, channel)?;

            Ok(Event {
                topic: topic.to_string(),
                id: id.to_string(),
                payload: record.payload,
                indexes: record.indexes,
                create_time: record.create_time,
                default_state: record.default_state,
                state: channel_state.state,
                requeue_count: channel_state.requeue_count,
            })
        })
    }

    /// Resolves the effective state of an event on a channel.
    ///
    /// Fails with [`QueueError::EventNotFound`] if the event itself was
    /// never written. A channel with no explicit record resolves to
    /// `(Queued, 0)` no matter what the event's `default_state` was.
    pub fn get_state(&self, topic: &str, id: &str, channel: &str) -> Result<(EventState, u32)> {
        timed("get_state", || {
            let event_key = keys::event_key(topic, id, Vec::new())?;
            if self.read_event_record(&event_key)?.is_none() {
                return Err(QueueError::EventNotFound);
            }
            let record = self.resolve_channel(topic, id, channel)?;
            Ok((record.state, record.requeue_count))
        })
    }

    /// Settles a delivery attempt on a channel.
    pub fn ack(&self, topic: &str, id: &str, channel: &str, outcome: AckOutcome) -> Result<()> {
        let state = match outcome {
            AckOutcome::DequeueOk => EventState::DequeuedOk,
            AckOutcome::DequeueError => EventState::DequeuedError,
            AckOutcome::Requeue => EventState::Queued,
        };
        self.set_state(topic, id, channel, state)
    }

    /// Writes an explicit channel-state record. A transition to
    /// [`EventState::Queued`] counts as a requeue attempt and is
    /// rejected with [`QueueError::RequeueLimitExceeded`] once the
    /// configured limit would be passed.
    pub fn set_state(&self, topic: &str, id: &str, channel: &str, state: EventState) -> Result<()> {
        timed("set_state", || {
            if state == EventState::Unspecified {
                return Err(QueueError::Validation(
                    "cannot write the unspecified event state".into(),
                ));
            }
            let _guard = self.write_lock.lock();

            let event_key = keys::event_key(topic, id, Vec::new())?;
            if self.read_event_record(&event_key)?.is_none() {
                return Err(QueueError::EventNotFound);
            }

            let channel_key = keys::channel_key(topic, channel, id, Vec::new())?;
            let current = self.read_channel_record(&channel_key)?.unwrap_or(ChannelRecord {
                state: EventState::Queued,
                requeue_count: 0,
            });

            let mut next = ChannelRecord {
                state,
                requeue_count: current.requeue_count,
            };
            if state == EventState::Queued {
                let attempts = current.requeue_count + 1;
                if attempts > self.options.requeue_limit {
                    return Err(QueueError::RequeueLimitExceeded(self.options.requeue_limit));
                }
                next.requeue_count = attempts;
            }

            let mut batch = WriteBatch::default();
            batch.put(&channel_key, serde_json::to_vec(&next)?);
            self.write_batch(batch)
        })
    }

    /// Looks up the event mapped to `(topic, value)` in the secondary
    /// index.
    pub fn lookup(&self, topic: &str, value: &str) -> Result<IndexPayload> {
        timed("lookup", || index::read(&self.db, topic, value))
    }

    /// Event ids in `create_time` order, oldest first, across all
    /// topics.
    pub fn event_ids_by_time(&self) -> Result<Vec<String>> {
        let prefix = keys::time_prefix();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_slice(), Direction::Forward));

        let mut ids = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(storage_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            ids.push(keys::decode_time_key(&key)?.id);
        }
        Ok(ids)
    }

    fn resolve_channel(&self, topic: &str, id: &str, channel: &str) -> Result<ChannelRecord> {
        let channel_key = keys::channel_key(topic, channel, id, Vec::new())?;
        Ok(self.read_channel_record(&channel_key)?.unwrap_or(ChannelRecord {
            state: EventState::Queued,
            requeue_count: 0,
        }))
    }

    fn read_event_record(&self, key: &[u8]) -> Result<Option<EventRecord>> {
        match self.db.get(key).map_err(storage_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|err| {
                QueueError::Corruption(format!("event record: {err}"))
            })?)),
            None => Ok(None),
        }
    }

    fn read_channel_record(&self, key: &[u8]) -> Result<Option<ChannelRecord>> {
        match self.db.get(key).map_err(storage_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|err| {
                QueueError::Corruption(format!("channel record: {err}"))
            })?)),
            None => Ok(None),
        }
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        let start = Instant::now();
        let result = self.db.write(batch).map_err(storage_err);
        let duration = start.elapsed().as_secs_f64();
        record_store_op(
            "rocksdb_write",
            if result.is_ok() { "ok" } else { "err" },
            duration,
        );
        result
    }
}

pub(crate) fn storage_err(err: rocksdb::Error) -> QueueError {
    QueueError::Storage(err.to_string())
}

fn timed<T>(operation: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let start = Instant::now();
    let result = f();
    let duration = start.elapsed().as_secs_f64();
    record_store_op(
        operation,
        if result.is_ok() { "ok" } else { "err" },
        duration,
    );
    result
}

fn record_store_op(operation: &'static str, status: &'static str, duration: f64) {
    let labels = [("operation", operation), ("status", status)];
    counter!("duraq_store_operations_total", &labels).increment(1);
    histogram!("duraq_store_operation_duration_seconds", &labels).record(duration);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir, options: StoreOptions) -> EventStore {
        EventStore::open(dir.path().join("queue"), options).unwrap()
    }

    #[test]
    fn publish_fans_out_to_known_channels_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());

        // Channels become known by recording state on prior events.
        store
            .publish(Event::new("topic", "event0", vec![1]))
            .unwrap();
        store
            .publish(Event::new("topic", "event00", vec![1]))
            .unwrap();
        store
            .ack("topic", "event0", "channel", AckOutcome::DequeueOk)
            .unwrap();
        store
            .ack("topic", "event00", "channel", AckOutcome::DequeueOk)
            .unwrap();
        store
            .ack("topic", "event00", "channel2", AckOutcome::DequeueOk)
            .unwrap();

        let mut expected = Event::new("topic", "event1", vec![1, 2, 3]);
        expected.default_state = EventState::DequeuedOk;
        // Output fields are ignored on publish.
        expected.state = EventState::DequeuedError;

        let mut expected = store.publish(expected).unwrap();

        expected.state = EventState::DequeuedOk;
        let actual = store.get("topic", "event1", "channel").unwrap();
        assert_eq!(actual, expected);
        let actual = store.get("topic", "event1", "channel2").unwrap();
        assert_eq!(actual, expected);

        expected.state = EventState::Queued;
        let actual = store.get("topic", "event1", "newchannel").unwrap();
        assert_eq!(actual, expected);
    }

    #[test]
    fn unknown_channel_starts_queued_regardless_of_default_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());

        let mut event = Event::new("topic", "event1", Vec::new());
        event.default_state = EventState::DequeuedError;
        store.publish(event).unwrap();

        let (state, requeues) = store.get_state("topic", "event1", "fresh").unwrap();
        assert_eq!(state, EventState::Queued);
        assert_eq!(requeues, 0);
    }

    #[test]
    fn republish_preserves_explicit_channel_state_and_create_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());

        let first = store
            .publish(Event::new("topic", "event1", vec![1]))
            .unwrap();
        store
            .ack("topic", "event1", "channel", AckOutcome::DequeueError)
            .unwrap();

        let mut republished = Event::new("topic", "event1", vec![9, 9]);
        republished.default_state = EventState::DequeuedOk;
        let second = store.publish(republished).unwrap();

        assert_eq!(second.create_time, first.create_time);
        let read = store.get("topic", "event1", "channel").unwrap();
        assert_eq!(read.payload, vec![9, 9]);
        assert_eq!(read.state, EventState::DequeuedError);
    }

    #[test]
    fn requeue_increments_until_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(
            &dir,
            StoreOptions {
                requeue_limit: 2,
                ..StoreOptions::default()
            },
        );
        store
            .publish(Event::new("topic", "event1", Vec::new()))
            .unwrap();

        store
            .ack("topic", "event1", "channel", AckOutcome::Requeue)
            .unwrap();
        store
            .ack("topic", "event1", "channel", AckOutcome::Requeue)
            .unwrap();
        let (state, requeues) = store.get_state("topic", "event1", "channel").unwrap();
        assert_eq!(state, EventState::Queued);
        assert_eq!(requeues, 2);

        let err = store
            .ack("topic", "event1", "channel", AckOutcome::Requeue)
            .unwrap_err();
        assert!(matches!(err, QueueError::RequeueLimitExceeded(2)));

        // The rejected transition must not have been applied.
        let (_, requeues) = store.get_state("topic", "event1", "channel").unwrap();
        assert_eq!(requeues, 2);
    }

    #[test]
    fn terminal_ack_does_not_count_as_a_requeue() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());
        store
            .publish(Event::new("topic", "event1", Vec::new()))
            .unwrap();

        store
            .ack("topic", "event1", "channel", AckOutcome::Requeue)
            .unwrap();
        store
            .ack("topic", "event1", "channel", AckOutcome::DequeueOk)
            .unwrap();

        let (state, requeues) = store.get_state("topic", "event1", "channel").unwrap();
        assert_eq!(state, EventState::DequeuedOk);
        assert_eq!(requeues, 1);
    }

    #[test]
    fn get_state_requires_the_event_to_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());

        let err = store.get_state("topic", "missing", "channel").unwrap_err();
        assert!(matches!(err, QueueError::EventNotFound));

        let err = store
            .ack("topic", "missing", "channel", AckOutcome::DequeueOk)
            .unwrap_err();
        assert!(matches!(err, QueueError::EventNotFound));
    }

    #[test]
    fn publish_rejects_invalid_fields_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());

        let err = store
            .publish(Event::new("top\0ic", "event1", Vec::new()))
            .unwrap_err();
        assert!(matches!(err, QueueError::Validation(_)));
        assert!(store.event_ids_by_time().unwrap().is_empty());
    }

    #[test]
    fn indexes_are_written_with_the_event_and_last_write_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());

        let mut event = Event::new("orders", "order-1", Vec::new());
        event.indexes.push("number:42".into());
        store.publish(event).unwrap();

        let found = store.lookup("orders", "number:42").unwrap();
        assert_eq!(found.event_id, "order-1");

        let mut event = Event::new("orders", "order-2", Vec::new());
        event.indexes.push("number:42".into());
        store.publish(event).unwrap();

        let found = store.lookup("orders", "number:42").unwrap();
        assert_eq!(found.event_id, "order-2");

        let err = store.lookup("orders", "number:43").unwrap_err();
        assert!(matches!(err, QueueError::IndexNotFound));
    }

    #[test]
    fn event_ids_by_time_orders_chronologically() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());

        let base = Utc::now();
        for (offset, id) in [(2, "late"), (0, "early"), (1, "middle")] {
            let mut event = Event::new("topic", id, Vec::new());
            event.create_time = base + chrono::Duration::seconds(offset);
            store.publish(event).unwrap();
        }

        assert_eq!(
            store.event_ids_by_time().unwrap(),
            vec!["early".to_string(), "middle".into(), "late".into()]
        );
    }

    #[test]
    fn channel_scan_deduplicates_names_across_events() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir, StoreOptions::default());

        for id in ["a", "b", "c"] {
            store.publish(Event::new("topic", id, Vec::new())).unwrap();
            store
                .ack("topic", id, "workers", AckOutcome::DequeueOk)
                .unwrap();
        }
        store
            .ack("topic", "a", "audit", AckOutcome::DequeueOk)
            .unwrap();

        let directory = ChannelScan { db: &store.db };
        let names = directory.channels("topic").unwrap();
        assert_eq!(
            names.into_iter().collect::<Vec<_>>(),
            vec!["audit".to_string(), "workers".into()]
        );
        assert!(directory.channels("other").unwrap().is_empty());
    }
}
