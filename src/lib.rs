//! Durable event queue storage core.
//!
//! Producers publish immutable events to named topics; independent
//! channels each track their own delivery state per event, so multiple
//! consumer groups can work through the same stream and resume after a
//! crash. This crate is the storage engine beneath those semantics: the
//! tagged binary key layout over RocksDB, atomic event writes with
//! per-channel fan-out, a secondary index keyed by caller-chosen
//! values, and the on-disk schema upgrade engine that runs before a
//! store starts serving.

pub mod config;
pub mod error;
pub mod event;
pub mod index;
pub mod keys;
pub mod store;
mod upgrade;

pub use config::{Config, StoreOptions, DEFAULT_REQUEUE_LIMIT};
pub use error::{QueueError, Result};
pub use event::{AckOutcome, Event, EventState};
pub use index::IndexPayload;
pub use store::{ChannelDirectory, EventStore};
