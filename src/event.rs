use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// The delivery state of an event on a specific channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventState {
    /// Decode-only default for missing or malformed data; never written.
    #[default]
    Unspecified,
    /// The event is queued on the channel.
    Queued,
    /// The event was processed successfully and is no longer queued.
    DequeuedOk,
    /// The event failed processing and is no longer queued.
    DequeuedError,
}

/// The outcome a consumer reports when acknowledging an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// Processed successfully; settle as [`EventState::DequeuedOk`].
    DequeueOk,
    /// Processing failed terminally; settle as [`EventState::DequeuedError`].
    DequeueError,
    /// Return the event to the queue for another delivery attempt.
    Requeue,
}

/// An immutable publication on a topic, identified by `(topic, id)`.
///
/// `state` and `requeue_count` are output fields describing the event as
/// seen from the channel it was read on; they are ignored on publish.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Topic the event belongs to. Required; must not contain the null byte.
    pub topic: String,
    /// Caller-supplied identifier. Publishing the same `(topic, id)` twice
    /// refers to the same logical event. Required; must not contain the
    /// null byte.
    pub id: String,
    /// Opaque event data.
    pub payload: Vec<u8>,
    /// Secondary index values for this event, scoped to the topic.
    pub indexes: Vec<String>,
    /// Assigned on first write and preserved on republish.
    pub create_time: DateTime<Utc>,
    /// State stamped onto channels already known for the topic at publish
    /// time. Channels first seen later always start at
    /// [`EventState::Queued`].
    pub default_state: EventState,
    /// Output only: the state on the channel the event was read on.
    pub state: EventState,
    /// Output only: delivery attempts recorded on that channel.
    pub requeue_count: u32,
}

impl Event {
    pub fn new(topic: impl Into<String>, id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            id: id.into(),
            payload,
            indexes: Vec::new(),
            create_time: Utc::now(),
            default_state: EventState::Queued,
            state: EventState::Unspecified,
            requeue_count: 0,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        require_field(&self.topic, "topic")?;
        require_field(&self.id, "id")?;
        for value in &self.indexes {
            require_field(value, "index value")?;
        }
        Ok(())
    }
}

pub(crate) fn require_field(value: &str, name: &str) -> Result<()> {
    if value.is_empty() {
        return Err(QueueError::Validation(format!("{name} is required")));
    }
    if value.bytes().any(|b| b == 0) {
        return Err(QueueError::Validation(format!(
            "{name} cannot contain the null byte"
        )));
    }
    Ok(())
}
