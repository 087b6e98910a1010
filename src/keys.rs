//! Binary key codec for the queue's persisted layout.
//!
//! Every key starts with a one-byte type tag followed by the separator,
//! then the key's fields, each terminated by the separator. Fields are
//! rejected at encode time if they are empty or contain the separator
//! byte, so every encoding is unambiguous and reversible. The time-index
//! key embeds its timestamp as a fixed-width big-endian field, which both
//! preserves chronological ordering and keeps null bytes inside the
//! timestamp from being read as separators.

use chrono::{DateTime, Utc};

use crate::{
    error::{QueueError, Result},
    event::require_field,
};

/// Field separator. Key fields must never contain it.
pub const SEP: u8 = 0x00;

/// Type tag for event base records.
pub const EVENT_TAG: u8 = b'e';
/// Type tag for per-channel state records.
pub const CHANNEL_TAG: u8 = b'c';
/// Type tag for time-index entries.
pub const TIME_TAG: u8 = b't';
/// Type tag for secondary index entries in the current schema.
pub const INDEX_TAG: u8 = b'I';
/// Type tag for secondary index entries in the superseded 1.0.0 schema.
pub const INDEX_TAG_V1_0_0: u8 = b'i';

/// Reserved key holding the on-disk schema version string.
pub const DB_VERSION_KEY: &str = "___DURAQ_DB_VERSION___";

/// Decoded event key: `e 00 topic 00 id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventKey {
    pub topic: String,
    pub id: String,
}

/// Decoded channel key: `c 00 topic 00 channel 00 id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelKey {
    pub topic: String,
    pub channel: String,
    pub id: String,
}

/// Decoded time-index key: `t 00 nanos(8, big-endian) 00 id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeKey {
    pub create_time: DateTime<Utc>,
    pub id: String,
}

/// Decoded current-schema index key: `I 00 topic 00 value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKey {
    pub topic: String,
    pub value: String,
}

/// Decoded legacy index key: `i 00 topic 00 value 00 id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyIndexKey {
    pub topic: String,
    pub value: String,
    pub id: String,
}

/// Encodes an event key, reusing `buf`'s capacity when it suffices.
pub fn event_key(topic: &str, id: &str, buf: Vec<u8>) -> Result<Vec<u8>> {
    require_field(topic, "topic")?;
    require_field(id, "id")?;

    let mut buf = reserve(buf, 3 + topic.len() + id.len());
    buf.push(EVENT_TAG);
    buf.push(SEP);
    buf.extend_from_slice(topic.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(id.as_bytes());
    Ok(buf)
}

/// Encodes a channel key, reusing `buf`'s capacity when it suffices.
pub fn channel_key(topic: &str, channel: &str, id: &str, buf: Vec<u8>) -> Result<Vec<u8>> {
    require_field(topic, "topic")?;
    require_field(channel, "channel")?;
    require_field(id, "id")?;

    let mut buf = reserve(buf, 4 + topic.len() + channel.len() + id.len());
    buf.push(CHANNEL_TAG);
    buf.push(SEP);
    buf.extend_from_slice(topic.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(channel.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(id.as_bytes());
    Ok(buf)
}

/// Encodes a time-index key, reusing `buf`'s capacity when it suffices.
pub fn time_key(create_time: DateTime<Utc>, id: &str, buf: Vec<u8>) -> Result<Vec<u8>> {
    require_field(id, "id")?;
    let nanos = create_time.timestamp_nanos_opt().ok_or_else(|| {
        QueueError::Validation(format!("create_time {create_time} is out of range"))
    })?;

    let mut buf = reserve(buf, 11 + id.len());
    buf.push(TIME_TAG);
    buf.push(SEP);
    buf.extend_from_slice(&nanos.to_be_bytes());
    buf.push(SEP);
    buf.extend_from_slice(id.as_bytes());
    Ok(buf)
}

/// Encodes a current-schema index key, reusing `buf`'s capacity when it
/// suffices.
pub fn index_key(topic: &str, value: &str, buf: Vec<u8>) -> Result<Vec<u8>> {
    require_field(topic, "topic")?;
    require_field(value, "value")?;

    let mut buf = reserve(buf, 3 + topic.len() + value.len());
    buf.push(INDEX_TAG);
    buf.push(SEP);
    buf.extend_from_slice(topic.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(value.as_bytes());
    Ok(buf)
}

/// Encodes a legacy (1.0.0 schema) index key. The legacy layout required
/// topic and id but allowed an empty value, so that is preserved here.
pub fn legacy_index_key(topic: &str, value: &str, id: &str, buf: Vec<u8>) -> Result<Vec<u8>> {
    require_field(topic, "topic")?;
    require_field(id, "id")?;
    if value.bytes().any(|b| b == SEP) {
        return Err(QueueError::Validation(
            "value cannot contain the null byte".into(),
        ));
    }

    let mut buf = reserve(buf, 4 + topic.len() + value.len() + id.len());
    buf.push(INDEX_TAG_V1_0_0);
    buf.push(SEP);
    buf.extend_from_slice(topic.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(value.as_bytes());
    buf.push(SEP);
    buf.extend_from_slice(id.as_bytes());
    Ok(buf)
}

pub fn decode_event_key(key: &[u8]) -> Result<EventKey> {
    let rest = expect_tag(key, EVENT_TAG, "event key")?;
    let (topic, id) = split_once(rest, "event key topic")?;
    Ok(EventKey {
        topic: field_str(topic, "event key topic")?,
        id: field_str(id, "event key id")?,
    })
}

pub fn decode_channel_key(key: &[u8]) -> Result<ChannelKey> {
    let rest = expect_tag(key, CHANNEL_TAG, "channel key")?;
    let (topic, rest) = split_once(rest, "channel key topic")?;
    let (channel, id) = split_once(rest, "channel key channel")?;
    Ok(ChannelKey {
        topic: field_str(topic, "channel key topic")?,
        channel: field_str(channel, "channel key channel")?,
        id: field_str(id, "channel key id")?,
    })
}

pub fn decode_time_key(key: &[u8]) -> Result<TimeKey> {
    let rest = expect_tag(key, TIME_TAG, "time key")?;
    if rest.len() < 9 || rest[8] != SEP {
        return Err(QueueError::Corruption(
            "time key is missing its timestamp field".into(),
        ));
    }
    let mut nanos = [0u8; 8];
    nanos.copy_from_slice(&rest[..8]);
    Ok(TimeKey {
        create_time: DateTime::from_timestamp_nanos(i64::from_be_bytes(nanos)),
        id: field_str(&rest[9..], "time key id")?,
    })
}

pub fn decode_index_key(key: &[u8]) -> Result<IndexKey> {
    let rest = expect_tag(key, INDEX_TAG, "index key")?;
    let (topic, value) = split_once(rest, "index key topic")?;
    Ok(IndexKey {
        topic: field_str(topic, "index key topic")?,
        value: field_str(value, "index key value")?,
    })
}

pub fn decode_legacy_index_key(key: &[u8]) -> Result<LegacyIndexKey> {
    let rest = expect_tag(key, INDEX_TAG_V1_0_0, "legacy index key")?;
    let (topic, rest) = split_once(rest, "legacy index key topic")?;
    let (value, id) = split_once(rest, "legacy index key value")?;
    Ok(LegacyIndexKey {
        topic: field_str(topic, "legacy index key topic")?,
        value: field_str(value, "legacy index key value")?,
        id: field_str(id, "legacy index key id")?,
    })
}

/// Prefix covering every channel key under `topic`. The trailing
/// separator keeps `"top"` from matching keys under `"topic"`.
pub fn channel_topic_prefix(topic: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(3 + topic.len());
    prefix.push(CHANNEL_TAG);
    prefix.push(SEP);
    prefix.extend_from_slice(topic.as_bytes());
    prefix.push(SEP);
    prefix
}

/// Prefix covering every time-index key.
pub fn time_prefix() -> Vec<u8> {
    vec![TIME_TAG, SEP]
}

/// Prefix covering every legacy-schema index key.
pub fn legacy_index_prefix() -> Vec<u8> {
    vec![INDEX_TAG_V1_0_0, SEP]
}

fn reserve(mut buf: Vec<u8>, size: usize) -> Vec<u8> {
    if buf.capacity() < size {
        buf = Vec::with_capacity(size);
    } else {
        buf.clear();
    }
    buf
}

fn expect_tag<'a>(key: &'a [u8], tag: u8, what: &str) -> Result<&'a [u8]> {
    if key.len() < 2 || key[0] != tag || key[1] != SEP {
        return Err(QueueError::Corruption(format!(
            "buffer does not contain a {what}"
        )));
    }
    Ok(&key[2..])
}

fn split_once<'a>(buf: &'a [u8], what: &str) -> Result<(&'a [u8], &'a [u8])> {
    let at = buf
        .iter()
        .position(|&b| b == SEP)
        .ok_or_else(|| QueueError::Corruption(format!("{what}: separator not found")))?;
    Ok((&buf[..at], &buf[at + 1..]))
}

fn field_str(bytes: &[u8], what: &str) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(|field| field.to_string())
        .map_err(|err| QueueError::Corruption(format!("{what}: {err}")))
}
