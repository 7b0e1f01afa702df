use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use leaselog_core::{ConfigError, StateToken, StreamId};
use leaselog_events::EventPayload;
use leaselog_log::LogError;

/// An event ready to be committed (not yet assigned a sequence number).
///
/// Use `UncommittedEvent::from_typed()` to build one from a typed payload;
/// `new()` accepts already-encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncommittedEvent {
    pub payload_type: String,
    pub payload: Vec<u8>,
}

impl UncommittedEvent {
    pub fn new(payload_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload_type: payload_type.into(),
            payload: payload.into(),
        }
    }

    /// Encode a typed payload.
    pub fn from_typed<E>(event: &E) -> Result<Self, EventStoreError>
    where
        E: EventPayload,
    {
        let payload = event
            .encode()
            .map_err(|e| EventStoreError::Serialization(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            payload_type: E::PAYLOAD_TYPE.to_string(),
            payload,
        })
    }
}

/// A committed event (assigned a global sequence number).
///
/// Sequence numbers are global across all streams, start at 1 and have no
/// gaps. `state` is the token the stream carried right after this event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub sequence_number: u64,
    pub stream_id: StreamId,
    pub payload_type: String,
    #[serde(with = "payload_bytes")]
    pub payload: Vec<u8>,
    pub state: StateToken,
    pub committed_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Decode the payload as `E`, or `None` if it has a different payload type.
    pub fn decode<E>(&self) -> Result<Option<E>, EventStoreError>
    where
        E: EventPayload,
    {
        if self.payload_type != E::PAYLOAD_TYPE {
            return Ok(None);
        }
        E::decode(&self.payload).map(Some).map_err(|e| {
            EventStoreError::Serialization(format!(
                "event {} ({}) failed to decode: {e}",
                self.sequence_number, self.payload_type
            ))
        })
    }
}

/// Payload bytes are stored as a JSON string when they are UTF-8 (the common
/// case for `serde_json` payloads) and as a byte array otherwise.
mod payload_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Bytes(Vec<u8>),
    }

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(bytes) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.collect_seq(bytes),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into_bytes(),
            Repr::Bytes(bytes) => bytes,
        })
    }
}

/// Events of one stream plus its current state token.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamSlice {
    pub events: Vec<StoredEvent>,
    /// `None` when the stream has no events.
    pub state: Option<StateToken>,
}

impl StreamSlice {
    pub fn exists(&self) -> bool {
        self.state.is_some()
    }

    /// `(payload_type, payload)` pairs, e.g. for `HandlerRegistry::rehydrate`.
    pub fn payloads(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.events
            .iter()
            .map(|e| (e.payload_type.as_str(), e.payload.as_slice()))
    }
}

/// Event store operation error.
///
/// - **Concurrency**: the caller's pre-commit state is stale; re-read and decide
/// - **Log**: lock timeout, capacity exhaustion or I/O on the backing log
/// - **Corrupt**: the log holds records the store cannot interpret
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("event log is corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("event store lock poisoned")]
    Poisoned,
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Concurrency(_))
    }
}

/// Lazy, forward-only cursor over the global event sequence.
pub type EventIter<'a> = Box<dyn Iterator<Item = Result<StoredEvent, EventStoreError>> + Send + 'a>;

/// Append-only event store with per-stream optimistic concurrency.
///
/// ## Commit semantics
///
/// `commit_stream()`:
/// - compares `pre_commit_state` with the stream's current state token
///   (`None` means "the stream must not exist yet")
/// - assigns the next global sequence numbers, in order
/// - issues a fresh random state token per event
/// - commits the batch atomically and returns the last token
///
/// An empty batch appends nothing and returns the current state, after the
/// same precondition check.
pub trait EventStore: Send + Sync {
    fn commit_stream(
        &self,
        stream_id: StreamId,
        events: Vec<UncommittedEvent>,
        pre_commit_state: Option<&StateToken>,
    ) -> Result<Option<StateToken>, EventStoreError>;

    /// Events of `stream_id` with stream index `>= from_revision`, plus the current state.
    fn get_stream(
        &self,
        stream_id: StreamId,
        from_revision: usize,
    ) -> Result<StreamSlice, EventStoreError>;

    /// Events with `sequence_number >= sequence_number`, in order.
    ///
    /// The iterator ends at whatever was committed when it catches up; call
    /// again to continue.
    fn get_events_from(&self, sequence_number: u64) -> Result<EventIter<'_>, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn commit_stream(
        &self,
        stream_id: StreamId,
        events: Vec<UncommittedEvent>,
        pre_commit_state: Option<&StateToken>,
    ) -> Result<Option<StateToken>, EventStoreError> {
        (**self).commit_stream(stream_id, events, pre_commit_state)
    }

    fn get_stream(
        &self,
        stream_id: StreamId,
        from_revision: usize,
    ) -> Result<StreamSlice, EventStoreError> {
        (**self).get_stream(stream_id, from_revision)
    }

    fn get_events_from(&self, sequence_number: u64) -> Result<EventIter<'_>, EventStoreError> {
        (**self).get_events_from(sequence_number)
    }
}
