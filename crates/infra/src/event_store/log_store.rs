use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard};

use chrono::Utc;
use tracing::debug;

use leaselog_core::{StateToken, StreamId};
use leaselog_log::{LogCursor, SharedLog};

use super::r#trait::{
    EventIter, EventStore, EventStoreError, StoredEvent, StreamSlice, UncommittedEvent,
};

/// Process-local replica of the event log.
#[derive(Debug, Default)]
struct Replay {
    cursor: LogCursor,
    events: Vec<StoredEvent>,
    /// Indices into `events`, per stream, in commit order.
    streams: HashMap<StreamId, Vec<usize>>,
}

impl Replay {
    fn catch_up<L: SharedLog>(&mut self, log: &L) -> Result<(), EventStoreError> {
        loop {
            let mut cursor = self.cursor;
            let Some(record) = log.read_next(&mut cursor)? else {
                return Ok(());
            };

            let offset = self.cursor.offset();
            let event: StoredEvent = serde_json::from_slice(&record).map_err(|e| {
                EventStoreError::Corrupt(format!("undecodable event at offset {offset}: {e}"))
            })?;

            let expected = self.events.len() as u64 + 1;
            if event.sequence_number != expected {
                return Err(EventStoreError::Corrupt(format!(
                    "expected sequence number {expected} at offset {offset}, found {}",
                    event.sequence_number
                )));
            }

            self.streams
                .entry(event.stream_id)
                .or_default()
                .push(self.events.len());
            self.events.push(event);
            self.cursor = cursor;
        }
    }

    fn current_state(&self, stream_id: StreamId) -> Option<&StateToken> {
        self.streams
            .get(&stream_id)
            .and_then(|indices| indices.last())
            .map(|&i| &self.events[i].state)
    }

    fn last_sequence_number(&self) -> u64 {
        self.events.len() as u64
    }
}

fn check_precondition(
    stream_id: StreamId,
    current: Option<&StateToken>,
    expected: Option<&StateToken>,
) -> Result<(), EventStoreError> {
    match (current, expected) {
        (None, None) => Ok(()),
        (Some(c), Some(e)) if c == e => Ok(()),
        (Some(_), None) => Err(EventStoreError::Concurrency(format!(
            "stream {stream_id} already exists"
        ))),
        (None, Some(e)) => Err(EventStoreError::Concurrency(format!(
            "stream {stream_id} does not exist; expected state {e}"
        ))),
        (Some(c), Some(e)) => Err(EventStoreError::Concurrency(format!(
            "stream {stream_id} is at state {c}, expected {e}"
        ))),
    }
}

/// Event store whose source of truth is a [`SharedLog`].
///
/// Every process replays the log into its own replica; commits are serialized
/// through the log's writer lock, so concurrent writers in other processes
/// are always seen before the precondition is checked.
#[derive(Debug)]
pub struct LogEventStore<L> {
    log: L,
    replay: RwLock<Replay>,
}

impl<L> LogEventStore<L>
where
    L: SharedLog,
{
    /// Attach to `log`, replaying everything committed so far.
    pub fn new(log: L) -> Result<Self, EventStoreError> {
        let store = Self {
            log,
            replay: RwLock::new(Replay::default()),
        };
        store.synced()?;
        Ok(store)
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Sequence number of the newest committed event, 0 when empty.
    pub fn last_sequence_number(&self) -> Result<u64, EventStoreError> {
        Ok(self.synced()?.last_sequence_number())
    }

    fn synced(&self) -> Result<RwLockReadGuard<'_, Replay>, EventStoreError> {
        {
            let mut replay = self.replay.write().map_err(|_| EventStoreError::Poisoned)?;
            replay.catch_up(&self.log)?;
        }
        self.replay.read().map_err(|_| EventStoreError::Poisoned)
    }

    fn event_at(&self, sequence_number: u64) -> Result<Option<StoredEvent>, EventStoreError> {
        let index = (sequence_number - 1) as usize;
        {
            let replay = self.replay.read().map_err(|_| EventStoreError::Poisoned)?;
            if let Some(event) = replay.events.get(index) {
                return Ok(Some(event.clone()));
            }
        }
        Ok(self.synced()?.events.get(index).cloned())
    }
}

impl<L> EventStore for LogEventStore<L>
where
    L: SharedLog,
{
    fn commit_stream(
        &self,
        stream_id: StreamId,
        events: Vec<UncommittedEvent>,
        pre_commit_state: Option<&StateToken>,
    ) -> Result<Option<StateToken>, EventStoreError> {
        let mut replay = self.replay.write().map_err(|_| EventStoreError::Poisoned)?;

        self.log.exclusive(|sink| {
            replay.catch_up(&self.log)?;

            let current = replay.current_state(stream_id).cloned();
            check_precondition(stream_id, current.as_ref(), pre_commit_state)?;

            if events.is_empty() {
                return Ok(current);
            }

            let committed_at = Utc::now();
            let first = replay.last_sequence_number() + 1;
            let stored: Vec<StoredEvent> = events
                .into_iter()
                .zip(first..)
                .map(|(e, sequence_number)| StoredEvent {
                    sequence_number,
                    stream_id,
                    payload_type: e.payload_type,
                    payload: e.payload,
                    state: StateToken::generate(),
                    committed_at,
                })
                .collect();

            let records = stored
                .iter()
                .map(|e| {
                    serde_json::to_vec(e)
                        .map_err(|err| EventStoreError::Serialization(err.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;
            sink.append_all(&records)?;

            let state = stored.last().map(|e| e.state.clone());
            debug!(
                stream_id = %stream_id,
                first_sequence = first,
                count = stored.len(),
                "committed events"
            );

            replay.catch_up(&self.log)?;
            Ok(state)
        })
    }

    fn get_stream(
        &self,
        stream_id: StreamId,
        from_revision: usize,
    ) -> Result<StreamSlice, EventStoreError> {
        let replay = self.synced()?;
        let Some(indices) = replay.streams.get(&stream_id) else {
            return Ok(StreamSlice::default());
        };

        Ok(StreamSlice {
            events: indices
                .iter()
                .skip(from_revision)
                .map(|&i| replay.events[i].clone())
                .collect(),
            state: replay.current_state(stream_id).cloned(),
        })
    }

    fn get_events_from(&self, sequence_number: u64) -> Result<EventIter<'_>, EventStoreError> {
        self.synced()?;
        Ok(Box::new(EventCursor {
            store: self,
            next: sequence_number.max(1),
            failed: false,
        }))
    }
}

/// Iterator returned by `get_events_from`; fetches one event per step.
struct EventCursor<'a, L> {
    store: &'a LogEventStore<L>,
    next: u64,
    failed: bool,
}

impl<L> Iterator for EventCursor<'_, L>
where
    L: SharedLog,
{
    type Item = Result<StoredEvent, EventStoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.store.event_at(self.next) {
            Ok(Some(event)) => {
                self.next += 1;
                Some(Ok(event))
            }
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
