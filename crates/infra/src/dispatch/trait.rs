use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use leaselog_core::{ConfigError, DispatcherId};
use leaselog_log::LogError;

use crate::event_store::{EventStoreError, StoredEvent};

/// Persisted lease: events `[sequence_start, upper_bound()]` were handed to
/// `dispatcher_id` and stay reserved until acknowledged or expired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub dispatcher_id: DispatcherId,
    /// Sequence number of the first leased event.
    pub sequence_start: u64,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl LeaseRecord {
    /// Sequence number of the last leased event.
    pub fn upper_bound(&self) -> u64 {
        self.sequence_start + self.size.saturating_sub(1)
    }

    /// At least `timeout` old at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(timeout) => now.signed_duration_since(self.created_at) >= timeout,
            Err(_) => false,
        }
    }
}

/// A lease handed to a dispatcher, with the leased events attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub id: u64,
    pub dispatcher_id: DispatcherId,
    pub sequence_start: u64,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub events: Vec<StoredEvent>,
}

impl Batch {
    pub(crate) fn from_lease(id: u64, lease: LeaseRecord, events: Vec<StoredEvent>) -> Self {
        Self {
            id,
            dispatcher_id: lease.dispatcher_id,
            sequence_start: lease.sequence_start,
            size: lease.size,
            created_at: lease.created_at,
            events,
        }
    }

    /// Sequence number to acknowledge once every event has been handled.
    pub fn upper_bound(&self) -> u64 {
        self.sequence_start + self.size.saturating_sub(1)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("dispatch state lock poisoned")]
    Poisoned,
}

/// Lease-based, at-least-once distribution of the global event sequence to
/// independent consumer groups ("dispatchers").
///
/// Each dispatcher has its own watermark and its own leases; dispatchers
/// never block or affect each other.
pub trait DispatchLeaseManager: Send + Sync {
    /// Lease the next undispatched events for `dispatcher`.
    ///
    /// Returns `None` when the dispatcher is caught up; no lease is created then.
    fn get_next_undispatched_batch(
        &self,
        dispatcher: &DispatcherId,
        max_batch_size: usize,
    ) -> Result<Option<Batch>, DispatchError>;

    /// Record that `dispatcher` handled the event `sequence_number`.
    ///
    /// Moves the watermark to `sequence_number` and completes any lease whose
    /// last event is exactly `sequence_number`.
    fn mark_event_as_dispatched(
        &self,
        dispatcher: &DispatcherId,
        sequence_number: u64,
    ) -> Result<(), DispatchError>;
}

impl<M> DispatchLeaseManager for Arc<M>
where
    M: DispatchLeaseManager + ?Sized,
{
    fn get_next_undispatched_batch(
        &self,
        dispatcher: &DispatcherId,
        max_batch_size: usize,
    ) -> Result<Option<Batch>, DispatchError> {
        (**self).get_next_undispatched_batch(dispatcher, max_batch_size)
    }

    fn mark_event_as_dispatched(
        &self,
        dispatcher: &DispatcherId,
        sequence_number: u64,
    ) -> Result<(), DispatchError> {
        (**self).mark_event_as_dispatched(dispatcher, sequence_number)
    }
}
