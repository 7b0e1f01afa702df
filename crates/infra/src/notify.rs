//! Wake-up hints for dispatchers.
//!
//! Notifications are not authoritative: a dispatcher that receives one must
//! still call the lease manager to get events, and must not rely on receiving
//! exactly one notification per commit or lease.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use leaselog_core::DispatcherId;
use leaselog_events::{Fanout, FanoutError, Subscription, SubscriptionId};
use leaselog_log::{ChangeListener, LogCursor, LogError, SharedLog, SyncedMap};

use crate::dispatch::LeaseRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The event log grew; `sequence_number` is the newest committed event.
    EventCommitted { sequence_number: u64 },
    /// A lease was created for the subscriber's dispatcher.
    BatchPrepared { batch_id: u64 },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Fanout(#[from] FanoutError),

    #[error("notification service lock poisoned")]
    Poisoned,
}

/// Subscription to commit and lease notifications, scoped to one dispatcher.
pub trait NotificationService: Send + Sync {
    fn subscribe(&self, dispatcher: DispatcherId)
    -> Result<Subscription<Notification>, NotifyError>;

    /// Returns whether the subscription was registered.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, NotifyError>;
}

impl<N> NotificationService for Arc<N>
where
    N: NotificationService + ?Sized,
{
    fn subscribe(
        &self,
        dispatcher: DispatcherId,
    ) -> Result<Subscription<Notification>, NotifyError> {
        (**self).subscribe(dispatcher)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, NotifyError> {
        (**self).unsubscribe(id)
    }
}

/// Counts records in the event log; one record is one event.
struct EventCounter<L> {
    log: L,
    cursor: LogCursor,
    count: u64,
}

impl<L: SharedLog> EventCounter<L> {
    fn start(log: L) -> Result<Self, LogError> {
        let mut counter = Self {
            log,
            cursor: LogCursor::start(),
            count: 0,
        };
        counter.advance()?;
        Ok(counter)
    }

    /// New event count, if it grew.
    fn advance(&mut self) -> Result<Option<u64>, LogError> {
        let before = self.count;
        while self.log.read_next(&mut self.cursor)?.is_some() {
            self.count += 1;
        }
        Ok((self.count > before).then_some(self.count))
    }
}

/// Tracks lease ids already reported.
struct LeaseScanner<L> {
    leases: SyncedMap<u64, LeaseRecord, L>,
    last_seen: u64,
}

impl<L: SharedLog> LeaseScanner<L> {
    fn start(log: L) -> Result<Self, LogError> {
        let leases = SyncedMap::new(log)?;
        let last_seen = leases.created_count()?;
        Ok(Self { leases, last_seen })
    }

    /// Newest new lease id per dispatcher.
    fn advance(&mut self) -> Result<HashMap<DispatcherId, u64>, LogError> {
        let last_seen = self.last_seen;
        let (newest, created) = self.leases.read(|state| {
            let mut newest: HashMap<DispatcherId, u64> = HashMap::new();
            for (&id, lease) in state.entries() {
                if id <= last_seen {
                    continue;
                }
                let entry = newest.entry(lease.dispatcher_id.clone()).or_insert(id);
                *entry = (*entry).max(id);
            }
            (newest, state.created_count())
        })?;
        self.last_seen = last_seen.max(created);
        Ok(newest)
    }
}

/// Notification service driven by the change signals of the event and lease logs.
#[derive(Debug)]
pub struct LogNotificationService {
    fanout: Arc<Fanout<Notification, DispatcherId>>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl LogNotificationService {
    /// Start listening on `events_log` and `leases_log`.
    ///
    /// Existing events and leases are treated as already seen.
    pub fn start<L>(events_log: L, leases_log: L, tick: Duration) -> Result<Self, NotifyError>
    where
        L: SharedLog + Clone + 'static,
    {
        let fanout: Arc<Fanout<Notification, DispatcherId>> = Arc::new(Fanout::new());

        let mut counter = EventCounter::start(events_log.clone())?;
        let events_fanout = fanout.clone();
        let events_listener = ChangeListener::spawn("notify-events", events_log, tick, move || {
            match counter.advance() {
                Ok(Some(sequence_number)) => {
                    let notification = Notification::EventCommitted { sequence_number };
                    match events_fanout.publish(notification) {
                        Ok(delivered) => debug!(sequence_number, delivered, "event committed"),
                        Err(e) => warn!(error = %e, "failed to publish commit notification"),
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "failed to read event log"),
            }
        })?;

        let mut scanner = LeaseScanner::start(leases_log.clone())?;
        let leases_fanout = fanout.clone();
        let leases_listener = ChangeListener::spawn("notify-leases", leases_log, tick, move || {
            let newest = match scanner.advance() {
                Ok(newest) if newest.is_empty() => return,
                Ok(newest) => newest,
                Err(e) => {
                    warn!(error = %e, "failed to read lease log");
                    return;
                }
            };
            let published = leases_fanout.publish_with(|dispatcher| {
                newest
                    .get(dispatcher)
                    .map(|&batch_id| Notification::BatchPrepared { batch_id })
            });
            if let Err(e) = published {
                warn!(error = %e, "failed to publish batch notification");
            }
        })?;

        Ok(Self {
            fanout,
            listeners: Mutex::new(vec![events_listener, leases_listener]),
        })
    }

    /// Stop the listener threads. Subscriptions stop receiving; repeated calls are no-ops.
    pub fn close(&self) -> Result<(), NotifyError> {
        let listeners = std::mem::take(&mut *self.listeners.lock().map_err(|_| NotifyError::Poisoned)?);
        for listener in listeners {
            listener.stop();
        }
        Ok(())
    }
}

impl NotificationService for LogNotificationService {
    fn subscribe(
        &self,
        dispatcher: DispatcherId,
    ) -> Result<Subscription<Notification>, NotifyError> {
        Ok(self.fanout.subscribe(dispatcher)?)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, NotifyError> {
        Ok(self.fanout.unsubscribe(id)?)
    }
}
