use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use leaselog_core::{ConfigError, DispatcherId};
use leaselog_log::{ChangeOp, SharedLog, SyncedMap};

use super::r#trait::{Batch, DispatchError, DispatchLeaseManager, LeaseRecord};
use crate::config::StoreConfig;
use crate::event_store::EventStore;

/// Lease manager whose leases and watermarks live in shared logs.
///
/// Leases are keyed by batch id; ids are the number of leases ever created
/// plus one, so they are never reused even after leases are removed.
#[derive(Debug)]
pub struct LogDispatchLeaseManager<S, L> {
    store: S,
    leases: SyncedMap<u64, LeaseRecord, L>,
    watermarks: SyncedMap<DispatcherId, u64, L>,
    lease_timeout: Duration,
    max_dispatcher_id_len: Option<usize>,
}

impl<S, L> LogDispatchLeaseManager<S, L>
where
    S: EventStore,
    L: SharedLog,
{
    pub fn new(
        store: S,
        leases_log: L,
        watermarks_log: L,
        config: &StoreConfig,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        Ok(Self {
            store,
            leases: SyncedMap::new(leases_log)?,
            watermarks: SyncedMap::new(watermarks_log)?,
            lease_timeout: config.lease_timeout,
            max_dispatcher_id_len: config.max_dispatcher_id_len,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    fn check_dispatcher(&self, dispatcher: &DispatcherId) -> Result<(), DispatchError> {
        if let Some(max) = self.max_dispatcher_id_len {
            dispatcher.ensure_max_len(max)?;
        }
        Ok(())
    }

    /// Last sequence number `dispatcher` acknowledged, 0 if none.
    pub fn watermark(&self, dispatcher: &DispatcherId) -> Result<u64, DispatchError> {
        Ok(self.watermarks.get(dispatcher)?.unwrap_or(0))
    }

    /// Leases currently held by `dispatcher` (expired ones included until the
    /// next lease request removes them), ordered by batch id.
    pub fn outstanding_leases(
        &self,
        dispatcher: &DispatcherId,
    ) -> Result<Vec<(u64, LeaseRecord)>, DispatchError> {
        let mut leases: Vec<(u64, LeaseRecord)> = self
            .leases
            .entries()?
            .into_iter()
            .filter(|(_, lease)| &lease.dispatcher_id == dispatcher)
            .collect();
        leases.sort_by_key(|(id, _)| *id);
        Ok(leases)
    }

    /// `get_next_undispatched_batch` with the clock supplied by the caller.
    pub fn get_next_undispatched_batch_at(
        &self,
        dispatcher: &DispatcherId,
        max_batch_size: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Batch>, DispatchError> {
        if max_batch_size == 0 {
            return Err(ConfigError::invalid_setting("batch size must be positive").into());
        }
        self.check_dispatcher(dispatcher)?;

        self.leases.update(|state, ops| {
            let mut live_upper = None;
            for (&id, lease) in state.entries() {
                if &lease.dispatcher_id != dispatcher {
                    continue;
                }
                if lease.is_expired(now, self.lease_timeout) {
                    info!(
                        dispatcher = %dispatcher,
                        batch_id = id,
                        sequence_start = lease.sequence_start,
                        size = lease.size,
                        "lease expired; range will be re-issued"
                    );
                    ops.push(ChangeOp::Delete { key: id });
                } else {
                    live_upper = live_upper.max(Some(lease.upper_bound()));
                }
            }

            let watermark = self.watermarks.get(dispatcher)?.unwrap_or(0);
            let resume = watermark.max(live_upper.unwrap_or(0));

            let events = self
                .store
                .get_events_from(resume + 1)?
                .take(max_batch_size)
                .collect::<Result<Vec<_>, _>>()?;

            let Some(first) = events.first() else {
                debug!(dispatcher = %dispatcher, resume, "dispatcher is caught up");
                return Ok(None);
            };

            let id = state.created_count() + 1;
            let lease = LeaseRecord {
                dispatcher_id: dispatcher.clone(),
                sequence_start: first.sequence_number,
                size: events.len() as u64,
                created_at: now,
            };
            debug!(
                dispatcher = %dispatcher,
                batch_id = id,
                sequence_start = lease.sequence_start,
                size = lease.size,
                "leased batch"
            );
            ops.push(ChangeOp::Create {
                key: id,
                value: lease.clone(),
            });

            Ok(Some(Batch::from_lease(id, lease, events)))
        })
    }
}

impl<S, L> DispatchLeaseManager for LogDispatchLeaseManager<S, L>
where
    S: EventStore,
    L: SharedLog,
{
    fn get_next_undispatched_batch(
        &self,
        dispatcher: &DispatcherId,
        max_batch_size: usize,
    ) -> Result<Option<Batch>, DispatchError> {
        self.get_next_undispatched_batch_at(dispatcher, max_batch_size, Utc::now())
    }

    fn mark_event_as_dispatched(
        &self,
        dispatcher: &DispatcherId,
        sequence_number: u64,
    ) -> Result<(), DispatchError> {
        self.check_dispatcher(dispatcher)?;

        let previous = self.watermarks.update(|state, ops| {
            let previous = state.get(dispatcher).copied();
            ops.push(ChangeOp::Update {
                key: dispatcher.clone(),
                value: sequence_number,
            });
            Ok::<_, DispatchError>(previous)
        })?;

        // Accepted as-is; callers are expected to acknowledge in order.
        if let Some(previous) = previous.filter(|p| sequence_number < *p) {
            warn!(
                dispatcher = %dispatcher,
                previous,
                sequence_number,
                "watermark moved backwards"
            );
        }

        let completed = self.leases.update(|state, ops| {
            let ids: Vec<u64> = state
                .entries()
                .iter()
                .filter(|(_, lease)| {
                    &lease.dispatcher_id == dispatcher && lease.upper_bound() == sequence_number
                })
                .map(|(id, _)| *id)
                .collect();
            for &id in &ids {
                ops.push(ChangeOp::Delete { key: id });
            }
            Ok::<_, DispatchError>(ids)
        })?;

        debug!(
            dispatcher = %dispatcher,
            sequence_number,
            completed = ?completed,
            "acknowledged event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    use leaselog_core::StreamId;
    use leaselog_log::{MemoryLog, MemoryLogRegistry};

    use super::*;
    use crate::event_store::{LogEventStore, UncommittedEvent};

    type Manager = LogDispatchLeaseManager<Arc<LogEventStore<MemoryLog>>, MemoryLog>;

    fn setup(registry: &MemoryLogRegistry, config: &StoreConfig) -> (Arc<LogEventStore<MemoryLog>>, Manager) {
        let store = Arc::new(LogEventStore::new(registry.open("Events").unwrap()).unwrap());
        let manager = LogDispatchLeaseManager::new(
            store.clone(),
            registry.open("Batches").unwrap(),
            registry.open("Watermarks").unwrap(),
            config,
        )
        .unwrap();
        (store, manager)
    }

    fn commit(store: &LogEventStore<MemoryLog>, count: usize) {
        let events = (0..count)
            .map(|i| UncommittedEvent::new("test.event", format!("{i}")))
            .collect();
        store.commit_stream(StreamId::new(), events, None).unwrap();
    }

    fn d(name: &str) -> DispatcherId {
        DispatcherId::new(name).unwrap()
    }

    #[test]
    fn caught_up_dispatcher_gets_nothing() {
        let registry = MemoryLogRegistry::default();
        let (_, manager) = setup(&registry, &StoreConfig::default());

        assert!(manager.get_next_undispatched_batch(&d("D1"), 5).unwrap().is_none());
        assert!(manager.outstanding_leases(&d("D1")).unwrap().is_empty());
    }

    #[test]
    fn batch_ids_are_never_reused() {
        let registry = MemoryLogRegistry::default();
        let (store, manager) = setup(&registry, &StoreConfig::default());
        commit(&store, 3);

        let first = manager.get_next_undispatched_batch(&d("D1"), 1).unwrap().unwrap();
        manager.mark_event_as_dispatched(&d("D1"), 1).unwrap();
        let second = manager.get_next_undispatched_batch(&d("D1"), 1).unwrap().unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(second.sequence_start, 2);
    }

    #[test]
    fn zero_batch_size_is_a_configuration_error() {
        let registry = MemoryLogRegistry::default();
        let (_, manager) = setup(&registry, &StoreConfig::default());
        let err = manager.get_next_undispatched_batch(&d("D1"), 0).unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn long_dispatcher_ids_are_rejected_when_portable() {
        let registry = MemoryLogRegistry::default();
        let (store, manager) = setup(&registry, &StoreConfig::default().portable());
        commit(&store, 1);

        let err = manager
            .get_next_undispatched_batch(&d("a-very-long-dispatcher"), 1)
            .unwrap_err();
        assert!(matches!(err, DispatchError::Config(ConfigError::InvalidDispatcherId(_))));
        assert!(manager.mark_event_as_dispatched(&d("a-very-long-dispatcher"), 1).is_err());
        assert!(manager.get_next_undispatched_batch(&DispatcherId::default_group(), 1).unwrap().is_some());
    }

    #[test]
    fn regressing_acknowledgement_is_accepted() {
        let registry = MemoryLogRegistry::default();
        let (store, manager) = setup(&registry, &StoreConfig::default());
        commit(&store, 5);

        manager.mark_event_as_dispatched(&d("D1"), 4).unwrap();
        manager.mark_event_as_dispatched(&d("D1"), 2).unwrap();
        assert_eq!(manager.watermark(&d("D1")).unwrap(), 2);

        let batch = manager.get_next_undispatched_batch(&d("D1"), 10).unwrap().unwrap();
        assert_eq!(batch.sequence_start, 3);
    }

    #[test]
    fn expiry_uses_the_configured_timeout() {
        let registry = MemoryLogRegistry::default();
        let config = StoreConfig::default().with_lease_timeout(std::time::Duration::from_secs(5));
        let (store, manager) = setup(&registry, &config);
        commit(&store, 2);

        let t0 = Utc::now();
        let first = manager.get_next_undispatched_batch_at(&d("D1"), 2, t0).unwrap().unwrap();
        assert!(manager
            .get_next_undispatched_batch_at(&d("D1"), 2, t0 + ChronoDuration::seconds(4))
            .unwrap()
            .is_none());

        let again = manager
            .get_next_undispatched_batch_at(&d("D1"), 2, t0 + ChronoDuration::seconds(5))
            .unwrap()
            .unwrap();
        assert_eq!(again.sequence_start, first.sequence_start);
        assert_eq!(again.size, 2);
        assert_ne!(again.id, first.id);
        assert_eq!(manager.outstanding_leases(&d("D1")).unwrap().len(), 1);
    }

    #[test]
    fn leases_are_shared_between_manager_instances() {
        let registry = MemoryLogRegistry::default();
        let (store, a) = setup(&registry, &StoreConfig::default());
        let (_, b) = setup(&registry, &StoreConfig::default());
        commit(&store, 4);

        let first = a.get_next_undispatched_batch(&d("D1"), 2).unwrap().unwrap();
        let second = b.get_next_undispatched_batch(&d("D1"), 2).unwrap().unwrap();
        assert_eq!((first.sequence_start, second.sequence_start), (1, 3));

        b.mark_event_as_dispatched(&d("D1"), 2).unwrap();
        assert_eq!(a.watermark(&d("D1")).unwrap(), 2);
        assert_eq!(a.outstanding_leases(&d("D1")).unwrap().len(), 1);
    }

    #[derive(Debug, Clone)]
    enum Step {
        Commit(usize),
        Lease(usize),
        AckUpper,
        AckRandom(u64),
        Advance(i64),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            3 => (1usize..4).prop_map(Step::Commit),
            4 => (1usize..4).prop_map(Step::Lease),
            2 => Just(Step::AckUpper),
            1 => (1u64..12).prop_map(Step::AckRandom),
            1 => (1i64..45).prop_map(Step::Advance),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn live_leases_never_overlap(steps in proptest::collection::vec(step(), 1..30)) {
            let registry = MemoryLogRegistry::default();
            let (store, manager) = setup(&registry, &StoreConfig::default());
            let dispatcher = d("prop");
            let mut now = Utc::now();

            for step in steps {
                match step {
                    Step::Commit(n) => commit(&store, n),
                    Step::Lease(n) => {
                        if let Some(batch) = manager.get_next_undispatched_batch_at(&dispatcher, n, now).unwrap() {
                            prop_assert!(batch.size as usize <= n);
                            prop_assert!(batch.sequence_start > manager.watermark(&dispatcher).unwrap());
                            let seqs: Vec<u64> = batch.events.iter().map(|e| e.sequence_number).collect();
                            let expected: Vec<u64> = (batch.sequence_start..=batch.upper_bound()).collect();
                            prop_assert_eq!(seqs, expected);
                        }
                    }
                    Step::AckUpper => {
                        let leases = manager.outstanding_leases(&dispatcher).unwrap();
                        if let Some((_, lease)) = leases.first() {
                            manager.mark_event_as_dispatched(&dispatcher, lease.upper_bound()).unwrap();
                        }
                    }
                    Step::AckRandom(seq) => manager.mark_event_as_dispatched(&dispatcher, seq).unwrap(),
                    Step::Advance(secs) => now += ChronoDuration::seconds(secs),
                }

                let live: Vec<LeaseRecord> = manager
                    .outstanding_leases(&dispatcher)
                    .unwrap()
                    .into_iter()
                    .map(|(_, l)| l)
                    .filter(|l| !l.is_expired(now, manager.lease_timeout()))
                    .collect();
                for (i, a) in live.iter().enumerate() {
                    for b in &live[i + 1..] {
                        prop_assert!(a.upper_bound() < b.sequence_start || b.upper_bound() < a.sequence_start);
                    }
                }
            }
        }
    }
}
