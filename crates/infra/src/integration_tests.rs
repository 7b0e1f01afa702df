//! End-to-end tests across the store, lease manager, notifier and workers.
//!
//! Verifies:
//! - Stream commits round-trip state tokens and reject stale writers
//! - Leases never overlap, complete only on their exact upper bound, and are
//!   re-issued after expiry
//! - Dispatchers are independent consumer groups
//! - Separate storage handles over the same mapped files agree

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use leaselog_core::{DispatcherId, StreamId};
use leaselog_events::{EventPayload, HandlerRegistry};
use leaselog_log::{LogConfig, MemoryLog, MemoryLogRegistry};

use crate::config::StoreConfig;
use crate::dispatch::DispatchLeaseManager;
use crate::event_store::{EventStore, EventStoreError, UncommittedEvent};
use crate::notify::{Notification, NotificationService};
use crate::storage::Storage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Opened {
    owner: String,
}

impl EventPayload for Opened {
    const PAYLOAD_TYPE: &'static str = "account.opened";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Deposited {
    amount: i64,
}

impl EventPayload for Deposited {
    const PAYLOAD_TYPE: &'static str = "account.deposited";
}

#[derive(Debug, Default, PartialEq)]
struct Account {
    owner: String,
    balance: i64,
}

fn account_handlers() -> HandlerRegistry<Account> {
    let mut registry = HandlerRegistry::new();
    registry
        .register(|acc: &mut Account, e: Opened| acc.owner = e.owner)
        .unwrap()
        .register(|acc: &mut Account, e: Deposited| acc.balance += e.amount)
        .unwrap();
    registry
}

fn storage() -> Storage<Arc<MemoryLog>> {
    leaselog_observability::init_for_tests();
    let registry = MemoryLogRegistry::default();
    Storage::open_in_memory(&registry, StoreConfig::default()).unwrap()
}

fn deposit(amount: i64) -> UncommittedEvent {
    UncommittedEvent::from_typed(&Deposited { amount }).unwrap()
}

fn d(name: &str) -> DispatcherId {
    DispatcherId::new(name).unwrap()
}

fn commit_three(storage: &Storage<Arc<MemoryLog>>) {
    let events = vec![deposit(1), deposit(2), deposit(3)];
    storage
        .store()
        .commit_stream(StreamId::new(), events, None)
        .unwrap();
}

#[test]
fn commit_chain_and_read_back() {
    let storage = storage();
    let store = storage.store();
    let stream = StreamId::new();

    let a = UncommittedEvent::from_typed(&Opened {
        owner: "ada".to_string(),
    })
    .unwrap();
    let t1 = store.commit_stream(stream, vec![a], None).unwrap().unwrap();
    let t2 = store
        .commit_stream(stream, vec![deposit(10)], Some(&t1))
        .unwrap()
        .unwrap();
    assert_ne!(t1, t2);

    let slice = store.get_stream(stream, 0).unwrap();
    assert_eq!(slice.state, Some(t2));
    assert_eq!(slice.events.len(), 2);
    assert_eq!(
        slice.events[0].decode::<Opened>().unwrap(),
        Some(Opened {
            owner: "ada".to_string()
        })
    );
    assert_eq!(slice.events[0].decode::<Deposited>().unwrap(), None);

    let mut account = Account::default();
    let handled = account_handlers()
        .rehydrate(&mut account, slice.payloads())
        .unwrap();
    assert_eq!(handled, 2);
    assert_eq!(
        account,
        Account {
            owner: "ada".to_string(),
            balance: 10
        }
    );
}

#[test]
fn second_reader_with_stale_state_conflicts() {
    let storage = storage();
    let store = storage.store();
    let stream = StreamId::new();

    // Both readers observed "no stream yet".
    let observed_by_a = store.get_stream(stream, 0).unwrap().state;
    let observed_by_b = store.get_stream(stream, 0).unwrap().state;
    assert!(observed_by_a.is_none() && observed_by_b.is_none());

    store
        .commit_stream(stream, vec![deposit(1)], observed_by_a.as_ref())
        .unwrap();
    let err = store
        .commit_stream(stream, vec![deposit(2)], observed_by_b.as_ref())
        .unwrap_err();
    assert!(matches!(err, EventStoreError::Concurrency(_)));
    assert_eq!(store.get_stream(stream, 0).unwrap().events.len(), 1);
}

#[test]
fn empty_commit_never_changes_the_state_token() {
    let storage = storage();
    let store = storage.store();
    let stream = StreamId::new();
    let t1 = store
        .commit_stream(stream, vec![deposit(1)], None)
        .unwrap()
        .unwrap();

    for _ in 0..3 {
        assert_eq!(
            store.commit_stream(stream, vec![], Some(&t1)).unwrap(),
            Some(t1.clone())
        );
    }
    assert_eq!(store.get_stream(stream, 0).unwrap().state, Some(t1));
}

#[test]
fn unacknowledged_leases_are_not_reissued() {
    let storage = storage();
    commit_three(&storage);
    let leases = storage.leases();

    let first = leases
        .get_next_undispatched_batch(&d("D1"), 2)
        .unwrap()
        .unwrap();
    assert_eq!((first.sequence_start, first.size), (1, 2));
    assert_eq!(
        first
            .events
            .iter()
            .map(|e| e.sequence_number)
            .collect::<Vec<_>>(),
        vec![1, 2]
    );

    let second = leases
        .get_next_undispatched_batch(&d("D1"), 2)
        .unwrap()
        .unwrap();
    assert_eq!((second.sequence_start, second.size), (3, 1));

    assert!(leases.get_next_undispatched_batch(&d("D1"), 2).unwrap().is_none());
}

#[test]
fn only_the_exact_upper_bound_completes_a_lease() {
    let storage = storage();
    commit_three(&storage);
    let leases = storage.leases();
    let d1 = d("D1");

    let batch = leases.get_next_undispatched_batch(&d1, 3).unwrap().unwrap();
    assert_eq!(batch.upper_bound(), 3);

    leases.mark_event_as_dispatched(&d1, 2).unwrap();
    assert_eq!(leases.watermark(&d1).unwrap(), 2);
    assert_eq!(leases.outstanding_leases(&d1).unwrap().len(), 1);

    leases.mark_event_as_dispatched(&d1, 3).unwrap();
    assert!(leases.outstanding_leases(&d1).unwrap().is_empty());
    assert!(leases.get_next_undispatched_batch(&d1, 3).unwrap().is_none());
}

#[test]
fn expired_lease_is_reissued_over_the_same_range() {
    let storage = storage();
    commit_three(&storage);
    let leases = storage.leases();
    let d1 = d("D1");
    let t0 = Utc::now();

    let first = leases
        .get_next_undispatched_batch_at(&d1, 2, t0)
        .unwrap()
        .unwrap();
    let within = leases
        .get_next_undispatched_batch_at(&d1, 2, t0 + ChronoDuration::seconds(29))
        .unwrap()
        .unwrap();
    assert_eq!(within.sequence_start, 3);

    // Both leases expired: the whole range is available again.
    let reissued = leases
        .get_next_undispatched_batch_at(&d1, 5, t0 + ChronoDuration::seconds(61))
        .unwrap()
        .unwrap();
    assert_eq!(reissued.sequence_start, first.sequence_start);
    assert_eq!(reissued.size, 3);
}

#[test]
fn partially_acknowledged_expired_lease_resumes_after_the_watermark() {
    let storage = storage();
    commit_three(&storage);
    let leases = storage.leases();
    let d1 = d("D1");
    let t0 = Utc::now();

    leases
        .get_next_undispatched_batch_at(&d1, 3, t0)
        .unwrap()
        .unwrap();
    leases.mark_event_as_dispatched(&d1, 1).unwrap();

    let reissued = leases
        .get_next_undispatched_batch_at(&d1, 3, t0 + ChronoDuration::seconds(31))
        .unwrap()
        .unwrap();
    assert_eq!((reissued.sequence_start, reissued.size), (2, 2));
}

#[test]
fn dispatchers_are_independent() {
    let storage = storage();
    commit_three(&storage);
    let leases = storage.leases();

    let fast = leases.get_next_undispatched_batch(&d("fast"), 3).unwrap().unwrap();
    leases.mark_event_as_dispatched(&d("fast"), 3).unwrap();

    let slow = leases.get_next_undispatched_batch(&d("slow"), 1).unwrap().unwrap();
    let default = leases
        .get_next_undispatched_batch(&DispatcherId::from_option(None).unwrap(), 2)
        .unwrap()
        .unwrap();

    assert_eq!(fast.sequence_start, 1);
    assert_eq!(slow.sequence_start, 1);
    assert_eq!(default.sequence_start, 1);
    assert_eq!(leases.watermark(&d("slow")).unwrap(), 0);
    assert_eq!(default.dispatcher_id, DispatcherId::default_group());
}

#[test]
fn mapped_storage_is_shared_between_handles() {
    leaselog_observability::init_for_tests();
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::default().with_log(
        LogConfig::default()
            .with_directory(dir.path())
            .with_capacity(256 * 1024),
    );

    let writer = Storage::open_mapped(config.clone()).unwrap();
    let reader = Storage::open_mapped(config.clone()).unwrap();
    let stream = StreamId::new();

    let t1 = writer
        .store()
        .commit_stream(stream, vec![deposit(5)], None)
        .unwrap()
        .unwrap();
    assert_eq!(reader.store().get_stream(stream, 0).unwrap().state, Some(t1.clone()));

    let batch = reader
        .leases()
        .get_next_undispatched_batch(&d("D1"), 10)
        .unwrap()
        .unwrap();
    assert_eq!(batch.sequence_start, 1);
    assert!(writer
        .leases()
        .get_next_undispatched_batch(&d("D1"), 10)
        .unwrap()
        .is_none());

    writer
        .store()
        .commit_stream(stream, vec![deposit(6)], Some(&t1))
        .unwrap();
    drop(writer);

    let reopened = Storage::open_mapped(config).unwrap();
    assert_eq!(reopened.store().get_stream(stream, 0).unwrap().events.len(), 2);
    assert_eq!(reopened.leases().outstanding_leases(&d("D1")).unwrap().len(), 1);
}

#[test]
fn notifier_and_worker_drain_new_commits() {
    let storage = storage();
    let notifier = storage.notifications(Duration::from_millis(10)).unwrap();
    let d1 = d("D1");

    let watcher = notifier.subscribe(d1.clone()).unwrap();
    let balance = Arc::new(Mutex::new(Account::default()));
    let handlers = account_handlers();

    let worker = {
        let balance = balance.clone();
        storage
            .spawn_worker("integration-worker", d1.clone(), 2, Some(&notifier), move |event| {
                let mut account = balance.lock().unwrap();
                handlers.dispatch(&mut account, &event.payload_type, &event.payload)?;
                Ok(())
            })
            .unwrap()
    };

    commit_three(&storage);

    let deadline = Instant::now() + Duration::from_secs(5);
    while storage.leases().watermark(&d1).unwrap() < 3 {
        assert!(Instant::now() < deadline, "worker did not catch up");
        std::thread::sleep(Duration::from_millis(5));
    }

    let mut received = Vec::new();
    let seen_all = |received: &[Notification]| {
        received.contains(&Notification::EventCommitted { sequence_number: 3 })
            && received
                .iter()
                .any(|n| matches!(n, Notification::BatchPrepared { .. }))
    };
    while !seen_all(&received) {
        assert!(Instant::now() < deadline, "notifications missing: {received:?}");
        if let Ok(n) = watcher.recv_timeout(Duration::from_millis(20)) {
            received.push(n);
        }
    }

    worker.shutdown();
    notifier.close().unwrap();
    assert_eq!(balance.lock().unwrap().balance, 6);
}
