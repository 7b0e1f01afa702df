//! Event store, dispatch leases and notifications over shared logs.
//!
//! - `event_store`: per-stream optimistic concurrency over one global sequence
//! - `dispatch`: lease-based, at-least-once hand-out to consumer groups
//! - `notify`: wake-up hints for dispatchers
//! - `workers`: background dispatch loop
//! - `storage`: wiring for in-process and memory-mapped deployments

pub mod config;
pub mod dispatch;
pub mod event_store;
pub mod notify;
pub mod storage;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{DEFAULT_LEASE_TIMEOUT, StoreConfig};
pub use dispatch::{Batch, DispatchError, DispatchLeaseManager, LeaseRecord, LogDispatchLeaseManager};
pub use event_store::{
    EventStore, EventStoreError, LogEventStore, StoredEvent, StreamSlice, UncommittedEvent,
};
pub use notify::{LogNotificationService, Notification, NotificationService, NotifyError};
pub use storage::{Storage, StorageError};
pub use workers::{DispatchWorker, DispatchWorkerConfig, WorkerHandle};
