//! Append-only event store boundary.
//!
//! `EventStore` is the storage-agnostic contract; `LogEventStore` implements
//! it by replaying a shared log.

pub mod log_store;
pub mod r#trait;

pub use log_store::LogEventStore;
pub use r#trait::{
    EventIter, EventStore, EventStoreError, StoredEvent, StreamSlice, UncommittedEvent,
};
