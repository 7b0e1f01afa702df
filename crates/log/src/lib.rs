//! Shared append-only logs and the dictionaries replicated through them.
//!
//! - `shared`: the `SharedLog` capability and record framing
//! - `memory`: in-process backend (threads sharing a registry)
//! - `mmap`: cross-process backend (memory-mapped file + lock file)
//! - `synced_map`: dictionary replicated through a log
//! - `listener`: background change notification

pub mod config;
pub mod error;
pub mod listener;
pub mod memory;
pub mod mmap;
pub mod shared;
pub mod synced_map;

pub use config::{DEFAULT_CAPACITY, DEFAULT_LOCK_TIMEOUT, LogConfig, LogName};
pub use error::LogError;
pub use listener::ChangeListener;
pub use memory::{MemoryLog, MemoryLogRegistry};
pub use mmap::MmapLog;
pub use shared::{LENGTH_PREFIX_LEN, LogCursor, RecordSink, SharedLog};
pub use synced_map::{ChangeOp, MapState, SyncedMap};
