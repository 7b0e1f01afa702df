//! The shared append-log capability.
//!
//! A `SharedLog` is a fixed-capacity, append-only sequence of length-prefixed
//! records. Exactly one writer holds the exclusive lock at a time; readers
//! never take it and each keeps its own forward-only `LogCursor`.
//!
//! ## Wire format
//!
//! ```text
//! [length: u32 LE][payload: length bytes][length: u32 LE][payload] ... [0u32]
//! ```
//!
//! A zero length means "no more data yet" at that offset. Readers re-check it
//! later instead of treating it as an error, which is also why empty records
//! cannot be written.
//!
//! ## Change signal
//!
//! Every append bumps a change counter (`generation`). Listeners block in
//! `wait_for_change` and must re-read the log after waking: one wake-up can
//! cover several appends.

use std::sync::Arc;
use std::time::Duration;

use crate::error::LogError;

/// Width of the record length prefix.
pub const LENGTH_PREFIX_LEN: u64 = 4;

/// Independent, forward-only read position in a log.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogCursor {
    offset: u64,
}

impl LogCursor {
    /// Cursor positioned before the first record.
    pub fn start() -> Self {
        Self::default()
    }

    /// Byte offset of the next record to read, relative to the data region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn advance_to(&mut self, offset: u64) {
        debug_assert!(offset > self.offset, "log cursors only move forward");
        self.offset = offset;
    }
}

/// Append side of a log, only reachable while the writer lock is held.
pub trait RecordSink {
    /// Append one record; returns its offset.
    fn append(&mut self, record: &[u8]) -> Result<u64, LogError>;

    /// Append several records contiguously; returns their offsets.
    ///
    /// Capacity for the whole batch is checked before any byte is written.
    /// Readers observe either every record of the batch or none of them.
    fn append_all(&mut self, records: &[Vec<u8>]) -> Result<Vec<u64>, LogError>;
}

/// Named, shared, append-only record log.
///
/// Implementations: [`crate::MemoryLog`] (in-process, for tests and single
/// binaries) and [`crate::MmapLog`] (cross-process, memory-mapped).
pub trait SharedLog: Send + Sync {
    /// Name the log was opened with.
    fn name(&self) -> &str;

    /// Read the record at `cursor` and advance it, or `None` if nothing new is visible.
    fn read_next(&self, cursor: &mut LogCursor) -> Result<Option<Vec<u8>>, LogError>;

    /// Run `f` while holding the exclusive writer lock.
    ///
    /// The lock wait is bounded; on timeout `LogError::LockTimeout` is returned
    /// without calling `f`.
    fn exclusive<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn RecordSink) -> Result<R, E>,
        E: From<LogError>;

    /// Append one record under the writer lock.
    fn append(&self, record: &[u8]) -> Result<u64, LogError> {
        self.exclusive(|sink| sink.append(record))
    }

    /// Current value of the change counter.
    fn generation(&self) -> Result<u64, LogError>;

    /// Block until the change counter differs from `seen` or `timeout` elapses.
    ///
    /// Returns the counter value observed last.
    fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64, LogError>;

    /// Release handles. Repeated calls are no-ops; later operations fail with
    /// `LogError::Closed`.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

impl<L> SharedLog for Arc<L>
where
    L: SharedLog + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn read_next(&self, cursor: &mut LogCursor) -> Result<Option<Vec<u8>>, LogError> {
        (**self).read_next(cursor)
    }

    fn exclusive<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn RecordSink) -> Result<R, E>,
        E: From<LogError>,
    {
        (**self).exclusive(f)
    }

    fn append(&self, record: &[u8]) -> Result<u64, LogError> {
        (**self).append(record)
    }

    fn generation(&self) -> Result<u64, LogError> {
        (**self).generation()
    }

    fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64, LogError> {
        (**self).wait_for_change(seen, timeout)
    }

    fn close(&self) {
        (**self).close()
    }

    fn is_closed(&self) -> bool {
        (**self).is_closed()
    }
}

/// Validate a record and return its encoded length prefix.
pub(crate) fn encoded_len(log: &str, record: &[u8]) -> Result<u32, LogError> {
    if record.is_empty() {
        return Err(LogError::EmptyRecord(log.to_string()));
    }
    u32::try_from(record.len())
        .map_err(|_| LogError::Codec(format!("record of {} bytes exceeds u32 length prefix", record.len())))
}

/// Bytes a batch of records occupies once framed.
pub(crate) fn framed_size(log: &str, records: &[Vec<u8>]) -> Result<u64, LogError> {
    records.iter().try_fold(0u64, |acc, r| {
        encoded_len(log, r)?;
        Ok(acc + LENGTH_PREFIX_LEN + r.len() as u64)
    })
}

/// Fail with `CapacityExceeded` unless `needed` more bytes fit after `end`.
pub(crate) fn ensure_fits(log: &str, end: u64, needed: u64, capacity: u64) -> Result<(), LogError> {
    let remaining = capacity.saturating_sub(end);
    if needed > remaining {
        return Err(LogError::CapacityExceeded {
            log: log.to_string(),
            needed,
            remaining,
            capacity,
        });
    }
    Ok(())
}
