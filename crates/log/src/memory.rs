//! In-process shared log for tests and single-binary deployments.
//!
//! Segments are shared by name through a `MemoryLogRegistry`, mirroring how
//! named OS objects are shared between processes. The registry is an explicit
//! object: two registries never see each other's logs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::config::{LogConfig, LogName};
use crate::error::LogError;
use crate::shared::{
    LENGTH_PREFIX_LEN, LogCursor, RecordSink, SharedLog, encoded_len, ensure_fits, framed_size,
};

#[derive(Debug)]
struct Segment {
    capacity: u64,
    data: RwLock<Vec<u8>>,
    writer: Mutex<()>,
    changes: Mutex<u64>,
    changed: Condvar,
}

impl Segment {
    fn new(capacity: u64) -> Self {
        Self {
            capacity,
            data: RwLock::new(Vec::new()),
            writer: Mutex::new(()),
            changes: Mutex::new(0),
            changed: Condvar::new(),
        }
    }

    fn pulse(&self) {
        let mut changes = self.changes.lock();
        *changes += 1;
        self.changed.notify_all();
    }
}

/// Registry of named in-process log segments.
#[derive(Debug)]
pub struct MemoryLogRegistry {
    config: LogConfig,
    segments: Mutex<HashMap<String, Arc<Segment>>>,
}

impl MemoryLogRegistry {
    pub fn new(config: LogConfig) -> Self {
        Self {
            config,
            segments: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Open (or create) the log called `name`.
    ///
    /// Every handle opened for the same name shares one segment but keeps its
    /// own closed flag.
    pub fn open(&self, name: &str) -> Result<MemoryLog, LogError> {
        let name = LogName::new(name)?;
        self.config.validate()?;

        let key = format!("{}.{}", self.config.namespace, name);
        let segment = self
            .segments
            .lock()
            .entry(key)
            .or_insert_with(|| {
                debug!(log = %name, capacity = self.config.capacity, "created in-memory log segment");
                Arc::new(Segment::new(self.config.capacity))
            })
            .clone();

        Ok(MemoryLog {
            name: name.as_str().to_string(),
            lock_timeout: self.config.lock_timeout,
            segment,
            closed: AtomicBool::new(false),
        })
    }
}

impl Default for MemoryLogRegistry {
    fn default() -> Self {
        Self::new(LogConfig::default())
    }
}

/// Handle to an in-process log segment.
#[derive(Debug)]
pub struct MemoryLog {
    name: String,
    lock_timeout: Duration,
    segment: Arc<Segment>,
    closed: AtomicBool,
}

impl MemoryLog {
    fn ensure_open(&self) -> Result<(), LogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Bytes written so far (excluding the unwritten tail).
    pub fn len_bytes(&self) -> u64 {
        self.segment.data.read().len() as u64
    }

    pub fn capacity(&self) -> u64 {
        self.segment.capacity
    }
}

struct MemorySink<'a> {
    log: &'a MemoryLog,
}

impl MemorySink<'_> {
    fn write_framed(data: &mut Vec<u8>, record: &[u8], len: u32) -> u64 {
        let offset = data.len() as u64;
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(record);
        offset
    }
}

impl RecordSink for MemorySink<'_> {
    fn append(&mut self, record: &[u8]) -> Result<u64, LogError> {
        let name = &self.log.name;
        let segment = &self.log.segment;
        let len = encoded_len(name, record)?;

        let offset = {
            let mut data = segment.data.write();
            ensure_fits(
                name,
                data.len() as u64,
                LENGTH_PREFIX_LEN + u64::from(len),
                segment.capacity,
            )?;
            Self::write_framed(&mut data, record, len)
        };

        segment.pulse();
        debug!(log = %name, offset, len, "appended record");
        Ok(offset)
    }

    fn append_all(&mut self, records: &[Vec<u8>]) -> Result<Vec<u64>, LogError> {
        let name = &self.log.name;
        let segment = &self.log.segment;
        let needed = framed_size(name, records)?;

        let offsets = {
            let mut data = segment.data.write();
            ensure_fits(name, data.len() as u64, needed, segment.capacity)?;
            records
                .iter()
                .map(|r| Self::write_framed(&mut data, r, r.len() as u32))
                .collect::<Vec<_>>()
        };

        for _ in &offsets {
            segment.pulse();
        }
        debug!(log = %name, count = offsets.len(), bytes = needed, "appended records");
        Ok(offsets)
    }
}

impl SharedLog for MemoryLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_next(&self, cursor: &mut LogCursor) -> Result<Option<Vec<u8>>, LogError> {
        self.ensure_open()?;

        let data = self.segment.data.read();
        let start = cursor.offset() as usize;
        let Some(prefix) = data.get(start..start + LENGTH_PREFIX_LEN as usize) else {
            return Ok(None);
        };

        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if len == 0 {
            return Ok(None);
        }

        let body = start + LENGTH_PREFIX_LEN as usize;
        let record = data
            .get(body..body + len)
            .ok_or_else(|| LogError::corrupt(&self.name, cursor.offset(), "record overruns written data"))?
            .to_vec();

        cursor.advance_to((body + len) as u64);
        Ok(Some(record))
    }

    fn exclusive<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn RecordSink) -> Result<R, E>,
        E: From<LogError>,
    {
        self.ensure_open()?;

        // A holder that panicked released the guard while unwinding, so the
        // lock is never left abandoned.
        let _guard = self
            .segment
            .writer
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| LogError::LockTimeout {
                log: self.name.clone(),
                waited: self.lock_timeout,
            })?;

        self.ensure_open()?;
        let mut sink = MemorySink { log: self };
        f(&mut sink)
    }

    fn generation(&self) -> Result<u64, LogError> {
        self.ensure_open()?;
        Ok(*self.segment.changes.lock())
    }

    fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64, LogError> {
        self.ensure_open()?;
        let mut changes = self.segment.changes.lock();
        self.segment
            .changed
            .wait_while_for(&mut changes, |current| *current == seen, timeout);
        Ok(*changes)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(log = %self.name, "closed in-memory log handle");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
