//! Cross-process shared log backed by a memory-mapped file.
//!
//! Named objects, all under `<directory>/<namespace>.<name>`:
//!
//! - `.log`: fixed-size region, a 16 byte header followed by the records.
//! - `.lock`: sidecar file locked with `flock` as the named writer mutex.
//!
//! Header layout:
//!
//! ```text
//! [magic: u32 LE][reserved: u32][change counter: u64, native atomic]
//! ```
//!
//! The change counter is the named change signal: writers bump it after each
//! append and listeners poll it.
//!
//! A writer copies every payload of a batch, the length prefixes of all but
//! the first record, and a zero terminator after the batch. It then issues a
//! release fence and stores the first length prefix. A reader that sees a
//! non-zero length therefore also sees the whole batch; a zero length is
//! simply "not yet". A writer that dies mid-batch leaves nothing visible.
//!
//! While holding the lock the writer records its pid in the lock file and
//! truncates it on release. A non-empty lock file found on acquisition means
//! the previous holder died mid-write; the lock is granted anyway (the OS
//! released it with the process) and the recovery is logged.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering, fence};
use std::time::{Duration, Instant};

use fs2::FileExt;
use memmap2::MmapRaw;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{LogConfig, LogName};
use crate::error::LogError;
use crate::shared::{
    LENGTH_PREFIX_LEN, LogCursor, RecordSink, SharedLog, encoded_len, ensure_fits, framed_size,
};

const MAGIC: u32 = 0x474F_4C4C;
const HEADER_LEN: u64 = 16;
const CHANGE_COUNTER_OFFSET: usize = 8;

#[derive(Debug)]
struct WriterState {
    lock_file: Option<File>,
    /// Last known end of data; the writer scans forward from here.
    end_hint: u64,
}

/// Handle to a memory-mapped log shared between processes.
#[derive(Debug)]
pub struct MmapLog {
    name: String,
    data_path: PathBuf,
    capacity: u64,
    lock_timeout: Duration,
    poll_interval: Duration,
    flush_on_append: bool,
    region: RwLock<Option<MmapRaw>>,
    writer: Mutex<WriterState>,
    closed: AtomicBool,
}

impl MmapLog {
    /// Open the log called `name`, creating its region and lock files if needed.
    pub fn open(config: &LogConfig, name: &str) -> Result<Self, LogError> {
        let log_name = LogName::new(name)?;
        config.validate()?;
        let name = log_name.as_str().to_string();

        std::fs::create_dir_all(&config.directory).map_err(|e| LogError::io(&name, e))?;

        let stem = format!("{}.{}", config.namespace, log_name);
        let data_path = config.directory.join(format!("{stem}.log"));
        let lock_path = config.directory.join(format!("{stem}.lock"));

        let lock_file = open_rw(&lock_path).map_err(|e| LogError::io(&name, e))?;
        let data_file = open_rw(&data_path).map_err(|e| LogError::io(&name, e))?;

        // Size and stamp a fresh region under the writer lock so concurrent
        // creators agree on the header.
        {
            let deadline = Instant::now() + config.lock_timeout;
            let _held = FileLockGuard::acquire(&lock_file, &name, deadline, config.poll_interval)?;
            initialize_region(&data_file, &name, config.capacity)?;
        }

        // Raw mapping: other processes write into it concurrently.
        let region = MmapRaw::map_raw(&data_file).map_err(|e| LogError::io(&name, e))?;
        if (region.len() as u64) < HEADER_LEN + LENGTH_PREFIX_LEN {
            return Err(LogError::corrupt(&name, 0, "region smaller than header"));
        }

        // SAFETY: the region is at least HEADER_LEN bytes long.
        let magic = unsafe { std::ptr::read_volatile(region.as_ptr() as *const [u8; 4]) };
        if u32::from_le_bytes(magic) != MAGIC {
            return Err(LogError::corrupt(&name, 0, "bad magic; not a leaselog region"));
        }

        let capacity = region.len() as u64 - HEADER_LEN;
        if capacity != config.capacity {
            warn!(
                log = %name,
                existing = capacity,
                configured = config.capacity,
                "log already exists with a different capacity; using existing size"
            );
        }

        debug!(log = %name, path = %data_path.display(), capacity, "opened mapped log");

        Ok(Self {
            name,
            data_path,
            capacity,
            lock_timeout: config.lock_timeout,
            poll_interval: config.poll_interval,
            flush_on_append: config.flush_on_append,
            region: RwLock::new(Some(region)),
            writer: Mutex::new(WriterState {
                lock_file: Some(lock_file),
                end_hint: 0,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.data_path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn ensure_open(&self) -> Result<(), LogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn change_counter(region: &MmapRaw) -> &AtomicU64 {
        // SAFETY: the header is page aligned and CHANGE_COUNTER_OFFSET is a
        // multiple of 8, so the pointer is valid and aligned for an AtomicU64
        // for as long as the mapping lives.
        unsafe { AtomicU64::from_ptr(region.as_mut_ptr().add(CHANGE_COUNTER_OFFSET) as *mut u64) }
    }

    /// Length prefix stored at data offset `offset`; 0 means "no record yet".
    fn load_len(region: &MmapRaw, offset: u64) -> u32 {
        // SAFETY: callers check `offset + LENGTH_PREFIX_LEN <= capacity`.
        let bytes = unsafe {
            std::ptr::read_volatile(
                region.as_ptr().add((HEADER_LEN + offset) as usize) as *const [u8; 4]
            )
        };
        fence(Ordering::Acquire);
        u32::from_le_bytes(bytes)
    }

    /// Find the end of written data, starting from a known record boundary.
    fn scan_end(&self, region: &MmapRaw, mut offset: u64) -> Result<u64, LogError> {
        while offset + LENGTH_PREFIX_LEN <= self.capacity {
            let len = u64::from(Self::load_len(region, offset));
            if len == 0 {
                break;
            }
            if offset + LENGTH_PREFIX_LEN + len > self.capacity {
                return Err(LogError::corrupt(&self.name, offset, "record overruns region"));
            }
            offset += LENGTH_PREFIX_LEN + len;
        }
        Ok(offset)
    }
}

struct MmapSink<'a> {
    log: &'a MmapLog,
    region: &'a MmapRaw,
    end: u64,
}

impl MmapSink<'_> {
    /// Write `records` after the current end and publish them as one unit.
    ///
    /// Callers have checked that every record is non-empty, fits a `u32`
    /// length, and that the whole batch fits the region.
    fn publish(&mut self, records: &[&[u8]]) -> Result<Vec<u64>, LogError> {
        let Some(first) = records.first() else {
            return Ok(Vec::new());
        };

        let batch_start = self.end;
        let base = self.region.as_mut_ptr();
        let mut offsets = Vec::with_capacity(records.len());
        let mut end = batch_start;

        for record in records {
            let start = (HEADER_LEN + end) as usize;
            // SAFETY: `ensure_fits` checked that the framed batch lies inside
            // the region, and the writer lock guarantees no other writer
            // touches it. Nothing at or after `batch_start` is visible yet.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    record.as_ptr(),
                    base.add(start + LENGTH_PREFIX_LEN as usize),
                    record.len(),
                );
                if end != batch_start {
                    std::ptr::write_volatile(
                        base.add(start) as *mut [u8; 4],
                        (record.len() as u32).to_le_bytes(),
                    );
                }
            }
            offsets.push(end);
            end += LENGTH_PREFIX_LEN + record.len() as u64;
        }

        // Bytes past the batch may be left over from a writer that died
        // before publishing; terminate the batch explicitly.
        let terminated = end + LENGTH_PREFIX_LEN <= self.log.capacity;
        if terminated {
            // SAFETY: bounds checked on the line above.
            unsafe {
                std::ptr::write_volatile(
                    base.add((HEADER_LEN + end) as usize) as *mut [u8; 4],
                    [0u8; 4],
                );
            }
        }

        fence(Ordering::Release);
        // SAFETY: `batch_start` is the first framed slot checked by `ensure_fits`.
        unsafe {
            std::ptr::write_volatile(
                base.add((HEADER_LEN + batch_start) as usize) as *mut [u8; 4],
                (first.len() as u32).to_le_bytes(),
            );
        }

        if self.log.flush_on_append {
            let tail = if terminated { LENGTH_PREFIX_LEN } else { 0 };
            self.region
                .flush_range(
                    (HEADER_LEN + batch_start) as usize,
                    (end - batch_start + tail) as usize,
                )
                .map_err(|e| LogError::io(&self.log.name, e))?;
        }

        self.end = end;
        MmapLog::change_counter(self.region).fetch_add(records.len() as u64, Ordering::AcqRel);
        Ok(offsets)
    }
}

impl RecordSink for MmapSink<'_> {
    fn append(&mut self, record: &[u8]) -> Result<u64, LogError> {
        let len = encoded_len(&self.log.name, record)?;
        ensure_fits(
            &self.log.name,
            self.end,
            LENGTH_PREFIX_LEN + u64::from(len),
            self.log.capacity,
        )?;
        let offset = self.publish(&[record])?[0];
        debug!(log = %self.log.name, offset, len, "appended record");
        Ok(offset)
    }

    fn append_all(&mut self, records: &[Vec<u8>]) -> Result<Vec<u64>, LogError> {
        let needed = framed_size(&self.log.name, records)?;
        ensure_fits(&self.log.name, self.end, needed, self.log.capacity)?;

        let slices: Vec<&[u8]> = records.iter().map(Vec::as_slice).collect();
        let offsets = self.publish(&slices)?;
        debug!(log = %self.log.name, count = offsets.len(), bytes = needed, "appended records");
        Ok(offsets)
    }
}

impl SharedLog for MmapLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_next(&self, cursor: &mut LogCursor) -> Result<Option<Vec<u8>>, LogError> {
        self.ensure_open()?;
        let region = self.region.read();
        let region = region.as_ref().ok_or_else(|| LogError::Closed(self.name.clone()))?;

        let offset = cursor.offset();
        if offset + LENGTH_PREFIX_LEN > self.capacity {
            return Ok(None);
        }

        let len = Self::load_len(region, offset);
        if len == 0 {
            return Ok(None);
        }

        let body = offset + LENGTH_PREFIX_LEN;
        if body + u64::from(len) > self.capacity {
            return Err(LogError::corrupt(&self.name, offset, "record overruns region"));
        }

        let mut record = vec![0u8; len as usize];
        // SAFETY: bounds checked above; the payload was published before its
        // length prefix, which the acquire fence in `load_len` orders after.
        unsafe {
            std::ptr::copy_nonoverlapping(
                region.as_ptr().add((HEADER_LEN + body) as usize),
                record.as_mut_ptr(),
                record.len(),
            );
        }

        cursor.advance_to(body + u64::from(len));
        Ok(Some(record))
    }

    fn exclusive<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut dyn RecordSink) -> Result<R, E>,
        E: From<LogError>,
    {
        self.ensure_open()?;
        let deadline = Instant::now() + self.lock_timeout;

        let mut writer = self
            .writer
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| LogError::LockTimeout {
                log: self.name.clone(),
                waited: self.lock_timeout,
            })?;
        let state = &mut *writer;
        let lock_file = state
            .lock_file
            .as_ref()
            .ok_or_else(|| LogError::Closed(self.name.clone()))?;

        let _held = FileLockGuard::acquire(lock_file, &self.name, deadline, self.poll_interval)?;

        let region = self.region.read();
        let region = region
            .as_ref()
            .ok_or_else(|| LogError::Closed(self.name.clone()))?;

        let end = self.scan_end(region, state.end_hint)?;
        let mut sink = MmapSink {
            log: self,
            region,
            end,
        };
        let result = f(&mut sink);
        state.end_hint = sink.end;
        result
    }

    fn generation(&self) -> Result<u64, LogError> {
        self.ensure_open()?;
        let region = self.region.read();
        let region = region
            .as_ref()
            .ok_or_else(|| LogError::Closed(self.name.clone()))?;
        Ok(Self::change_counter(region).load(Ordering::Acquire))
    }

    fn wait_for_change(&self, seen: u64, timeout: Duration) -> Result<u64, LogError> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.generation()?;
            let now = Instant::now();
            if current != seen || now >= deadline {
                return Ok(current);
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Waits for an in-flight append to finish before unmapping.
        self.writer.lock().lock_file.take();
        if let Some(region) = self.region.write().take() {
            if let Err(e) = region.flush() {
                warn!(log = %self.name, error = %e, "flush on close failed");
            }
        }
        debug!(log = %self.name, "closed mapped log");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for MmapLog {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_rw(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn initialize_region(file: &File, name: &str, capacity: u64) -> Result<(), LogError> {
    let len = file.metadata().map_err(|e| LogError::io(name, e))?.len();
    if len != 0 {
        return Ok(());
    }

    file.set_len(HEADER_LEN + capacity)
        .map_err(|e| LogError::io(name, e))?;
    let mut handle = file;
    handle
        .seek(SeekFrom::Start(0))
        .and_then(|_| handle.write_all(&MAGIC.to_le_bytes()))
        .and_then(|_| handle.sync_all())
        .map_err(|e| LogError::io(name, e))?;

    info!(log = %name, capacity, "created mapped log region");
    Ok(())
}

/// Exclusive `flock` on the sidecar lock file, released on drop.
struct FileLockGuard<'a> {
    file: &'a File,
    name: &'a str,
}

impl<'a> FileLockGuard<'a> {
    fn acquire(
        file: &'a File,
        name: &'a str,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Result<Self, LogError> {
        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(LogError::LockTimeout {
                            log: name.to_string(),
                            waited: now - started,
                        });
                    }
                    std::thread::sleep(poll_interval.min(deadline - now));
                }
                Err(e) => return Err(LogError::io(name, e)),
            }
        }

        let guard = Self { file, name };
        guard.claim()?;
        Ok(guard)
    }

    /// Record ourselves as holder, reporting a holder that never released.
    fn claim(&self) -> Result<(), LogError> {
        let mut handle = self.file;
        let mut previous = String::new();
        handle
            .seek(SeekFrom::Start(0))
            .and_then(|_| handle.read_to_string(&mut previous))
            .map_err(|e| LogError::io(self.name, e))?;

        if !previous.is_empty() {
            warn!(
                log = %self.name,
                previous_holder = %previous.trim(),
                "recovered writer lock abandoned by a crashed holder"
            );
        }

        handle
            .set_len(0)
            .and_then(|_| handle.seek(SeekFrom::Start(0)))
            .and_then(|_| handle.write_all(std::process::id().to_string().as_bytes()))
            .map_err(|e| LogError::io(self.name, e))?;
        Ok(())
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            warn!(log = %self.name, error = %e, "failed to clear lock holder marker");
        }
        if let Err(e) = FileExt::unlock(self.file) {
            warn!(log = %self.name, error = %e, "failed to release writer lock");
        }
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
