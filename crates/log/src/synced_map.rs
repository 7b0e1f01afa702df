//! Dictionary replicated through a shared log.
//!
//! Every participant keeps a private replica and a cursor into the same log.
//! Writes are appended as [`ChangeOp`] records under the writer lock; reads
//! first replay whatever change operations the replica has not seen yet.
//! Conflicting writes resolve by log order (last writer wins).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LogError;
use crate::listener::ChangeListener;
use crate::shared::{LogCursor, SharedLog};

/// One mutation of a synchronized dictionary, as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOp<K, V> {
    Create { key: K, value: V },
    Update { key: K, value: V },
    Delete { key: K },
    Clear,
}

/// Replayed contents of a synchronized dictionary.
#[derive(Debug)]
pub struct MapState<K, V> {
    entries: HashMap<K, V>,
    created: u64,
    cursor: LogCursor,
}

impl<K, V> MapState<K, V>
where
    K: Eq + Hash,
{
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            created: 0,
            cursor: LogCursor::start(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entries(&self) -> &HashMap<K, V> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of `Create` operations replayed so far, including ones whose
    /// keys were later deleted.
    pub fn created_count(&self) -> u64 {
        self.created
    }

    fn apply(&mut self, op: ChangeOp<K, V>) {
        match op {
            ChangeOp::Create { key, value } => {
                self.created += 1;
                self.entries.insert(key, value);
            }
            ChangeOp::Update { key, value } => {
                self.entries.insert(key, value);
            }
            ChangeOp::Delete { key } => {
                self.entries.remove(&key);
            }
            ChangeOp::Clear => self.entries.clear(),
        }
    }
}

/// Key/value dictionary whose replicas converge through a [`SharedLog`].
#[derive(Debug)]
pub struct SyncedMap<K, V, L> {
    log: L,
    state: Mutex<MapState<K, V>>,
}

impl<K, V, L> SyncedMap<K, V, L>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned,
    V: Clone + Serialize + DeserializeOwned,
    L: SharedLog,
{
    /// Attach to `log` and replay its existing change operations.
    pub fn new(log: L) -> Result<Self, LogError> {
        let map = Self {
            log,
            state: Mutex::new(MapState::new()),
        };
        map.sync()?;
        Ok(map)
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    /// Apply every change operation appended since the last read.
    pub fn sync(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        self.catch_up(&mut state)
    }

    fn catch_up(&self, state: &mut MapState<K, V>) -> Result<(), LogError> {
        loop {
            let offset = state.cursor.offset();
            let Some(record) = self.log.read_next(&mut state.cursor)? else {
                return Ok(());
            };
            let op: ChangeOp<K, V> = serde_json::from_slice(&record).map_err(|e| {
                LogError::corrupt(self.log.name(), offset, format!("undecodable change: {e}"))
            })?;
            state.apply(op);
        }
    }

    /// Run `f` against a freshly synchronized replica.
    pub fn read<R>(&self, f: impl FnOnce(&MapState<K, V>) -> R) -> Result<R, LogError> {
        let mut state = self.state.lock();
        self.catch_up(&mut state)?;
        Ok(f(&state))
    }

    /// Atomic read-decide-append step.
    ///
    /// `f` sees the replica caught up to the end of the log while the writer
    /// lock is held and pushes the change operations to append. The replica
    /// reflects them once this returns.
    pub fn update<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&MapState<K, V>, &mut Vec<ChangeOp<K, V>>) -> Result<R, E>,
        E: From<LogError>,
    {
        let mut state = self.state.lock();
        self.log.exclusive(|sink| {
            self.catch_up(&mut state)?;

            let mut ops = Vec::new();
            let out = f(&state, &mut ops)?;
            if ops.is_empty() {
                return Ok(out);
            }

            let records = ops
                .iter()
                .map(|op| serde_json::to_vec(op).map_err(|e| LogError::Codec(e.to_string())))
                .collect::<Result<Vec<_>, _>>()?;
            sink.append_all(&records)?;
            debug!(log = %self.log.name(), ops = records.len(), "appended change operations");

            self.catch_up(&mut state)?;
            Ok(out)
        })
    }

    fn write(&self, op: ChangeOp<K, V>) -> Result<(), LogError> {
        self.update(|_, ops| {
            ops.push(op);
            Ok(())
        })
    }

    pub fn get(&self, key: &K) -> Result<Option<V>, LogError> {
        self.read(|s| s.get(key).cloned())
    }

    pub fn contains_key(&self, key: &K) -> Result<bool, LogError> {
        self.read(|s| s.contains_key(key))
    }

    pub fn len(&self) -> Result<usize, LogError> {
        self.read(MapState::len)
    }

    pub fn is_empty(&self) -> Result<bool, LogError> {
        self.read(MapState::is_empty)
    }

    pub fn keys(&self) -> Result<Vec<K>, LogError> {
        self.read(|s| s.entries.keys().cloned().collect())
    }

    pub fn values(&self) -> Result<Vec<V>, LogError> {
        self.read(|s| s.entries.values().cloned().collect())
    }

    /// Snapshot of every key/value pair.
    pub fn entries(&self) -> Result<Vec<(K, V)>, LogError> {
        self.read(|s| {
            s.entries
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
    }

    pub fn created_count(&self) -> Result<u64, LogError> {
        self.read(MapState::created_count)
    }

    /// Insert a new entry. A duplicate key is recorded anyway and overwrites.
    pub fn add(&self, key: K, value: V) -> Result<(), LogError> {
        self.write(ChangeOp::Create { key, value })
    }

    /// Insert or replace an entry.
    pub fn set(&self, key: K, value: V) -> Result<(), LogError> {
        self.write(ChangeOp::Update { key, value })
    }

    /// Remove an entry; returns whether this replica held the key.
    pub fn remove(&self, key: K) -> Result<bool, LogError> {
        self.update(|state, ops| {
            let present = state.contains_key(&key);
            ops.push(ChangeOp::Delete { key });
            Ok(present)
        })
    }

    pub fn clear(&self) -> Result<(), LogError> {
        self.write(ChangeOp::Clear)
    }
}

impl<K, V, L> SyncedMap<K, V, L>
where
    L: SharedLog + Clone + 'static,
{
    /// Invoke `callback` from a background thread whenever the log changes.
    pub fn on_change<F>(&self, tick: Duration, callback: F) -> Result<ChangeListener, LogError>
    where
        F: FnMut() + Send + 'static,
    {
        ChangeListener::spawn(
            format!("map-{}", self.log.name()),
            self.log.clone(),
            tick,
            callback,
        )
    }
}
