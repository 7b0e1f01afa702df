//! Wiring of the event store, lease manager and notifier over one set of logs.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use leaselog_core::{ConfigError, DispatcherId};
use leaselog_events::Subscription;
use leaselog_log::{LogError, MemoryLog, MemoryLogRegistry, MmapLog, SharedLog};

use crate::config::StoreConfig;
use crate::dispatch::{DispatchError, LogDispatchLeaseManager};
use crate::event_store::{EventStoreError, LogEventStore, StoredEvent};
use crate::notify::{LogNotificationService, Notification, NotificationService, NotifyError};
use crate::workers::{DispatchWorker, DispatchWorkerConfig, WorkerHandle};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),
}

pub type SharedStore<L> = Arc<LogEventStore<L>>;
pub type SharedLeases<L> = Arc<LogDispatchLeaseManager<SharedStore<L>, L>>;

/// One deployment's event store and lease manager, opened from a `StoreConfig`.
#[derive(Debug)]
pub struct Storage<L> {
    config: StoreConfig,
    events_log: L,
    leases_log: L,
    store: SharedStore<L>,
    leases: SharedLeases<L>,
}

impl Storage<Arc<MemoryLog>> {
    /// Open in-process logs from `registry`. The registry's log settings apply.
    pub fn open_in_memory(
        registry: &MemoryLogRegistry,
        config: StoreConfig,
    ) -> Result<Self, StorageError> {
        config.validate()?;
        let events = Arc::new(registry.open(&config.events_log)?);
        let leases = Arc::new(registry.open(&config.leases_log)?);
        let watermarks = Arc::new(registry.open(&config.watermarks_log)?);
        Self::assemble(config, events, leases, watermarks)
    }
}

impl Storage<Arc<MmapLog>> {
    /// Open (or create) the memory-mapped logs under `config.log.directory`.
    pub fn open_mapped(config: StoreConfig) -> Result<Self, StorageError> {
        config.validate()?;
        let events = Arc::new(MmapLog::open(&config.log, &config.events_log)?);
        let leases = Arc::new(MmapLog::open(&config.log, &config.leases_log)?);
        let watermarks = Arc::new(MmapLog::open(&config.log, &config.watermarks_log)?);
        info!(
            directory = %config.log.directory.display(),
            namespace = %config.log.namespace,
            "opened mapped storage"
        );
        Self::assemble(config, events, leases, watermarks)
    }
}

impl<L> Storage<L>
where
    L: SharedLog + Clone + 'static,
{
    fn assemble(
        config: StoreConfig,
        events_log: L,
        leases_log: L,
        watermarks_log: L,
    ) -> Result<Self, StorageError> {
        let store = Arc::new(LogEventStore::new(events_log.clone())?);
        let leases = Arc::new(LogDispatchLeaseManager::new(
            store.clone(),
            leases_log.clone(),
            watermarks_log,
            &config,
        )?);
        Ok(Self {
            config,
            events_log,
            leases_log,
            store,
            leases,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn store(&self) -> &SharedStore<L> {
        &self.store
    }

    pub fn leases(&self) -> &SharedLeases<L> {
        &self.leases
    }

    /// Start a notification service over this storage's logs.
    pub fn notifications(&self, tick: Duration) -> Result<LogNotificationService, StorageError> {
        Ok(LogNotificationService::start(
            self.events_log.clone(),
            self.leases_log.clone(),
            tick,
        )?)
    }

    /// Spawn a dispatch worker for `dispatcher`, woken early by `notifier` if given.
    pub fn spawn_worker<H>(
        &self,
        name: &str,
        dispatcher: DispatcherId,
        batch_size: usize,
        notifier: Option<&LogNotificationService>,
        handler: H,
    ) -> Result<WorkerHandle, StorageError>
    where
        H: FnMut(&StoredEvent) -> anyhow::Result<()> + Send + 'static,
    {
        self.config.check_dispatcher(&dispatcher)?;
        let wake: Option<Subscription<Notification>> = notifier
            .map(|n| n.subscribe(dispatcher.clone()))
            .transpose()?;
        let config = DispatchWorkerConfig {
            batch_size,
            lease_timeout: self.config.lease_timeout,
            ..DispatchWorkerConfig::default()
        };

        DispatchWorker::spawn(name, self.leases.clone(), dispatcher, config, wake, handler)
            .map_err(StorageError::Spawn)
    }
}
