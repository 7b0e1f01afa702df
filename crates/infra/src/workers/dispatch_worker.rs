use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use leaselog_core::DispatcherId;
use leaselog_events::Subscription;

use crate::config::DEFAULT_LEASE_TIMEOUT;
use crate::dispatch::{Batch, DispatchLeaseManager};
use crate::event_store::StoredEvent;
use crate::notify::Notification;

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchWorkerConfig {
    pub batch_size: usize,
    /// Wait between polls when the dispatcher is caught up.
    pub idle_tick: Duration,
    /// Must match the lease manager's timeout: after a handler failure the
    /// worker waits this long for the failed lease to expire.
    pub lease_timeout: Duration,
}

impl Default for DispatchWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_tick: Duration::from_millis(250),
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }
}

/// Background consumer for one dispatcher.
///
/// - Leases batches and hands each event to the handler, in order
/// - Acknowledges every handled event
/// - On handler failure abandons the batch; the lease expires and the
///   unacknowledged rest is re-issued (at-least-once)
#[derive(Debug)]
pub struct DispatchWorker;

impl DispatchWorker {
    /// Spawn a worker thread.
    ///
    /// - `wake`: optional notification subscription used to cut idle waits short
    /// - `handler`: must be idempotent (events may be delivered more than once)
    pub fn spawn<M, H>(
        name: &str,
        leases: M,
        dispatcher: DispatcherId,
        config: DispatchWorkerConfig,
        wake: Option<Subscription<Notification>>,
        mut handler: H,
    ) -> std::io::Result<WorkerHandle>
    where
        M: DispatchLeaseManager + 'static,
        H: FnMut(&StoredEvent) -> anyhow::Result<()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let worker = Worker {
            name: name.to_string(),
            leases,
            dispatcher,
            config,
            wake,
            shutdown_rx,
        };

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker.run(&mut handler))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

struct Worker<M> {
    name: String,
    leases: M,
    dispatcher: DispatcherId,
    config: DispatchWorkerConfig,
    wake: Option<Subscription<Notification>>,
    shutdown_rx: mpsc::Receiver<()>,
}

enum BatchOutcome {
    Done,
    Failed,
}

impl<M: DispatchLeaseManager> Worker<M> {
    fn shutdown_requested(&self) -> bool {
        match self.shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => true,
            Err(mpsc::TryRecvError::Empty) => false,
        }
    }

    fn run<H>(&self, handler: &mut H)
    where
        H: FnMut(&StoredEvent) -> anyhow::Result<()>,
    {
        let mut paused_until: Option<Instant> = None;

        loop {
            if self.shutdown_requested() {
                break;
            }

            if let Some(until) = paused_until {
                if Instant::now() < until {
                    thread::sleep(self.config.idle_tick.min(until - Instant::now()));
                    continue;
                }
                paused_until = None;
            }

            match self
                .leases
                .get_next_undispatched_batch(&self.dispatcher, self.config.batch_size)
            {
                Ok(Some(batch)) => {
                    if let BatchOutcome::Failed = self.process(&batch, handler) {
                        paused_until = Some(Instant::now() + self.config.lease_timeout);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(worker = %self.name, dispatcher = %self.dispatcher, error = %err, "failed to lease batch");
                }
            }

            self.idle();
        }
        debug!(worker = %self.name, "dispatch worker stopped");
    }

    fn process<H>(&self, batch: &Batch, handler: &mut H) -> BatchOutcome
    where
        H: FnMut(&StoredEvent) -> anyhow::Result<()>,
    {
        for event in &batch.events {
            if let Err(err) = handler(event) {
                warn!(
                    worker = %self.name,
                    batch_id = batch.id,
                    sequence_number = event.sequence_number,
                    error = ?err,
                    "dispatch handler failed; batch abandoned until its lease expires"
                );
                return BatchOutcome::Failed;
            }

            if let Err(err) = self
                .leases
                .mark_event_as_dispatched(&self.dispatcher, event.sequence_number)
            {
                warn!(
                    worker = %self.name,
                    batch_id = batch.id,
                    sequence_number = event.sequence_number,
                    error = %err,
                    "failed to acknowledge event"
                );
                return BatchOutcome::Failed;
            }
        }

        debug!(worker = %self.name, batch_id = batch.id, size = batch.size, "batch dispatched");
        BatchOutcome::Done
    }

    fn idle(&self) {
        match &self.wake {
            Some(sub) => {
                if sub.recv_timeout(self.config.idle_tick).is_ok() {
                    // Coalesce: one lease attempt covers every queued hint.
                    sub.drain();
                }
            }
            None => thread::sleep(self.config.idle_tick),
        }
    }
}
