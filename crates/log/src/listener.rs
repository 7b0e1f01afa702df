use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::LogError;
use crate::shared::SharedLog;

/// Background thread that raises a callback whenever a log's change counter moves.
///
/// Wake-ups are coalesced: one callback may cover several appends, so the
/// callback must re-read whatever state it cares about.
#[derive(Debug)]
pub struct ChangeListener {
    name: String,
    shutdown: Option<mpsc::Sender<()>>,
    join: Option<thread::JoinHandle<()>>,
}

impl ChangeListener {
    /// Spawn a listener on `log`, checking for shutdown at least every `tick`.
    pub fn spawn<L, F>(
        name: impl Into<String>,
        log: L,
        tick: Duration,
        on_change: F,
    ) -> Result<Self, LogError>
    where
        L: SharedLog + 'static,
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let seen = log.generation()?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let thread_name = format!("leaselog-{name}");
        let loop_name = name.clone();
        let join = thread::Builder::new()
            .name(thread_name)
            .spawn(move || listen_loop(&loop_name, log, seen, tick, shutdown_rx, on_change))
            .map_err(|e| LogError::io(&name, e))?;

        debug!(listener = %name, "change listener started");
        Ok(Self {
            name,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request shutdown and wait for the thread to exit.
    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                warn!(listener = %self.name, "change listener callback panicked");
            }
        }
    }
}

impl Drop for ChangeListener {
    fn drop(&mut self) {
        self.halt();
    }
}

fn listen_loop<L, F>(
    name: &str,
    log: L,
    mut seen: u64,
    tick: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    mut on_change: F,
) where
    L: SharedLog,
    F: FnMut(),
{
    loop {
        match shutdown_rx.try_recv() {
            Ok(()) | Err(mpsc::TryRecvError::Disconnected) => break,
            Err(mpsc::TryRecvError::Empty) => {}
        }

        match log.wait_for_change(seen, tick) {
            Ok(current) if current != seen => {
                seen = current;
                on_change();
            }
            Ok(_) => continue,
            Err(LogError::Closed(_)) => break,
            Err(err) => {
                warn!(listener = name, error = %err, "change listener failed to poll log");
                thread::sleep(tick);
            }
        }
    }
    debug!(listener = name, "change listener stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use super::*;
    use crate::memory::MemoryLogRegistry;

    #[test]
    fn callback_runs_after_append() {
        let registry = MemoryLogRegistry::default();
        let log = Arc::new(registry.open("Watched").unwrap());
        let hits = Arc::new(AtomicUsize::new(0));

        let listener = {
            let hits = hits.clone();
            ChangeListener::spawn("watched", log.clone(), Duration::from_millis(10), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };

        log.append(b"one").unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(hits.load(Ordering::SeqCst) >= 1);
        listener.stop();
    }

    #[test]
    fn quiet_log_never_fires() {
        let registry = MemoryLogRegistry::default();
        let log = Arc::new(registry.open("Quiet").unwrap());
        log.append(b"before").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let listener = {
            let hits = hits.clone();
            ChangeListener::spawn("quiet", log, Duration::from_millis(10), move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
        };
        thread::sleep(Duration::from_millis(60));
        drop(listener);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn closing_the_log_ends_the_thread() {
        let registry = MemoryLogRegistry::default();
        let log = Arc::new(registry.open("Closing").unwrap());
        let listener =
            ChangeListener::spawn("closing", log.clone(), Duration::from_millis(10), || {}).unwrap();
        log.close();
        listener.stop();
    }
}
