use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    ConfigChanged,
    ModulesChanged,
}

impl ChangeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigChanged => "config_changed",
            Self::ModulesChanged => "modules_changed",
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type Watcher = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// Polls the store's revision counters and broadcasts changes.
///
/// Notification is coalesced: any number of writes between two ticks yields
/// at most one event per counter, and the reload signal holds a single
/// pending slot. Consumers get at-least-once, not once-per-write.
pub struct ChangeNotifier {
    db: Arc<Db>,
    interval: Duration,
    watchers: RwLock<Vec<Watcher>>,
    config_version: AtomicI64,
    module_revision: AtomicI64,
    reload_tx: mpsc::Sender<()>,
    reload_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ChangeNotifier {
    /// Create a notifier whose baseline is the store's current state, so
    /// pre-existing rows do not count as changes.
    pub fn new(db: Arc<Db>, interval: Duration) -> Self {
        let config_version = db.max_config_version().unwrap_or(0);
        let module_revision = db.module_revision().unwrap_or(0);
        let (reload_tx, reload_rx) = mpsc::channel(1);
        Self {
            db,
            interval,
            watchers: RwLock::new(Vec::new()),
            config_version: AtomicI64::new(config_version),
            module_revision: AtomicI64::new(module_revision),
            reload_tx,
            reload_rx: Mutex::new(Some(reload_rx)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Register a callback run on every detected change. Callbacks run off
    /// the polling loop, so a slow one never delays the next tick.
    pub fn on_change<F>(&self, f: F)
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        self.watchers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(f));
    }

    /// The single-slot reload signal. Handed out once.
    pub fn take_reload_signal(&self) -> Option<mpsc::Receiver<()>> {
        self.reload_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// One CheckVersion step: compare both counters with the last seen
    /// values and notify for each that moved.
    pub fn poll_once(&self) -> Result<Vec<ChangeEvent>> {
        let config_version = self.db.max_config_version()?;
        let module_revision = self.db.module_revision()?;

        let mut changed = Vec::new();
        if self.config_version.swap(config_version, Ordering::SeqCst) != config_version {
            changed.push(ChangeEvent::ConfigChanged);
        }
        if self.module_revision.swap(module_revision, Ordering::SeqCst) != module_revision {
            changed.push(ChangeEvent::ModulesChanged);
        }

        if !changed.is_empty() {
            for event in &changed {
                self.notify(*event);
            }
            // Full slot means a reload is already pending.
            let _ = self.reload_tx.try_send(());
        }
        Ok(changed)
    }

    fn notify(&self, event: ChangeEvent) {
        let watchers: Vec<Watcher> = self
            .watchers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        debug!("{event}: notifying {} watcher(s)", watchers.len());
        for watcher in watchers {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || watcher(event));
                }
                Err(_) => {
                    std::thread::spawn(move || watcher(event));
                }
            }
        }
    }

    /// Poll until `cancel` fires. Read failures are retried on the next tick.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_once() {
                        Ok(changed) if !changed.is_empty() => {
                            debug!("change notifier: {changed:?}");
                        }
                        Ok(_) => {}
                        Err(e) => debug!("change notifier tick failed, retrying: {e:#}"),
                    }
                }
            }
        }
        info!("change notifier stopped");
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(cancel))
    }
}
