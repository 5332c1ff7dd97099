//! Hot reload watcher
//!
//! A background task that converges the registry to what is on disk. It
//! ticks at a fixed poll interval; filesystem notifications only pull the
//! next tick forward. Each tick decides purely by `(path, mtime)`, so a
//! missed or spurious notification is harmless.

use crate::manager::{ManagerError, PluginManager, WeakManager};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

/// Configuration for the hot reload watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Interval between convergence ticks
    pub poll_interval: Duration,
    /// Quiet period after a filesystem notification before an early tick
    pub debounce: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            debounce: Duration::from_millis(200),
        }
    }
}

/// Handle to a running reload task
pub struct HotReloadWatcher {
    _watcher: Option<RecommendedWatcher>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<Result<(), ManagerError>>,
}

impl HotReloadWatcher {
    /// Spawn the reload task for `manager` on the current tokio runtime.
    ///
    /// The task holds only a weak handle; it ends on its own once every
    /// manager handle is dropped.
    pub fn start(
        manager: &PluginManager,
        roots: &[PathBuf],
        config: WatcherConfig,
    ) -> Result<Self, WatcherError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(WatcherError::NoRuntime)?;
        let WatcherConfig {
            poll_interval,
            debounce,
        } = config;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        // Capacity 1: bursts of notifications coalesce into one nudge
        let (nudge_tx, mut nudge_rx) = mpsc::channel::<()>(1);

        let watcher = Self::watch_roots(roots, nudge_tx);

        let span = manager.span().clone();
        let manager = manager.downgrade();
        let task = runtime.spawn(
            async move {
                let mut ticker = tokio::time::interval(poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The first tick fires immediately; load_all has just converged
                ticker.tick().await;

                let mut debounce_deadline: Option<Instant> = None;

                loop {
                    let deadline = debounce_deadline;
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            tracing::info!("Hot reload watcher shutting down");
                            break;
                        }

                        _ = ticker.tick() => {
                            debounce_deadline = None;
                            if !Self::tick(&manager).await? {
                                break;
                            }
                        }

                        Some(()) = nudge_rx.recv() => {
                            debounce_deadline = Some(Instant::now() + debounce);
                        }

                        _ = async move {
                            match deadline {
                                Some(deadline) => tokio::time::sleep_until(deadline).await,
                                None => std::future::pending::<()>().await,
                            }
                        } => {
                            debounce_deadline = None;
                            if !Self::tick(&manager).await? {
                                break;
                            }
                            ticker.reset();
                        }
                    }
                }

                Ok::<(), ManagerError>(())
            }
            .instrument(span),
        );

        tracing::info!(
            roots = roots.len(),
            poll_interval = ?poll_interval,
            notify = watcher.is_some(),
            "Hot reload watcher started"
        );

        Ok(Self {
            _watcher: watcher,
            shutdown_tx,
            task,
        })
    }

    /// Filesystem notifications for the roots. Failure degrades to polling.
    fn watch_roots(roots: &[PathBuf], nudge_tx: mpsc::Sender<()>) -> Option<RecommendedWatcher> {
        let mut watcher = match notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if res.is_ok() {
                let _ = nudge_tx.try_send(());
            }
        }) {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::warn!(error = %e, "Filesystem notifications unavailable, polling only");
                return None;
            }
        };

        for root in roots {
            if !root.is_dir() {
                tracing::warn!(dir = %root.display(), "Plugin root does not exist, not watching");
                continue;
            }
            match watcher.watch(root, RecursiveMode::Recursive) {
                Ok(()) => tracing::debug!(dir = %root.display(), "Watching plugin root"),
                Err(e) => tracing::warn!(dir = %root.display(), error = %e, "Failed to watch plugin root"),
            }
        }

        Some(watcher)
    }

    /// One convergence pass. Per-unit failures are already logged by the
    /// manager, and a tick that finds a load in progress is skipped. Only a
    /// fatal error ends the watcher. `Ok(false)` once the manager is gone.
    async fn tick(manager: &WeakManager) -> Result<bool, ManagerError> {
        let Some(manager) = manager.upgrade() else {
            tracing::debug!("Plugin manager dropped, stopping watcher");
            return Ok(false);
        };
        match manager.converge().await {
            Ok(None) => Ok(true),
            Ok(Some(report)) => {
                if report.has_changes() {
                    tracing::info!(
                        loaded = ?report.loaded,
                        removed = ?report.removed,
                        failures = report.failures.len(),
                        "Plugins reloaded"
                    );
                }
                Ok(true)
            }
            Err(e) => {
                tracing::error!(error = %e, "Reload tick failed, stopping watcher");
                Err(e)
            }
        }
    }

    /// Whether the task is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Ask the task to stop and wait for the current tick to finish
    pub async fn shutdown(self) -> Result<(), ManagerError> {
        let _ = self.shutdown_tx.send(()).await;
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ManagerError::WatcherPanicked(e.to_string())),
        }
    }
}

/// Errors that can occur while starting the watcher
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("No tokio runtime to run the watcher on: {0}")]
    NoRuntime(#[source] tokio::runtime::TryCurrentError),
}
