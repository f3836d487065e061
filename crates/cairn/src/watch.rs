//! Debounced file watching that drives sync passes.
//!
//! [`WatchCoordinator`] runs a single `tokio::select!` loop over three inputs:
//! change events, the debounce deadline, and the pass currently in flight.
//! A relevant event starts or extends the debounce window; when it elapses
//! one pass runs. Events that arrive during a pass set a rerun flag, which
//! yields exactly one more (debounced) pass once the current one finishes.
//! Passes never overlap.

use crate::error::Result;
use crate::sync::{SyncEngine, SyncReport};
use async_trait::async_trait;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Debounce window used when none is configured.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// Capacity of the change event channel.
const EVENT_BUFFER: usize = 100;

/// Stream of changed paths feeding the coordinator.
pub type ChangeEvents = mpsc::Receiver<PathBuf>;

/// Something that runs one sync pass.
#[async_trait]
pub trait SyncPass: Send + Sync {
    /// Run a pass to completion.
    async fn execute(&self) -> Result<SyncReport>;
}

#[async_trait]
impl SyncPass for SyncEngine {
    async fn execute(&self) -> Result<SyncReport> {
        self.run_pass().await
    }
}

/// Counters returned when the watch loop ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    /// Passes run, including failed ones
    pub passes: usize,
    /// Relevant change events received
    pub events: usize,
    /// Passes that returned an error
    pub failed_passes: usize,
}

type PassFuture = Pin<Box<dyn Future<Output = Result<SyncReport>> + Send>>;

async fn finish(in_flight: &mut Option<PassFuture>) -> Result<SyncReport> {
    match in_flight {
        Some(pass) => pass.await,
        None => std::future::pending().await,
    }
}

/// Turns bursts of change events for one file into serialized sync passes.
pub struct WatchCoordinator {
    runner: Arc<dyn SyncPass>,
    path: PathBuf,
    debounce: Duration,
}

impl std::fmt::Debug for WatchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchCoordinator")
            .field("path", &self.path)
            .field("debounce", &self.debounce)
            .finish_non_exhaustive()
    }
}

impl WatchCoordinator {
    /// Coordinate passes for `path` with the default debounce window.
    pub fn new(runner: Arc<dyn SyncPass>, path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            path: path.into(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Use a different debounce window.
    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    fn is_relevant(&self, changed: &Path) -> bool {
        changed == self.path || (changed.file_name().is_some() && changed.file_name() == self.path.file_name())
    }

    /// Run until the event channel closes. Pending work is flushed first.
    pub async fn run(&self, events: ChangeEvents) -> WatchStats {
        self.run_with_shutdown(events, std::future::pending()).await
    }

    /// Run until the event channel closes or `shutdown` resolves.
    ///
    /// On shutdown the in-flight pass, if any, is awaited and pending work is
    /// abandoned. When the channel closes, pending work still runs.
    pub async fn run_with_shutdown(
        &self,
        mut events: ChangeEvents,
        shutdown: impl Future<Output = ()>,
    ) -> WatchStats {
        tokio::pin!(shutdown);

        let mut stats = WatchStats::default();
        let mut deadline: Option<Instant> = None;
        let mut in_flight: Option<PassFuture> = None;
        let mut rerun = false;
        let mut events_open = true;
        let mut stopping = false;

        tracing::info!(path = %self.path.display(), debounce_ms = self.debounce.as_millis(), "Watching for changes");

        loop {
            let idle = in_flight.is_none();
            if idle && (stopping || (!events_open && deadline.is_none())) {
                break;
            }

            tokio::select! {
                received = events.recv(), if events_open && !stopping => match received {
                    Some(path) if self.is_relevant(&path) => {
                        stats.events += 1;
                        if in_flight.is_some() {
                            rerun = true;
                        } else {
                            deadline = Some(Instant::now() + self.debounce);
                        }
                    }
                    Some(path) => tracing::trace!(path = %path.display(), "Ignoring unrelated change"),
                    None => events_open = false,
                },
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if idle && deadline.is_some() => {
                    deadline = None;
                    let runner = Arc::clone(&self.runner);
                    tracing::debug!("Debounce elapsed; starting sync pass");
                    in_flight = Some(Box::pin(async move { runner.execute().await }));
                },
                result = finish(&mut in_flight) => {
                    in_flight = None;
                    stats.passes += 1;
                    if let Err(e) = result {
                        stats.failed_passes += 1;
                        tracing::warn!(error = %e, "Sync pass failed; still watching");
                    }
                    if rerun && !stopping {
                        deadline = Some(Instant::now() + self.debounce);
                    }
                    rerun = false;
                },
                () = &mut shutdown, if !stopping => {
                    tracing::info!("Shutdown requested; stopping watch loop");
                    stopping = true;
                    deadline = None;
                    rerun = false;
                },
            }
        }

        tracing::info!(
            passes = stats.passes,
            events = stats.events,
            failed = stats.failed_passes,
            "Watch loop ended"
        );
        stats
    }
}

/// Keeps the OS watcher alive; dropping it closes the event channel.
pub struct WatchGuard {
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for WatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchGuard").finish_non_exhaustive()
    }
}

/// Watch the directory containing `path` and forward create, modify and
/// remove events as changed paths.
///
/// The directory is watched rather than the file so editors that replace
/// the file by rename keep being observed.
///
/// # Errors
///
/// Returns `Error::Watch` if the OS watcher cannot be created.
pub fn watch_file(path: &Path) -> Result<(WatchGuard, ChangeEvents)> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);

    let mut watcher = RecommendedWatcher::new(
        move |res: std::result::Result<Event, notify::Error>| match res {
            Ok(event) => {
                if matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    for changed in event.paths {
                        let _ = tx.blocking_send(changed);
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "File watcher error"),
        },
        Config::default(),
    )?;

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    watcher.watch(directory, RecursiveMode::NonRecursive)?;
    tracing::debug!(directory = %directory.display(), "Started file watcher");

    Ok((WatchGuard { _watcher: watcher }, rx))
}
