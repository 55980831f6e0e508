use std::{
    fs::Metadata,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::time::{Instant, interval_at, sleep};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::config::AppConfig;

/// Owns every timer that reclaims files in the temp directory.
///
/// Delayed deletes and the periodic sweep run as tracked tasks tied to one
/// cancellation token, so `shutdown_sweep` leaves no timers behind.
#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    temp_dir: PathBuf,
    delete_delay: Duration,
    sweep_interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl CleanupScheduler {
    pub fn new(
        temp_dir: impl Into<PathBuf>,
        delete_delay: Duration,
        sweep_interval: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            temp_dir: temp_dir.into(),
            delete_delay,
            sweep_interval,
            max_age,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.temp_dir.clone(),
            config.delete_delay,
            config.sweep_interval,
            config.temp_max_age,
        )
    }

    /// Deletes `path` once the delay has elapsed, giving the response body time
    /// to drain. A pending delete is dropped on shutdown; the shutdown sweep
    /// removes the file instead.
    pub fn schedule_delete(&self, path: PathBuf) {
        let delay = self.delete_delay;
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(delay) => {
                    remove_entry(&path, false).await;
                }
            }
        });
    }

    /// Starts the periodic sweep. The first tick fires one full interval from now.
    pub fn start_sweeper(&self) {
        let scheduler = self.clone();
        let period = self.sweep_interval;
        self.tasks.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = scheduler.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = scheduler.sweep().await;
                        if removed > 0 {
                            info!("Periodic sweep removed {removed} stale temp file(s)");
                        }
                    }
                }
            }
        });
    }

    /// Removes every entry older than the configured max age. Best-effort:
    /// failures are logged and the sweep moves on.
    pub async fn sweep(&self) -> usize {
        let max_age = self.max_age;
        self.remove_entries(|age| age > max_age).await
    }

    /// Cancels outstanding timers, then removes everything in the temp directory.
    pub async fn shutdown_sweep(&self) -> usize {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let removed = self.remove_entries(|_| true).await;
        info!("Shutdown sweep removed {removed} temp file(s)");
        removed
    }

    async fn remove_entries(&self, should_remove: impl Fn(Duration) -> bool) -> usize {
        let now = SystemTime::now();
        let mut removed = 0;

        for (path, metadata) in self.list_entries().await {
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if should_remove(age) && remove_entry(&path, metadata.is_dir()).await {
                removed += 1;
            }
        }

        removed
    }

    /// Temp directory entries with their metadata; unreadable entries are skipped.
    async fn list_entries(&self) -> Vec<(PathBuf, Metadata)> {
        let mut listed = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.temp_dir).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == ErrorKind::NotFound => return listed,
            Err(error) => {
                warn!("Temp directory {:?} is unreadable: {error}", self.temp_dir);
                return listed;
            }
        };

        loop {
            match dir.next_entry().await {
                Ok(Some(entry)) => match entry.metadata().await {
                    Ok(metadata) => listed.push((entry.path(), metadata)),
                    Err(error) => debug!("Skipping temp entry {:?}: {error}", entry.path()),
                },
                Ok(None) => break,
                Err(error) => {
                    warn!("Stopped listing temp directory: {error}");
                    break;
                }
            }
        }

        listed
    }
}

/// Returns whether this call removed `path`.
async fn remove_entry(path: &Path, is_dir: bool) -> bool {
    let result = if is_dir {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => {
            debug!("Removed temp entry {:?}", path.file_name());
            true
        }
        Err(error) if error.kind() == ErrorKind::NotFound => false,
        Err(error) => {
            warn!("Could not remove temp entry {:?}: {error}", path);
            false
        }
    }
}
