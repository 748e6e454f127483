//! Periodic purge of the storage directory.
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;

use crate::storage::{Storage, StorageError};

/// Deletes every stored asset once per interval.
///
/// There is at most one sweeping task per sweeper. [`RetentionSweeper::start`] may be called
/// any number of times, only the first call after construction or [`RetentionSweeper::stop`]
/// spawns the task.
pub struct RetentionSweeper {
    storage: Arc<dyn Storage>,
    interval: Duration,
    running: Mutex<Option<Running>>,
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Shortest accepted sweep interval.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

impl RetentionSweeper {
    pub fn new(storage: Arc<dyn Storage>, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            log::warn!("Sweep interval {interval:?} too short, using {MIN_INTERVAL:?}");
        }
        let interval = interval.max(MIN_INTERVAL);

        Self {
            storage,
            interval,
            running: Mutex::new(None),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Spawn the sweeping task unless it already runs. Returns whether it was spawned.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running
            .as_ref()
            .map_or(false, |running| !running.handle.is_finished())
        {
            return false;
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(sweep_loop(
            Arc::clone(&self.storage),
            self.interval,
            token.clone(),
        ));
        *running = Some(Running { token, handle });

        log::info!("Sweeping storage every {:?}", self.interval);
        true
    }

    /// Cancel the sweeping task. Returns whether it was running.
    pub fn stop(&self) -> bool {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match running {
            Some(running) => {
                running.token.cancel();
                log::info!("Stopped sweeping storage");
                !running.handle.is_finished()
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map_or(false, |running| !running.handle.is_finished())
    }
}

impl Drop for RetentionSweeper {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.token.cancel();
            }
        }
    }
}

async fn sweep_loop(storage: Arc<dyn Storage>, period: Duration, token: CancellationToken) {
    let mut sweep_interval = interval(period);
    // The first tick completes immediately
    sweep_interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = sweep_interval.tick() => {}
        }

        let storage = Arc::clone(&storage);
        match tokio::task::spawn_blocking(move || sweep(storage.as_ref())).await {
            Ok(deleted) => log::info!("Swept {deleted} files from storage"),
            Err(err) => log::error!("Sweep task failed: {err}"),
        }
    }
}

/// Delete every asset in `storage`, skipping those that fail. Returns the number deleted.
pub fn sweep(storage: &dyn Storage) -> usize {
    let ids = match storage.list() {
        Ok(ids) => ids,
        Err(err) => {
            log::warn!("Failed to list storage: {err}");
            return 0;
        }
    };

    let mut deleted = 0;
    for id in ids {
        match storage.delete(&id) {
            Ok(()) => deleted += 1,
            // Deleted concurrently, e.g. by a finished video stream
            Err(StorageError::NotFound(_)) => (),
            Err(err) => log::warn!("Error deleting {id}: {err}"),
        }
    }

    deleted
}
