use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{sync::Mutex, task::JoinHandle, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    Deleted,
    AlreadyGone,
    Failed(String),
}

/// Sleeps for `delay`, then removes `path` if it is still there. Never fails.
pub async fn delete_file_after_delay(path: &Path, delay: Duration) -> DeletionOutcome {
    tokio::time::sleep(delay).await;

    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            info!("Deleted: {}", path.display());
            DeletionOutcome::Deleted
        }
        Err(error) if error.kind() == ErrorKind::NotFound => DeletionOutcome::AlreadyGone,
        Err(error) => {
            warn!("Delete failed for {}: {error}", path.display());
            DeletionOutcome::Failed(error.to_string())
        }
    }
}

/// Pending deletion tasks keyed by file path.
#[derive(Clone)]
pub struct DeletionScheduler {
    delay: Duration,
    tasks: Arc<Mutex<HashMap<PathBuf, JoinHandle<DeletionOutcome>>>>,
}

impl DeletionScheduler {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns `false` when a deletion is already pending for `path`; the
    /// first schedule keeps its deadline.
    pub async fn schedule(&self, path: PathBuf) -> bool {
        let mut tasks = self.tasks.lock().await;
        tasks.retain(|_, handle| !handle.is_finished());

        if tasks.contains_key(&path) {
            return false;
        }

        let delay = self.delay;
        let task_path = path.clone();
        let handle = tokio::spawn(async move { delete_file_after_delay(&task_path, delay).await });
        tasks.insert(path, handle);
        true
    }

    pub async fn cancel(&self, path: &Path) -> bool {
        let Some(handle) = self.tasks.lock().await.remove(path) else {
            return false;
        };

        let was_pending = !handle.is_finished();
        handle.abort();
        was_pending
    }

    pub async fn is_pending(&self, path: &Path) -> bool {
        self.tasks
            .lock()
            .await
            .get(path)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Waits for the task scheduled for `path` and hands back its outcome.
    /// `None` if nothing was scheduled or the outcome was already taken.
    pub async fn wait(&self, path: &Path) -> Option<DeletionOutcome> {
        let handle = self.tasks.lock().await.remove(path)?;

        Some(match handle.await {
            Ok(outcome) => outcome,
            Err(error) => DeletionOutcome::Failed(error.to_string()),
        })
    }
}
