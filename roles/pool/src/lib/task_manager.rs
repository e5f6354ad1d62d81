use std::{
    future::Future,
    sync::{Mutex, MutexGuard},
};

use tokio::task::JoinSet;
use tracing::{warn, Instrument};

/// Owns the long-running tasks of the pool so shutdown can wait on, or abort, all of them.
#[derive(Default)]
pub struct TaskManager {
    tasks: Mutex<JoinSet<()>>,
}

impl TaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawns `fut` inside the caller's tracing span.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let span = tracing::Span::current();
        self.tasks().spawn(fut.instrument(span));
    }

    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waits for every task spawned so far.
    pub async fn join_all(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks());
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!("Task failed: {e}");
                }
            }
        }
    }

    pub async fn abort_all(&self) {
        self.tasks().abort_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    #[tokio::test]
    async fn test_join_all_waits_for_tasks() {
        let manager = TaskManager::new();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let done = done.clone();
            manager.spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }
        manager.join_all().await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
        assert!(manager.is_empty());
    }

    #[tokio::test]
    async fn test_abort_all_stops_pending_tasks() {
        let manager = TaskManager::new();
        manager.spawn(std::future::pending());
        manager.abort_all().await;
        tokio::time::timeout(Duration::from_secs(1), manager.join_all())
            .await
            .unwrap();
    }
}
