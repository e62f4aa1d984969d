use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Mutable state of a worker slot
struct WorkerState {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// Owns at most one background task for a channel role.
///
/// `stop` only requests an exit: the task observes the token at its next idle
/// wait, so work already in progress finishes first. `join` waits for the exit.
pub(crate) struct Worker {
    name: &'static str,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub(crate) fn new(name: &'static str) -> Self {
        Worker {
            name,
            state: Mutex::new(WorkerState {
                cancel: CancellationToken::new(),
                handle: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns `task` unless a previous task is alive and not asked to stop;
    /// returns whether it started.
    ///
    /// A stopped task that has not exited yet is detached and finishes on its own.
    pub(crate) fn spawn<F, Fut>(&self, task: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = self.lock();
        let alive = state.handle.as_ref().is_some_and(|h| !h.is_finished());
        if alive && !state.cancel.is_cancelled() {
            return false;
        }

        state.cancel = CancellationToken::new();
        state.handle = Some(tokio::spawn(task(state.cancel.clone())));
        true
    }

    /// Requests the background task to exit
    pub(crate) fn stop(&self) {
        self.lock().cancel.cancel();
    }

    /// Returns true while a spawned task has not exited
    pub(crate) fn is_running(&self) -> bool {
        self.lock().handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Waits until the background task has exited; immediate when none was spawned
    pub(crate) async fn join(&self) {
        let handle = self.lock().handle.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("{} task ended abnormally: {}", self.name, e);
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let mut state = self.lock();
        state.cancel.cancel();
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn test_stop_and_join() {
        let worker = Worker::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = ticks.clone();
        assert!(worker.spawn(move |cancel| async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(Duration::from_millis(5)) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
        }));
        assert!(worker.is_running());

        sleep(Duration::from_millis(30)).await;
        worker.stop();
        timeout(Duration::from_secs(1), worker.join()).await.unwrap();

        assert!(!worker.is_running());
        assert!(ticks.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test]
    async fn test_single_task_per_worker() {
        let worker = Worker::new("test");
        assert!(worker.spawn(|cancel| async move { cancel.cancelled().await }));
        assert!(!worker.spawn(|cancel| async move { cancel.cancelled().await }));

        worker.stop();
        worker.join().await;

        // A joined worker can be started again
        assert!(worker.spawn(|_| async {}));
        worker.join().await;
    }

    #[tokio::test]
    async fn test_respawn_after_stop_without_join() {
        let worker = Worker::new("test");
        let (release, released) = tokio::sync::oneshot::channel::<()>();

        // Ignores its token until released, like a tick still in progress
        assert!(worker.spawn(move |_| async move {
            let _ = released.await;
        }));
        worker.stop();
        assert!(worker.is_running());

        assert!(worker.spawn(|cancel| async move { cancel.cancelled().await }));
        assert!(worker.is_running());
        let _ = release.send(());

        worker.stop();
        timeout(Duration::from_secs(1), worker.join()).await.unwrap();
        assert!(!worker.is_running());
    }

    #[tokio::test]
    async fn test_drop_aborts_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let worker = Worker::new("test");
        // Never observes its token; only an abort ends it
        assert!(worker.spawn(move |_| async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        }));
        drop(worker);

        // The sender is dropped with the aborted task
        assert!(timeout(Duration::from_secs(1), rx).await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_join_without_spawn() {
        let worker = Worker::new("idle");
        timeout(Duration::from_millis(100), worker.join()).await.unwrap();
    }
}
