//! Registry of live workers, one per task id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Liveness handle of a spawned worker.
struct WorkerHandle {
    join: JoinHandle<()>,
    /// Flips to `true` when the worker future returns
    done: watch::Receiver<bool>,
    /// Done flag of the worker this one is queued behind
    after: Option<watch::Receiver<bool>>,
}

impl WorkerHandle {
    /// Alive until the worker future returns or the task dies.
    fn is_alive(&self) -> bool {
        !*self.done.borrow() && !self.join.is_finished()
    }

    /// Still waiting for its predecessor to exit.
    fn is_queued(&self) -> bool {
        // A closed channel means the predecessor panicked.
        self.after
            .as_ref()
            .is_some_and(|prev| !*prev.borrow() && prev.has_changed().is_ok())
    }
}

/// Guarantees at most one live worker per task id.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `worker` for `task_id` unless one is already alive.
    ///
    /// Returns `false` (and drops `worker` unpolled) when a live worker exists.
    pub fn spawn_if_idle<F>(&self, task_id: &str, worker: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.retain(|_, handle| handle.is_alive());

        if workers.contains_key(task_id) {
            debug!(task_id, "Worker already running");
            return false;
        }

        workers.insert(task_id.to_string(), launch(None, worker));
        debug!(task_id, "Worker spawned");
        true
    }

    /// Spawn `worker` for `task_id`, or queue it to start as soon as the live
    /// worker exits.
    ///
    /// A worker that has already decided to stop can still be alive when the
    /// task is set running again; the queued worker picks the task up after
    /// it. At most one worker waits per task: returns `false` (and drops
    /// `worker` unpolled) when one already does.
    pub fn spawn_or_queue<F>(&self, task_id: &str, worker: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.retain(|_, handle| handle.is_alive());

        let after = match workers.get(task_id) {
            Some(handle) if handle.is_queued() => {
                debug!(task_id, "Worker already queued");
                return false;
            }
            Some(handle) => Some(handle.done.clone()),
            None => None,
        };

        let queued = after.is_some();
        workers.insert(task_id.to_string(), launch(after, worker));
        debug!(task_id, queued, "Worker spawned");
        true
    }

    pub fn is_alive(&self, task_id: &str) -> bool {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .is_some_and(WorkerHandle::is_alive)
    }

    /// Task ids with a live worker.
    pub fn live_tasks(&self) -> Vec<String> {
        self.workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(_, handle)| handle.is_alive())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Wait for the task's worker to exit. Returns at once if there is none.
    pub async fn wait(&self, task_id: &str) {
        let done = self
            .workers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .map(|handle| handle.done.clone());

        if let Some(mut done) = done {
            // A dropped sender means the worker panicked; it is gone either way.
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

/// Run `worker` on the runtime once `after` (if any) reports done.
fn launch<F>(after: Option<watch::Receiver<bool>>, worker: F) -> WorkerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let (done_tx, done_rx) = watch::channel(false);
    let mut previous = after.clone();
    let join = tokio::spawn(async move {
        if let Some(previous) = previous.as_mut() {
            let _ = previous.wait_for(|finished| *finished).await;
        }
        worker.await;
        let _ = done_tx.send(true);
    });

    WorkerHandle {
        join,
        done: done_rx,
        after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_second_spawn_is_refused_while_alive() {
        let registry = WorkerRegistry::new();
        let gate = Arc::new(Notify::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let (g, r) = (gate.clone(), runs.clone());
        assert!(registry.spawn_if_idle("t1", async move {
            r.fetch_add(1, Ordering::SeqCst);
            g.notified().await;
        }));

        let r = runs.clone();
        assert!(!registry.spawn_if_idle("t1", async move {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(registry.is_alive("t1"));
        assert_eq!(registry.live_tasks(), vec!["t1".to_string()]);

        gate.notify_one();
        registry.wait("t1").await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_respawn_after_exit() {
        let registry = WorkerRegistry::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let r = runs.clone();
            assert!(registry.spawn_if_idle("t1", async move {
                r.fetch_add(1, Ordering::SeqCst);
            }));
            registry.wait("t1").await;
            assert!(!registry.is_alive("t1"));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wait_without_worker_returns() {
        WorkerRegistry::new().wait("missing").await;
    }

    #[tokio::test]
    async fn test_queued_worker_starts_after_live_one() {
        let registry = WorkerRegistry::new();
        let gate = Arc::new(Notify::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let (g, o) = (gate.clone(), order.clone());
        assert!(registry.spawn_or_queue("t1", async move {
            g.notified().await;
            o.lock().unwrap().push("first");
        }));

        let o = order.clone();
        assert!(registry.spawn_or_queue("t1", async move {
            o.lock().unwrap().push("second");
        }));
        let o = order.clone();
        assert!(!registry.spawn_or_queue("t1", async move {
            o.lock().unwrap().push("third");
        }));

        tokio::task::yield_now().await;
        assert!(order.lock().unwrap().is_empty());
        assert!(registry.is_alive("t1"));

        gate.notify_one();
        registry.wait("t1").await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
        assert!(!registry.is_alive("t1"));
    }
}
