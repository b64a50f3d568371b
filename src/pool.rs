//! Background Worker Pool
//!
//! A small pool of workers that repeatedly invoke registered task
//! closures, used to drain the replication queue. A task invocation
//! returns whether it found work; idle workers sleep until woken or until
//! the poll interval elapses. The pool also keeps named counters so that
//! concurrent task invocations can publish state to each other (the merge
//! selector's "big merges" gate); a counter increment is scoped to a
//! token and undone when the token drops.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

const NO_WORK_SLEEP: Duration = Duration::from_millis(500);
const REMOVE_POLL: Duration = Duration::from_millis(10);

type TaskFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

struct TaskState {
    f: TaskFn,
    // Invocations may run on several workers at once; per-entry isolation
    // is the task's own business.
    running: AtomicU64,
    removed: AtomicBool,
}

struct PoolInner {
    tasks: Mutex<Vec<Arc<TaskState>>>,
    counters: Mutex<HashMap<String, i64>>,
    wake: Notify,
    shutdown: AtomicBool,
}

/// Handle to a registered pool task.
#[derive(Clone)]
pub struct TaskHandle {
    state: Arc<TaskState>,
    pool: Arc<PoolInner>,
}

impl TaskHandle {
    /// Nudge idle workers to run tasks now.
    pub fn wake(&self) {
        self.pool.wake.notify_waiters();
    }
}

/// Scoped increment of a named pool counter.
pub struct CounterToken {
    pool: Arc<PoolInner>,
    name: String,
}

impl Drop for CounterToken {
    fn drop(&mut self) {
        let mut counters = self.pool.counters.lock().unwrap();
        if let Some(value) = counters.get_mut(&self.name) {
            *value -= 1;
        }
    }
}

/// Pool of background workers.
pub struct BackgroundPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundPool {
    pub fn new(workers: usize) -> Self {
        let inner = Arc::new(PoolInner {
            tasks: Mutex::new(Vec::new()),
            counters: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            shutdown: AtomicBool::new(false),
        });

        let handles = (0..workers.max(1))
            .map(|_| tokio::spawn(worker_loop(Arc::clone(&inner))))
            .collect();

        Self {
            inner,
            workers: Mutex::new(handles),
        }
    }

    /// Register a task closure; workers will invoke it repeatedly.
    pub fn add_task<F, Fut>(&self, f: F) -> TaskHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let state = Arc::new(TaskState {
            f: Arc::new(move || Box::pin(f()) as Pin<Box<dyn Future<Output = bool> + Send>>),
            running: AtomicU64::new(0),
            removed: AtomicBool::new(false),
        });
        self.inner.tasks.lock().unwrap().push(Arc::clone(&state));
        self.inner.wake.notify_waiters();
        TaskHandle {
            state,
            pool: Arc::clone(&self.inner),
        }
    }

    /// Deregister a task and wait for any in-flight invocation to finish.
    pub async fn remove_task(&self, handle: &TaskHandle) {
        handle.state.removed.store(true, Ordering::SeqCst);
        self.inner
            .tasks
            .lock()
            .unwrap()
            .retain(|task| !Arc::ptr_eq(task, &handle.state));
        while handle.state.running.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(REMOVE_POLL).await;
        }
    }

    /// Increment a named counter for the lifetime of the returned token.
    pub fn increment_counter(&self, name: &str) -> CounterToken {
        *self
            .inner
            .counters
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += 1;
        CounterToken {
            pool: Arc::clone(&self.inner),
            name: name.to_string(),
        }
    }

    pub fn counter(&self, name: &str) -> i64 {
        *self.inner.counters.lock().unwrap().get(name).unwrap_or(&0)
    }

    /// Stop all workers. Registered tasks are not invoked afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.wake.notify_waiters();
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(pool: Arc<PoolInner>) {
    while !pool.shutdown.load(Ordering::SeqCst) {
        let tasks: Vec<Arc<TaskState>> = pool.tasks.lock().unwrap().clone();

        let mut did_work = false;
        for task in tasks {
            if pool.shutdown.load(Ordering::SeqCst) {
                return;
            }
            if task.removed.load(Ordering::SeqCst) {
                continue;
            }
            task.running.fetch_add(1, Ordering::SeqCst);
            let result = (task.f)().await;
            task.running.fetch_sub(1, Ordering::SeqCst);
            did_work |= result;
        }

        if !did_work {
            let _ = tokio::time::timeout(NO_WORK_SLEEP, pool.wake.notified()).await;
        }
    }
    debug!("background pool worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[tokio::test]
    async fn test_task_runs_and_remove_waits() {
        let pool = BackgroundPool::new(2);
        let runs = Arc::new(AtomicU64::new(0));

        let counter = Arc::clone(&runs);
        let handle = pool.add_task(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
        });

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) < 3 {
            assert!(std::time::Instant::now() < deadline, "task never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        pool.remove_task(&handle).await;
        let after_remove = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_remove);

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_counters_are_scoped_to_tokens() {
        let pool = BackgroundPool::new(1);
        assert_eq!(pool.counter("big merges"), 0);
        {
            let _token = pool.increment_counter("big merges");
            let _second = pool.increment_counter("big merges");
            assert_eq!(pool.counter("big merges"), 2);
        }
        assert_eq!(pool.counter("big merges"), 0);
        pool.shutdown().await;
    }
}
