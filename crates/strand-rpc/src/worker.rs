//! Worker pool: a named task queue drained by a fixed set of workers.
//!
//! Request-execution tasks and delayed deliveries run here rather than as
//! ad-hoc spawns, so handler concurrency is bounded by the pool size and a
//! slow handler cannot starve the runtime of the engine's own plumbing.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::debug;

type PoolTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A named pool of workers pulling tasks from a shared queue.
///
/// Each worker loops: dequeue one task, run it to completion, repeat.
/// Must be created inside a tokio runtime.
pub struct WorkerPool {
    name: String,
    tx: mpsc::UnboundedSender<PoolTask>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `worker_count` workers draining a fresh queue.
    pub fn new(name: impl Into<String>, worker_count: usize) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::unbounded_channel::<PoolTask>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..worker_count.max(1))
            .map(|index| {
                let rx = rx.clone();
                let worker_name = format!("{name}.{index}");
                tokio::spawn(async move {
                    debug!(worker = %worker_name, "worker started");
                    loop {
                        let task = { rx.lock().await.recv().await };
                        match task {
                            Some(task) => task.await,
                            None => break,
                        }
                    }
                    debug!(worker = %worker_name, "worker stopped");
                })
            })
            .collect();
        WorkerPool { name, tx, workers }
    }

    /// Pool name, used in worker log records.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue a task for execution on some worker.
    pub fn enqueue(&self, task: impl Future<Output = ()> + Send + 'static) {
        let _ = self.tx.send(Box::pin(task));
    }

    /// Queue a task after a delay. With `delay_ms == 0` this is `enqueue`.
    pub fn enqueue_after(&self, delay_ms: u64, task: impl Future<Output = ()> + Send + 'static) {
        if delay_ms == 0 {
            self.enqueue(task);
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            let _ = tx.send(Box::pin(task));
        });
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_enqueued_tasks_run() {
        let pool = WorkerPool::new("test", 2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            pool.enqueue(async move {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_enqueue_after_delays_execution() {
        let pool = WorkerPool::new("test", 1);
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.enqueue_after(40, async move {
            c.fetch_add(1, Ordering::Relaxed);
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_single_worker_runs_tasks_in_order() {
        let pool = WorkerPool::new("ordered", 1);
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..4 {
            let log = log.clone();
            pool.enqueue(async move {
                log.lock().await.push(i);
            });
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().await, vec![0, 1, 2, 3]);
    }
}
