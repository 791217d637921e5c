//! The thread-pool capability.
//!
//! The reactor never owns worker threads for protocol work; the
//! embedder supplies an [`Executor`] and the reactor hands tasks to it
//! (dispatched I/O callbacks, custom selector tasks). Two
//! implementations are provided:
//!
//! - [`InlineExecutor`] runs tasks on the calling thread. The degenerate
//!   pool, also the test default.
//! - [`FixedExecutor`] spawns N OS threads at creation over a lock-free
//!   queue. No dynamic scaling. Simple, predictable, safe.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_queue::SegQueue;

pub type Task = Box<dyn FnOnce() + Send>;

pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs every task on the caller's thread.
#[derive(Debug, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

struct PoolInner {
    queue: SegQueue<Task>,
    active: AtomicUsize,
    shutdown: AtomicBool,
}

/// Fixed pool of named worker threads.
pub struct FixedExecutor {
    inner: Arc<PoolInner>,
    handles: Vec<thread::JoinHandle<()>>,
    total: usize,
}

impl FixedExecutor {
    /// Spawn a pool with `n` workers (clamped to [1, 64]).
    pub fn new(n: usize) -> Self {
        let n = n.clamp(1, 64);
        let inner = Arc::new(PoolInner {
            queue: SegQueue::new(),
            active: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });

        let mut handles = Vec::with_capacity(n);
        for worker_id in 0..n {
            let inner = Arc::clone(&inner);
            let handle = thread::Builder::new()
                .name(format!("strand-worker-{}", worker_id))
                .spawn(move || worker_loop(inner))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }

        Self {
            inner,
            handles,
            total: n,
        }
    }

    /// Default sizing: half the CPUs, between 2 and 8.
    pub fn auto_sized() -> Self {
        let cpus = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self::new((cpus / 2).clamp(2, 8))
    }

    pub fn active_workers(&self) -> usize {
        self.inner.active.load(Ordering::Relaxed)
    }

    pub fn total_workers(&self) -> usize {
        self.total
    }

    /// Stop accepting work and join the workers. Queued tasks still run.
    pub fn shutdown(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

impl Executor for FixedExecutor {
    fn execute(&self, task: Task) {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            log::warn!("executor shut down; running task inline");
            task();
            return;
        }
        self.inner.queue.push(task);
        // Wake one parked worker. Unparking all is wasteful and the
        // park timeout bounds the worst case anyway.
        if let Some(handle) = self.handles.first() {
            handle.thread().unpark();
        }
    }
}

impl Drop for FixedExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        match inner.queue.pop() {
            Some(task) => {
                inner.active.fetch_add(1, Ordering::Relaxed);
                task();
                inner.active.fetch_sub(1, Ordering::Relaxed);
            }
            None => {
                if inner.shutdown.load(Ordering::Relaxed) {
                    break;
                }
                thread::park_timeout(Duration::from_millis(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_inline_runs_on_caller() {
        let hit = Arc::new(AtomicBool::new(false));
        let h = hit.clone();
        InlineExecutor.execute(Box::new(move || h.store(true, Ordering::SeqCst)));
        assert!(hit.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fixed_runs_all_tasks() {
        let mut pool = FixedExecutor::new(4);
        let sum = Arc::new(AtomicU64::new(0));
        for i in 1..=100u64 {
            let sum = sum.clone();
            pool.execute(Box::new(move || {
                sum.fetch_add(i, Ordering::SeqCst);
            }));
        }
        pool.shutdown();
        assert_eq!(sum.load(Ordering::SeqCst), 5050);
    }
}
