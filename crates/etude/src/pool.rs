// src/pool.rs
//! Fixed-size worker pool fed by a bounded FIFO queue.
//!
//! `append` never blocks: a full queue hands the task straight back, which is
//! the only backpressure signal the reactor gets.

use crate::error::{PoolError, QueueFull};
use crate::sync::{Flag, Lock};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, warn};

/// A unit of work run on a pool thread.
pub trait Task: Send + 'static {
    fn process(&mut self);
}

impl<T: Task + ?Sized> Task for Box<T> {
    fn process(&mut self) {
        (**self).process()
    }
}

struct Shared<T> {
    queue: Lock<VecDeque<T>>,
    pending: Flag,
    stop: AtomicBool,
}

pub struct WorkerPool<T: Task> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
    max_queued: usize,
}

impl<T: Task> WorkerPool<T> {
    pub fn new(thread_count: usize, max_queued_tasks: usize) -> Result<Self, PoolError> {
        if thread_count == 0 {
            return Err(PoolError::InvalidThreadCount);
        }
        if max_queued_tasks == 0 {
            return Err(PoolError::InvalidQueueCapacity);
        }

        let shared = Arc::new(Shared {
            queue: Lock::new(VecDeque::with_capacity(max_queued_tasks))?,
            pending: Flag::new()?,
            stop: AtomicBool::new(false),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(thread_count),
            max_queued: max_queued_tasks,
        };

        for i in 0..thread_count {
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(format!("etude-worker-{}", i))
                .spawn(move || run_worker(shared));
            match spawned {
                Ok(handle) => pool.workers.push(handle),
                // Dropping `pool` stops and joins whatever did start.
                Err(e) => return Err(PoolError::Spawn(e)),
            }
        }

        debug!(threads = thread_count, max_queued_tasks, "worker pool started");
        Ok(pool)
    }

    /// Queue `task` for a worker, or hand it back if the queue is full.
    pub fn append(&self, task: T) -> Result<(), QueueFull<T>> {
        let mut queue = match self.shared.queue.lock() {
            Ok(q) => q,
            Err(e) => {
                error!("worker queue lock failed: {}", e);
                return Err(QueueFull(task));
            }
        };
        if queue.len() >= self.max_queued {
            return Err(QueueFull(task));
        }
        queue.push_back(task);
        drop(queue);

        if let Err(e) = self.shared.pending.post() {
            warn!("failed to wake a worker: {}", e);
        }
        Ok(())
    }

    /// Number of queued tasks not yet picked up by a worker.
    pub fn len(&self) -> usize {
        self.shared.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.max_queued
    }

    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop every worker and wait for it to exit. Queued tasks are dropped.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);
        for _ in 0..self.workers.len() {
            if let Err(e) = self.shared.pending.post() {
                error!("failed to wake worker for shutdown: {}", e);
            }
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("worker thread exited abnormally");
            }
        }
        if let Ok(mut queue) = self.shared.queue.lock() {
            queue.clear();
        }
    }
}

impl<T: Task> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker<T: Task>(shared: Arc<Shared<T>>) {
    loop {
        if let Err(e) = shared.pending.wait() {
            error!("worker wait failed: {}", e);
            return;
        }
        if shared.stop.load(Ordering::Acquire) {
            return;
        }

        let task = match shared.queue.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(e) => {
                error!("worker queue lock failed: {}", e);
                continue;
            }
        };
        let Some(mut task) = task else {
            continue;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| task.process())).is_err() {
            error!("task panicked; worker continues");
        }
    }
}
