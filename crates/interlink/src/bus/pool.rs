//! Bounded worker pool for message handlers.
//!
//! Jobs go through a bounded crossbeam channel to a fixed set of named
//! threads. When the channel is full the job runs on the submitting thread
//! instead (caller-runs), so the submitter slows down rather than dropping
//! work or waiting on a lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::throttle::DropCounter;

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Where a submitted job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// The queue was full; the job already ran on the caller's thread.
    CallerRan,
    /// The pool is shut down; the job was discarded.
    Rejected,
}

pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    caller_runs: DropCounter,
    completed: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Spawns `size` threads sharing a queue of `capacity` jobs.
    pub fn new(name: &str, size: usize, capacity: usize, warn_threshold: u64) -> Self {
        let (sender, receiver) = channel::bounded::<Job>(capacity.max(1));
        let stopped = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicU64::new(0));
        let mut workers = Vec::with_capacity(size.max(1));

        for index in 0..size.max(1) {
            let receiver = receiver.clone();
            let stopped = stopped.clone();
            let completed = completed.clone();
            let spawned = thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        if stopped.load(Ordering::Acquire) {
                            continue;
                        }
                        job();
                        completed.fetch_add(1, Ordering::Relaxed);
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => error!("Failed to spawn worker {}-{}: {}", name, index, e),
            }
        }
        debug!("Worker pool '{}' started with {} thread(s)", name, workers.len());

        Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            stopped,
            caller_runs: DropCounter::new(warn_threshold),
            completed,
        }
    }

    /// Submits a job without blocking.
    pub fn submit(&self, job: Job) -> Submission {
        let result = match self.sender.lock().as_ref() {
            Some(sender) => sender.try_send(job),
            None => return Submission::Rejected,
        };
        match result {
            Ok(()) => Submission::Queued,
            Err(TrySendError::Full(job)) => {
                if let Some(total) = self.caller_runs.record() {
                    warn!(
                        "⚠️ Worker pool '{}' saturated; running handler on the caller ({} times so far)",
                        self.name, total
                    );
                }
                job();
                self.completed.fetch_add(1, Ordering::Relaxed);
                Submission::CallerRan
            }
            Err(TrySendError::Disconnected(_)) => Submission::Rejected,
        }
    }

    /// Jobs that ran on the submitting thread because the queue was full.
    pub fn caller_runs(&self) -> u64 {
        self.caller_runs.total()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Stops accepting jobs and discards queued ones. Running jobs finish on
    /// their own; threads exit once the queue is empty. Does not block.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        self.sender.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        debug!("Worker pool '{}' released {} thread(s)", self.name, workers.len());
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
