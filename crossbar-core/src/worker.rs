//! Bounded worker pool with per-key affinity
//!
//! Requests are routed to a worker by hashing a caller-supplied key, so all
//! requests sharing a key execute in FIFO order on the same thread. The
//! factory keys by connection identity, which serializes a connection's I/O
//! without a per-connection lock.
//!
//! A pool of size 0 degenerates to running requests inline on the caller,
//! which is how small deployments let the selector threads do their own I/O.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// A unit of work scheduled on the pool.
///
/// `do_work` runs to completion on some worker. A returned error or a panic
/// is logged and followed by `cleanup`. `cleanup` also runs when the pool is
/// stopping and the request is drained without ever executing.
pub trait WorkRequest: Send {
    fn do_work(&mut self) -> crate::Result<()>;
    fn cleanup(&mut self);
}

pub struct WorkerService {
    name: String,
    stopped: Arc<AtomicBool>,
    senders: Mutex<Vec<Sender<Box<dyn WorkRequest>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    num_workers: usize,
}

impl WorkerService {
    /// Spawn `num_workers` workers named `{name}-{i}`.
    pub fn new(name: &str, num_workers: usize) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        let mut senders = Vec::with_capacity(num_workers);
        let mut handles = Vec::with_capacity(num_workers);

        for i in 0..num_workers {
            let (tx, rx) = unbounded::<Box<dyn WorkRequest>>();
            let stopped = stopped.clone();
            let thread_name = format!("{name}-{i}");
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(rx, stopped))
                .unwrap_or_else(|e| panic!("failed to spawn {thread_name}: {e}"));
            senders.push(tx);
            handles.push(handle);
        }

        Self {
            name: name.to_owned(),
            stopped,
            senders: Mutex::new(senders),
            handles: Mutex::new(handles),
            num_workers,
        }
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    /// Schedule `req` on the worker owning `key`. Runs inline when the pool
    /// has no workers; cleans the request up when the pool is stopping.
    pub fn schedule(&self, mut req: Box<dyn WorkRequest>, key: u64) {
        if self.stopped.load(Ordering::Acquire) {
            req.cleanup();
            return;
        }
        if self.num_workers == 0 {
            run_request(&mut req);
            return;
        }

        let senders = self.senders.lock().unwrap();
        if senders.is_empty() {
            drop(senders);
            req.cleanup();
            return;
        }
        let idx = (hash_key(key) % senders.len() as u64) as usize;
        if let Err(rejected) = senders[idx].send(req) {
            let mut req = rejected.into_inner();
            drop(senders);
            req.cleanup();
        }
    }

    /// Signal the workers to finish in-flight work and drain their queues
    /// (queued requests are cleaned up, not executed).
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        // Disconnect the channels so blocked workers wake and exit
        self.senders.lock().unwrap().clear();
    }

    /// Wait up to `timeout` for the workers to exit; stragglers are abandoned
    /// with a warning.
    pub fn join(&self, timeout: Duration) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().unwrap().drain(..).collect();
        let deadline = Instant::now() + timeout;

        for handle in handles {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
            if handle.is_finished() {
                if handle.join().is_err() {
                    error!("worker thread of pool {} panicked", self.name);
                }
            } else {
                warn!(
                    "worker pool {} did not drain within {:?}; abandoning remaining workers",
                    self.name, timeout
                );
                return;
            }
        }
    }
}

fn worker_loop(rx: Receiver<Box<dyn WorkRequest>>, stopped: Arc<AtomicBool>) {
    while let Ok(mut req) = rx.recv() {
        if stopped.load(Ordering::Acquire) {
            req.cleanup();
            continue;
        }
        run_request(&mut req);
    }
    debug!("worker thread exited");
}

fn run_request(req: &mut Box<dyn WorkRequest>) {
    match catch_unwind(AssertUnwindSafe(|| req.do_work())) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("work request failed: {e}");
            req.cleanup();
        }
        Err(_) => {
            error!("work request panicked");
            req.cleanup();
        }
    }
}

fn hash_key(key: u64) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}
