//! Small thread pool that runs resource loaders off the caller's thread.
//!
//! Loaders are pushed onto a shared crossbeam `Injector`; idle threads steal
//! from it. Running loaders on the pool is what lets `load_resource` race a
//! loader against its timeout instead of blocking on it.

use crossbeam::deque::{Injector, Steal};
use log::{trace, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of named worker threads.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(2, "choreo-loader");
/// workers.execute(move || {
///     let result = loader();
///     tx.send(result).ok();
/// });
/// ```
pub struct Workers {
    injector: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    queued: Arc<AtomicUsize>,
}

impl Workers {
    /// Spawn `num_threads` workers (at least one).
    pub fn new(num_threads: usize, name: &str) -> Self {
        let injector: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let queued = Arc::new(AtomicUsize::new(0));
        let num_threads = num_threads.max(1);

        let mut handles = Vec::with_capacity(num_threads);
        for worker_id in 0..num_threads {
            let injector = Arc::clone(&injector);
            let shutdown = Arc::clone(&shutdown);
            let queued = Arc::clone(&queued);

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", name, worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);
                    loop {
                        match injector.steal() {
                            Steal::Success(job) => {
                                queued.fetch_sub(1, Ordering::Relaxed);
                                job();
                                continue;
                            }
                            Steal::Retry => continue,
                            Steal::Empty => {}
                        }

                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }

                        // Nothing to do - short sleep instead of spinning
                        thread::sleep(Duration::from_millis(1));
                    }
                    trace!("Worker {} stopped", worker_id);
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!("Failed to spawn worker {}: {}", worker_id, e),
            }
        }

        trace!("Workers '{}' initialized: {} threads", name, handles.len());

        Self {
            injector,
            handles,
            shutdown,
            queued,
        }
    }

    /// Queue a job. Jobs run in FIFO order across the pool.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queued.fetch_add(1, Ordering::Relaxed);
        self.injector.push(Box::new(f));
    }

    /// Jobs waiting for a thread.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Relaxed)
    }

    pub fn thread_count(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for Workers {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        // Loaders may hang; give them a bounded window and leave the rest detached.
        let deadline = Instant::now() + Duration::from_millis(500);
        for handle in std::mem::take(&mut self.handles) {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Worker shutdown timeout reached, detaching remaining threads");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_execute_runs_job() {
        let workers = Workers::new(2, "test-worker");
        let (tx, rx) = bounded(1);
        workers.execute(move || {
            tx.send(42).ok();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(42));
    }

    #[test]
    fn test_jobs_run_in_parallel() {
        let workers = Workers::new(2, "test-worker");
        let (tx, rx) = bounded(2);
        for _ in 0..2 {
            let tx = tx.clone();
            workers.execute(move || {
                thread::sleep(Duration::from_millis(150));
                tx.send(()).ok();
            });
        }
        let start = Instant::now();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        // Sequential execution would need at least 300ms
        assert!(start.elapsed() < Duration::from_millis(280));
    }

    #[test]
    fn test_zero_threads_clamped() {
        let workers = Workers::new(0, "test-worker");
        assert_eq!(workers.thread_count(), 1);
    }
}
