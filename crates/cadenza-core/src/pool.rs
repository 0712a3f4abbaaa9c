// src/pool.rs
use crate::error::{ServeError, ServeResult};
use crossbeam_channel::{Sender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Fixed set of worker threads fed from a bounded FIFO queue.
///
/// Jobs are fire-and-forget: `submit` never waits for a job to run and
/// nothing is returned to the submitter.
pub struct WorkerPool<T: Send + 'static> {
    sender: Option<Sender<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` threads running `handler` for every submitted job.
    ///
    /// With `pin` set, worker `i` is pinned to core `i % cores`.
    pub fn new<F>(workers: usize, queue_bound: usize, pin: bool, handler: F) -> ServeResult<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if workers == 0 {
            return Err(ServeError::Config("worker pool needs at least one thread".into()));
        }
        let (sender, receiver) = crossbeam_channel::bounded::<T>(queue_bound);
        let handler = Arc::new(handler);
        let core_ids = if pin {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let receiver = receiver.clone();
            let handler = Arc::clone(&handler);
            let core_id = (!core_ids.is_empty()).then(|| core_ids[i % core_ids.len()]);

            let handle = thread::Builder::new()
                .name(format!("cadenza-worker-{}", i))
                .spawn(move || {
                    if let Some(id) = core_id {
                        if core_affinity::set_for_current(id) {
                            tracing::debug!(worker = i, cpu = id.id, "worker pinned");
                        } else {
                            tracing::warn!(worker = i, cpu = id.id, "failed to pin worker");
                        }
                    }
                    // Ends once every sender is gone and the queue is drained.
                    for job in receiver.iter() {
                        handler(job);
                    }
                    tracing::trace!(worker = i, "worker exiting");
                });
            match handle {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    drop(sender);
                    join_all(&mut handles);
                    return Err(e.into());
                }
            }
        }

        tracing::info!(workers, queue_bound, pinned = pin, "worker pool started");
        Ok(Self {
            sender: Some(sender),
            handles,
        })
    }

    /// Enqueue a job without blocking.
    pub fn submit(&self, job: T) -> ServeResult<()> {
        let sender = self.sender.as_ref().ok_or(ServeError::PoolClosed)?;
        sender.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => ServeError::QueueFull,
            TrySendError::Disconnected(_) => ServeError::PoolClosed,
        })
    }

    #[inline(always)]
    pub fn workers(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting jobs, let the queued ones finish, and join every thread.
    pub fn shutdown(&mut self) {
        if self.sender.take().is_some() {
            join_all(&mut self.handles);
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn join_all(handles: &mut Vec<JoinHandle<()>>) {
    for handle in handles.drain(..) {
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_every_job_runs() {
        let total = Arc::new(AtomicUsize::new(0));
        let sum = Arc::clone(&total);
        let mut pool = WorkerPool::new(4, 128, false, move |n: usize| {
            sum.fetch_add(n, Ordering::Relaxed);
        })
        .unwrap();
        assert_eq!(pool.workers(), 4);

        for n in 1..=100 {
            pool.submit(n).unwrap();
        }
        pool.shutdown();
        assert_eq!(total.load(Ordering::Relaxed), 5050);
    }

    #[test]
    fn test_full_queue_is_reported() {
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        let gate_rx = parking_lot::Mutex::new(gate_rx);
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let started_tx = parking_lot::Mutex::new(started_tx);

        let pool = WorkerPool::new(1, 1, false, move |_: u8| {
            let _ = started_tx.lock().send(());
            let _ = gate_rx.lock().recv();
        })
        .unwrap();

        // First job occupies the only worker, second fills the queue.
        pool.submit(0).unwrap();
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pool.submit(1).unwrap();
        assert!(matches!(pool.submit(2), Err(ServeError::QueueFull)));

        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
    }

    #[test]
    fn test_submit_after_shutdown() {
        let mut pool = WorkerPool::new(2, 8, false, |_: ()| {}).unwrap();
        pool.shutdown();
        assert_eq!(pool.workers(), 0);
        assert!(matches!(pool.submit(()), Err(ServeError::PoolClosed)));
    }

    #[test]
    fn test_zero_workers_is_rejected() {
        assert!(WorkerPool::new(0, 8, false, |_: ()| {}).is_err());
    }

    #[test]
    fn test_pinned_pool_runs_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&done);
        let mut pool = WorkerPool::new(2, 8, true, move |_: ()| {
            count.fetch_add(1, Ordering::Relaxed);
        })
        .unwrap();
        pool.submit(()).unwrap();
        pool.submit(()).unwrap();
        pool.shutdown();
        assert_eq!(done.load(Ordering::Relaxed), 2);
    }
}
