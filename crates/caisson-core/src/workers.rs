use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender, TrySendError};

use crate::error::{CaissonError, Result};

/// Matches the bounded task queue of the original deployment; once it
/// fills, submission degrades to caller-runs.
const QUEUE_DEPTH: usize = 128;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size thread pool shared by backup persistence and restore
/// decodes. Built once per run and shut down explicitly; dropping it
/// also drains and joins the workers.
pub struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Self {
        let (tx, rx) = bounded::<Job>(QUEUE_DEPTH);
        let workers = (0..threads.max(1))
            .map(|_| {
                let rx = rx.clone();
                thread::spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
            })
            .collect();
        WorkerPool {
            tx: Some(tx),
            workers,
        }
    }

    /// Queues `task` and hands back a promise for its result. When the
    /// queue is saturated the task runs on the calling thread instead,
    /// which throttles the producer without dropping work.
    pub fn submit<T, F>(&self, task: F) -> Promise<T>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let promise = Promise::new();
        let resolver = promise.clone();
        let job: Job = Box::new(move || resolver.fulfill(task()));
        if let Some(tx) = &self.tx {
            match tx.try_send(job) {
                Ok(()) => {}
                Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => job(),
            }
        }
        promise
    }

    /// Waits for queued work to finish and joins the worker threads.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

enum Slot<T> {
    Pending,
    Ready(Arc<T>),
    /// The error is handed out once; later waiters see a generic
    /// failure, which only happens after the run already aborted.
    Failed(Option<CaissonError>),
}

/// Handle to the eventual result of a pool task. Waiting blocks until
/// the task resolves; spurious wakeups are retried internally. The
/// result is shared, so several waiters can hold the same decoded
/// value.
pub struct Promise<T> {
    state: Arc<(Mutex<Slot<T>>, Condvar)>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Promise {
            state: Arc::new((Mutex::new(Slot::Pending), Condvar::new())),
        }
    }

    pub fn fulfill(&self, result: Result<T>) {
        let (slot, ready) = &*self.state;
        let mut guard = slot.lock().unwrap();
        debug_assert!(matches!(*guard, Slot::Pending));
        *guard = match result {
            Ok(value) => Slot::Ready(Arc::new(value)),
            Err(e) => Slot::Failed(Some(e)),
        };
        ready.notify_all();
    }

    pub fn wait(&self) -> Result<Arc<T>> {
        let (slot, ready) = &*self.state;
        let mut guard = slot.lock().unwrap();
        loop {
            match &mut *guard {
                Slot::Pending => guard = ready.wait(guard).unwrap(),
                Slot::Ready(value) => return Ok(Arc::clone(value)),
                Slot::Failed(error) => {
                    return Err(error.take().unwrap_or_else(|| {
                        CaissonError::Other("task failed previously".to_string())
                    }))
                }
            }
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Promise::new()
    }
}

/// Counting permit bounding how many bundle encodes are in flight.
pub struct Permits {
    available: Mutex<usize>,
    freed: Condvar,
}

impl Permits {
    pub fn new(count: usize) -> Self {
        Permits {
            available: Mutex::new(count.max(1)),
            freed: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut available = self.available.lock().unwrap();
        while *available == 0 {
            available = self.freed.wait(available).unwrap();
        }
        *available -= 1;
    }

    pub fn release(&self) {
        let mut available = self.available.lock().unwrap();
        *available += 1;
        self.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn tasks_resolve_promises() {
        let pool = WorkerPool::new(4);
        let promises: Vec<_> = (0..64u64).map(|i| pool.submit(move || Ok(i * 2))).collect();
        for (i, promise) in promises.iter().enumerate() {
            assert_eq!(*promise.wait().unwrap(), i as u64 * 2);
        }
        pool.shutdown();
    }

    #[test]
    fn errors_surface_once() {
        let pool = WorkerPool::new(1);
        let promise = pool.submit::<u32, _>(|| Err(CaissonError::Other("boom".to_string())));
        assert!(promise.wait().is_err());
        // A second wait still errors, with a generic message.
        assert!(promise.wait().is_err());
    }

    #[test]
    fn shared_result_between_waiters() {
        let pool = WorkerPool::new(2);
        let promise = pool.submit(|| Ok(vec![1u8, 2, 3]));
        let a = promise.wait().unwrap();
        let b = promise.clone().wait().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn saturation_falls_back_to_caller() {
        // One blocked worker, deep backlog: extra submissions must
        // still complete via the calling thread.
        let pool = WorkerPool::new(1);
        let gate = Arc::new(Permits::new(1));
        gate.acquire();

        let blocker = {
            let gate = Arc::clone(&gate);
            pool.submit(move || {
                gate.acquire();
                Ok(())
            })
        };
        let done = Arc::new(AtomicUsize::new(0));
        let mut promises = Vec::new();
        for _ in 0..(QUEUE_DEPTH + 8) {
            let done = Arc::clone(&done);
            promises.push(pool.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        // The overflow beyond the queue ran inline already.
        assert!(done.load(Ordering::SeqCst) >= 8);

        gate.release();
        blocker.wait().unwrap();
        for promise in &promises {
            promise.wait().unwrap();
        }
        pool.shutdown();
    }

    #[test]
    fn permits_block_at_zero() {
        let permits = Arc::new(Permits::new(2));
        permits.acquire();
        permits.acquire();

        let released = Arc::new(AtomicUsize::new(0));
        let waiter = {
            let permits = Arc::clone(&permits);
            let released = Arc::clone(&released);
            thread::spawn(move || {
                permits.acquire();
                released.load(Ordering::SeqCst)
            })
        };
        thread::sleep(Duration::from_millis(50));
        released.store(1, Ordering::SeqCst);
        permits.release();
        assert_eq!(waiter.join().unwrap(), 1);
    }
}
