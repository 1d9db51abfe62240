//! The deferred dispatch queue shared by every client in the process.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::event::NotificationKind;

/// Upper bound on workers spawned for the shared pool.
const MAX_SHARED_WORKERS: usize = 4;

/// Work item consumed exactly once by a dispatch worker.
pub(crate) trait DeferredDispatch: Send {
    fn kind(&self) -> NotificationKind;
    fn run(self: Box<Self>);
}

type Job = Box<dyn DeferredDispatch>;

static SHARED: Mutex<Weak<DispatchPool>> = parking_lot::const_mutex(Weak::new());

/// A pool of background threads draining deferred notification work.
///
/// Each worker owns a FIFO lane and requests are routed to a lane by
/// notification kind, so the deferred requests of one kind run strictly in
/// submission order while different kinds can progress in parallel.
///
/// Dropping the pool closes the lanes; workers finish every request already
/// queued (including release actions) before exiting.
pub struct DispatchPool {
    lanes: Vec<mpsc::UnboundedSender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl DispatchPool {
    /// The process-wide pool.
    ///
    /// Created on first use and torn down when the last client holding it is
    /// dropped. A later call after teardown creates a fresh pool.
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::Io`](crate::BncsError::Io) if a worker thread
    /// cannot be spawned.
    pub fn shared() -> Result<Arc<Self>> {
        let mut slot = SHARED.lock();
        if let Some(pool) = slot.upgrade() {
            return Ok(pool);
        }
        let workers = thread::available_parallelism()
            .map_or(2, |n| n.get())
            .min(MAX_SHARED_WORKERS);
        let pool = Arc::new(Self::with_workers(workers)?);
        *slot = Arc::downgrade(&pool);
        debug!(workers, "created shared dispatch pool");
        Ok(pool)
    }

    /// Build a private pool with `count` workers (at least one).
    ///
    /// # Errors
    ///
    /// Returns [`BncsError::Io`](crate::BncsError::Io) if a worker thread
    /// cannot be spawned.
    pub fn with_workers(count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut lanes = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = mpsc::unbounded_channel::<Job>();
            let handle = thread::Builder::new()
                .name(format!("bncs-dispatch-{index}"))
                .spawn(move || worker_loop(rx))?;
            lanes.push(tx);
            workers.push(handle);
        }
        Ok(Self { lanes, workers })
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue a request. Never runs it on the caller's thread unless the lane
    /// has already shut down.
    pub(crate) fn submit(&self, job: Job) {
        let lane = job.kind().index() % self.lanes.len().max(1);
        match self.lanes.get(lane) {
            Some(tx) => {
                if let Err(mpsc::error::SendError(job)) = tx.send(job) {
                    warn!(kind = %job.kind(), "dispatch lane closed; running request inline");
                    job.run();
                }
            }
            None => {
                debug_assert!(false, "dispatch pool has no lanes");
                job.run();
            }
        }
    }
}

fn worker_loop(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.blocking_recv() {
        let kind = job.kind();
        if catch_unwind(AssertUnwindSafe(|| job.run())).is_err() {
            error!(kind = %kind, "deferred dispatch request panicked");
        }
    }
    debug!("dispatch worker exiting");
}

impl fmt::Debug for DispatchPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchPool")
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl Drop for DispatchPool {
    fn drop(&mut self) {
        self.lanes.clear();
        let current = thread::current().id();
        for handle in self.workers.drain(..) {
            // The last reference can be released from inside a handler.
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("dispatch worker terminated abnormally");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    struct Recorder {
        kind: NotificationKind,
        value: usize,
        out: std_mpsc::Sender<usize>,
    }

    impl DeferredDispatch for Recorder {
        fn kind(&self) -> NotificationKind {
            self.kind
        }

        fn run(self: Box<Self>) {
            let _ = self.out.send(self.value);
        }
    }

    #[test]
    fn same_kind_requests_drain_in_submission_order() {
        let pool = DispatchPool::with_workers(3).unwrap();
        let (tx, rx) = std_mpsc::channel();
        for value in 0..50 {
            pool.submit(Box::new(Recorder {
                kind: NotificationKind::UserSpoke,
                value,
                out: tx.clone(),
            }));
        }
        let seen: Vec<usize> = (0..50)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn drop_drains_queued_requests() {
        struct Count(Arc<AtomicUsize>);
        impl DeferredDispatch for Count {
            fn kind(&self) -> NotificationKind {
                NotificationKind::UserJoined
            }
            fn run(self: Box<Self>) {
                std::thread::sleep(Duration::from_millis(1));
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(AtomicUsize::new(0));
        let pool = DispatchPool::with_workers(1).unwrap();
        for _ in 0..20 {
            pool.submit(Box::new(Count(Arc::clone(&counter))));
        }
        drop(pool);
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn zero_workers_is_clamped_to_one() {
        let pool = DispatchPool::with_workers(0).unwrap();
        assert_eq!(pool.worker_count(), 1);
    }

    #[test]
    fn shared_pool_is_reused_while_alive() {
        let a = DispatchPool::shared().unwrap();
        let b = DispatchPool::shared().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn panicking_request_does_not_kill_worker() {
        struct Boom;
        impl DeferredDispatch for Boom {
            fn kind(&self) -> NotificationKind {
                NotificationKind::UserLeft
            }
            fn run(self: Box<Self>) {
                panic!("boom");
            }
        }

        let pool = DispatchPool::with_workers(1).unwrap();
        let (tx, rx) = std_mpsc::channel();
        pool.submit(Box::new(Boom));
        pool.submit(Box::new(Recorder {
            kind: NotificationKind::UserLeft,
            value: 9,
            out: tx,
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 9);
    }
}
