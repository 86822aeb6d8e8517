// src/object/pool.rs
//! Bounded pool of shared managed objects
//!
//! Instead of sourcing one instance per process, a small set of instances is
//! created lazily up to the pool capacity and multiplexed across processes.
//!
//! ```text
//! ObjectPool
//! ├─ Idle:        [Obj1, Obj2, ...]   (returned by terminated processes)
//! ├─ Checked out: [Obj3, Obj4, ...]   (bound into live processes)
//! └─ Waiters:     blocked executions, bounded by the acquire timeout
//! ```

use crate::escalation::Escalation;
use crate::object::{source_guarded, AnyObject, ManagedObjectSource, SourceContext, Sourced};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

struct PoolInner {
    idle: Vec<AnyObject>,
    /// Instances alive, idle or checked out
    created: usize,
    closed: bool,
}

/// Bounded pool with blocking, time-bounded acquisition
pub struct ObjectPool {
    name: String,
    source: Arc<dyn ManagedObjectSource>,
    capacity: usize,
    timeout: Duration,
    inner: Mutex<PoolInner>,
    freed: Condvar,
}

impl ObjectPool {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ManagedObjectSource>,
        capacity: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            capacity,
            timeout,
            inner: Mutex::new(PoolInner {
                idle: Vec::with_capacity(capacity),
                created: 0,
                closed: false,
            }),
            freed: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check out an instance, blocking while the pool is exhausted
    ///
    /// Fails with [`Escalation::PoolExhausted`] once the acquisition timeout
    /// elapses, and with a sourcing escalation if a new instance cannot be
    /// created.
    pub fn acquire(&self) -> Result<AnyObject, Escalation> {
        let deadline = Instant::now() + self.timeout;
        let mut inner = self.inner.lock();

        loop {
            if inner.closed {
                return Err(Escalation::ShuttingDown);
            }

            if let Some(object) = inner.idle.pop() {
                trace!("Acquired idle {} from pool", self.name);
                return Ok(object);
            }

            if inner.created < self.capacity {
                inner.created += 1;
                drop(inner);
                return self.create();
            }

            trace!("Pool {} exhausted, waiting", self.name);
            if self.freed.wait_until(&mut inner, deadline).timed_out() && inner.idle.is_empty() {
                warn!(
                    "Pool {} exhausted for {:?} ({} instances checked out)",
                    self.name, self.timeout, inner.created
                );
                return Err(Escalation::PoolExhausted {
                    object: self.name.clone(),
                    waited: self.timeout,
                });
            }
        }
    }

    fn create(&self) -> Result<AnyObject, Escalation> {
        let sourced = source_guarded(self.source.as_ref(), SourceContext::synchronous(&self.name));
        let failure = match sourced {
            Ok(Sourced::Ready(object)) => {
                debug!("Created pooled {}", self.name);
                return Ok(object);
            }
            Ok(Sourced::Pending) => Escalation::sourcing(
                self.name.clone(),
                anyhow::anyhow!("pooled objects must be sourced synchronously"),
            ),
            Err(err) => Escalation::sourcing(self.name.clone(), err),
        };

        // Give the reserved slot back so a later attempt can retry
        let mut inner = self.inner.lock();
        inner.created -= 1;
        drop(inner);
        self.freed.notify_one();
        Err(failure)
    }

    /// Return an instance checked out by [`acquire`](Self::acquire)
    pub fn release(&self, object: AnyObject) {
        let mut inner = self.inner.lock();
        if inner.closed {
            inner.created = inner.created.saturating_sub(1);
            drop(inner);
            self.source.dispose(object);
            return;
        }

        inner.idle.push(object);
        drop(inner);
        self.freed.notify_one();
    }

    /// Dispose idle instances and refuse new acquisitions
    ///
    /// Instances still checked out are disposed as they are released.
    pub fn close(&self) {
        let idle = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.created -= inner.idle.len();
            std::mem::take(&mut inner.idle)
        };
        self.freed.notify_all();

        debug!("Closing pool {} ({} idle instances)", self.name, idle.len());
        for object in idle {
            self.source.dispose(object);
        }
    }

    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        PoolStats {
            capacity: self.capacity,
            created: inner.created,
            idle: inner.idle.len(),
            checked_out: inner.created - inner.idle.len(),
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub created: usize,
    pub idle: usize,
    pub checked_out: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::FnSource;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_pool(capacity: usize, timeout: Duration) -> (Arc<ObjectPool>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let source = FnSource::new(move |_ctx: SourceContext| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(Sourced::Ready(Arc::new(n) as AnyObject))
        });
        let pool = ObjectPool::new("connection", Arc::new(source), capacity, timeout);
        (Arc::new(pool), created)
    }

    #[test]
    fn test_pool_creates_lazily() {
        let (pool, created) = counting_pool(4, Duration::from_millis(100));
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let object = pool.acquire().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().checked_out, 1);

        pool.release(object);
        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.checked_out, 0);

        // idle instance is reused rather than created again
        let _again = pool.acquire().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exhaustion_times_out() {
        let (pool, _) = counting_pool(1, Duration::from_millis(30));
        let _held = pool.acquire().unwrap();

        let started = Instant::now();
        let result = pool.acquire();
        assert!(matches!(result, Err(Escalation::PoolExhausted { .. })));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_release_wakes_blocked_acquirer() {
        let (pool, _) = counting_pool(1, Duration::from_secs(5));
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire().map(|_| ()))
        };

        std::thread::sleep(Duration::from_millis(20));
        pool.release(held);
        assert!(waiter.join().unwrap().is_ok());
    }

    #[test]
    fn test_concurrent_acquisitions() {
        let (pool, created) = counting_pool(4, Duration::from_secs(5));
        let mut handles = vec![];

        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(std::thread::spawn(move || {
                let object = pool.acquire().unwrap();
                std::thread::sleep(Duration::from_millis(5));
                pool.release(object);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(created.load(Ordering::SeqCst) <= 4);
        assert_eq!(pool.stats().checked_out, 0);
    }

    #[test]
    fn test_failed_creation_frees_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let source = FnSource::new(move |_ctx: SourceContext| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first attempt fails");
            }
            Ok(Sourced::Ready(Arc::new(()) as AnyObject))
        });
        let pool = ObjectPool::new("flaky", Arc::new(source), 1, Duration::from_millis(50));

        assert!(matches!(pool.acquire(), Err(Escalation::Sourcing { .. })));
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_closed_pool_rejects_and_disposes() {
        let (pool, _) = counting_pool(2, Duration::from_millis(50));
        let held = pool.acquire().unwrap();
        pool.close();

        assert!(matches!(pool.acquire(), Err(Escalation::ShuttingDown)));
        pool.release(held);
        assert_eq!(pool.stats().created, 0);

        pool.reopen();
        assert!(pool.acquire().is_ok());
    }
}
