// src/team/pool.rs
//! Elastic thread pool team with work stealing
//!
//! Jobs enter a global injector, or the submitting worker's own deque when a
//! pool worker hands work to its own team. Idle workers steal from the
//! injector first and then from peers in random order.
//!
//! ```text
//! submit ──► Injector ◄── steal ── worker 0 [local] ◄─┐
//!               ▲                  worker 1 [local] ──┘ steal
//!               └──── steal ────── worker N (spawned on demand, retires when idle)
//! ```

use crate::escalation::Escalation;
use crate::job::Job;
use crate::team::worker::{self, ExitSignal};
use crate::utils::errors::{EngineError, Result};
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Condvar, Mutex, RwLock};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

thread_local! {
    static LOCAL_QUEUE: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

struct LocalQueue {
    pool: usize,
    deque: Worker<Job>,
}

/// Snapshot of a pool's workers and queues
#[derive(Debug, Clone, Default)]
pub struct WorkerPoolStats {
    pub workers: usize,
    pub idle_workers: usize,
    pub global_queue_size: usize,
    pub local_queue_sizes: Vec<usize>,
}

struct PoolShared {
    team: String,
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Duration,
    global_queue: Injector<Job>,
    stealers: RwLock<Vec<(usize, Stealer<Job>)>>,
    sleepers: Mutex<usize>,
    wake: Condvar,
    stopping: AtomicBool,
    live_workers: AtomicUsize,
    next_index: AtomicUsize,
    exits_tx: Sender<()>,
    exits_rx: Receiver<()>,
}

impl PoolShared {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn reserve_worker(&self) -> bool {
        self.live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_workers).then_some(live + 1)
            })
            .is_ok()
    }

    fn retire_worker(&self) -> bool {
        self.live_workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live > self.min_workers).then(|| live - 1)
            })
            .is_ok()
    }

    /// Spawn a worker for a slot already reserved in `live_workers`
    fn spawn_reserved(self: &Arc<Self>) -> Result<()> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.team, index))
            .spawn(move || shared.work(index));
        match spawned {
            Ok(_) => Ok(()),
            Err(e) => {
                self.live_workers.fetch_sub(1, Ordering::AcqRel);
                Err(EngineError::WorkerSpawn(e))
            }
        }
    }

    /// Wake a sleeping worker, or grow the pool when none is idle
    fn notify_or_grow(self: &Arc<Self>) {
        let sleepers = self.sleepers.lock();
        if *sleepers > 0 {
            self.wake.notify_one();
            return;
        }
        drop(sleepers);

        if self.reserve_worker() {
            if let Err(e) = self.spawn_reserved() {
                warn!("Team {} could not grow: {}", self.team, e);
            }
        }
    }

    fn push(self: &Arc<Self>, job: Job) {
        let key = self.key();
        let job = LOCAL_QUEUE
            .try_with(|local| match local.borrow().as_ref() {
                Some(queue) if queue.pool == key => {
                    queue.deque.push(job);
                    None
                }
                _ => Some(job),
            })
            .unwrap_or(None);

        if let Some(job) = job {
            self.global_queue.push(job);
        }
        self.notify_or_grow();
    }

    fn work(self: Arc<Self>, index: usize) {
        let worker_name = format!("{}-{}", self.team, index);
        let _scope = worker::enter(&worker_name);
        let _exit = ExitSignal(self.exits_tx.clone());

        let deque = Worker::new_fifo();
        self.stealers.write().push((index, deque.stealer()));
        let _ = LOCAL_QUEUE.try_with(|local| {
            *local.borrow_mut() = Some(LocalQueue {
                pool: self.key(),
                deque,
            })
        });
        trace!("Worker {} started", worker_name);

        let mut retired = false;
        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            if let Some(job) = self.find_job(index) {
                worker::run_job(job);
                continue;
            }

            let mut sleepers = self.sleepers.lock();
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            if !self.global_queue.is_empty() {
                continue;
            }
            *sleepers += 1;
            let timed_out = self
                .wake
                .wait_for(&mut sleepers, self.idle_timeout)
                .timed_out();
            *sleepers -= 1;
            drop(sleepers);

            if timed_out && self.global_queue.is_empty() && self.retire_worker() {
                // a push may have raced the retirement and seen no sleeper
                if !self.global_queue.is_empty() && self.reserve_worker() {
                    continue;
                }
                retired = true;
                debug!("Worker {} retiring after {:?} idle", worker_name, self.idle_timeout);
                break;
            }
        }

        self.stealers.write().retain(|(i, _)| *i != index);
        let leftover = LOCAL_QUEUE
            .try_with(|local| local.borrow_mut().take())
            .ok()
            .flatten();
        if let Some(queue) = leftover {
            while let Some(job) = queue.deque.pop() {
                if self.stopping.load(Ordering::Acquire) {
                    job.cancel(Escalation::TeamStopped {
                        team: self.team.clone(),
                    });
                } else {
                    self.global_queue.push(job);
                }
            }
        }
        if !retired {
            self.live_workers.fetch_sub(1, Ordering::AcqRel);
        }
        trace!("Worker {} exited", worker_name);
    }

    fn find_job(&self, index: usize) -> Option<Job> {
        let local = LOCAL_QUEUE
            .try_with(|local| local.borrow().as_ref().and_then(|q| q.deque.pop()))
            .ok()
            .flatten();
        if local.is_some() {
            return local;
        }

        loop {
            match self.global_queue.steal() {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        self.steal_from_others(index)
    }

    fn steal_from_others(&self, index: usize) -> Option<Job> {
        use rand::seq::SliceRandom;

        let stealers = self.stealers.read();
        let mut order: Vec<usize> = (0..stealers.len())
            .filter(|&i| stealers[i].0 != index)
            .collect();
        order.shuffle(&mut rand::thread_rng());

        for i in order {
            if let Steal::Success(job) = stealers[i].1.steal() {
                trace!("Worker {}-{} stole from worker {}", self.team, index, stealers[i].0);
                return Some(job);
            }
        }
        None
    }
}

/// Pool of `min..=max` worker threads; extra workers retire after idling
pub struct PoolTeam {
    name: String,
    min_workers: usize,
    max_workers: usize,
    idle_timeout: Duration,
    stop_timeout: Duration,
    shared: RwLock<Option<Arc<PoolShared>>>,
}

impl PoolTeam {
    pub fn new(
        name: &str,
        min_workers: usize,
        max_workers: usize,
        idle_timeout: Duration,
        stop_timeout: Duration,
    ) -> Self {
        let max_workers = max_workers.max(min_workers).max(1);
        Self {
            name: name.to_string(),
            min_workers,
            max_workers,
            idle_timeout,
            stop_timeout,
            shared: RwLock::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut slot = self.shared.write();
        if slot.is_some() {
            return Ok(());
        }

        let (exits_tx, exits_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(PoolShared {
            team: self.name.clone(),
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            idle_timeout: self.idle_timeout,
            global_queue: Injector::new(),
            stealers: RwLock::new(Vec::with_capacity(self.max_workers)),
            sleepers: Mutex::new(0),
            wake: Condvar::new(),
            stopping: AtomicBool::new(false),
            live_workers: AtomicUsize::new(0),
            next_index: AtomicUsize::new(0),
            exits_tx,
            exits_rx,
        });

        for _ in 0..self.min_workers {
            if shared.reserve_worker() {
                shared.spawn_reserved()?;
            }
        }
        debug!(
            "Pool team {} started with {} worker(s), max {}",
            self.name, self.min_workers, self.max_workers
        );
        *slot = Some(shared);
        Ok(())
    }

    pub(crate) fn submit(&self, job: Job) {
        let rejected = {
            let shared = self.shared.read();
            match shared.as_ref() {
                Some(shared) => {
                    shared.push(job);
                    None
                }
                None => Some(job),
            }
        };
        if let Some(job) = rejected {
            job.cancel(Escalation::TeamStopped {
                team: self.name.clone(),
            });
        }
    }

    /// Stop all workers, cancelling queued jobs; `true` if every worker exited in time
    pub fn stop(&self) -> bool {
        let Some(shared) = self.shared.write().take() else {
            return true;
        };

        shared.stopping.store(true, Ordering::Release);
        {
            let _sleepers = shared.sleepers.lock();
            shared.wake.notify_all();
        }

        let deadline = Instant::now() + self.stop_timeout;
        while shared.live_workers.load(Ordering::Acquire) > 0 {
            if shared.exits_rx.recv_deadline(deadline).is_err() {
                break;
            }
        }

        let mut cancelled = 0usize;
        loop {
            match shared.global_queue.steal() {
                Steal::Success(job) => {
                    cancelled += 1;
                    job.cancel(Escalation::TeamStopped {
                        team: self.name.clone(),
                    });
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        let stuck = shared.live_workers.load(Ordering::Acquire);
        if stuck > 0 {
            warn!(
                "Team {} left {} worker(s) running past the stop timeout",
                self.name, stuck
            );
        }
        debug!("Pool team {} stopped, {} queued job(s) cancelled", self.name, cancelled);
        stuck == 0
    }

    pub fn stats(&self) -> WorkerPoolStats {
        let shared = self.shared.read();
        let Some(shared) = shared.as_ref() else {
            return WorkerPoolStats::default();
        };
        let local_queue_sizes = shared
            .stealers
            .read()
            .iter()
            .map(|(_, stealer)| stealer.len())
            .collect();
        let stats = WorkerPoolStats {
            workers: shared.live_workers.load(Ordering::Acquire),
            idle_workers: *shared.sleepers.lock(),
            global_queue_size: shared.global_queue.len(),
            local_queue_sizes,
        };
        stats
    }
}
