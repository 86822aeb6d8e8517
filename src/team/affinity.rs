// src/team/affinity.rs
//! Thread-affinity team
//!
//! Every job carries the context token of the thread that must run it. The
//! first affinity job of a process without a token is pinned to one of the
//! team's lanes round-robin; the token then follows the process so all of
//! its affinity work lands on that lane. Threads blocked in
//! `invoke_and_wait` register themselves as lanes too.

use crate::escalation::Escalation;
use crate::job::Job;
use crate::team::worker::{Lane, LaneMessage};
use crate::utils::errors::Result;
use crossbeam_channel::Sender;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Identifies a thread able to run affinity jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContextToken(u64);

impl ContextToken {
    pub(crate) fn allocate() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Office-wide map from context token to the lane serving it
#[derive(Default)]
pub(crate) struct LaneRegistry {
    lanes: DashMap<ContextToken, Sender<LaneMessage>>,
}

impl LaneRegistry {
    pub(crate) fn register(&self, token: ContextToken, sender: Sender<LaneMessage>) {
        self.lanes.insert(token, sender);
    }

    pub(crate) fn unregister(&self, token: ContextToken) {
        self.lanes.remove(&token);
    }

    pub(crate) fn dispatch(&self, token: ContextToken, job: Job) -> std::result::Result<(), Job> {
        let sender = match self.lanes.get(&token) {
            Some(entry) => entry.value().clone(),
            None => return Err(job),
        };
        match sender.send(LaneMessage::Run(job)) {
            Ok(()) => Ok(()),
            Err(rejected) => match rejected.into_inner() {
                LaneMessage::Run(job) => Err(job),
                _ => Ok(()),
            },
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.len()
    }
}

pub struct AffinityTeam {
    name: String,
    lane_count: usize,
    stop_timeout: Duration,
    registry: Arc<LaneRegistry>,
    lanes: RwLock<Vec<Lane>>,
    next_lane: AtomicUsize,
}

impl AffinityTeam {
    pub(crate) fn new(
        name: &str,
        lane_count: usize,
        stop_timeout: Duration,
        registry: Arc<LaneRegistry>,
    ) -> Self {
        Self {
            name: name.to_string(),
            lane_count: lane_count.max(1),
            stop_timeout,
            registry,
            lanes: RwLock::new(Vec::new()),
            next_lane: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut lanes = self.lanes.write();
        if !lanes.is_empty() {
            return Ok(());
        }
        for index in 0..self.lane_count {
            let lane = Lane::spawn(&self.name, index)?;
            self.registry.register(lane.token(), lane.sender());
            lanes.push(lane);
        }
        debug!("Affinity team {} started {} lane(s)", self.name, lanes.len());
        Ok(())
    }

    pub(crate) fn submit(&self, job: Job) {
        let token = match job.context() {
            Some(token) => Some(token),
            None => {
                let lanes = self.lanes.read();
                if lanes.is_empty() {
                    None
                } else {
                    let index = self.next_lane.fetch_add(1, Ordering::Relaxed) % lanes.len();
                    // concurrent first jobs of one process agree on a single lane
                    Some(job.bind_context(lanes[index].token()))
                }
            }
        };

        let Some(token) = token else {
            job.cancel(Escalation::TeamStopped {
                team: self.name.clone(),
            });
            return;
        };

        if let Err(job) = self.registry.dispatch(token, job) {
            job.cancel(Escalation::TeamStopped {
                team: self.name.clone(),
            });
        }
    }

    pub fn stop(&self) -> bool {
        let lanes: Vec<Lane> = std::mem::take(&mut *self.lanes.write());
        for lane in &lanes {
            self.registry.unregister(lane.token());
        }
        let deadline = Instant::now() + self.stop_timeout;
        lanes.iter().fold(true, |clean, lane| lane.stop(deadline) && clean)
    }

    pub fn workers(&self) -> usize {
        self.lanes.read().len()
    }

    pub fn queued(&self) -> usize {
        self.lanes.read().iter().map(Lane::queued).sum()
    }
}
