// src/team/mod.rs
//! Teams: the thread groups that execute jobs
//!
//! A team accepts jobs from any thread. Four kinds exist:
//! - `dedicated`: one thread, FIFO
//! - `pool`: `size..=max` threads with work stealing
//! - `passive`: runs jobs on the submitting thread
//! - `affinity`: runs each job on the thread named by its context token

pub mod affinity;
pub mod dedicated;
pub mod passive;
pub mod pool;
pub(crate) mod worker;

pub use affinity::{AffinityTeam, ContextToken};
pub use dedicated::DedicatedTeam;
pub use passive::PassiveTeam;
pub use pool::{PoolTeam, WorkerPoolStats};
pub use worker::LaneMessage;

pub(crate) use affinity::LaneRegistry;

use crate::job::Job;
use crate::utils::config::TeamSettings;
use crate::utils::errors::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Index of a team within its office
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeamId(pub(crate) usize);

/// Team kind as declared in the wiring table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TeamKind {
    Dedicated,
    Pool {
        #[serde(default)]
        size: Option<usize>,
        #[serde(default)]
        max: Option<usize>,
    },
    Passive,
    Affinity {
        #[serde(default)]
        lanes: Option<usize>,
    },
}

impl TeamKind {
    pub fn name(&self) -> &'static str {
        match self {
            TeamKind::Dedicated => "dedicated",
            TeamKind::Pool { .. } => "pool",
            TeamKind::Passive => "passive",
            TeamKind::Affinity { .. } => "affinity",
        }
    }
}

/// Point-in-time view of one team
#[derive(Debug, Clone, Serialize)]
pub struct TeamStats {
    pub name: String,
    pub kind: &'static str,
    pub workers: usize,
    pub queued: usize,
}

enum TeamVariant {
    Dedicated(DedicatedTeam),
    Pool(PoolTeam),
    Passive(PassiveTeam),
    Affinity(AffinityTeam),
}

pub struct Team {
    id: TeamId,
    name: String,
    variant: TeamVariant,
}

impl Team {
    pub(crate) fn new(
        id: TeamId,
        name: &str,
        kind: &TeamKind,
        settings: &TeamSettings,
        lanes: Arc<LaneRegistry>,
    ) -> Self {
        let stop_timeout = Duration::from_millis(settings.stop_timeout_ms);
        let variant = match kind {
            TeamKind::Dedicated => TeamVariant::Dedicated(DedicatedTeam::new(name, stop_timeout)),
            TeamKind::Pool { size, max } => {
                let size = size.unwrap_or(settings.pool_size);
                TeamVariant::Pool(PoolTeam::new(
                    name,
                    size,
                    max.unwrap_or(size),
                    Duration::from_millis(settings.idle_timeout_ms),
                    stop_timeout,
                ))
            }
            TeamKind::Passive => TeamVariant::Passive(PassiveTeam::new(name)),
            TeamKind::Affinity { lanes: count } => TeamVariant::Affinity(AffinityTeam::new(
                name,
                count.unwrap_or(settings.affinity_lanes),
                stop_timeout,
                lanes,
            )),
        };
        Self {
            id,
            name: name.to_string(),
            variant,
        }
    }

    pub fn id(&self) -> TeamId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        match &self.variant {
            TeamVariant::Dedicated(_) => "dedicated",
            TeamVariant::Pool(_) => "pool",
            TeamVariant::Passive(_) => "passive",
            TeamVariant::Affinity(_) => "affinity",
        }
    }

    pub fn start(&self) -> Result<()> {
        match &self.variant {
            TeamVariant::Dedicated(team) => team.start(),
            TeamVariant::Pool(team) => team.start(),
            TeamVariant::Passive(team) => {
                team.start();
                Ok(())
            }
            TeamVariant::Affinity(team) => team.start(),
        }
    }

    /// Enqueue a job; if the team is stopped the job is cancelled instead
    pub(crate) fn submit(&self, job: Job) {
        match &self.variant {
            TeamVariant::Dedicated(team) => team.submit(job),
            TeamVariant::Pool(team) => team.submit(job),
            TeamVariant::Passive(team) => team.submit(job),
            TeamVariant::Affinity(team) => team.submit(job),
        }
    }

    /// Stop the team's threads; `false` if some worker outlived the stop timeout
    pub fn stop(&self) -> bool {
        match &self.variant {
            TeamVariant::Dedicated(team) => team.stop(),
            TeamVariant::Pool(team) => team.stop(),
            TeamVariant::Passive(team) => team.stop(),
            TeamVariant::Affinity(team) => team.stop(),
        }
    }

    pub fn stats(&self) -> TeamStats {
        let (workers, queued) = match &self.variant {
            TeamVariant::Dedicated(team) => (team.workers(), team.queued()),
            TeamVariant::Pool(team) => {
                let stats = team.stats();
                let local: usize = stats.local_queue_sizes.iter().sum();
                (stats.workers, stats.global_queue_size + local)
            }
            TeamVariant::Passive(_) => (0, 0),
            TeamVariant::Affinity(team) => (team.workers(), team.queued()),
        };
        TeamStats {
            name: self.name.clone(),
            kind: self.kind(),
            workers,
            queued,
        }
    }
}

impl std::fmt::Debug for Team {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Team")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .finish()
    }
}
