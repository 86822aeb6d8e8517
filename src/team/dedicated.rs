// src/team/dedicated.rs
//! Team backed by exactly one thread

use crate::escalation::Escalation;
use crate::job::Job;
use crate::team::worker::Lane;
use crate::utils::errors::Result;
use parking_lot::RwLock;
use std::time::{Duration, Instant};

/// Runs its jobs one at a time, in submission order, on a single thread
pub struct DedicatedTeam {
    name: String,
    stop_timeout: Duration,
    lane: RwLock<Option<Lane>>,
}

impl DedicatedTeam {
    pub fn new(name: &str, stop_timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            stop_timeout,
            lane: RwLock::new(None),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut lane = self.lane.write();
        if lane.is_none() {
            *lane = Some(Lane::spawn(&self.name, 0)?);
        }
        Ok(())
    }

    pub(crate) fn submit(&self, job: Job) {
        let rejected = {
            let lane = self.lane.read();
            match lane.as_ref() {
                Some(lane) => lane.send(job).err(),
                None => Some(job),
            }
        };
        if let Some(job) = rejected {
            job.cancel(Escalation::TeamStopped {
                team: self.name.clone(),
            });
        }
    }

    pub fn stop(&self) -> bool {
        let lane = self.lane.write().take();
        match lane {
            Some(lane) => lane.stop(Instant::now() + self.stop_timeout),
            None => true,
        }
    }

    pub fn workers(&self) -> usize {
        usize::from(self.lane.read().is_some())
    }

    pub fn queued(&self) -> usize {
        self.lane.read().as_ref().map_or(0, Lane::queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_and_stop() {
        let team = DedicatedTeam::new("log", Duration::from_secs(2));
        assert_eq!(team.workers(), 0);
        team.start().unwrap();
        team.start().unwrap();
        assert_eq!(team.workers(), 1);
        assert!(team.stop());
        assert_eq!(team.workers(), 0);
        assert!(team.stop());
    }
}
