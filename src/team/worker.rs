// src/team/worker.rs
//! Worker thread plumbing shared by the team variants

use crate::escalation::Escalation;
use crate::job::executor::panic_message;
use crate::job::Job;
use crate::observability::WORKER_PANICS;
use crate::process::ProcessOutcome;
use crate::team::ContextToken;
use crate::utils::errors::{EngineError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, error, trace};

thread_local! {
    static CURRENT_WORKER: RefCell<Option<String>> = const { RefCell::new(None) };
    /// Jobs dropped while engine code unwound, waiting for `run_job` to escalate them
    static UNWOUND: RefCell<Vec<Job>> = const { RefCell::new(Vec::new()) };
}

/// Message delivered to a single-thread lane
pub enum LaneMessage {
    Run(Job),
    /// Outcome for a thread waiting in `invoke_and_wait`; ignored by team lanes
    Complete(ProcessOutcome),
    Stop,
}

/// Name of the engine worker running on this thread, if any
pub(crate) fn current_worker() -> Option<String> {
    CURRENT_WORKER
        .try_with(|current| current.borrow().clone())
        .ok()
        .flatten()
}

/// Marks the thread as executing engine jobs until dropped
pub(crate) struct WorkerScope {
    previous: Option<String>,
}

pub(crate) fn enter(name: &str) -> WorkerScope {
    let previous = CURRENT_WORKER
        .try_with(|current| current.borrow_mut().replace(name.to_string()))
        .ok()
        .flatten();
    WorkerScope { previous }
}

impl Drop for WorkerScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = CURRENT_WORKER.try_with(|current| *current.borrow_mut() = previous);
    }
}

/// Execute one job, keeping the worker alive if the engine itself panics
///
/// Panics inside function bodies are already turned into escalations by the
/// executor. A panic in the engine code around a body unwinds to here; the
/// job it dropped on the way was parked and is now escalated as
/// `WorkerPanic` through its own handler chain.
pub(crate) fn run_job(job: Job) {
    let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| job.execute())) else {
        return;
    };

    let message = panic_message(payload.as_ref());
    metrics::counter!(WORKER_PANICS).increment(1);
    error!(
        "Worker {:?} recovered from a panic outside a function body: {}",
        current_worker(),
        message
    );
    while let Some(job) = take_unwound() {
        let escalation = Escalation::WorkerPanic {
            function: job.function_name().to_string(),
            message: message.clone(),
        };
        job.route_escalation(escalation);
    }
}

/// Hold a job dropped during unwinding; hands it back if the thread is exiting
pub(crate) fn park_unwound(job: Job) -> Option<Job> {
    let mut job = Some(job);
    let _ = UNWOUND.try_with(|parked| {
        if let Some(job) = job.take() {
            parked.borrow_mut().push(job);
        }
    });
    job
}

fn take_unwound() -> Option<Job> {
    UNWOUND
        .try_with(|parked| parked.borrow_mut().pop())
        .ok()
        .flatten()
}

/// Signals a worker's exit when dropped, including on unwind
pub(crate) struct ExitSignal(pub(crate) Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

/// A single dedicated thread draining a FIFO channel
///
/// Jobs sent to one lane execute in send order on the same thread.
pub(crate) struct Lane {
    token: ContextToken,
    thread_name: String,
    sender: Sender<LaneMessage>,
    exited: Receiver<()>,
}

impl Lane {
    pub(crate) fn spawn(team: &str, index: usize) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded::<LaneMessage>();
        let (exit_tx, exited) = crossbeam_channel::bounded(1);
        let thread_name = format!("{}-{}", team, index);
        let team_name = team.to_string();
        let scope_name = thread_name.clone();

        std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let _exit = ExitSignal(exit_tx);
                let _scope = enter(&scope_name);
                trace!("Lane {} started", scope_name);

                for message in receiver.iter() {
                    match message {
                        LaneMessage::Run(job) => run_job(job),
                        LaneMessage::Stop => break,
                        LaneMessage::Complete(_) => {}
                    }
                }

                for message in receiver.try_iter() {
                    if let LaneMessage::Run(job) = message {
                        job.cancel(Escalation::TeamStopped {
                            team: team_name.clone(),
                        });
                    }
                }
                trace!("Lane {} exiting", scope_name);
            })
            .map_err(EngineError::WorkerSpawn)?;

        Ok(Self {
            token: ContextToken::allocate(),
            thread_name,
            sender,
            exited,
        })
    }

    pub(crate) fn token(&self) -> ContextToken {
        self.token
    }

    pub(crate) fn sender(&self) -> Sender<LaneMessage> {
        self.sender.clone()
    }

    pub(crate) fn send(&self, job: Job) -> std::result::Result<(), Job> {
        match self.sender.send(LaneMessage::Run(job)) {
            Ok(()) => Ok(()),
            Err(rejected) => match rejected.into_inner() {
                LaneMessage::Run(job) => Err(job),
                _ => Ok(()),
            },
        }
    }

    pub(crate) fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Ask the lane to exit and wait until `deadline`; `true` if it exited
    pub(crate) fn stop(&self, deadline: Instant) -> bool {
        let _ = self.sender.send(LaneMessage::Stop);
        match self.exited.recv_deadline(deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Lane {} stopped", self.thread_name);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_scope_nests_and_restores() {
        assert_eq!(current_worker(), None);
        {
            let _outer = enter("pool-0");
            assert_eq!(current_worker().as_deref(), Some("pool-0"));
            {
                let _inner = enter("passive");
                assert_eq!(current_worker().as_deref(), Some("passive"));
            }
            assert_eq!(current_worker().as_deref(), Some("pool-0"));
        }
        assert_eq!(current_worker(), None);
    }

    #[test]
    fn test_lane_stops_within_deadline() {
        let lane = Lane::spawn("io", 0).unwrap();
        assert_eq!(lane.queued(), 0);
        assert!(lane.stop(Instant::now() + std::time::Duration::from_secs(2)));
    }

    #[test]
    fn test_lane_tokens_are_distinct() {
        let a = Lane::spawn("a", 0).unwrap();
        let b = Lane::spawn("b", 0).unwrap();
        assert_ne!(a.token(), b.token());
        let deadline = Instant::now() + std::time::Duration::from_secs(2);
        assert!(a.stop(deadline));
        assert!(b.stop(deadline));
    }
}
