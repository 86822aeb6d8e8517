// src/process/mod.rs
//! Process state
//!
//! A process is one logical execution started through the input gateway or
//! an office invoke call. Its state is created exactly once, owned by the
//! process, and mutated by every job belonging to it:
//!
//! - an active-flow counter: the root flow holds one increment, every
//!   parallel child holds one more; the process terminates when it reaches zero
//! - a failure latch: the first unhandled escalation wins, later ones are
//!   counted as suppressed
//! - the managed object registry ([`ProcessObjects`])
//! - the completion target (callback, waiting thread or future)

use crate::escalation::Escalation;
use crate::object::ProcessObjects;
use crate::team::{ContextToken, LaneMessage};
use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use ulid::Ulid;

/// Final result of a process
pub type ProcessOutcome = Result<(), Escalation>;

/// Fire-and-forget completion callback
pub type ProcessCallback = Box<dyn FnOnce(ProcessOutcome) + Send + 'static>;

/// Unique process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessId(Ulid);

impl ProcessId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc_{}", self.0)
    }
}

/// Where the outcome goes once the process terminates
pub(crate) enum Completion {
    Detached,
    Callback(ProcessCallback),
    /// A thread blocked in `invoke_and_wait`, pumping its affinity lane
    Lane(Sender<LaneMessage>),
    Notify(oneshot::Sender<ProcessOutcome>),
}

/// Per-process registry and completion accounting
pub struct ProcessState {
    id: ProcessId,
    flow: String,
    started_at: DateTime<Utc>,
    active: AtomicUsize,
    failure: OnceCell<Escalation>,
    suppressed: AtomicUsize,
    terminated: AtomicBool,
    objects: ProcessObjects,
    context: OnceCell<ContextToken>,
    completion: Mutex<Option<Completion>>,
}

impl ProcessState {
    pub(crate) fn new(flow: &str, object_count: usize, completion: Completion) -> Self {
        Self {
            id: ProcessId::generate(),
            flow: flow.to_string(),
            started_at: Utc::now(),
            active: AtomicUsize::new(1),
            failure: OnceCell::new(),
            suppressed: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            objects: ProcessObjects::new(object_count),
            context: OnceCell::new(),
            completion: Mutex::new(Some(completion)),
        }
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn flow(&self) -> &str {
        &self.flow
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Flows still holding the process open
    pub fn active_flows(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failure.get().is_some()
    }

    /// The escalation that failed the process, if any
    pub fn failure(&self) -> Option<&Escalation> {
        self.failure.get()
    }

    /// Escalations that reached the latch after the first
    pub fn suppressed_failures(&self) -> usize {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn objects(&self) -> &ProcessObjects {
        &self.objects
    }

    /// Affinity lane this process is pinned to
    pub fn context_token(&self) -> Option<ContextToken> {
        self.context.get().copied()
    }

    /// Pin to `token` unless already pinned; returns the lane in effect
    pub(crate) fn pin_context(&self, token: ContextToken) -> ContextToken {
        *self.context.get_or_init(|| token)
    }

    pub(crate) fn add_flow(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Release one flow; `true` when this was the last one
    pub(crate) fn release_flow(&self) -> bool {
        match self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(previous) => previous == 1,
            Err(_) => {
                warn!("Process {} released more flows than it held", self.id);
                false
            }
        }
    }

    /// Latch a failure; `true` if this escalation is the one surfaced
    pub(crate) fn fail(&self, escalation: Escalation) -> bool {
        match self.failure.set(escalation) {
            Ok(()) => true,
            Err(later) => {
                if !later.is_cancellation() {
                    self.suppressed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Process {} suppressed later escalation: {}",
                        self.id,
                        later.causal_chain()
                    );
                }
                false
            }
        }
    }

    /// Flip to terminated; `true` only for the first caller
    pub(crate) fn mark_terminated(&self) -> bool {
        !self.terminated.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn outcome(&self) -> ProcessOutcome {
        match self.failure.get() {
            Some(escalation) => Err(escalation.clone()),
            None => Ok(()),
        }
    }

    /// Hand the outcome to the completion target, at most once
    pub(crate) fn deliver(&self, outcome: ProcessOutcome) {
        let Some(completion) = self.completion.lock().take() else {
            return;
        };

        match completion {
            Completion::Detached => {}
            Completion::Callback(callback) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| callback(outcome)));
                if result.is_err() {
                    warn!("Completion callback of process {} panicked", self.id);
                }
            }
            Completion::Lane(lane) => {
                let _ = lane.send(LaneMessage::Complete(outcome));
            }
            Completion::Notify(sender) => {
                let _ = sender.send(outcome);
            }
        }
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.id,
            flow: self.flow.clone(),
            started_at: self.started_at,
            active_flows: self.active_flows(),
            failed: self.is_failed(),
        }
    }
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessState")
            .field("id", &self.id)
            .field("flow", &self.flow)
            .field("active", &self.active_flows())
            .field("failed", &self.is_failed())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Snapshot of a live process
#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub id: ProcessId,
    pub flow: String,
    pub started_at: DateTime<Utc>,
    pub active_flows: usize,
    pub failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_flow_counter_reaches_zero_once() {
        let process = ProcessState::new("order", 0, Completion::Detached);
        process.add_flow();
        process.add_flow();

        assert!(!process.release_flow());
        assert!(!process.release_flow());
        assert!(process.release_flow());
        assert_eq!(process.active_flows(), 0);
        // underflow is refused rather than wrapping
        assert!(!process.release_flow());
        assert_eq!(process.active_flows(), 0);
    }

    #[test]
    fn test_first_failure_wins() {
        let process = ProcessState::new("order", 0, Completion::Detached);
        assert!(process.fail(Escalation::msg("first", "a")));
        assert!(!process.fail(Escalation::msg("second", "b")));
        assert!(!process.fail(Escalation::Cancelled));

        assert_eq!(process.failure().map(|e| e.kind()), Some("first"));
        assert_eq!(process.suppressed_failures(), 1);
    }

    #[test]
    fn test_concurrent_failures_surface_exactly_one() {
        let process = Arc::new(ProcessState::new("order", 0, Completion::Detached));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let process = Arc::clone(&process);
                std::thread::spawn(move || process.fail(Escalation::msg(format!("k{}", i), "x")))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert_eq!(process.suppressed_failures(), 7);
    }

    #[test]
    fn test_deliver_is_at_most_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let process = ProcessState::new(
            "order",
            0,
            Completion::Callback(Box::new(move |outcome| {
                tx.send(outcome.is_ok()).unwrap();
            })),
        );

        assert!(process.mark_terminated());
        assert!(!process.mark_terminated());
        process.deliver(process.outcome());
        process.deliver(process.outcome());

        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![true]);
    }

    #[test]
    fn test_context_pins_once() {
        let process = ProcessState::new("order", 0, Completion::Detached);
        assert_eq!(process.context_token(), None);
        let first = ContextToken::allocate();
        let second = ContextToken::allocate();
        assert_eq!(process.pin_context(first), first);
        assert_eq!(process.pin_context(second), first);
        assert_eq!(process.context_token(), Some(first));
    }

    #[test]
    fn test_process_ids_are_unique() {
        let a = ProcessId::generate();
        let b = ProcessId::generate();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("proc_"));
    }
}
