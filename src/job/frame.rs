// src/job/frame.rs
//! Flow frames
//!
//! A frame records what happens when the chain a job belongs to runs out of
//! work. Frames are owned by exactly one job at a time and move along the
//! chain with it, so each frame settles exactly once:
//!
//! - `Root`: the process's initial flow; settling releases its flow count
//! - `Sequential`: resumes the invoking function's remaining continuation
//! - `Parallel`: fires the child's callback, arrives at an optional join
//!   barrier and releases the child's flow count
//!
//! Settling walks outward iteratively, so deeply nested flows never deepen
//! the stack. An escalation unhandled by a function's own chain travels the
//! same way: each `Sequential` frame offers it to its invoker's chain, and
//! the office scope is consulted only once it reaches a `Root` frame or a
//! `Parallel` frame without a callback.

use crate::escalation::Escalation;
use crate::function::context::SequentialRequest;
use crate::function::{FlowCallback, FunctionId, Parameter};
use crate::job::Job;
use crate::office::shared::OfficeCore;
use crate::process::ProcessState;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Work left for a function after its body returned
pub(crate) struct Continuation {
    /// The function whose body produced this continuation
    pub(crate) invoker: FunctionId,
    pub(crate) sequential: VecDeque<SequentialRequest>,
    pub(crate) next: Option<(FunctionId, Option<Parameter>)>,
    /// Handler depth carried along the chain
    pub(crate) depth: u32,
}

impl Continuation {
    pub(crate) fn empty(invoker: FunctionId, depth: u32) -> Self {
        Self {
            invoker,
            sequential: VecDeque::new(),
            next: None,
            depth,
        }
    }
}

pub(crate) struct SequentialFrame {
    pub(crate) parent: Frame,
    pub(crate) resume: Continuation,
}

pub(crate) struct ParallelFrame {
    pub(crate) callback: Option<FlowCallback>,
    pub(crate) join: Option<Arc<JoinBarrier>>,
}

pub(crate) enum Frame {
    Root,
    Sequential(Box<SequentialFrame>),
    Parallel(ParallelFrame),
}

impl Frame {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Frame::Root => "root",
            Frame::Sequential(_) => "sequential",
            Frame::Parallel(_) => "parallel",
        }
    }
}

/// How a frame's chain ended
pub(crate) enum FrameOutcome {
    Done,
    /// Unhandled escalation, with the handler depth it was raised at
    Escalated(Escalation, u32),
    /// The process failed or its team stopped; nothing else runs
    Aborted(Escalation),
}

/// Holds a function's continuation until all of its parallel children arrive
pub(crate) struct JoinBarrier {
    remaining: AtomicUsize,
    waiting: Mutex<Option<(Frame, Continuation)>>,
}

impl JoinBarrier {
    /// `children` arrivals plus one for the spawning job itself
    pub(crate) fn new(children: usize, frame: Frame, continuation: Continuation) -> Self {
        Self {
            remaining: AtomicUsize::new(children + 1),
            waiting: Mutex::new(Some((frame, continuation))),
        }
    }

    /// Record one arrival; the last one takes the held continuation
    pub(crate) fn arrive(&self) -> Option<(Frame, Continuation)> {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.waiting.lock().take()
        } else {
            None
        }
    }
}

/// Start the next piece of `continuation`, or hand the frame back when none is left
pub(crate) fn advance(
    core: &Arc<OfficeCore>,
    process: &Arc<ProcessState>,
    frame: Frame,
    mut continuation: Continuation,
) -> Option<Frame> {
    if let Some(step) = continuation.sequential.pop_front() {
        let depth = continuation.depth;
        let child = Frame::Sequential(Box::new(SequentialFrame {
            parent: frame,
            resume: continuation,
        }));
        core.submit(Job::new(
            Arc::clone(core),
            Arc::clone(process),
            step.target,
            step.parameter,
            child,
            depth,
        ));
        return None;
    }

    if let Some((next, parameter)) = continuation.next.take() {
        core.submit(Job::new(
            Arc::clone(core),
            Arc::clone(process),
            next,
            parameter,
            frame,
            continuation.depth,
        ));
        return None;
    }

    Some(frame)
}

/// Settle a frame and every enclosing frame it completes
pub(crate) fn settle(
    core: &Arc<OfficeCore>,
    process: &Arc<ProcessState>,
    mut frame: Frame,
    mut outcome: FrameOutcome,
) {
    loop {
        trace!("Settling {} frame of process {}", frame.kind(), process.id());
        match frame {
            Frame::Root => {
                match outcome {
                    FrameOutcome::Done => {}
                    FrameOutcome::Escalated(escalation, depth) => {
                        if let Some(handler) = core.office_handler(&escalation, depth) {
                            hand_off(core, process, handler, escalation, Frame::Root, depth);
                            return;
                        }
                        core.fail_process(process, escalation);
                    }
                    FrameOutcome::Aborted(escalation) => core.fail_process(process, escalation),
                }
                core.release_flow(process);
                return;
            }

            Frame::Sequential(sequential) => {
                let SequentialFrame { parent, resume } = *sequential;
                match outcome {
                    FrameOutcome::Done => match advance(core, process, parent, resume) {
                        Some(parent) => {
                            frame = parent;
                            outcome = FrameOutcome::Done;
                        }
                        None => return,
                    },
                    FrameOutcome::Escalated(escalation, depth) => {
                        // the flow failed as a whole; the invoker's handlers are next
                        match core.handler_for(resume.invoker, &escalation, depth) {
                            Some(handler) => {
                                hand_off(core, process, handler, escalation, parent, depth);
                                return;
                            }
                            None => {
                                frame = parent;
                                outcome = FrameOutcome::Escalated(escalation, depth);
                            }
                        }
                    }
                    FrameOutcome::Aborted(escalation) => {
                        frame = parent;
                        outcome = FrameOutcome::Aborted(escalation);
                    }
                }
            }

            Frame::Parallel(parallel) => {
                let ParallelFrame { callback, join } = parallel;
                let result = match outcome {
                    FrameOutcome::Done => Ok(()),
                    FrameOutcome::Escalated(escalation, depth) => {
                        if callback.is_some() {
                            debug!(
                                "Parallel flow of process {} escalated to its callback: {}",
                                process.id(),
                                escalation
                            );
                        } else {
                            // a callback-less child is a root of the process
                            if let Some(handler) = core.office_handler(&escalation, depth) {
                                let frame = Frame::Parallel(ParallelFrame { callback, join });
                                hand_off(core, process, handler, escalation, frame, depth);
                                return;
                            }
                            core.fail_process(process, escalation.clone());
                        }
                        Err(escalation)
                    }
                    FrameOutcome::Aborted(escalation) => Err(escalation),
                };
                if let Some(callback) = callback {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(result))).is_err() {
                        warn!("Flow callback of process {} panicked", process.id());
                    }
                }

                let resumed = join.and_then(|barrier| barrier.arrive());
                core.release_flow(process);
                match resumed {
                    Some((parent, continuation)) => {
                        match advance(core, process, parent, continuation) {
                            Some(parent) => {
                                frame = parent;
                                outcome = FrameOutcome::Done;
                            }
                            None => return,
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

/// Run `handler` in `frame`; its own continuation replaces what the frame had left
fn hand_off(
    core: &Arc<OfficeCore>,
    process: &Arc<ProcessState>,
    handler: FunctionId,
    escalation: Escalation,
    frame: Frame,
    depth: u32,
) {
    trace!(
        "Escalation `{}` of process {} handed to {} in its {} frame",
        escalation.kind(),
        process.id(),
        core.function(handler).name,
        frame.kind()
    );
    core.counters().record_handled();
    core.submit(Job::handler(
        Arc::clone(core),
        Arc::clone(process),
        handler,
        escalation,
        frame,
        depth + 1,
    ));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_barrier_releases_on_last_arrival() {
        let barrier = JoinBarrier::new(2, Frame::Root, Continuation::empty(FunctionId(0), 0));
        assert!(barrier.arrive().is_none());
        assert!(barrier.arrive().is_none());
        let (frame, continuation) = barrier.arrive().unwrap();
        assert_eq!(frame.kind(), "root");
        assert_eq!(continuation.invoker, FunctionId(0));
        // nothing left once taken
        assert!(barrier.waiting.lock().is_none());
    }

    #[test]
    fn test_join_barrier_concurrent_arrivals() {
        let barrier = Arc::new(JoinBarrier::new(
            15,
            Frame::Root,
            Continuation::empty(FunctionId(1), 0),
        ));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || barrier.arrive().is_some())
            })
            .collect();
        let released = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|released| *released)
            .count();
        assert_eq!(released, 1);
    }
}
