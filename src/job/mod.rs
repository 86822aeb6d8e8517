// src/job/mod.rs
//! Jobs: one scheduled function invocation plus its continuation
//!
//! A job belongs to exactly one team at a time. Executing it runs the
//! function body and then either submits the continuation (next function,
//! flows) or routes the escalation. A job that is dropped before executing
//! cancels itself, so a torn-down queue never loses work silently. A job
//! dropped while the engine unwinds is parked for its worker, which
//! escalates `WorkerPanic` through the job's handler chain.

pub(crate) mod executor;
pub(crate) mod frame;

use crate::escalation::Escalation;
use crate::function::{FunctionId, Parameter};
use crate::observability::JOBS_CANCELLED;
use crate::office::shared::OfficeCore;
use crate::process::{ProcessId, ProcessState};
use crate::team::{worker, ContextToken};
use frame::{Frame, FrameOutcome};
use std::fmt;
use std::sync::Arc;
use tracing::trace;

pub struct Job {
    core: Arc<OfficeCore>,
    process: Arc<ProcessState>,
    function: FunctionId,
    parameter: Option<Parameter>,
    /// Set when this job runs a handler
    escalation: Option<Escalation>,
    depth: u32,
    /// Taken when the job settles; `None` afterwards
    frame: Option<Frame>,
}

impl Job {
    pub(crate) fn new(
        core: Arc<OfficeCore>,
        process: Arc<ProcessState>,
        function: FunctionId,
        parameter: Option<Parameter>,
        frame: Frame,
        depth: u32,
    ) -> Self {
        Self {
            core,
            process,
            function,
            parameter,
            escalation: None,
            depth,
            frame: Some(frame),
        }
    }

    /// A job running `handler` for `escalation` in place of the failed chain
    pub(crate) fn handler(
        core: Arc<OfficeCore>,
        process: Arc<ProcessState>,
        handler: FunctionId,
        escalation: Escalation,
        frame: Frame,
        depth: u32,
    ) -> Self {
        let mut job = Self::new(core, process, handler, None, frame, depth);
        job.escalation = Some(escalation);
        job
    }

    pub fn process_id(&self) -> ProcessId {
        self.process.id()
    }

    pub(crate) fn function_id(&self) -> FunctionId {
        self.function
    }

    pub fn function_name(&self) -> &str {
        &self.core.function(self.function).name
    }

    pub(crate) fn process(&self) -> &Arc<ProcessState> {
        &self.process
    }

    /// Affinity lane the job's process is pinned to
    pub(crate) fn context(&self) -> Option<ContextToken> {
        self.process.context_token()
    }

    /// Pin the process to `token` unless it already is; returns the effective lane
    pub(crate) fn bind_context(&self, token: ContextToken) -> ContextToken {
        self.process.pin_context(token)
    }

    /// Submit again to the responsible team, e.g. after an object became ready
    pub(crate) fn resubmit(self) {
        let core = Arc::clone(&self.core);
        core.submit(self);
    }

    /// The job can no longer run: fail its process and settle its frame
    pub(crate) fn cancel(mut self, escalation: Escalation) {
        trace!(
            "Cancelling {} of process {}: {}",
            self.function_name(),
            self.process.id(),
            escalation
        );
        self.core.fail_process(&self.process, escalation.clone());
        self.settle(FrameOutcome::Aborted(escalation));
    }

    /// Skip the job because its process already failed
    pub(crate) fn abort(mut self, escalation: Escalation) {
        self.settle(FrameOutcome::Aborted(escalation));
    }

    /// Drop without settling; only for processes already force-terminated
    pub(crate) fn discard(mut self) {
        self.frame = None;
    }

    fn settle(&mut self, outcome: FrameOutcome) {
        if let Some(frame) = self.frame.take() {
            if matches!(outcome, FrameOutcome::Aborted(_)) {
                metrics::counter!(JOBS_CANCELLED).increment(1);
                self.core.counters().record_cancelled();
            }
            frame::settle(&self.core, &self.process, frame, outcome);
        }
    }

    fn take_frame(&mut self) -> Option<Frame> {
        self.frame.take()
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };

        if std::thread::panicking() {
            // engine code around the body unwound; `run_job` escalates once it is caught
            let parked = Job {
                core: Arc::clone(&self.core),
                process: Arc::clone(&self.process),
                function: self.function,
                parameter: None,
                escalation: None,
                depth: self.depth,
                frame: Some(frame),
            };
            if let Some(mut orphan) = worker::park_unwound(parked) {
                let escalation = Escalation::WorkerPanic {
                    function: orphan.function_name().to_string(),
                    message: "thread exited while unwinding".to_string(),
                };
                self.core.fail_process(&self.process, escalation.clone());
                orphan.settle(FrameOutcome::Aborted(escalation));
            }
            return;
        }

        let team = self.core.team_of(self.function).name().to_string();
        let escalation = Escalation::TeamStopped { team };
        self.core.fail_process(&self.process, escalation.clone());
        self.frame = Some(frame);
        self.settle(FrameOutcome::Aborted(escalation));
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("function", &self.function_name())
            .field("process", &self.process.id())
            .field("depth", &self.depth)
            .field("handler", &self.escalation.is_some())
            .finish()
    }
}
