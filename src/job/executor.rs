// src/job/executor.rs
//! Job execution
//!
//! 1. refuse to run for a closed office or a failed process
//! 2. resolve dependencies (may park the job until an object is ready)
//! 3. run the body, converting a panic into an escalation
//! 4. submit parallel children, then the continuation, or route the escalation

use crate::escalation::Escalation;
use crate::function::context::FunctionOutput;
use crate::function::{FunctionContext, FunctionId, LinkedFunction};
use crate::job::frame::{self, Continuation, Frame, FrameOutcome, JoinBarrier, ParallelFrame};
use crate::job::Job;
use crate::object::registry::Lookup;
use crate::object::{thread_scope, AnyObject, ObjectScope};
use crate::observability::{ESCALATIONS, JOBS_EXECUTED};
use crate::office::shared::OfficeCore;
use crate::process::ProcessState;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

impl Job {
    pub(crate) fn execute(self) {
        let core = Arc::clone(&self.core);
        if !core.accepts_jobs() {
            self.cancel(Escalation::ShuttingDown);
            return;
        }
        if self.process.is_failed() {
            self.abort(Escalation::Cancelled);
            return;
        }

        let function = core.function(self.function);
        let Some((job, dependencies)) = self.resolve_dependencies(function) else {
            return;
        };
        job.run(function, dependencies);
    }

    /// Resolve every dependency of `function`; `None` if the job was parked or settled
    fn resolve_dependencies(
        self,
        function: &LinkedFunction,
    ) -> Option<(Job, Vec<AnyObject>)> {
        let core = Arc::clone(&self.core);
        let process = Arc::clone(&self.process);
        let mut job = self;
        let mut resolved = Vec::with_capacity(function.dependencies.len());

        for dependency in &function.dependencies {
            let object = core.object(dependency.object);
            if object.scope == ObjectScope::Thread {
                match thread_scope::acquire(core.id(), object) {
                    Ok(instance) => resolved.push(instance),
                    Err(escalation) => {
                        job.route_escalation(escalation);
                        return None;
                    }
                }
                continue;
            }

            match process.objects().lookup(&process, object, job) {
                Lookup::Ready(returned, instance) => {
                    job = returned;
                    resolved.push(instance);
                }
                Lookup::Parked => return None,
                Lookup::Failed(returned, escalation) => {
                    returned.route_escalation(escalation);
                    return None;
                }
            }
        }
        Some((job, resolved))
    }

    fn run(mut self, function: &LinkedFunction, dependencies: Vec<AnyObject>) {
        let started = Instant::now();
        let parameter = self.parameter.take();
        let escalation = self.escalation.take();
        let mut ctx = FunctionContext::new(
            function,
            self.process.id(),
            parameter,
            escalation.as_ref(),
            dependencies,
            self.process.context_token(),
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| function.body.execute(&mut ctx)))
            .unwrap_or_else(|payload| {
                Err(Escalation::WorkerPanic {
                    function: function.name.clone(),
                    message: panic_message(payload.as_ref()),
                })
            });
        let output = ctx.into_output();

        metrics::counter!(JOBS_EXECUTED).increment(1);
        self.core.counters().record_executed();
        trace!(
            "Executed {} for process {} in {:?}",
            function.name,
            self.process.id(),
            started.elapsed()
        );

        match result {
            Ok(()) => self.continue_with(function, output),
            Err(escalation) => {
                if let Escalation::WorkerPanic { message, .. } = &escalation {
                    warn!("Function {} panicked: {}", function.name, message);
                }
                self.route_escalation(escalation);
            }
        }
    }

    fn continue_with(mut self, function: &LinkedFunction, output: FunctionOutput) {
        let Some(frame) = self.take_frame() else {
            return;
        };
        let FunctionOutput {
            next_parameter,
            sequential,
            parallel,
            join,
        } = output;

        let continuation = Continuation {
            invoker: self.function,
            sequential: sequential.into(),
            next: function.next.map(|next| (next, next_parameter)),
            depth: self.depth,
        };

        if parallel.is_empty() {
            if let Some(frame) = frame::advance(&self.core, &self.process, frame, continuation) {
                frame::settle(&self.core, &self.process, frame, FrameOutcome::Done);
            }
            return;
        }

        let (held, barrier) = if join {
            let barrier = Arc::new(JoinBarrier::new(parallel.len(), frame, continuation));
            (None, Some(barrier))
        } else {
            (Some((frame, continuation)), None)
        };

        debug!(
            "{} spawning {} parallel flow(s) in process {}{}",
            function.name,
            parallel.len(),
            self.process.id(),
            if join { " with join" } else { "" }
        );
        for request in parallel {
            self.process.add_flow();
            let child = Frame::Parallel(ParallelFrame {
                callback: request.callback,
                join: barrier.clone(),
            });
            self.core.submit(Job::new(
                Arc::clone(&self.core),
                Arc::clone(&self.process),
                request.target,
                request.parameter,
                child,
                self.depth,
            ));
        }

        let resumed = match (held, barrier) {
            (Some(held), _) => Some(held),
            (None, Some(barrier)) => barrier.arrive(),
            (None, None) => None,
        };
        if let Some((frame, continuation)) = resumed {
            if let Some(frame) = frame::advance(&self.core, &self.process, frame, continuation) {
                frame::settle(&self.core, &self.process, frame, FrameOutcome::Done);
            }
        }
    }

    /// Hand an escalation to the function's handler chain, or settle the frame with it
    pub(crate) fn route_escalation(mut self, escalation: Escalation) {
        if escalation.is_cancellation() {
            self.cancel(escalation);
            return;
        }
        let Some(frame) = self.take_frame() else {
            return;
        };
        escalate(&self.core, &self.process, self.function, frame, escalation, self.depth);
    }
}

/// Route `escalation` raised by `id` through its own handler chain
///
/// Unhandled, the frame settles with it and the escalation continues along
/// the dynamic call chain.
fn escalate(
    core: &Arc<OfficeCore>,
    process: &Arc<ProcessState>,
    id: FunctionId,
    frame: Frame,
    escalation: Escalation,
    depth: u32,
) {
    let function = core.function(id);
    metrics::counter!(ESCALATIONS, "kind" => escalation.kind().to_string()).increment(1);
    match core.handler_for(id, &escalation, depth) {
        Some(handler) => {
            debug!(
                "Escalation `{}` from {} handled by {}",
                escalation.kind(),
                function.name,
                core.function(handler).name
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
        None => {
            trace!(
                "Escalation `{}` from {} unhandled in its scope",
                escalation.kind(),
                function.name
            );
            frame::settle(core, process, frame, FrameOutcome::Escalated(escalation, depth));
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
