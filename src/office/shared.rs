// src/office/shared.rs
//! Shared office runtime state
//!
//! Owned by the `Office` and by every job, so jobs can reach their team,
//! their function and the process table from any thread.

use crate::escalation::{Escalation, EscalationScope};
use crate::function::{FunctionId, LinkedFunction, Parameter};
use crate::job::frame::Frame;
use crate::job::Job;
use crate::object::{AnyObject, LinkedObject, ObjectId, ObjectPool};
use crate::observability::{PROCESSES_COMPLETED, PROCESSES_FAILED, PROCESSES_STARTED};
use crate::office::gateway::InputSources;
use crate::office::linker::Linked;
use crate::process::{Completion, ProcessId, ProcessState};
use crate::team::{ContextToken, LaneRegistry, Team};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

static NEXT_OFFICE: AtomicU64 = AtomicU64::new(1);

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const CLOSING: u8 = 2;

/// Monotonic counters behind `OfficeStats`
#[derive(Debug, Default)]
pub(crate) struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    executed: AtomicU64,
    cancelled: AtomicU64,
    handled: AtomicU64,
}

impl Counters {
    pub(crate) fn record_executed(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn executed(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub(crate) fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

/// Outcome of closing an office
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Processes that finished on their own during the drain
    pub drained: usize,
    /// Processes terminated with `ShuttingDown` after the close timeout
    pub forced: usize,
    /// Every team worker exited within its stop timeout
    pub teams_stopped_cleanly: bool,
}

pub(crate) struct OfficeCore {
    id: u64,
    config: EngineConfig,
    functions: Vec<LinkedFunction>,
    objects: Vec<LinkedObject>,
    pools: Vec<Arc<ObjectPool>>,
    flows: HashMap<String, FunctionId>,
    inputs: HashMap<String, ObjectId>,
    office_scope: Arc<EscalationScope>,
    teams: Vec<Team>,
    pub(crate) lanes: Arc<LaneRegistry>,
    pub(crate) input_sources: InputSources,
    processes: DashMap<ProcessId, Arc<ProcessState>>,
    state: AtomicU8,
    closed_once: AtomicBool,
    lifecycle: Mutex<()>,
    drained: Mutex<()>,
    drained_signal: Condvar,
    counters: Counters,
}

impl OfficeCore {
    pub(crate) fn new(
        config: EngineConfig,
        linked: Linked,
        lanes: Arc<LaneRegistry>,
        input_sources: InputSources,
    ) -> Self {
        Self {
            id: NEXT_OFFICE.fetch_add(1, Ordering::Relaxed),
            config,
            functions: linked.functions,
            objects: linked.objects,
            pools: linked.pools,
            flows: linked.flows,
            inputs: linked.inputs,
            office_scope: linked.office_scope,
            teams: linked.teams,
            lanes,
            input_sources,
            processes: DashMap::new(),
            state: AtomicU8::new(CLOSED),
            closed_once: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            drained: Mutex::new(()),
            drained_signal: Condvar::new(),
            counters: Counters::default(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn function(&self, id: FunctionId) -> &LinkedFunction {
        &self.functions[id.0]
    }

    pub(crate) fn object(&self, id: ObjectId) -> &LinkedObject {
        &self.objects[id.0]
    }

    pub(crate) fn team_of(&self, function: FunctionId) -> &Team {
        &self.teams[self.function(function).team.0]
    }

    pub(crate) fn teams(&self) -> &[Team] {
        &self.teams
    }

    pub(crate) fn pools(&self) -> &[Arc<ObjectPool>] {
        &self.pools
    }

    pub(crate) fn counters(&self) -> &Counters {
        &self.counters
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }

    /// Jobs still run while the office drains; only a closed office cancels them
    pub(crate) fn accepts_jobs(&self) -> bool {
        self.state.load(Ordering::Acquire) != CLOSED
    }

    pub(crate) fn live_processes(&self) -> Vec<Arc<ProcessState>> {
        self.processes
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn live_process_count(&self) -> usize {
        self.processes.len()
    }

    pub(crate) fn submit(&self, job: Job) {
        self.team_of(job.function_id()).submit(job);
    }

    pub(crate) fn open(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock();
        match self.state.load(Ordering::Acquire) {
            OPEN => return Err(EngineError::AlreadyOpen),
            CLOSING => return Err(EngineError::ShuttingDown),
            _ => {}
        }

        for (started, team) in self.teams.iter().enumerate() {
            if let Err(e) = team.start() {
                error!("Team {} failed to start: {}", team.name(), e);
                for team in &self.teams[..started] {
                    team.stop();
                }
                return Err(e);
            }
            debug!("Team {} ({}) started", team.name(), team.kind());
        }
        for pool in &self.pools {
            pool.reopen();
        }

        self.state.store(OPEN, Ordering::Release);
        info!(
            "Office {} open: {} team(s), {} function(s), {} object(s)",
            self.id,
            self.teams.len(),
            self.functions.len(),
            self.objects.len()
        );
        Ok(())
    }

    pub(crate) fn close(&self) -> CloseReport {
        let _lifecycle = self.lifecycle.lock();
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return CloseReport {
                teams_stopped_cleanly: true,
                ..CloseReport::default()
            };
        }

        let live = self.processes.len();
        info!("Office {} closing with {} live process(es)", self.id, live);

        let deadline = Instant::now() + self.config.close_timeout();
        {
            let mut drained = self.drained.lock();
            while !self.processes.is_empty() {
                if self
                    .drained_signal
                    .wait_until(&mut drained, deadline)
                    .timed_out()
                {
                    break;
                }
            }
        }

        let remaining = self.live_processes();
        let forced = remaining.len();
        if forced > 0 {
            warn!(
                "Office {} forcing {} process(es) down after {:?}",
                self.id,
                forced,
                self.config.close_timeout()
            );
        }
        for process in &remaining {
            self.fail_process(process, Escalation::ShuttingDown);
            self.terminate(process);
        }

        self.state.store(CLOSED, Ordering::Release);
        self.closed_once.store(true, Ordering::Release);
        let mut clean = true;
        for team in &self.teams {
            if !team.stop() {
                clean = false;
            }
            debug!("Team {} stopped", team.name());
        }
        for pool in &self.pools {
            pool.close();
        }

        info!("Office {} closed", self.id);
        CloseReport {
            drained: live.saturating_sub(forced),
            forced,
            teams_stopped_cleanly: clean,
        }
    }

    /// Allocate a process and submit its initial job
    pub(crate) fn start_process(
        self: &Arc<Self>,
        flow: &str,
        parameter: Option<Parameter>,
        root: Option<AnyObject>,
        completion: Completion,
        context: Option<ContextToken>,
    ) -> Result<ProcessId> {
        match self.state.load(Ordering::Acquire) {
            OPEN => {}
            CLOSING => return Err(EngineError::ShuttingDown),
            _ if self.closed_once.load(Ordering::Acquire) => {
                return Err(EngineError::ShuttingDown)
            }
            _ => return Err(EngineError::NotOpen),
        }
        let function = *self
            .flows
            .get(flow)
            .ok_or_else(|| EngineError::UnknownFlow(flow.to_string()))?;
        let root_binding = match &root {
            Some(_) => Some(
                *self
                    .inputs
                    .get(flow)
                    .ok_or_else(|| EngineError::NoRootBinding(flow.to_string()))?,
            ),
            None => None,
        };

        let process = Arc::new(ProcessState::new(flow, self.objects.len(), completion));
        if let (Some(root), Some(object)) = (root, root_binding) {
            process.objects().bind(object, root);
        }
        if let Some(token) = context {
            process.pin_context(token);
        }

        let id = process.id();
        self.processes.insert(id, Arc::clone(&process));
        self.counters.started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(PROCESSES_STARTED).increment(1);
        debug!("Process {} started on flow {}", id, flow);

        self.submit(Job::new(
            Arc::clone(self),
            process,
            function,
            parameter,
            Frame::Root,
            0,
        ));
        Ok(id)
    }

    /// Handler for `escalation` in `function`'s own chain (function, then sections)
    pub(crate) fn handler_for(
        &self,
        function: FunctionId,
        escalation: &Escalation,
        depth: u32,
    ) -> Option<FunctionId> {
        self.bounded(self.function(function).escalations.resolve(escalation), escalation, depth)
    }

    /// Office-wide handler for an escalation that reached a process's root flow
    pub(crate) fn office_handler(&self, escalation: &Escalation, depth: u32) -> Option<FunctionId> {
        self.bounded(self.office_scope.resolve(escalation), escalation, depth)
    }

    fn bounded(
        &self,
        found: Option<(&str, FunctionId)>,
        escalation: &Escalation,
        depth: u32,
    ) -> Option<FunctionId> {
        let (scope, handler) = found?;
        if depth >= self.config.office.max_escalation_depth {
            warn!(
                "Escalation `{}` reached handler depth {}; treating as unhandled",
                escalation.kind(),
                depth
            );
            return None;
        }
        trace!("Escalation `{}` matched in {}", escalation.kind(), scope);
        Some(handler)
    }

    /// Latch `escalation` as the process failure and cancel its parked jobs
    pub(crate) fn fail_process(&self, process: &Arc<ProcessState>, escalation: Escalation) {
        let cancellation = escalation.is_cancellation();
        let chain = escalation.causal_chain();
        if !process.fail(escalation) {
            return;
        }

        if cancellation {
            debug!("Process {} cancelled: {}", process.id(), chain);
        } else {
            error!(
                "Process {} on flow {} failed with unhandled escalation: {}",
                process.id(),
                process.flow(),
                chain
            );
        }

        for job in process.objects().take_waiters() {
            job.abort(Escalation::Cancelled);
        }
    }

    pub(crate) fn release_flow(&self, process: &Arc<ProcessState>) {
        if process.release_flow() {
            self.terminate(process);
        }
    }

    /// Release the process's objects and deliver its outcome, once
    pub(crate) fn terminate(&self, process: &Arc<ProcessState>) {
        if !process.mark_terminated() {
            return;
        }
        self.processes.remove(&process.id());

        for job in process.objects().release(&self.objects) {
            job.discard();
        }

        let outcome = process.outcome();
        match &outcome {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(PROCESSES_COMPLETED).increment(1);
                debug!("Process {} completed", process.id());
            }
            Err(escalation) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(PROCESSES_FAILED).increment(1);
                debug!(
                    "Process {} terminated with `{}` ({} suppressed)",
                    process.id(),
                    escalation.kind(),
                    process.suppressed_failures()
                );
            }
        }
        process.deliver(outcome);

        let _drained = self.drained.lock();
        self.drained_signal.notify_all();
    }
}
