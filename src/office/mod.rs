// src/office/mod.rs
//! The office: runtime container for linked teams, functions and objects
//!
//! ```text
//! WiringTable + bodies + sources
//!         │ OfficeBuilder::build (link + validate)
//!         ▼
//!      Office ── open() ──► teams started, gateway accepting
//!         │                 invoke_process / invoke_and_wait / invoke_async
//!         └──── close() ──► drain, force remaining, stop teams
//! ```

pub mod gateway;
pub(crate) mod linker;
pub(crate) mod shared;
pub mod wiring;

pub use shared::CloseReport;
pub use gateway::{InputGateway, InputSource, InputSources};
pub use wiring::{FunctionSpec, HandlerSpec, ObjectSpec, SectionSpec, WiringTable};

use crate::escalation::Escalation;
use crate::function::{FunctionContext, ManagedFunction, Parameter};
use crate::object::{AnyObject, FnSource, ManagedObjectSource, PoolStats, SourceContext, Sourced};
use crate::process::{Completion, ProcessCallback, ProcessId, ProcessInfo, ProcessOutcome};
use crate::team::worker::{self, LaneMessage};
use crate::team::{ContextToken, LaneRegistry, TeamStats};
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, Result};
use linker::Linker;
use shared::OfficeCore;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

/// Point-in-time counters of an office
#[derive(Debug, Clone)]
pub struct OfficeStats {
    pub live_processes: usize,
    pub processes_started: u64,
    pub processes_completed: u64,
    pub processes_failed: u64,
    pub jobs_executed: u64,
    pub jobs_cancelled: u64,
    pub escalations_handled: u64,
    pub teams: Vec<TeamStats>,
    pub pools: BTreeMap<String, PoolStats>,
}

/// Collects the wiring table, function bodies and object sources
pub struct OfficeBuilder {
    wiring: WiringTable,
    config: EngineConfig,
    bodies: HashMap<String, Arc<dyn ManagedFunction>>,
    sources: HashMap<String, Arc<dyn ManagedObjectSource>>,
    input_sources: Vec<InputSource>,
}

impl OfficeBuilder {
    pub fn new(wiring: WiringTable) -> Self {
        Self {
            wiring,
            config: EngineConfig::default(),
            bodies: HashMap::new(),
            sources: HashMap::new(),
            input_sources: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Bind a closure as the body of `name`
    pub fn function<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut FunctionContext<'_>) -> std::result::Result<(), Escalation>
            + Send
            + Sync
            + 'static,
    {
        self.managed_function(name, body)
    }

    pub fn managed_function(mut self, name: impl Into<String>, body: impl ManagedFunction) -> Self {
        self.bodies.insert(name.into(), Arc::new(body));
        self
    }

    pub fn object(mut self, name: impl Into<String>, source: impl ManagedObjectSource) -> Self {
        self.sources.insert(name.into(), Arc::new(source));
        self
    }

    /// Bind a closure as the source of `name`
    pub fn object_fn<F>(self, name: impl Into<String>, source: F) -> Self
    where
        F: Fn(SourceContext) -> anyhow::Result<Sourced> + Send + Sync + 'static,
    {
        self.object(name, FnSource::new(source))
    }

    /// Register an input source in the office's arena; its index is its registration order
    pub fn input_source(mut self, name: impl Into<String>, flow: impl Into<String>) -> Self {
        self.input_sources.push(InputSource {
            name: name.into(),
            flow: flow.into(),
        });
        self
    }

    /// Link and validate; fails listing every unresolved reference
    pub fn build(self) -> Result<Office> {
        self.config.validate()?;
        let lanes = Arc::new(LaneRegistry::default());
        let input_flows: Vec<String> = self.input_sources.iter().map(|s| s.flow.clone()).collect();
        let linked = Linker::new(&self.wiring, &self.config).link(
            &self.bodies,
            &self.sources,
            &input_flows,
            Arc::clone(&lanes),
        )?;
        let core = OfficeCore::new(
            self.config,
            linked,
            lanes,
            InputSources::new(self.input_sources),
        );
        Ok(Office {
            core: Arc::new(core),
        })
    }
}

/// Unregisters a caller lane when `invoke_and_wait` returns
struct CallerLane<'a> {
    registry: &'a LaneRegistry,
    token: ContextToken,
}

impl Drop for CallerLane<'_> {
    fn drop(&mut self) {
        self.registry.unregister(self.token);
    }
}

pub struct Office {
    core: Arc<OfficeCore>,
}

impl Office {
    pub fn builder(wiring: WiringTable) -> OfficeBuilder {
        OfficeBuilder::new(wiring)
    }

    /// Start every team and begin accepting invocations
    pub fn open(&self) -> Result<()> {
        self.core.open()
    }

    /// Drain live processes up to the close timeout, force the rest, stop teams
    pub fn close(&self) -> CloseReport {
        self.core.close()
    }

    pub fn is_open(&self) -> bool {
        self.core.is_open()
    }

    pub fn config(&self) -> &EngineConfig {
        self.core.config()
    }

    pub fn gateway(&self) -> InputGateway {
        InputGateway::new(Arc::clone(&self.core))
    }

    pub fn input_sources(&self) -> &InputSources {
        &self.core.input_sources
    }

    /// Fire-and-forget invocation; see [`InputGateway::invoke_process`]
    pub fn invoke_process(
        &self,
        flow: &str,
        parameter: Option<Parameter>,
        root: Option<AnyObject>,
        callback: Option<ProcessCallback>,
    ) -> Result<ProcessId> {
        self.gateway().invoke_process(flow, parameter, root, callback)
    }

    /// Run a process and block until it and all of its flows complete
    ///
    /// The calling thread serves as the process's affinity lane while it
    /// waits. Calling this from an engine worker is rejected, since the
    /// worker would stop serving its team.
    pub fn invoke_and_wait(
        &self,
        flow: &str,
        parameter: Option<Parameter>,
        root: Option<AnyObject>,
    ) -> Result<()> {
        if let Some(worker) = worker::current_worker() {
            return Err(EngineError::BlockingInWorker(worker));
        }

        let (sender, receiver) = crossbeam_channel::unbounded();
        let token = ContextToken::allocate();
        self.core.lanes.register(token, sender.clone());
        let _lane = CallerLane {
            registry: &self.core.lanes,
            token,
        };

        self.core
            .start_process(flow, parameter, root, Completion::Lane(sender), Some(token))?;

        let lane_name = format!("caller-{}", token);
        for message in receiver.iter() {
            match message {
                LaneMessage::Run(job) => {
                    let _scope = worker::enter(&lane_name);
                    trace!("Caller lane {} running {}", token, job.function_name());
                    worker::run_job(job);
                }
                LaneMessage::Complete(outcome) => return outcome.map_err(EngineError::Escalated),
                LaneMessage::Stop => {}
            }
        }
        Err(EngineError::ShuttingDown)
    }

    /// Start a process and return a future resolving with its outcome
    pub fn invoke_async(
        &self,
        flow: &str,
        parameter: Option<Parameter>,
        root: Option<AnyObject>,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        let (sender, receiver) = oneshot::channel::<ProcessOutcome>();
        let started = self
            .core
            .start_process(flow, parameter, root, Completion::Notify(sender), None);
        async move {
            started?;
            match receiver.await {
                Ok(outcome) => outcome.map_err(EngineError::Escalated),
                Err(_) => Err(EngineError::ShuttingDown),
            }
        }
    }

    pub fn live_processes(&self) -> Vec<ProcessInfo> {
        self.core
            .live_processes()
            .iter()
            .map(|process| process.info())
            .collect()
    }

    pub fn live_process_count(&self) -> usize {
        self.core.live_process_count()
    }

    pub fn stats(&self) -> OfficeStats {
        let counters = self.core.counters();
        OfficeStats {
            live_processes: self.core.live_process_count(),
            processes_started: counters.started(),
            processes_completed: counters.completed(),
            processes_failed: counters.failed(),
            jobs_executed: counters.executed(),
            jobs_cancelled: counters.cancelled(),
            escalations_handled: counters.handled(),
            teams: self.core.teams().iter().map(|team| team.stats()).collect(),
            pools: self
                .core
                .pools()
                .iter()
                .map(|pool| (pool.name().to_string(), pool.stats()))
                .collect(),
        }
    }
}

impl Drop for Office {
    fn drop(&mut self) {
        self.core.close();
    }
}

impl std::fmt::Debug for Office {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Office")
            .field("id", &self.core.id())
            .field("open", &self.is_open())
            .field("live_processes", &self.live_process_count())
            .finish()
    }
}
