// src/function/context.rs
//! Execution context handed to a function body

use crate::escalation::Escalation;
use crate::function::{FunctionId, LinkedFunction, Parameter};
use crate::object::AnyObject;
use crate::process::ProcessId;
use crate::team::ContextToken;
use std::any::Any;
use std::sync::Arc;

/// Result delivered to a parallel flow's callback
pub type FlowOutcome = Result<(), Escalation>;

/// Completion callback of a parallel flow, fired on the completing thread
pub type FlowCallback = Box<dyn FnOnce(FlowOutcome) + Send + 'static>;

pub(crate) struct SequentialRequest {
    pub(crate) target: FunctionId,
    pub(crate) parameter: Option<Parameter>,
}

pub(crate) struct ParallelRequest {
    pub(crate) target: FunctionId,
    pub(crate) parameter: Option<Parameter>,
    pub(crate) callback: Option<FlowCallback>,
}

/// Continuation decision recorded by a function body
#[derive(Default)]
pub(crate) struct FunctionOutput {
    pub(crate) next_parameter: Option<Parameter>,
    pub(crate) sequential: Vec<SequentialRequest>,
    pub(crate) parallel: Vec<ParallelRequest>,
    pub(crate) join: bool,
}

/// What a function body sees while it runs
pub struct FunctionContext<'a> {
    function: &'a LinkedFunction,
    process_id: ProcessId,
    parameter: Option<Parameter>,
    escalation: Option<&'a Escalation>,
    dependencies: Vec<AnyObject>,
    context: Option<ContextToken>,
    output: FunctionOutput,
}

impl<'a> FunctionContext<'a> {
    pub(crate) fn new(
        function: &'a LinkedFunction,
        process_id: ProcessId,
        parameter: Option<Parameter>,
        escalation: Option<&'a Escalation>,
        dependencies: Vec<AnyObject>,
        context: Option<ContextToken>,
    ) -> Self {
        Self {
            function,
            process_id,
            parameter,
            escalation,
            dependencies,
            context,
            output: FunctionOutput::default(),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function.name
    }

    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    /// Affinity lane the current chain is pinned to, if any
    pub fn context_token(&self) -> Option<ContextToken> {
        self.context
    }

    /// The parameter, downcast to `T`
    pub fn parameter<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.parameter.as_deref().and_then(|p| p.downcast_ref::<T>())
    }

    pub fn raw_parameter(&self) -> Option<&Parameter> {
        self.parameter.as_ref()
    }

    /// The escalation being handled, when this function runs as a handler
    pub fn escalation(&self) -> Option<&Escalation> {
        self.escalation
    }

    /// A resolved dependency by its declared name
    pub fn object<T: Any + Send + Sync>(&self, dependency: &str) -> Result<Arc<T>, Escalation> {
        self.function
            .dependencies
            .iter()
            .position(|d| d.name == dependency)
            .and_then(|index| self.dependencies.get(index))
            .and_then(|object| Arc::clone(object).downcast::<T>().ok())
            .ok_or_else(|| Escalation::MissingDependency {
                function: self.function.name.clone(),
                dependency: dependency.to_string(),
            })
    }

    /// Parameter handed to the linked next function
    pub fn set_next_parameter(&mut self, parameter: Option<Parameter>) {
        self.output.next_parameter = parameter;
    }

    /// Invoke a flow sequentially
    ///
    /// Sequential flows run in invocation order after this body returns and
    /// before the next function; the next function waits for each flow's
    /// whole subtree.
    pub fn invoke_flow(&mut self, flow: &str, parameter: Option<Parameter>) -> Result<(), Escalation> {
        let target = self.flow_target(flow)?;
        self.output
            .sequential
            .push(SequentialRequest { target, parameter });
        Ok(())
    }

    /// Invoke a flow in parallel
    ///
    /// The child is submitted independently; this function's continuation
    /// does not wait for it unless [`join_parallel`](Self::join_parallel) is
    /// called. The callback receives the child's outcome once its subtree
    /// completes.
    pub fn spawn_flow(
        &mut self,
        flow: &str,
        parameter: Option<Parameter>,
        callback: Option<FlowCallback>,
    ) -> Result<(), Escalation> {
        let target = self.flow_target(flow)?;
        self.output.parallel.push(ParallelRequest {
            target,
            parameter,
            callback,
        });
        Ok(())
    }

    /// Defer this function's continuation until its parallel flows complete
    ///
    /// Registered as a continuation; no thread blocks.
    pub fn join_parallel(&mut self) {
        self.output.join = true;
    }

    pub(crate) fn into_output(self) -> FunctionOutput {
        self.output
    }

    fn flow_target(&self, flow: &str) -> Result<FunctionId, Escalation> {
        self.function
            .flows
            .get(flow)
            .copied()
            .ok_or_else(|| Escalation::UndeclaredFlow {
                function: self.function.name.clone(),
                flow: flow.to_string(),
            })
    }
}
