// src/function/mod.rs
//! Managed functions
//!
//! A managed function is user logic bound to a team by the wiring table. It
//! receives a [`FunctionContext`] exposing its resolved dependencies and
//! parameter, and records its continuation decision (flows to invoke, the
//! parameter for the next function) on that context. Failures are returned as
//! an [`Escalation`].

pub mod context;

pub use context::{FlowCallback, FlowOutcome, FunctionContext};

use crate::escalation::{Escalation, EscalationScope};
use crate::object::ObjectId;
use crate::team::TeamId;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Type-erased value passed between functions
pub type Parameter = Arc<dyn Any + Send + Sync>;

/// Wrap a value as a function parameter
pub fn arg<T: Any + Send + Sync>(value: T) -> Option<Parameter> {
    Some(Arc::new(value))
}

/// Index of a linked function within its office
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub(crate) usize);

/// User logic executed by a team
pub trait ManagedFunction: Send + Sync + 'static {
    fn execute(&self, ctx: &mut FunctionContext<'_>) -> Result<(), Escalation>;
}

impl<F> ManagedFunction for F
where
    F: Fn(&mut FunctionContext<'_>) -> Result<(), Escalation> + Send + Sync + 'static,
{
    fn execute(&self, ctx: &mut FunctionContext<'_>) -> Result<(), Escalation> {
        self(ctx)
    }
}

/// A dependency slot resolved before the body runs
#[derive(Debug, Clone)]
pub(crate) struct Dependency {
    pub(crate) name: String,
    pub(crate) object: ObjectId,
}

/// A function after linking: every name replaced by an index
pub(crate) struct LinkedFunction {
    pub(crate) name: String,
    pub(crate) body: Arc<dyn ManagedFunction>,
    pub(crate) team: TeamId,
    pub(crate) next: Option<FunctionId>,
    pub(crate) flows: HashMap<String, FunctionId>,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) escalations: Arc<EscalationScope>,
}

impl fmt::Debug for LinkedFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedFunction")
            .field("name", &self.name)
            .field("team", &self.team)
            .field("next", &self.next)
            .field("flows", &self.flows)
            .field("dependencies", &self.dependencies)
            .field("escalations", &self.escalations.name())
            .finish()
    }
}
