// src/object/mod.rs
//! Managed objects
//!
//! Dependency-injected resources whose lifetime is bound to a scope rather
//! than to the code using them:
//!
//! - **Process**: created lazily on first reference, disposed when the
//!   process terminates. May become ready asynchronously.
//! - **Thread**: one instance per worker thread, reused across processes,
//!   disposed when the thread retires.
//! - **Pooled**: a bounded set shared across processes; a process checks one
//!   out on first reference and returns it when it terminates. Exhaustion
//!   blocks the requesting execution up to the acquisition timeout.

pub mod pool;
pub mod registry;
pub mod thread_scope;

pub use pool::{ObjectPool, PoolStats};
pub use registry::ProcessObjects;

use crate::escalation::Escalation;
use crate::job::executor::panic_message;
use crate::process::{ProcessId, ProcessState};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Type-erased managed object instance
pub type AnyObject = Arc<dyn Any + Send + Sync>;

/// Index of a linked managed object within its office
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub(crate) usize);

/// Lifetime scope of a managed object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectScope {
    Process,
    Thread,
    Pooled,
}

/// Outcome of asking a source for an instance
pub enum Sourced {
    Ready(AnyObject),
    /// The instance will be delivered later through [`SourceContext::readiness`]
    Pending,
}

/// Creates managed object instances
pub trait ManagedObjectSource: Send + Sync + 'static {
    fn source(&self, ctx: SourceContext) -> anyhow::Result<Sourced>;

    /// Called when the owning scope ends
    fn dispose(&self, _object: AnyObject) {}
}

/// Call `source`, reporting a panic as a sourcing error
pub(crate) fn source_guarded(
    source: &dyn ManagedObjectSource,
    ctx: SourceContext,
) -> anyhow::Result<Sourced> {
    panic::catch_unwind(AssertUnwindSafe(|| source.source(ctx))).unwrap_or_else(|payload| {
        Err(anyhow::anyhow!(
            "object source panicked: {}",
            panic_message(payload.as_ref())
        ))
    })
}

/// Closure-backed source
pub struct FnSource<F>(F);

impl<F> FnSource<F>
where
    F: Fn(SourceContext) -> anyhow::Result<Sourced> + Send + Sync + 'static,
{
    pub fn new(source: F) -> Self {
        Self(source)
    }
}

impl<F> ManagedObjectSource for FnSource<F>
where
    F: Fn(SourceContext) -> anyhow::Result<Sourced> + Send + Sync + 'static,
{
    fn source(&self, ctx: SourceContext) -> anyhow::Result<Sourced> {
        (self.0)(ctx)
    }
}

/// What a source sees while producing an instance
pub struct SourceContext {
    object: String,
    process_id: Option<ProcessId>,
    readiness: Option<Readiness>,
}

impl SourceContext {
    pub(crate) fn synchronous(object: &str) -> Self {
        Self {
            object: object.to_string(),
            process_id: None,
            readiness: None,
        }
    }

    pub(crate) fn for_process(object: &str, process_id: ProcessId, readiness: Readiness) -> Self {
        Self {
            object: object.to_string(),
            process_id: Some(process_id),
            readiness: Some(readiness),
        }
    }

    pub fn object_name(&self) -> &str {
        &self.object
    }

    /// The process the instance is created for; `None` for thread and pool scope
    pub fn process_id(&self) -> Option<ProcessId> {
        self.process_id
    }

    /// Handle used to complete asynchronous sourcing
    ///
    /// Only process-scoped objects may complete asynchronously. Returns
    /// `None` for thread and pool scope.
    pub fn readiness(&mut self) -> Option<Readiness> {
        self.readiness.take()
    }
}

/// One-shot completion handle for an object that returned [`Sourced::Pending`]
///
/// Completing re-submits every job parked on the object to its team.
/// Dropping the handle without completing fails the object.
pub struct Readiness {
    process: Arc<ProcessState>,
    object: ObjectId,
    name: String,
    binding: ObjectBinding,
    settled: bool,
}

impl Readiness {
    pub(crate) fn new(
        process: Arc<ProcessState>,
        object: ObjectId,
        name: &str,
        binding: ObjectBinding,
    ) -> Self {
        Self {
            process,
            object,
            name: name.to_string(),
            binding,
            settled: false,
        }
    }

    pub fn ready(mut self, object: AnyObject) {
        self.settle(Ok(object));
    }

    pub fn fail(mut self, error: impl Into<anyhow::Error>) {
        let escalation = Escalation::sourcing(self.name.clone(), error);
        self.settle(Err(escalation));
    }

    fn settle(&mut self, result: Result<AnyObject, Escalation>) {
        self.settled = true;
        self.process
            .objects()
            .settle(&self.process, self.object, result, Some(&self.binding));
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if !self.settled {
            let escalation = Escalation::sourcing(
                self.name.clone(),
                anyhow::anyhow!("readiness handle dropped before the object became ready"),
            );
            self.process
                .objects()
                .abandon(&self.process, self.object, escalation);
        }
    }
}

impl fmt::Debug for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readiness")
            .field("process", &self.process.id())
            .field("object", &self.name)
            .finish()
    }
}

/// How a linked object is obtained
#[derive(Clone)]
pub(crate) enum ObjectBinding {
    Sourced(Arc<dyn ManagedObjectSource>),
    Pooled(Arc<ObjectPool>),
    /// Bound by the input gateway as a process's root object
    Input,
}

/// A managed object after linking
pub(crate) struct LinkedObject {
    pub(crate) id: ObjectId,
    pub(crate) name: String,
    pub(crate) scope: ObjectScope,
    pub(crate) binding: ObjectBinding,
}

impl LinkedObject {
    pub(crate) fn source(&self) -> Option<&Arc<dyn ManagedObjectSource>> {
        match &self.binding {
            ObjectBinding::Sourced(source) => Some(source),
            _ => None,
        }
    }
}

impl fmt::Debug for LinkedObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = match self.binding {
            ObjectBinding::Sourced(_) => "sourced",
            ObjectBinding::Pooled(_) => "pooled",
            ObjectBinding::Input => "input",
        };
        f.debug_struct("LinkedObject")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("binding", &binding)
            .finish()
    }
}
