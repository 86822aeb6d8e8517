// src/escalation/mod.rs
//! Failure routing
//!
//! Function bodies return [`Escalation`] instead of unwinding. The engine
//! routes an escalation through the function's statically linked
//! [`EscalationScope`] chain (function-local handlers, then enclosing
//! sections), and from there up the dynamic call chain of sequential flows.
//! The office scope is the last resort, consulted once an escalation
//! reaches the root of the process.
//!
//! Infrastructure cancellations (`TeamStopped`, `ShuttingDown`, `Cancelled`)
//! never reach handlers; they fail the owning process directly.

pub mod chain;

pub use chain::{EscalationScope, HandlerEntry, ANY_KIND};

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Error payload shared between clones of one escalation
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Kind given to escalations converted from a bare `anyhow::Error`
pub const DEFAULT_KIND: &str = "failure";

/// A failure raised while executing a process
#[derive(Debug, Clone, Error)]
pub enum Escalation {
    /// Domain failure returned by a function body
    #[error("function escalation `{kind}`")]
    Function {
        kind: String,
        #[source]
        source: SharedError,
    },

    /// A managed object could not be constructed or never became ready
    #[error("failed to source managed object `{object}`")]
    Sourcing {
        object: String,
        #[source]
        source: SharedError,
    },

    #[error("worker panicked while executing `{function}`: {message}")]
    WorkerPanic { function: String, message: String },

    #[error("timed out after {waited:?} waiting for pooled object `{object}`")]
    PoolExhausted { object: String, waited: Duration },

    #[error("team `{team}` stopped before the job executed")]
    TeamStopped { team: String },

    #[error("office is shutting down")]
    ShuttingDown,

    /// The owning process already failed; pending work was abandoned
    #[error("cancelled after the owning process failed")]
    Cancelled,

    #[error("function `{function}` invoked undeclared flow `{flow}`")]
    UndeclaredFlow { function: String, flow: String },

    #[error("function `{function}` has no dependency named `{dependency}` of the requested type")]
    MissingDependency { function: String, dependency: String },
}

impl Escalation {
    /// Raise a domain escalation of the given kind
    pub fn raise(kind: impl Into<String>, error: impl Into<anyhow::Error>) -> Self {
        Escalation::Function {
            kind: kind.into(),
            source: shared(error.into()),
        }
    }

    /// Raise a domain escalation carrying only a message
    pub fn msg(kind: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::raise(kind, anyhow::anyhow!("{}", message))
    }

    pub(crate) fn sourcing(object: impl Into<String>, error: impl Into<anyhow::Error>) -> Self {
        Escalation::Sourcing {
            object: object.into(),
            source: shared(error.into()),
        }
    }

    /// Kind used to match handler entries
    pub fn kind(&self) -> &str {
        match self {
            Escalation::Function { kind, .. } => kind,
            Escalation::Sourcing { .. } => "sourcing",
            Escalation::WorkerPanic { .. } => "worker_panic",
            Escalation::PoolExhausted { .. } => "pool_exhausted",
            Escalation::TeamStopped { .. } => "team_stopped",
            Escalation::ShuttingDown => "shutting_down",
            Escalation::Cancelled => "cancelled",
            Escalation::UndeclaredFlow { .. } => "undeclared_flow",
            Escalation::MissingDependency { .. } => "missing_dependency",
        }
    }

    /// Whether this escalation bypasses handler chains
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Escalation::TeamStopped { .. } | Escalation::ShuttingDown | Escalation::Cancelled
        )
    }

    /// Render with every underlying cause
    pub fn causal_chain(&self) -> String {
        crate::observability::causal_chain(self)
    }
}

impl From<anyhow::Error> for Escalation {
    fn from(error: anyhow::Error) -> Self {
        Escalation::Function {
            kind: DEFAULT_KIND.to_string(),
            source: shared(error),
        }
    }
}

fn shared(error: anyhow::Error) -> SharedError {
    let boxed: Box<dyn std::error::Error + Send + Sync + 'static> = error.into();
    Arc::from(boxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(Escalation::msg("validation", "bad input").kind(), "validation");
        assert_eq!(Escalation::ShuttingDown.kind(), "shutting_down");
        assert_eq!(
            Escalation::from(anyhow::anyhow!("boom")).kind(),
            DEFAULT_KIND
        );
    }

    #[test]
    fn test_cancellations_are_distinguished() {
        assert!(Escalation::Cancelled.is_cancellation());
        assert!(Escalation::TeamStopped { team: "io".into() }.is_cancellation());
        assert!(!Escalation::msg("x", "y").is_cancellation());
        assert!(!Escalation::PoolExhausted {
            object: "db".into(),
            waited: Duration::from_millis(5)
        }
        .is_cancellation());
    }

    #[test]
    fn test_causal_chain_includes_source() {
        let err = anyhow::anyhow!("connection refused").context("opening ledger");
        let escalation = Escalation::sourcing("ledger", err);
        let chain = escalation.causal_chain();
        assert!(chain.starts_with("failed to source managed object `ledger`"));
        assert!(chain.contains("opening ledger"));
    }

    #[test]
    fn test_clones_share_the_source() {
        let escalation = Escalation::msg("x", "shared");
        let clone = escalation.clone();
        match (escalation, clone) {
            (Escalation::Function { source: a, .. }, Escalation::Function { source: b, .. }) => {
                assert!(Arc::ptr_eq(&a, &b));
            }
            _ => unreachable!(),
        }
    }
}
