// src/escalation/chain.rs
//! Statically linked handler scopes
//!
//! The linker builds one scope per function (its local handlers) whose
//! `enclosing` link points at the function's section scope, then parent
//! sections. The office scope stands alone. Scopes are shared: every
//! function of a section links to the same section scope.

use crate::escalation::Escalation;
use crate::function::FunctionId;
use std::sync::Arc;

/// Handler kind matching every routable escalation
pub const ANY_KIND: &str = "*";

/// One `kind -> handler function` binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerEntry {
    pub kind: String,
    pub handler: FunctionId,
}

impl HandlerEntry {
    pub fn new(kind: impl Into<String>, handler: FunctionId) -> Self {
        Self {
            kind: kind.into(),
            handler,
        }
    }

    fn matches(&self, escalation: &Escalation) -> bool {
        self.kind == ANY_KIND || self.kind == escalation.kind()
    }
}

/// A node in a handler chain
#[derive(Debug)]
pub struct EscalationScope {
    name: String,
    handlers: Vec<HandlerEntry>,
    enclosing: Option<Arc<EscalationScope>>,
}

impl EscalationScope {
    pub fn new(
        name: impl Into<String>,
        handlers: Vec<HandlerEntry>,
        enclosing: Option<Arc<EscalationScope>>,
    ) -> Self {
        Self {
            name: name.into(),
            handlers,
            enclosing,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enclosing(&self) -> Option<&Arc<EscalationScope>> {
        self.enclosing.as_ref()
    }

    /// First handler matching the escalation, searching this scope outwards
    ///
    /// Cancellations never match.
    pub fn resolve(&self, escalation: &Escalation) -> Option<(&str, FunctionId)> {
        if escalation.is_cancellation() {
            return None;
        }

        let mut scope = Some(self);
        while let Some(current) = scope {
            if let Some(entry) = current.handlers.iter().find(|e| e.matches(escalation)) {
                return Some((current.name.as_str(), entry.handler));
            }
            scope = current.enclosing.as_deref();
        }
        None
    }

    /// Number of scopes from here to the outermost
    pub fn depth(&self) -> usize {
        let mut depth = 1;
        let mut scope = self.enclosing.as_deref();
        while let Some(current) = scope {
            depth += 1;
            scope = current.enclosing.as_deref();
        }
        depth
    }
}
