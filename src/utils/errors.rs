// src/utils/errors.rs
//! Engine-level error type
//!
//! These are failures of the engine's API surface: loading configuration,
//! linking the wiring table, lifecycle misuse. Failures raised while a process
//! runs are [`Escalation`]s and only reach this type when a synchronous
//! invoker waits on a process that escalated.

use crate::escalation::Escalation;
use thiserror::Error;

/// Result alias used across the engine API
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors returned by office and engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse wiring table: {0}")]
    WiringParse(String),

    /// One or more references in the wiring table did not resolve
    #[error("link failed with {} unresolved reference(s): {}", .0.len(), .0.join("; "))]
    Link(Vec<String>),

    #[error("office is not open")]
    NotOpen,

    #[error("office is already open")]
    AlreadyOpen,

    #[error("office is shutting down")]
    ShuttingDown,

    #[error("unknown flow: {0}")]
    UnknownFlow(String),

    /// A root object was supplied for a flow with no root binding
    #[error("flow `{0}` has no root object binding")]
    NoRootBinding(String),

    #[error("failed to read wiring table: {0}")]
    WiringIo(#[from] std::io::Error),

    #[error("unknown input source index: {0}")]
    UnknownInputSource(usize),

    /// A synchronous wait was attempted from one of the engine's own workers
    #[error("blocking wait on a process from engine worker thread `{0}`")]
    BlockingInWorker(String),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("metrics recorder installation failed: {0}")]
    Metrics(String),

    /// The awaited process ended with an unhandled escalation
    #[error("process escalated: {0}")]
    Escalated(#[from] Escalation),
}

impl EngineError {
    /// The escalation carried by this error, if the process itself failed
    pub fn escalation(&self) -> Option<&Escalation> {
        match self {
            EngineError::Escalated(escalation) => Some(escalation),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::WiringParse(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::WiringParse(err.to_string())
    }
}
