// src/lib.rs
//! Office Engine Library
//!
//! A function scheduling and execution engine. Units of work ("functions")
//! run on pluggable thread groups ("teams"); resources are scoped to a
//! logical execution ("process") rather than to a thread; functions continue
//! into each other sequentially or in parallel; failures travel through a
//! statically linked handler chain.
//!
//! # Architecture
//!
//! - **office**: wiring table, linking, lifecycle, input invocation gateway
//! - **team**: dedicated, pool (work stealing), passive and affinity teams
//! - **job**: schedulable invocations, continuation frames, execution
//! - **function**: the `ManagedFunction` trait and its execution context
//! - **object**: managed objects scoped per process, per thread or pooled
//! - **process**: per-process state and completion accounting
//! - **escalation**: the failure sum type and handler scopes
//! - **observability**: tracing and metrics setup
//! - **utils**: configuration and engine errors
//!
//! # Example
//!
//! ```no_run
//! use office_engine::{arg, FunctionSpec, Office, TeamKind, WiringTable};
//!
//! let wiring = WiringTable::new()
//!     .team("workers", TeamKind::Pool { size: Some(4), max: None })
//!     .function("greet", FunctionSpec::on("workers").next("done"))
//!     .function("done", FunctionSpec::on("workers"))
//!     .flow("hello", "greet");
//!
//! let office = Office::builder(wiring)
//!     .function("greet", |ctx| {
//!         let name = ctx.parameter::<String>().cloned().unwrap_or_default();
//!         ctx.set_next_parameter(arg(format!("hello {}", name)));
//!         Ok(())
//!     })
//!     .function("done", |_| Ok(()))
//!     .build()?;
//!
//! office.open()?;
//! office.invoke_and_wait("hello", arg("world".to_string()), None)?;
//! office.close();
//! # Ok::<(), office_engine::EngineError>(())
//! ```

pub mod escalation;
pub mod function;
pub mod job;
pub mod object;
pub mod observability;
pub mod office;
pub mod process;
pub mod team;
pub mod utils;

// Re-export commonly used types
pub use escalation::Escalation;
pub use function::{arg, FlowCallback, FlowOutcome, FunctionContext, ManagedFunction, Parameter};
pub use object::{
    AnyObject, FnSource, ManagedObjectSource, ObjectScope, Readiness, SourceContext, Sourced,
};
pub use office::{
    CloseReport, FunctionSpec, InputGateway, InputSources, ObjectSpec, Office, OfficeBuilder,
    OfficeStats, SectionSpec, WiringTable,
};
pub use process::{ProcessCallback, ProcessId, ProcessInfo, ProcessOutcome};
pub use team::{ContextToken, TeamKind};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
