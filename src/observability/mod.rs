// src/observability/mod.rs
//! Tracing and metrics setup
//!
//! The engine itself only emits through the `tracing` and `metrics` facades.
//! Binaries embedding an office call [`init_tracing`] and optionally
//! [`init_metrics`] once at startup.

use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static TRACING_INIT: Once = Once::new();

pub const JOBS_EXECUTED: &str = "office_jobs_executed_total";
pub const JOBS_CANCELLED: &str = "office_jobs_cancelled_total";
pub const PROCESSES_STARTED: &str = "office_processes_started_total";
pub const PROCESSES_COMPLETED: &str = "office_processes_completed_total";
pub const PROCESSES_FAILED: &str = "office_processes_failed_total";
pub const ESCALATIONS: &str = "office_escalations_total";
pub const WORKER_PANICS: &str = "office_worker_panics_total";

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// JSON structured logs
    Json,
    /// Human readable logs
    #[default]
    Pretty,
}

/// Install the global tracing subscriber
///
/// Honours `RUST_LOG` (default `info`). Subsequent calls are no-ops, and a
/// subscriber installed elsewhere first is left in place.
pub fn init_tracing(format: LogFormat) {
    TRACING_INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let installed = match format {
            LogFormat::Json => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_thread_names(true))
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_thread_names(true))
                .try_init(),
        };

        if installed.is_err() {
            tracing::debug!("tracing subscriber already installed, keeping existing one");
        }
    });
}

/// Install a Prometheus metrics recorder and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EngineError::Metrics(e.to_string()))
}

/// Render an error and every `source()` below it as `a: b: c`
pub fn causal_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
