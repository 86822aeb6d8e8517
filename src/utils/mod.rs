// src/utils/mod.rs
//! Common utilities shared by every engine component

pub mod config;
pub mod errors;

pub use config::EngineConfig;
pub use errors::{EngineError, Result};
