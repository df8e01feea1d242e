// src/utils/mod.rs
//! Common utilities: configuration, errors and path handling

pub mod config;
pub mod errors;
pub mod paths;

pub use config::EngineConfig;
pub use errors::{EngineError, LoadError, Result};
