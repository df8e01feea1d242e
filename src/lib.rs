// src/lib.rs
//! Arena Engine Library
//!
//! This library hosts untrusted, independently written agents that compete
//! in a turn-based simulation, each confined to its own sandbox.
//!
//! # Architecture
//!
//! The engine is structured into several key modules:
//!
//! - **loader**: namespace policy, code closure and content fingerprints
//! - **runtime**: execution contexts, permission enforcement, quotas and
//!   thread lifecycle
//! - **events**: per-agent event queues with priorities and interruption
//! - **agent**: the surface agent code is written against
//! - **battle**: the turn scheduler, rounds and lifecycle notifications
//! - **samples**: built-in sample agents and a sample world
//! - **observability**: tracing and metrics set-up
//! - **utils**: configuration, errors and path helpers

// Public module exports
pub mod agent;
pub mod battle;
pub mod events;
pub mod loader;
pub mod observability;
pub mod runtime;
pub mod samples;
pub mod utils;

// Re-export commonly used types
pub use agent::{Agent, AgentContext, EventHandler, Halt};
pub use battle::{Battle, BattleListener, BattleResults, RoundOutcome, World};
pub use loader::{AgentLoader, AgentPackage, Fingerprint};
pub use runtime::host::SandboxHost;
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");

/// Engine build information
pub struct BuildInfo {
    pub version: &'static str,
    pub git_hash: &'static str,
    pub build_timestamp: &'static str,
    pub rustc_version: &'static str,
}

impl BuildInfo {
    pub fn current() -> Self {
        Self {
            version: VERSION,
            git_hash: GIT_HASH,
            build_timestamp: env!("BUILD_TIMESTAMP"),
            rustc_version: env!("RUSTC_VERSION"),
        }
    }
}
