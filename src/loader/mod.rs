// src/loader/mod.rs
//! Agent loading
//!
//! - **Package**: the data record describing a loadable agent, with its
//!   capability traits
//! - **Isolation**: namespace policy, code closure, content fingerprint and
//!   the load cache
//!
//! # Flow
//!
//! ```text
//! AgentPackage → AgentLoader::load() → namespace check → closure walk
//!                                                            ↓
//!                                       SHA-256 fingerprint → cache
//!                                                            ↓
//!                                               Arc<LoadedAgent>
//! ```

pub mod isolation;
pub mod package;

pub use isolation::{AgentLoader, Fingerprint, LoadedAgent};
pub use package::{AgentFactory, AgentPackage, CodeUnit, Describable, Sourced, Versioned};
