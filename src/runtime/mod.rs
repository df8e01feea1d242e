// src/runtime/mod.rs
//! Sandboxed agent execution
//!
//! This module provides the isolation boundary around untrusted agent code:
//!
//! - **Host**: admits agents, owns the thread registry and every execution
//!   context
//! - **Sandbox**: the permission enforcer deciding every sensitive operation
//! - **Resource Limiter**: per-agent permission domain and the filesystem
//!   byte quota
//! - **Thread Manager**: thread groups, the thread cap, stop requests and
//!   forced stops
//! - **Turn Gate**: the park/wake handshake between an agent and the
//!   scheduler
//! - **Agent Runtime**: one agent's per-round execution context
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── SandboxHost ─────────────────────────────┐
//! │                                                                       │
//! │  ThreadRegistry: ThreadId ──► AgentRuntime (per agent, per round)     │
//! │        ▲                        ├── ThreadGroup (cap, live threads)   │
//! │        │ resolve(caller)        ├── TurnGate   (park / wake)          │
//! │        │                        ├── EventInbox (host → agent)         │
//! │  PermissionEnforcer             ├── QuotaTracker + AgentFileSystem    │
//! │        │                        └── AgentOutput                       │
//! │        ▼                                                              │
//! │  Allow | Deny ──► punish_violation() ──► energy drained, diagnostic   │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every agent thread is attached to exactly one context. A thread the
//! registry cannot place is untrusted and denied everything.

pub mod agent_runtime;
pub mod diagnostics;
pub mod file_system;
pub mod host;
pub mod identity;
pub mod output;
pub mod resource_limiter;
pub mod sandbox;
pub mod thread_manager;
pub mod turn_gate;

// Re-export commonly used types
pub use agent_runtime::{AgentRuntime, AgentStatus, INITIAL_ENERGY};
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticLog, DiagnosticSink};
pub use file_system::{AgentFileSystem, HandleId, ReadAccess};
pub use host::{AgentControlPort, Resolution, SandboxHost, ThreadRegistry};
pub use identity::{AgentId, AgentIdentity, AgentStats};
pub use output::AgentOutput;
pub use resource_limiter::{PermissionDomain, QuotaCheck, QuotaTracker, QuotaUsage, ResourceLimits};
pub use sandbox::{Operation, PackagePolicy, PermissionEnforcer, StdStream, Verdict};
pub use thread_manager::{Liveness, ThreadGroup, ThreadGroupId, ThreadLifecycleManager, ThreadTermination};
pub use turn_gate::TurnGate;
