// src/runtime/host.rs
//! The sandbox host
//!
//! [`SandboxHost`] owns every registry the engine needs. There is no global
//! state: subsystems receive the host (or an `Arc` of the piece they need)
//! explicitly.
//!
//! - **ThreadRegistry**: which thread belongs to which execution context,
//!   plus the set of host ("safe") threads
//! - **AgentLoader**: content-addressed cache of loaded agent code
//! - **Identities**: every admitted agent, valid or not
//! - **Sequence generator**: host-wide event sequence numbers
//! - **Diagnostics**: the channel agent threads report through

use crate::events::event::{Event, EventKind};
use crate::loader::{AgentLoader, AgentPackage, Describable, LoadedAgent, Sourced, Versioned};
use crate::runtime::agent_runtime::AgentRuntime;
use crate::runtime::diagnostics::{Diagnostic, DiagnosticLog};
use crate::runtime::file_system::DATA_DIR_SUFFIX;
use crate::runtime::identity::{AgentId, AgentIdentity};
use crate::runtime::resource_limiter::{PermissionDomain, ResourceLimits};
use crate::runtime::sandbox::{PackagePolicy, PermissionEnforcer};
use crate::runtime::thread_manager::ThreadLifecycleManager;
use crate::utils::config::EngineConfig;
use crate::utils::errors::{EngineError, LoadError};
use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{info, warn};

/// How a thread resolves for permission checks
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Host thread, runs in the host's own security context
    Safe,
    Agent(Arc<AgentRuntime>),
    Unresolved,
}

/// Thread → execution context registry
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: DashMap<ThreadId, Arc<AgentRuntime>>,
    safe: DashSet<ThreadId>,
    contexts: DashMap<AgentId, Arc<AgentRuntime>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_safe(&self, thread: ThreadId) {
        self.safe.insert(thread);
    }

    pub fn unmark_safe(&self, thread: ThreadId) {
        self.safe.remove(&thread);
    }

    pub fn register_context(&self, runtime: &Arc<AgentRuntime>) {
        self.contexts.insert(runtime.id(), Arc::clone(runtime));
    }

    /// Drop the context from the live set. Threads still attached to it keep
    /// resolving to it, and it denies everything once torn down.
    pub fn release_context(&self, runtime: &AgentRuntime) {
        self.contexts
            .remove_if(&runtime.id(), |_, live| std::ptr::eq(Arc::as_ptr(live), runtime));
    }

    pub fn attach(&self, thread: ThreadId, runtime: &Arc<AgentRuntime>) {
        self.threads.insert(thread, Arc::clone(runtime));
    }

    pub fn detach(&self, thread: ThreadId) {
        self.threads.remove(&thread);
    }

    pub fn resolve(&self, thread: ThreadId) -> Resolution {
        if self.safe.contains(&thread) {
            return Resolution::Safe;
        }
        match self.threads.get(&thread) {
            Some(entry) => Resolution::Agent(Arc::clone(entry.value())),
            None => Resolution::Unresolved,
        }
    }

    pub fn resolve_agent(&self, thread: ThreadId) -> Option<Arc<AgentRuntime>> {
        self.threads.get(&thread).map(|e| Arc::clone(e.value()))
    }

    pub fn context(&self, agent: AgentId) -> Option<Arc<AgentRuntime>> {
        self.contexts.get(&agent).map(|e| Arc::clone(e.value()))
    }

    /// Live contexts ordered by agent id
    pub fn contexts(&self) -> Vec<Arc<AgentRuntime>> {
        let mut all: Vec<_> = self.contexts.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort_by_key(|rt| rt.id());
        all
    }

    pub fn attached_threads(&self) -> usize {
        self.threads.len()
    }
}

/// Narrow interface collaborators (world, scoring) use to act on agents
pub trait AgentControlPort: Send + Sync {
    fn energy(&self, agent: AgentId) -> Option<f64>;

    fn set_energy(&self, agent: AgentId, energy: f64);

    /// Force the agent's energy to zero for the rest of the round
    fn drain_energy(&self, agent: AgentId);

    /// Append a line to the agent's output
    fn println(&self, agent: AgentId, line: &str);

    fn is_alive(&self, agent: AgentId) -> bool;
}

impl AgentControlPort for ThreadRegistry {
    fn energy(&self, agent: AgentId) -> Option<f64> {
        self.context(agent).map(|rt| rt.energy())
    }

    fn set_energy(&self, agent: AgentId, energy: f64) {
        if let Some(rt) = self.context(agent) {
            rt.set_energy(energy);
        }
    }

    fn drain_energy(&self, agent: AgentId) {
        if let Some(rt) = self.context(agent) {
            rt.drain_energy();
        }
    }

    fn println(&self, agent: AgentId, line: &str) {
        if let Some(rt) = self.context(agent) {
            rt.println(line);
        }
    }

    fn is_alive(&self, agent: AgentId) -> bool {
        self.context(agent).map(|rt| rt.is_alive()).unwrap_or(false)
    }
}

pub struct SandboxHost {
    config: EngineConfig,
    registry: Arc<ThreadRegistry>,
    enforcer: Arc<PermissionEnforcer>,
    lifecycle: Arc<ThreadLifecycleManager>,
    loader: AgentLoader,
    identities: RwLock<Vec<Arc<AgentIdentity>>>,
    loaded: DashMap<AgentId, Arc<LoadedAgent>>,
    properties: Arc<BTreeMap<String, String>>,
    diagnostics: DiagnosticLog,
    next_agent: AtomicU32,
    sequence: AtomicU64,
}

impl SandboxHost {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_policy(config, PackagePolicy::default())
    }

    pub fn with_policy(config: EngineConfig, policy: PackagePolicy) -> Self {
        let registry = Arc::new(ThreadRegistry::new());
        let enforcer = Arc::new(PermissionEnforcer::new(Arc::clone(&registry), policy.clone()));
        let lifecycle = Arc::new(ThreadLifecycleManager::new(
            Arc::clone(&registry),
            config.scheduler.stop_wait(),
            config.scheduler.undead_grace_turns,
        ));

        let mut properties = BTreeMap::new();
        properties.insert("arena.version".to_string(), crate::VERSION.to_string());
        properties.insert("os.name".to_string(), std::env::consts::OS.to_string());
        properties.insert("os.arch".to_string(), std::env::consts::ARCH.to_string());
        properties.insert(
            "arena.thread_cap".to_string(),
            config.sandbox.thread_cap.to_string(),
        );

        Self {
            loader: AgentLoader::new(policy),
            registry,
            enforcer,
            lifecycle,
            identities: RwLock::new(Vec::new()),
            loaded: DashMap::new(),
            properties: Arc::new(properties),
            diagnostics: DiagnosticLog::new(),
            next_agent: AtomicU32::new(1),
            sequence: AtomicU64::new(1),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ThreadRegistry> {
        &self.registry
    }

    pub fn enforcer(&self) -> &Arc<PermissionEnforcer> {
        &self.enforcer
    }

    pub fn lifecycle(&self) -> &Arc<ThreadLifecycleManager> {
        &self.lifecycle
    }

    pub fn loader(&self) -> &AgentLoader {
        &self.loader
    }

    pub fn properties(&self) -> &Arc<BTreeMap<String, String>> {
        &self.properties
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    /// The calling thread runs with host privileges from now on
    pub fn mark_current_thread_safe(&self) {
        self.registry.mark_safe(thread::current().id());
    }

    /// Load and admit an agent package.
    ///
    /// A package that fails to load is still recorded, as an invalid identity
    /// that is never scheduled nor retried.
    pub fn admit(&self, package: Arc<AgentPackage>) -> Result<AgentId, LoadError> {
        let id = AgentId(self.next_agent.fetch_add(1, Ordering::Relaxed));
        let domain = self.domain_for(&package);

        match self.loader.load(Arc::clone(&package)) {
            Ok(loaded) => {
                let identity = AgentIdentity::new(
                    id,
                    package.name(),
                    package.version(),
                    Some(*loaded.fingerprint()),
                    domain,
                );
                info!(
                    agent = %package.name(),
                    fingerprint = %loaded.fingerprint(),
                    "agent admitted as {}",
                    id
                );
                self.loaded.insert(id, loaded);
                self.identities.write().push(Arc::new(identity));
                Ok(id)
            }
            Err(err) => {
                warn!(agent = %package.name(), error = %err, "agent failed to load");
                let identity =
                    AgentIdentity::new(id, package.name(), package.version(), None, domain);
                self.identities.write().push(Arc::new(identity));
                let failure = EngineError::Load(err.clone());
                self.diagnostics
                    .sink()
                    .emit(Diagnostic::from_error(&failure, Some(package.name())));
                Err(err)
            }
        }
    }

    fn domain_for(&self, package: &AgentPackage) -> PermissionDomain {
        let mut domain = PermissionDomain::new(ResourceLimits::from(&self.config.sandbox));
        if let Some(root) = package.root_dir() {
            domain = domain.with_readable_dir(root);
        }
        let data_root = package
            .data_root()
            .or(self.config.sandbox.data_root.as_deref());
        if let Some(data_root) = data_root {
            let dir: PathBuf =
                data_root.join(format!("{}{}", package.name(), DATA_DIR_SUFFIX));
            domain = domain.with_writable_dir(dir);
        }
        domain
    }

    pub fn identities(&self) -> Vec<Arc<AgentIdentity>> {
        self.identities.read().clone()
    }

    pub fn identity(&self, id: AgentId) -> Option<Arc<AgentIdentity>> {
        self.identities.read().iter().find(|i| i.id() == id).cloned()
    }

    /// Identities that may take part in the next round
    pub fn schedulable(&self) -> Vec<Arc<AgentIdentity>> {
        self.identities
            .read()
            .iter()
            .filter(|i| i.is_valid())
            .cloned()
            .collect()
    }

    pub fn loaded(&self, id: AgentId) -> Option<Arc<LoadedAgent>> {
        self.loaded.get(&id).map(|e| Arc::clone(e.value()))
    }

    /// Create and register the execution context of `identity` for `round`
    pub fn create_context(&self, identity: &Arc<AgentIdentity>, round: u32) -> Arc<AgentRuntime> {
        let runtime = Arc::new(AgentRuntime::new(
            Arc::clone(identity),
            round,
            self.config.sandbox.event_queue_capacity,
            self.diagnostics.sink(),
        ));
        self.registry.register_context(&runtime);
        runtime
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue an event for the agent's next turn hand-off
    pub fn deliver(&self, runtime: &AgentRuntime, kind: EventKind, turn: u64, data: serde_json::Value) {
        let event = Event::new(kind, turn, self.next_sequence(), data);
        if runtime.inbox().push(event).is_err() {
            runtime.system(&format!(
                "Not adding to {}'s queue, exceeded {} events in queue.",
                runtime.name(),
                runtime.inbox().capacity()
            ));
        }
    }
}
