// src/runtime/identity.rs
//! Agent identity
//!
//! Created when an agent package is admitted into the host and kept for the
//! whole battle. Only the validity flag and the accumulated statistics change
//! after creation.

use crate::loader::Fingerprint;
use crate::runtime::resource_limiter::PermissionDomain;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Host-assigned agent id, stable for the battle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgentId(pub u32);

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent#{}", self.0)
    }
}

/// Per-battle counters folded in from every round's execution context
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub rounds_played: u32,
    pub skipped_turns: u64,
    pub violations: u32,
    pub disqualifications: u32,
    pub forced_stops: u32,
    pub last_energy: f64,
}

/// Identity of a loaded agent
#[derive(Debug)]
pub struct AgentIdentity {
    id: AgentId,
    name: String,
    version: String,
    namespace: String,
    fingerprint: Option<Fingerprint>,
    domain: PermissionDomain,
    valid: AtomicBool,
    stats: Mutex<AgentStats>,
}

impl AgentIdentity {
    pub fn new(
        id: AgentId,
        name: impl Into<String>,
        version: impl Into<String>,
        fingerprint: Option<Fingerprint>,
        domain: PermissionDomain,
    ) -> Self {
        let name = name.into();
        let namespace = match name.rfind('.') {
            Some(idx) => name[..idx].to_string(),
            None => String::new(),
        };
        Self {
            id,
            valid: AtomicBool::new(fingerprint.is_some()),
            name,
            version: version.into(),
            namespace,
            fingerprint,
            domain,
            stats: Mutex::new(AgentStats::default()),
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Root namespace the agent's code lives in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn domain(&self) -> &PermissionDomain {
        &self.domain
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Permanently exclude this agent from scheduling
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn stats(&self) -> AgentStats {
        self.stats.lock().clone()
    }

    pub(crate) fn update_stats(&self, f: impl FnOnce(&mut AgentStats)) {
        f(&mut self.stats.lock());
    }
}
