// src/runtime/agent_runtime.rs
//! Execution context of one agent for one round
//!
//! Holds everything the host tracks about a running agent:
//! - Energy and status (eliminated, disqualified, skip counters)
//! - The thread group and the turn gate of its primary thread
//! - Event inbox, captured output, quota tracker and file system view
//! - The stop token observed at the agent's yield point
//!
//! One context exists per admitted agent per round. It is created at round
//! start and torn down at round end, on disqualification, or by a forced stop.

use crate::battle::snapshot::{AgentView, TurnSnapshot};
use crate::events::inbox::EventInbox;
use crate::observability::metrics;
use crate::runtime::diagnostics::{Diagnostic, DiagnosticKind, DiagnosticSink};
use crate::runtime::file_system::AgentFileSystem;
use crate::runtime::identity::{AgentId, AgentIdentity};
use crate::runtime::output::AgentOutput;
use crate::runtime::resource_limiter::QuotaTracker;
use crate::runtime::thread_manager::ThreadGroup;
use crate::runtime::turn_gate::TurnGate;
use crate::utils::errors::EngineError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Energy every agent starts a round with
pub const INITIAL_ENERGY: f64 = 100.0;

/// Mutable status of an execution context
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub energy: f64,
    /// Energy was forced to zero by the host and stays there
    pub eliminated: bool,
    pub disqualified: bool,
    pub consecutive_skips: u32,
    pub skipped_turns: u64,
    /// Turn at which a stop was requested
    pub stop_requested_at: Option<u64>,
    pub forced_stop: bool,
    pub torn_down: bool,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self {
            energy: INITIAL_ENERGY,
            eliminated: false,
            disqualified: false,
            consecutive_skips: 0,
            skipped_turns: 0,
            stop_requested_at: None,
            forced_stop: false,
            torn_down: false,
        }
    }
}

pub struct AgentRuntime {
    identity: Arc<AgentIdentity>,

    round: u32,

    /// Replaced when a forced stop recycles the group
    group: RwLock<Arc<ThreadGroup>>,

    gate: TurnGate,

    inbox: EventInbox,

    output: AgentOutput,

    quota: QuotaTracker,

    files: AgentFileSystem,

    stop: CancellationToken,

    status: Mutex<AgentStatus>,

    /// Distinct violation messages already reported this round
    violations: Mutex<HashSet<String>>,

    diagnostics: DiagnosticSink,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("agent", &self.identity.name())
            .field("round", &self.round)
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl AgentRuntime {
    pub fn new(
        identity: Arc<AgentIdentity>,
        round: u32,
        event_capacity: usize,
        diagnostics: DiagnosticSink,
    ) -> Self {
        let domain = identity.domain();
        let limits = domain.limits.clone();
        let files = AgentFileSystem::new(
            domain.readable_dir.as_deref(),
            domain.writable_dir.as_deref(),
            limits.max_open_files,
        );
        let quota = QuotaTracker::new(limits.clone());
        quota.initialize_bytes(files.scan_usage());

        let group = ThreadGroup::new(identity.id(), identity.name(), 0, limits.thread_cap);

        Self {
            output: AgentOutput::new(identity.name()),
            gate: TurnGate::new(Arc::new(TurnSnapshot::empty(round))),
            inbox: EventInbox::new(event_capacity),
            group: RwLock::new(Arc::new(group)),
            stop: CancellationToken::new(),
            status: Mutex::new(AgentStatus::default()),
            violations: Mutex::new(HashSet::new()),
            identity,
            round,
            quota,
            files,
            diagnostics,
        }
    }

    pub fn id(&self) -> AgentId {
        self.identity.id()
    }

    pub fn name(&self) -> &str {
        self.identity.name()
    }

    pub fn identity(&self) -> &Arc<AgentIdentity> {
        &self.identity
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn group(&self) -> Arc<ThreadGroup> {
        Arc::clone(&self.group.read())
    }

    pub(crate) fn replace_group(&self, group: ThreadGroup) {
        *self.group.write() = Arc::new(group);
    }

    pub fn gate(&self) -> &TurnGate {
        &self.gate
    }

    pub fn inbox(&self) -> &EventInbox {
        &self.inbox
    }

    pub fn output(&self) -> &AgentOutput {
        &self.output
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub fn files(&self) -> &AgentFileSystem {
        &self.files
    }

    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub fn diagnostics(&self) -> &DiagnosticSink {
        &self.diagnostics
    }

    pub fn status(&self) -> AgentStatus {
        self.status.lock().clone()
    }

    pub fn energy(&self) -> f64 {
        self.status.lock().energy
    }

    /// Energy updates from the world; a drained or disqualified agent stays at zero
    pub fn set_energy(&self, energy: f64) {
        let mut status = self.status.lock();
        if status.disqualified || status.eliminated {
            status.energy = 0.0;
        } else {
            status.energy = energy.max(0.0);
        }
    }

    /// Soft elimination: energy forced to zero for the rest of the round
    pub fn drain_energy(&self) {
        let mut status = self.status.lock();
        status.energy = 0.0;
        status.eliminated = true;
    }

    pub fn is_alive(&self) -> bool {
        let status = self.status.lock();
        status.energy > 0.0 && !status.disqualified
    }

    pub fn is_disqualified(&self) -> bool {
        self.status.lock().disqualified
    }

    /// Whether the scheduler still waits for this agent's commands
    pub fn is_schedulable(&self) -> bool {
        let status = self.status.lock();
        !status.disqualified && !status.torn_down && status.stop_requested_at.is_none()
    }

    pub fn is_torn_down(&self) -> bool {
        self.status.lock().torn_down
    }

    pub fn view(&self) -> AgentView {
        let status = self.status.lock();
        AgentView {
            id: self.id(),
            name: self.name().to_string(),
            energy: status.energy,
            alive: status.energy > 0.0 && !status.disqualified,
            disqualified: status.disqualified,
        }
    }

    pub fn println(&self, line: &str) {
        self.output.println(&self.quota, line);
    }

    /// Host notice in the agent's own output
    pub fn system(&self, message: &str) {
        self.output.system(&self.quota, message);
    }

    /// Report a denied operation. Each distinct message is reported once per
    /// round; every call drains energy. Returns whether this was new.
    pub fn punish_violation(&self, message: &str) -> bool {
        let first = self.violations.lock().insert(message.to_string());
        self.drain_energy();
        if first {
            error!(agent = %self.name(), reason = %message, "permission violation");
            self.system(message);
            let err = EngineError::PermissionViolation {
                agent: self.name().to_string(),
                reason: message.to_string(),
            };
            self.diagnostics.emit(Diagnostic::from_error(&err, Some(self.name())));
        }
        metrics::record_denial(self.name());
        first
    }

    pub fn violation_count(&self) -> usize {
        self.violations.lock().len()
    }

    /// A write was refused by the byte quota
    pub fn report_quota_exhausted(&self, first_notice: bool) {
        self.drain_energy();
        metrics::record_quota_rejection(self.name());
        if first_notice {
            let limit = self.quota.limits().byte_quota;
            warn!(agent = %self.name(), limit, "filesystem quota exhausted");
            self.system(&format!(
                "You have reached your filesystem quota of: {} bytes.",
                limit
            ));
            let err = EngineError::ResourceExhausted {
                agent: self.name().to_string(),
                resource: "filesystem".into(),
                limit,
            };
            self.diagnostics.emit(Diagnostic::from_error(&err, Some(self.name())));
        }
    }

    /// A panic escaped agent code on one of its threads
    pub fn report_panic(&self, thread: &str, message: &str) {
        self.drain_energy();
        warn!(agent = %self.name(), thread, "agent thread panicked: {}", message);
        self.system(&format!("{} has crashed: {}", thread, message));
        self.diagnostics.emit(Diagnostic::new(
            DiagnosticKind::AgentPanic,
            Some(self.name()),
            format!("thread {} panicked: {}", thread, message),
        ));
    }

    /// Count a skipped turn; returns the consecutive count
    pub fn record_skip(&self) -> u32 {
        let mut status = self.status.lock();
        status.consecutive_skips += 1;
        status.skipped_turns += 1;
        status.consecutive_skips
    }

    pub fn reset_skips(&self) {
        self.status.lock().consecutive_skips = 0;
    }

    pub fn disqualify(&self) {
        let mut status = self.status.lock();
        status.disqualified = true;
        status.eliminated = true;
        status.energy = 0.0;
    }

    /// Ask every thread of the agent to stop at its next yield point
    pub fn request_stop(&self, turn: u64) {
        {
            let mut status = self.status.lock();
            if status.stop_requested_at.is_none() {
                status.stop_requested_at = Some(turn);
            }
        }
        debug!(agent = %self.name(), turn, "stop requested");
        self.stop.cancel();
        self.gate.halt();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub(crate) fn mark_forced_stop(&self) {
        self.status.lock().forced_stop = true;
    }

    pub(crate) fn mark_torn_down(&self) {
        let mut status = self.status.lock();
        status.torn_down = true;
        if status.stop_requested_at.is_none() {
            status.stop_requested_at = Some(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::Fingerprint;
    use crate::runtime::diagnostics::DiagnosticLog;
    use crate::runtime::resource_limiter::{PermissionDomain, ResourceLimits};

    fn runtime(log: &DiagnosticLog) -> AgentRuntime {
        let identity = Arc::new(AgentIdentity::new(
            AgentId(1),
            "sample.Duck",
            "1.0",
            Some(Fingerprint::of(b"duck")),
            PermissionDomain::new(ResourceLimits::default()),
        ));
        AgentRuntime::new(identity, 1, 16, log.sink())
    }

    #[test]
    fn test_violation_reported_once() {
        let log = DiagnosticLog::new();
        let rt = runtime(&log);
        assert!(rt.is_alive());

        assert!(rt.punish_violation("no sockets"));
        assert!(!rt.punish_violation("no sockets"));
        assert_eq!(rt.energy(), 0.0);
        let diagnostics = log.drain();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::PermissionViolation);
        assert_eq!(diagnostics[0].message, "permission violation by sample.Duck: no sockets");
        assert!(!diagnostics[0].fatal);
        assert_eq!(rt.output().lines(), vec!["SYSTEM: no sockets".to_string()]);
    }

    #[test]
    fn test_drained_energy_sticks() {
        let log = DiagnosticLog::new();
        let rt = runtime(&log);
        rt.set_energy(80.0);
        assert_eq!(rt.energy(), 80.0);
        rt.punish_violation("bad file");
        rt.set_energy(50.0);
        assert_eq!(rt.energy(), 0.0);
    }

    #[test]
    fn test_skip_counting() {
        let log = DiagnosticLog::new();
        let rt = runtime(&log);
        assert_eq!(rt.record_skip(), 1);
        assert_eq!(rt.record_skip(), 2);
        rt.reset_skips();
        assert_eq!(rt.record_skip(), 1);
        assert_eq!(rt.status().skipped_turns, 3);
    }

    #[test]
    fn test_stop_halts_gate() {
        let log = DiagnosticLog::new();
        let rt = runtime(&log);
        rt.request_stop(4);
        rt.request_stop(9);
        assert!(rt.stop_requested());
        assert!(rt.gate().is_halted());
        assert_eq!(rt.status().stop_requested_at, Some(4));
        assert!(!rt.is_schedulable());
    }

    #[test]
    fn test_quota_notice() {
        let log = DiagnosticLog::new();
        let rt = runtime(&log);
        rt.report_quota_exhausted(true);
        rt.report_quota_exhausted(false);
        let diagnostics = log.drain();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].kind, DiagnosticKind::ResourceExhausted);
        assert!(rt
            .output()
            .contains("You have reached your filesystem quota of: 200000 bytes."));
    }
}
