// src/runtime/diagnostics.rs
//! Diagnostics raised while a battle runs
//!
//! Agent threads and the scheduler push [`Diagnostic`]s into a crossbeam
//! channel; the scheduler drains it once per turn, keeps a log, and forwards
//! each record to the battle listener.

use crate::utils::errors::EngineError;
use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    PermissionViolation,
    ResourceExhausted,
    SkippedTurn,
    Inactivity,
    UndeadThread,
    AgentPanic,
    LoadError,
    RoundAborted,
    InternalFault,
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub at: DateTime<Utc>,
    pub kind: DiagnosticKind,
    pub agent: Option<String>,
    pub turn: Option<u64>,
    pub message: String,
    pub fatal: bool,
}

impl Diagnostic {
    pub fn new(kind: DiagnosticKind, agent: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            kind,
            agent: agent.map(str::to_string),
            turn: None,
            message: message.into(),
            fatal: false,
        }
    }

    pub fn at_turn(mut self, turn: u64) -> Self {
        self.turn = Some(turn);
        self
    }

    /// Build a diagnostic from an engine error, keeping its severity
    pub fn from_error(err: &EngineError, agent: Option<&str>) -> Self {
        let kind = match err {
            EngineError::PermissionViolation { .. } => DiagnosticKind::PermissionViolation,
            EngineError::ResourceExhausted { .. } => DiagnosticKind::ResourceExhausted,
            EngineError::Inactivity { .. } => DiagnosticKind::Inactivity,
            EngineError::UndeadThread { .. } => DiagnosticKind::UndeadThread,
            EngineError::Load(_) => DiagnosticKind::LoadError,
            EngineError::RoundAborted(_) => DiagnosticKind::RoundAborted,
            _ => DiagnosticKind::InternalFault,
        };
        let mut diagnostic = Self::new(kind, agent, err.to_string());
        diagnostic.fatal = err.is_fatal();
        diagnostic
    }
}

/// Sending half, cloned into every execution context
#[derive(Debug, Clone)]
pub struct DiagnosticSink {
    tx: Sender<Diagnostic>,
}

impl DiagnosticSink {
    pub fn emit(&self, diagnostic: Diagnostic) {
        // The receiver lives as long as the host; a closed channel only
        // happens during process shutdown.
        let _ = self.tx.send(diagnostic);
    }
}

/// Receiving half plus the accumulated log
#[derive(Debug)]
pub struct DiagnosticLog {
    tx: Sender<Diagnostic>,
    rx: Receiver<Diagnostic>,
    history: Mutex<Vec<Diagnostic>>,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::new()
    }
}

impl DiagnosticLog {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn sink(&self) -> DiagnosticSink {
        DiagnosticSink {
            tx: self.tx.clone(),
        }
    }

    /// Move everything pending into the history and return the new records
    pub fn drain(&self) -> Vec<Diagnostic> {
        let fresh: Vec<Diagnostic> = self.rx.try_iter().collect();
        if !fresh.is_empty() {
            self.history.lock().extend(fresh.iter().cloned());
        }
        fresh
    }

    pub fn history(&self) -> Vec<Diagnostic> {
        self.history.lock().clone()
    }

    pub fn count(&self, kind: DiagnosticKind) -> usize {
        self.history
            .lock()
            .iter()
            .filter(|d| d.kind == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_moves_into_history() {
        let log = DiagnosticLog::new();
        let sink = log.sink();
        sink.emit(Diagnostic::new(
            DiagnosticKind::SkippedTurn,
            Some("sample.Slow"),
            "skipped turn 3",
        ));
        let fresh = log.drain();
        assert_eq!(fresh.len(), 1);
        assert!(log.drain().is_empty());
        assert_eq!(log.count(DiagnosticKind::SkippedTurn), 1);
    }

    #[test]
    fn test_from_error_keeps_severity() {
        let err = EngineError::Inactivity {
            agent: "sample.Idle".into(),
            skipped: 31,
        };
        let diagnostic = Diagnostic::from_error(&err, Some("sample.Idle"));
        assert_eq!(diagnostic.kind, DiagnosticKind::Inactivity);
        assert!(diagnostic.fatal);
    }

    #[test]
    fn test_expected_breaches_are_not_fatal() {
        let err = EngineError::ResourceExhausted {
            agent: "sample.Writer".into(),
            resource: "filesystem".into(),
            limit: 200_000,
        };
        let diagnostic = Diagnostic::from_error(&err, Some("sample.Writer"));
        assert_eq!(diagnostic.kind, DiagnosticKind::ResourceExhausted);
        assert!(!diagnostic.fatal);
        assert_eq!(diagnostic.message, "sample.Writer exhausted its filesystem quota of 200000");
    }
}
