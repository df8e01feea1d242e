// src/battle/results.rs
//! Round and battle reports

use crate::runtime::diagnostics::Diagnostic;
use crate::runtime::identity::{AgentId, AgentIdentity, AgentStats};
use serde::Serialize;

/// How a round ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RoundOutcome {
    /// The world reported a terminal condition
    Completed,

    /// No agent was left to schedule
    Deserted,

    TurnLimit,

    /// Aborted by request; ends the battle
    Cancelled,

    /// An agent thread would not stop; the battle moves on to the next round
    Undead { agent: String },

    /// Host-side failure; ends the battle
    Faulted { reason: String },
}

impl RoundOutcome {
    pub fn is_aborted(&self) -> bool {
        matches!(
            self,
            RoundOutcome::Cancelled | RoundOutcome::Undead { .. } | RoundOutcome::Faulted { .. }
        )
    }

    /// Whether the battle stops after this round
    pub fn ends_battle(&self) -> bool {
        matches!(self, RoundOutcome::Cancelled | RoundOutcome::Faulted { .. })
    }
}

/// One agent's round
#[derive(Debug, Clone, Serialize)]
pub struct AgentRoundResult {
    pub id: AgentId,
    pub name: String,
    pub final_energy: f64,
    pub skipped_turns: u64,
    pub violations: usize,
    pub disqualified: bool,
    pub forced_stop: bool,
    pub output: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: u32,
    pub turns: u64,
    pub outcome: RoundOutcome,
    pub agents: Vec<AgentRoundResult>,
}

impl RoundReport {
    pub fn agent(&self, name: &str) -> Option<&AgentRoundResult> {
        self.agents.iter().find(|a| a.name == name)
    }
}

/// Per-battle summary of one admitted agent
#[derive(Debug, Clone, Serialize)]
pub struct AgentResult {
    pub id: AgentId,
    pub name: String,
    pub version: String,
    pub fingerprint: Option<String>,
    pub valid: bool,
    pub stats: AgentStats,
}

impl From<&AgentIdentity> for AgentResult {
    fn from(identity: &AgentIdentity) -> Self {
        Self {
            id: identity.id(),
            name: identity.name().to_string(),
            version: identity.version().to_string(),
            fingerprint: identity.fingerprint().map(|f| f.to_hex()),
            valid: identity.is_valid(),
            stats: identity.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BattleResults {
    pub battle_id: String,
    pub aborted: bool,
    pub rounds: Vec<RoundReport>,
    pub agents: Vec<AgentResult>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BattleResults {
    pub fn agent(&self, name: &str) -> Option<&AgentResult> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_severity() {
        assert!(!RoundOutcome::Completed.is_aborted());
        assert!(RoundOutcome::Undead { agent: "a".into() }.is_aborted());
        assert!(!RoundOutcome::Undead { agent: "a".into() }.ends_battle());
        assert!(RoundOutcome::Cancelled.ends_battle());
        assert!(RoundOutcome::Faulted { reason: "x".into() }.ends_battle());
    }
}
