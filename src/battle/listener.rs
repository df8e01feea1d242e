// src/battle/listener.rs
//! Battle lifecycle notifications for the host / UI layer

use crate::battle::results::{BattleResults, RoundReport};
use crate::battle::snapshot::TurnSnapshot;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Static facts about a battle, sent with `battle_started`
#[derive(Debug, Clone, Serialize)]
pub struct BattleInfo {
    pub battle_id: String,
    pub rounds: u32,
    pub agents: Vec<String>,
    pub turn_budget_us: u64,
}

/// Receives lifecycle notifications. All methods default to no-ops.
pub trait BattleListener: Send + Sync {
    fn battle_started(&self, _info: &BattleInfo) {}

    fn round_started(&self, _round: u32, _snapshot: &TurnSnapshot) {}

    fn turn_ended(&self, _snapshot: &TurnSnapshot) {}

    fn round_ended(&self, _report: &RoundReport) {}

    fn battle_error(&self, _message: &str, _is_fatal: bool) {}

    fn battle_completed(&self, _results: &BattleResults) {}

    fn battle_finished(&self, _aborted: bool) {}
}

/// Forwards to several listeners in order
#[derive(Default, Clone)]
pub struct Listeners {
    inner: Vec<Arc<dyn BattleListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, listener: Arc<dyn BattleListener>) {
        self.inner.push(listener);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl BattleListener for Listeners {
    fn battle_started(&self, info: &BattleInfo) {
        self.inner.iter().for_each(|l| l.battle_started(info));
    }

    fn round_started(&self, round: u32, snapshot: &TurnSnapshot) {
        self.inner.iter().for_each(|l| l.round_started(round, snapshot));
    }

    fn turn_ended(&self, snapshot: &TurnSnapshot) {
        self.inner.iter().for_each(|l| l.turn_ended(snapshot));
    }

    fn round_ended(&self, report: &RoundReport) {
        self.inner.iter().for_each(|l| l.round_ended(report));
    }

    fn battle_error(&self, message: &str, is_fatal: bool) {
        self.inner.iter().for_each(|l| l.battle_error(message, is_fatal));
    }

    fn battle_completed(&self, results: &BattleResults) {
        self.inner.iter().for_each(|l| l.battle_completed(results));
    }

    fn battle_finished(&self, aborted: bool) {
        self.inner.iter().for_each(|l| l.battle_finished(aborted));
    }
}

/// Logs every notification through `tracing`
#[derive(Debug, Default)]
pub struct LoggingListener;

impl BattleListener for LoggingListener {
    fn battle_started(&self, info: &BattleInfo) {
        info!(
            battle = %info.battle_id,
            rounds = info.rounds,
            agents = ?info.agents,
            budget_us = info.turn_budget_us,
            "battle started"
        );
    }

    fn round_started(&self, round: u32, _snapshot: &TurnSnapshot) {
        info!(round, "round started");
    }

    fn turn_ended(&self, snapshot: &TurnSnapshot) {
        debug!(round = snapshot.round(), turn = snapshot.turn(), "turn ended");
    }

    fn round_ended(&self, report: &RoundReport) {
        info!(
            round = report.round,
            turns = report.turns,
            outcome = ?report.outcome,
            "round ended"
        );
    }

    fn battle_error(&self, message: &str, is_fatal: bool) {
        if is_fatal {
            error!(fatal = true, "{}", message);
        } else {
            warn!(fatal = false, "{}", message);
        }
    }

    fn battle_completed(&self, results: &BattleResults) {
        info!(
            battle = %results.battle_id,
            rounds = results.rounds.len(),
            "battle completed"
        );
    }

    fn battle_finished(&self, aborted: bool) {
        info!(aborted, "battle finished");
    }
}

/// A recorded notification
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    BattleStarted { rounds: u32 },
    RoundStarted { round: u32 },
    TurnEnded { round: u32, turn: u64 },
    RoundEnded { round: u32, turns: u64 },
    BattleError { message: String, fatal: bool },
    BattleCompleted { rounds: usize },
    BattleFinished { aborted: bool },
}

/// Records every notification; for tests and replays
#[derive(Debug, Default)]
pub struct CollectingListener {
    seen: Mutex<Vec<Notification>>,
}

impl CollectingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn errors(&self) -> Vec<(String, bool)> {
        self.seen
            .lock()
            .iter()
            .filter_map(|n| match n {
                Notification::BattleError { message, fatal } => Some((message.clone(), *fatal)),
                _ => None,
            })
            .collect()
    }

    pub fn turns_ended(&self) -> usize {
        self.seen
            .lock()
            .iter()
            .filter(|n| matches!(n, Notification::TurnEnded { .. }))
            .count()
    }

    fn push(&self, notification: Notification) {
        self.seen.lock().push(notification);
    }
}

impl BattleListener for CollectingListener {
    fn battle_started(&self, info: &BattleInfo) {
        self.push(Notification::BattleStarted { rounds: info.rounds });
    }

    fn round_started(&self, round: u32, _snapshot: &TurnSnapshot) {
        self.push(Notification::RoundStarted { round });
    }

    fn turn_ended(&self, snapshot: &TurnSnapshot) {
        self.push(Notification::TurnEnded {
            round: snapshot.round(),
            turn: snapshot.turn(),
        });
    }

    fn round_ended(&self, report: &RoundReport) {
        self.push(Notification::RoundEnded {
            round: report.round,
            turns: report.turns,
        });
    }

    fn battle_error(&self, message: &str, is_fatal: bool) {
        self.push(Notification::BattleError {
            message: message.to_string(),
            fatal: is_fatal,
        });
    }

    fn battle_completed(&self, results: &BattleResults) {
        self.push(Notification::BattleCompleted {
            rounds: results.rounds.len(),
        });
    }

    fn battle_finished(&self, aborted: bool) {
        self.push(Notification::BattleFinished { aborted });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fanout_preserves_order() {
        let a = Arc::new(CollectingListener::new());
        let b = Arc::new(CollectingListener::new());
        let mut listeners = Listeners::new();
        listeners.add(a.clone());
        listeners.add(b.clone());

        listeners.round_started(1, &TurnSnapshot::empty(1));
        listeners.battle_error("boom", true);

        for l in [a, b] {
            assert_eq!(
                l.notifications(),
                vec![
                    Notification::RoundStarted { round: 1 },
                    Notification::BattleError {
                        message: "boom".to_string(),
                        fatal: true
                    },
                ]
            );
        }
    }

    #[test]
    fn test_errors_filter() {
        let listener = CollectingListener::new();
        listener.battle_error("skipped", false);
        listener.turn_ended(&TurnSnapshot::empty(1));
        assert_eq!(listener.errors(), vec![("skipped".to_string(), false)]);
        assert_eq!(listener.turns_ended(), 1);
    }
}
