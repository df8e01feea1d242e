// src/battle/engine.rs
//! Battle driver
//!
//! Owns the world, the scoring observer and the listeners for one battle and
//! plays the configured number of rounds through a [`TurnScheduler`].

use crate::battle::calibration::{BudgetCalibrator, FixedBudget, MeasuredCalibrator};
use crate::battle::listener::{BattleInfo, BattleListener, Listeners};
use crate::battle::results::{AgentResult, BattleResults};
use crate::battle::scheduler::TurnScheduler;
use crate::battle::world::{NoScoring, Scoring, World};
use crate::runtime::host::SandboxHost;
use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use ulid::Ulid;

pub struct Battle {
    id: Ulid,
    host: Arc<SandboxHost>,
    world: Box<dyn World>,
    scoring: Box<dyn Scoring>,
    listeners: Listeners,
    calibrator: Box<dyn BudgetCalibrator>,
    abort: CancellationToken,
}

impl Battle {
    pub fn new(host: Arc<SandboxHost>, world: Box<dyn World>) -> Self {
        Self {
            id: Ulid::new(),
            host,
            world,
            scoring: Box::new(NoScoring),
            listeners: Listeners::new(),
            calibrator: Box::new(MeasuredCalibrator::default()),
            abort: CancellationToken::new(),
        }
    }

    pub fn with_scoring(mut self, scoring: Box<dyn Scoring>) -> Self {
        self.scoring = scoring;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn BattleListener>) -> Self {
        self.listeners.add(listener);
        self
    }

    pub fn with_calibrator(mut self, calibrator: Box<dyn BudgetCalibrator>) -> Self {
        self.calibrator = calibrator;
        self
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn host(&self) -> &Arc<SandboxHost> {
        &self.host
    }

    /// Cancelling this token aborts the battle at the next scheduling step
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Play every round. Must be called from the thread that owns the battle;
    /// that thread is trusted by the enforcer for the duration.
    #[instrument(skip(self), fields(battle_id = %self.id))]
    pub fn run(&mut self) -> Result<BattleResults> {
        let host = Arc::clone(&self.host);
        host.config().validate()?;

        let agents = host.schedulable();
        if agents.is_empty() {
            return Err(EngineError::ConfigError("no loadable agents to schedule".into()));
        }

        let budget = match host.config().scheduler.turn_budget_ms {
            Some(ms) => FixedBudget::from_millis(ms).calibrate(),
            None => self.calibrator.calibrate(),
        };
        let rounds = host.config().scheduler.rounds;

        let owner = thread::current().id();
        host.registry().mark_safe(owner);

        let info = BattleInfo {
            battle_id: self.id.to_string(),
            rounds,
            agents: agents.iter().map(|a| a.name().to_string()).collect(),
            turn_budget_us: budget.as_micros() as u64,
        };
        info!(rounds, agents = info.agents.len(), budget_us = info.turn_budget_us, "battle starting");
        self.listeners.battle_started(&info);

        let mut reports = Vec::with_capacity(rounds as usize);
        let mut aborted = false;
        {
            let mut scheduler = TurnScheduler::new(&host, budget, self.abort.clone(), &self.listeners);
            for round in 1..=rounds {
                let report = scheduler.run_round(round, round == rounds, self.world.as_mut(), self.scoring.as_mut());
                let ends_battle = report.outcome.ends_battle();
                aborted |= report.outcome.is_aborted();
                reports.push(report);
                if ends_battle {
                    warn!(round, "battle ended early");
                    break;
                }
            }
        }

        let results = BattleResults {
            battle_id: self.id.to_string(),
            aborted,
            rounds: reports,
            agents: host.identities().iter().map(|i| AgentResult::from(i.as_ref())).collect(),
            diagnostics: host.diagnostics().history(),
        };
        self.scoring.on_battle_completed(&results);

        if !aborted {
            self.listeners.battle_completed(&results);
        }
        self.listeners.battle_finished(aborted);
        host.registry().unmark_safe(owner);

        info!(aborted, rounds = results.rounds.len(), "battle finished");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentContext, Halt};
    use crate::battle::listener::{CollectingListener, Notification};
    use crate::battle::results::RoundOutcome;
    use crate::battle::snapshot::AgentView;
    use crate::battle::world::{Advance, CommandsByAgent};
    use crate::loader::AgentPackage;
    use crate::runtime::host::AgentControlPort;
    use crate::utils::config::EngineConfig;
    use serde_json::json;

    struct Idle;

    impl Agent for Idle {
        fn run(&mut self, ctx: &mut AgentContext) -> std::result::Result<(), Halt> {
            loop {
                ctx.execute()?;
            }
        }
    }

    struct ShortWorld;

    impl World for ShortWorld {
        fn start_round(&mut self, _round: u32, _agents: &[AgentView], _control: &dyn AgentControlPort) -> serde_json::Value {
            json!({})
        }

        fn advance(&mut self, turn: u64, _commands: &CommandsByAgent, _control: &dyn AgentControlPort) -> Advance {
            let advance = Advance::new(json!({ "turn": turn }));
            if turn >= 3 {
                advance.finished()
            } else {
                advance
            }
        }

        fn snapshot(&self) -> serde_json::Value {
            json!({})
        }
    }

    fn host(rounds: u32) -> Arc<SandboxHost> {
        let mut config = EngineConfig::default();
        config.scheduler.rounds = rounds;
        config.scheduler.turn_budget_ms = Some(20);
        Arc::new(SandboxHost::new(config))
    }

    #[test]
    fn test_battle_plays_all_rounds() {
        let host = host(3);
        host.admit(Arc::new(AgentPackage::builtin("sample.Idle", || Idle))).unwrap();

        let listener = Arc::new(CollectingListener::new());
        let mut battle = Battle::new(Arc::clone(&host), Box::new(ShortWorld)).with_listener(listener.clone());
        let results = battle.run().unwrap();

        assert!(!results.aborted);
        assert_eq!(results.rounds.len(), 3);
        assert!(results.rounds.iter().all(|r| r.outcome == RoundOutcome::Completed));
        assert_eq!(results.agent("sample.Idle").unwrap().stats.rounds_played, 3);

        let notifications = listener.notifications();
        assert!(matches!(notifications.first(), Some(Notification::BattleStarted { .. })));
        assert!(matches!(notifications.last(), Some(Notification::BattleFinished { aborted: false })));
    }

    #[test]
    fn test_battle_without_agents_is_rejected() {
        let mut battle = Battle::new(host(1), Box::new(ShortWorld));
        assert!(matches!(battle.run(), Err(EngineError::ConfigError(_))));
    }

    #[test]
    fn test_aborted_battle_skips_completion() {
        let host = host(5);
        host.admit(Arc::new(AgentPackage::builtin("sample.Idle", || Idle))).unwrap();

        let listener = Arc::new(CollectingListener::new());
        let mut battle = Battle::new(host, Box::new(ShortWorld)).with_listener(listener.clone());
        battle.abort_handle().cancel();
        let results = battle.run().unwrap();

        assert!(results.aborted);
        assert_eq!(results.rounds.len(), 1);
        assert_eq!(results.rounds[0].outcome, RoundOutcome::Cancelled);
        assert!(!listener
            .notifications()
            .iter()
            .any(|n| matches!(n, Notification::BattleCompleted { .. })));
    }
}
