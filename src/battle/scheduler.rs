// src/battle/scheduler.rs
//! Turn scheduler
//!
//! Runs one round as a state machine:
//!
//! ```text
//! Idle → RoundStarting → ┌ PublishSnapshot → AwaitCommands → ApplyCommands ┐ → RoundEnding
//!                        └──────────────────── next turn ◄───────────────────┘
//!                                                            ↓
//!                                          RoundCompleted | RoundAborted
//! ```
//!
//! - Snapshot T is published to every agent before any agent may read it,
//!   in a seeded random wake order
//! - Every agent gets the same deadline per turn; missing it is a skipped
//!   turn, and too many consecutive skips disqualify the agent
//! - Commands for T are all collected before the world computes T+1
//! - Threads are polled once per turn; a thread that outlives its stop
//!   request by the grace period is forcibly stopped and the round aborted

use crate::agent::launch_with;
use crate::battle::listener::BattleListener;
use crate::battle::results::{AgentRoundResult, RoundOutcome, RoundReport};
use crate::battle::snapshot::{AgentView, TurnSnapshot};
use crate::battle::world::{CommandsByAgent, Scoring, World};
use crate::events::event::EventKind;
use crate::observability::metrics;
use crate::runtime::agent_runtime::AgentRuntime;
use crate::runtime::diagnostics::{Diagnostic, DiagnosticKind};
use crate::runtime::host::{AgentControlPort, SandboxHost};
use crate::runtime::thread_manager::{panic_message, Liveness};
use crate::utils::config::SchedulerSettings;
use crate::utils::errors::{EngineError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::json;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Idle,
    RoundStarting,
    PublishSnapshot,
    AwaitCommands,
    ApplyCommands,
    RoundEnding,
    RoundCompleted,
    RoundAborted,
}

struct Participant {
    runtime: Arc<AgentRuntime>,

    /// A still-running-after-stop warning was already raised
    stop_warned: bool,
}

/// Drives rounds for one battle
pub struct TurnScheduler<'a> {
    host: &'a SandboxHost,
    settings: SchedulerSettings,
    budget: Duration,
    abort: CancellationToken,
    listener: &'a dyn BattleListener,
    rng: StdRng,
    phase: RoundPhase,
}

impl<'a> TurnScheduler<'a> {
    pub fn new(
        host: &'a SandboxHost,
        budget: Duration,
        abort: CancellationToken,
        listener: &'a dyn BattleListener,
    ) -> Self {
        let settings = host.config().scheduler.clone();
        Self {
            rng: StdRng::seed_from_u64(settings.seed),
            host,
            settings,
            budget,
            abort,
            listener,
            phase: RoundPhase::Idle,
        }
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Play one round to its end
    pub fn run_round(
        &mut self,
        round: u32,
        final_round: bool,
        world: &mut dyn World,
        scoring: &mut dyn Scoring,
    ) -> RoundReport {
        self.phase = RoundPhase::RoundStarting;
        info!(round, "starting round");

        let mut participants = match self.start_agents(round) {
            Ok(participants) => participants,
            Err(err) => {
                let reason = err.to_string();
                self.fault(&reason, 0);
                self.phase = RoundPhase::RoundAborted;
                self.forward_diagnostics();
                let report = RoundReport {
                    round,
                    turns: 0,
                    outcome: RoundOutcome::Faulted { reason },
                    agents: Vec::new(),
                };
                self.listener.round_ended(&report);
                return report;
            }
        };

        let host = self.host;
        let control: &dyn AgentControlPort = &**host.registry();
        let views = views(&participants);
        let (mut turn, outcome, snapshot) =
            match guarded(|| world.start_round(round, &views, control)) {
                Ok(initial) => {
                    let snapshot = Arc::new(TurnSnapshot::new(round, 1, initial, views));
                    self.listener.round_started(round, &snapshot);
                    self.turn_loop(round, &mut participants, world, scoring, snapshot)
                }
                Err(reason) => {
                    let reason = format!("world failed to start round {}: {}", round, reason);
                    self.fault(&reason, 0);
                    let snapshot = Arc::new(TurnSnapshot::new(round, 0, world.snapshot(), views));
                    (0, RoundOutcome::Faulted { reason }, snapshot)
                }
            };

        if outcome == RoundOutcome::Cancelled {
            let err = EngineError::RoundAborted(format!("round {} cancelled on turn {}", round, turn));
            warn!(round, turn, "round cancelled");
            self.host
                .diagnostics()
                .sink()
                .emit(Diagnostic::from_error(&err, None).at_turn(turn));
        }

        self.phase = RoundPhase::RoundEnding;
        if !outcome.is_aborted() {
            self.farewell(&participants, turn, &snapshot, final_round);
            turn = turn.max(1);
        }
        let agents = self.teardown(&participants, turn);

        scoring.on_round_ended(round, &snapshot);
        self.forward_diagnostics();

        self.phase = if outcome.is_aborted() {
            RoundPhase::RoundAborted
        } else {
            RoundPhase::RoundCompleted
        };
        info!(round, turns = turn, outcome = ?outcome, "round over");

        let report = RoundReport {
            round,
            turns: turn,
            outcome,
            agents,
        };
        self.listener.round_ended(&report);
        report
    }

    fn start_agents(&self, round: u32) -> Result<Vec<Participant>> {
        let mut participants: Vec<Participant> = Vec::new();
        for identity in self.host.schedulable() {
            let runtime = self.host.create_context(&identity, round);
            let started = self
                .host
                .loaded(identity.id())
                .ok_or_else(|| {
                    EngineError::InternalFault(format!("{} was admitted but never loaded", identity.name()))
                })
                .and_then(|loaded| launch_with(self.host, &runtime, move || loaded.instantiate()));

            if let Err(err) = started {
                self.host.registry().release_context(&runtime);
                for participant in &participants {
                    self.host.lifecycle().teardown(&participant.runtime, 0);
                }
                return Err(err);
            }
            participants.push(Participant {
                runtime,
                stop_warned: false,
            });
        }
        Ok(participants)
    }

    /// Returns the last turn played, the outcome and the last snapshot
    fn turn_loop(
        &mut self,
        round: u32,
        participants: &mut [Participant],
        world: &mut dyn World,
        scoring: &mut dyn Scoring,
        mut snapshot: Arc<TurnSnapshot>,
    ) -> (u64, RoundOutcome, Arc<TurnSnapshot>) {
        let host = self.host;
        let control: &dyn AgentControlPort = &**host.registry();
        let mut turn = 0u64;

        let outcome = loop {
            if self.abort.is_cancelled() {
                break RoundOutcome::Cancelled;
            }
            if turn >= self.settings.max_turns_per_round {
                break RoundOutcome::TurnLimit;
            }
            if !participants.iter().any(|p| p.runtime.is_schedulable()) {
                break RoundOutcome::Deserted;
            }
            turn += 1;

            self.phase = RoundPhase::PublishSnapshot;
            let order = self.wake_order(participants);
            for &i in &order {
                participants[i].runtime.gate().publish(turn, Arc::clone(&snapshot));
            }

            self.phase = RoundPhase::AwaitCommands;
            let commands = self.collect(participants, &order, turn);
            if self.abort.is_cancelled() {
                break RoundOutcome::Cancelled;
            }

            self.phase = RoundPhase::ApplyCommands;
            let advance = match guarded(|| world.advance(turn, &commands, control)) {
                Ok(advance) => advance,
                Err(reason) => {
                    let reason = format!("world failed on turn {}: {}", turn, reason);
                    self.fault(&reason, turn);
                    break RoundOutcome::Faulted { reason };
                }
            };
            for event in advance.events {
                match participants.iter().find(|p| p.runtime.id() == event.agent) {
                    Some(p) => self.host.deliver(&p.runtime, event.kind, turn, event.data),
                    None => debug!(agent = %event.agent, "dropping event for unknown agent"),
                }
            }
            metrics::record_turn();

            snapshot = Arc::new(TurnSnapshot::new(round, turn + 1, advance.world, views(participants)));
            self.listener.turn_ended(&snapshot);
            scoring.on_turn_ended(&snapshot);

            let undead = self.check_liveness(participants, turn);
            self.forward_diagnostics();
            if let Some(agent) = undead {
                break RoundOutcome::Undead { agent };
            }
            if advance.finished {
                break RoundOutcome::Completed;
            }
        };
        (turn, outcome, snapshot)
    }

    fn wake_order(&mut self, participants: &[Participant]) -> Vec<usize> {
        let mut order: Vec<usize> = participants
            .iter()
            .enumerate()
            .filter(|(_, p)| p.runtime.is_schedulable())
            .map(|(i, _)| i)
            .collect();
        order.shuffle(&mut self.rng);
        order
    }

    fn turn_budget(&self, turn: u64) -> Duration {
        if turn == 1 {
            self.budget * self.settings.first_turn_multiplier.max(1)
        } else {
            self.budget
        }
    }

    fn collect(&self, participants: &[Participant], order: &[usize], turn: u64) -> CommandsByAgent {
        let deadline = Instant::now() + self.turn_budget(turn);
        let mut commands = CommandsByAgent::new();
        for &i in order {
            let runtime = &participants[i].runtime;
            if runtime.gate().wait_parked(turn, deadline, &self.abort) {
                if let Some(buffer) = runtime.gate().take_submission(turn) {
                    runtime.reset_skips();
                    commands.insert(runtime.id(), buffer);
                    continue;
                }
            }
            if self.abort.is_cancelled() {
                break;
            }
            if runtime.is_schedulable() {
                self.skipped(runtime, turn);
            }
        }
        commands
    }

    fn skipped(&self, runtime: &AgentRuntime, turn: u64) {
        let name = runtime.name();
        let consecutive = runtime.record_skip();
        metrics::record_skipped_turn(name);

        if consecutive > self.settings.max_skipped_turns {
            runtime.system(&format!(
                "{} has not performed any actions in a reasonable amount of time.",
                name
            ));
            runtime.system("No score will be generated.");
            runtime.disqualify();
            self.host
                .deliver(runtime, EventKind::Disqualified, turn, json!({ "reason": "inactivity" }));
            runtime.request_stop(turn);

            let err = EngineError::Inactivity {
                agent: name.to_string(),
                skipped: consecutive,
            };
            error!(agent = %name, turn, skipped = consecutive, "disqualified for inactivity");
            runtime
                .diagnostics()
                .emit(Diagnostic::from_error(&err, Some(name)).at_turn(turn));
        } else {
            runtime.system(&format!("{} skipped turn {}", name, turn));
            self.host
                .deliver(runtime, EventKind::SkippedTurn, turn, json!({ "turn": turn }));
            debug!(agent = %name, turn, consecutive, "skipped turn");
            runtime.diagnostics().emit(
                Diagnostic::new(
                    DiagnosticKind::SkippedTurn,
                    Some(name),
                    format!("{} skipped turn {}", name, turn),
                )
                .at_turn(turn),
            );
        }
    }

    /// Stop eliminated agents and escalate threads that ignore their stop
    /// request. Returns the agent whose threads had to be forcibly stopped.
    fn check_liveness(&self, participants: &mut [Participant], turn: u64) -> Option<String> {
        let lifecycle = self.host.lifecycle();
        for participant in participants.iter_mut() {
            let runtime = &participant.runtime;
            if !runtime.is_alive() && !runtime.stop_requested() {
                debug!(agent = %runtime.name(), turn, "agent eliminated, stopping it");
                runtime.request_stop(turn);
            }

            match lifecycle.poll_liveness(runtime, turn) {
                Liveness::Undead { threads } if !runtime.status().forced_stop => {
                    lifecycle.force_stop(runtime);
                    let err = EngineError::UndeadThread {
                        agent: runtime.name().to_string(),
                        thread: threads.join(", "),
                    };
                    error!(agent = %runtime.name(), turn, threads = ?threads, "undead threads, aborting round");
                    runtime
                        .diagnostics()
                        .emit(Diagnostic::from_error(&err, Some(runtime.name())).at_turn(turn));
                    return Some(runtime.name().to_string());
                }
                Liveness::Stopping { turns } if turns >= 1 && !participant.stop_warned => {
                    participant.stop_warned = true;
                    warn!(agent = %runtime.name(), turns, "agent still running after stop request");
                    runtime.diagnostics().emit(
                        Diagnostic::new(
                            DiagnosticKind::UndeadThread,
                            Some(runtime.name()),
                            format!("{} is still running after being asked to stop", runtime.name()),
                        )
                        .at_turn(turn),
                    );
                }
                _ => {}
            }
        }
        None
    }

    /// Let live agents see the end of the round before they are stopped
    fn farewell(&self, participants: &[Participant], turn: u64, snapshot: &Arc<TurnSnapshot>, final_round: bool) {
        let live: Vec<&Arc<AgentRuntime>> = participants
            .iter()
            .map(|p| &p.runtime)
            .filter(|rt| rt.is_schedulable())
            .collect();
        if live.is_empty() {
            return;
        }

        let last = turn + 1;
        for runtime in &live {
            self.host
                .deliver(runtime, EventKind::RoundEnded, turn, json!({ "round": runtime.round() }));
            if final_round {
                self.host.deliver(runtime, EventKind::BattleEnded, turn, json!({}));
            }
            runtime.gate().publish(last, Arc::clone(snapshot));
        }
        let deadline = Instant::now() + self.budget;
        for runtime in &live {
            if runtime.gate().wait_parked(last, deadline, &self.abort) {
                runtime.gate().take_submission(last);
            }
        }
    }

    fn teardown(&self, participants: &[Participant], turn: u64) -> Vec<AgentRoundResult> {
        let lifecycle = self.host.lifecycle();
        let mut results = Vec::with_capacity(participants.len());
        for participant in participants {
            let runtime = &participant.runtime;
            let abandoned = lifecycle.teardown(runtime, turn);
            if !abandoned.is_empty() {
                warn!(agent = %runtime.name(), threads = ?abandoned, "abandoned threads at round end");
            }

            let inbox = runtime.inbox().stats();
            if inbox.drop_count > 0 {
                warn!(
                    agent = %runtime.name(),
                    dropped = inbox.drop_count,
                    drop_rate = inbox.drop_rate(),
                    "events dropped on a full inbox"
                );
            }

            let status = runtime.status();
            let violations = runtime.violation_count();
            runtime.identity().update_stats(|stats| {
                stats.rounds_played += 1;
                stats.skipped_turns += status.skipped_turns;
                stats.violations += violations as u32;
                if status.disqualified {
                    stats.disqualifications += 1;
                }
                if status.forced_stop {
                    stats.forced_stops += 1;
                }
                stats.last_energy = status.energy;
            });

            results.push(AgentRoundResult {
                id: runtime.id(),
                name: runtime.name().to_string(),
                final_energy: status.energy,
                skipped_turns: status.skipped_turns,
                violations,
                disqualified: status.disqualified,
                forced_stop: status.forced_stop,
                output: runtime.output().lines(),
            });
        }
        results
    }

    fn fault(&self, reason: &str, turn: u64) {
        error!(turn, "internal fault: {}", reason);
        let err = EngineError::InternalFault(reason.to_string());
        self.host
            .diagnostics()
            .sink()
            .emit(Diagnostic::from_error(&err, None).at_turn(turn));
    }

    fn forward_diagnostics(&self) {
        for diagnostic in self.host.diagnostics().drain() {
            self.listener.battle_error(&diagnostic.message, diagnostic.fatal);
        }
    }
}

fn views(participants: &[Participant]) -> Vec<AgentView> {
    participants.iter().map(|p| p.runtime.view()).collect()
}

/// Run a world call, turning a panic into an error message
fn guarded<T>(f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}
