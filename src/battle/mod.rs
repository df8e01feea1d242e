// src/battle/mod.rs
//! Battle orchestration
//!
//! - **Scheduler**: the per-round turn loop and its state machine
//! - **Engine**: plays the configured rounds and reports results
//! - **World**: the simulation the scheduler drives, plus the scoring
//!   observer
//! - **Calibration**: the per-turn computation budget
//! - **Listener**: lifecycle notifications for the host or UI
//!
//! # Turn flow
//!
//! ```text
//! publish snapshot T ──► agents wake (random order) ──► compute ──► park
//!                                                                     │
//! snapshot T+1 ◄── World::advance(T, commands) ◄── deadline / all parked
//!       │
//!       └──► events delivered, liveness polled, listeners notified
//! ```

pub mod calibration;
pub mod engine;
pub mod listener;
pub mod results;
pub mod scheduler;
pub mod snapshot;
pub mod world;

pub use calibration::{BudgetCalibrator, FixedBudget, MeasuredCalibrator};
pub use engine::Battle;
pub use listener::{BattleInfo, BattleListener, CollectingListener, Listeners, LoggingListener, Notification};
pub use results::{AgentResult, AgentRoundResult, BattleResults, RoundOutcome, RoundReport};
pub use scheduler::{RoundPhase, TurnScheduler};
pub use snapshot::{Action, AgentView, CommandBuffer, TurnSnapshot};
pub use world::{Advance, CommandsByAgent, NoScoring, Scoring, World, WorldEvent};
