// src/battle/world.rs
//! Collaborators the scheduler drives but does not implement
//!
//! - **World**: turns collected commands into the next world state
//! - **Scoring**: observes turns, rounds and the battle; never consulted by
//!   the engine
//!
//! Both act on agents only through [`AgentControlPort`].

use crate::battle::results::BattleResults;
use crate::battle::snapshot::{AgentView, CommandBuffer, TurnSnapshot};
use crate::events::event::EventKind;
use crate::runtime::host::AgentControlPort;
use crate::runtime::identity::AgentId;
use std::collections::BTreeMap;

/// Commands collected in one turn, by agent
pub type CommandsByAgent = BTreeMap<AgentId, CommandBuffer>;

/// An event the world wants delivered to one agent
#[derive(Debug, Clone)]
pub struct WorldEvent {
    pub agent: AgentId,
    pub kind: EventKind,
    pub data: serde_json::Value,
}

impl WorldEvent {
    pub fn new(agent: AgentId, kind: EventKind, data: serde_json::Value) -> Self {
        Self { agent, kind, data }
    }
}

/// Result of applying one turn of commands
#[derive(Debug, Clone)]
pub struct Advance {
    /// World state for the next snapshot
    pub world: serde_json::Value,

    /// Delivered at the start of the next turn
    pub events: Vec<WorldEvent>,

    /// Terminal world condition reached
    pub finished: bool,
}

impl Advance {
    pub fn new(world: serde_json::Value) -> Self {
        Self {
            world,
            events: Vec::new(),
            finished: false,
        }
    }

    pub fn with_event(mut self, event: WorldEvent) -> Self {
        self.events.push(event);
        self
    }

    pub fn finished(mut self) -> Self {
        self.finished = true;
        self
    }
}

pub trait World: Send {
    /// Reset for a new round; returns the world state of turn 1
    fn start_round(
        &mut self,
        round: u32,
        agents: &[AgentView],
        control: &dyn AgentControlPort,
    ) -> serde_json::Value;

    /// Apply every command collected for `turn` at once
    fn advance(
        &mut self,
        turn: u64,
        commands: &CommandsByAgent,
        control: &dyn AgentControlPort,
    ) -> Advance;

    /// Current world state
    fn snapshot(&self) -> serde_json::Value;
}

/// Score keeping. Every callback defaults to doing nothing.
pub trait Scoring: Send {
    fn on_turn_ended(&mut self, _snapshot: &TurnSnapshot) {}

    fn on_round_ended(&mut self, _round: u32, _snapshot: &TurnSnapshot) {}

    fn on_battle_completed(&mut self, _results: &BattleResults) {}
}

/// Scoring that keeps no score
#[derive(Debug, Default)]
pub struct NoScoring;

impl Scoring for NoScoring {}
