// src/battle/snapshot.rs
//! Turn snapshots and command buffers
//!
//! A [`TurnSnapshot`] is built once per turn and shared behind an `Arc`;
//! nothing can mutate it after publication. A [`CommandBuffer`] is filled by
//! exactly one agent thread and read once by the scheduler.

use crate::runtime::identity::AgentId;
use serde::{Deserialize, Serialize};

/// Per-agent status as seen by every agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentView {
    pub id: AgentId,
    pub name: String,
    pub energy: f64,
    pub alive: bool,
    pub disqualified: bool,
}

/// Immutable view of the world for one turn
#[derive(Debug, Clone, Serialize)]
pub struct TurnSnapshot {
    round: u32,
    turn: u64,
    world: serde_json::Value,
    agents: Vec<AgentView>,
}

impl TurnSnapshot {
    pub fn new(round: u32, turn: u64, world: serde_json::Value, agents: Vec<AgentView>) -> Self {
        Self {
            round,
            turn,
            world,
            agents,
        }
    }

    /// Snapshot handed to agents before the first turn of a round is published
    pub fn empty(round: u32) -> Self {
        Self::new(round, 0, serde_json::Value::Null, Vec::new())
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    /// World state, opaque to the engine
    pub fn world(&self) -> &serde_json::Value {
        &self.world
    }

    pub fn agents(&self) -> &[AgentView] {
        &self.agents
    }

    pub fn agent(&self, id: AgentId) -> Option<&AgentView> {
        self.agents.iter().find(|a| a.id == id)
    }
}

/// One command for the world module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub name: String,

    #[serde(default)]
    pub args: serde_json::Value,
}

/// Commands an agent computed for one turn
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommandBuffer {
    turn: u64,
    actions: Vec<Action>,
}

impl CommandBuffer {
    pub fn new(turn: u64) -> Self {
        Self {
            turn,
            actions: Vec::new(),
        }
    }

    /// Turn whose snapshot these commands were computed from
    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn push(&mut self, name: impl Into<String>, args: serde_json::Value) {
        self.actions.push(Action {
            name: name.into(),
            args,
        });
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub(crate) fn retag(mut self, turn: u64) -> Self {
        self.turn = turn;
        self
    }
}
