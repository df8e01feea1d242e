// src/events/event.rs
//! Event records delivered to agents
//!
//! Lower priority numbers are more urgent. Critical kinds carry the lowest
//! numbers, cannot be filtered or re-prioritized by agents, and are always
//! delivered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Critical
    Disqualified,
    SkippedTurn,
    RoundEnded,
    BattleEnded,
    Death,
    Win,

    // Game
    HitByBullet,
    HitWall,
    HitRobot,
    BulletHit,
    BulletMissed,
    Message,
    Scanned,
    Status,

    /// World-defined event with its own name
    Custom(String),
}

impl EventKind {
    pub fn default_priority(&self) -> i32 {
        match self {
            EventKind::Disqualified => 0,
            EventKind::SkippedTurn => 1,
            EventKind::RoundEnded | EventKind::BattleEnded => 2,
            EventKind::Death => 3,
            EventKind::Win => 4,
            EventKind::HitByBullet => 20,
            EventKind::HitWall => 30,
            EventKind::HitRobot => 40,
            EventKind::BulletHit => 50,
            EventKind::BulletMissed => 60,
            EventKind::Message => 65,
            EventKind::Custom(_) => 70,
            EventKind::Scanned => 80,
            EventKind::Status => 90,
        }
    }

    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            EventKind::Disqualified
                | EventKind::SkippedTurn
                | EventKind::RoundEnded
                | EventKind::BattleEnded
                | EventKind::Death
                | EventKind::Win
        )
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::Disqualified => "disqualified",
            EventKind::SkippedTurn => "skipped_turn",
            EventKind::RoundEnded => "round_ended",
            EventKind::BattleEnded => "battle_ended",
            EventKind::Death => "death",
            EventKind::Win => "win",
            EventKind::HitByBullet => "hit_by_bullet",
            EventKind::HitWall => "hit_wall",
            EventKind::HitRobot => "hit_robot",
            EventKind::BulletHit => "bullet_hit",
            EventKind::BulletMissed => "bullet_missed",
            EventKind::Message => "message",
            EventKind::Scanned => "scanned",
            EventKind::Status => "status",
            EventKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An event, immutable once built
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    kind: EventKind,
    priority: i32,
    turn: u64,
    sequence: u64,
    data: serde_json::Value,
}

impl Event {
    /// Build an event with the kind's default priority.
    ///
    /// `sequence` must come from the host's sequence generator so that it is
    /// unique across all agents.
    pub fn new(kind: EventKind, turn: u64, sequence: u64, data: serde_json::Value) -> Self {
        Self {
            priority: kind.default_priority(),
            kind,
            turn,
            sequence,
            data,
        }
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn turn(&self) -> u64 {
        self.turn
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_critical(&self) -> bool {
        self.kind.is_critical()
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.data
    }

    /// Copy of this event with another priority; critical events keep theirs
    pub(crate) fn with_priority(&self, priority: i32) -> Self {
        let mut event = self.clone();
        if !event.is_critical() {
            event.priority = priority;
        }
        event
    }
}
