// src/events/dispatcher.rs
//! Per-agent event dispatcher
//!
//! Owned by the agent's primary thread, so none of this needs locking. The
//! dispatcher only keeps state; the agent context drives it:
//!
//! 1. [`EventDispatcher::admit`] every event drained from the inbox
//! 2. [`EventDispatcher::next`] hands out events by (priority, sequence)
//! 3. [`EventDispatcher::begin`] / [`EventDispatcher::finish`] bracket a handler
//! 4. [`EventDispatcher::should_interrupt`] is asked at every yield point
//!    reached from inside a handler

use crate::events::event::{Event, EventKind};
use std::collections::{HashMap, HashSet};
use tracing::trace;

/// Non-critical events older than this many turns are discarded unread
pub const MAX_EVENT_AGE: u64 = 2;

/// Outcome of offering an event to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,

    /// Already dispatched or already pending
    Duplicate,

    /// The agent ignores this kind
    Ignored,

    /// Pending queue is at capacity
    Overflow,
}

#[derive(Debug, Clone, Copy)]
struct ActiveHandler {
    priority: i32,
}

#[derive(Debug)]
pub struct EventDispatcher {
    pending: Vec<Event>,
    dispatched: HashSet<u64>,
    priorities: HashMap<EventKind, i32>,
    ignored: HashSet<EventKind>,
    active: Option<ActiveHandler>,
    interrupt_requested: bool,
    capacity: usize,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: Vec::new(),
            dispatched: HashSet::new(),
            priorities: HashMap::new(),
            ignored: HashSet::new(),
            active: None,
            interrupt_requested: false,
            capacity,
        }
    }

    /// Override the priority of a non-critical kind
    pub fn set_priority(&mut self, kind: EventKind, priority: i32) -> Result<(), String> {
        if kind.is_critical() {
            return Err(format!(
                "You may not change the priority of the critical event {}.",
                kind
            ));
        }
        self.priorities.insert(kind, priority);
        Ok(())
    }

    /// Stop receiving a non-critical kind
    pub fn ignore(&mut self, kind: EventKind) -> Result<(), String> {
        if kind.is_critical() {
            return Err(format!("You may not ignore the critical event {}.", kind));
        }
        self.ignored.insert(kind);
        Ok(())
    }

    pub fn priority_of(&self, kind: &EventKind) -> i32 {
        if kind.is_critical() {
            return kind.default_priority();
        }
        self.priorities
            .get(kind)
            .copied()
            .unwrap_or_else(|| kind.default_priority())
    }

    pub fn admit(&mut self, event: Event) -> Admission {
        let sequence = event.sequence();
        if self.dispatched.contains(&sequence)
            || self.pending.iter().any(|e| e.sequence() == sequence)
        {
            return Admission::Duplicate;
        }

        if !event.is_critical() {
            if self.ignored.contains(event.kind()) {
                return Admission::Ignored;
            }
            if self.pending.len() >= self.capacity {
                return Admission::Overflow;
            }
        }

        let priority = self.priority_of(event.kind());
        let event = if priority == event.priority() {
            event
        } else {
            event.with_priority(priority)
        };
        trace!(kind = %event.kind(), priority, sequence, "event queued");
        self.pending.push(event);
        Admission::Queued
    }

    /// Drop non-critical events that have gone stale; returns how many were dropped
    pub fn discard_stale(&mut self, current_turn: u64) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|e| e.is_critical() || e.turn() + MAX_EVENT_AGE >= current_turn);
        before - self.pending.len()
    }

    /// Most urgent pending event, marked as dispatched
    pub fn next(&mut self) -> Option<Event> {
        let index = self
            .pending
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| (e.priority(), e.sequence()))
            .map(|(i, _)| i)?;
        let event = self.pending.remove(index);
        self.dispatched.insert(event.sequence());
        Some(event)
    }

    /// A handler for `event` is about to run
    pub fn begin(&mut self, event: &Event) {
        self.active = Some(ActiveHandler {
            priority: event.priority(),
        });
        self.interrupt_requested = false;
    }

    /// The current handler returned or was abandoned
    pub fn finish(&mut self) {
        self.active = None;
        self.interrupt_requested = false;
    }

    pub fn is_dispatching(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_priority(&self) -> Option<i32> {
        self.active.map(|a| a.priority)
    }

    /// Whether the running handler must give way to a strictly more urgent
    /// pending event. Once requested, the interruption stays requested until
    /// the handler finishes.
    pub fn should_interrupt(&mut self) -> bool {
        let Some(active) = self.active else {
            return false;
        };
        if !self.interrupt_requested {
            self.interrupt_requested = self.pending.iter().any(|e| e.priority() < active.priority);
        }
        self.interrupt_requested
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn was_dispatched(&self, sequence: u64) -> bool {
        self.dispatched.contains(&sequence)
    }
}
