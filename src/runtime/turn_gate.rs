// src/runtime/turn_gate.rs
//! Turn barrier between the scheduler and one agent's primary thread
//!
//! The turn number and its snapshot are published together under the gate
//! lock, so an agent can never pair turn T with snapshot T+1. The agent
//! hands in its command buffer and parks in the same critical section.
//!
//! Waits are sliced (a few milliseconds each) so that cancellation tokens,
//! which have no condvar of their own, are observed promptly.

use crate::agent::Halt;
use crate::battle::snapshot::{CommandBuffer, TurnSnapshot};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

const AGENT_WAIT_SLICE: Duration = Duration::from_millis(10);
const HOST_WAIT_SLICE: Duration = Duration::from_millis(5);

#[derive(Debug)]
struct GateState {
    published: u64,
    snapshot: Arc<TurnSnapshot>,
    parked_for: u64,
    submission: Option<CommandBuffer>,
    halted: bool,
}

#[derive(Debug)]
pub struct TurnGate {
    state: Mutex<GateState>,
    /// Signalled when the agent parks
    host_cv: Condvar,
    /// Signalled when a turn is published or the gate halts
    agent_cv: Condvar,
}

impl TurnGate {
    pub fn new(initial: Arc<TurnSnapshot>) -> Self {
        Self {
            state: Mutex::new(GateState {
                published: 0,
                snapshot: initial,
                parked_for: 0,
                submission: None,
                halted: false,
            }),
            host_cv: Condvar::new(),
            agent_cv: Condvar::new(),
        }
    }

    // Host side

    /// Publish turn `turn` and wake the agent
    pub fn publish(&self, turn: u64, snapshot: Arc<TurnSnapshot>) {
        let mut state = self.state.lock();
        state.published = turn;
        state.snapshot = snapshot;
        self.agent_cv.notify_all();
    }

    /// Wait until the agent has parked with its buffer for `turn`.
    ///
    /// Returns `false` on deadline, on abort or when the gate was halted.
    pub fn wait_parked(&self, turn: u64, deadline: Instant, abort: &CancellationToken) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.parked_for >= turn {
                return true;
            }
            if state.halted || abort.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(HOST_WAIT_SLICE);
            self.host_cv.wait_for(&mut state, slice);
        }
    }

    /// Take the buffer computed for `turn`. A buffer tagged with another turn
    /// arrived late and is discarded.
    pub fn take_submission(&self, turn: u64) -> Option<CommandBuffer> {
        let mut state = self.state.lock();
        match state.submission.take() {
            Some(buffer) if buffer.turn() == turn => Some(buffer),
            Some(stale) => {
                trace!(expected = turn, got = stale.turn(), "discarding stale command buffer");
                None
            }
            None => None,
        }
    }

    /// Release the agent permanently; every later yield returns `Halt::Stopped`
    pub fn halt(&self) {
        let mut state = self.state.lock();
        state.halted = true;
        self.agent_cv.notify_all();
        self.host_cv.notify_all();
    }

    pub fn is_halted(&self) -> bool {
        self.state.lock().halted
    }

    // Agent side

    /// Hand in `buffer` (computed for turn `consumed`) and park until a newer
    /// turn is published.
    pub fn yield_turn(
        &self,
        buffer: CommandBuffer,
        consumed: u64,
        stop: &CancellationToken,
    ) -> Result<(u64, Arc<TurnSnapshot>), Halt> {
        let mut state = self.state.lock();
        if state.halted || stop.is_cancelled() {
            return Err(Halt::Stopped);
        }

        state.submission = Some(buffer.retag(consumed));
        state.parked_for = consumed;
        self.host_cv.notify_all();

        loop {
            if state.halted || stop.is_cancelled() {
                return Err(Halt::Stopped);
            }
            if state.published > consumed {
                return Ok((state.published, Arc::clone(&state.snapshot)));
            }
            self.agent_cv.wait_for(&mut state, AGENT_WAIT_SLICE);
        }
    }
}
