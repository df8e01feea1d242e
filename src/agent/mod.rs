// src/agent/mod.rs
//! Surface exposed to agent code
//!
//! - **Agent**: the agent's main loop, run on its primary thread
//! - **EventHandler**: receives dispatched events, most urgent first
//! - **AgentContext**: snapshot, command buffer and the yield point
//!   [`AgentContext::execute`]
//! - **HelperContext**: what self-spawned helper threads get
//!
//! Every sensitive call made through these types is checked by the
//! permission enforcer against the calling thread.
//!
//! # Control flow
//!
//! Agent code never sees host errors. The yield point returns
//! `Result<(), Halt>` and agents propagate it with `?`:
//!
//! ```text
//! run() ──► execute() ──► hand in commands ──► park ──► next turn
//!                                                         │
//!            Err(Halt::Stopped)      ◄── stop requested ──┤
//!            Err(Halt::Interrupted)  ◄── more urgent event (inside a handler)
//! ```

pub mod context;

pub use context::{launch, launch_with, AgentContext, AgentServices, DataFile, HelperContext};

use crate::events::event::Event;
use std::io;
use thiserror::Error;

/// Why agent code must give up control
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Halt {
    /// A strictly more urgent event is waiting; the running handler is abandoned
    #[error("interrupted by a priority {priority} event")]
    Interrupted { priority: i32 },

    /// The host asked the agent to stop
    #[error("stopped by the host")]
    Stopped,

    /// The agent can no longer act
    #[error("disabled: {0}")]
    Disabled(String),
}

/// A sensitive call the agent made was refused or failed
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("{0}")]
    Denied(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<AccessError> for Halt {
    fn from(err: AccessError) -> Self {
        Halt::Disabled(err.to_string())
    }
}

/// Agent code
pub trait Agent: Send {
    /// Main loop. Once it returns, the agent keeps yielding empty turns so
    /// its event handler still runs.
    fn run(&mut self, ctx: &mut AgentContext) -> Result<(), Halt>;

    /// Handler for dispatched events, taken once before `run`
    fn event_handler(&mut self) -> Option<Box<dyn EventHandler>> {
        None
    }
}

pub trait EventHandler: Send {
    fn on_event(&mut self, event: &Event, ctx: &mut AgentContext) -> Result<(), Halt>;
}

impl<F> EventHandler for F
where
    F: FnMut(&Event, &mut AgentContext) -> Result<(), Halt> + Send,
{
    fn on_event(&mut self, event: &Event, ctx: &mut AgentContext) -> Result<(), Halt> {
        self(event, ctx)
    }
}
