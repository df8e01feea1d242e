// src/events/mod.rs
//! Event delivery to agents
//!
//! Events flow host → agent in two stages:
//! - **Inbox**: bounded lock-free queue the scheduler thread pushes into
//! - **Dispatcher**: agent-side priority queue with interruption state,
//!   owned by the agent's primary thread
//!
//! Every event carries a host-wide sequence number, which is both the
//! tie-breaker for equal priorities and the de-duplication key.

pub mod dispatcher;
pub mod event;
pub mod inbox;

pub use dispatcher::{Admission, EventDispatcher, MAX_EVENT_AGE};
pub use event::{Event, EventKind};
pub use inbox::{EventInbox, InboxStats};
