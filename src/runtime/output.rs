// src/runtime/output.rs
//! Captured agent console output
//!
//! Everything an agent prints, and every `SYSTEM:` notice the host addresses
//! to it, lands here. Output past the console quota is silently dropped.

use crate::runtime::resource_limiter::QuotaTracker;
use parking_lot::Mutex;
use tracing::debug;

/// Prefix for host-generated notices in agent output
pub const SYSTEM_PREFIX: &str = "SYSTEM: ";

#[derive(Debug)]
pub struct AgentOutput {
    agent: String,
    buffer: Mutex<String>,
}

impl AgentOutput {
    pub fn new(agent: impl Into<String>) -> Self {
        Self {
            agent: agent.into(),
            buffer: Mutex::new(String::new()),
        }
    }

    /// Append one line, charged against the console quota
    pub fn println(&self, quota: &QuotaTracker, line: &str) {
        debug!(agent = %self.agent, "{}", line);

        let needed = line.len() + 1;
        let granted = quota.consume_console(needed);
        if granted == 0 {
            return;
        }

        let mut buffer = self.buffer.lock();
        if granted == needed {
            buffer.push_str(line);
            buffer.push('\n');
        } else {
            let mut cut = granted;
            while !line.is_char_boundary(cut) {
                cut -= 1;
            }
            buffer.push_str(&line[..cut]);
        }
    }

    /// Host notice, prefixed with `SYSTEM: `
    pub fn system(&self, quota: &QuotaTracker, message: &str) {
        self.println(quota, &format!("{}{}", SYSTEM_PREFIX, message));
    }

    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.buffer.lock().lines().map(str::to_string).collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.buffer.lock().contains(needle)
    }
}
