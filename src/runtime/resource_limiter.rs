// src/runtime/resource_limiter.rs
//! Resource limiting for agents
//!
//! Provides per-agent accounting for:
//! - Filesystem bytes written to the agent's writable directory
//! - Live threads (reservations are made by the thread group, counts are mirrored here)
//! - Captured console output
//!
//! Every agent owns its own tracker, so the lock below is never shared
//! between agents.

use crate::utils::config::SandboxSettings;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Resource limits for one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum live threads, primary thread included
    pub thread_cap: usize,

    /// Bytes the agent may keep in its writable directory
    pub byte_quota: u64,

    /// Console bytes captured before output is silently dropped
    pub console_quota: usize,

    /// Output handles that may be open at once
    pub max_open_files: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from(&SandboxSettings::default())
    }
}

impl From<&SandboxSettings> for ResourceLimits {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            thread_cap: settings.thread_cap,
            byte_quota: settings.byte_quota,
            console_quota: settings.console_quota,
            max_open_files: settings.max_open_files,
        }
    }
}

impl ResourceLimits {
    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if self.thread_cap == 0 {
            return Err("thread cap must allow the primary thread".to_string());
        }
        if self.max_open_files == 0 {
            return Err("max open files cannot be 0".to_string());
        }
        Ok(())
    }
}

/// What an agent may touch: directories plus numeric limits.
///
/// Absent directories mean the agent has no file access of that kind at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDomain {
    /// Root of the agent's own package; reads are confined here
    pub readable_dir: Option<PathBuf>,

    /// The agent's private data directory; writes are confined here
    pub writable_dir: Option<PathBuf>,

    pub limits: ResourceLimits,
}

impl PermissionDomain {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            readable_dir: None,
            writable_dir: None,
            limits,
        }
    }

    pub fn with_readable_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.readable_dir = Some(dir.into());
        self
    }

    pub fn with_writable_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.writable_dir = Some(dir.into());
        self
    }
}

/// Outcome of a byte charge against the quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaCheck {
    Granted,

    /// The write was refused. `first_notice` is set only for the first refusal
    /// since the usage was last (re)initialized.
    Exceeded { first_notice: bool },
}

/// Point-in-time usage, for reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QuotaUsage {
    pub bytes_used: u64,
    pub console_used: usize,
    pub live_threads: usize,
    pub peak_threads: usize,
    pub rejections: u32,
}

#[derive(Debug, Default)]
struct QuotaState {
    bytes_used: u64,
    quota_message_printed: bool,
    console_used: usize,
    live_threads: usize,
    peak_threads: usize,
    rejections: u32,
}

/// Per-agent quota accounting
#[derive(Debug)]
pub struct QuotaTracker {
    limits: ResourceLimits,
    state: Mutex<QuotaState>,
}

impl QuotaTracker {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(QuotaState::default()),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Seed usage from the bytes already present in the writable directory
    pub fn initialize_bytes(&self, used: u64) {
        let mut state = self.state.lock();
        state.bytes_used = used;
        state.quota_message_printed = false;
    }

    /// Charge `n` bytes. Check and update happen under one lock so concurrent
    /// writers from the same agent can never overshoot the quota.
    pub fn try_consume_bytes(&self, n: u64) -> QuotaCheck {
        let mut state = self.state.lock();
        match state.bytes_used.checked_add(n) {
            Some(total) if total <= self.limits.byte_quota => {
                state.bytes_used = total;
                QuotaCheck::Granted
            }
            _ => {
                state.rejections += 1;
                let first_notice = !state.quota_message_printed;
                state.quota_message_printed = true;
                QuotaCheck::Exceeded { first_notice }
            }
        }
    }

    /// Credit bytes back after a file is deleted or truncated
    pub fn release_bytes(&self, n: u64) {
        let mut state = self.state.lock();
        state.bytes_used = state.bytes_used.saturating_sub(n);
    }

    pub fn bytes_used(&self) -> u64 {
        self.state.lock().bytes_used
    }

    /// Charge console output; returns how many of the `n` bytes fit
    pub fn consume_console(&self, n: usize) -> usize {
        let mut state = self.state.lock();
        let room = self.limits.console_quota.saturating_sub(state.console_used);
        let granted = n.min(room);
        state.console_used += granted;
        granted
    }

    pub(crate) fn record_live_threads(&self, live: usize) {
        let mut state = self.state.lock();
        state.live_threads = live;
        state.peak_threads = state.peak_threads.max(live);
    }

    pub fn usage(&self) -> QuotaUsage {
        let state = self.state.lock();
        QuotaUsage {
            bytes_used: state.bytes_used,
            console_used: state.console_used,
            live_threads: state.live_threads,
            peak_threads: state.peak_threads,
            rejections: state.rejections,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(quota: u64) -> QuotaTracker {
        QuotaTracker::new(ResourceLimits {
            byte_quota: quota,
            ..ResourceLimits::default()
        })
    }

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.thread_cap, 5);
        assert_eq!(limits.byte_quota, 200_000);
        assert_eq!(limits.max_open_files, 5);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let invalid = ResourceLimits {
            thread_cap: 0,
            ..Default::default()
        };
        assert!(invalid.validate().is_err());
    }

    #[test]
    fn test_quota_exact_boundary() {
        let quota = tracker(200_000);
        assert_eq!(quota.try_consume_bytes(199_999), QuotaCheck::Granted);
        assert_eq!(quota.try_consume_bytes(1), QuotaCheck::Granted);
        assert_eq!(
            quota.try_consume_bytes(1),
            QuotaCheck::Exceeded { first_notice: true }
        );
        assert_eq!(quota.bytes_used(), 200_000);
    }

    #[test]
    fn test_quota_notice_only_once() {
        let quota = tracker(10);
        quota.initialize_bytes(9);
        assert_eq!(
            quota.try_consume_bytes(2),
            QuotaCheck::Exceeded { first_notice: true }
        );
        assert_eq!(
            quota.try_consume_bytes(2),
            QuotaCheck::Exceeded { first_notice: false }
        );
        assert_eq!(quota.usage().rejections, 2);
        // Usage unchanged by refused writes
        assert_eq!(quota.bytes_used(), 9);
    }

    #[test]
    fn test_release_bytes() {
        let quota = tracker(10);
        quota.initialize_bytes(10);
        quota.release_bytes(4);
        assert_eq!(quota.try_consume_bytes(4), QuotaCheck::Granted);
    }

    #[test]
    fn test_console_truncation() {
        let quota = QuotaTracker::new(ResourceLimits {
            console_quota: 8,
            ..ResourceLimits::default()
        });
        assert_eq!(quota.consume_console(5), 5);
        assert_eq!(quota.consume_console(5), 3);
        assert_eq!(quota.consume_console(5), 0);
    }

    #[test]
    fn test_peak_threads() {
        let quota = tracker(1);
        quota.record_live_threads(3);
        quota.record_live_threads(1);
        let usage = quota.usage();
        assert_eq!(usage.live_threads, 1);
        assert_eq!(usage.peak_threads, 3);
    }
}
