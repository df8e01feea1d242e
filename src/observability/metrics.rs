// src/observability/metrics.rs
//! Metric names and recording helpers

use ::metrics::{counter, gauge};

pub const TURNS_TOTAL: &str = "arena_turns_total";
pub const PERMISSION_DENIALS_TOTAL: &str = "arena_permission_denials_total";
pub const SKIPPED_TURNS_TOTAL: &str = "arena_skipped_turns_total";
pub const QUOTA_REJECTIONS_TOTAL: &str = "arena_quota_rejections_total";
pub const FORCED_STOPS_TOTAL: &str = "arena_forced_stops_total";
pub const LIVE_THREADS: &str = "arena_live_threads";
pub const EVENTS_DISPATCHED_TOTAL: &str = "arena_events_dispatched_total";
pub const EVENTS_INTERRUPTED_TOTAL: &str = "arena_events_interrupted_total";

pub fn record_turn() {
    counter!(TURNS_TOTAL).increment(1);
}

pub fn record_denial(agent: &str) {
    counter!(PERMISSION_DENIALS_TOTAL, "agent" => agent.to_string()).increment(1);
}

pub fn record_skipped_turn(agent: &str) {
    counter!(SKIPPED_TURNS_TOTAL, "agent" => agent.to_string()).increment(1);
}

pub fn record_quota_rejection(agent: &str) {
    counter!(QUOTA_REJECTIONS_TOTAL, "agent" => agent.to_string()).increment(1);
}

pub fn record_forced_stop() {
    counter!(FORCED_STOPS_TOTAL).increment(1);
}

pub fn record_live_threads(agent: &str, live: usize) {
    gauge!(LIVE_THREADS, "agent" => agent.to_string()).set(live as f64);
}

pub fn record_dispatch() {
    counter!(EVENTS_DISPATCHED_TOTAL).increment(1);
}

pub fn record_interruption() {
    counter!(EVENTS_INTERRUPTED_TOTAL).increment(1);
}
