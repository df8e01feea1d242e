// src/battle/calibration.rs
//! Per-turn computation budget
//!
//! The budget is measured on the host rather than configured, so the same
//! agents behave the same on slow and fast machines. A configured value
//! (`scheduler.turn_budget_ms`) replaces the measurement.

use std::hint::black_box;
use std::time::{Duration, Instant};
use tracing::debug;

pub trait BudgetCalibrator: Send + Sync {
    fn calibrate(&self) -> Duration;
}

/// A budget fixed up front
#[derive(Debug, Clone, Copy)]
pub struct FixedBudget(pub Duration);

impl FixedBudget {
    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }
}

impl BudgetCalibrator for FixedBudget {
    fn calibrate(&self) -> Duration {
        self.0
    }
}

/// Times a fixed floating point workload and scales the fastest sample
#[derive(Debug, Clone)]
pub struct MeasuredCalibrator {
    /// Operations per sample
    pub iterations: u32,

    pub samples: u32,

    /// Budget per measured workload
    pub factor: u32,

    pub floor: Duration,

    pub ceiling: Duration,
}

impl Default for MeasuredCalibrator {
    fn default() -> Self {
        Self {
            iterations: 50_000,
            samples: 5,
            factor: 6,
            floor: Duration::from_millis(1),
            ceiling: Duration::from_millis(100),
        }
    }
}

impl MeasuredCalibrator {
    fn workload(&self) -> Duration {
        let start = Instant::now();
        let mut acc = 0.0f64;
        for i in 0..self.iterations {
            let x = f64::from(i) * 0.001;
            acc += (x.sin() * x.cos()).atan2(1.0 + x.sqrt());
        }
        black_box(acc);
        start.elapsed()
    }
}

impl BudgetCalibrator for MeasuredCalibrator {
    fn calibrate(&self) -> Duration {
        let fastest = (0..self.samples.max(1))
            .map(|_| self.workload())
            .min()
            .unwrap_or(self.floor);
        let budget = (fastest * self.factor).clamp(self.floor, self.ceiling);
        debug!(sample_us = fastest.as_micros() as u64, budget_us = budget.as_micros() as u64, "calibrated turn budget");
        budget
    }
}
