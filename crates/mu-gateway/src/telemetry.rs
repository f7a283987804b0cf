//! Control-plane telemetry: reload and signal counters plus a non-blocking
//! gate evaluator the status surface reports through.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Telemetry {
    pub reload_success_total: AtomicU64,
    pub reload_failure_total: AtomicU64,
    pub reload_drain_duration_ms_total: AtomicU64,
    pub duplicate_signal_total: AtomicU64,
    pub drop_signal_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySnapshot {
    pub reload_success_total: u64,
    pub reload_failure_total: u64,
    pub reload_drain_duration_ms_total: u64,
    pub duplicate_signal_total: u64,
    pub drop_signal_total: u64,
}

/// Thresholds the gate compares against. Zero means "any is unhealthy".
#[derive(Debug, Clone)]
pub struct GateThresholds {
    pub max_reload_failures: u64,
    pub max_drop_signals: u64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            max_reload_failures: 3,
            max_drop_signals: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub healthy: bool,
    pub reasons: Vec<String>,
    pub counters: TelemetrySnapshot,
}

impl Telemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            reload_success_total: self.reload_success_total.load(Ordering::Relaxed),
            reload_failure_total: self.reload_failure_total.load(Ordering::Relaxed),
            reload_drain_duration_ms_total: self.reload_drain_duration_ms_total.load(Ordering::Relaxed),
            duplicate_signal_total: self.duplicate_signal_total.load(Ordering::Relaxed),
            drop_signal_total: self.drop_signal_total.load(Ordering::Relaxed),
        }
    }

    /// Advisory only — nothing blocks on an unhealthy gate.
    pub fn evaluate_gate(&self, thresholds: &GateThresholds) -> GateReport {
        let counters = self.snapshot();
        let mut reasons = Vec::new();
        if counters.reload_failure_total > thresholds.max_reload_failures {
            reasons.push(format!(
                "reload failures {} exceed threshold {}",
                counters.reload_failure_total, thresholds.max_reload_failures
            ));
        }
        if counters.drop_signal_total > thresholds.max_drop_signals {
            reasons.push(format!(
                "dropped signals {} exceed threshold {}",
                counters.drop_signal_total, thresholds.max_drop_signals
            ));
        }
        GateReport {
            healthy: reasons.is_empty(),
            reasons,
            counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_reports_unhealthy_over_thresholds() {
        let telemetry = Telemetry::new();
        let thresholds = GateThresholds {
            max_reload_failures: 1,
            max_drop_signals: 10,
        };
        assert!(telemetry.evaluate_gate(&thresholds).healthy);

        telemetry.reload_failure_total.store(2, Ordering::Relaxed);
        let report = telemetry.evaluate_gate(&thresholds);
        assert!(!report.healthy);
        assert_eq!(report.reasons.len(), 1);
    }
}
