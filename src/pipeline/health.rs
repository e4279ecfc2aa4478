//! Health metrics for a track processor

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Health metrics for one processor
///
/// Counters are atomic so both queues can record without taking the state lock.
#[derive(Debug, Default)]
pub struct PipelineHealth {
    /// Samples accepted on the input side
    pub frames_in: AtomicU64,

    /// Samples handed to the output side
    pub frames_out: AtomicU64,

    /// Payload bytes of produced samples
    pub bytes_out: AtomicU64,

    /// Sync samples produced
    pub keyframes: AtomicU64,

    /// Samples refused or lost to a failure
    pub drops: AtomicU64,

    /// Stage open or push/pull failures
    pub stage_failures: AtomicU64,

    /// PTS discontinuities seen on the input side
    pub timestamp_gaps: AtomicU64,

    /// Times a stage answered "try again" to a push
    pub again_retries: AtomicU64,
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_input(&self) {
        self.frames_in.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a produced sample
    pub fn record_output(&self, size: usize, is_keyframe: bool) {
        self.frames_out.fetch_add(1, Ordering::Relaxed);
        self.bytes_out.fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stage_failure(&self) {
        self.stage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_gap(&self) {
        self.timestamp_gaps.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_again(&self) {
        self.again_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    /// Calculate the drop rate as a percentage of accepted input
    pub fn drop_rate(&self) -> f64 {
        let drops = self.drops();
        let accepted = self.frames_in();
        if accepted == 0 {
            return 0.0;
        }
        (drops as f64 / accepted as f64) * 100.0
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_in: self.frames_in(),
            frames_out: self.frames_out(),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            drops: self.drops(),
            stage_failures: self.stage_failures.load(Ordering::Relaxed),
            timestamp_gaps: self.timestamp_gaps.load(Ordering::Relaxed),
            again_retries: self.again_retries.load(Ordering::Relaxed),
            drop_rate: self.drop_rate(),
        }
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, Serialize)]
pub struct HealthSummary {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_out: u64,
    pub keyframes: u64,
    pub drops: u64,
    pub stage_failures: u64,
    pub timestamp_gaps: u64,
    pub again_retries: u64,
    pub drop_rate: f64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} in, {} out ({} drops, {:.2}%), {} bytes, {} keyframes, {} stage failures, {} gaps, {} retries",
            self.frames_in,
            self.frames_out,
            self.drops,
            self.drop_rate,
            self.bytes_out,
            self.keyframes,
            self.stage_failures,
            self.timestamp_gaps,
            self.again_retries
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_metrics() {
        let health = PipelineHealth::new();

        for _ in 0..4 {
            health.record_input();
        }
        health.record_output(1000, true);
        health.record_output(2000, false);
        health.record_output(1500, false);

        let summary = health.summary();
        assert_eq!(summary.frames_in, 4);
        assert_eq!(summary.frames_out, 3);
        assert_eq!(summary.bytes_out, 4500);
        assert_eq!(summary.keyframes, 1);
        assert_eq!(summary.drops, 0);

        health.record_drop();
        assert_eq!(health.drop_rate(), 25.0);
        assert!(health.summary().to_string().contains("1 drops"));
    }
}
