//! Pass/fail evaluation of thresholds against a metrics snapshot.
use crate::measurements::{Snapshot, Tally};
use serde::Serialize;
use serde_with::{serde_as, DisplayFromStr};
use std::fmt;
use surge_core::{Metric, Threshold};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdStatus {
    Pass,
    Fail,
    /// The threshold's scope recorded no requests, so there is nothing to compare.
    InsufficientData,
}

impl fmt::Display for ThresholdStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThresholdStatus::Pass => f.write_str("PASS"),
            ThresholdStatus::Fail => f.write_str("FAIL"),
            ThresholdStatus::InsufficientData => f.write_str("INSUFFICIENT DATA"),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ThresholdVerdict {
    #[serde_as(as = "DisplayFromStr")]
    pub threshold: Threshold,
    pub observed: Option<f64>,
    pub status: ThresholdStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunVerdict {
    pub thresholds: Vec<ThresholdVerdict>,
    pub passed: bool,
    pub aborted: bool,
}

impl RunVerdict {
    /// An aborted run never passes, whatever the thresholds say.
    pub fn mark_aborted(&mut self) {
        self.aborted = true;
        self.passed = false;
    }

    pub fn failed(&self) -> impl Iterator<Item = &ThresholdVerdict> {
        self.thresholds
            .iter()
            .filter(|v| v.status != ThresholdStatus::Pass)
    }

    /// The first threshold that has definitely failed. Missing data does not count here.
    pub fn first_failure(&self) -> Option<&ThresholdVerdict> {
        self.thresholds
            .iter()
            .find(|v| v.status == ThresholdStatus::Fail)
    }
}

pub fn evaluate(snapshot: &Snapshot, thresholds: &[Threshold]) -> RunVerdict {
    let thresholds: Vec<_> = thresholds
        .iter()
        .map(|threshold| evaluate_one(snapshot, threshold))
        .collect();
    let passed = thresholds.iter().all(|v| v.status == ThresholdStatus::Pass);

    RunVerdict {
        thresholds,
        passed,
        aborted: false,
    }
}

fn evaluate_one(snapshot: &Snapshot, threshold: &Threshold) -> ThresholdVerdict {
    let observed = observe(snapshot, threshold);
    let status = match observed {
        Some(value) if threshold.comparator.compare(value, threshold.limit) => {
            ThresholdStatus::Pass
        }
        Some(_) => ThresholdStatus::Fail,
        None => ThresholdStatus::InsufficientData,
    };

    ThresholdVerdict {
        threshold: threshold.clone(),
        observed,
        status,
    }
}

/// The value `threshold` is compared against. Latencies are in milliseconds.
pub fn observe(snapshot: &Snapshot, threshold: &Threshold) -> Option<f64> {
    let empty = Tally::default();
    // An operation that never ran has a well-defined zero count.
    let tally = snapshot
        .scope(threshold.operation.as_deref())
        .unwrap_or(&empty);
    if tally.requests == 0 && !threshold.metric.is_count() {
        return None;
    }

    match threshold.metric {
        Metric::RequestCount => Some(tally.requests as f64),
        // Iterations are not attributed to operations.
        Metric::Iterations => Some(snapshot.iterations as f64),
        Metric::FailureRate => tally.failure_rate(),
        Metric::LatencyViolationRate => tally.latency_violation_rate(),
        Metric::LatencyAvg => tally.latency.mean().map(as_millis),
        Metric::LatencyMin => tally.latency.min().map(as_millis),
        Metric::LatencyMax => tally.latency.max().map(as_millis),
        Metric::LatencyPercentile(p) => tally.latency.percentile(p).map(as_millis),
    }
}

pub(crate) fn as_millis(d: std::time::Duration) -> f64 {
    d.as_micros() as f64 / 1_000.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurements::Measurements;
    use std::time::Duration;
    use surge_core::{Comparator, OperationResult, Outcome};

    fn measured(ok: u64, failed: u64) -> Snapshot {
        let m = Measurements::new();
        for i in 0..ok + failed {
            let outcome = if i < failed {
                Outcome::UnexpectedStatus { status: 503 }
            } else {
                Outcome::Success { status: 200 }
            };
            let name = if i % 2 == 0 { "browse" } else { "checkout" };
            m.record(&OperationResult::new(name, outcome, Duration::from_millis(20)));
        }
        m.snapshot()
    }

    fn failure_rate_below(limit: f64) -> Threshold {
        Threshold::new(Metric::FailureRate, Comparator::Lt, limit)
    }

    #[test]
    fn failure_rate_under_limit_passes() {
        let verdict = evaluate(&measured(995, 5), &[failure_rate_below(0.01)]);
        assert!(verdict.passed);
        assert_eq!(verdict.thresholds[0].observed, Some(0.005));
        assert_eq!(verdict.thresholds[0].status, ThresholdStatus::Pass);
    }

    #[test]
    fn failure_rate_over_limit_fails() {
        let verdict = evaluate(&measured(985, 15), &[failure_rate_below(0.01)]);
        assert!(!verdict.passed);
        assert!(verdict.first_failure().is_some());
        assert_eq!(verdict.thresholds[0].observed, Some(0.015));
        assert_eq!(verdict.failed().count(), 1);
    }

    #[test]
    fn zero_requests_is_insufficient_data() {
        let snapshot = Measurements::new().snapshot();
        let thresholds = [
            failure_rate_below(0.01),
            Threshold::new(Metric::LatencyPercentile(95.), Comparator::Lt, 500.),
            Threshold::new(Metric::RequestCount, Comparator::Eq, 0.),
        ];

        for _ in 0..3 {
            let verdict = evaluate(&snapshot, &thresholds);
            assert!(!verdict.passed);
            assert!(verdict.first_failure().is_none());
            assert_eq!(verdict.thresholds[0].status, ThresholdStatus::InsufficientData);
            assert_eq!(verdict.thresholds[0].observed, None);
            assert_eq!(verdict.thresholds[1].status, ThresholdStatus::InsufficientData);
            assert_eq!(verdict.thresholds[2].status, ThresholdStatus::Pass);
        }
    }

    #[test]
    fn percentile_threshold_uses_milliseconds() {
        let m = Measurements::new();
        for ms in [100, 100, 100, 100, 200, 200, 300, 300, 400, 500] {
            m.record(&OperationResult::new(
                "view",
                Outcome::Success { status: 200 },
                Duration::from_millis(ms),
            ));
        }
        let snapshot = m.snapshot();

        let p95: Threshold = "p(95) < 500".parse().unwrap();
        let verdict = evaluate(&snapshot, &[p95]);
        assert_eq!(verdict.thresholds[0].observed, Some(500.));
        assert!(!verdict.passed);

        let p95: Threshold = "p(95) <= 500".parse().unwrap();
        assert!(evaluate(&snapshot, &[p95]).passed);

        let avg = Threshold::new(Metric::LatencyAvg, Comparator::Eq, 230.);
        assert!(evaluate(&snapshot, &[avg]).passed);
    }

    #[test]
    fn operation_scoped_thresholds() {
        // failures are the first 10 records, split evenly between both operations
        let snapshot = measured(90, 10);
        let scoped = failure_rate_below(0.2).for_operation("checkout");
        let verdict = evaluate(&snapshot, &[scoped]);
        assert_eq!(verdict.thresholds[0].observed, Some(0.1));
        assert!(verdict.passed);

        let unknown = failure_rate_below(0.2).for_operation("view");
        let verdict = evaluate(&snapshot, &[unknown]);
        assert_eq!(verdict.thresholds[0].status, ThresholdStatus::InsufficientData);

        let count = Threshold::new(Metric::RequestCount, Comparator::Eq, 0.).for_operation("view");
        assert!(evaluate(&snapshot, &[count]).passed);
    }

    #[test]
    fn no_thresholds_passes() {
        assert!(evaluate(&Measurements::new().snapshot(), &[]).passed);
    }

    #[test]
    fn aborted_run_never_passes() {
        let mut verdict = evaluate(&measured(100, 0), &[failure_rate_below(0.01)]);
        assert!(verdict.passed);
        verdict.mark_aborted();
        assert!(!verdict.passed);
        assert!(verdict.aborted);
    }

    #[test]
    fn verdict_serializes_threshold_as_expression() {
        let verdict = evaluate(&measured(10, 0), &[failure_rate_below(0.01)]);
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["thresholds"][0]["threshold"], "failure_rate < 0.01");
        assert_eq!(json["thresholds"][0]["status"], "pass");
    }
}
