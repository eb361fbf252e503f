//! Run-wide aggregation of request outcomes.
use crate::histogram::LatencyHistogram;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use surge_core::{FailureKind, OperationResult};

/// Thread-safe aggregator shared by every virtual user of a run.
///
/// All mutation goes through [`Measurements::record`] and [`Measurements::record_iteration`];
/// each call is a single short critical section, so concurrent callers never lose updates and
/// [`Measurements::snapshot`] never observes a half-applied record.
#[derive(Debug, Default)]
pub struct Measurements {
    inner: Mutex<Snapshot>,
}

impl Measurements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &OperationResult) {
        let mut inner = self.lock();

        inner.totals.add(result);
        if let Some(status) = result.outcome.status() {
            *inner.status_codes.entry(status).or_insert(0) += 1;
        }

        inner
            .operations
            .entry(result.name.clone())
            .or_default()
            .add(result);
    }

    /// Count one completed pass through a virtual user script.
    pub fn record_iteration(&self) {
        self.lock().iterations += 1;
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Snapshot> {
        // A panic while holding the lock can only come from a bug in `record`; the counters
        // themselves are still meaningful.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Failure counts split by kind.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounts {
    pub status: u64,
    pub latency: u64,
    pub transport: u64,
}

impl FailureCounts {
    pub fn total(&self) -> u64 {
        self.status + self.latency + self.transport
    }

    fn add(&mut self, kind: FailureKind) {
        match kind {
            FailureKind::Status => self.status += 1,
            FailureKind::Latency => self.latency += 1,
            FailureKind::Transport => self.transport += 1,
        }
    }
}

/// Counters and latencies for one scope (the whole run or a single named operation).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Tally {
    pub requests: u64,
    pub failures: FailureCounts,
    pub latency: LatencyHistogram,
}

impl Tally {
    fn add(&mut self, result: &OperationResult) {
        self.requests += 1;
        if let Some(kind) = result.outcome.failure_kind() {
            self.failures.add(kind);
        }
        self.latency.record(result.latency);
    }

    pub fn failed(&self) -> u64 {
        self.failures.total()
    }

    /// `None` when nothing was recorded.
    pub fn failure_rate(&self) -> Option<f64> {
        self.rate_of(self.failed())
    }

    pub fn latency_violation_rate(&self) -> Option<f64> {
        self.rate_of(self.failures.latency)
    }

    fn rate_of(&self, count: u64) -> Option<f64> {
        (self.requests > 0).then(|| count as f64 / self.requests as f64)
    }
}

/// Immutable point-in-time copy of everything a run has recorded.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub totals: Tally,
    pub iterations: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub operations: BTreeMap<Arc<str>, Tally>,
}

impl Snapshot {
    pub fn requests(&self) -> u64 {
        self.totals.requests
    }

    pub fn failures(&self) -> u64 {
        self.totals.failed()
    }

    pub fn operation(&self, name: &str) -> Option<&Tally> {
        self.operations.get(name)
    }

    /// The run totals, or a single operation's tally when `operation` is set.
    pub fn scope(&self, operation: Option<&str>) -> Option<&Tally> {
        match operation {
            Some(name) => self.operation(name),
            None => Some(&self.totals),
        }
    }
}
