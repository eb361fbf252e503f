//! Final run report in machine and human readable form.
use crate::histogram::LatencyHistogram;
use crate::measurements::{FailureCounts, Snapshot, Tally};
use crate::thresholds::{as_millis, RunVerdict, ThresholdStatus, ThresholdVerdict};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    /// A single JSON object.
    #[default]
    Json,
    /// Human readable summary.
    Text,
    /// Summary followed by the JSON object.
    All,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub run_id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    /// Wall clock run time in seconds.
    pub elapsed: f64,
    pub requests: u64,
    pub failures: u64,
    pub failure_rate: Option<f64>,
    pub failures_by_kind: FailureCounts,
    pub iterations: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub latency: LatencySummary,
    pub operations: BTreeMap<String, OperationReport>,
    pub thresholds: Vec<ThresholdVerdict>,
    pub passed: bool,
    pub aborted: bool,
}

/// Latency statistics in milliseconds. Every field is `None` when nothing was recorded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    pub min: Option<f64>,
    pub avg: Option<f64>,
    pub med: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub max: Option<f64>,
}

impl From<&LatencyHistogram> for LatencySummary {
    fn from(h: &LatencyHistogram) -> Self {
        Self {
            min: h.min().map(as_millis),
            avg: h.mean().map(as_millis),
            med: h.percentile(50.).map(as_millis),
            p90: h.percentile(90.).map(as_millis),
            p95: h.percentile(95.).map(as_millis),
            p99: h.percentile(99.).map(as_millis),
            max: h.max().map(as_millis),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationReport {
    pub requests: u64,
    pub failures: u64,
    pub failure_rate: Option<f64>,
    pub failures_by_kind: FailureCounts,
    pub latency: LatencySummary,
}

impl From<&Tally> for OperationReport {
    fn from(tally: &Tally) -> Self {
        Self {
            requests: tally.requests,
            failures: tally.failed(),
            failure_rate: tally.failure_rate(),
            failures_by_kind: tally.failures,
            latency: (&tally.latency).into(),
        }
    }
}

impl Report {
    pub fn new(
        run_id: Uuid,
        started_at: OffsetDateTime,
        elapsed: Duration,
        snapshot: &Snapshot,
        verdict: &RunVerdict,
    ) -> Self {
        Self {
            run_id,
            started_at,
            elapsed: elapsed.as_secs_f64(),
            requests: snapshot.requests(),
            failures: snapshot.failures(),
            failure_rate: snapshot.totals.failure_rate(),
            failures_by_kind: snapshot.totals.failures,
            iterations: snapshot.iterations,
            status_codes: snapshot.status_codes.clone(),
            latency: (&snapshot.totals.latency).into(),
            operations: snapshot
                .operations
                .iter()
                .map(|(name, tally)| (name.to_string(), tally.into()))
                .collect(),
            thresholds: verdict.thresholds.clone(),
            passed: verdict.passed,
            aborted: verdict.aborted,
        }
    }

    pub fn emit<W: Write>(&self, format: ReportFormat, w: &mut W) -> io::Result<()> {
        match format {
            ReportFormat::Json => self.write_json(w),
            ReportFormat::Text => self.write_summary(w),
            ReportFormat::All => {
                self.write_summary(w)?;
                writeln!(w)?;
                self.write_json(w)
            }
        }
    }

    pub fn write_json<W: Write>(&self, w: &mut W) -> io::Result<()> {
        serde_json::to_writer_pretty(&mut *w, self)?;
        writeln!(w)
    }

    pub fn write_summary<W: Write>(&self, w: &mut W) -> io::Result<()> {
        writeln!(w, "run {} ({})", self.run_id, self.started_at)?;
        writeln!(
            w,
            "elapsed {:.1}s, {} iterations{}",
            self.elapsed,
            self.iterations,
            if self.aborted { ", aborted" } else { "" }
        )?;
        writeln!(w)?;

        writeln!(
            w,
            "requests ........ {} ({} failed, {})",
            self.requests,
            self.failures,
            percent(self.failure_rate)
        )?;
        let kinds = self.failures_by_kind;
        writeln!(
            w,
            "failures ........ status={} latency={} transport={}",
            kinds.status, kinds.latency, kinds.transport
        )?;
        if !self.status_codes.is_empty() {
            let codes: Vec<_> = self
                .status_codes
                .iter()
                .map(|(code, count)| format!("{code}={count}"))
                .collect();
            writeln!(w, "status codes .... {}", codes.join(" "))?;
        }
        writeln!(w, "latency ......... {}", latency_line(&self.latency))?;

        if !self.operations.is_empty() {
            writeln!(w)?;
            for (name, op) in &self.operations {
                writeln!(
                    w,
                    "  {name:<12} {:>8} reqs {:>8} failed  {}",
                    op.requests,
                    op.failures,
                    latency_line(&op.latency)
                )?;
            }
        }

        if !self.thresholds.is_empty() {
            writeln!(w)?;
            for verdict in &self.thresholds {
                let mark = match verdict.status {
                    ThresholdStatus::Pass => "✓",
                    ThresholdStatus::Fail | ThresholdStatus::InsufficientData => "✗",
                };
                let observed = verdict
                    .observed
                    .map(|v| format!("{v:.4}"))
                    .unwrap_or_else(|| "-".to_string());
                writeln!(
                    w,
                    "{mark} {} (observed {observed}) {}",
                    verdict.threshold, verdict.status
                )?;
            }
        }

        writeln!(w)?;
        writeln!(w, "{}", if self.passed { "PASSED" } else { "FAILED" })
    }
}

fn percent(rate: Option<f64>) -> String {
    rate.map(|r| format!("{:.2}%", r * 100.))
        .unwrap_or_else(|| "n/a".to_string())
}

fn latency_line(l: &LatencySummary) -> String {
    let ms = |v: Option<f64>| {
        v.map(|v| format!("{v:.1}ms"))
            .unwrap_or_else(|| "-".to_string())
    };
    format!(
        "min={} avg={} med={} p90={} p95={} p99={} max={}",
        ms(l.min),
        ms(l.avg),
        ms(l.med),
        ms(l.p90),
        ms(l.p95),
        ms(l.p99),
        ms(l.max)
    )
}
