use crate::ConfigError;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;

/// An aggregate a threshold can be placed on.
///
/// Rates are fractions in `[0, 1]`, latencies are milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, SerializeDisplay, DeserializeFromStr)]
pub enum Metric {
    FailureRate,
    LatencyViolationRate,
    RequestCount,
    Iterations,
    LatencyAvg,
    LatencyMin,
    LatencyMax,
    /// Nearest-rank percentile, `0 < p <= 100`.
    LatencyPercentile(f64),
}

impl Metric {
    /// Count metrics are meaningful with zero recorded requests; everything else is a ratio or
    /// a latency statistic and has no value without data.
    pub fn is_count(&self) -> bool {
        matches!(self, Metric::RequestCount | Metric::Iterations)
    }

    fn is_latency(&self) -> bool {
        matches!(
            self,
            Metric::LatencyAvg
                | Metric::LatencyMin
                | Metric::LatencyMax
                | Metric::LatencyPercentile(_)
        )
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::FailureRate => f.write_str("failure_rate"),
            Metric::LatencyViolationRate => f.write_str("latency_violation_rate"),
            Metric::RequestCount => f.write_str("request_count"),
            Metric::Iterations => f.write_str("iterations"),
            Metric::LatencyAvg => f.write_str("latency_avg"),
            Metric::LatencyMin => f.write_str("latency_min"),
            Metric::LatencyMax => f.write_str("latency_max"),
            Metric::LatencyPercentile(p) => write!(f, "latency_p{p}"),
        }
    }
}

impl FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        // `http_req_duration_p(95)`, `http_req_duration.avg`
        if let Some(stat) = s
            .strip_prefix("http_req_duration")
            .and_then(|rest| rest.strip_prefix(['_', '.']))
        {
            return match stat.parse::<Metric>() {
                Ok(metric) if metric.is_latency() && !stat.starts_with("latency_") => Ok(metric),
                Ok(_) => Err(ConfigError::UnknownMetric(s.to_string())),
                Err(ConfigError::UnknownMetric(_)) => Err(ConfigError::UnknownMetric(s.to_string())),
                Err(err) => Err(err),
            };
        }

        let metric = match s {
            "failure_rate" | "http_req_failed" => Metric::FailureRate,
            "latency_violation_rate" => Metric::LatencyViolationRate,
            "request_count" | "http_reqs" => Metric::RequestCount,
            "iterations" => Metric::Iterations,
            "latency_avg" | "avg" => Metric::LatencyAvg,
            "latency_min" | "min" => Metric::LatencyMin,
            "latency_max" | "max" => Metric::LatencyMax,
            "latency_med" | "med" => Metric::LatencyPercentile(50.),
            other => {
                let p = other.strip_prefix("latency_").unwrap_or(other);
                let p = p
                    .strip_prefix("p(")
                    .and_then(|p| p.strip_suffix(')'))
                    .or_else(|| p.strip_prefix('p'))
                    .ok_or_else(|| ConfigError::UnknownMetric(s.to_string()))?;
                let p: f64 = p
                    .parse()
                    .map_err(|_| ConfigError::UnknownMetric(s.to_string()))?;
                if !(p > 0. && p <= 100.) {
                    return Err(ConfigError::invalid(
                        "thresholds.metric",
                        format!("percentile {p} is outside (0, 100]"),
                    ));
                }
                Metric::LatencyPercentile(p)
            }
        };
        Ok(metric)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "<=", alias = "le")]
    Le,
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "==", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "ne")]
    Ne,
}

impl Comparator {
    pub fn compare(&self, observed: f64, limit: f64) -> bool {
        match self {
            Comparator::Lt => observed < limit,
            Comparator::Le => observed <= limit,
            Comparator::Gt => observed > limit,
            Comparator::Ge => observed >= limit,
            Comparator::Eq => (observed - limit).abs() < f64::EPSILON,
            Comparator::Ne => (observed - limit).abs() >= f64::EPSILON,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Comparator {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" | "lt" => Ok(Comparator::Lt),
            "<=" | "le" => Ok(Comparator::Le),
            ">" | "gt" => Ok(Comparator::Gt),
            ">=" | "ge" => Ok(Comparator::Ge),
            "==" | "eq" => Ok(Comparator::Eq),
            "!=" | "ne" => Ok(Comparator::Ne),
            other => Err(ConfigError::invalid(
                "thresholds.comparator",
                format!("unknown comparator `{other}`"),
            )),
        }
    }
}

/// A pass/fail condition on an aggregated metric, optionally scoped to one named operation.
///
/// Written either as an object (`{"metric": "p95", "comparator": "<", "limit": 500}`) or as an
/// expression string (`"checkout:failure_rate < 0.01"`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Threshold {
    pub metric: Metric,
    pub comparator: Comparator,
    pub limit: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

impl Threshold {
    pub fn new(metric: Metric, comparator: Comparator, limit: f64) -> Self {
        Self {
            metric,
            comparator,
            limit,
            operation: None,
        }
    }

    pub fn for_operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(op) = &self.operation {
            write!(f, "{op}:")?;
        }
        write!(f, "{} {} {}", self.metric, self.comparator, self.limit)
    }
}

impl FromStr for Threshold {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ConfigError::invalid("thresholds", format!("malformed threshold `{s}`"));

        let at = s.find(['<', '>', '=', '!']).ok_or_else(malformed)?;
        let (lhs, rest) = s.split_at(at);
        let width = if rest[1..].starts_with('=') { 2 } else { 1 };
        let (cmp, limit) = rest.split_at(width);

        let comparator: Comparator = cmp.parse()?;
        let limit: f64 = limit.trim().parse().map_err(|_| malformed())?;

        let (operation, metric) = match lhs.trim().split_once(':') {
            Some((op, metric)) => (Some(op.trim().to_string()), metric),
            None => (None, lhs),
        };

        Ok(Self {
            metric: metric.parse()?,
            comparator,
            limit,
            operation,
        })
    }
}
