use crate::HumanDuration;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A time-boxed concurrency target.
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    #[serde_as(as = "HumanDuration")]
    pub duration: Duration,
    pub target: usize,
}

impl Stage {
    pub fn new(duration: Duration, target: usize) -> Self {
        Self { duration, target }
    }
}

/// Why a request did not succeed at the transport level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// How a single request step ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Success { status: u16 },
    /// A response arrived but its status was not the expected one.
    UnexpectedStatus { status: u16 },
    /// The expected status arrived, but slower than the step's latency bound.
    LatencyExceeded { status: u16, bound: Duration },
    Transport(TransportErrorKind),
}

impl Outcome {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Success { .. })
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Outcome::Success { .. } => None,
            Outcome::UnexpectedStatus { .. } => Some(FailureKind::Status),
            Outcome::LatencyExceeded { .. } => Some(FailureKind::Latency),
            Outcome::Transport(_) => Some(FailureKind::Transport),
        }
    }

    pub fn status(&self) -> Option<u16> {
        match *self {
            Outcome::Success { status }
            | Outcome::UnexpectedStatus { status }
            | Outcome::LatencyExceeded { status, .. } => Some(status),
            Outcome::Transport(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Status,
    Latency,
    Transport,
}

/// The record of one request step of one iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OperationResult {
    pub name: Arc<str>,
    pub outcome: Outcome,
    pub latency: Duration,
}

impl OperationResult {
    pub fn new(name: impl Into<Arc<str>>, outcome: Outcome, latency: Duration) -> Self {
        Self {
            name: name.into(),
            outcome,
            latency,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.outcome.is_failure()
    }
}
