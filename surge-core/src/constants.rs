use std::time::Duration;

/// Default lower bound of the think-time pause.
pub const DEFAULT_THINK_TIME_MIN: Duration = Duration::from_secs(1);

/// Default upper bound of the think-time pause.
pub const DEFAULT_THINK_TIME_MAX: Duration = Duration::from_secs(2);

/// Default upper bound of the random delay before a new virtual user starts.
pub const DEFAULT_START_JITTER: Duration = Duration::from_secs(1);

/// How often the stage scheduler re-evaluates the concurrency target.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How often thresholds are checked while a run is in progress with `failFast` set.
pub const DEFAULT_FAIL_FAST_INTERVAL: Duration = Duration::from_secs(1);

/// Latency bound on the product view step of the default script.
pub const DEFAULT_VIEW_LATENCY_BOUND: Duration = Duration::from_millis(300);

/// Significant digits kept by the latency histogram.
pub const LATENCY_SIGNIFICANT_DIGITS: u8 = 3;

/// Longest duration accepted anywhere in a run config, including the sum of all stages.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);
