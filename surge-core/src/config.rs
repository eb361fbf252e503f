use crate::{
    default_script, ConfigError, HumanDuration, PauseRange, Stage, Step, Threshold,
    DEFAULT_FAIL_FAST_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_START_JITTER, DEFAULT_TICK,
    MAX_DURATION,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DisplayFromStr, PickFirst};
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// How the active virtual user count moves from one stage target to the next.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampMode {
    /// Interpolate linearly over the stage duration.
    #[default]
    Linear,
    /// Jump to the stage target as soon as the stage starts.
    Step,
}

/// Full description of a load run, usually read from a JSON file.
#[serde_as]
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfig {
    pub base_url: String,
    pub stages: Vec<Stage>,
    #[serde_as(as = "Vec<PickFirst<(_, DisplayFromStr)>>")]
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
    #[serde(default)]
    pub think_time: PauseRange,
    #[serde_as(as = "HumanDuration")]
    #[serde(default = "default_start_jitter")]
    pub start_jitter: Duration,
    #[serde(default)]
    pub ramp: RampMode,
    #[serde_as(as = "HumanDuration")]
    #[serde(default = "default_tick")]
    pub tick: Duration,
    #[serde_as(as = "HumanDuration")]
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Upper bound on requests per second across all virtual users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rps: Option<NonZeroU32>,
    /// Evaluate thresholds while running and stop as soon as one fails.
    #[serde(default)]
    pub fail_fast: bool,
    #[serde_as(as = "HumanDuration")]
    #[serde(default = "default_fail_fast_interval")]
    pub fail_fast_interval: Duration,
    #[serde(default = "default_script")]
    pub script: Vec<Step>,
}

fn default_start_jitter() -> Duration {
    DEFAULT_START_JITTER
}

fn default_tick() -> Duration {
    DEFAULT_TICK
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_fail_fast_interval() -> Duration {
    DEFAULT_FAIL_FAST_INTERVAL
}

impl RunConfig {
    pub fn new(base_url: &str, stages: Vec<Stage>) -> Self {
        Self {
            base_url: base_url.to_string(),
            stages,
            thresholds: vec![],
            think_time: PauseRange::default(),
            start_jitter: DEFAULT_START_JITTER,
            ramp: RampMode::default(),
            tick: DEFAULT_TICK,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            rps: None,
            fail_fast: false,
            fail_fast_interval: DEFAULT_FAIL_FAST_INTERVAL,
            script: default_script(),
        }
    }

    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_base_url()?;

        if self.stages.is_empty() {
            return Err(ConfigError::invalid("stages", "at least one stage is required"));
        }

        let total = self
            .stages
            .iter()
            .try_fold(Duration::ZERO, |acc, s| acc.checked_add(s.duration));
        if !total.is_some_and(|total| total <= MAX_DURATION) {
            return Err(ConfigError::invalid(
                "stages",
                format!(
                    "total duration exceeds {}",
                    humantime::format_duration(MAX_DURATION)
                ),
            ));
        }

        for (field, duration) in [
            ("thinkTime", self.think_time.max),
            ("startJitter", self.start_jitter),
            ("tick", self.tick),
            ("requestTimeout", self.request_timeout),
            ("failFastInterval", self.fail_fast_interval),
        ] {
            check_bounded(field, duration)?;
        }

        if self.think_time.min > self.think_time.max {
            return Err(ConfigError::invalid("thinkTime", "`min` is larger than `max`"));
        }

        if self.tick.is_zero() {
            return Err(ConfigError::invalid("tick", "must be greater than zero"));
        }

        if self.request_timeout.is_zero() {
            return Err(ConfigError::invalid("requestTimeout", "must be greater than zero"));
        }

        if self.fail_fast && self.fail_fast_interval.is_zero() {
            return Err(ConfigError::invalid(
                "failFastInterval",
                "must be greater than zero",
            ));
        }

        self.validate_script()?;
        self.validate_thresholds()
    }

    pub fn parsed_base_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.base_url)
            .map_err(|err| ConfigError::invalid("baseUrl", err.to_string()))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "baseUrl",
                format!("unsupported scheme `{}`", url.scheme()),
            ));
        }

        if url.host_str().is_none() {
            return Err(ConfigError::invalid("baseUrl", "missing host"));
        }

        Ok(url)
    }

    /// Sum of all stage durations.
    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.duration))
    }

    fn validate_script(&self) -> Result<(), ConfigError> {
        let mut requests = 0;
        for step in &self.script {
            match step {
                Step::Request(req) => {
                    requests += 1;
                    if req.name.trim().is_empty() {
                        return Err(ConfigError::invalid("script.name", "must not be empty"));
                    }
                    if !req.path.starts_with('/') {
                        return Err(ConfigError::invalid(
                            "script.path",
                            format!("`{}` must start with `/`", req.path),
                        ));
                    }
                }
                Step::Pause(range) if range.min > range.max => {
                    return Err(ConfigError::invalid(
                        "script.pause",
                        "`min` is larger than `max`",
                    ));
                }
                Step::Pause(range) => check_bounded("script.pause", range.max)?,
                Step::Think => {}
            }
        }

        if requests == 0 {
            return Err(ConfigError::invalid(
                "script",
                "at least one request step is required",
            ));
        }

        Ok(())
    }

    fn validate_thresholds(&self) -> Result<(), ConfigError> {
        for threshold in &self.thresholds {
            if !threshold.limit.is_finite() {
                return Err(ConfigError::invalid(
                    "thresholds.limit",
                    format!("`{threshold}` has a non-finite limit"),
                ));
            }

            if let Some(op) = &threshold.operation {
                let known = self
                    .script
                    .iter()
                    .any(|s| matches!(s, Step::Request(r) if &*r.name == op.as_str()));
                if !known {
                    return Err(ConfigError::invalid(
                        "thresholds.operation",
                        format!("no request step named `{op}`"),
                    ));
                }
            }
        }
        Ok(())
    }
}

fn check_bounded(field: &'static str, duration: Duration) -> Result<(), ConfigError> {
    if duration > MAX_DURATION {
        return Err(ConfigError::invalid(
            field,
            format!("must not exceed {}", humantime::format_duration(MAX_DURATION)),
        ));
    }
    Ok(())
}
