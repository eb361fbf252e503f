use crate::{
    HumanDuration, Outcome, DEFAULT_THINK_TIME_MAX, DEFAULT_THINK_TIME_MIN,
    DEFAULT_VIEW_LATENCY_BOUND,
};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Head => "HEAD",
        };
        f.write_str(s)
    }
}

/// An inclusive range a pause length is drawn from.
#[serde_as]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PauseRange {
    #[serde_as(as = "HumanDuration")]
    pub min: Duration,
    #[serde_as(as = "HumanDuration")]
    pub max: Duration,
}

impl PauseRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn fixed(duration: Duration) -> Self {
        Self::new(duration, duration)
    }

    pub fn is_zero(&self) -> bool {
        self.max.is_zero()
    }
}

impl Default for PauseRange {
    fn default() -> Self {
        Self::new(DEFAULT_THINK_TIME_MIN, DEFAULT_THINK_TIME_MAX)
    }
}

/// A single HTTP request issued against the base URL.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestStep {
    pub name: Arc<str>,
    #[serde(default)]
    pub method: Method,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// When unset any 2xx status counts as success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_status: Option<u16>,
    #[serde_as(as = "Option<HumanDuration>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_latency: Option<Duration>,
}

impl RequestStep {
    pub fn get(name: &str, path: &str) -> Self {
        Self {
            name: name.into(),
            method: Method::Get,
            path: path.to_string(),
            body: None,
            expect_status: None,
            max_latency: None,
        }
    }

    pub fn post(name: &str, path: &str, body: serde_json::Value) -> Self {
        Self {
            method: Method::Post,
            body: Some(body),
            ..Self::get(name, path)
        }
    }

    pub fn max_latency(mut self, bound: Duration) -> Self {
        self.max_latency = Some(bound);
        self
    }

    pub fn expect_status(mut self, status: u16) -> Self {
        self.expect_status = Some(status);
        self
    }

    pub fn accepts(&self, status: u16) -> bool {
        match self.expect_status {
            Some(expected) => status == expected,
            None => (200..300).contains(&status),
        }
    }

    /// Decide the outcome of a response that arrived with `status` after `latency`.
    pub fn classify(&self, status: u16, latency: Duration) -> Outcome {
        if !self.accepts(status) {
            return Outcome::UnexpectedStatus { status };
        }

        match self.max_latency {
            Some(bound) if latency > bound => Outcome::LatencyExceeded { status, bound },
            _ => Outcome::Success { status },
        }
    }
}

/// One entry of a virtual user script.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Step {
    Request(RequestStep),
    /// Pause for a length drawn from the given range.
    Pause(PauseRange),
    /// Pause for the run's configured think time.
    Think,
}

/// browse -> view -> think -> checkout
pub fn default_script() -> Vec<Step> {
    vec![
        Step::Request(RequestStep::get("browse", "/products")),
        Step::Request(
            RequestStep::get("view", "/product/1").max_latency(DEFAULT_VIEW_LATENCY_BOUND),
        ),
        Step::Think,
        Step::Request(RequestStep::post(
            "checkout",
            "/checkout",
            serde_json::json!({ "cartId": 123 }),
        )),
    ]
}
