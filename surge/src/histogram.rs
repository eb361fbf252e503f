use hdrhistogram::Histogram;
use std::time::Duration;
use surge_core::LATENCY_SIGNIFICANT_DIGITS;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

/// Highest latency tracked at full precision, in microseconds. Larger samples saturate.
const HIGHEST_TRACKABLE_MICROS: u64 = 60 * 60 * 1000 * 1000;

/// Latency histogram.
///
/// Samples are recorded in microseconds into an HDR histogram with
/// [`LATENCY_SIGNIFICANT_DIGITS`] significant digits, so memory stays bounded no matter how many
/// samples arrive. Min, max and mean are tracked exactly alongside it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LatencyHistogram {
    samples: Option<Histogram<u64>>,
    sum_micros: u128,
    min_micros: u64,
    max_micros: u64,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);

        if self.samples.is_none() {
            let created =
                Histogram::new_with_bounds(1, HIGHEST_TRACKABLE_MICROS, LATENCY_SIGNIFICANT_DIGITS);
            match created {
                Ok(samples) => self.samples = Some(samples),
                Err(err) => {
                    error!("Unable to allocate latency histogram: {err}");
                    return;
                }
            }
        }
        let Some(samples) = self.samples.as_mut() else {
            return;
        };

        let first = samples.is_empty();
        samples.saturating_record(micros);

        if first || micros < self.min_micros {
            self.min_micros = micros;
        }
        self.max_micros = self.max_micros.max(micros);
        self.sum_micros += u128::from(micros);
    }

    pub fn count(&self) -> u64 {
        self.samples.as_ref().map_or(0, |h| h.len())
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn min(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.min_micros))
    }

    pub fn max(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| Duration::from_micros(self.max_micros))
    }

    pub fn mean(&self) -> Option<Duration> {
        (!self.is_empty()).then(|| {
            let mean = self.sum_micros / u128::from(self.count());
            Duration::from_micros(u64::try_from(mean).unwrap_or(u64::MAX))
        })
    }

    /// Nearest-rank percentile: the recorded value below or at which `p` percent of samples
    /// fall, within the histogram's precision. The result never leaves the observed
    /// `[min, max]` range, so `p(100)` is the exact max.
    pub fn percentile(&self, p: f64) -> Option<Duration> {
        let samples = self.samples.as_ref().filter(|h| !h.is_empty())?;
        let quantile = (p / 100.).clamp(0., 1.);
        let micros = samples
            .value_at_quantile(quantile)
            .clamp(self.min_micros, self.max_micros);
        Some(Duration::from_micros(micros))
    }
}
