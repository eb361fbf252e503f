//! Wires configuration, client, users, scheduler and evaluator into a single run.
use crate::client::{self, HttpClient, ReqwestClient};
use crate::measurements::{Measurements, Snapshot};
use crate::report::Report;
use crate::scheduler::{ScheduleOutcome, StageScheduler, UserContext};
use crate::thresholds::{evaluate, RunVerdict};
use crate::user::VirtualUser;
use governor::{Quota, RateLimiter};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use surge_core::{ConfigError, RunConfig, Step, Threshold};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

pub const EXIT_PASS: u8 = 0;
pub const EXIT_FAIL: u8 = 1;
pub const EXIT_CONFIG: u8 = 2;

/// Anything that stops a run before the first stage starts.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to resolve target host `{host}`: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("Target host `{0}` resolved to no addresses")]
    NoAddress(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// A validated run, ready to be started.
pub struct LoadTest<C> {
    config: RunConfig,
    client: Arc<C>,
}

impl LoadTest<ReqwestClient> {
    /// Validate `config`, make sure the target resolves, and build the HTTP client.
    #[instrument(name = "setup", skip_all, fields(base_url = %config.base_url))]
    pub async fn connect(config: RunConfig) -> Result<Self, RunError> {
        config.validate()?;
        let base = config.parsed_base_url()?;

        client::resolve(&base).await.map_err(|err| {
            error!("{err}");
            err
        })?;
        let client = ReqwestClient::new(&base, config.request_timeout)?;

        Ok(Self {
            config,
            client: Arc::new(client),
        })
    }
}

impl<C> LoadTest<C>
where
    C: HttpClient + Sync + 'static,
{
    pub fn with_client(config: RunConfig, client: C) -> Result<Self, RunError> {
        config.validate()?;
        Ok(Self {
            config,
            client: Arc::new(client),
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    #[instrument(name = "run", skip_all, fields(base_url = %self.config.base_url))]
    pub async fn run(self) -> RunSummary {
        let run_id = Uuid::new_v4();
        let started_at = OffsetDateTime::now_utc();
        let start = Instant::now();
        let config = self.config;

        info!(
            "Starting run {run_id}: {} stages over {}",
            config.stages.len(),
            humantime::format_duration(config.total_duration())
        );

        let measurements = Arc::new(Measurements::new());
        let limiter = config
            .rps
            .map(|rps| Arc::new(RateLimiter::direct(Quota::per_second(rps))));
        let script: Arc<[Step]> = config.script.clone().into();

        let factory = {
            let client = self.client.clone();
            let measurements = measurements.clone();
            let think_time = config.think_time;
            move |ctx: UserContext| {
                let UserContext {
                    id,
                    stop,
                    start_delay,
                } = ctx;
                let user = VirtualUser::new(
                    id,
                    client.clone(),
                    script.clone(),
                    measurements.clone(),
                    stop,
                )
                .think_time(think_time)
                .limiter(limiter.clone());

                async move {
                    let iterations = user.run(start_delay).await;
                    debug!(user = id, iterations, "Virtual user retired");
                }
            }
        };

        let mut scheduler = StageScheduler::new(config.stages.clone(), factory)
            .ramp(config.ramp)
            .tick(config.tick)
            .start_jitter(config.start_jitter);

        let monitor = if config.fail_fast && !config.thresholds.is_empty() {
            let (abort_tx, abort_rx) = watch::channel(false);
            scheduler = scheduler.abort_on(abort_rx);
            Some(tokio::spawn(watch_thresholds(
                measurements.clone(),
                config.thresholds.clone(),
                config.fail_fast_interval,
                abort_tx,
            )))
        } else {
            None
        };

        let outcome = scheduler.run().await;
        if let Some(monitor) = monitor {
            monitor.abort();
        }

        let snapshot = measurements.snapshot();
        let mut verdict = evaluate(&snapshot, &config.thresholds);
        if outcome == ScheduleOutcome::Aborted {
            verdict.mark_aborted();
        }

        let elapsed = start.elapsed();
        for failed in verdict.failed() {
            warn!(
                "Threshold `{}` {} (observed {:?})",
                failed.threshold, failed.status, failed.observed
            );
        }
        info!(
            "Run {run_id} finished in {}: {} requests, {} failed, {}",
            humantime::format_duration(Duration::from_millis(elapsed.as_millis() as u64)),
            snapshot.requests(),
            snapshot.failures(),
            if verdict.passed { "passed" } else { "failed" }
        );

        RunSummary {
            run_id,
            started_at,
            elapsed,
            snapshot,
            verdict,
        }
    }
}

/// Periodically evaluate thresholds during the run and request an abort on the first failure.
async fn watch_thresholds(
    measurements: Arc<Measurements>,
    thresholds: Vec<Threshold>,
    every: Duration,
    abort: watch::Sender<bool>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // NOTE: First tick completes instantly
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let verdict = evaluate(&measurements.snapshot(), &thresholds);
        if let Some(failed) = verdict.first_failure() {
            warn!(
                "Threshold `{}` failed with {:?} while running, aborting",
                failed.threshold, failed.observed
            );
            let _ = abort.send(true);
            return;
        }
        trace!("Fail-fast check passed");
    }
}

/// Everything a finished run produced.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: OffsetDateTime,
    pub elapsed: Duration,
    pub snapshot: Snapshot,
    pub verdict: RunVerdict,
}

impl RunSummary {
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }

    pub fn report(&self) -> Report {
        Report::new(
            self.run_id,
            self.started_at,
            self.elapsed,
            &self.snapshot,
            &self.verdict,
        )
    }

    pub fn exit_code(&self) -> u8 {
        if self.passed() {
            EXIT_PASS
        } else {
            EXIT_FAIL
        }
    }
}
