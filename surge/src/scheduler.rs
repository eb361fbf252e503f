//! Drives the number of active virtual users through the configured stages.
use crate::user::StopSignal;
use futures_util::future::join_all;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surge_core::{RampMode, Stage, DEFAULT_START_JITTER, DEFAULT_TICK};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
#[allow(unused)]
use tracing::{debug, error, info, instrument, trace, warn};

/// Everything a freshly scheduled virtual user needs from the scheduler.
#[derive(Debug)]
pub struct UserContext {
    pub id: usize,
    pub stop: StopSignal,
    /// Random delay to wait before the first request.
    pub start_delay: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Completed,
    Aborted,
}

/// Shared view of how many users the scheduler is running.
#[derive(Clone, Debug, Default)]
pub struct UserGauge {
    active: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl UserGauge {
    /// Users currently scheduled, i.e. spawned and not yet told to stop.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// User tasks that have not exited yet, including ones finishing their last request.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

struct LiveGuard(Arc<AtomicUsize>);

impl LiveGuard {
    fn new(live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::Relaxed);
        Self(live)
    }
}

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

enum StageEvent {
    Tick,
    End,
    Abort,
}

struct UserHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Stage scheduler.
///
/// Every tick the scheduler computes the target concurrency for the current point in the stage
/// and spawns or retires users to match it. Retired users are signalled, never aborted, and the
/// scheduler waits for all of them to exit before starting the next stage.
pub struct StageScheduler<T> {
    factory: T,
    stages: Arc<[Stage]>,
    ramp: RampMode,
    tick: Duration,
    start_jitter: Duration,
    users: Vec<UserHandle>,
    draining: Vec<JoinHandle<()>>,
    next_id: usize,
    gauge: UserGauge,
    abort: Option<watch::Receiver<bool>>,
    rng: SmallRng,
}

impl<T, F> StageScheduler<T>
where
    T: Fn(UserContext) -> F + Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    pub fn new(stages: impl Into<Arc<[Stage]>>, factory: T) -> Self {
        Self {
            factory,
            stages: stages.into(),
            ramp: RampMode::default(),
            tick: DEFAULT_TICK,
            start_jitter: DEFAULT_START_JITTER,
            users: vec![],
            draining: vec![],
            next_id: 0,
            gauge: UserGauge::default(),
            abort: None,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn ramp(mut self, ramp: RampMode) -> Self {
        self.ramp = ramp;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn start_jitter(mut self, start_jitter: Duration) -> Self {
        self.start_jitter = start_jitter;
        self
    }

    /// Stop the schedule early once `abort` flips to `true`.
    pub fn abort_on(mut self, abort: watch::Receiver<bool>) -> Self {
        self.abort = Some(abort);
        self
    }

    pub fn gauge(&self) -> UserGauge {
        self.gauge.clone()
    }

    #[instrument(name = "scheduler", skip_all, fields(stages = self.stages.len()))]
    pub async fn run(mut self) -> ScheduleOutcome {
        let stages = self.stages.clone();
        let mut previous = 0;

        for (idx, stage) in stages.iter().enumerate() {
            info!(
                "Stage {idx}: {previous} -> {} users over {}",
                stage.target,
                humantime::format_duration(stage.duration)
            );

            let aborted = self.run_stage(previous, stage).await;
            if aborted {
                warn!("Aborting schedule during stage {idx}");
                self.set_concurrency(0);
                self.drain().await;
                return ScheduleOutcome::Aborted;
            }

            self.drain().await;
            previous = stage.target;
        }

        self.set_concurrency(0);
        self.drain().await;
        debug!("Schedule completed");

        ScheduleOutcome::Completed
    }

    /// Returns `true` if the schedule was aborted part way through the stage.
    async fn run_stage(&mut self, from: usize, stage: &Stage) -> bool {
        let start = Instant::now();
        // `sleep` saturates durations past the end of the clock.
        let end = sleep(stage.duration);
        tokio::pin!(end);

        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                biased;
                _ = wait_for_abort(&mut self.abort) => StageEvent::Abort,
                _ = &mut end => StageEvent::End,
                _ = ticker.tick() => StageEvent::Tick,
            };

            match event {
                StageEvent::Abort => return true,
                StageEvent::End => {
                    self.set_concurrency(stage.target);
                    return false;
                }
                StageEvent::Tick => {
                    let target = match self.ramp {
                        RampMode::Linear => {
                            ramp_target(from, stage.target, start.elapsed(), stage.duration)
                        }
                        RampMode::Step => stage.target,
                    };
                    self.set_concurrency(target);
                }
            }
        }
    }

    fn set_concurrency(&mut self, concurrency: usize) {
        let current = self.users.len();
        if current == concurrency {
            return;
        } else if current > concurrency {
            // Newest users retire first.
            for user in self.users.drain(concurrency..).rev() {
                let _ = user.stop.send(true);
                self.draining.push(user.task);
            }
        } else {
            while self.users.len() < concurrency {
                self.spawn_user();
            }
        }

        trace!("Concurrency {current} -> {concurrency}");
        self.gauge.active.store(self.users.len(), Ordering::Relaxed);

        #[cfg(feature = "metrics")]
        metrics::gauge!("surge_active_users").set(self.users.len() as f64);
    }

    fn spawn_user(&mut self) {
        let id = self.next_id;
        self.next_id += 1;

        let start_delay = if self.start_jitter.is_zero() {
            Duration::ZERO
        } else {
            self.rng.gen_range(Duration::ZERO..=self.start_jitter)
        };

        let (stop_tx, stop) = StopSignal::channel();
        let user = (self.factory)(UserContext {
            id,
            stop,
            start_delay,
        });

        let live = LiveGuard::new(self.gauge.live.clone());
        let task = tokio::spawn(async move {
            let _live = live;
            user.await;
        });

        self.users.push(UserHandle {
            stop: stop_tx,
            task,
        });
    }

    /// Wait for every retired user to exit.
    async fn drain(&mut self) {
        let tasks = std::mem::take(&mut self.draining);
        if tasks.is_empty() {
            return;
        }

        trace!("Waiting on {} retiring users", tasks.len());
        for res in join_all(tasks).await {
            if let Err(err) = res {
                error!("Virtual user task failed: {err}");
            }
        }
    }
}

async fn wait_for_abort(abort: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = abort {
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Nobody can request an abort anymore.
                break;
            }
        }
    }
    std::future::pending::<()>().await
}

/// Target concurrency `elapsed` into a linear ramp from `from` to `to`.
pub(crate) fn ramp_target(from: usize, to: usize, elapsed: Duration, duration: Duration) -> usize {
    if duration.is_zero() || elapsed >= duration {
        return to;
    }

    let progress = elapsed.as_secs_f64() / duration.as_secs_f64();
    let value = from as f64 + (to as f64 - from as f64) * progress;
    (value.round() as usize).clamp(from.min(to), from.max(to))
}
