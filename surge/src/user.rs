//! Virtual users: independent clients looping over a script.
use crate::client::HttpClient;
use crate::measurements::Measurements;
use governor::DefaultDirectRateLimiter;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use surge_core::{OperationResult, Outcome, PauseRange, RequestStep, Step};
use tokio::sync::watch;
use tokio::time::Instant;
#[allow(unused_imports)]
use tracing::{debug, error, trace, warn};

/// Receiving half of a virtual user's stop flag.
///
/// Stopping is advisory: the user checks the flag between steps and wakes early from pauses,
/// but a request that is already in flight always runs to completion.
#[derive(Clone, Debug)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn channel() -> (watch::Sender<bool>, StopSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, StopSignal { rx })
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop has been requested, or the sending half is gone.
    pub async fn stopped(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `false` when stopped.
    pub async fn sleep(&mut self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }

        let stopped = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.stopped() => true,
        };

        !stopped && !self.is_stopped()
    }
}

/// One simulated client executing a script until told to stop.
pub struct VirtualUser<C> {
    id: usize,
    client: Arc<C>,
    script: Arc<[Step]>,
    think_time: PauseRange,
    measurements: Arc<Measurements>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    stop: StopSignal,
    rng: SmallRng,
}

impl<C> VirtualUser<C>
where
    C: HttpClient + Sync + 'static,
{
    pub fn new(
        id: usize,
        client: Arc<C>,
        script: Arc<[Step]>,
        measurements: Arc<Measurements>,
        stop: StopSignal,
    ) -> Self {
        Self {
            id,
            client,
            script,
            think_time: PauseRange::default(),
            measurements,
            limiter: None,
            stop,
            rng: SmallRng::from_entropy(),
        }
    }

    pub fn think_time(mut self, think_time: PauseRange) -> Self {
        self.think_time = think_time;
        self
    }

    pub fn limiter(mut self, limiter: Option<Arc<DefaultDirectRateLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Loop over the script until stopped and return the number of completed iterations.
    pub async fn run(mut self, start_delay: Duration) -> u64 {
        let mut iterations = 0;

        if !self.stop.sleep(start_delay).await {
            return iterations;
        }
        trace!(user = self.id, "Virtual user started");

        let script = self.script.clone();
        'iterations: loop {
            for step in script.iter() {
                if self.stop.is_stopped() {
                    break 'iterations;
                }

                let proceed = match step {
                    Step::Request(request) => self.execute(request).await,
                    Step::Pause(range) => self.pause(*range).await,
                    Step::Think => self.pause(self.think_time).await,
                };

                if !proceed {
                    break 'iterations;
                }
            }

            iterations += 1;
            self.measurements.record_iteration();

            if !self.pause(self.think_time).await {
                break;
            }
        }

        trace!(user = self.id, iterations, "Virtual user stopped");
        iterations
    }

    /// Issue one request and record its result. Returns `false` if the user was stopped while
    /// waiting for the rate limiter, in which case nothing is sent.
    async fn execute(&mut self, request: &RequestStep) -> bool {
        if let Some(limiter) = &self.limiter {
            let stopped = tokio::select! {
                _ = limiter.until_ready() => false,
                _ = self.stop.stopped() => true,
            };
            if stopped {
                return false;
            }
        }

        let start = Instant::now();
        let res = self.client.execute(request).await;
        let latency = start.elapsed();

        let outcome = match res {
            Ok(status) => request.classify(status, latency),
            Err(kind) => Outcome::Transport(kind),
        };

        if outcome.is_failure() {
            debug!(
                user = self.id,
                operation = %request.name,
                "Request failed: {outcome:?} after {latency:?}"
            );
        }

        #[cfg(feature = "metrics")]
        emit_metrics(&request.name, &outcome, latency);

        self.measurements.record(&OperationResult::new(
            request.name.clone(),
            outcome,
            latency,
        ));

        true
    }

    async fn pause(&mut self, range: PauseRange) -> bool {
        if range.is_zero() {
            // Still yield so a user with no think time can't starve the worker thread.
            tokio::task::yield_now().await;
            return !self.stop.is_stopped();
        }
        let duration = self.rng.gen_range(range.min..=range.max);
        self.stop.sleep(duration).await
    }
}

#[cfg(feature = "metrics")]
fn emit_metrics(operation: &str, outcome: &Outcome, latency: Duration) {
    let operation = operation.to_string();
    metrics::histogram!("surge_request_duration_seconds", "operation" => operation.clone())
        .record(latency.as_secs_f64());

    if outcome.is_failure() {
        metrics::counter!("surge_request_failures_total", "operation" => operation).increment(1);
    } else {
        metrics::counter!("surge_request_success_total", "operation" => operation).increment(1);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use surge_core::TransportErrorKind;

    /// In-process stand-in for the target: answers every request with `status` after `delay`.
    pub(crate) struct MockClient {
        pub status: u16,
        pub delay: Duration,
        pub started: AtomicUsize,
        pub completed: AtomicUsize,
    }

    impl MockClient {
        pub fn new(status: u16, delay: Duration) -> Self {
            Self {
                status,
                delay,
                started: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            }
        }
    }

    impl HttpClient for MockClient {
        async fn execute(&self, _request: &RequestStep) -> Result<u16, TransportErrorKind> {
            self.started.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(self.status)
        }
    }

    struct FailingClient;

    impl HttpClient for FailingClient {
        async fn execute(&self, _request: &RequestStep) -> Result<u16, TransportErrorKind> {
            Err(TransportErrorKind::Timeout)
        }
    }

    fn one_request() -> Arc<[Step]> {
        vec![Step::Request(RequestStep::get("browse", "/products"))].into()
    }

    #[tokio::test(start_paused = true)]
    async fn records_each_step_in_order() {
        let client = Arc::new(MockClient::new(200, Duration::from_millis(10)));
        let measurements = Arc::new(Measurements::new());
        let (stop, signal) = StopSignal::channel();
        let script: Arc<[Step]> = surge_core::default_script().into();

        let user = VirtualUser::new(0, client.clone(), script, measurements.clone(), signal)
            .think_time(PauseRange::fixed(Duration::from_millis(100)));
        let handle = tokio::spawn(user.run(Duration::ZERO));

        // Each iteration: 3 x 10ms requests + 100ms think + 100ms between iterations
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        stop.send(true).unwrap();
        let iterations = handle.await.unwrap();

        let snap = measurements.snapshot();
        assert!(iterations >= 4, "{iterations}");
        assert_eq!(snap.iterations, iterations);
        let browse = snap.operation("browse").unwrap().requests;
        let checkout = snap.operation("checkout").unwrap().requests;
        assert!(browse >= iterations && browse <= iterations + 1);
        assert_eq!(checkout, iterations);
        assert_eq!(snap.failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_during_think_time_exits_before_next_iteration() {
        let client = Arc::new(MockClient::new(200, Duration::from_millis(50)));
        let measurements = Arc::new(Measurements::new());
        let (stop, signal) = StopSignal::channel();

        let user = VirtualUser::new(0, client.clone(), one_request(), measurements.clone(), signal)
            .think_time(PauseRange::fixed(Duration::from_secs(10)));
        let handle = tokio::spawn(user.run(Duration::ZERO));

        // First request done, now inside the 10s think time.
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stopped_at = Instant::now();
        stop.send(true).unwrap();
        let iterations = handle.await.unwrap();

        assert!(stopped_at.elapsed() < Duration::from_millis(10));
        assert_eq!(iterations, 1);
        assert_eq!(client.started.load(Ordering::SeqCst), 1);
        assert_eq!(measurements.snapshot().requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_never_interrupts_an_in_flight_request() {
        let client = Arc::new(MockClient::new(200, Duration::from_secs(5)));
        let measurements = Arc::new(Measurements::new());
        let (stop, signal) = StopSignal::channel();

        let user = VirtualUser::new(0, client.clone(), one_request(), measurements.clone(), signal)
            .think_time(PauseRange::fixed(Duration::ZERO));
        let handle = tokio::spawn(user.run(Duration::ZERO));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(client.started.load(Ordering::SeqCst), 1);
        assert_eq!(client.completed.load(Ordering::SeqCst), 0);

        let stopped_at = Instant::now();
        stop.send(true).unwrap();
        handle.await.unwrap();

        // The user waited out the remaining 4s of the request before exiting.
        assert!(stopped_at.elapsed() >= Duration::from_secs(4));
        assert_eq!(client.completed.load(Ordering::SeqCst), 1);
        assert_eq!(client.started.load(Ordering::SeqCst), 1);
        assert_eq!(measurements.snapshot().requests(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_before_start_delay_sends_nothing() {
        let client = Arc::new(MockClient::new(200, Duration::from_millis(1)));
        let measurements = Arc::new(Measurements::new());
        let (stop, signal) = StopSignal::channel();

        let user = VirtualUser::new(0, client.clone(), one_request(), measurements.clone(), signal);
        let handle = tokio::spawn(user.run(Duration::from_secs(1)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop.send(true).unwrap();

        assert_eq!(handle.await.unwrap(), 0);
        assert_eq!(client.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_bound_violation_is_a_failure() {
        let client = Arc::new(MockClient::new(200, Duration::from_millis(400)));
        let measurements = Arc::new(Measurements::new());
        let (stop, signal) = StopSignal::channel();
        let script: Arc<[Step]> = vec![Step::Request(
            RequestStep::get("view", "/product/1").max_latency(Duration::from_millis(300)),
        )]
        .into();

        let user = VirtualUser::new(0, client, script, measurements.clone(), signal)
            .think_time(PauseRange::fixed(Duration::from_secs(60)));
        let handle = tokio::spawn(user.run(Duration::ZERO));
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.send(true).unwrap();
        handle.await.unwrap();

        let snap = measurements.snapshot();
        assert_eq!(snap.requests(), 1);
        assert_eq!(snap.totals.failures.latency, 1);
        assert_eq!(snap.status_codes.get(&200), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_errors_are_recorded_and_the_user_continues() {
        let measurements = Arc::new(Measurements::new());
        let (stop, signal) = StopSignal::channel();

        let user = VirtualUser::new(0, Arc::new(FailingClient), one_request(), measurements.clone(), signal)
            .think_time(PauseRange::fixed(Duration::from_millis(100)));
        let handle = tokio::spawn(user.run(Duration::ZERO));
        tokio::time::sleep(Duration::from_millis(450)).await;
        stop.send(true).unwrap();
        let iterations = handle.await.unwrap();

        let snap = measurements.snapshot();
        assert_eq!(iterations, 5);
        assert_eq!(snap.failures(), 5);
        assert_eq!(snap.totals.failures.transport, 5);
        assert_eq!(snap.totals.failure_rate(), Some(1.));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_sender_stops_the_user() {
        let client = Arc::new(MockClient::new(200, Duration::from_millis(1)));
        let measurements = Arc::new(Measurements::new());
        let (stop, signal) = StopSignal::channel();

        let user = VirtualUser::new(0, client, one_request(), measurements, signal)
            .think_time(PauseRange::fixed(Duration::from_secs(30)));
        let handle = tokio::spawn(user.run(Duration::ZERO));
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(stop);

        assert_eq!(handle.await.unwrap(), 1);
    }
}
