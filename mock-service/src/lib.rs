//! Simulated shop backend used as a load target.
//!
//! Serves a product list, a slow product lookup and a checkout endpoint. Checkouts are counted in
//! a windowed overload counter: past a soft limit every checkout is delayed in proportion to the
//! excess, past a hard limit checkouts are rejected with `503`. A background task resets the
//! counter once per window.
use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
#[allow(unused)]
use metrics::{counter, gauge, histogram};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] io::Error),

    #[error("Invalid backend configuration: {0}")]
    Config(String),

    #[error("Server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Behaviour knobs. The defaults are illustrative, not tuned to any real system.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Base latency of `GET /product/:id`.
    pub product_delay: Duration,
    /// Standard deviation of normally distributed noise added to `product_delay`.
    pub product_jitter: Duration,
    /// Checkouts per window before they start slowing down.
    pub soft_limit: u64,
    /// Checkouts per window before they are rejected.
    pub hard_limit: u64,
    /// Extra delay per checkout above `soft_limit`.
    pub overload_step: Duration,
    pub max_overload_delay: Duration,
    /// How often the overload counter is reset.
    pub window: Duration,
    /// Fraction of checkouts rejected regardless of load.
    pub checkout_failure_ratio: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            product_delay: Duration::from_millis(200),
            product_jitter: Duration::ZERO,
            soft_limit: 50,
            hard_limit: 100,
            overload_step: Duration::from_millis(40),
            max_overload_delay: Duration::from_secs(2),
            window: Duration::from_secs(1),
            checkout_failure_ratio: 0.,
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), ServiceError> {
        if !(0. ..=1.).contains(&self.checkout_failure_ratio) {
            return Err(ServiceError::Config(format!(
                "checkout_failure_ratio {} is outside [0, 1]",
                self.checkout_failure_ratio
            )));
        }
        if self.soft_limit > self.hard_limit {
            return Err(ServiceError::Config(format!(
                "soft_limit {} is larger than hard_limit {}",
                self.soft_limit, self.hard_limit
            )));
        }
        if self.window.is_zero() {
            return Err(ServiceError::Config("window must be non-zero".to_string()));
        }
        Ok(())
    }

    /// What to do with the `count`th checkout of the current window.
    pub fn checkout_decision(&self, count: u64) -> CheckoutDecision {
        if count > self.hard_limit {
            CheckoutDecision::Reject
        } else if count > self.soft_limit {
            let excess = u32::try_from(count - self.soft_limit).unwrap_or(u32::MAX);
            let delay = self
                .overload_step
                .saturating_mul(excess)
                .min(self.max_overload_delay);
            CheckoutDecision::Delay(delay)
        } else {
            CheckoutDecision::Accept
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutDecision {
    Accept,
    Delay(Duration),
    Reject,
}

/// Checkouts seen in the current window.
#[derive(Debug, Default)]
pub struct OverloadCounter {
    count: AtomicU64,
}

impl OverloadCounter {
    /// Count one checkout and return the new total.
    pub fn hit(&self) -> u64 {
        self.count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Start a new window, returning the count of the one that ended.
    pub fn reset(&self) -> u64 {
        self.count.swap(0, Ordering::Relaxed)
    }
}

/// Background task resetting an [`OverloadCounter`] once per window.
pub struct ResetTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ResetTask {
    pub fn start(counter: Arc<OverloadCounter>, window: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(window);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // NOTE: First tick completes instantly
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let ended = counter.reset();
                        gauge!("mock_service.checkouts_per_window").set(ended as f64);
                        trace!("Overload window reset after {ended} checkouts");
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        Self { stop, handle }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            error!("Reset task failed: {err}");
        }
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<BackendConfig>,
    orders: Arc<OverloadCounter>,
}

#[derive(Serialize)]
struct Product {
    id: u64,
    name: &'static str,
}

#[derive(Serialize)]
struct ProductDetail {
    id: u64,
    name: &'static str,
    stock: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutRequest {
    #[allow(unused)]
    cart_id: u64,
}

#[derive(Serialize)]
struct CheckoutResponse {
    status: &'static str,
}

async fn products() -> Json<Vec<Product>> {
    counter!("mock_service.requests", "route" => "products").increment(1);
    Json(vec![
        Product {
            id: 1,
            name: "Gaming Mouse",
        },
        Product {
            id: 2,
            name: "Keyboard",
        },
    ])
}

async fn product(State(state): State<AppState>, Path(id): Path<u64>) -> Json<ProductDetail> {
    counter!("mock_service.requests", "route" => "product").increment(1);

    let delay = product_delay(&state.config);
    tokio::time::sleep(delay).await;

    Json(ProductDetail {
        id,
        name: "Gaming Mouse",
        stock: 100,
    })
}

fn product_delay(config: &BackendConfig) -> Duration {
    if config.product_jitter.is_zero() {
        return config.product_delay;
    }

    match Normal::new(0., config.product_jitter.as_secs_f64()) {
        Ok(noise) => {
            let secs = config.product_delay.as_secs_f64() + noise.sample(&mut rand::thread_rng());
            Duration::from_secs_f64(secs.max(0.))
        }
        Err(err) => {
            warn!("Ignoring product jitter: {err}");
            config.product_delay
        }
    }
}

async fn checkout(
    State(state): State<AppState>,
    Json(_order): Json<CheckoutRequest>,
) -> (StatusCode, Json<CheckoutResponse>) {
    counter!("mock_service.requests", "route" => "checkout").increment(1);

    let injected = state.config.checkout_failure_ratio > 0.
        && rand::thread_rng().gen_bool(state.config.checkout_failure_ratio);
    if injected {
        counter!("mock_service.checkout_rejected", "reason" => "injected").increment(1);
        return overloaded();
    }

    let count = state.orders.hit();
    match state.config.checkout_decision(count) {
        CheckoutDecision::Accept => {}
        CheckoutDecision::Delay(delay) => {
            debug!("Checkout {count} over soft limit, delaying {delay:?}");
            tokio::time::sleep(delay).await;
        }
        CheckoutDecision::Reject => {
            debug!("Checkout {count} over hard limit, rejecting");
            counter!("mock_service.checkout_rejected", "reason" => "overload").increment(1);
            return overloaded();
        }
    }

    (
        StatusCode::OK,
        Json(CheckoutResponse {
            status: "Order placed",
        }),
    )
}

fn overloaded() -> (StatusCode, Json<CheckoutResponse>) {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(CheckoutResponse {
            status: "Service overloaded",
        }),
    )
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/products", get(products))
        .route("/product/:id", get(product))
        .route("/checkout", post(checkout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// A running mock service. Dropping it without calling [`MockService::shutdown`] leaves the
/// server running until the runtime exits.
pub struct MockService {
    addr: SocketAddr,
    orders: Arc<OverloadCounter>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<Result<(), ServiceError>>,
    reset: ResetTask,
}

impl MockService {
    /// Serve on an already bound listener.
    pub async fn start(listener: TcpListener, config: BackendConfig) -> Result<Self, ServiceError> {
        config.validate()?;
        let addr = listener.local_addr()?;

        let orders = Arc::new(OverloadCounter::default());
        let reset = ResetTask::start(orders.clone(), config.window);
        let app = router(AppState {
            config: Arc::new(config),
            orders: orders.clone(),
        });

        let (shutdown, signal) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = signal.await;
                })
                .await?;
            Ok::<(), ServiceError>(())
        });

        info!("Mock service listening on {addr}");
        Ok(Self {
            addr,
            orders,
            shutdown,
            server,
            reset,
        })
    }

    pub async fn bind(addr: SocketAddr, config: BackendConfig) -> Result<Self, ServiceError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServiceError::Bind { addr, source })?;
        Self::start(listener, config).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Checkouts counted so far in the current window.
    pub fn orders(&self) -> u64 {
        self.orders.current()
    }

    pub async fn shutdown(self) -> Result<(), ServiceError> {
        let _ = self.shutdown.send(());
        let res = self.server.await?;
        self.reset.stop().await;
        info!("Mock service on {} stopped", self.addr);
        res
    }
}

/// Serve on `addr` until ctrl-c.
pub async fn run(addr: SocketAddr, config: BackendConfig) -> Result<(), ServiceError> {
    let service = MockService::bind(addr, config).await?;

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {err}");
    }

    service.shutdown().await
}
