use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use mock_service::BackendConfig;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Simulated shop backend with a checkout overload failure mode.
#[derive(Parser, Debug)]
#[command(name = "mock-service", version)]
struct Args {
    #[arg(short, long, default_value_t = 3000)]
    port: u16,

    #[arg(long, default_value = "200ms", value_parser = humantime::parse_duration)]
    product_delay: Duration,

    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    product_jitter: Duration,

    #[arg(long, default_value_t = 50)]
    soft_limit: u64,

    #[arg(long, default_value_t = 100)]
    hard_limit: u64,

    #[arg(long, default_value = "1s", value_parser = humantime::parse_duration)]
    window: Duration,

    #[arg(long, default_value_t = 0.)]
    checkout_failure_ratio: f64,

    /// Serve Prometheus metrics on this port.
    #[arg(long)]
    metrics_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("mock_service=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();

    if let Some(port) = args.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
            .install()?;
    }

    let config = BackendConfig {
        product_delay: args.product_delay,
        product_jitter: args.product_jitter,
        soft_limit: args.soft_limit,
        hard_limit: args.hard_limit,
        window: args.window,
        checkout_failure_ratio: args.checkout_failure_ratio,
        ..Default::default()
    };

    mock_service::run(SocketAddr::from(([0, 0, 0, 0], args.port)), config).await?;
    Ok(())
}
