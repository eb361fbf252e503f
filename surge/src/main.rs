use clap::Parser;
use std::io;
use std::process::ExitCode;
use surge::cli::Cli;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> ExitCode {
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("surge=info")),
        )
        .with_writer(io::stderr)
        .init();

    let code = Cli::parse().execute().await;
    ExitCode::from(code)
}
