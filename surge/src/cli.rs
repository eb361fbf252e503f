//! Command line surface of the `surge` binary. Every command resolves to a process exit code.
use crate::report::{Report, ReportFormat};
use crate::run::{LoadTest, EXIT_CONFIG, EXIT_PASS};
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::fs::File;
use std::io::{self, BufWriter, Write};
#[cfg(feature = "metrics")]
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use surge_core::RunConfig;
#[allow(unused)]
use tracing::{debug, error, info, trace, warn};

#[derive(Parser, Debug)]
#[command(name = "surge", version, about = "Staged-concurrency HTTP load generator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a load test and report the verdict through the exit code.
    Run(RunArgs),
    /// Parse and validate a config file without generating any traffic.
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the JSON run configuration.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Write the report here instead of stdout.
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = ReportFormat::Json)]
    pub format: ReportFormat,

    /// Serve Prometheus metrics on this address while the run is in progress.
    #[cfg(feature = "metrics")]
    #[arg(long)]
    pub prometheus: Option<SocketAddr>,
}

impl Cli {
    pub async fn execute(self) -> u8 {
        match self.command {
            Command::Run(args) => run(args).await,
            Command::Validate { config } => validate(&config),
        }
    }
}

pub fn validate(path: &Path) -> u8 {
    match RunConfig::load(path) {
        Ok(config) => {
            info!(
                "{} is valid: {} stages over {}, {} thresholds",
                path.display(),
                config.stages.len(),
                humantime::format_duration(config.total_duration()),
                config.thresholds.len()
            );
            EXIT_PASS
        }
        Err(err) => {
            error!("Invalid configuration {}: {err}", path.display());
            EXIT_CONFIG
        }
    }
}

pub async fn run(args: RunArgs) -> u8 {
    let config = match RunConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration {}: {err}", args.config.display());
            return EXIT_CONFIG;
        }
    };

    #[cfg(feature = "metrics")]
    if let Some(addr) = args.prometheus {
        use metrics_exporter_prometheus::PrometheusBuilder;

        if let Err(err) = PrometheusBuilder::new().with_http_listener(addr).install() {
            error!("Failed to start Prometheus exporter on {addr}: {err}");
            return EXIT_CONFIG;
        }
        info!("Serving Prometheus metrics on {addr}");
    }

    let test = match LoadTest::connect(config).await {
        Ok(test) => test,
        Err(err) => {
            error!("Setup failed: {err}");
            return EXIT_CONFIG;
        }
    };

    let summary = test.run().await;

    if let Err(err) = write_report(&summary.report(), args.format, args.out.as_deref()) {
        error!("{err:#}");
        return EXIT_CONFIG;
    }

    summary.exit_code()
}

fn write_report(report: &Report, format: ReportFormat, out: Option<&Path>) -> anyhow::Result<()> {
    match out {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to create report file {}", path.display()))?;
            let mut w = BufWriter::new(file);
            report
                .emit(format, &mut w)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            w.flush()?;
            info!("Report written to {}", path.display());
        }
        None => {
            let mut w = io::stdout().lock();
            report
                .emit(format, &mut w)
                .context("Failed to write report to stdout")?;
            w.flush()?;
        }
    }
    Ok(())
}
