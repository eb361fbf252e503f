//! Surge is a staged-concurrency HTTP load generator.
//!
//! A run ramps a population of virtual users through a list of stages. Each user loops over a
//! declarative script of requests and pauses, every outcome is folded into a shared aggregator,
//! and at the end the aggregated metrics are checked against the configured thresholds.
//!
//! ```no_run
//! use surge::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), RunError> {
//!     let config = RunConfig::load("surge.json")?;
//!     let summary = LoadTest::connect(config).await?.run().await;
//!     summary
//!         .report()
//!         .emit(ReportFormat::Text, &mut std::io::stdout())
//!         .ok();
//!     std::process::exit(summary.exit_code().into());
//! }
//! ```
pub mod cli;
pub mod client;
pub mod histogram;
pub mod measurements;
pub mod report;
pub mod run;
pub mod scheduler;
pub mod thresholds;
pub mod user;

pub use surge_core as core;

pub use report::{Report, ReportFormat};
pub use run::{LoadTest, RunError, RunSummary, EXIT_CONFIG, EXIT_FAIL, EXIT_PASS};
pub use thresholds::{RunVerdict, ThresholdStatus, ThresholdVerdict};

pub mod prelude {
    pub use crate::client::HttpClient;
    pub use crate::report::{Report, ReportFormat};
    pub use crate::run::{LoadTest, RunError, RunSummary};
    pub use surge_core::{
        Comparator, Metric, PauseRange, RampMode, RequestStep, RunConfig, Stage, Step, Threshold,
    };
}
