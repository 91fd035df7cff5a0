use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;
use revalidator_cache::Config;

use crate::workloads::WorkloadsConfig;

mod logging;
mod stresstest;
mod workloads;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

/// Command line interface parser.
#[derive(Parser)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,

    /// Enable the sentry integration, sending envelopes nowhere.
    #[arg(long)]
    sentry: bool,

    /// Enable tracing machinery, writing JSON logs into the void.
    #[arg(long)]
    tracing: bool,

    /// Enable metrics, sending to a local UDP sink unless the config names a statsd host.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    if let Err(error) = execute() {
        revalidator_cache::logging::ensure_log_error(&error);
        std::process::exit(1);
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    let logging_config = logging::Config {
        backtraces: config.logging.enable_backtraces,
        sentry: cli.sentry,
        tracing: cli.tracing,
        metrics: cli.metrics,
        metrics_config: config.metrics.clone(),
    };
    // SAFETY: The runtime is not started yet, there is only a single thread.
    let guard = unsafe { logging::init(logging_config)? };
    if !cli.tracing {
        // SAFETY: See above, backtraces were already configured.
        unsafe { revalidator_cache::logging::init_logging(&config) };
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the tokio runtime")?;

    runtime.block_on(async move {
        if let Some(udp_sink) = guard.udp_sink {
            tokio::spawn(udp_sink);
        }

        stresstest::perform_stresstest(config.cache, workloads, cli.duration).await
    })
}
