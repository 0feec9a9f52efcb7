//! Perfscope CLI: drive a sampling window around a child command, or reduce
//! an existing recording into metrics.

mod cli_logger;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use cli_logger::CliLogger;
use perfscope::{
    CollectionConfig, ConfigFile, MetricRecord, SimpleperfCollector, SimpleperfProfiler,
    TestEvent, PER_RUN, REPORT_SYMBOLS, TEST_ITERATIONS,
};

#[derive(Debug, Parser)]
#[command(name = "perfscope", about = "Sampling-profiler instrumentation around test execution")]
struct Cli {
    /// Emit machine-readable JSON instead of pretty output.
    #[arg(long, global = true)]
    json: bool,

    /// Disable ANSI colors.
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Bracket a child command with one whole-run sampling window.
    Collect {
        /// Optional defaults file (`[collector]` table of string settings).
        #[arg(long, default_value = "perfscope.toml")]
        config: PathBuf,
        /// Collector settings, e.g. `-s report=true`.
        #[arg(short = 's', long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Command executed inside the window.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Reduce an existing recording into per-symbol metrics.
    Report {
        /// Recording file to reduce.
        #[arg(long)]
        input: PathBuf,
        /// Process name used in emitted metric keys.
        #[arg(long)]
        process: String,
        /// Pid whose samples are attributed.
        #[arg(long)]
        pid: String,
        /// Alternating `alias;substring` pairs.
        #[arg(long, default_value = "")]
        symbols: String,
        /// Divisor applied to aggregated event counts.
        #[arg(long, default_value_t = 1)]
        iterations: u64,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ExitStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunSummary {
    status: ExitStatus,
    started_at: String,
    duration_ms: u64,
    metrics: BTreeMap<String, String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let logger = CliLogger::new(cli.json, cli.no_color);
    if let Err(err) = run(&cli.command, &logger) {
        logger.print_error(&format!("{err:#}"));
        std::process::exit(1);
    }
}

fn run(command: &Command, logger: &CliLogger) -> Result<()> {
    match command {
        Command::Collect {
            config,
            set,
            command,
        } => collect(config, set, command, logger),
        Command::Report {
            input,
            process,
            pid,
            symbols,
            iterations,
        } => report(input, process, pid, symbols, *iterations, logger),
    }
}

fn collect(
    config: &Path,
    set: &[String],
    command: &[String],
    logger: &CliLogger,
) -> Result<()> {
    let mut args = BTreeMap::new();
    for pair in set {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("invalid setting {pair:?} (expected KEY=VALUE)");
        };
        args.insert(key.to_string(), value.to_string());
    }
    let mut args = ConfigFile::load_optional(config).merged_args(&args);
    // The child command is the run; the window always spans all of it.
    args.insert(PER_RUN.to_string(), "true".to_string());

    let mut collector =
        SimpleperfCollector::new(args, Box::new(SimpleperfProfiler::default()));
    let mut record = MetricRecord::default();
    let started_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    let started = Instant::now();

    collector.on_event(TestEvent::RunStart, &mut record);

    let (program, rest) = command
        .split_first()
        .context("no command given to collect around")?;
    let status = std::process::Command::new(program)
        .args(rest)
        .status()
        .with_context(|| format!("failed to run {program}"))?;

    collector.on_event(TestEvent::RunEnd, &mut record);

    let summary = RunSummary {
        status: if status.success() {
            ExitStatus::Pass
        } else {
            ExitStatus::Fail
        },
        started_at,
        duration_ms: started.elapsed().as_millis() as u64,
        metrics: record.metrics().clone(),
    };
    logger.print_serialized(&summary)?;
    if !status.success() {
        std::process::exit(status.code().unwrap_or(1));
    }
    Ok(())
}

fn report(
    input: &Path,
    process: &str,
    pid: &str,
    symbols: &str,
    iterations: u64,
    logger: &CliLogger,
) -> Result<()> {
    let args = BTreeMap::from([
        (REPORT_SYMBOLS.to_string(), symbols.to_string()),
        (TEST_ITERATIONS.to_string(), iterations.to_string()),
    ]);
    let config = CollectionConfig::resolve(&args);
    let mut profiler = SimpleperfProfiler::default();
    let metrics = perfscope::reduce_recording(
        &mut profiler,
        input,
        process,
        pid,
        &config.symbol_to_alias,
        config.test_iterations,
    );
    logger.print_serialized(&metrics)?;
    Ok(())
}
