//! Collection configuration resolved from the host runner's argument map,
//! with optional `perfscope.toml` defaults.

use serde::{Deserialize, Serialize};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// Argument keys understood by the collector. All optional.
pub const PER_RUN: &str = "per_run";
pub const TEST_OUTPUT_ROOT: &str = "test_output_root";
pub const SKIP_TEST_FAILURE_METRICS: &str = "skip_test_failure_metrics";
pub const SUBCOMMAND: &str = "subcommand";
pub const ARGUMENTS: &str = "arguments";
pub const PROCESSES: &str = "processes_to_record";
pub const EVENTS: &str = "events_to_record";
pub const REPORT: &str = "report";
pub const REPORT_SYMBOLS: &str = "symbols_to_report";
pub const TEST_ITERATIONS: &str = "test_iterations";
pub const RECORD: &str = "record";

pub const DEFAULT_OUTPUT_ROOT: &str = "/sdcard/test_results";
pub const DEFAULT_SUBCOMMAND: &str = "record";
pub const DEFAULT_ARGUMENTS: &str = "-g --post-unwind=yes -f 500 -a --exclude-perf";

/// Per-run collection settings. Resolved once at run start and read-only
/// thereafter; re-resolving from the raw argument map is the only way to
/// change it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct CollectionConfig {
    /// Collect one window for the whole run instead of one per test.
    pub collect_per_run: bool,
    /// Root directory for persisted recordings.
    pub output_root: PathBuf,
    /// Discard metrics for tests that failed.
    pub skip_test_failure_metrics: bool,
    /// Subcommand passed to the profiler on start.
    pub subcommand: String,
    /// Base arguments passed to the profiler on start.
    pub arguments: String,
    /// Process names restricted to during recording, resolved to pids at
    /// run start.
    pub processes: Vec<String>,
    /// Event names appended to the recording arguments.
    pub events: Vec<String>,
    /// Whether to reduce the recording into metrics after stopping.
    pub report: bool,
    /// Matching substring -> metric alias used when reducing reports.
    pub symbol_to_alias: BTreeMap<String, String>,
    /// Divisor applied to aggregated event counts. Always >= 1.
    pub test_iterations: u64,
    /// When false, the caller produced the recording externally; skip
    /// starting the tool and only copy/report.
    pub record: bool,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self::resolve(&BTreeMap::new())
    }
}

impl CollectionConfig {
    /// Resolve a config from the raw argument map, falling back to the
    /// documented defaults. Malformed values are tolerated with a warning,
    /// never an error.
    pub fn resolve(args: &BTreeMap<String, String>) -> Self {
        let get = |key: &str| args.get(key).map(String::as_str);

        let test_iterations = match get(TEST_ITERATIONS) {
            None => 1,
            Some(raw) => match raw.trim().parse::<i64>() {
                Ok(n) if n >= 1 => n as u64,
                Ok(n) => {
                    tracing::warn!("test_iterations {n} out of range, clamping to 1");
                    1
                }
                Err(err) => {
                    tracing::warn!("failed to parse test_iterations {raw:?}: {err}");
                    1
                }
            },
        };

        Self {
            collect_per_run: get(PER_RUN) == Some("true"),
            output_root: PathBuf::from(get(TEST_OUTPUT_ROOT).unwrap_or(DEFAULT_OUTPUT_ROOT)),
            skip_test_failure_metrics: get(SKIP_TEST_FAILURE_METRICS) == Some("true"),
            subcommand: get(SUBCOMMAND).unwrap_or(DEFAULT_SUBCOMMAND).to_string(),
            arguments: get(ARGUMENTS).unwrap_or(DEFAULT_ARGUMENTS).to_string(),
            processes: split_comma_list(get(PROCESSES).unwrap_or_default()),
            events: split_comma_list(get(EVENTS).unwrap_or_default()),
            report: get(REPORT) == Some("true"),
            symbol_to_alias: parse_symbol_table(get(REPORT_SYMBOLS).unwrap_or_default()),
            test_iterations,
            record: get(RECORD) != Some("false"),
        }
    }

    /// Compose the final argument string for the profiler: base arguments,
    /// then the event-selection flag, then the process-selection flag. The
    /// order matches what an operator would pass by hand.
    pub fn compose_arguments(&self, pids: &BTreeMap<String, String>) -> String {
        let mut arguments = self.arguments.clone();
        if !self.events.is_empty() {
            arguments.push_str(" -e ");
            arguments.push_str(&self.events.join(","));
        }
        if !pids.is_empty() {
            arguments.push_str(" -p ");
            let resolved: Vec<&str> = pids.values().map(String::as_str).collect();
            arguments.push_str(&resolved.join(","));
        }
        arguments
    }
}

/// Split a comma-separated list, ignoring surrounding whitespace and empty
/// entries.
fn split_comma_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse the `symbols_to_report` table: alternating `alias;substring` pairs.
/// The substring is keyed so the reducer can look up the alias for a matched
/// symbol. A trailing alias without a substring is dropped.
fn parse_symbol_table(raw: &str) -> BTreeMap<String, String> {
    let fields: Vec<&str> = raw.split(';').map(str::trim).collect();
    let mut table = BTreeMap::new();
    for pair in fields.chunks_exact(2) {
        if pair[0].is_empty() || pair[1].is_empty() {
            continue;
        }
        table.insert(pair[1].to_string(), pair[0].to_string());
    }
    table
}

/// `perfscope.toml` file: a `[collector]` table of string key/values merged
/// under the runtime argument map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub collector: BTreeMap<String, String>,
}

impl ConfigFile {
    pub fn load_optional(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(s) => match toml::from_str::<ConfigFile>(&s) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!("failed to parse config {}: {err}", path.display());
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(err) => {
                tracing::warn!("failed to read config {}: {err}", path.display());
                Self::default()
            }
        }
    }

    /// Start from the file's values and overlay the runtime arguments.
    pub fn merged_args(&self, args: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        let mut merged = self.collector.clone();
        for (key, value) in args {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }
}
