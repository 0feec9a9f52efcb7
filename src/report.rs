//! Report reduction: turn the profiler's report text into named
//! per-process, per-symbol event-count metrics.

use std::collections::BTreeMap;
use std::path::Path;

use crate::Profiler;

/// Reduce the recording at `path` to metrics for one tracked process.
///
/// Event counts are summed per symbol-table entry whose substring matches a
/// sampled symbol, then divided by `iterations` (integer division; the
/// divisor is clamped to at least 1). Keys are
/// `<process>_<event>_<alias>`. Any failure to render or parse the report
/// yields an empty map so metric collection for other processes continues.
pub fn reduce_recording(
    profiler: &mut dyn Profiler,
    path: &Path,
    process: &str,
    pid: &str,
    symbol_to_alias: &BTreeMap<String, String>,
    iterations: u64,
) -> BTreeMap<String, String> {
    let raw = match profiler.parse_report(path, pid) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!(
                "failed to render report for {process} (pid {pid}) from {}: {err}",
                path.display()
            );
            return BTreeMap::new();
        }
    };
    reduce_report_text(&raw, process, symbol_to_alias, iterations)
}

/// Pure reduction over already-rendered report text. Deterministic for a
/// given input, so repeated calls yield identical maps.
pub fn reduce_report_text(
    raw: &str,
    process: &str,
    symbol_to_alias: &BTreeMap<String, String>,
    iterations: u64,
) -> BTreeMap<String, String> {
    let iterations = iterations.max(1);
    let mut totals: BTreeMap<(String, String), u64> = BTreeMap::new();
    let mut event = String::new();
    let mut in_table = false;

    for line in raw.lines() {
        let line = line.trim_end();
        if let Some(rest) = line.strip_prefix("Event:") {
            // "Event: cpu-cycles (type 0, config 0)" -> "cpu-cycles"
            event = rest
                .trim_start()
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string();
            in_table = false;
            continue;
        }
        if line.starts_with("EventCount") {
            in_table = true;
            continue;
        }
        if line.is_empty() {
            in_table = false;
            continue;
        }
        if !in_table {
            continue;
        }

        let columns: Vec<&str> = line.split_whitespace().collect();
        if columns.len() < 3 {
            tracing::warn!("skipping malformed report row: {line:?}");
            continue;
        }
        let Ok(count) = columns[0].replace(',', "").parse::<u64>() else {
            tracing::warn!("skipping report row with bad event count: {line:?}");
            continue;
        };
        let symbol = columns[2..].join(" ");
        for (substring, alias) in symbol_to_alias {
            if symbol.contains(substring.as_str()) {
                let key = (event.clone(), alias.clone());
                *totals.entry(key).or_insert(0) += count;
            }
        }
    }

    totals
        .into_iter()
        .map(|((event, alias), total)| {
            (
                format!("{process}_{event}_{alias}"),
                (total / iterations).to_string(),
            )
        })
        .collect()
}
