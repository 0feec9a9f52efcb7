//! Collection lifecycle coordinator: brackets sampling windows around test
//! execution and hands recordings to the report reducer.
//!
//! Recordings land under
//! `<root>/<test_id>/SimpleperfCollector/simpleperf_<test_id>-<count>.data`
//! per test, or `<root>/SimpleperfCollector/simpleperf_<token>.data` for a
//! whole-run window.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use std::collections::BTreeMap;
use std::path::Path;

use crate::{profiler, report, CollectionConfig, Profiler};

/// Metric key under which the persisted recording path is reported.
pub const FILE_PATH_METRIC: &str = "simpleperf_file_path";
/// Filename prefix for persisted recordings.
pub const FILE_PREFIX: &str = "simpleperf_";
/// Directory component identifying this collector in output paths.
pub const COLLECTOR_NAME: &str = "SimpleperfCollector";

/// Identity of a test method as supplied by the host runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestDescription {
    pub class_name: String,
    pub method_name: String,
}

impl TestDescription {
    pub fn new(class_name: impl Into<String>, method_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            method_name: method_name.into(),
        }
    }

    /// `<class>_<method>`, used both as the invocation-counter key and in
    /// output filenames. Counter writes and filename reads must derive the
    /// identity the same way or lookups mismatch.
    pub fn file_name(&self) -> String {
        format!("{}_{}", self.class_name, self.method_name)
    }
}

/// Named string metrics handed back to the caller's result record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricRecord {
    metrics: BTreeMap<String, String>,
}

impl MetricRecord {
    pub fn add_string_metric(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.metrics.insert(key.into(), value.into());
    }

    pub fn metrics(&self) -> &BTreeMap<String, String> {
        &self.metrics
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Window-boundary events dispatched by the host runner, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestEvent<'a> {
    RunStart,
    TestStart { test: &'a TestDescription },
    TestFail { test: &'a TestDescription },
    TestEnd { test: &'a TestDescription },
    RunEnd,
}

/// Owns the sampling state machine. All events arrive sequentially on one
/// control thread; the profiler runs as a background OS process but is only
/// ever commanded synchronously from here.
pub struct SimpleperfCollector {
    args: BTreeMap<String, String>,
    profiler: Box<dyn Profiler>,
    config: CollectionConfig,
    /// Run-start snapshot of tracked processes.
    process_to_pid: BTreeMap<String, String>,
    /// Final argument string handed to the profiler on start.
    arguments: String,
    /// Per-test-identity invocation counts, so retried tests get distinct
    /// filenames.
    invocations: BTreeMap<String, u64>,
    start_success: bool,
    test_failed: bool,
}

impl SimpleperfCollector {
    pub fn new(args: BTreeMap<String, String>, profiler: Box<dyn Profiler>) -> Self {
        Self {
            args,
            profiler,
            config: CollectionConfig::default(),
            process_to_pid: BTreeMap::new(),
            arguments: String::new(),
            invocations: BTreeMap::new(),
            start_success: false,
            test_failed: false,
        }
    }

    /// Dispatch one lifecycle event. Failures on the profiling side channel
    /// are logged and absorbed; they never fail the test itself.
    pub fn on_event(&mut self, event: TestEvent<'_>, record: &mut MetricRecord) {
        match event {
            TestEvent::RunStart => self.on_run_start(),
            TestEvent::TestStart { test } => self.on_test_start(test),
            TestEvent::TestFail { .. } => self.test_failed = true,
            TestEvent::TestEnd { test } => self.on_test_end(test, record),
            TestEvent::RunEnd => self.on_run_end(record),
        }
    }

    pub fn config(&self) -> &CollectionConfig {
        &self.config
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    pub fn invocation_count(&self, test: &TestDescription) -> u64 {
        self.invocations.get(&test.file_name()).copied().unwrap_or(0)
    }

    fn on_run_start(&mut self) {
        self.config = CollectionConfig::resolve(&self.args);
        self.process_to_pid =
            profiler::resolve_pids(self.profiler.as_mut(), &self.config.processes);
        self.arguments = self.config.compose_arguments(&self.process_to_pid);
        tracing::info!(
            iterations = self.config.test_iterations,
            per_run = self.config.collect_per_run,
            "collection configured"
        );

        if !self.config.collect_per_run {
            return;
        }
        tracing::info!("starting sampling before the test run");
        self.start_sampling();
    }

    fn on_test_start(&mut self, test: &TestDescription) {
        self.test_failed = false;
        if self.config.collect_per_run {
            return;
        }
        *self.invocations.entry(test.file_name()).or_insert(0) += 1;
        tracing::info!("starting sampling before test {}", test.file_name());
        self.start_sampling();
    }

    fn on_test_end(&mut self, test: &TestDescription, record: &mut MetricRecord) {
        if self.config.collect_per_run {
            return;
        }
        if !self.start_success {
            tracing::info!("skipping stop attempt: sampling did not start successfully");
            return;
        }

        if self.config.skip_test_failure_metrics && self.test_failed {
            tracing::info!("skipping metric collection due to test failure");
            self.discard_session();
            return;
        }

        let file = test.file_name();
        let count = self.invocations.get(&file).copied().unwrap_or(0);
        let path = self
            .config
            .output_root
            .join(&file)
            .join(COLLECTOR_NAME)
            .join(format!("{FILE_PREFIX}{file}-{count}.data"));
        tracing::info!("stopping sampling after test {}", file);
        self.stop_sampling(&path, record);
        if self.config.report {
            self.report_metrics(&path, record);
        }
    }

    fn on_run_end(&mut self, record: &mut MetricRecord) {
        if !self.config.collect_per_run {
            return;
        }
        if !self.start_success {
            tracing::info!("skipping stop attempt: sampling did not start successfully");
            return;
        }

        // Unique token so repeated runs against the same root never collide.
        let token = Uuid::new_v4().simple().to_string();
        let path = self
            .config
            .output_root
            .join(COLLECTOR_NAME)
            .join(format!("{FILE_PREFIX}{token}.data"));
        tracing::info!("stopping sampling after the test run");
        self.stop_sampling(&path, record);
        if self.config.report {
            self.report_metrics(&path, record);
        }
    }

    fn start_sampling(&mut self) {
        self.start_success = !self.config.record
            || self
                .profiler
                .start(&self.config.subcommand, &self.arguments);
        if !self.start_success {
            tracing::error!("sampling did not start successfully");
        }
    }

    fn stop_sampling(&mut self, path: &Path, record: &mut MetricRecord) {
        let status = if self.config.record {
            self.profiler.stop(path)
        } else {
            self.profiler.copy_output(path)
        };
        if status {
            record.add_string_metric(FILE_PATH_METRIC, path.display().to_string());
        } else {
            tracing::error!("failed to collect the recording at {}", path.display());
        }
    }

    /// Stop the live session without persisting anything, so it cannot leak
    /// into the next window.
    fn discard_session(&mut self) {
        if !self.config.record {
            // Nothing was started; there is no session to drain.
            return;
        }
        let throwaway = std::env::temp_dir().join(format!(
            "{FILE_PREFIX}discard-{}.data",
            Uuid::new_v4().simple()
        ));
        if !self.profiler.stop(&throwaway) {
            tracing::error!("failed to stop the recording session");
        }
        if let Err(err) = std::fs::remove_file(&throwaway) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    "failed to remove discarded recording {}: {err}",
                    throwaway.display()
                );
            }
        }
    }

    fn report_metrics(&mut self, path: &Path, record: &mut MetricRecord) {
        for (process, pid) in self.process_to_pid.clone() {
            let metrics = report::reduce_recording(
                self.profiler.as_mut(),
                path,
                &process,
                &pid,
                &self.config.symbol_to_alias,
                self.config.test_iterations,
            );
            tracing::info!("reduced {} metrics for process {process}", metrics.len());
            for (key, value) in metrics {
                record.add_string_metric(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PerfscopeResult;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Start { subcommand: String, arguments: String },
        Stop { path: PathBuf },
        CopyOutput { path: PathBuf },
        ParseReport { pid: String },
    }

    /// Scripted profiler double that records every call.
    struct FakeProfiler {
        calls: Rc<RefCell<Vec<Call>>>,
        start_ok: bool,
        stop_ok: bool,
        report_text: String,
        pids: BTreeMap<String, String>,
    }

    impl FakeProfiler {
        fn new(calls: Rc<RefCell<Vec<Call>>>) -> Self {
            Self {
                calls,
                start_ok: true,
                stop_ok: true,
                report_text: String::new(),
                pids: BTreeMap::new(),
            }
        }
    }

    impl Profiler for FakeProfiler {
        fn start(&mut self, subcommand: &str, arguments: &str) -> bool {
            self.calls.borrow_mut().push(Call::Start {
                subcommand: subcommand.to_string(),
                arguments: arguments.to_string(),
            });
            self.start_ok
        }

        fn stop(&mut self, path: &Path) -> bool {
            self.calls.borrow_mut().push(Call::Stop {
                path: path.to_path_buf(),
            });
            self.stop_ok
        }

        fn copy_output(&mut self, path: &Path) -> bool {
            self.calls.borrow_mut().push(Call::CopyOutput {
                path: path.to_path_buf(),
            });
            true
        }

        fn parse_report(&mut self, _path: &Path, pid: &str) -> PerfscopeResult<String> {
            self.calls.borrow_mut().push(Call::ParseReport {
                pid: pid.to_string(),
            });
            Ok(self.report_text.clone())
        }

        fn pid_of(&mut self, process: &str) -> Option<String> {
            self.pids.get(process).cloned()
        }
    }

    fn args(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn collector(
        pairs: &[(&str, &str)],
        tweak: impl FnOnce(&mut FakeProfiler),
    ) -> (SimpleperfCollector, Rc<RefCell<Vec<Call>>>) {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let mut fake = FakeProfiler::new(Rc::clone(&calls));
        tweak(&mut fake);
        (
            SimpleperfCollector::new(args(pairs), Box::new(fake)),
            calls,
        )
    }

    fn test_desc(method: &str) -> TestDescription {
        TestDescription::new("com.example.ScrollTest", method)
    }

    fn stops(calls: &[Call]) -> Vec<PathBuf> {
        calls
            .iter()
            .filter_map(|c| match c {
                Call::Stop { path } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn per_test_window_produces_one_file_per_invocation() {
        let (mut collector, calls) =
            collector(&[("test_output_root", "/tmp/results")], |_| {});
        let test = test_desc("testScroll");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);

        for expected in 1..=3u64 {
            collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
            assert_eq!(collector.invocation_count(&test), expected);
            collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);
        }

        let stops = stops(&calls.borrow());
        assert_eq!(
            stops,
            vec![
                PathBuf::from(
                    "/tmp/results/com.example.ScrollTest_testScroll/SimpleperfCollector/simpleperf_com.example.ScrollTest_testScroll-1.data"
                ),
                PathBuf::from(
                    "/tmp/results/com.example.ScrollTest_testScroll/SimpleperfCollector/simpleperf_com.example.ScrollTest_testScroll-2.data"
                ),
                PathBuf::from(
                    "/tmp/results/com.example.ScrollTest_testScroll/SimpleperfCollector/simpleperf_com.example.ScrollTest_testScroll-3.data"
                ),
            ]
        );
        assert_eq!(
            record.metrics().get(FILE_PATH_METRIC).map(String::as_str),
            Some(
                "/tmp/results/com.example.ScrollTest_testScroll/SimpleperfCollector/simpleperf_com.example.ScrollTest_testScroll-3.data"
            )
        );
    }

    #[test]
    fn failed_start_suppresses_stop_and_report() {
        let (mut collector, calls) = collector(&[("report", "true")], |fake| {
            fake.start_ok = false;
        });
        let test = test_desc("testScroll");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);

        let calls = calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], Call::Start { .. }));
        assert!(record.is_empty());
    }

    #[test]
    fn invocation_count_increments_independent_of_outcome() {
        let (mut collector, _calls) = collector(&[], |_| {});
        let test = test_desc("testFlaky");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);

        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestFail { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);
        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);

        assert_eq!(collector.invocation_count(&test), 2);
    }

    #[test]
    fn skip_on_failure_drains_the_session_without_metrics() {
        let (mut collector, calls) = collector(
            &[("skip_test_failure_metrics", "true"), ("report", "true")],
            |_| {},
        );
        let test = test_desc("testScroll");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestFail { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);

        let calls = calls.borrow();
        // Stop still fires so the session cannot leak into the next test,
        // but nothing is reported or persisted under the output root.
        assert_eq!(calls.len(), 2);
        assert!(matches!(calls[0], Call::Start { .. }));
        let Call::Stop { path } = &calls[1] else {
            panic!("expected a stop call, got {:?}", calls[1]);
        };
        assert!(path.starts_with(std::env::temp_dir()));
        assert!(record.is_empty());
    }

    #[test]
    fn passing_test_keeps_metrics_when_skip_on_failure_is_set() {
        let (mut collector, _calls) =
            collector(&[("skip_test_failure_metrics", "true")], |_| {});
        let test = test_desc("testScroll");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);
        assert!(record.metrics().contains_key(FILE_PATH_METRIC));
    }

    #[test]
    fn failure_flag_resets_between_tests() {
        let (mut collector, _calls) =
            collector(&[("skip_test_failure_metrics", "true")], |_| {});
        let test = test_desc("testScroll");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestFail { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);
        assert!(record.is_empty());

        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);
        assert!(record.metrics().contains_key(FILE_PATH_METRIC));
    }

    #[test]
    fn per_run_window_spans_all_tests() {
        let (mut collector, calls) = collector(
            &[("per_run", "true"), ("test_output_root", "/tmp/results")],
            |_| {},
        );
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        for method in ["testA", "testB", "testC"] {
            let test = test_desc(method);
            collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
            collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);
        }
        collector.on_event(TestEvent::RunEnd, &mut record);

        let calls = calls.borrow();
        let starts = calls
            .iter()
            .filter(|c| matches!(c, Call::Start { .. }))
            .count();
        assert_eq!(starts, 1);
        let stops = stops(&calls);
        assert_eq!(stops.len(), 1);
        assert!(stops[0].starts_with("/tmp/results/SimpleperfCollector"));
        let name = stops[0]
            .file_name()
            .and_then(|s| s.to_str())
            .expect("file name");
        assert!(name.starts_with(FILE_PREFIX));
        assert!(name.ends_with(".data"));
    }

    #[test]
    fn per_run_failed_start_skips_run_end_work() {
        let (mut collector, calls) = collector(&[("per_run", "true")], |fake| {
            fake.start_ok = false;
        });
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::RunEnd, &mut record);
        assert_eq!(calls.borrow().len(), 1);
        assert!(record.is_empty());
    }

    #[test]
    fn repeated_run_starts_do_not_duplicate_flags() {
        let (mut collector, _calls) = collector(
            &[
                ("events_to_record", "cpu-cycles, instructions"),
                ("processes_to_record", "system_server"),
            ],
            |fake| {
                fake.pids
                    .insert("system_server".to_string(), "1234".to_string());
            },
        );
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::RunStart, &mut record);

        let arguments = collector.arguments();
        let events_at = arguments.find("-e cpu-cycles,instructions").expect("-e flag");
        let pids_at = arguments.find("-p 1234").expect("-p flag");
        assert!(events_at < pids_at);
        assert_eq!(arguments.matches(" -e ").count(), 1);
        assert_eq!(arguments.matches(" -p ").count(), 1);
    }

    #[test]
    fn record_disabled_copies_instead_of_stopping() {
        let (mut collector, calls) = collector(&[("record", "false")], |_| {});
        let test = test_desc("testScroll");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);

        let calls = calls.borrow();
        // No start call: the caller produced the recording externally.
        assert!(calls.iter().all(|c| !matches!(c, Call::Start { .. })));
        assert!(calls.iter().any(|c| matches!(c, Call::CopyOutput { .. })));
        assert!(record.metrics().contains_key(FILE_PATH_METRIC));
    }

    #[test]
    fn report_merges_metrics_per_tracked_process() {
        let report_text = "\
Event: instructions (type 0, config 1)
Samples: 3
Event count: 6

EventCount  Overhead  Symbol
6           100.00%   android::SurfaceFlinger::commit(int)
";
        let (mut collector, calls) = collector(
            &[
                ("report", "true"),
                ("processes_to_record", "surfaceflinger"),
                ("symbols_to_report", "commit;android::SurfaceFlinger::commit("),
                ("test_iterations", "2"),
                ("test_output_root", "/tmp/results"),
            ],
            |fake| {
                fake.pids
                    .insert("surfaceflinger".to_string(), "321".to_string());
                fake.report_text = report_text.to_string();
            },
        );
        let test = test_desc("testScroll");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);

        assert_eq!(
            record
                .metrics()
                .get("surfaceflinger_instructions_commit")
                .map(String::as_str),
            Some("3")
        );
        assert!(record.metrics().contains_key(FILE_PATH_METRIC));
        assert!(calls
            .borrow()
            .iter()
            .any(|c| matches!(c, Call::ParseReport { pid } if pid == "321")));
    }

    #[test]
    fn failed_stop_reports_no_file_path_metric() {
        let (mut collector, _calls) = collector(&[], |fake| {
            fake.stop_ok = false;
        });
        let test = test_desc("testScroll");
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        collector.on_event(TestEvent::TestStart { test: &test }, &mut record);
        collector.on_event(TestEvent::TestEnd { test: &test }, &mut record);
        assert!(record.is_empty());
    }

    #[test]
    fn run_start_resolves_configuration_without_starting_in_per_test_mode() {
        let (mut collector, calls) = collector(&[("test_iterations", "4")], |_| {});
        let mut record = MetricRecord::default();
        collector.on_event(TestEvent::RunStart, &mut record);
        assert_eq!(collector.config().test_iterations, 4);
        assert!(calls.borrow().is_empty());
    }
}
