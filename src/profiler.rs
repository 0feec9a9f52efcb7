//! Profiler process control: a narrow capability trait plus the real
//! simpleperf shell driver.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use crate::{fsutil, PerfscopeError, PerfscopeResult};

/// Everything the lifecycle coordinator and report reducer need from the
/// external sampling tool. Kept narrow so both can be exercised against a
/// fake without spawning processes.
pub trait Profiler {
    /// Kick off sampling in the background. `true` means the command was
    /// accepted, not that useful data will be produced.
    fn start(&mut self, subcommand: &str, arguments: &str) -> bool;

    /// Stop sampling and persist the recording at `path`. `false` on any
    /// failure; a file exists at `path` only on success.
    fn stop(&mut self, path: &Path) -> bool;

    /// Relocate an externally produced recording to `path` without touching
    /// any profiler process.
    fn copy_output(&mut self, path: &Path) -> bool;

    /// Render the recording at `path` as report text restricted to `pid`.
    fn parse_report(&mut self, path: &Path, pid: &str) -> PerfscopeResult<String>;

    /// Resolve a process name to its pid, if the process is running.
    fn pid_of(&mut self, process: &str) -> Option<String>;
}

/// Drives the `simpleperf` binary through shell commands. Recordings are
/// staged in a scratch file and relocated on stop.
#[derive(Debug)]
pub struct SimpleperfProfiler {
    binary: String,
    scratch_file: PathBuf,
    child: Option<Child>,
}

impl Default for SimpleperfProfiler {
    fn default() -> Self {
        Self::new("simpleperf", PathBuf::from("/data/local/tmp/perf.data"))
    }
}

impl SimpleperfProfiler {
    pub fn new(binary: impl Into<String>, scratch_file: PathBuf) -> Self {
        Self {
            binary: binary.into(),
            scratch_file,
            child: None,
        }
    }

    fn interrupt_and_wait(&mut self) -> PerfscopeResult<()> {
        let Some(mut child) = self.child.take() else {
            return Err(PerfscopeError::Profiler(
                "no recording session in progress".to_string(),
            ));
        };
        // SIGINT makes simpleperf flush its output file before exiting.
        let status = Command::new("kill")
            .arg("-INT")
            .arg(child.id().to_string())
            .status()?;
        if !status.success() {
            // The session may have exited on its own; still reap it.
            tracing::warn!("kill -INT exited with {status}");
        }
        child.wait()?;
        Ok(())
    }
}

impl Profiler for SimpleperfProfiler {
    fn start(&mut self, subcommand: &str, arguments: &str) -> bool {
        if self.child.is_some() {
            tracing::error!("refusing to start: a recording session is already in progress");
            return false;
        }
        let spawned = Command::new(&self.binary)
            .arg(subcommand)
            .args(arguments.split_whitespace())
            .arg("-o")
            .arg(&self.scratch_file)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        match spawned {
            Ok(child) => {
                tracing::info!(pid = child.id(), "started {} {subcommand}", self.binary);
                self.child = Some(child);
                true
            }
            Err(err) => {
                tracing::error!("failed to start {}: {err}", self.binary);
                false
            }
        }
    }

    fn stop(&mut self, path: &Path) -> bool {
        if let Err(err) = self.interrupt_and_wait() {
            tracing::error!("failed to stop recording session: {err}");
            return false;
        }
        match fsutil::move_file(&self.scratch_file, path) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!("failed to relocate recording to {}: {err}", path.display());
                false
            }
        }
    }

    fn copy_output(&mut self, path: &Path) -> bool {
        let copied = fsutil::ensure_parent_dir(path)
            .and_then(|()| std::fs::copy(&self.scratch_file, path).map_err(Into::into));
        match copied {
            Ok(_) => true,
            Err(err) => {
                tracing::error!("failed to copy recording to {}: {err}", path.display());
                false
            }
        }
    }

    fn parse_report(&mut self, path: &Path, pid: &str) -> PerfscopeResult<String> {
        let output = Command::new(&self.binary)
            .arg("report")
            .arg("-i")
            .arg(path)
            .args(["--pids", pid, "--sort", "symbol", "--print-event-count"])
            .output()?;
        if !output.status.success() {
            return Err(PerfscopeError::Report(format!(
                "{} report exited with {}: {}",
                self.binary,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn pid_of(&mut self, process: &str) -> Option<String> {
        let output = match Command::new("pidof").arg(process).output() {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!("pidof {process} failed to run: {err}");
                return None;
            }
        };
        if !output.status.success() {
            tracing::warn!("no pid found for process {process}");
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.split_whitespace().next().map(str::to_string)
    }
}

/// A run-start snapshot of the processes restricted to during recording.
/// Pid changes after resolution (e.g. a process restart) are not detected.
pub fn resolve_pids(
    profiler: &mut dyn Profiler,
    processes: &[String],
) -> BTreeMap<String, String> {
    let mut process_to_pid = BTreeMap::new();
    for process in processes {
        match profiler.pid_of(process) {
            Some(pid) => {
                process_to_pid.insert(process.clone(), pid);
            }
            None => tracing::warn!("skipping process {process}: pid not resolved"),
        }
    }
    process_to_pid
}
