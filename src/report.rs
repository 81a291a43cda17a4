//! Test reporting and output generation.
//!
//! Reporters receive every chunk's final results as soon as its retries are
//! done, then the aggregated [`RunResult`] once all devices finished.
//!
//! | Reporter | Output |
//! |----------|--------|
//! | [`ConsoleReporter`] | Coloured per-test lines and a summary on stdout |
//! | [`CiResultReporter`] | Plain-text list of failed tests for CI scripts |
//! | [`JsonReporter`] | Machine-readable `summary.json` |
//! | [`MultiReporter`] | Fans out to any number of the above |

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::device::DeviceInfo;
use crate::instrumentation::TestStatus;
use crate::orchestrator::RunResult;
use crate::session::DeviceTestResult;

/// Written when no test failed.
pub const ALL_TESTS_PASSED: &str = "All Tests Passed!";
/// Suffix of the failure count line.
pub const FAILED_TESTS: &str = "Failed Tests";

/// A test reporter receives events during a run.
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Called when a chunk has its final results on `device`.
    async fn on_chunk_complete(&self, device: &DeviceInfo, results: &[DeviceTestResult]);

    /// Called when every device session has finished.
    async fn on_run_complete(&self, result: &RunResult);
}

/// A reporter that does nothing.
pub struct NullReporter;

#[async_trait]
impl Reporter for NullReporter {
    async fn on_chunk_complete(&self, _device: &DeviceInfo, _results: &[DeviceTestResult]) {}
    async fn on_run_complete(&self, _result: &RunResult) {}
}

/// A reporter that combines multiple reporters.
pub struct MultiReporter {
    reporters: Vec<Box<dyn Reporter>>,
}

impl MultiReporter {
    pub fn new() -> Self {
        Self {
            reporters: Vec::new(),
        }
    }

    pub fn with_reporter<R: Reporter + 'static>(mut self, reporter: R) -> Self {
        self.reporters.push(Box::new(reporter));
        self
    }
}

impl Default for MultiReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reporter for MultiReporter {
    async fn on_chunk_complete(&self, device: &DeviceInfo, results: &[DeviceTestResult]) {
        for reporter in &self.reporters {
            reporter.on_chunk_complete(device, results).await;
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        for reporter in &self.reporters {
            reporter.on_run_complete(result).await;
        }
    }
}

/// Console reporter. Failures are always printed, passes and ignores only
/// when verbose.
pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

#[async_trait]
impl Reporter for ConsoleReporter {
    async fn on_chunk_complete(&self, device: &DeviceInfo, results: &[DeviceTestResult]) {
        for result in results {
            let status = match result.status {
                TestStatus::Passed => console::style("PASS").green(),
                TestStatus::Ignored { .. } => console::style("SKIP").yellow(),
                TestStatus::Failed { .. } => console::style("FAIL").red(),
            };
            if self.verbose || result.status.is_failed() {
                println!(
                    "{} [{}] {} {}",
                    status,
                    device.serial,
                    result.details,
                    console::style(format!("({})", format_duration(result.duration))).dim()
                );
            }
        }
    }

    async fn on_run_complete(&self, result: &RunResult) {
        println!();
        println!("Test Results:");
        for session in &result.sessions {
            println!(
                "  {} {}: {} passed, {} ignored, {} failed in {}",
                session.device.serial,
                console::style(&session.device.model).dim(),
                session.passed,
                session.ignored,
                session.failed,
                format_duration(session.duration())
            );
        }
        println!("  Passed:  {}", console::style(result.passed).green());
        println!("  Failed:  {}", console::style(result.failed).red());
        println!("  Ignored: {}", console::style(result.ignored).yellow());

        if result.not_run > 0 {
            println!("  Not Run: {}", console::style(result.not_run).red().bold());
        }

        println!("  Duration: {}", format_duration(result.duration));

        if result.success() {
            println!();
            println!("{}", console::style("All tests passed!").green().bold());
            return;
        }

        println!();
        if result.timed_out {
            println!("{}", console::style("Run deadline exceeded.").red().bold());
        } else if result.passed == 0 && result.failed == 0 {
            println!("{}", console::style("No tests were run.").red().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }

        if result.failed > 0 {
            println!();
            println!("Failed tests:");
            for r in result.failed_tests() {
                println!("  - {} on {}", r.details, r.device.serial);
                if let TestStatus::Failed { stacktrace } = &r.status
                    && let Some(first) = stacktrace.lines().next()
                {
                    println!("    {}", console::style(first).dim());
                }
                println!("    {}", console::style(r.log_file.display()).dim());
            }
        }
    }
}

/// Writes the CI result file.
///
/// One `#<class>##<method>` line per failed result followed by
/// `<n> Failed Tests`, or a single `All Tests Passed!` line.
pub struct CiResultReporter {
    path: PathBuf,
}

impl CiResultReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Renders the result file for `result`.
    pub fn render(result: &RunResult) -> String {
        let failed: Vec<_> = result.failed_tests().collect();
        if failed.is_empty() {
            return format!("{ALL_TESTS_PASSED}\n");
        }
        let mut out = String::new();
        for r in &failed {
            out.push_str(&format!("#{}##{}\n", r.details.class, r.details.method));
        }
        out.push_str(&format!("{} {}\n", failed.len(), FAILED_TESTS));
        out
    }
}

#[async_trait]
impl Reporter for CiResultReporter {
    async fn on_chunk_complete(&self, _device: &DeviceInfo, _results: &[DeviceTestResult]) {}

    async fn on_run_complete(&self, result: &RunResult) {
        match write_file(&self.path, Self::render(result)).await {
            Ok(()) => info!("CI result written to {}", self.path.display()),
            Err(e) => error!("Failed to write CI result {}: {}", self.path.display(), e),
        }
    }
}

#[derive(Serialize)]
struct RunSummary<'a> {
    passed: usize,
    failed: usize,
    ignored: usize,
    not_run: usize,
    timed_out: bool,
    duration_ms: u128,
    devices: Vec<DeviceSummary<'a>>,
}

#[derive(Serialize)]
struct DeviceSummary<'a> {
    serial: &'a str,
    model: &'a str,
    passed: usize,
    ignored: usize,
    failed: usize,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    log_file: &'a Path,
    tests: Vec<TestSummary<'a>>,
}

#[derive(Serialize)]
struct TestSummary<'a> {
    class: &'a str,
    method: &'a str,
    #[serde(flatten)]
    status: &'a TestStatus,
    duration_ms: u128,
    log_file: &'a Path,
}

impl<'a> RunSummary<'a> {
    fn new(result: &'a RunResult) -> Self {
        Self {
            passed: result.passed,
            failed: result.failed,
            ignored: result.ignored,
            not_run: result.not_run,
            timed_out: result.timed_out,
            duration_ms: result.duration.as_millis(),
            devices: result
                .sessions
                .iter()
                .map(|s| DeviceSummary {
                    serial: &s.device.serial,
                    model: &s.device.model,
                    passed: s.passed,
                    ignored: s.ignored,
                    failed: s.failed,
                    started_at: s.started_at,
                    finished_at: s.finished_at,
                    log_file: &s.log_file,
                    tests: s
                        .results
                        .iter()
                        .map(|r| TestSummary {
                            class: &r.details.class,
                            method: &r.details.method,
                            status: &r.status,
                            duration_ms: r.duration.as_millis(),
                            log_file: &r.log_file,
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Writes `summary.json` with per-device and per-test results.
pub struct JsonReporter {
    path: PathBuf,
}

impl JsonReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn on_chunk_complete(&self, _device: &DeviceInfo, _results: &[DeviceTestResult]) {}

    async fn on_run_complete(&self, result: &RunResult) {
        let json = match serde_json::to_string_pretty(&RunSummary::new(result)) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize run summary: {}", e);
                return;
            }
        };
        match write_file(&self.path, json).await {
            Ok(()) => info!("Summary written to {}", self.path.display()),
            Err(e) => error!("Failed to write summary {}: {}", self.path.display(), e),
        }
    }
}

async fn write_file(path: &Path, contents: String) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}

/// `1h 2m 3s`, `4m 5s` or `6.7s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}
