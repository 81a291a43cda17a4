//! Bounded retries of a chunk under one overall deadline.
//!
//! A chunk is re-run on the same device while its last attempt crashed or
//! reported failed tests, up to `max_chunk_retries` times. The whole
//! sequence must finish within
//!
//! ```text
//! chunk_timeout × (max_chunk_retries + 1)
//!   + install_timeout × (max_chunk_retries + 1) × (max_install_retries + 1)   (only if not installed)
//! ```
//!
//! When the deadline passes, every method of the chunk is reported as
//! failed with a "Timed out" message.

use std::time::{Duration, Instant};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::DeviceTestResult;
use super::runner::{ChunkRun, ChunkRunError};
use super::screen::ScreenRecorder;
use crate::config::RunConfig;
use crate::device::DeviceInfo;
use crate::instrumentation::TestStatus;
use crate::logcat::LogPaths;
use crate::pool::TestChunk;

/// Timeouts and retry budgets of the retry controller.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub chunk_timeout: Duration,
    pub install_timeout: Duration,
    pub max_chunk_retries: u32,
    pub max_install_retries: u32,
}

impl From<&RunConfig> for RetrySettings {
    fn from(run: &RunConfig) -> Self {
        Self {
            chunk_timeout: run.chunk_timeout(),
            install_timeout: run.install_timeout(),
            max_chunk_retries: run.max_chunk_retries,
            max_install_retries: run.max_install_retries,
        }
    }
}

/// A crash counts as a failure.
fn has_failures(outcome: &Result<Vec<DeviceTestResult>, ChunkRunError>) -> bool {
    match outcome {
        Ok(results) => results.iter().any(|r| r.status.is_failed()),
        Err(_) => true,
    }
}

/// Time budget for running one chunk with all of its retries.
///
/// Saturates at [`Duration::MAX`] instead of overflowing.
pub fn chunk_deadline(settings: &RetrySettings, installed: bool) -> Duration {
    let runs = settings.max_chunk_retries.saturating_add(1);
    let chunk = settings.chunk_timeout.saturating_mul(runs);
    if installed {
        chunk
    } else {
        let installs = settings.install_timeout.saturating_mul(runs);
        chunk.saturating_add(installs.saturating_mul(settings.max_install_retries.saturating_add(1)))
    }
}

/// Name of the recording of `chunk`, shared by all of its attempts.
pub fn recording_name(chunk: &TestChunk) -> String {
    format!("chunk-{}", chunk.index)
}

/// Drives a [`ChunkRun`] until its results are final.
pub struct ChunkRetryer<'a> {
    device: DeviceInfo,
    log_paths: LogPaths,
    settings: RetrySettings,
    recorder: Option<&'a dyn ScreenRecorder>,
}

impl<'a> ChunkRetryer<'a> {
    pub fn new(device: DeviceInfo, log_paths: LogPaths, settings: RetrySettings) -> Self {
        Self {
            device,
            log_paths,
            settings,
            recorder: None,
        }
    }

    /// Records the last permitted attempt of every chunk.
    pub fn with_recorder(mut self, recorder: &'a dyn ScreenRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Runs `chunk` with retries and returns one final result per test.
    ///
    /// Cancelling `cancel` ends the chunk like an expired deadline.
    pub async fn run<C: ChunkRun>(
        &self,
        runner: &mut C,
        chunk: &mut TestChunk,
        cancel: &CancellationToken,
    ) -> Vec<DeviceTestResult> {
        let deadline = chunk_deadline(&self.settings, runner.is_installed(chunk));
        let start = Instant::now();

        let outcome = select! {
            results = tokio::time::timeout(deadline, self.run_attempts(runner, chunk)) => {
                results.map_err(|_| (format!("chunk deadline of {:?} elapsed", deadline), deadline))
            }
            _ = cancel.cancelled() => {
                Err(("run deadline exceeded".to_string(), start.elapsed()))
            }
        };

        // Only an interrupted last attempt can still be recording.
        if outcome.is_err()
            && let Some(recorder) = self.recorder_for(chunk)
        {
            recorder.stop().await;
        }

        match outcome {
            Ok(results) => results,
            Err((reason, duration)) => {
                warn!(
                    "Chunk {} timed out ({}), tests: {}",
                    chunk.index,
                    reason,
                    chunk.class_filter()
                );
                self.synthesize(
                    chunk,
                    &format!("Timed out with exception: {}", reason),
                    duration,
                )
            }
        }
    }

    async fn run_attempts<C: ChunkRun>(
        &self,
        runner: &mut C,
        chunk: &mut TestChunk,
    ) -> Vec<DeviceTestResult> {
        let mut outcome = self.attempt(runner, chunk).await;
        while has_failures(&outcome) && chunk.retry_count < self.settings.max_chunk_retries {
            chunk.retry_count += 1;
            info!(
                "Chunk {} has failed tests, retry {}/{}",
                chunk.index, chunk.retry_count, self.settings.max_chunk_retries
            );
            outcome = self.attempt(runner, chunk).await;
        }

        match outcome {
            Ok(results) => results,
            Err(e) => self.synthesize(
                chunk,
                &format!("Crashed with exception: {}", e),
                Duration::ZERO,
            ),
        }
    }

    async fn attempt<C: ChunkRun>(
        &self,
        runner: &mut C,
        chunk: &TestChunk,
    ) -> Result<Vec<DeviceTestResult>, ChunkRunError> {
        let recorder = self.recorder_for(chunk);
        if let Some(recorder) = recorder {
            recorder.start(&recording_name(chunk)).await;
        }

        let outcome = runner.run(chunk).await;
        if let Err(e) = &outcome {
            warn!("Chunk {} crashed: {}", chunk.index, e);
        }

        if let Some(recorder) = recorder {
            recorder.stop().await;
            if !has_failures(&outcome) {
                recorder.discard().await;
            }
        }
        outcome
    }

    /// The recorder, if `chunk` is on its last permitted attempt.
    fn recorder_for(&self, chunk: &TestChunk) -> Option<&'a dyn ScreenRecorder> {
        self.recorder
            .filter(|_| chunk.retry_count == self.settings.max_chunk_retries)
    }

    fn synthesize(&self, chunk: &TestChunk, message: &str, duration: Duration) -> Vec<DeviceTestResult> {
        chunk
            .methods
            .iter()
            .map(|method| {
                let details = method.details();
                DeviceTestResult {
                    device: self.device.clone(),
                    log_file: self.log_paths.segment(&details),
                    details,
                    status: TestStatus::Failed {
                        stacktrace: message.to_string(),
                    },
                    duration,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::InstrumentationError;
    use crate::module::{PackageInfo, TestDetails, TestMethodRef, TestModuleInfo};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    enum Scripted {
        Crash,
        Pass,
        Fail,
        Hang,
    }

    struct ScriptedRun {
        installed: bool,
        script: VecDeque<Scripted>,
        attempts: Vec<u32>,
    }

    impl ScriptedRun {
        fn new(installed: bool, script: Vec<Scripted>) -> Self {
            Self {
                installed,
                script: script.into(),
                attempts: Vec::new(),
            }
        }
    }

    fn result(details: TestDetails, status: TestStatus) -> DeviceTestResult {
        DeviceTestResult {
            device: DeviceInfo {
                serial: "d".to_string(),
                model: String::new(),
            },
            log_file: PathBuf::new(),
            details,
            status,
            duration: Duration::from_millis(10),
        }
    }

    #[async_trait]
    impl ChunkRun for ScriptedRun {
        fn is_installed(&self, _chunk: &TestChunk) -> bool {
            self.installed
        }

        async fn run(&mut self, chunk: &TestChunk) -> Result<Vec<DeviceTestResult>, ChunkRunError> {
            self.attempts.push(chunk.retry_count);
            let status = match self.script.pop_front() {
                Some(Scripted::Crash) | None => {
                    return Err(InstrumentationError::Crash("Process crashed.".to_string()).into());
                }
                Some(Scripted::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                Some(Scripted::Pass) => TestStatus::Passed,
                Some(Scripted::Fail) => TestStatus::Failed {
                    stacktrace: "AssertionError".to_string(),
                },
            };
            Ok(chunk
                .methods
                .iter()
                .map(|m| result(m.details(), status.clone()))
                .collect())
        }
    }

    #[derive(Default)]
    struct RecordingLog {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ScreenRecorder for RecordingLog {
        async fn start(&self, name: &str) {
            self.events.lock().unwrap().push(format!("start {name}"));
        }
        async fn stop(&self) {
            self.events.lock().unwrap().push("stop".to_string());
        }
        async fn discard(&self) {
            self.events.lock().unwrap().push("discard".to_string());
        }
    }

    fn settings(max_chunk_retries: u32) -> RetrySettings {
        RetrySettings {
            chunk_timeout: Duration::from_secs(10),
            install_timeout: Duration::from_secs(3),
            max_chunk_retries,
            max_install_retries: 2,
        }
    }

    fn chunk() -> TestChunk {
        TestChunk {
            index: 0,
            module: Arc::new(TestModuleInfo {
                test: PackageInfo {
                    package: "com.example.test".to_string(),
                    apk: PathBuf::from("test.apk"),
                },
                runner: "Runner".to_string(),
                app: None,
            }),
            methods: vec![TestMethodRef::new("C", "a"), TestMethodRef::new("C", "b")],
            retry_count: 0,
        }
    }

    fn retryer<'a>(settings: RetrySettings) -> ChunkRetryer<'a> {
        ChunkRetryer::new(
            DeviceInfo {
                serial: "d".to_string(),
                model: String::new(),
            },
            LogPaths::new(Path::new("out"), "d"),
            settings,
        )
    }

    #[test]
    fn test_deadline_adds_install_budget_only_when_not_installed() {
        let settings = settings(2);
        assert_eq!(chunk_deadline(&settings, true), Duration::from_secs(30));
        // 10×3 + 3×3×3
        assert_eq!(chunk_deadline(&settings, false), Duration::from_secs(57));
    }

    #[test]
    fn test_deadline_saturates_instead_of_overflowing() {
        let settings = RetrySettings {
            chunk_timeout: Duration::from_secs(u64::MAX),
            install_timeout: Duration::from_secs(30),
            max_chunk_retries: u32::MAX,
            max_install_retries: 2,
        };
        assert_eq!(chunk_deadline(&settings, true), Duration::MAX);
        assert_eq!(chunk_deadline(&settings, false), Duration::MAX);

        let settings = RetrySettings {
            chunk_timeout: Duration::from_secs(120),
            install_timeout: Duration::from_secs(u64::MAX / 2),
            max_chunk_retries: 1,
            max_install_retries: u32::MAX,
        };
        assert_eq!(chunk_deadline(&settings, true), Duration::from_secs(240));
        assert_eq!(chunk_deadline(&settings, false), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_deadline_still_runs_chunk() {
        let mut runner = ScriptedRun::new(false, vec![Scripted::Pass]);
        let mut chunk = chunk();
        let settings = RetrySettings {
            chunk_timeout: Duration::from_secs(u64::MAX),
            install_timeout: Duration::from_secs(u64::MAX),
            max_chunk_retries: u32::MAX,
            max_install_retries: u32::MAX,
        };

        let results = retryer(settings)
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert!(results.iter().all(|r| r.status == TestStatus::Passed));
    }

    #[tokio::test]
    async fn test_crashes_are_retried_until_pass() {
        let mut runner = ScriptedRun::new(true, vec![Scripted::Crash, Scripted::Crash, Scripted::Pass]);
        let mut chunk = chunk();

        let results = retryer(settings(3))
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == TestStatus::Passed));
        assert_eq!(runner.attempts, vec![0, 1, 2]);
        assert_eq!(chunk.retry_count, 2);
    }

    #[tokio::test]
    async fn test_exhausted_retries_report_last_crash() {
        let mut runner = ScriptedRun::new(true, vec![Scripted::Crash, Scripted::Crash, Scripted::Pass]);
        let mut chunk = chunk();

        let results = retryer(settings(1))
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert_eq!(runner.attempts, vec![0, 1]);
        assert_eq!(results.len(), 2);
        for result in &results {
            match &result.status {
                TestStatus::Failed { stacktrace } => {
                    assert!(stacktrace.starts_with("Crashed with exception: "));
                    assert!(stacktrace.contains("Process crashed."));
                }
                other => panic!("expected crash result, got {other:?}"),
            }
            assert_eq!(result.duration, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_failed_tests_are_retried_and_passing_results_kept() {
        let mut runner = ScriptedRun::new(true, vec![Scripted::Fail, Scripted::Pass]);
        let mut chunk = chunk();

        let results = retryer(settings(1))
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert!(results.iter().all(|r| r.status == TestStatus::Passed));
        assert_eq!(runner.attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_passing_chunk_is_not_retried() {
        let mut runner = ScriptedRun::new(true, vec![Scripted::Pass, Scripted::Fail]);
        let mut chunk = chunk();

        retryer(settings(3))
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert_eq!(runner.attempts, vec![0]);
        assert_eq!(chunk.retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_produces_timed_out_results() {
        let mut runner = ScriptedRun::new(false, vec![Scripted::Hang]);
        let mut chunk = chunk();
        let settings = settings(0);
        let expected = chunk_deadline(&settings, false);

        let results = retryer(settings)
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert_eq!(results.len(), 2);
        for result in &results {
            assert!(matches!(
                &result.status,
                TestStatus::Failed { stacktrace } if stacktrace.starts_with("Timed out with exception: ")
            ));
            assert_eq!(result.duration, expected);
        }
        assert_eq!(
            results[1].log_file,
            Path::new("out/logs/d/C/b.logcat")
        );
    }

    #[tokio::test]
    async fn test_cancellation_ends_chunk() {
        let mut runner = ScriptedRun::new(true, vec![Scripted::Hang]);
        let mut chunk = chunk();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results = retryer(settings(0)).run(&mut runner, &mut chunk, &cancel).await;

        assert!(results.iter().all(|r| r.status.is_failed()));
    }

    #[tokio::test]
    async fn test_only_last_attempt_is_recorded() {
        let recorder = RecordingLog::default();
        let mut runner = ScriptedRun::new(true, vec![Scripted::Fail, Scripted::Fail, Scripted::Pass]);
        let mut chunk = chunk();

        let results = retryer(settings(2))
            .with_recorder(&recorder)
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert!(results.iter().all(|r| r.status == TestStatus::Passed));
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["start chunk-0", "stop", "discard"]
        );
    }

    #[tokio::test]
    async fn test_passing_first_attempt_is_not_recorded() {
        let recorder = RecordingLog::default();
        let mut runner = ScriptedRun::new(true, vec![Scripted::Pass]);
        let mut chunk = chunk();

        retryer(settings(2))
            .with_recorder(&recorder)
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert!(recorder.events.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_last_attempt_stops_recording() {
        let recorder = RecordingLog::default();
        let mut runner = ScriptedRun::new(true, vec![Scripted::Hang]);
        let mut chunk = chunk();
        chunk.index = 7;

        retryer(settings(0))
            .with_recorder(&recorder)
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert_eq!(*recorder.events.lock().unwrap(), vec!["start chunk-7", "stop"]);
    }

    #[tokio::test]
    async fn test_failed_last_attempt_keeps_recording() {
        let recorder = RecordingLog::default();
        let mut runner = ScriptedRun::new(true, vec![Scripted::Fail]);
        let mut chunk = chunk();

        retryer(settings(0))
            .with_recorder(&recorder)
            .run(&mut runner, &mut chunk, &CancellationToken::new())
            .await;

        assert_eq!(*recorder.events.lock().unwrap(), vec!["start chunk-0", "stop"]);
    }
}
