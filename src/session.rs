//! Per-device test session.
//!
//! Each connected device runs one [`DeviceSession`]. Sessions share nothing
//! but the [`TestPool`]: a session pops chunks until the pool is empty,
//! running each through its own [`ChunkRetryer`], so a chunk is only ever
//! retried on the device that popped it.
//!
//! # Lifecycle
//!
//! ```text
//! start logcat ─► loop { pop chunk ─► retry controller ─► report } ─► stop logcat
//!                                                                        │
//!                                      summary ◄─ timestamps ◄─ pull test files
//! ```

pub mod install;
pub mod pull;
pub mod retry;
pub mod runner;
pub mod screen;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::device::{Device, DeviceInfo};
use crate::instrumentation::TestStatus;
use crate::logcat::{LogPaths, LogcatRecorder};
use crate::module::TestDetails;
use crate::pool::TestPool;
use crate::report::{Reporter, format_duration};

use install::{InstallSettings, Installer};
use pull::FilePuller;
use retry::{ChunkRetryer, RetrySettings};
use runner::ChunkRunner;
use screen::{AdbScreenRecorder, RECORDINGS_DIR};

pub use runner::{ChunkRun, ChunkRunError};

/// Final result of one test on one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceTestResult {
    pub device: DeviceInfo,
    pub details: TestDetails,
    pub status: TestStatus,
    pub duration: Duration,
    /// Logcat segment of the test. May not exist if the test never logged
    /// its start.
    pub log_file: PathBuf,
}

/// Everything one device did during the run.
#[derive(Debug, Clone)]
pub struct DeviceSessionResult {
    pub device: DeviceInfo,
    pub passed: usize,
    pub ignored: usize,
    pub failed: usize,
    /// Results in the order the chunks finished.
    pub results: Vec<DeviceTestResult>,
    /// The continuous logcat of the session.
    pub log_file: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl DeviceSessionResult {
    fn new(device: DeviceInfo, log_file: PathBuf) -> Self {
        let now = Utc::now();
        Self {
            device,
            passed: 0,
            ignored: 0,
            failed: 0,
            results: Vec::new(),
            log_file,
            started_at: now,
            finished_at: now,
        }
    }

    fn record(&mut self, results: Vec<DeviceTestResult>) {
        for result in &results {
            match result.status {
                TestStatus::Passed => self.passed += 1,
                TestStatus::Ignored { .. } => self.ignored += 1,
                TestStatus::Failed { .. } => self.failed += 1,
            }
        }
        self.results.extend(results);
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Drains the work pool on one device.
pub struct DeviceSession<'a, D: ?Sized> {
    device: &'a D,
    config: &'a Config,
    pool: &'a TestPool,
    cancel: CancellationToken,
}

impl<'a, D: Device + ?Sized> DeviceSession<'a, D> {
    /// `cancel` ends the session early; the chunk in flight is reported as
    /// timed out and no further chunks are popped.
    pub fn new(device: &'a D, config: &'a Config, pool: &'a TestPool, cancel: CancellationToken) -> Self {
        Self {
            device,
            config,
            pool,
            cancel,
        }
    }

    pub async fn run<R: Reporter + ?Sized>(self, reporter: &R) -> DeviceSessionResult {
        let run = &self.config.run;
        let command_timeout = Duration::from_secs(self.config.adb.command_timeout_secs);
        let info = self.device.info();
        let log_paths = LogPaths::new(&run.output_dir, &info.serial);
        let mut session = DeviceSessionResult::new(info.clone(), log_paths.full_log());

        let logcat = match LogcatRecorder::start(self.device, log_paths.clone(), command_timeout).await
        {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                warn!("Failed to start logcat recording: {}", e);
                None
            }
        };

        let installer = Installer::new(self.device, InstallSettings::from(run));
        let mut runner = ChunkRunner::new(
            self.device,
            installer,
            log_paths.clone(),
            &run.output_dir,
            run.chunk_timeout(),
        );
        let recorder = run.record_failed_tests.then(|| {
            AdbScreenRecorder::new(
                self.device,
                &self.config.pull.device_dir,
                log_paths.dir().join("screenrecord.txt"),
                run.chunk_timeout(),
                command_timeout,
            )
        });
        let mut retryer = ChunkRetryer::new(info.clone(), log_paths.clone(), RetrySettings::from(run));
        if let Some(recorder) = &recorder {
            retryer = retryer.with_recorder(recorder);
        }

        while !self.cancel.is_cancelled() {
            let Some(mut chunk) = self.pool.next_chunk() else {
                break;
            };
            let results = retryer.run(&mut runner, &mut chunk, &self.cancel).await;
            reporter.on_chunk_complete(&info, &results).await;
            session.record(results);
        }

        if let Some(logcat) = logcat {
            logcat.stop().await;
        }

        if self.cancel.is_cancelled() {
            warn!("Run cancelled, skipping pull of test files");
        } else if self.config.pull.enabled()
            && let Some(host_dir) = &self.config.pull.host_dir
        {
            let puller = FilePuller::new(
                self.device,
                &self.config.pull.device_dir,
                host_dir,
                run.install_timeout(),
            );
            let ran = session
                .results
                .iter()
                .filter(|r| !matches!(r.status, TestStatus::Ignored { .. }))
                .map(|r| &r.details);
            puller.pull_tests(ran).await;
            if recorder.is_some() {
                puller.pull_dir(RECORDINGS_DIR).await;
            }
        }

        session.finished_at = Utc::now();
        info!(
            "Device test session complete, {} passed, {} ignored, {} failed, took {}",
            session.passed,
            session.ignored,
            session.failed,
            format_duration(session.duration())
        );
        session
    }
}
