//! One attempt at running a chunk: install if needed, instrument, parse.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::DeviceTestResult;
use super::install::{InstallError, Installer};
use crate::device::{Command, Device, DeviceError};
use crate::instrumentation::{InstrumentationError, TestStatus, read_test_results};
use crate::logcat::LogPaths;
use crate::pool::TestChunk;
use crate::tail::FileTail;

/// Everything that can end a chunk attempt without results.
#[derive(Debug, thiserror::Error)]
pub enum ChunkRunError {
    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Instrumentation(#[from] InstrumentationError),

    #[error("Failed to open instrumentation output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instrumentation output incomplete after {0:?}")]
    Timeout(Duration),
}

/// A single attempt at a chunk, as seen by the retry controller.
#[async_trait]
pub trait ChunkRun: Send {
    /// Whether the chunk's test package is already on the device.
    fn is_installed(&self, chunk: &TestChunk) -> bool;

    /// Runs every method of `chunk` once.
    async fn run(&mut self, chunk: &TestChunk) -> Result<Vec<DeviceTestResult>, ChunkRunError>;
}

/// Runs chunks with `am instrument` on one device.
pub struct ChunkRunner<'a, D: ?Sized> {
    device: &'a D,
    installer: Installer<'a, D>,
    log_paths: LogPaths,
    instrumentation_dir: PathBuf,
    chunk_timeout: Duration,
}

impl<'a, D: Device + ?Sized> ChunkRunner<'a, D> {
    /// Instrumentation output goes to
    /// `<output_dir>/instrumentation/<serial>/chunk-<index>-try-<retry>.txt`.
    pub fn new(
        device: &'a D,
        installer: Installer<'a, D>,
        log_paths: LogPaths,
        output_dir: &Path,
        chunk_timeout: Duration,
    ) -> Self {
        Self {
            device,
            installer,
            log_paths,
            instrumentation_dir: output_dir.join("instrumentation").join(device.serial()),
            chunk_timeout,
        }
    }

    fn output_file(&self, chunk: &TestChunk) -> PathBuf {
        self.instrumentation_dir.join(format!(
            "chunk-{}-try-{}.txt",
            chunk.index, chunk.retry_count
        ))
    }
}

/// The `am instrument` invocation for `chunk`.
pub fn instrument_command(chunk: &TestChunk) -> Command {
    Command::shell(format!(
        "am instrument -w -r -e class {} {}/{}",
        chunk.class_filter(),
        chunk.module.test.package,
        chunk.module.runner
    ))
}

#[async_trait]
impl<'a, D: Device + ?Sized> ChunkRun for ChunkRunner<'a, D> {
    fn is_installed(&self, chunk: &TestChunk) -> bool {
        self.installer.is_installed(&chunk.module)
    }

    async fn run(&mut self, chunk: &TestChunk) -> Result<Vec<DeviceTestResult>, ChunkRunError> {
        info!(
            "Starting chunk {} ({} tests, try {})",
            chunk.index,
            chunk.methods.len(),
            chunk.retry_count
        );
        self.installer.ensure_installed(&chunk.module).await?;

        let output = self.output_file(chunk);
        let cmd = instrument_command(chunk);
        debug!("Running `{}` > {}", cmd.to_shell_string(), output.display());
        let process = self.device.spawn(&cmd, &output).await?;
        let tail = FileTail::open(&output, Some(process.exited())).await?;

        let results = tokio::time::timeout(self.chunk_timeout, read_test_results(tail))
            .await
            .map_err(|_| ChunkRunError::Timeout(self.chunk_timeout))??;
        drop(process);

        let device = self.device.info();
        Ok(results
            .into_iter()
            .map(|result| {
                let status = match &result.status {
                    TestStatus::Passed => "passed",
                    TestStatus::Ignored { .. } => "ignored",
                    TestStatus::Failed { .. } => "failed",
                };
                info!(
                    "Test {}/{} {} in {:.1?}: {}",
                    result.index, result.total, status, result.duration, result.details
                );
                DeviceTestResult {
                    device: device.clone(),
                    log_file: self.log_paths.segment(&result.details),
                    details: result.details,
                    status: result.status,
                    duration: result.duration,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{PackageInfo, TestMethodRef, TestModuleInfo};
    use crate::session::install::InstallSettings;
    use crate::testing::{FakeDevice, SpawnReply, instrumentation_output};
    use std::sync::Arc;

    fn chunk() -> TestChunk {
        TestChunk {
            index: 3,
            module: Arc::new(TestModuleInfo {
                test: PackageInfo {
                    package: "com.example.test".to_string(),
                    apk: PathBuf::from("app-androidTest.apk"),
                },
                runner: "androidx.test.runner.AndroidJUnitRunner".to_string(),
                app: None,
            }),
            methods: vec![
                TestMethodRef::new("com.example.LoginTest", "logsIn"),
                TestMethodRef::new("com.example.LoginTest", "rejectsBadPassword"),
            ],
            retry_count: 1,
        }
    }

    fn runner<'a>(device: &'a FakeDevice, output_dir: &Path, timeout: Duration) -> ChunkRunner<'a, FakeDevice> {
        let installer = Installer::new(
            device,
            InstallSettings {
                timeout: Duration::from_secs(1),
                max_retries: 0,
                backoff: Duration::ZERO,
                uninstall_after_test: false,
            },
        );
        ChunkRunner::new(
            device,
            installer,
            LogPaths::new(output_dir, device.serial()),
            output_dir,
            timeout,
        )
    }

    #[test]
    fn test_instrument_command() {
        assert_eq!(
            instrument_command(&chunk()).args,
            vec![
                "am instrument -w -r -e class \
                 com.example.LoginTest#logsIn,com.example.LoginTest#rejectsBadPassword \
                 com.example.test/androidx.test.runner.AndroidJUnitRunner"
                    .to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_run_installs_and_parses_results() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new("emulator-5554")
            .with_exec_output("install", "Success")
            .with_spawn_output(
                "shell am instrument",
                &instrumentation_output(&[
                    ("com.example.LoginTest", "logsIn", 0),
                    ("com.example.LoginTest", "rejectsBadPassword", -2),
                ]),
            );
        let mut runner = runner(&device, dir.path(), Duration::from_secs(5));
        let chunk = chunk();

        assert!(!runner.is_installed(&chunk));
        let results = runner.run(&chunk).await.unwrap();
        assert!(runner.is_installed(&chunk));

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].status, TestStatus::Passed);
        assert!(results[1].status.is_failed());
        assert_eq!(results[0].device.serial, "emulator-5554");
        assert_eq!(
            results[0].log_file,
            dir.path().join("logs/emulator-5554/com.example.LoginTest/logsIn.logcat")
        );
        assert!(
            dir.path()
                .join("instrumentation/emulator-5554/chunk-3-try-1.txt")
                .is_file()
        );
    }

    #[tokio::test]
    async fn test_install_failure_ends_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new("d").with_exec_output("install", "Failure [INSTALL_FAILED]");
        let mut runner = runner(&device, dir.path(), Duration::from_secs(5));

        let err = runner.run(&chunk()).await.unwrap_err();
        assert!(matches!(err, ChunkRunError::Install(_)));
        assert!(!device.executed().iter().any(|c| c.starts_with("shell am")));
    }

    #[tokio::test]
    async fn test_hanging_instrumentation_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let device = FakeDevice::new("d")
            .with_exec_output("install", "Success")
            .with_spawn_reply("shell am instrument", SpawnReply::Hang(String::new()));
        let mut runner = runner(&device, dir.path(), Duration::from_millis(100));

        let err = runner.run(&chunk()).await.unwrap_err();
        assert!(matches!(err, ChunkRunError::Timeout(_)));
    }
}
