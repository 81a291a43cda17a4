//! Per-device logcat capture.
//!
//! [`LogcatRecorder`] clears the device's log buffer, redirects `adb logcat`
//! into `logs/<serial>/full.logcat` and tails that file through a
//! [`LogDemuxer`], writing each test's lines to
//! `logs/<serial>/<class>/<method>.logcat`.

pub mod demux;

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::{Command, Device, DeviceResult, RunningProcess};
use crate::module::TestDetails;
use crate::tail::FileTail;

pub use demux::{LogDemuxer, TestLogSegment};

const FULL_LOG_FILE: &str = "full.logcat";
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Where one device's logs are written.
#[derive(Debug, Clone)]
pub struct LogPaths {
    dir: PathBuf,
}

impl LogPaths {
    /// `<output_dir>/logs/<serial>`.
    pub fn new(output_dir: &Path, serial: &str) -> Self {
        Self {
            dir: output_dir.join("logs").join(serial),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The continuous log of the whole session.
    pub fn full_log(&self) -> PathBuf {
        self.dir.join(FULL_LOG_FILE)
    }

    /// The log segment of one test.
    pub fn segment(&self, details: &TestDetails) -> PathBuf {
        self.dir
            .join(&details.class)
            .join(format!("{}.logcat", details.method))
    }

    async fn write_segment(&self, segment: &TestLogSegment) -> std::io::Result<()> {
        let path = self.segment(&segment.details);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &segment.text).await
    }
}

/// A running logcat capture. Stop it with [`stop`](Self::stop).
pub struct LogcatRecorder {
    paths: LogPaths,
    process: RunningProcess,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LogcatRecorder {
    /// Clears the device log and starts capturing.
    ///
    /// A failure to clear the buffer is logged and ignored; failing to
    /// start `logcat` is an error.
    pub async fn start<D: Device + ?Sized>(
        device: &D,
        paths: LogPaths,
        command_timeout: Duration,
    ) -> DeviceResult<Self> {
        tokio::fs::create_dir_all(paths.dir()).await?;

        let clear = Command::new("logcat").arg("-c").timeout(command_timeout);
        match device.exec(&clear).await {
            Ok(result) if !result.success() => {
                warn!("Could not clear logcat: {}", result.stderr.trim())
            }
            Ok(_) => {}
            Err(e) => warn!("Could not clear logcat: {}", e),
        }

        let full_log = paths.full_log();
        let process = device.spawn(&Command::new("logcat"), &full_log).await?;
        let tail = FileTail::open(&full_log, Some(process.exited())).await?;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(demux_into_files(tail, paths.clone(), cancel.clone()));
        debug!("Recording logcat to {}", full_log.display());

        Ok(Self {
            paths,
            process,
            cancel,
            task: Some(task),
        })
    }

    pub fn paths(&self) -> &LogPaths {
        &self.paths
    }

    /// Stops logcat and waits for the remaining lines to be split.
    ///
    /// Segments written before this call are kept.
    pub async fn stop(mut self) {
        self.process.kill();
        let Some(mut task) = self.task.take() else {
            return;
        };
        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            debug!("logcat tail still busy after {:?}, cancelling", STOP_GRACE);
            self.cancel.cancel();
            if let Err(e) = task.await {
                warn!("logcat tail task failed: {}", e);
            }
        }
    }
}

impl Drop for LogcatRecorder {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn demux_into_files(mut tail: FileTail, paths: LogPaths, cancel: CancellationToken) {
    let mut demux = LogDemuxer::new();
    loop {
        let line = select! {
            _ = cancel.cancelled() => break,
            line = tail.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                if let Some(segment) = demux.push_line(&line)
                    && let Err(e) = paths.write_segment(&segment).await
                {
                    warn!("Failed to write logcat of {}: {}", segment.details, e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read {}: {}", paths.full_log().display(), e);
                break;
            }
        }
    }
    if let Some(open) = demux.open_test() {
        debug!("logcat capture ended while {} was running", open);
    }
}
