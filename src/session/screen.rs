//! Screen recording of the last attempt of a chunk.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::device::{Command, Device, RunningProcess};

/// Directory under the device directory holding every recording.
pub const RECORDINGS_DIR: &str = "recordings";
const RECORDING_SIZE: &str = "720x1440";

/// Records the device screen while a test runs.
#[async_trait]
pub trait ScreenRecorder: Send + Sync {
    /// Starts a recording called `name`. Failures are logged.
    async fn start(&self, name: &str);

    /// Stops the running recording, if any.
    async fn stop(&self);

    /// Deletes the last recording from the device.
    async fn discard(&self);
}

struct Recording {
    process: RunningProcess,
    remote_path: String,
}

/// Records with `screenrecord` into `<device_dir>/recordings/<name>.mp4`.
pub struct AdbScreenRecorder<'a, D: ?Sized> {
    device: &'a D,
    device_dir: String,
    host_output: PathBuf,
    time_limit: Duration,
    command_timeout: Duration,
    current: Mutex<Option<Recording>>,
    last_path: Mutex<Option<String>>,
}

impl<'a, D: Device + ?Sized> AdbScreenRecorder<'a, D> {
    /// `host_output` receives the output of `screenrecord` itself.
    pub fn new(
        device: &'a D,
        device_dir: &str,
        host_output: PathBuf,
        time_limit: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            device,
            device_dir: device_dir.trim_end_matches('/').to_string(),
            host_output,
            time_limit,
            command_timeout,
            current: Mutex::new(None),
            last_path: Mutex::new(None),
        }
    }

    /// Device path of the recording called `name`.
    pub fn remote_path(&self, name: &str) -> String {
        format!("{}/{}/{}.mp4", self.device_dir, RECORDINGS_DIR, name)
    }

    fn take_current(&self) -> Option<Recording> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl<'a, D: Device + ?Sized> ScreenRecorder for AdbScreenRecorder<'a, D> {
    async fn start(&self, name: &str) {
        self.stop().await;

        let remote_path = self.remote_path(name);
        let remote_dir = format!("{}/{}", self.device_dir, RECORDINGS_DIR);
        let mkdir = Command::shell(format!("mkdir -p {}", remote_dir)).timeout(self.command_timeout);
        if let Err(e) = self.device.exec(&mkdir).await {
            warn!("Failed to create {} on device: {}", remote_dir, e);
        }

        let record = Command::shell(format!(
            "screenrecord {} --time-limit {} --size {}",
            remote_path,
            self.time_limit.as_secs(),
            RECORDING_SIZE
        ));
        match self.device.spawn(&record, &self.host_output).await {
            Ok(process) => {
                info!("Started recording {}", remote_path);
                *self
                    .last_path
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(remote_path.clone());
                *self
                    .current
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Recording {
                    process,
                    remote_path,
                });
            }
            Err(e) => warn!("Failed to record {}: {}", remote_path, e),
        }
    }

    async fn stop(&self) {
        if let Some(recording) = self.take_current() {
            recording.process.kill();
            recording.process.wait().await;
            debug!("Ended recording {}", recording.remote_path);
        }
    }

    async fn discard(&self) {
        let last = self
            .last_path
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(path) = last {
            let rm = Command::shell(format!("rm -f {}", path)).timeout(self.command_timeout);
            match self.device.exec(&rm).await {
                Ok(_) => debug!("Removed recording {}", path),
                Err(e) => warn!("Failed to remove recording {}: {}", path, e),
            }
        }
    }
}
