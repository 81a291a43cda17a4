//! Copies per-test output directories from the device to the host.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::{Command, Device};
use crate::module::TestDetails;

const MAX_RETRIES: u32 = 3;

/// Pulls `<device_dir>/<class>/<method>` into
/// `<host_dir>/<serial>/<class>/<method>`.
///
/// Pulling is best effort: failures are logged and never fail a session.
pub struct FilePuller<'a, D: ?Sized> {
    device: &'a D,
    device_dir: String,
    host_dir: PathBuf,
    timeout: Duration,
}

impl<'a, D: Device + ?Sized> FilePuller<'a, D> {
    pub fn new(device: &'a D, device_dir: &str, host_dir: &Path, timeout: Duration) -> Self {
        Self {
            device,
            device_dir: device_dir.trim_end_matches('/').to_string(),
            host_dir: host_dir.to_path_buf(),
            timeout,
        }
    }

    /// Host directory receiving the files of `details`.
    pub fn host_path(&self, details: &TestDetails) -> PathBuf {
        self.host_dir
            .join(self.device.serial())
            .join(&details.class)
            .join(&details.method)
    }

    /// Pulls the directory of every test in `tests`. Returns how many were
    /// pulled.
    pub async fn pull_tests<'t>(&self, tests: impl IntoIterator<Item = &'t TestDetails>) -> usize {
        let unique: BTreeSet<&TestDetails> = tests.into_iter().collect();
        let mut pulled = 0;
        for details in &unique {
            if self.pull_test(details).await {
                pulled += 1;
            }
        }
        info!(
            "Pulled {}/{} test directories into {}",
            pulled,
            unique.len(),
            self.host_dir.join(self.device.serial()).display()
        );
        pulled
    }

    /// Pulls `<device_dir>/<name>` into `<host_dir>/<serial>/<name>`.
    pub async fn pull_dir(&self, name: &str) -> bool {
        let remote = format!("{}/{}", self.device_dir, name);
        let destination = self.host_dir.join(self.device.serial());
        let pulled = self.pull(&remote, &destination).await;
        if pulled {
            info!("Pulled {} into {}", remote, destination.display());
        }
        pulled
    }

    async fn pull_test(&self, details: &TestDetails) -> bool {
        let remote = format!("{}/{}/{}", self.device_dir, details.class, details.method);
        // adb pull places the directory inside an existing destination.
        let Some(destination) = self.host_path(details).parent().map(Path::to_path_buf) else {
            return false;
        };
        self.pull(&remote, &destination).await
    }

    async fn pull(&self, remote: &str, destination: &Path) -> bool {
        if let Err(e) = tokio::fs::create_dir_all(&destination).await {
            warn!("Failed to create {}: {}", destination.display(), e);
            return false;
        }

        let cmd = Command::new("pull")
            .arg(remote)
            .arg(destination.to_string_lossy())
            .timeout(self.timeout);

        let mut last_error = String::new();
        for attempt in 0..=MAX_RETRIES {
            match self.device.exec(&cmd).await {
                Ok(result) if result.success() => {
                    debug!("Pulled {}", remote);
                    return true;
                }
                Ok(result) => last_error = result.output_lines().collect::<Vec<_>>().join(" | "),
                Err(e) => last_error = e.to_string(),
            }
            debug!("Pull of {} failed (attempt {}): {}", remote, attempt + 1, last_error);
        }
        warn!("Failed to pull {}: {}", remote, last_error);
        false
    }
}
