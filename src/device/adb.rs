//! adb-backed device implementation.
//!
//! Every device operation is an `adb -s <serial> <sub-command>` child process
//! of droidshard itself.
//!
//! # Characteristics
//!
//! | Operation | Implementation |
//! |-----------|----------------|
//! | Device listing | `adb devices` (retried while the header is missing) |
//! | Model lookup | `adb -s <serial> shell getprop ro.product.model` |
//! | Short commands | captured child process with timeout |
//! | Streams (logcat, instrumentation) | child process redirected into a file |
//!
//! # Example Usage
//!
//! ```no_run
//! use droidshard::config::AdbConfig;
//! use droidshard::device::adb::AdbBridge;
//! use droidshard::device::{Command, Device, DeviceProvider};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bridge = AdbBridge::new(AdbConfig::default());
//!     for device in bridge.online_devices().await? {
//!         let result = device.exec(&Command::shell("getprop ro.build.version.sdk")).await?;
//!         println!("{} runs SDK {}", device.serial(), result.stdout.trim());
//!     }
//!     Ok(())
//! }
//! ```

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Command, Device, DeviceError, DeviceProvider, DeviceResult, ExecResult, RunningProcess,
};
use crate::config::AdbConfig;

const DEVICE_LIST_HEADER: &str = "List of devices attached";
const DEVICE_LIST_ATTEMPTS: usize = 5;

/// Provider listing the devices adb can see.
pub struct AdbBridge {
    config: AdbConfig,
}

impl AdbBridge {
    /// Creates a new bridge with the given adb configuration.
    pub fn new(config: AdbConfig) -> Self {
        Self { config }
    }

    fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.config.command_timeout_secs)
    }

    async fn list_devices(&self) -> DeviceResult<Vec<(String, bool)>> {
        let mut last_error = None;
        for attempt in 1..=DEVICE_LIST_ATTEMPTS {
            let result = run_adb(&self.config.path, &["devices"], self.command_timeout()).await?;
            match parse_device_list(&result.stdout) {
                Ok(devices) => return Ok(devices),
                Err(e) => {
                    warn!(
                        "adb devices attempt {}/{} failed: {}",
                        attempt, DEVICE_LIST_ATTEMPTS, e
                    );
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(DeviceError::NoDevices))
    }

    async fn model_of(&self, serial: &str) -> String {
        let args = ["-s", serial, "shell", "getprop ro.product.model"];
        match run_adb(&self.config.path, &args, self.command_timeout()).await {
            Ok(result) => result.stdout.trim().to_string(),
            Err(e) => {
                warn!("Could not read model of {}: {}", serial, e);
                String::new()
            }
        }
    }
}

#[async_trait]
impl DeviceProvider for AdbBridge {
    type Device = AdbDevice;

    async fn online_devices(&self) -> DeviceResult<Vec<AdbDevice>> {
        let mut serials = Vec::new();
        for (serial, online) in self.list_devices().await? {
            if online {
                serials.push(serial);
            } else {
                debug!("Skipping offline device {}", serial);
            }
        }

        let models = join_all(serials.iter().map(|serial| self.model_of(serial))).await;
        let devices: Vec<AdbDevice> = serials
            .into_iter()
            .zip(models)
            .map(|(serial, model)| AdbDevice {
                adb: self.config.path.clone(),
                serial,
                model,
            })
            .collect();

        if devices.is_empty() {
            return Err(DeviceError::NoDevices);
        }

        info!(
            "{} connected online device(s): {}",
            devices.len(),
            devices
                .iter()
                .map(|d| d.serial.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(devices)
    }
}

/// Parses `adb devices` output into `(serial, online)` pairs.
///
/// Lines in any state other than `device`/`offline` (e.g. `unauthorized`)
/// are dropped.
pub fn parse_device_list(output: &str) -> DeviceResult<Vec<(String, bool)>> {
    let Some((_, listing)) = output.split_once(DEVICE_LIST_HEADER) else {
        return Err(DeviceError::UnexpectedOutput(output.trim().to_string()));
    };

    Ok(listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('*'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let serial = parts.next()?;
            match parts.next()? {
                "device" => Some((serial.to_string(), true)),
                "offline" => Some((serial.to_string(), false)),
                _ => None,
            }
        })
        .collect())
}

/// A device reached through `adb -s <serial>`.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    adb: String,
    serial: String,
    model: String,
}

impl AdbDevice {
    /// Creates a device handle without querying adb.
    pub fn new(adb: impl Into<String>, serial: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            adb: adb.into(),
            serial: serial.into(),
            model: model.into(),
        }
    }

    fn device_args<'a>(&'a self, cmd: &'a Command) -> Vec<&'a str> {
        let mut args = vec!["-s", self.serial.as_str(), cmd.program.as_str()];
        args.extend(cmd.args.iter().map(String::as_str));
        args
    }
}

#[async_trait]
impl Device for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn exec(&self, cmd: &Command) -> DeviceResult<ExecResult> {
        let args = self.device_args(cmd);
        match cmd.timeout {
            Some(timeout) => run_adb(&self.adb, &args, timeout).await,
            None => run_adb_unbounded(&self.adb, &args).await,
        }
    }

    async fn spawn(&self, cmd: &Command, output: &Path) -> DeviceResult<RunningProcess> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stdout = std::fs::File::create(output)?;
        let stderr = stdout.try_clone()?;

        let mut process = tokio::process::Command::new(&self.adb);
        process
            .args(self.device_args(cmd))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);

        let command = format!("{} -s {} {}", self.adb, self.serial, cmd.to_shell_string());
        let mut child = process.spawn().map_err(|source| DeviceError::SpawnFailed {
            command: command.clone(),
            source,
        })?;

        let exited = CancellationToken::new();
        let kill = CancellationToken::new();
        let handle = RunningProcess::new(exited.clone(), kill.clone());

        tokio::spawn(async move {
            select! {
                status = child.wait() => match status {
                    Ok(status) => debug!("`{}` exited with {}", command, status),
                    Err(e) => warn!("Failed to wait for `{}`: {}", command, e),
                },
                _ = kill.cancelled() => {
                    if let Err(e) = child.kill().await {
                        debug!("Failed to kill `{}`: {}", command, e);
                    }
                }
            }
            exited.cancel();
        });

        Ok(handle)
    }
}

async fn run_adb(adb: &str, args: &[&str], timeout: Duration) -> DeviceResult<ExecResult> {
    match tokio::time::timeout(timeout, run_adb_unbounded(adb, args)).await {
        Ok(result) => result,
        Err(_) => Err(DeviceError::Timeout {
            command: format!("{} {}", adb, shell_words::join(args)),
            timeout,
        }),
    }
}

async fn run_adb_unbounded(adb: &str, args: &[&str]) -> DeviceResult<ExecResult> {
    let start = Instant::now();
    let output = tokio::process::Command::new(adb)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| DeviceError::SpawnFailed {
            command: format!("{} {}", adb, shell_words::join(args)),
            source,
        })?;

    Ok(ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration: start.elapsed(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_list() {
        let output = "* daemon started successfully\nList of devices attached\n\
                      emulator-5554\tdevice\n\
                      0123456789ABCDEF\toffline\n\
                      R58M123\tunauthorized\n\n";
        let devices = parse_device_list(output).unwrap();
        assert_eq!(
            devices,
            vec![
                ("emulator-5554".to_string(), true),
                ("0123456789ABCDEF".to_string(), false),
            ]
        );
    }

    #[test]
    fn test_parse_device_list_empty() {
        let devices = parse_device_list("List of devices attached\n\n").unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_parse_device_list_rejects_garbage() {
        let err = parse_device_list("error: protocol fault").unwrap_err();
        assert!(matches!(err, DeviceError::UnexpectedOutput(_)));
    }

    /// `timeout -s KILL 10 <cmd>` has the same `-s <x>` shape as
    /// `adb -s <serial>`, so it stands in for adb with "KILL" as the serial
    /// and "10" as the sub-command.
    fn coreutils_device() -> AdbDevice {
        AdbDevice::new("timeout", "KILL", "")
    }

    #[tokio::test]
    async fn test_spawn_redirects_output_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("nested/out.txt");
        let cmd = Command::new("10").args(["sh", "-c", "echo started; echo finished >&2"]);

        let process = coreutils_device().spawn(&cmd, &output).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), process.wait())
            .await
            .unwrap();

        let content = std::fs::read_to_string(&output).unwrap();
        assert!(content.contains("started"));
        assert!(content.contains("finished"));
    }

    #[tokio::test]
    async fn test_exec_captures_output() {
        let cmd = Command::new("10")
            .args(["sh", "-c", "echo Success"])
            .timeout(Duration::from_secs(10));

        let result = coreutils_device().exec(&cmd).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "Success");
    }

    #[tokio::test]
    async fn test_exec_times_out() {
        let cmd = Command::new("10")
            .args(["sleep", "5"])
            .timeout(Duration::from_millis(100));

        let err = coreutils_device().exec(&cmd).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_kill_stops_spawned_process() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.txt");
        let cmd = Command::new("10").args(["sleep", "5"]);

        let process = coreutils_device().spawn(&cmd, &output).await.unwrap();
        process.kill();
        tokio::time::timeout(Duration::from_secs(2), process.wait())
            .await
            .unwrap();
        assert!(process.has_exited());
    }
}
