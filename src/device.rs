//! Device traits and the command-execution primitive.
//!
//! This module defines the abstractions droidshard uses to talk to connected
//! devices. Everything the core needs from a device goes through two
//! operations: run a command to completion, or start a long-running command
//! whose output grows in a file on the host.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DeviceProvider                          │
//! │  (lists connected devices)                                  │
//! │                                                             │
//! │  online_devices() ──────────► Vec<Device>                   │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Device                              │
//! │                                                             │
//! │  exec(Command)          ───► ExecResult                     │
//! │  spawn(Command, file)   ───► RunningProcess (file grows)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`adb`] module implements both traits on top of the `adb` executable.

pub mod adb;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Result type for device operations.
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Errors that can occur while running commands against a device.
///
/// A command that runs but returns a non-zero exit code is NOT an error;
/// callers inspect [`ExecResult`] for that.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The command could not be started.
    #[error("Failed to spawn command `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command started but its output could not be collected.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    /// The command took longer than its timeout and was killed.
    #[error("Command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    /// No device is online.
    #[error("No devices available for tests")]
    NoDevices,

    /// adb printed something we don't understand.
    #[error("Unexpected adb output: {0}")]
    UnexpectedOutput(String),

    /// I/O error while preparing output files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A command to run against a device.
///
/// `program` is the adb sub-command (`shell`, `install`, `pull`, ...); the
/// device implementation adds whatever addresses the device.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use droidshard::device::Command;
///
/// let cmd = Command::new("install")
///     .args(["-r", "-g", "app-debug.apk"])
///     .timeout(Duration::from_secs(30));
///
/// assert_eq!(cmd.program, "install");
/// assert_eq!(cmd.to_shell_string(), "install -r -g app-debug.apk");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The adb sub-command.
    pub program: String,

    /// Arguments to the sub-command.
    pub args: Vec<String>,

    /// Maximum execution time. Only honoured by [`Device::exec`].
    pub timeout: Option<Duration>,
}

impl Command {
    /// Creates a new command with the given sub-command.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    /// Shorthand for `adb shell <script>`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("shell").arg(script)
    }

    /// Adds a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the execution timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Renders the command for logs, quoting arguments where needed.
    pub fn to_shell_string(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }
}

/// Result of a command that ran to completion.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the command, `-1` when killed by a signal.
    pub exit_code: i32,

    /// Captured standard output.
    pub stdout: String,

    /// Captured standard error.
    pub stderr: String,

    /// Wall-clock time the command took to execute.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed, non-empty lines of stdout followed by stderr.
    pub fn output_lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .map(str::trim)
            .filter(|line| !line.is_empty())
    }
}

/// Handle to a long-running command whose output is redirected to a file.
///
/// The process is killed when [`kill`](Self::kill) is called or the handle
/// is dropped. [`exited`](Self::exited) is cancelled once the process is
/// gone, which lets a tail reader know that no more output will arrive.
#[derive(Debug)]
pub struct RunningProcess {
    exited: CancellationToken,
    kill: CancellationToken,
}

impl RunningProcess {
    /// Creates a handle from a pair of tokens driven by the spawner.
    ///
    /// The spawner must cancel `exited` when the process ends and must stop
    /// the process when `kill` is cancelled.
    pub fn new(exited: CancellationToken, kill: CancellationToken) -> Self {
        Self { exited, kill }
    }

    /// A handle for output that is already complete.
    pub fn finished() -> Self {
        let exited = CancellationToken::new();
        exited.cancel();
        Self::new(exited, CancellationToken::new())
    }

    /// Token cancelled once the process has exited.
    pub fn exited(&self) -> CancellationToken {
        self.exited.clone()
    }

    /// Whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Waits for the process to exit.
    pub async fn wait(&self) {
        self.exited.cancelled().await;
    }

    /// Asks the spawner to stop the process.
    pub fn kill(&self) {
        self.kill.cancel();
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        self.kill.cancel();
    }
}

/// Identity of a connected device, as shown in reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// adb serial.
    pub serial: String,

    /// Product model, empty if unknown.
    pub model: String,
}

/// A connected device that tests can run on.
///
/// # Thread Safety
///
/// Devices are shared by reference with the tasks of their session, so
/// they must be `Send + Sync`. A device is never used by two sessions.
#[async_trait]
pub trait Device: Send + Sync {
    /// The adb serial of this device.
    fn serial(&self) -> &str;

    /// The product model of this device.
    fn model(&self) -> &str;

    /// Identity for reports.
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            serial: self.serial().to_string(),
            model: self.model().to_string(),
        }
    }

    /// Runs a command to completion and captures its output.
    ///
    /// # Errors
    ///
    /// - `DeviceError::SpawnFailed` - the command could not be started
    /// - `DeviceError::Timeout` - the command exceeded [`Command::timeout`]
    async fn exec(&self, cmd: &Command) -> DeviceResult<ExecResult>;

    /// Starts a command whose merged stdout/stderr is written to `output`.
    ///
    /// `output` is created (truncated) before this returns, so a reader can
    /// start tailing it immediately.
    async fn spawn(&self, cmd: &Command, output: &Path) -> DeviceResult<RunningProcess>;
}

/// Source of connected devices.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// The concrete device type.
    type Device: Device;

    /// Returns every online device.
    ///
    /// # Errors
    ///
    /// `DeviceError::NoDevices` when nothing is online.
    async fn online_devices(&self) -> DeviceResult<Vec<Self::Device>>;
}
