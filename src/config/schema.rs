//! Configuration schema definitions for droidshard.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every section has serde defaults, so a minimal
//! file only lists the test modules.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RunConfig      - Chunking, timeouts, retries, output locations
//! ├── AdbConfig      - Location of the adb executable
//! ├── FilterConfig   - Annotation and class-name filters
//! ├── PullConfig     - Device-side test output collection
//! └── ModuleConfig[] - Test APKs (and optional app-under-test APKs)
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

/// Root configuration structure for droidshard.
///
/// # TOML Structure
///
/// ```toml
/// [run]
/// chunk_size = 2
/// chunk_timeout_secs = 120
/// max_chunk_retries = 1
///
/// [filter]
/// not_annotations = ["Ignore", "FlakyTest"]
///
/// [pull]
/// host_dir = "device-files"
///
/// [[modules]]
/// test_apk = "feature/build/outputs/apk/androidTest/debug/feature-debug-androidTest.apk"
///
/// [[modules]]
/// test_apk = "app/build/outputs/apk/androidTest/debug/app-debug-androidTest.apk"
/// app_apk = "app/build/outputs/apk/debug/app-debug.apk"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Core run settings (chunking, timeouts, retries).
    #[serde(default)]
    pub run: RunConfig,

    /// How to reach adb.
    #[serde(default)]
    pub adb: AdbConfig,

    /// Which test methods to run.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Device-side test output collection.
    #[serde(default)]
    pub pull: PullConfig,

    /// Test modules, in the order their chunks enter the work pool.
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

impl Config {
    /// Checks the settings that would otherwise fail deep inside a run.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.run.chunk_size >= 1, "run.chunk_size must be at least 1");
        ensure!(
            self.run.chunk_timeout_secs > 0,
            "run.chunk_timeout_secs must be greater than 0"
        );
        ensure!(
            self.run.install_timeout_secs > 0,
            "run.install_timeout_secs must be greater than 0"
        );
        ensure!(
            self.run.run_timeout_mins > 0,
            "run.run_timeout_mins must be greater than 0"
        );
        ensure!(
            !self.modules.is_empty(),
            "at least one [[modules]] entry with a test_apk is required"
        );
        for module in &self.modules {
            ensure!(
                !module.test_apk.as_os_str().is_empty(),
                "modules.test_apk must not be empty"
            );
        }
        Ok(())
    }

    /// Expands `~` and environment variables in every configured path.
    pub fn expand_paths(&mut self) -> Result<()> {
        for module in &mut self.modules {
            module.test_apk = expand_path(&module.test_apk)?;
            if let Some(app_apk) = &module.app_apk {
                module.app_apk = Some(expand_path(app_apk)?);
            }
        }
        self.run.output_dir = expand_path(&self.run.output_dir)?;
        self.run.result_file = expand_path(&self.run.result_file)?;
        if let Some(host_dir) = &self.pull.host_dir {
            self.pull.host_dir = Some(expand_path(host_dir)?);
        }
        Ok(())
    }
}

fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)?;
    Ok(PathBuf::from(expanded.as_ref()))
}

/// Core run settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `chunk_size` | 1 |
/// | `chunk_timeout_secs` | 120 |
/// | `max_chunk_retries` | 1 |
/// | `install_timeout_secs` | 30 |
/// | `max_install_retries` | 2 |
/// | `install_retry_backoff_ms` | 500 |
/// | `run_timeout_mins` | 60 |
/// | `output_dir` | `droidshard-output` |
/// | `result_file` | `droidshard-result.txt` |
/// | `uninstall_after_test` | false |
/// | `record_failed_tests` | false |
/// | `verbose` | false |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    /// Number of test methods per chunk (one instrumentation invocation).
    ///
    /// Chunks never span two modules, so a module's last chunk may be smaller.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Timeout for a single chunk attempt in seconds.
    ///
    /// Also the ceiling for reading instrumentation output and for the
    /// screen recording time limit.
    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,

    /// How many times a chunk with failed or crashed tests is re-run on
    /// the same device.
    #[serde(default = "default_chunk_retries")]
    pub max_chunk_retries: u32,

    /// Timeout for a single APK install or uninstall in seconds.
    #[serde(default = "default_install_timeout")]
    pub install_timeout_secs: u64,

    /// How many times a failed install or uninstall is retried.
    #[serde(default = "default_install_retries")]
    pub max_install_retries: u32,

    /// Pause between install retries in milliseconds.
    #[serde(default = "default_install_backoff")]
    pub install_retry_backoff_ms: u64,

    /// Deadline for the entire run in minutes.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_mins: u64,

    /// Directory for logs, instrumentation output and reports.
    ///
    /// Cleared at the start of every run.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// CI result file listing failed tests.
    #[serde(default = "default_result_file")]
    pub result_file: PathBuf,

    /// Keep only one module's packages installed per device.
    ///
    /// Every installed package is removed before a different module is
    /// installed. Needed when several APKs declare the same intent filters.
    #[serde(default)]
    pub uninstall_after_test: bool,

    /// Screen record the last permitted attempt of a chunk.
    #[serde(default)]
    pub record_failed_tests: bool,

    /// Debug-level logging.
    #[serde(default)]
    pub verbose: bool,
}

impl RunConfig {
    /// Per-attempt chunk timeout.
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    /// Per-try install timeout.
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    /// Global run deadline, saturating for absurdly large values.
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_mins.saturating_mul(60))
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_timeout_secs: default_chunk_timeout(),
            max_chunk_retries: default_chunk_retries(),
            install_timeout_secs: default_install_timeout(),
            max_install_retries: default_install_retries(),
            install_retry_backoff_ms: default_install_backoff(),
            run_timeout_mins: default_run_timeout(),
            output_dir: default_output_dir(),
            result_file: default_result_file(),
            uninstall_after_test: false,
            record_failed_tests: false,
            verbose: false,
        }
    }
}

fn default_chunk_size() -> usize {
    1
}

fn default_chunk_timeout() -> u64 {
    120
}

fn default_chunk_retries() -> u32 {
    1
}

fn default_install_timeout() -> u64 {
    30
}

fn default_install_retries() -> u32 {
    2
}

fn default_install_backoff() -> u64 {
    500
}

fn default_run_timeout() -> u64 {
    60
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("droidshard-output")
}

fn default_result_file() -> PathBuf {
    PathBuf::from("droidshard-result.txt")
}

/// Location of the adb executable.
///
/// # Example
///
/// ```toml
/// [adb]
/// path = "/opt/android-sdk/platform-tools/adb"
/// command_timeout_secs = 60
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdbConfig {
    /// Path to adb.
    ///
    /// Default: `$ANDROID_HOME/platform-tools/adb` when `ANDROID_HOME` is
    /// set, otherwise `adb` from `PATH`.
    #[serde(default = "default_adb_path")]
    pub path: String,

    /// Timeout for short device commands (device listing, getprop, shell
    /// helpers) in seconds.
    #[serde(default = "default_adb_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            path: default_adb_path(),
            command_timeout_secs: default_adb_timeout(),
        }
    }
}

fn default_adb_path() -> String {
    match std::env::var("ANDROID_HOME") {
        Ok(home) if !home.is_empty() => Path::new(&home)
            .join("platform-tools")
            .join("adb")
            .to_string_lossy()
            .into_owned(),
        _ => "adb".to_string(),
    }
}

fn default_adb_timeout() -> u64 {
    120
}

/// Test method filters. All filters are intersected.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilterConfig {
    /// Run only methods carrying every one of these annotations.
    #[serde(default)]
    pub annotations: Vec<String>,

    /// Skip methods carrying any of these annotations.
    ///
    /// Default: `["Ignore"]`
    #[serde(default = "default_not_annotations")]
    pub not_annotations: Vec<String>,

    /// Run only methods whose class name fully matches any of these regexes.
    #[serde(default)]
    pub class_regexes: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            annotations: Vec::new(),
            not_annotations: default_not_annotations(),
            class_regexes: Vec::new(),
        }
    }
}

fn default_not_annotations() -> Vec<String> {
    vec!["Ignore".to_string()]
}

/// Device-side test output collection.
///
/// When both directories are set, `<device_dir>/<class>/<method>` is pulled
/// into `<host_dir>/<serial>/<class>/<method>` for every test that ran.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PullConfig {
    /// Directory on the device that tests write their files into.
    #[serde(default = "default_pull_device_dir")]
    pub device_dir: String,

    /// Host directory receiving the pulled files.
    pub host_dir: Option<PathBuf>,
}

impl PullConfig {
    /// Whether pulling is enabled.
    pub fn enabled(&self) -> bool {
        !self.device_dir.is_empty()
            && self
                .host_dir
                .as_ref()
                .is_some_and(|dir| !dir.as_os_str().is_empty())
    }
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            device_dir: default_pull_device_dir(),
            host_dir: None,
        }
    }
}

fn default_pull_device_dir() -> String {
    "/sdcard/test-files".to_string()
}

/// One test module.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleConfig {
    /// Path to the instrumentation test APK.
    pub test_apk: PathBuf,

    /// Path to the application under test.
    ///
    /// Only installed when the test package targets a different package
    /// than itself; self-instrumenting module APKs don't need it.
    pub app_apk: Option<PathBuf>,
}
