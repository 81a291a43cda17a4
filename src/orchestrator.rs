//! Run coordination across every connected device.
//!
//! # Architecture
//!
//! ```text
//!   TestModules ──► TestPool (chunks)
//!                       │
//!   DeviceProvider ─────┼──► online_devices()
//!                       │
//!          ┌────────────┼────────────┐        one scoped task per device,
//!          ▼            ▼            ▼        each inside a `device` span
//!   DeviceSession DeviceSession DeviceSession
//!          │            │            │
//!          └─────► Reporter ◄────────┘   on_chunk_complete()
//!                       │
//!                       ▼
//!                   RunResult ──► Reporter::on_run_complete()
//! ```
//!
//! The run deadline cancels a root token shared by every session. Sessions
//! then report their in-flight chunk as timed out and stop popping, leaving
//! the rest of the pool as "not run".
//!
//! # Example
//!
//! ```no_run
//! use droidshard::config::load_config;
//! use droidshard::device::adb::AdbBridge;
//! use droidshard::module::{ManifestInspector, load_modules};
//! use droidshard::orchestrator::Orchestrator;
//! use droidshard::report::ConsoleReporter;
//!
//! #[tokio::main(flavor = "multi_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("droidshard.toml"))?;
//!     let modules = load_modules(&config, &ManifestInspector).await?;
//!
//!     let provider = AdbBridge::new(config.adb.clone());
//!     let orchestrator = Orchestrator::new(config, provider, ConsoleReporter::new(false));
//!     let result = orchestrator.run(&modules).await?;
//!
//!     std::process::exit(result.exit_code());
//! }
//! ```

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::config::Config;
use crate::device::{Device, DeviceProvider};
use crate::module::TestModule;
use crate::pool::TestPool;
use crate::report::{Reporter, format_duration};
use crate::session::{DeviceSession, DeviceSessionResult, DeviceTestResult};

/// Aggregated results of an entire run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | Every test passed or was ignored, at least one passed |
/// | 1 | Failures, chunks never started, or the run deadline passed |
#[derive(Debug, Clone)]
pub struct RunResult {
    /// One entry per device, ordered by serial.
    pub sessions: Vec<DeviceSessionResult>,

    pub passed: usize,
    pub failed: usize,
    pub ignored: usize,

    /// Test methods whose chunk was never popped.
    pub not_run: usize,

    /// Wall-clock duration of the run.
    pub duration: Duration,

    /// Whether the run deadline cut the run short.
    pub timed_out: bool,
}

impl RunResult {
    fn from_sessions(sessions: Vec<DeviceSessionResult>) -> Self {
        Self {
            passed: sessions.iter().map(|s| s.passed).sum(),
            failed: sessions.iter().map(|s| s.failed).sum(),
            ignored: sessions.iter().map(|s| s.ignored).sum(),
            sessions,
            not_run: 0,
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    /// Failed results of every device.
    pub fn failed_tests(&self) -> impl Iterator<Item = &DeviceTestResult> {
        self.sessions
            .iter()
            .flat_map(|s| &s.results)
            .filter(|r| r.status.is_failed())
    }

    pub fn success(&self) -> bool {
        self.failed == 0 && self.not_run == 0 && !self.timed_out && self.passed > 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Ties a [`DeviceProvider`] and a [`Reporter`] to one configuration.
pub struct Orchestrator<P, R> {
    config: Config,
    provider: P,
    reporter: R,
    run_timeout: Duration,
}

impl<P, R> Orchestrator<P, R>
where
    P: DeviceProvider,
    R: Reporter,
{
    pub fn new(config: Config, provider: P, reporter: R) -> Self {
        let run_timeout = config.run.run_timeout();
        Self {
            config,
            provider,
            reporter,
            run_timeout,
        }
    }

    /// Overrides `run.run_timeout_mins`.
    pub fn with_run_timeout(mut self, run_timeout: Duration) -> Self {
        self.run_timeout = run_timeout;
        self
    }

    /// Runs every method of `modules` across all online devices.
    ///
    /// Must be called from a multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// - no test methods to run
    /// - no online devices
    /// - the output directory cannot be recreated
    /// - no test passed or failed (after reporting)
    pub async fn run(&self, modules: &[TestModule]) -> anyhow::Result<RunResult> {
        let start = Instant::now();

        let output_dir = &self.config.run.output_dir;
        if output_dir.exists() {
            std::fs::remove_dir_all(output_dir)
                .with_context(|| format!("Failed to clear {}", output_dir.display()))?;
        }
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("Failed to create {}", output_dir.display()))?;

        let pool = TestPool::new(modules, self.config.run.chunk_size);
        if pool.total_chunks() == 0 {
            bail!("No test methods to run");
        }
        info!(
            "Split {} test methods into {} chunks",
            pool.total_methods(),
            pool.total_chunks()
        );

        let devices = self
            .provider
            .online_devices()
            .await
            .context("Failed to find online devices")?;

        let root = CancellationToken::new();
        let timer = {
            let root = root.clone();
            let run_timeout = self.run_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(run_timeout).await;
                warn!("Run timeout after {}", format_duration(run_timeout));
                root.cancel();
            })
        };

        let sessions = Mutex::new(Vec::with_capacity(devices.len()));
        tokio_scoped::scope(|scope| {
            for device in &devices {
                let session = DeviceSession::new(device, &self.config, &pool, root.child_token());
                let reporter = &self.reporter;
                let sessions = &sessions;
                let span = info_span!("device", serial = device.serial());

                scope.spawn(
                    async move {
                        let result = session.run(reporter).await;
                        sessions
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(result);
                    }
                    .instrument(span),
                );
            }
        });
        timer.abort();

        let mut sessions = sessions.into_inner().unwrap_or_else(PoisonError::into_inner);
        sessions.sort_by(|a, b| a.device.serial.cmp(&b.device.serial));

        let mut result = RunResult::from_sessions(sessions);
        result.not_run = pool.drain().iter().map(|c| c.methods.len()).sum();
        result.timed_out = root.is_cancelled();
        result.duration = start.elapsed();

        info!(
            "Test run finished, total passed = {}, total failed = {}, total ignored = {}, took {}",
            result.passed,
            result.failed,
            result.ignored,
            format_duration(result.duration)
        );
        if result.not_run > 0 {
            warn!("{} test methods were never started", result.not_run);
        }

        self.reporter.on_run_complete(&result).await;

        if result.passed == 0 && result.failed == 0 {
            bail!("0 tests were run");
        }
        Ok(result)
    }
}
