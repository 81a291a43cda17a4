//! APK installation with per-device bookkeeping.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::RunConfig;
use crate::device::{Command, Device};
use crate::module::{PackageInfo, TestModuleInfo};

/// An install or uninstall that kept failing.
#[derive(Debug, thiserror::Error)]
#[error("Failed to {action} {target} after {attempts} attempt(s): {last_error}")]
pub struct InstallError {
    pub action: &'static str,
    pub target: String,
    pub attempts: u32,
    pub last_error: String,
}

/// Install retry and timeout settings.
#[derive(Debug, Clone)]
pub struct InstallSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub uninstall_after_test: bool,
}

impl From<&RunConfig> for InstallSettings {
    fn from(run: &RunConfig) -> Self {
        Self {
            timeout: run.install_timeout(),
            max_retries: run.max_install_retries,
            backoff: Duration::from_millis(run.install_retry_backoff_ms),
            uninstall_after_test: run.uninstall_after_test,
        }
    }
}

/// Installs module APKs on one device and remembers what it installed.
///
/// The installed set belongs to the device's session and is never shared.
pub struct Installer<'a, D: ?Sized> {
    device: &'a D,
    settings: InstallSettings,
    installed: HashSet<String>,
}

impl<'a, D: Device + ?Sized> Installer<'a, D> {
    pub fn new(device: &'a D, settings: InstallSettings) -> Self {
        Self {
            device,
            settings,
            installed: HashSet::new(),
        }
    }

    /// Whether the module's test package was installed by this session.
    pub fn is_installed(&self, module: &TestModuleInfo) -> bool {
        self.installed.contains(&module.test.package)
    }

    pub fn installed_packages(&self) -> &HashSet<String> {
        &self.installed
    }

    /// Installs the module's test APK and app APK unless already done.
    pub async fn ensure_installed(&mut self, module: &TestModuleInfo) -> Result<(), InstallError> {
        if self.is_installed(module) {
            debug!("Package {} already installed", module.test.package);
            return Ok(());
        }

        if self.settings.uninstall_after_test {
            let mut packages: Vec<_> = self.installed.iter().cloned().collect();
            packages.sort();
            for package in packages {
                self.uninstall(&package).await?;
            }
        }

        self.install(&module.test).await?;
        if let Some(app) = &module.app {
            self.install(app).await?;
        }
        Ok(())
    }

    async fn install(&mut self, package: &PackageInfo) -> Result<(), InstallError> {
        let apk = package.apk.to_string_lossy().into_owned();
        let cmd = Command::new("install").args(["-r", "-g", apk.as_str()]);
        self.run_with_retries("install", &apk, cmd).await?;
        self.installed.insert(package.package.clone());
        Ok(())
    }

    async fn uninstall(&mut self, package: &str) -> Result<(), InstallError> {
        let cmd = Command::new("uninstall").arg(package);
        self.run_with_retries("uninstall", package, cmd).await?;
        self.installed.remove(package);
        Ok(())
    }

    async fn run_with_retries(
        &self,
        action: &'static str,
        target: &str,
        cmd: Command,
    ) -> Result<(), InstallError> {
        let cmd = cmd.timeout(self.settings.timeout);
        let attempts = self.settings.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(self.settings.backoff).await;
            }
            debug!("{} {} (attempt {}/{})", action, target, attempt, attempts);
            let start = Instant::now();

            match self.device.exec(&cmd).await {
                Ok(result) if result.output_lines().any(|l| l.eq_ignore_ascii_case("Success")) => {
                    info!("{} {} succeeded in {:.1?}", action, target, start.elapsed());
                    return Ok(());
                }
                Ok(result) => {
                    last_error = result.output_lines().collect::<Vec<_>>().join(" | ");
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                "{} {} failed (attempt {}/{}): {}",
                action, target, attempt, attempts, last_error
            );
        }

        Err(InstallError {
            action,
            target: target.to_string(),
            attempts,
            last_error,
        })
    }
}
