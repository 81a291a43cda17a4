//! droidshard: shards an Android instrumentation test suite across every
//! connected device.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Module**: Test APK metadata and method filtering
//! - **Pool**: Fixed-size chunks of one module's methods, popped once each
//! - **Device**: The command primitive, implemented over adb
//! - **Session**: One per device, installs, instruments and retries chunks
//! - **Instrumentation**: Incremental parser for `am instrument -r` output
//! - **Logcat**: Continuous device log split into one file per test
//! - **Report**: Console, CI result file and JSON summary
//!
//! # Example
//!
//! ```no_run
//! use droidshard::config::load_config;
//! use droidshard::module::{ManifestInspector, load_modules};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("droidshard.toml"))?;
//!     let modules = load_modules(&config, &ManifestInspector).await?;
//!     // ... set up an orchestrator with a provider and a reporter ...
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod instrumentation;
pub mod logcat;
pub mod module;
pub mod orchestrator;
pub mod pool;
pub mod report;
pub mod session;
pub mod tail;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use device::{Device, DeviceProvider};
pub use instrumentation::TestStatus;
pub use module::{TestDetails, TestModule};
pub use orchestrator::{Orchestrator, RunResult};
pub use report::Reporter;
