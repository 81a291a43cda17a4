//! droidshard CLI - shards Android instrumentation tests across devices.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use droidshard::config::{self, Config};
use droidshard::device::adb::AdbBridge;
use droidshard::device::{Device, DeviceProvider};
use droidshard::module::{ManifestInspector, load_modules};
use droidshard::orchestrator::Orchestrator;
use droidshard::report::{CiResultReporter, ConsoleReporter, JsonReporter, MultiReporter};

#[derive(Parser)]
#[command(name = "droidshard")]
#[command(about = "Shards Android instrumentation tests across every connected device", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "droidshard.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests on every online device
    Run {
        /// Override the number of test methods per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Override how often a failing chunk is retried
        #[arg(long)]
        max_retries: Option<u32>,

        /// Override the output directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// List online devices
    Devices,

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            chunk_size,
            max_retries,
            output_dir,
        } => run_tests(&cli.config, cli.verbose, chunk_size, max_retries, output_dir).await,
        Commands::Devices => {
            init_logging(cli.verbose)?;
            list_devices(&cli.config).await
        }
        Commands::Validate => {
            init_logging(cli.verbose)?;
            validate_config(&cli.config)
        }
        Commands::Init => {
            init_logging(cli.verbose)?;
            init_config()
        }
    }
}

/// `RUST_LOG` wins over `verbose`.
fn init_logging(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install logger: {}", e))
}

async fn run_tests(
    config_path: &Path,
    verbose: bool,
    chunk_size: Option<usize>,
    max_retries: Option<u32>,
    output_dir: Option<PathBuf>,
) -> Result<()> {
    let mut config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    if let Some(chunk_size) = chunk_size {
        config.run.chunk_size = chunk_size;
    }
    if let Some(max_retries) = max_retries {
        config.run.max_chunk_retries = max_retries;
    }
    if let Some(output_dir) = output_dir {
        config.run.output_dir = output_dir;
    }
    config.run.verbose |= verbose;
    config.validate()?;

    init_logging(config.run.verbose)?;
    info!("Loaded configuration from {}", config_path.display());

    let modules = load_modules(&config, &ManifestInspector).await?;

    let reporter = create_reporter(&config);
    let provider = AdbBridge::new(config.adb.clone());
    let orchestrator = Orchestrator::new(config, provider, reporter);

    let result = orchestrator.run(&modules).await?;
    std::process::exit(result.exit_code());
}

async fn list_devices(config_path: &Path) -> Result<()> {
    let adb = if config_path.exists() {
        config::load_config(config_path)?.adb
    } else {
        Config::default().adb
    };

    let devices = AdbBridge::new(adb).online_devices().await?;
    for device in &devices {
        println!("{}\t{}", device.serial(), device.model());
    }
    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(config) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Chunk size: {}", config.run.chunk_size);
            println!("  Chunk timeout: {}s", config.run.chunk_timeout_secs);
            println!("  Chunk retries: {}", config.run.max_chunk_retries);
            println!(
                "  Install timeout: {}s ({} retries)",
                config.run.install_timeout_secs, config.run.max_install_retries
            );
            println!("  Run timeout: {}m", config.run.run_timeout_mins);
            println!("  Output: {}", config.run.output_dir.display());
            println!("  Result file: {}", config.run.result_file.display());
            println!("  adb: {}", config.adb.path);
            if config.pull.enabled() {
                println!("  Pull: {}", config.pull.device_dir);
            }
            println!("  Modules: {}", config.modules.len());
            for module in &config.modules {
                match &module.app_apk {
                    Some(app) => {
                        println!("    {} (app: {})", module.test_apk.display(), app.display())
                    }
                    None => println!("    {}", module.test_apk.display()),
                }
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    }
}

const STARTER_CONFIG: &str = r#"# droidshard configuration file

[run]
chunk_size = 1
chunk_timeout_secs = 120
max_chunk_retries = 1
run_timeout_mins = 60
output_dir = "droidshard-output"
result_file = "droidshard-result.txt"

[filter]
not_annotations = ["Ignore"]

# [pull]
# device_dir = "/sdcard/test-files"
# host_dir = "device-files"

# Each test APK needs a <name>.tests.json manifest next to it.
[[modules]]
test_apk = "app/build/outputs/apk/androidTest/debug/app-debug-androidTest.apk"
app_apk = "app/build/outputs/apk/debug/app-debug.apk"
"#;

fn init_config() -> Result<()> {
    let path = PathBuf::from("droidshard.toml");
    if path.exists() {
        eprintln!("droidshard.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, STARTER_CONFIG)?;
    println!("Created droidshard.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  droidshard run");

    Ok(())
}

fn create_reporter(config: &Config) -> MultiReporter {
    MultiReporter::new()
        .with_reporter(ConsoleReporter::new(config.run.verbose))
        .with_reporter(CiResultReporter::new(&config.run.result_file))
        .with_reporter(JsonReporter::new(config.run.output_dir.join("summary.json")))
}
