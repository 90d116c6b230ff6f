//! CLI Entry Point for wire-scan
//!
//! Provides command-line interface for:
//! - Running a simulated scan against in-memory devices
//! - Validating a configuration file
//!
//! # Usage
//!
//! Simulate two scanners and a harp:
//! ```bash
//! wire-scan simulate --scanners 2 --harps 1 --steps 20
//! ```
//!
//! Check a configuration file:
//! ```bash
//! wire-scan check-config --config config/wire_scan.toml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use wire_scan::channel::mock::MockRemote;
use wire_scan::config::{AppConfig, DEFAULT_CONFIG_PATH};
use wire_scan::device::{Device, DeviceId};
use wire_scan::logging;
use wire_scan::scan::{
    AcquisitionMode, ParameterMode, ScanListener, ScanMode, ScanOrchestrator, ScanRequest,
    StartOutcome,
};

#[derive(Parser)]
#[command(name = "wire-scan")]
#[command(about = "Wire scanner and harp scan orchestrator", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan against simulated devices
    Simulate {
        /// Number of profile scanners
        #[arg(long, default_value = "2")]
        scanners: usize,

        /// Number of wire harps
        #[arg(long, default_value = "1")]
        harps: usize,

        /// Steps per device (defaults to the configured sample count)
        #[arg(long)]
        steps: Option<i64>,

        /// Delay between simulated steps, in milliseconds
        #[arg(long, default_value = "50")]
        step_delay_ms: u64,

        /// Fold samples into a running average
        #[arg(long)]
        averaging: bool,

        /// Keep each device's current configuration instead of writing defaults
        #[arg(long)]
        keep_configuration: bool,

        /// Make the first scanner report a failure after this many steps
        #[arg(long)]
        fail_after: Option<i64>,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Load and validate the configuration
    CheckConfig,
}

/// Prints lifecycle notifications to the terminal.
struct ConsoleListener;

impl ScanListener for ConsoleListener {
    fn on_started(&self, devices: &[Device], mode: ScanMode) {
        println!("▶️  Scan started on {} device(s) ({mode})", devices.len());
    }

    fn on_progress(&self, device: &DeviceId, progress: u32, max: u32) {
        println!("   {device}: {progress}/{max}");
    }

    fn on_device_failed(&self, device: &DeviceId, reason: &str) {
        eprintln!("❌ {device}: {reason}");
    }

    fn on_status(&self, message: &str) {
        println!("📡 {message}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config)?;

    match cli.command {
        Commands::Simulate {
            scanners,
            harps,
            steps,
            step_delay_ms,
            averaging,
            keep_configuration,
            fail_after,
            json,
        } => {
            let options = SimulateOptions {
                scanners,
                harps,
                steps: steps.unwrap_or(i64::from(config.scan.sample_count)),
                step_delay: Duration::from_millis(step_delay_ms),
                averaging,
                keep_configuration,
                fail_after,
                json,
            };
            simulate(config, options).await
        }
        Commands::CheckConfig => check_config(&cli.config, &config),
    }
}

struct SimulateOptions {
    scanners: usize,
    harps: usize,
    steps: i64,
    step_delay: Duration,
    averaging: bool,
    keep_configuration: bool,
    fail_after: Option<i64>,
    json: bool,
}

async fn simulate(config: AppConfig, options: SimulateOptions) -> Result<()> {
    if options.scanners + options.harps == 0 {
        bail!("Nothing to simulate: pass --scanners or --harps");
    }

    println!("🔧 Initializing simulated devices...");
    let mut devices = Vec::new();
    devices.extend((1..=options.scanners).map(|n| Device::profile_scanner(format!("WS{n:02}"))));
    devices.extend((1..=options.harps).map(|n| Device::wire_harp(format!("WH{n:02}"))));

    let remote = MockRemote::with_devices(&devices);
    for (index, device) in devices.iter().enumerate() {
        match options.fail_after {
            Some(after) if index == 0 => {
                remote.simulate_failure(device, options.steps, options.step_delay, after)
            }
            _ => remote.simulate_scan(device, options.steps, options.step_delay),
        }
    }

    let orchestrator = ScanOrchestrator::new(Arc::new(remote), config.scan.clone());
    orchestrator.register_listener(Arc::new(ConsoleListener));

    let parameters = if options.keep_configuration {
        ParameterMode::CurrentConfiguration
    } else {
        ParameterMode::Defaults
    };
    let acquisition = if options.averaging {
        AcquisitionMode::Averaging
    } else {
        AcquisitionMode::StepScan
    };
    let request = ScanRequest::new(devices, options.steps)
        .with_parameter_mode(parameters)
        .with_acquisition_mode(acquisition);

    match orchestrator.start(request).await? {
        StartOutcome::Started { session_id, .. } => {
            info!(session = %session_id, "Simulation running");
            tokio::select! {
                () = orchestrator.wait_until_idle() => {}
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    println!("\n⚠️  Interrupted, aborting scan...");
                    orchestrator.shutdown().await;
                }
            }
        }
        StartOutcome::Terminated { reason, .. } => println!("⚠️  {reason}"),
        StartOutcome::Aborted { reason } => println!("⚠️  {reason}"),
    }

    let outcome = orchestrator.last_outcome();
    let snapshot = orchestrator.progress_snapshot();
    if options.json {
        let report = serde_json::json!({
            "outcome": outcome,
            "progress": snapshot,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        if let Some(outcome) = &outcome {
            println!("✅ Session {} {}", outcome.session_id, outcome.kind);
        }
        for (device, progress) in &snapshot {
            println!(
                "   {device}: {}/{} ({:.0}%, {})",
                progress.progress,
                progress.max,
                progress.fraction() * 100.0,
                progress.motion
            );
        }
    }
    orchestrator.shutdown().await;
    Ok(())
}

fn check_config(path: &std::path::Path, config: &AppConfig) -> Result<()> {
    println!("✅ Configuration valid: {}", path.display());
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}
