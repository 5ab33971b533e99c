//! CLI Entry Point for current-scan
//!
//! Provides command-line interface for:
//! - Running a bias scan against real instruments (VISA) or the simulated bench
//! - Printing the sweep a configuration produces
//! - Validating a configuration file
//!
//! # Usage
//!
//! Run the configured sweep on the simulated bench and record it:
//! ```bash
//! current-scan run --simulate --output scan.csv
//! ```
//!
//! Keep measuring at the current bias for 60 s without sweeping:
//! ```bash
//! current-scan run --no-sweep --duration 60
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use current_scan::acquisition::{Acquisition, AcquisitionEvent, AcquisitionSettings, Reading};
use current_scan::config::{ScanConfig, DEFAULT_CONFIG_PATH};
use current_scan::instrument::mock::SimulatedBench;
use current_scan::instrument::Connector;
use current_scan::plot::ScanTraces;
#[cfg(feature = "storage_csv")]
use current_scan::storage::CsvRecorder;
use current_scan::tracing_init::{self, OutputFormat, TracingConfig};
#[cfg(feature = "storage_csv")]
use std::fs::File;
#[cfg(feature = "storage_csv")]
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Peak noise of the simulated meter (A).
const SIMULATED_NOISE_AMPS: f64 = 5e-13;

#[derive(Parser)]
#[command(name = "current-scan")]
#[command(about = "GPIB bias-sweep current acquisition", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the acquisition loop, optionally sweeping the bias voltage
    Run {
        /// Configuration file (defaults to config/default.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Use the simulated bench instead of VISA
        #[arg(long)]
        simulate: bool,

        /// Do not queue the configured sweep
        #[arg(long)]
        no_sweep: bool,

        /// Keep acquiring for at least this many seconds
        #[arg(long)]
        duration: Option<f64>,

        /// Record readings to this CSV file
        #[arg(long)]
        output: Option<PathBuf>,

        /// Log output format: pretty, compact or json
        #[arg(long, default_value = "pretty")]
        log_format: String,
    },

    /// Print the voltages the configured sweep produces
    Sweep {
        /// Configuration file (defaults to config/default.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        /// Configuration file (defaults to config/default.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

struct RunOptions {
    config: Option<PathBuf>,
    simulate: bool,
    no_sweep: bool,
    duration: Option<f64>,
    output: Option<PathBuf>,
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            simulate,
            no_sweep,
            duration,
            output,
            log_format,
        } => {
            run_scan(RunOptions {
                config,
                simulate,
                no_sweep,
                duration,
                output,
                log_format,
            })
            .await
        }
        Commands::Sweep { config } => print_sweep(config),
        Commands::CheckConfig { config } => check_config(config),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<ScanConfig> {
    match path {
        Some(path) => ScanConfig::load_from(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => ScanConfig::load()
            .with_context(|| format!("Failed to load configuration from {}", DEFAULT_CONFIG_PATH)),
    }
}

fn connector_for(config: &ScanConfig, simulate: bool) -> Result<Arc<dyn Connector>> {
    if simulate {
        let bench = SimulatedBench::new(&config.source.resource, &config.meter.resource)
            .with_noise(SIMULATED_NOISE_AMPS)
            .with_journal_capacity(0);
        return Ok(Arc::new(bench));
    }
    hardware_connector()
}

#[cfg(feature = "instrument_visa")]
fn hardware_connector() -> Result<Arc<dyn Connector>> {
    Ok(Arc::new(current_scan::instrument::visa::VisaConnector))
}

#[cfg(not(feature = "instrument_visa"))]
fn hardware_connector() -> Result<Arc<dyn Connector>> {
    bail!("VISA support not compiled in: rebuild with --features instrument_visa, or pass --simulate")
}

/// Everything the CLI does with readings as they arrive.
struct ScanProgress {
    traces: ScanTraces,
    readings: u64,
    setpoints_applied: usize,
    #[cfg(feature = "storage_csv")]
    recorder: Option<CsvRecorder<BufWriter<File>>>,
}

impl ScanProgress {
    fn record(&mut self, reading: &Reading) -> Result<()> {
        self.readings += 1;
        if reading.voltage_changed {
            self.setpoints_applied += 1;
        }
        self.traces.push(reading);
        #[cfg(feature = "storage_csv")]
        if let Some(recorder) = self.recorder.as_mut() {
            recorder.record(reading)?;
        }
        Ok(())
    }

    #[cfg(feature = "storage_csv")]
    fn finish(self, output: Option<&PathBuf>) -> Result<()> {
        if let (Some(recorder), Some(path)) = (self.recorder, output) {
            let rows = recorder.finish()?;
            println!("💾 Wrote {} readings to {}", rows, path.display());
        }
        Ok(())
    }

    #[cfg(not(feature = "storage_csv"))]
    fn finish(self, _output: Option<&PathBuf>) -> Result<()> {
        Ok(())
    }
}

async fn run_scan(options: RunOptions) -> Result<()> {
    let config = load_config(options.config)?;
    let format: OutputFormat = options.log_format.parse().map_err(anyhow::Error::msg)?;
    let tracing_config = TracingConfig::from_scan_config(&config)
        .map_err(anyhow::Error::msg)?
        .with_format(format);
    tracing_init::init(tracing_config).map_err(anyhow::Error::msg)?;

    let min_duration = options
        .duration
        .map(Duration::try_from_secs_f64)
        .transpose()
        .context("--duration must be a non-negative number of seconds")?;

    println!("🔬 {}", config.application.name);
    println!("   Bias source: {}", config.source.resource);
    println!("   Picoammeter: {}", config.meter.resource);
    println!();

    let connector = connector_for(&config, options.simulate)?;
    let (acquisition, mut events) =
        Acquisition::new(connector, AcquisitionSettings::from(&config));
    let acquisition = Arc::new(acquisition);

    let mut progress = ScanProgress {
        traces: ScanTraces::new(),
        readings: 0,
        setpoints_applied: 0,
        #[cfg(feature = "storage_csv")]
        recorder: match &options.output {
            Some(path) => Some(
                CsvRecorder::create_with_metadata(path, &config)
                    .with_context(|| format!("Failed to create {}", path.display()))?,
            ),
            None => None,
        },
    };
    #[cfg(not(feature = "storage_csv"))]
    if options.output.is_some() {
        bail!("CSV recording not compiled in: rebuild with --features storage_csv");
    }

    acquisition.start()?;

    let sweep_points = if options.no_sweep {
        0
    } else {
        let sweep = config.sweep.to_sweep()?;
        println!(
            "📈 Sweeping {} V → {} V in {} V steps",
            sweep.start(),
            sweep.end(),
            sweep.step()
        );
        acquisition.enqueue_sweep(&sweep)
    };
    if sweep_points == 0 && min_duration.is_none() {
        println!("⏳ Acquiring until Ctrl+C");
    }

    let started = Instant::now();
    let mut failure = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(Duration::from_millis(100));

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(AcquisitionEvent::Started) => println!("✅ Instruments initialized"),
                Some(AcquisitionEvent::Reading(reading)) => {
                    if reading.voltage_changed {
                        info!(voltage = reading.voltage, current = reading.current, "Setpoint reading");
                    } else {
                        debug!(voltage = reading.voltage, current = reading.current, "Reading");
                    }
                    progress.record(&reading)?;
                }
                Some(AcquisitionEvent::Stopped) | None => break,
                Some(AcquisitionEvent::Failed(message)) => {
                    failure = Some(message);
                    break;
                }
            },
            _ = &mut ctrl_c => {
                println!();
                println!("🛑 Interrupted");
                break;
            }
            _ = tick.tick() => {}
        }

        let sweep_done = sweep_points > 0 && progress.setpoints_applied >= sweep_points;
        let duration_done = min_duration.map(|d| started.elapsed() >= d);
        match (sweep_done, duration_done) {
            (true, None) | (true, Some(true)) => break,
            (false, Some(true)) if sweep_points == 0 => break,
            _ => {}
        }
    }

    let controller = Arc::clone(&acquisition);
    tokio::task::spawn_blocking(move || controller.stop())
        .await
        .context("Stop task failed")??;

    // Readings produced while the loop wound down.
    while let Ok(event) = events.try_recv() {
        match event {
            AcquisitionEvent::Reading(reading) => progress.record(&reading)?,
            AcquisitionEvent::Failed(message) if failure.is_none() => failure = Some(message),
            _ => {}
        }
    }

    println!();
    println!("📊 Scan summary");
    println!("   Readings: {}", progress.readings);
    println!("   Setpoints applied: {}", progress.setpoints_applied);
    println!(
        "   Current-vs-voltage points: {}",
        progress.traces.current_vs_voltage().len()
    );
    println!("   Elapsed: {:.1} s", started.elapsed().as_secs_f64());
    progress.finish(options.output.as_ref())?;

    if let Some(message) = failure {
        warn!(error = %message, "Acquisition ended with an error");
        eprintln!("❌ Acquisition failed: {}", message);
        bail!("acquisition failed: {}", message);
    }
    println!("✅ Scan complete");
    Ok(())
}

fn print_sweep(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    let sweep = config.sweep.to_sweep()?;
    let values = sweep.values();

    println!(
        "📈 {} V → {} V in {} V steps: {} points",
        sweep.start(),
        sweep.end(),
        sweep.step(),
        values.len()
    );
    for value in values {
        println!("{:.6}", value);
    }
    Ok(())
}

fn check_config(config: Option<PathBuf>) -> Result<()> {
    let config = load_config(config)?;
    println!("✅ Configuration valid");
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
