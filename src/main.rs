//! CLI entry point for the potentiostat engine.
//!
//! A thin consumer of the library's public surface:
//!
//! ```bash
//! potentiostat modes
//! potentiostat describe cv
//! potentiostat run CA --params '{"potential": 0.5, "duration": 60}' --tia-gain 3
//! potentiostat run OCP --params '{"duration": 10}' --mock --output /tmp/runs
//! ```
//!
//! Ctrl-C during `run` requests a cooperative stop; the partial dataset is
//! still written.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use potentiostat_daq::config::Settings;
use potentiostat_daq::data::SinkDescriptor;
use potentiostat_daq::error::DaqError;
use potentiostat_daq::experiment::{self, ExperimentController, MeasurementRequest};
use potentiostat_daq::hardware::{
    DeviceLink, MockPotentiostat, SerialTransportBuilder, SharedDeviceLink, Transport,
};
use potentiostat_daq::tracing_init;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "potentiostat")]
#[command(about = "Run electrochemical measurements on a serial potentiostat", long_about = None)]
struct Cli {
    /// Settings file (defaults to config/potentiostat.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List measurement modes
    Modes,

    /// Print the parameter contract of a mode as JSON
    Describe {
        mode: String,
    },

    /// Run one measurement
    Run {
        /// Mode name (CA, LSV, CV, PSTEP, CP, GS, GCV, STEPSEQ, OCP)
        mode: String,

        /// Mode parameters as a JSON object
        #[arg(long)]
        params: String,

        /// TIA gain index, 0 (1 kOhm) to 4 (10 MOhm)
        #[arg(long, default_value_t = 0)]
        tia_gain: u8,

        /// Sampling interval in milliseconds (defaults to the configured one)
        #[arg(long)]
        sampling_ms: Option<u64>,

        /// Output folder (defaults to storage.output_dir)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Output file name (defaults to a timestamped name)
        #[arg(long)]
        file: Option<String>,

        /// Use the simulated instrument instead of the serial port
        #[arg(long)]
        mock: bool,
    },

    /// Send RESET to the instrument
    Reset {
        #[arg(long)]
        mock: bool,
    },

    /// Send SENSOR_ZERO to the instrument
    Zero {
        #[arg(long)]
        mock: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::load_from(path),
        None => Settings::load(),
    }
    .context("failed to load settings")?;
    tracing_init::init_from_settings(&settings)?;

    match cli.command {
        Commands::Modes => {
            for mode in experiment::list_modes() {
                println!("{:<8} {}", mode.as_str(), mode.summary());
            }
            Ok(())
        }
        Commands::Describe { mode } => {
            let description = experiment::describe_mode(mode.parse()?);
            println!("{}", serde_json::to_string_pretty(&description)?);
            Ok(())
        }
        Commands::Run {
            mode,
            params,
            tia_gain,
            sampling_ms,
            output,
            file,
            mock,
        } => {
            let params = serde_json::from_str(&params).context("--params is not valid JSON")?;
            let sink = SinkDescriptor::Csv {
                folder: output.unwrap_or_else(|| settings.storage.output_dir.clone()),
                file_name: file,
            };
            let mut request = MeasurementRequest::new(mode, params, tia_gain, sink);
            if let Some(ms) = sampling_ms {
                request = request.with_sampling_interval(Duration::from_millis(ms));
            }
            run_measurement(&settings, mock, request).await
        }
        Commands::Reset { mock } => {
            let controller = ExperimentController::from_settings(open_link(&settings, mock)?, &settings);
            controller.reset_device().await?;
            info!("Instrument reset");
            Ok(())
        }
        Commands::Zero { mock } => {
            let controller = ExperimentController::from_settings(open_link(&settings, mock)?, &settings);
            controller.zero_sensor().await?;
            info!("Sensor zeroed");
            Ok(())
        }
    }
}

fn open_link(settings: &Settings, mock: bool) -> Result<SharedDeviceLink> {
    let transport: Box<dyn Transport> = if mock {
        Box::new(MockPotentiostat::new(settings.device.slave_address))
    } else {
        Box::new(
            SerialTransportBuilder::from_settings(&settings.device)
                .open()
                .with_context(|| format!("cannot open serial port {}", settings.device.port))?,
        )
    };
    let link = DeviceLink::from_settings(transport, &settings.device);
    info!(link = %link.describe(), "Instrument link ready");
    Ok(SharedDeviceLink::new(link))
}

async fn run_measurement(settings: &Settings, mock: bool, request: MeasurementRequest) -> Result<()> {
    let controller = Arc::new(ExperimentController::from_settings(
        open_link(settings, mock)?,
        settings,
    ));

    let interrupt = Arc::clone(&controller);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping measurement");
            interrupt.stop();
        }
    });

    match controller.apply_measurement(request).await {
        Ok(dataset) => {
            println!(
                "Measurement completed: {} samples -> {}",
                dataset.len(),
                describe_location(&dataset.path)
            );
            Ok(())
        }
        Err(e) => {
            if let Some(partial) = e.partial_dataset() {
                eprintln!(
                    "Partial data ({} samples) saved to {}",
                    partial.len(),
                    describe_location(&partial.path)
                );
            }
            if matches!(e.cause(), DaqError::Aborted) {
                bail!("measurement stopped by user");
            }
            Err(e.into())
        }
    }
}

fn describe_location(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "memory".to_string())
}
