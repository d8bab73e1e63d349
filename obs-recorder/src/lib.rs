//! # OBS Recorder
//!
//! Connects to an OpenBikeSensor over Bluetooth LE, keeps the link alive and
//! records what the sensor measures.
//!
//! This crate provides:
//! - A link supervisor that finds, connects and watches one sensor, and
//!   reconnects (resuming any recording) when the link goes stale or drops
//! - Recording sessions in the binary (Lite) and text (Classic) formats
//! - An emulated sensor of either generation for testing without hardware
//! - Upload of finished recordings to an OpenBikeSensor portal
//!
//! ## Architecture
//!
//! The protocol logic lives in [`obs_core`], which does no I/O. This crate
//! adds the tokio runtime, files and the radio:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                     obs-recorder                       │
//! │  ┌──────────────┐   RadioEvent   ┌──────────────────┐  │
//! │  │ Radio        │───────────────►│ LinkSupervisor   │  │
//! │  │ Emulator or  │◄───────────────│ ConnectionManager│  │
//! │  │ BleRadio     │    requests    │ Pipeline         │  │
//! │  └──────────────┘                └────────┬─────────┘  │
//! │                                           │            │
//! │         ┌─────────────────────┬───────────┴──────┐     │
//! │         ▼                     ▼                  ▼     │
//! │  ┌──────────────┐   ┌──────────────────┐  ┌─────────┐  │
//! │  │ Recorder     │   │ PreviewPublisher │  │ Notices │  │
//! │  │ writer thread│   │ watch, <= 10 Hz  │  │ bcast   │  │
//! │  └──────────────┘   └──────────────────┘  └─────────┘  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example: Recording from the emulator
//!
//! ```rust,no_run
//! use obs_core::DeviceType;
//! use obs_recorder::emulator::Emulator;
//! use obs_recorder::link::{LinkOptions, LinkSupervisor};
//! use obs_recorder::notice::Notices;
//! use obs_recorder::recording::Recorder;
//! use obs_recorder::config::Settings;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = Settings::default();
//!     let (radio, events) = Emulator::new(DeviceType::Lite);
//!     let mut options = LinkOptions::from_settings(&settings);
//!     options.record_on_connect = true;
//!
//!     let (supervisor, _handle) = LinkSupervisor::new(
//!         Box::new(radio),
//!         events,
//!         Recorder::new(settings.recordings_dir()),
//!         Notices::new(),
//!         options,
//!     );
//!     supervisor.run(CancellationToken::new()).await.unwrap();
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `ble` - Real Bluetooth LE radio through btleplug. Without it only the
//!   emulator is available.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use obs_core::DeviceType;

#[cfg(feature = "ble")]
pub mod ble;
pub mod config;
pub mod emulator;
pub mod link;
pub mod notice;
pub mod preview;
pub mod radio;
pub mod recording;
pub mod upload;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Settings file (default: settings.json in the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Connect to a sensor and record (default)
    Run(RunArgs),
    /// Print the events of a binary recording as JSON lines
    Decode {
        file: PathBuf,
    },
    /// Upload a recording to the configured portal
    Upload {
        file: PathBuf,
    },
}

impl Default for Command {
    fn default() -> Self {
        Command::Run(RunArgs::default())
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmulatorKind {
    Lite,
    Classic,
}

impl From<EmulatorKind> for DeviceType {
    fn from(kind: EmulatorKind) -> Self {
        match kind {
            EmulatorKind::Lite => DeviceType::Lite,
            EmulatorKind::Classic => DeviceType::Classic,
        }
    }
}

#[derive(Args, Clone, Debug, Default, PartialEq)]
pub struct RunArgs {
    /// Use an emulated sensor instead of Bluetooth
    #[arg(long, value_enum)]
    pub emulator: Option<EmulatorKind>,

    /// Start recording as soon as a sensor is connected
    #[arg(long, default_value_t = false)]
    pub record: bool,

    /// Connect to the first device whose name contains this (case-insensitive)
    #[arg(long)]
    pub name_filter: Option<String>,

    /// Exchange the left and right sensor
    #[arg(long, default_value_t = false)]
    pub swap_sensors: bool,

    /// Directory for recordings
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    /// Apply command line overrides to loaded settings.
    pub fn apply(&self, settings: &mut config::Settings) {
        if let Some(filter) = &self.name_filter {
            settings.name_filter = filter.clone();
        }
        if self.swap_sensors {
            settings.swap_sensors = true;
        }
        if let Some(output) = &self.output {
            settings.recordings_dir = Some(output.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::parse_from(["obs-recorder", "-v"]);
        assert_eq!(cli.command.unwrap_or_default(), Command::default());
    }

    #[test]
    fn test_run_overrides_settings() {
        let cli = Cli::parse_from([
            "obs-recorder",
            "run",
            "--emulator",
            "classic",
            "--record",
            "--name-filter",
            "bike",
            "--swap-sensors",
            "--config",
            "/tmp/obs.json",
        ]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/obs.json")));
        let Some(Command::Run(run)) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(run.emulator.map(DeviceType::from), Some(DeviceType::Classic));
        assert!(run.record);

        let mut settings = config::Settings::default();
        run.apply(&mut settings);
        assert_eq!(settings.name_filter, "bike");
        assert!(settings.swap_sensors);
        assert!(settings.recordings_dir.is_none());
    }

    #[test]
    fn test_decode_takes_a_file() {
        let cli = Cli::parse_from(["obs-recorder", "decode", "ride.bin"]);
        assert_eq!(
            cli.command,
            Some(Command::Decode {
                file: PathBuf::from("ride.bin")
            })
        );
    }
}
