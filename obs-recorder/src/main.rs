use std::path::Path;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};
use miette::{IntoDiagnostic, Result};
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle, Toplevel};

use obs_recorder::config::Settings;
use obs_recorder::emulator::Emulator;
use obs_recorder::link::{LinkHandle, LinkOptions, LinkSupervisor};
use obs_recorder::notice::{Notice, Notices};
use obs_recorder::radio::{Radio, RadioEvents};
use obs_recorder::recording::{self, Recorder};
use obs_recorder::upload::PortalClient;
use obs_recorder::{Cli, Command, EmulatorKind, RunArgs, VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    env_logger::Builder::new()
        .filter_level(args.verbose.log_level_filter())
        .init();

    let settings = Settings::load(args.config.as_deref()).into_diagnostic()?;

    match args.command.unwrap_or_default() {
        Command::Run(run) => run_link(settings, run).await,
        Command::Decode { file } => decode(&file),
        Command::Upload { file } => upload(&settings, &file).await,
    }
}

async fn run_link(mut settings: Settings, run: RunArgs) -> Result<()> {
    run.apply(&mut settings);
    info!("obs-recorder {} starting", VERSION);
    info!("Recordings go to {}", settings.recordings_dir().display());

    let mut options = LinkOptions::from_settings(&settings);
    options.record_on_connect = run.record;

    let (radio, events) = open_radio(run.emulator).await?;
    let (supervisor, handle) = LinkSupervisor::new(
        radio,
        events,
        Recorder::new(settings.recordings_dir()),
        Notices::new(),
        options,
    );

    Toplevel::new(move |s| async move {
        s.start(SubsystemBuilder::new("Link", |subsys| async move {
            supervisor.run(subsys.create_cancellation_token()).await
        }));
        s.start(SubsystemBuilder::new("Notices", |subsys| {
            report(subsys, handle)
        }));
    })
    .catch_signals()
    .handle_shutdown_requests(Duration::from_secs(5))
    .await
    .map_err(Into::into)
}

async fn open_radio(emulator: Option<EmulatorKind>) -> Result<(Box<dyn Radio>, RadioEvents)> {
    if let Some(kind) = emulator {
        let (radio, events) = Emulator::new(kind.into());
        info!("Using emulated {} sensor", radio.identity().display_name());
        return Ok((Box::new(radio), events));
    }

    open_ble().await
}

#[cfg(feature = "ble")]
async fn open_ble() -> Result<(Box<dyn Radio>, RadioEvents)> {
    let (radio, events) = obs_recorder::ble::BleRadio::new().await.into_diagnostic()?;
    Ok((Box::new(radio), events))
}

#[cfg(not(feature = "ble"))]
async fn open_ble() -> Result<(Box<dyn Radio>, RadioEvents)> {
    Err(miette::miette!(
        "Built without Bluetooth support, use --emulator lite|classic"
    ))
}

/// Log notices and connection changes until shutdown.
async fn report(subsys: SubsystemHandle, handle: LinkHandle) -> Result<(), std::convert::Infallible> {
    let mut notices = handle.notices().subscribe();
    let mut preview = handle.preview();
    let mut connection = preview.borrow().connection;

    loop {
        tokio::select! {
            _ = subsys.on_shutdown_requested() => break,
            r = notices.recv() => match r {
                Ok(notice @ Notice::ConnectionLost { .. })
                | Ok(notice @ Notice::ConfirmDiscarded { .. }) => warn!("{}", notice),
                Ok(notice) => info!("{}", notice),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Missed {} notices", n);
                }
                Err(_) => break,
            },
            r = preview.changed() => {
                if r.is_err() {
                    break;
                }
                let state = preview.borrow_and_update().connection;
                if state != connection {
                    info!("Sensor: {}", state);
                    connection = state;
                }
            }
        }
    }
    Ok(())
}

fn decode(file: &Path) -> Result<()> {
    let recording = recording::read_binary_recording(file).into_diagnostic()?;
    for event in &recording.events {
        println!("{}", recording::event_to_json(event));
    }
    if recording.skipped > 0 {
        warn!(
            "{}: {} corrupt segments skipped",
            file.display(),
            recording.skipped
        );
    }
    Ok(())
}

async fn upload(settings: &Settings, file: &Path) -> Result<()> {
    let client = PortalClient::from_settings(
        settings.portal_url.as_deref(),
        settings.portal_key.as_deref(),
    )
    .into_diagnostic()?;
    let response = client.upload(file).await.into_diagnostic()?;
    if !response.is_empty() {
        println!("{}", response);
    }
    Ok(())
}
