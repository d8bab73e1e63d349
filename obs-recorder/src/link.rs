//! Link supervisor.
//!
//! A single task owns the [`ConnectionManager`], the radio and the per-link
//! [`Pipeline`]. Everything that changes link state goes through its loop:
//!
//! ```text
//!   RadioEvent ───┐
//!   LinkCommand ──┤                 ┌─► Recorder (session writer thread)
//!   watchdog 1 Hz ┼─► LinkSupervisor┼─► PreviewPublisher (watch, ≤10 Hz)
//!   reconnect ────┤                 └─► Notices (broadcast)
//!   preview flush ┘
//! ```
//!
//! Recording start and stop go through `spawn_blocking`, since both wait for
//! the session's writer thread.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use obs_core::connection::{PendingResume, WATCHDOG_INTERVAL_MS};
use obs_core::device::{
    BATTERY_LEVEL_CHARACTERISTIC, CLASSIC_ID_CHARACTERISTIC, CLASSIC_OFFSET_CHARACTERISTIC,
    FIRMWARE_REVISION_CHARACTERISTIC,
};
use obs_core::pipeline::{MessageLevel, Output};
use obs_core::protocol::{c_string, classic};
use obs_core::throttle::PREVIEW_INTERVAL_MS;
use obs_core::{
    ConnectionManager, DeviceType, DisconnectReason, DiscoveryOutcome, LinkTimeouts, Pipeline,
    PipelineConfig, ReconnectPlan, SensorSource, WatchdogVerdict,
};

use crate::config::Settings;
use crate::notice::{Notice, Notices};
use crate::preview::{PreviewPublisher, PreviewState};
use crate::radio::{Radio, RadioError, RadioEvent, RadioEvents};
use crate::recording::{Recorder, SessionInfo, SessionMetadata, SessionSummary};

/// Operator requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkCommand {
    StartRecording,
    StopRecording,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkOptions {
    pub name_filter: String,
    pub timeouts: LinkTimeouts,
    pub pipeline: PipelineConfig,
    /// Start recording once the next sensor is connected
    pub record_on_connect: bool,
    pub local_time: bool,
}

impl LinkOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            name_filter: settings.name_filter.clone(),
            timeouts: settings.link_timeouts(),
            pipeline: settings.pipeline_config(),
            record_on_connect: false,
            local_time: settings.uses_local_time(),
        }
    }
}

/// Everything outside the supervisor needs to talk to it.
#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<LinkCommand>,
    preview: watch::Receiver<PreviewState>,
    notices: Notices,
}

impl LinkHandle {
    /// Returns false if the supervisor has stopped.
    pub async fn send(&self, command: LinkCommand) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn preview(&self) -> watch::Receiver<PreviewState> {
        self.preview.clone()
    }

    pub fn notices(&self) -> &Notices {
        &self.notices
    }
}

enum Internal {
    ReconnectDue(u64),
}

pub struct LinkSupervisor {
    radio: Box<dyn Radio>,
    events: RadioEvents,
    commands: mpsc::Receiver<LinkCommand>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    manager: ConnectionManager,
    pipeline: Option<Pipeline>,
    recorder: Recorder,
    notices: Notices,
    preview: PreviewPublisher,
    options: LinkOptions,
    metadata: SessionMetadata,
    reconnect: Option<JoinHandle<()>>,
    started: Instant,
}

impl LinkSupervisor {
    pub fn new(
        radio: Box<dyn Radio>,
        events: RadioEvents,
        recorder: Recorder,
        notices: Notices,
        options: LinkOptions,
    ) -> (Self, LinkHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let preview = PreviewPublisher::new();

        let handle = LinkHandle {
            commands: command_tx,
            preview: preview.subscribe(),
            notices: notices.clone(),
        };
        let supervisor = LinkSupervisor {
            radio,
            events,
            commands: command_rx,
            internal_tx,
            internal_rx,
            manager: ConnectionManager::new(options.timeouts),
            pipeline: None,
            recorder,
            notices,
            preview,
            metadata: SessionMetadata::default(),
            options,
            reconnect: None,
            started: Instant::now(),
        };
        (supervisor, handle)
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), RadioError> {
        info!("Link: supervisor started, looking for '{}'", self.options.name_filter);

        let mut watchdog = interval(Duration::from_millis(WATCHDOG_INTERVAL_MS));
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flush = interval(Duration::from_millis(PREVIEW_INTERVAL_MS));
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut commands_open = true;

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Link: shutdown requested");
                    break Ok(());
                }
                event = self.events.recv() => match event {
                    Some(event) => self.on_radio_event(event).await,
                    None => break Err(RadioError::Unavailable("radio event stream ended".into())),
                },
                command = self.commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => commands_open = false,
                },
                Some(Internal::ReconnectDue(episode)) = self.internal_rx.recv() => {
                    self.on_reconnect_due(episode).await;
                }
                _ = watchdog.tick() => self.on_watchdog().await,
                _ = flush.tick() => {
                    let now = self.now_ms();
                    self.preview.flush(now);
                }
            }
            self.sync_preview();
        };

        self.shutdown().await;
        result
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
        self.stop_recording().await;
        if self.manager.state().has_link() {
            if let Some(device) = self.manager.device() {
                let id = device.id.clone();
                if let Err(e) = self.radio.disconnect(&id).await {
                    debug!("Link: disconnect on shutdown: {}", e);
                }
            }
        }
    }

    fn sync_preview(&mut self) {
        let state = self.manager.state();
        if self.preview.state().connection != state {
            let now = self.now_ms();
            self.preview.update(now, |s| s.connection = state);
        }
    }

    // -------------------------------------------------------------------------
    // Radio events
    // -------------------------------------------------------------------------

    async fn on_radio_event(&mut self, event: RadioEvent) {
        let now = self.now_ms();
        match event {
            RadioEvent::PoweredOn => {
                info!("Link: radio powered on");
                self.manager.powered_on(now);
                self.start_scan().await;
            }
            RadioEvent::PoweredOff => {
                warn!("Link: radio powered off");
                self.stop_recording().await;
                self.pipeline = None;
                self.manager.powered_off(now);
                self.preview.update(now, |s| s.clear_link());
            }
            RadioEvent::Discovered {
                device,
                connectable,
            } => {
                if !self.manager.candidate_discovered(
                    &device,
                    connectable,
                    &self.options.name_filter,
                    now,
                ) {
                    debug!("Link: skipping {}", device.display_name());
                    return;
                }
                info!("Link: connecting to {} ({})", device.display_name(), device.id);
                if let Err(e) = self.radio.stop_scan().await {
                    debug!("Link: stop scan: {}", e);
                }
                let limit = self.setup_limit();
                match timeout(limit, self.radio.connect(&device.id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Link: connect to {} failed: {}", device.id, e);
                        self.teardown(DisconnectReason::Error).await;
                    }
                    Err(_) => {
                        warn!("Link: connect to {} timed out", device.id);
                        self.teardown(DisconnectReason::DiscoveryTimeout).await;
                    }
                }
            }
            RadioEvent::Connected(id) => {
                if !self.is_current(&id) {
                    return;
                }
                self.manager.link_connected(now);
                let limit = self.setup_limit();
                match timeout(limit, self.radio.discover_services(&id)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!("Link: service discovery on {} failed: {}", id, e);
                        self.teardown(DisconnectReason::Error).await;
                    }
                    Err(_) => {
                        warn!("Link: service discovery on {} timed out", id);
                        self.teardown(DisconnectReason::DiscoveryTimeout).await;
                    }
                }
            }
            RadioEvent::ConnectFailed { id, error } => {
                if self.is_current(&id) && self.manager.state().has_link() {
                    warn!("Link: connect to {} failed: {}", id, error);
                    self.teardown(DisconnectReason::Error).await;
                }
            }
            RadioEvent::ServicesDiscovered { id, services } => {
                if !self.is_current(&id) {
                    return;
                }
                match self.manager.services_discovered(&services, now) {
                    DiscoveryOutcome::Ready {
                        device_type,
                        resume,
                    } => self.on_ready(device_type, resume).await,
                    DiscoveryOutcome::Incompatible(plan) => {
                        warn!("Link: {} is not an OpenBikeSensor, ignoring it", id);
                        if let Err(e) = self.radio.disconnect(&id).await {
                            debug!("Link: disconnect {}: {}", id, e);
                        }
                        self.schedule_reconnect(plan);
                    }
                    DiscoveryOutcome::Ignored => {
                        debug!("Link: late service list from {}", id);
                    }
                }
            }
            RadioEvent::Notification {
                characteristic,
                data,
            } => self.on_notification(&characteristic, &data, now),
            RadioEvent::Disconnected(id) => {
                if self.is_current(&id) && self.manager.link_disconnected() {
                    warn!("Link: {} disconnected", id);
                    self.teardown(DisconnectReason::LinkLost).await;
                } else {
                    debug!("Link: {} disconnected", id);
                }
            }
        }
    }

    /// Upper bound for a single connect or discovery request.
    fn setup_limit(&self) -> Duration {
        Duration::from_millis(self.options.timeouts.discovery_timeout_ms)
    }

    fn is_current(&self, id: &obs_core::DeviceId) -> bool {
        self.manager.device().is_some_and(|d| d.id == *id)
    }

    async fn start_scan(&mut self) {
        if let Err(e) = self.radio.start_scan().await {
            error!("Link: cannot start scanning: {}", e);
        }
    }

    /// Subscribe, read device information and resume or start recording.
    async fn on_ready(&mut self, device_type: DeviceType, resume: Option<PendingResume>) {
        let now = self.now_ms();
        let mut pipeline = Pipeline::new(device_type, self.options.pipeline);

        for characteristic in device_type.notify_characteristics() {
            if let Err(e) = self.radio.subscribe(characteristic).await {
                warn!("Link: cannot subscribe to {}: {}", characteristic, e);
                self.teardown(DisconnectReason::Error).await;
                return;
            }
        }

        let device_name = self.manager.device().map(|d| d.display_name().to_string());
        let mut metadata = SessionMetadata {
            device_name: device_name.clone(),
            handlebar_width_cm: self.options.pipeline.handlebar_width_cm,
            local_time: self.options.local_time,
            ..Default::default()
        };

        let battery = match self.radio.read(BATTERY_LEVEL_CHARACTERISTIC).await {
            Ok(data) => data.first().copied(),
            Err(e) => {
                debug!("Link: no battery level: {}", e);
                None
            }
        };
        match self.radio.read(FIRMWARE_REVISION_CHARACTERISTIC).await {
            Ok(data) => metadata.firmware_version = c_string(&data),
            Err(e) => debug!("Link: no firmware revision: {}", e),
        }

        if let Pipeline::Classic(classic_pipeline) = &mut pipeline {
            if let Some(level) = battery {
                classic_pipeline.set_battery_level(level);
            }
            match self.radio.read(CLASSIC_OFFSET_CHARACTERISTIC).await {
                Ok(data) => match classic::parse_offsets(&data) {
                    Ok(offsets) => {
                        classic_pipeline.set_offsets(offsets);
                        metadata.offsets = Some(classic_pipeline.offsets());
                    }
                    Err(e) => warn!("Link: bad offsets: {}", e),
                },
                Err(e) => warn!("Link: cannot read offsets: {}", e),
            }
            match self.radio.read(CLASSIC_ID_CHARACTERISTIC).await {
                Ok(data) => match classic::parse_device_id(&data) {
                    Ok(id) => metadata.device_id = Some(id),
                    Err(e) => warn!("Link: bad device id: {}", e),
                },
                Err(e) => warn!("Link: cannot read device id: {}", e),
            }
        }

        info!(
            "Link: connected to {} sensor {}",
            device_type,
            device_name.as_deref().unwrap_or("?")
        );
        self.pipeline = Some(pipeline);
        self.metadata = metadata;
        self.preview.update(now, |s| {
            s.device_name = device_name;
            s.device_type = Some(device_type);
            s.battery_percent = battery.map(f32::from);
        });

        if let Some(resume) = resume {
            if resume.device_type != device_type {
                warn!(
                    "Link: resuming a {} recording with a {} sensor",
                    resume.device_type, device_type
                );
            }
            if let Some(info) = self.start_recording(device_type).await {
                self.notices.publish(Notice::RecordingResumed {
                    device_type,
                    path: info.path.display().to_string(),
                });
            }
        } else if self.options.record_on_connect {
            // Only the first connection
            self.options.record_on_connect = false;
            if !self.recorder.is_recording() {
                self.start_recording(device_type).await;
            }
        }
    }

    fn on_notification(&mut self, characteristic: &str, data: &[u8], now: u64) {
        let Some(pipeline) = self.pipeline.as_mut() else {
            debug!("Link: notification without a pipeline");
            return;
        };
        self.manager.notification_received(now);

        let outputs = match pipeline.notification(characteristic, data, now) {
            Ok(outputs) => outputs,
            Err(e) => {
                debug!("Link: dropping notification on {}: {}", characteristic, e);
                return;
            }
        };
        let left_minimum = pipeline.minimum(SensorSource::Left, now);

        for output in outputs {
            match output {
                Output::Persist(record) => self.recorder.record(record),
                Output::Preview(update) => self.preview.update(now, |s| s.apply(update)),
                Output::Overtake(overtake) => {
                    info!("Link: overtake at {:?} cm", overtake.distance_cm);
                    self.preview
                        .update(now, |s| s.last_overtake = Some(overtake));
                    self.notices.publish(Notice::Overtake(overtake));
                }
                Output::ConfirmDiscarded(press) => {
                    self.notices.publish(Notice::ConfirmDiscarded {
                        left_cm: press.left_cm,
                        right_cm: press.right_cm,
                    });
                }
                Output::DeviceMessage { level, text } => match level {
                    MessageLevel::Debug => debug!("Sensor: {}", text),
                    MessageLevel::Info => info!("Sensor: {}", text),
                    MessageLevel::Warning => warn!("Sensor: {}", text),
                    MessageLevel::Error => error!("Sensor: {}", text),
                },
            }
        }
        self.preview
            .update(now, |s| s.left_minimum_cm = left_minimum);
    }

    // -------------------------------------------------------------------------
    // Commands, watchdog, reconnect
    // -------------------------------------------------------------------------

    async fn on_command(&mut self, command: LinkCommand) {
        debug!("Link: command {:?}", command);
        match command {
            LinkCommand::StartRecording => {
                let device_type = self.pipeline.as_ref().map(Pipeline::device_type);
                match device_type {
                    Some(device_type) if self.manager.state().allows_recording() => {
                        self.start_recording(device_type).await;
                    }
                    _ => {
                        info!("Link: recording will start once a sensor is connected");
                        self.options.record_on_connect = true;
                    }
                }
            }
            LinkCommand::StopRecording => {
                self.options.record_on_connect = false;
                if self.manager.cancel_resume().is_some() {
                    info!("Link: recording will not resume");
                }
                self.stop_recording().await;
            }
            LinkCommand::Disconnect => {
                if self.manager.state().has_link() {
                    self.teardown(DisconnectReason::User).await;
                }
            }
        }
    }

    async fn on_watchdog(&mut self) {
        let state = self.manager.state();
        if !state.has_link() {
            return;
        }
        let link_up = match self.manager.device() {
            Some(device) => self.radio.is_connected(&device.id).await,
            None => false,
        };
        let now = self.now_ms();
        if let WatchdogVerdict::ForceDisconnect(reason) = self.manager.watchdog_tick(now, link_up) {
            warn!("Link: watchdog: {}", reason);
            self.teardown(reason).await;
        }
    }

    async fn on_reconnect_due(&mut self, episode: u64) {
        let now = self.now_ms();
        if self.manager.reconnect_due(episode, now) {
            info!("Link: scanning again");
            self.start_scan().await;
        } else {
            debug!("Link: reconnect for episode {} superseded", episode);
        }
    }

    /// Stop recording (remembering it for forced teardowns), close the link
    /// and plan the reconnect.
    async fn teardown(&mut self, reason: DisconnectReason) {
        let device_type = self.pipeline.as_ref().map(Pipeline::device_type);
        let was_recording = self.stop_recording().await.is_some();
        let resume = match device_type {
            Some(device_type) if was_recording && reason.is_forced() => {
                Some(PendingResume { device_type })
            }
            _ => None,
        };

        if let Some(device) = self.manager.device() {
            let id = device.id.clone();
            if let Err(e) = self.radio.disconnect(&id).await {
                debug!("Link: disconnect {}: {}", id, e);
            }
        }

        let now = self.now_ms();
        let plan = self.manager.begin_disconnect(reason, resume, now);
        if matches!(
            reason,
            DisconnectReason::LinkLost
                | DisconnectReason::Stale
                | DisconnectReason::DiscoveryTimeout
                | DisconnectReason::Error
        ) {
            self.notices.publish(Notice::ConnectionLost {
                reason,
                episode: plan.episode,
            });
        }
        self.pipeline = None;
        self.preview.update(now, |s| s.clear_link());
        self.schedule_reconnect(plan);
    }

    fn schedule_reconnect(&mut self, plan: ReconnectPlan) {
        if let Some(handle) = self.reconnect.take() {
            handle.abort();
        }
        let tx = self.internal_tx.clone();
        self.reconnect = Some(tokio::spawn(async move {
            sleep(Duration::from_millis(plan.delay_ms)).await;
            let _ = tx.send(Internal::ReconnectDue(plan.episode));
        }));
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    async fn start_recording(&mut self, device_type: DeviceType) -> Option<SessionInfo> {
        let recorder = self.recorder.clone();
        let metadata = self.metadata.clone();
        let result =
            tokio::task::spawn_blocking(move || recorder.start(device_type, metadata)).await;
        let info = match result {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                error!("Link: cannot start recording: {}", e);
                return None;
            }
            Err(e) => {
                error!("Link: recording start task failed: {}", e);
                return None;
            }
        };
        let now = self.now_ms();
        self.preview.update(now, |s| s.recording = true);
        Some(info)
    }

    async fn stop_recording(&mut self) -> Option<SessionSummary> {
        if !self.recorder.is_recording() {
            return None;
        }
        let recorder = self.recorder.clone();
        let result = tokio::task::spawn_blocking(move || recorder.finish()).await;
        let now = self.now_ms();
        self.preview.update(now, |s| s.recording = false);
        match result {
            Ok(Ok(Some(summary))) => {
                info!(
                    "Link: recording {} finished, {} records, {} overtakes",
                    summary.id, summary.records_written, summary.confirmed
                );
                Some(summary)
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                error!("Link: cannot finish recording: {}", e);
                None
            }
            Err(e) => {
                error!("Link: recording stop task failed: {}", e);
                None
            }
        }
    }
}
