//! Emulated sensor.
//!
//! Behaves like a single OpenBikeSensor of either generation next to an
//! unrelated BLE device. Once notifications are enabled it streams a repeating
//! ride: alternating left/right distances every tick, a position every
//! second, a button press every five seconds and (Lite) a battery report
//! every ten seconds.
//!
//! [`EmulatorControl`] lets tests break the link in the ways a real sensor
//! does: going quiet, dropping the link silently or disconnecting. It can
//! also make connection setup hang.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use protobuf::EnumOrUnknown;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use obs_core::device::{
    uuid_eq, BATTERY_LEVEL_CHARACTERISTIC, BATTERY_SERVICE, CLASSIC_BUTTON_CHARACTERISTIC,
    CLASSIC_DISTANCE_CHARACTERISTIC, CLASSIC_ID_CHARACTERISTIC, CLASSIC_OFFSET_CHARACTERISTIC,
    DEVICE_INFO_SERVICE, FIRMWARE_REVISION_CHARACTERISTIC, LITE_TX_CHARACTERISTIC,
};
use obs_core::protocol::classic::ClassicPacket;
use obs_core::protocol::lite;
use obs_core::protos::obs::{event, user_input, BatteryStatus, Event, Geolocation, UserInput};
use obs_core::{DeviceId, DeviceIdentity, DeviceType};

use crate::radio::{emit, Radio, RadioError, RadioEvent, RadioEventSender, RadioEvents};

/// Default notification interval
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

const FIRMWARE_VERSION: &[u8] = b"v0.19.0-emu";
const DEVICE_ID: &[u8] = b"OBS-EMU-0001\0";

// One pass of a car: raw distances in cm, sampled per side
const LEFT_PATTERN: [u16; 10] = [210, 205, 190, 170, 140, 115, 110, 130, 175, 200];
const RIGHT_PATTERN: [Option<u16>; 5] = [Some(260), Some(255), None, Some(250), Some(262)];

#[derive(Debug, Clone)]
struct Shared {
    link_up: Arc<AtomicBool>,
    stalled: Arc<AtomicBool>,
    withhold_services: Arc<AtomicBool>,
    hang_connect: Arc<AtomicBool>,
}

/// Handle to disturb an [`Emulator`] from outside.
#[derive(Debug, Clone)]
pub struct EmulatorControl {
    shared: Shared,
    id: DeviceId,
    events: RadioEventSender,
}

impl EmulatorControl {
    /// Stop sending notifications until the next connection.
    pub fn stall(&self) {
        self.shared.stalled.store(true, Ordering::SeqCst);
    }

    /// The link goes down without a disconnect event.
    pub fn drop_link(&self) {
        self.shared.link_up.store(false, Ordering::SeqCst);
    }

    /// The sensor disconnects (out of range, switched off).
    pub fn disconnect(&self) {
        self.shared.link_up.store(false, Ordering::SeqCst);
        emit(&self.events, RadioEvent::Disconnected(self.id.clone()));
    }

    /// Leave service discovery unanswered while set.
    pub fn withhold_services(&self, withhold: bool) {
        self.shared.withhold_services.store(withhold, Ordering::SeqCst);
    }

    /// Connect requests never complete while set.
    pub fn hang_connect(&self, hang: bool) {
        self.shared.hang_connect.store(hang, Ordering::SeqCst);
    }
}

pub struct Emulator {
    device_type: DeviceType,
    identity: DeviceIdentity,
    tick: Duration,
    events: RadioEventSender,
    shared: Shared,
    subscribed: HashSet<String>,
    streamer: Option<JoinHandle<()>>,
}

impl Emulator {
    /// Create an emulator; the radio is powered on immediately.
    pub fn new(device_type: DeviceType) -> (Self, RadioEvents) {
        Self::with_tick(device_type, DEFAULT_TICK)
    }

    pub fn with_tick(device_type: DeviceType, tick: Duration) -> (Self, RadioEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let name = format!("OBS {} Emulator", device_type);
        let identity = DeviceIdentity {
            id: DeviceId(format!("EMU-{}", device_type.as_str().to_uppercase())),
            name: Some(name.clone()),
            advertised_name: Some(name),
            rssi: Some(-55),
        };
        emit(&tx, RadioEvent::PoweredOn);

        let emulator = Self {
            device_type,
            identity,
            tick,
            events: tx,
            shared: Shared {
                link_up: Arc::new(AtomicBool::new(false)),
                stalled: Arc::new(AtomicBool::new(false)),
                withhold_services: Arc::new(AtomicBool::new(false)),
                hang_connect: Arc::new(AtomicBool::new(false)),
            },
            subscribed: HashSet::new(),
            streamer: None,
        };
        (emulator, rx)
    }

    pub fn control(&self) -> EmulatorControl {
        EmulatorControl {
            shared: self.shared.clone(),
            id: self.identity.id.clone(),
            events: self.events.clone(),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    fn check_device(&self, id: &DeviceId) -> Result<(), RadioError> {
        if *id == self.identity.id {
            Ok(())
        } else {
            Err(RadioError::UnknownDevice(id.clone()))
        }
    }

    fn stop_streaming(&mut self) {
        if let Some(handle) = self.streamer.take() {
            handle.abort();
        }
        self.subscribed.clear();
    }

    fn start_streaming(&mut self) {
        if self.streamer.is_some() {
            return;
        }
        debug!("Emulator: streaming {} notifications", self.device_type);
        let stream = Stream {
            device_type: self.device_type,
            tick: self.tick,
            events: self.events.clone(),
            shared: self.shared.clone(),
        };
        self.streamer = Some(tokio::spawn(stream.run()));
    }
}

impl Drop for Emulator {
    fn drop(&mut self) {
        self.stop_streaming();
    }
}

#[async_trait]
impl Radio for Emulator {
    async fn start_scan(&mut self) -> Result<(), RadioError> {
        info!("Emulator: scanning");
        let decoy = DeviceIdentity {
            id: DeviceId("HRM-42".into()),
            name: None,
            advertised_name: Some("Heart Rate Monitor".into()),
            rssi: Some(-80),
        };
        emit(
            &self.events,
            RadioEvent::Discovered {
                device: decoy,
                connectable: true,
            },
        );
        emit(
            &self.events,
            RadioEvent::Discovered {
                device: self.identity.clone(),
                connectable: true,
            },
        );
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), RadioError> {
        Ok(())
    }

    async fn connect(&mut self, id: &DeviceId) -> Result<(), RadioError> {
        self.check_device(id)?;
        if self.shared.hang_connect.load(Ordering::SeqCst) {
            debug!("Emulator: connect to {} hangs", id);
            std::future::pending::<()>().await;
        }
        self.shared.link_up.store(true, Ordering::SeqCst);
        self.shared.stalled.store(false, Ordering::SeqCst);
        emit(&self.events, RadioEvent::Connected(id.clone()));
        Ok(())
    }

    async fn discover_services(&mut self, id: &DeviceId) -> Result<(), RadioError> {
        self.check_device(id)?;
        if self.shared.withhold_services.load(Ordering::SeqCst) {
            debug!("Emulator: not answering service discovery");
            return Ok(());
        }
        let services = vec![
            self.device_type.service().to_string(),
            BATTERY_SERVICE.to_string(),
            DEVICE_INFO_SERVICE.to_string(),
        ];
        emit(
            &self.events,
            RadioEvent::ServicesDiscovered {
                id: id.clone(),
                services,
            },
        );
        Ok(())
    }

    async fn subscribe(&mut self, characteristic: &str) -> Result<(), RadioError> {
        if !self.shared.link_up.load(Ordering::SeqCst) {
            return Err(RadioError::NotConnected);
        }
        let known = self
            .device_type
            .notify_characteristics()
            .iter()
            .any(|c| uuid_eq(c, characteristic));
        if !known {
            return Err(RadioError::MissingCharacteristic(characteristic.to_string()));
        }
        self.subscribed.insert(characteristic.to_lowercase());
        self.start_streaming();
        Ok(())
    }

    async fn read(&mut self, characteristic: &str) -> Result<Vec<u8>, RadioError> {
        if !self.shared.link_up.load(Ordering::SeqCst) {
            return Err(RadioError::NotConnected);
        }
        let classic = self.device_type == DeviceType::Classic;
        if uuid_eq(characteristic, BATTERY_LEVEL_CHARACTERISTIC) {
            Ok(vec![87])
        } else if uuid_eq(characteristic, FIRMWARE_REVISION_CHARACTERISTIC) {
            Ok(FIRMWARE_VERSION.to_vec())
        } else if classic && uuid_eq(characteristic, CLASSIC_OFFSET_CHARACTERISTIC) {
            // left 30 cm, right 32 cm
            Ok(vec![30, 0, 32, 0])
        } else if classic && uuid_eq(characteristic, CLASSIC_ID_CHARACTERISTIC) {
            Ok(DEVICE_ID.to_vec())
        } else {
            Err(RadioError::MissingCharacteristic(characteristic.to_string()))
        }
    }

    async fn disconnect(&mut self, id: &DeviceId) -> Result<(), RadioError> {
        self.check_device(id)?;
        self.stop_streaming();
        self.shared.link_up.store(false, Ordering::SeqCst);
        emit(&self.events, RadioEvent::Disconnected(id.clone()));
        Ok(())
    }

    async fn is_connected(&self, id: &DeviceId) -> bool {
        *id == self.identity.id && self.shared.link_up.load(Ordering::SeqCst)
    }
}

struct Stream {
    device_type: DeviceType,
    tick: Duration,
    events: RadioEventSender,
    shared: Shared,
}

impl Stream {
    async fn run(self) {
        let mut timer = interval(self.tick);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut n: u64 = 0;

        loop {
            timer.tick().await;
            n += 1;
            if !self.shared.link_up.load(Ordering::SeqCst)
                || self.shared.stalled.load(Ordering::SeqCst)
            {
                continue;
            }
            for (characteristic, data) in self.notifications(n) {
                emit(
                    &self.events,
                    RadioEvent::Notification {
                        characteristic: characteristic.to_string(),
                        data,
                    },
                );
            }
        }
    }

    fn notifications(&self, n: u64) -> Vec<(&'static str, Vec<u8>)> {
        let left_cm = LEFT_PATTERN[(n / 2) as usize % LEFT_PATTERN.len()];
        let right_cm = RIGHT_PATTERN[(n / 2) as usize % RIGHT_PATTERN.len()];
        let mut out = Vec::new();

        match self.device_type {
            DeviceType::Lite => {
                let event = if n % 2 == 0 {
                    lite::distance_event(1, f32::from(left_cm) / 100.0)
                } else {
                    lite::distance_event(2, right_cm.map_or(0.0, |cm| f32::from(cm) / 100.0))
                };
                push_lite(&mut out, &event);
                if n % 10 == 0 {
                    push_lite(&mut out, &geolocation(n));
                }
                if n % 50 == 0 {
                    let mut input = UserInput::new();
                    input.type_ = EnumOrUnknown::new(user_input::Type::OVERTAKER);
                    let mut event = Event::new();
                    event.content = Some(event::Content::UserInput(input));
                    push_lite(&mut out, &event);
                }
                if n % 100 == 0 {
                    let mut battery = BatteryStatus::new();
                    battery.voltage = 3.95;
                    battery.percentage = 87.0;
                    let mut event = Event::new();
                    event.content = Some(event::Content::BatteryStatus(battery));
                    push_lite(&mut out, &event);
                }
            }
            DeviceType::Classic => {
                let packet = ClassicPacket {
                    clock_ms: (n * self.tick.as_millis() as u64) as u32,
                    left_cm: Some(left_cm),
                    right_cm,
                };
                out.push((CLASSIC_DISTANCE_CHARACTERISTIC, packet.to_bytes().to_vec()));
                if n % 50 == 0 {
                    out.push((CLASSIC_BUTTON_CHARACTERISTIC, packet.to_bytes().to_vec()));
                }
            }
        }
        out
    }
}

fn push_lite(out: &mut Vec<(&'static str, Vec<u8>)>, event: &Event) {
    match lite::encode_frame(event) {
        Ok(frame) => out.push((LITE_TX_CHARACTERISTIC, frame)),
        Err(e) => debug!("Emulator: cannot encode event: {}", e),
    }
}

fn geolocation(n: u64) -> Event {
    let mut geo = Geolocation::new();
    // Riding north at 5 m/s
    geo.latitude = 48.1351 + n as f64 * 1e-6;
    geo.longitude = 11.5820;
    geo.altitude = 519.0;
    geo.ground_speed = 5.0;
    geo.course = 0.0;
    geo.hdop = 0.9;
    let mut event = Event::new();
    event.content = Some(event::Content::Geolocation(geo));
    event
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_matching<F>(rx: &mut RadioEvents, mut f: F) -> RadioEvent
    where
        F: FnMut(&RadioEvent) -> bool,
    {
        loop {
            let event = rx.recv().await.unwrap();
            if f(&event) {
                return event;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_connect_stream() {
        let (mut emu, mut rx) = Emulator::new(DeviceType::Lite);
        assert_eq!(rx.recv().await, Some(RadioEvent::PoweredOn));

        emu.start_scan().await.unwrap();
        let mut names = Vec::new();
        for _ in 0..2 {
            if let Some(RadioEvent::Discovered { device, .. }) = rx.recv().await {
                names.push(device.display_name().to_string());
            }
        }
        assert_eq!(names, vec!["Heart Rate Monitor", "OBS Lite Emulator"]);

        let id = emu.identity().id.clone();
        emu.connect(&id).await.unwrap();
        assert_eq!(rx.recv().await, Some(RadioEvent::Connected(id.clone())));
        assert!(emu.is_connected(&id).await);

        emu.discover_services(&id).await.unwrap();
        match rx.recv().await {
            Some(RadioEvent::ServicesDiscovered { services, .. }) => {
                assert_eq!(DeviceType::classify(&services), Some(DeviceType::Lite));
            }
            other => panic!("unexpected {:?}", other),
        }

        emu.subscribe(LITE_TX_CHARACTERISTIC).await.unwrap();
        let event = next_matching(&mut rx, |e| matches!(e, RadioEvent::Notification { .. })).await;
        match event {
            RadioEvent::Notification { data, .. } => {
                assert!(lite::decode_notification(&data).is_ok());
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_classic_reads() {
        let (mut emu, _rx) = Emulator::new(DeviceType::Classic);
        assert!(matches!(
            emu.read(CLASSIC_OFFSET_CHARACTERISTIC).await,
            Err(RadioError::NotConnected)
        ));

        let id = emu.identity().id.clone();
        emu.connect(&id).await.unwrap();
        assert_eq!(
            emu.read(CLASSIC_OFFSET_CHARACTERISTIC).await.unwrap(),
            vec![30, 0, 32, 0]
        );
        assert_eq!(emu.read(BATTERY_LEVEL_CHARACTERISTIC).await.unwrap(), vec![87]);
        assert!(emu.subscribe(LITE_TX_CHARACTERISTIC).await.is_err());
        assert!(emu.connect(&DeviceId("other".into())).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_hooks() {
        let (mut emu, mut rx) = Emulator::new(DeviceType::Classic);
        let control = emu.control();
        let id = emu.identity().id.clone();
        emu.connect(&id).await.unwrap();

        control.drop_link();
        assert!(!emu.is_connected(&id).await);

        control.disconnect();
        let event = next_matching(&mut rx, |e| matches!(e, RadioEvent::Disconnected(_))).await;
        assert_eq!(event, RadioEvent::Disconnected(id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_withheld_services_and_hung_connect() {
        let (mut emu, mut rx) = Emulator::new(DeviceType::Lite);
        assert_eq!(rx.recv().await, Some(RadioEvent::PoweredOn));
        let control = emu.control();
        let id = emu.identity().id.clone();

        control.hang_connect(true);
        let hung = tokio::time::timeout(Duration::from_secs(5), emu.connect(&id)).await;
        assert!(hung.is_err());
        assert!(!emu.is_connected(&id).await);

        control.hang_connect(false);
        control.withhold_services(true);
        emu.connect(&id).await.unwrap();
        assert_eq!(rx.recv().await, Some(RadioEvent::Connected(id.clone())));
        emu.discover_services(&id).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
