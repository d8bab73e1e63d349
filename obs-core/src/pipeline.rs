//! Event pipeline between the wire decoders and the recorder.
//!
//! A [`Pipeline`] is created per connection once the device generation is
//! known. It is fed raw notifications together with the characteristic they
//! arrived on and the caller's monotonic time, and returns what should happen
//! as a list of [`Output`]s: records to persist, preview updates, confirmed
//! overtakes and discarded confirmations. It performs no I/O.
//!
//! ```rust
//! use obs_core::device::{DeviceType, LITE_TX_CHARACTERISTIC};
//! use obs_core::pipeline::{Pipeline, PipelineConfig};
//! use obs_core::protocol::lite;
//!
//! let mut pipeline = Pipeline::new(DeviceType::Lite, PipelineConfig::default());
//! let frame = lite::encode_frame(&lite::distance_event(1, 1.2)).unwrap();
//! let outputs = pipeline.notification(LITE_TX_CHARACTERISTIC, &frame, 0).unwrap();
//! assert_eq!(outputs.len(), 2);
//! ```

use serde::{Deserialize, Serialize};

use crate::device::{
    uuid_eq, DeviceType, CLASSIC_BUTTON_CHARACTERISTIC, CLASSIC_DISTANCE_CHARACTERISTIC,
    LITE_TX_CHARACTERISTIC,
};
use crate::error::ParseError;
use crate::protocol::classic::{self, ClassicOffsets, ClassicPacket};
use crate::protocol::lite;
use crate::protos::obs::{event, text_message, Event, Geolocation};
use crate::window::{DistanceSample, PairedWindow, PressMinimum, SensorSource, DEFAULT_HORIZON_MS};

/// Handlebar width assumed when nothing else is configured
pub const DEFAULT_HANDLEBAR_WIDTH_CM: u16 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Exchange left and right before anything else looks at the data
    pub swap_sensors: bool,
    pub handlebar_width_cm: u16,
    /// A confirmation needs a reading from both sides (otherwise either side)
    pub require_both_sensors: bool,
    pub horizon_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            swap_sensors: false,
            handlebar_width_cm: DEFAULT_HANDLEBAR_WIDTH_CM,
            require_both_sensors: true,
            horizon_ms: DEFAULT_HORIZON_MS,
        }
    }
}

impl PipelineConfig {
    fn half_width_cm(&self) -> u16 {
        self.handlebar_width_cm / 2
    }
}

/// Last known position of the rider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
    /// Meters per second
    pub speed_mps: f32,
    pub course_deg: f32,
    pub hdop: f32,
}

impl From<&Geolocation> for Location {
    fn from(geo: &Geolocation) -> Self {
        Location {
            latitude: geo.latitude,
            longitude: geo.longitude,
            altitude: geo.altitude,
            speed_mps: geo.ground_speed,
            course_deg: geo.course,
            hdop: geo.hdop,
        }
    }
}

/// A confirmed overtake.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OvertakeEvent {
    /// Monotonic time of the button press
    pub timestamp_ms: u64,
    pub location: Option<Location>,
    /// Closest approach on the overtaker side since the previous press
    pub distance_cm: Option<u16>,
    /// Closest reading on the other side over the same span
    pub secondary_cm: Option<u16>,
}

impl OvertakeEvent {
    pub fn speed_mps(&self) -> Option<f32> {
        self.location.map(|l| l.speed_mps)
    }
}

/// One row of a Classic text recording, before wall-clock stamping.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassicRow {
    pub clock_ms: u32,
    /// Corrected distances
    pub left_cm: Option<u16>,
    pub right_cm: Option<u16>,
    /// Distances as measured, used for flight times
    pub left_raw_cm: Option<u16>,
    pub right_raw_cm: Option<u16>,
    /// Set on the row written for a button press
    pub confirmed_cm: Option<u16>,
    pub battery_level: Option<u8>,
    pub location: Option<Location>,
}

impl ClassicRow {
    pub fn is_confirmed(&self) -> bool {
        self.confirmed_cm.is_some()
    }
}

/// Unit of data handed to a recording session.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Lite(Event),
    Classic(ClassicRow),
}

impl Record {
    pub fn device_type(&self) -> DeviceType {
        match self {
            Record::Lite(_) => DeviceType::Lite,
            Record::Classic(_) => DeviceType::Classic,
        }
    }
}

/// Live state shown to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PreviewUpdate {
    #[serde(rename_all = "camelCase")]
    Distance { source: SensorSource, cm: u16 },
    /// The sensor reported but saw no echo
    #[serde(rename_all = "camelCase")]
    NoSignal { source: SensorSource },
    #[serde(rename_all = "camelCase")]
    Battery { percentage: f32, voltage: f32 },
    Location(Location),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Persist(Record),
    Preview(PreviewUpdate),
    Overtake(OvertakeEvent),
    /// A button press without enough readings; nothing was persisted
    ConfirmDiscarded(PressMinimum),
    /// Text sent by the device firmware
    DeviceMessage { level: MessageLevel, text: String },
}

// =============================================================================
// Pipeline
// =============================================================================

/// Per-connection pipeline, one strategy per device generation.
#[derive(Debug, Clone)]
pub enum Pipeline {
    Lite(LitePipeline),
    Classic(ClassicPipeline),
}

impl Pipeline {
    pub fn new(device_type: DeviceType, config: PipelineConfig) -> Self {
        match device_type {
            DeviceType::Lite => Pipeline::Lite(LitePipeline::new(config)),
            DeviceType::Classic => Pipeline::Classic(ClassicPipeline::new(config)),
        }
    }

    pub fn device_type(&self) -> DeviceType {
        match self {
            Pipeline::Lite(_) => DeviceType::Lite,
            Pipeline::Classic(_) => DeviceType::Classic,
        }
    }

    /// Feed one notification. Characteristics the pipeline does not know
    /// produce no output.
    pub fn notification(
        &mut self,
        characteristic: &str,
        data: &[u8],
        current_time_ms: u64,
    ) -> Result<Vec<Output>, ParseError> {
        match self {
            Pipeline::Lite(p) => {
                if !uuid_eq(characteristic, LITE_TX_CHARACTERISTIC) {
                    return Ok(Vec::new());
                }
                let event = lite::decode_notification(data)?;
                Ok(p.handle_event(event, current_time_ms))
            }
            Pipeline::Classic(p) => {
                if uuid_eq(characteristic, CLASSIC_DISTANCE_CHARACTERISTIC) {
                    let packet = classic::parse_packet(data)?;
                    Ok(p.handle_packet(packet, current_time_ms))
                } else if uuid_eq(characteristic, CLASSIC_BUTTON_CHARACTERISTIC) {
                    Ok(p.handle_button(current_time_ms))
                } else {
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Minimum corrected distance of a source since the last press.
    pub fn minimum(&mut self, source: SensorSource, current_time_ms: u64) -> Option<u16> {
        match self {
            Pipeline::Lite(p) => p.window.minimum(source, current_time_ms),
            Pipeline::Classic(p) => p.window.minimum(source, current_time_ms),
        }
    }
}

/// Lite: protobuf events.
#[derive(Debug, Clone)]
pub struct LitePipeline {
    config: PipelineConfig,
    window: PairedWindow,
    location: Option<Location>,
}

impl LitePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            window: PairedWindow::new(config.horizon_ms),
            location: None,
        }
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    pub fn handle_event(&mut self, mut event: Event, current_time_ms: u64) -> Vec<Output> {
        if self.config.swap_sensors {
            lite::swap_sources(&mut event);
        }

        let mut outputs = Vec::with_capacity(2);
        match event.content.as_ref() {
            Some(event::Content::DistanceMeasurement(dm)) => {
                let source = lite::distance_source(dm);
                if !lite::has_signal(dm.distance) {
                    if let Some(source) = source {
                        outputs.push(Output::Preview(PreviewUpdate::NoSignal { source }));
                    }
                    return outputs;
                }
                if let Some(source) = source {
                    let corrected_cm = lite::meters_to_cm(dm.distance)
                        .saturating_sub(self.config.half_width_cm());
                    self.window.add(DistanceSample {
                        source,
                        corrected_cm,
                        timestamp_ms: current_time_ms,
                    });
                    outputs.push(Output::Preview(PreviewUpdate::Distance {
                        source,
                        cm: corrected_cm,
                    }));
                }
            }
            Some(event::Content::UserInput(_)) => {
                let press = self.window.press(current_time_ms);
                let accepted = if self.config.require_both_sensors {
                    press.left_cm.is_some() && press.right_cm.is_some()
                } else {
                    press.left_cm.is_some() || press.right_cm.is_some()
                };
                if !accepted {
                    outputs.push(Output::ConfirmDiscarded(press));
                    return outputs;
                }
                outputs.push(Output::Overtake(OvertakeEvent {
                    timestamp_ms: current_time_ms,
                    location: self.location,
                    distance_cm: press.left_cm,
                    secondary_cm: press.right_cm,
                }));
            }
            Some(event::Content::Geolocation(geo)) => {
                let location = Location::from(geo);
                self.location = Some(location);
                outputs.push(Output::Preview(PreviewUpdate::Location(location)));
            }
            Some(event::Content::BatteryStatus(battery)) => {
                outputs.push(Output::Preview(PreviewUpdate::Battery {
                    percentage: battery.percentage,
                    voltage: battery.voltage,
                }));
            }
            Some(event::Content::TextMessage(msg)) => {
                let level = match msg.type_.enum_value() {
                    Ok(text_message::Type::WARNING) => MessageLevel::Warning,
                    Ok(text_message::Type::ERROR) => MessageLevel::Error,
                    Ok(text_message::Type::DEBUG) => MessageLevel::Debug,
                    _ => MessageLevel::Info,
                };
                outputs.push(Output::DeviceMessage {
                    level,
                    text: msg.text.clone(),
                });
            }
            None => return outputs,
        }

        outputs.insert(0, Output::Persist(Record::Lite(event)));
        outputs
    }
}

/// Classic: fixed packets plus a button characteristic.
#[derive(Debug, Clone)]
pub struct ClassicPipeline {
    config: PipelineConfig,
    offsets: ClassicOffsets,
    window: PairedWindow,
    last_packet: Option<ClassicPacket>,
    battery_level: Option<u8>,
}

impl ClassicPipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            offsets: ClassicOffsets::from_handlebar_width(config.handlebar_width_cm),
            window: PairedWindow::new(config.horizon_ms),
            last_packet: None,
            battery_level: None,
        }
    }

    /// Use the offsets stored on the device instead of half the handlebar width.
    ///
    /// Offsets are given as the device reports them; the swap is applied here.
    pub fn set_offsets(&mut self, offsets: ClassicOffsets) {
        self.offsets = if self.config.swap_sensors {
            offsets.swapped()
        } else {
            offsets
        };
    }

    pub fn offsets(&self) -> ClassicOffsets {
        self.offsets
    }

    pub fn set_battery_level(&mut self, level: u8) {
        self.battery_level = Some(level);
    }

    pub fn handle_packet(&mut self, packet: ClassicPacket, current_time_ms: u64) -> Vec<Output> {
        let packet = if self.config.swap_sensors {
            packet.swapped()
        } else {
            packet
        };
        self.last_packet = Some(packet);

        let mut outputs = Vec::with_capacity(3);
        let row = self.row(packet);
        outputs.push(Output::Persist(Record::Classic(row)));

        for (source, corrected) in [
            (SensorSource::Left, row.left_cm),
            (SensorSource::Right, row.right_cm),
        ] {
            match corrected {
                Some(cm) => {
                    self.window.add(DistanceSample {
                        source,
                        corrected_cm: cm,
                        timestamp_ms: current_time_ms,
                    });
                    outputs.push(Output::Preview(PreviewUpdate::Distance { source, cm }));
                }
                None => outputs.push(Output::Preview(PreviewUpdate::NoSignal { source })),
            }
        }
        outputs
    }

    /// A button notification confirms the readings of the last packet.
    pub fn handle_button(&mut self, current_time_ms: u64) -> Vec<Output> {
        let press = self.window.press(current_time_ms);
        let Some(packet) = self.last_packet else {
            return vec![Output::ConfirmDiscarded(press)];
        };

        let mut row = self.row(packet);
        let confirmed = press.left_cm.or(row.left_cm);
        let Some(confirmed_cm) = confirmed else {
            return vec![Output::ConfirmDiscarded(press)];
        };
        row.confirmed_cm = Some(confirmed_cm);

        vec![
            Output::Persist(Record::Classic(row)),
            Output::Overtake(OvertakeEvent {
                timestamp_ms: current_time_ms,
                location: None,
                distance_cm: Some(confirmed_cm),
                secondary_cm: press.right_cm.or(row.right_cm),
            }),
        ]
    }

    fn row(&self, packet: ClassicPacket) -> ClassicRow {
        ClassicRow {
            clock_ms: packet.clock_ms,
            left_cm: packet
                .left_cm
                .map(|raw| raw.saturating_sub(self.offsets.left_cm)),
            right_cm: packet
                .right_cm
                .map(|raw| raw.saturating_sub(self.offsets.right_cm)),
            left_raw_cm: packet.left_cm,
            right_raw_cm: packet.right_cm,
            confirmed_cm: None,
            battery_level: self.battery_level,
            location: None,
        }
    }
}
