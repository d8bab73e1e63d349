//! Binary recordings (Lite).
//!
//! A binary recording has no header: it is a stream of protobuf `Event`s,
//! each COBS encoded and followed by a single 0x00.
//!
//! ```text
//! ┌──────────────┬────┬──────────────┬────┬─────
//! │ COBS(Event)  │ 00 │ COBS(Event)  │ 00 │ ...
//! └──────────────┴────┴──────────────┴────┴─────
//! ```
//!
//! Distances are stored corrected by half the handlebar width, and every
//! event carries at least one timestamp (the host clock if the sensor sent
//! none).

use std::fs;
use std::io::Write;
use std::path::Path;

use log::debug;
use serde_json::{json, Value};

use obs_core::cobs::FrameSplitter;
use obs_core::protocol::lite;
use obs_core::protos::obs::{event, time, Event};

use super::{RecordingError, WriteError};

pub struct BinaryWriter<W: Write> {
    out: W,
    handlebar_width_cm: u16,
}

impl<W: Write> BinaryWriter<W> {
    pub fn new(out: W, handlebar_width_cm: u16) -> Self {
        Self {
            out,
            handlebar_width_cm,
        }
    }

    /// Append one event. Returns the number of bytes written.
    pub fn write_event(&mut self, event: &Event, unix_ms: i64) -> Result<usize, WriteError> {
        let mut event = event.clone();
        lite::correct_distance(&mut event, self.handlebar_width_cm);
        lite::ensure_timestamp(&mut event, unix_ms);

        let frame = lite::encode_frame(&event)?;
        self.out.write_all(&frame)?;
        Ok(frame.len())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

/// Events read back from a binary recording.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BinaryRecording {
    pub events: Vec<Event>,
    /// Segments that failed to decode
    pub skipped: usize,
}

/// Read a binary recording from disk.
pub fn read_binary_recording(path: &Path) -> Result<BinaryRecording, RecordingError> {
    let data = fs::read(path).map_err(|source| RecordingError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decode_binary(&data))
}

/// Split on 0x00 and decode every segment on its own; corrupt segments are
/// counted and skipped. A trailing segment without delimiter is tried too.
pub fn decode_binary(data: &[u8]) -> BinaryRecording {
    let mut splitter = FrameSplitter::new();
    let mut segments = splitter.push(data);
    if let Some(rest) = splitter.take_remainder() {
        segments.push(rest);
    }

    let mut recording = BinaryRecording::default();
    for (i, segment) in segments.iter().enumerate() {
        match obs_core::cobs::decode(segment).and_then(|raw| lite::parse_event(&raw)) {
            Ok(event) => recording.events.push(event),
            Err(e) => {
                debug!("Skipping segment {}: {}", i, e);
                recording.skipped += 1;
            }
        }
    }
    recording
}

/// JSON view of an event, one object per line in `decode` output.
pub fn event_to_json(event: &Event) -> Value {
    let times: Vec<Value> = event
        .time
        .iter()
        .map(|t| {
            let reference = match t.reference.enum_value() {
                Ok(time::Reference::UNIX) => "unix",
                Ok(time::Reference::CPU) => "cpu",
                Ok(time::Reference::GPS) => "gps",
                Err(_) => "unknown",
            };
            json!({
                "sourceId": t.source_id,
                "reference": reference,
                "seconds": t.seconds,
                "nanoseconds": t.nanoseconds,
            })
        })
        .collect();

    let content = match event.content.as_ref() {
        Some(event::Content::DistanceMeasurement(dm)) => json!({
            "sourceId": dm.source_id,
            "distance": dm.distance,
            "timeOfFlight": dm.time_of_flight,
        }),
        Some(event::Content::Geolocation(geo)) => json!({
            "latitude": geo.latitude,
            "longitude": geo.longitude,
            "altitude": geo.altitude,
            "groundSpeed": geo.ground_speed,
            "hdop": geo.hdop,
            "course": geo.course,
        }),
        Some(event::Content::BatteryStatus(b)) => json!({
            "voltage": b.voltage,
            "percentage": b.percentage,
        }),
        Some(event::Content::UserInput(input)) => json!({
            "type": format!("{:?}", input.type_.enum_value_or_default()),
        }),
        Some(event::Content::TextMessage(msg)) => json!({
            "type": format!("{:?}", msg.type_.enum_value_or_default()),
            "text": msg.text,
        }),
        None => Value::Null,
        // `Content` is non-exhaustive across crates; all known variants are matched above.
        Some(_) => Value::Null,
    };

    json!({
        "type": lite::content_name(event),
        "time": times,
        "content": content,
    })
}
