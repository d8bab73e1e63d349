//! OpenBikeSensor Lite protocol (protobuf events over BLE)
//!
//! Each notification on [`LITE_TX_CHARACTERISTIC`](crate::device::LITE_TX_CHARACTERISTIC)
//! carries exactly one `Event`, COBS framed and terminated by 0x00. Some
//! firmware builds send the bare protobuf instead; a payload with a zero
//! byte anywhere but the end cannot be COBS, so it is parsed as-is.

use protobuf::{EnumOrUnknown, Message};

use crate::cobs;
use crate::error::ParseError;
use crate::protos::obs::{event, time, DistanceMeasurement, Event, Time};
use crate::window::SensorSource;

use super::swap_source_id;

/// `Time.source_id` used for timestamps added by the recording host
pub const HOST_CLOCK_SOURCE: u32 = 1;

/// Decode a notification payload into an event.
pub fn decode_notification(payload: &[u8]) -> Result<Event, ParseError> {
    let body = payload.strip_suffix(&[cobs::DELIMITER]).unwrap_or(payload);
    if body.is_empty() {
        return Err(ParseError::TooShort {
            expected: 1,
            actual: 0,
        });
    }

    if body.contains(&0) {
        // Not COBS: a stuffed frame never contains zero
        return parse_event(payload);
    }

    match cobs::decode(body).and_then(|raw| parse_event(&raw)) {
        Ok(event) => Ok(event),
        Err(cobs_err) if payload.last() != Some(&cobs::DELIMITER) => {
            // Unterminated and zero-free: may just as well be a bare protobuf
            parse_event(payload).map_err(|_| cobs_err)
        }
        Err(e) => Err(e),
    }
}

/// Parse a bare protobuf event.
pub fn parse_event(data: &[u8]) -> Result<Event, ParseError> {
    let event = Event::parse_from_bytes(data)?;
    if event.content.is_none() {
        return Err(ParseError::EmptyEvent);
    }
    Ok(event)
}

/// Serialize an event to a COBS frame including the trailing delimiter.
pub fn encode_frame(event: &Event) -> Result<Vec<u8>, ParseError> {
    let raw = event.write_to_bytes()?;
    Ok(cobs::encode_frame(&raw))
}

/// Remap distance source ids 1 and 2 in place. Applying it twice is a no-op.
pub fn swap_sources(event: &mut Event) {
    if let Some(event::Content::DistanceMeasurement(dm)) = event.content.as_mut() {
        dm.source_id = swap_source_id(dm.source_id);
    }
}

/// Distance measurement carried by the event, if any.
pub fn distance(event: &Event) -> Option<&DistanceMeasurement> {
    match event.content.as_ref() {
        Some(event::Content::DistanceMeasurement(dm)) => Some(dm),
        _ => None,
    }
}

/// Source of a distance measurement, if it is one of the two known sensors.
pub fn distance_source(dm: &DistanceMeasurement) -> Option<SensorSource> {
    SensorSource::from_id(dm.source_id)
}

/// Whether a distance value represents an echo. Zero, negative and NaN do not.
pub fn has_signal(meters: f32) -> bool {
    meters > 0.0
}

/// Convert meters to whole centimeters, saturating at the `u16` range.
pub fn meters_to_cm(meters: f32) -> u16 {
    if meters.is_nan() || meters <= 0.0 {
        return 0;
    }
    (meters * 100.0).round().min(u16::MAX as f32) as u16
}

/// Subtract half the handlebar width from a distance measurement (floor 0).
pub fn correct_distance(event: &mut Event, handlebar_width_cm: u16) {
    if let Some(event::Content::DistanceMeasurement(dm)) = event.content.as_mut() {
        let offset_m = f32::from(handlebar_width_cm) / 200.0;
        dm.distance = (dm.distance - offset_m).max(0.0);
    }
}

/// Attach a host capture time if the event carries no timestamp at all.
///
/// Returns true if a timestamp was added.
pub fn ensure_timestamp(event: &mut Event, unix_ms: i64) -> bool {
    if !event.time.is_empty() {
        return false;
    }
    let mut t = Time::new();
    t.source_id = HOST_CLOCK_SOURCE;
    t.reference = EnumOrUnknown::new(time::Reference::UNIX);
    t.seconds = unix_ms.div_euclid(1000);
    t.nanoseconds = (unix_ms.rem_euclid(1000) * 1_000_000) as i32;
    event.time.push(t);
    true
}

/// Short name of the event content for logging.
pub fn content_name(event: &Event) -> &'static str {
    match event.content.as_ref() {
        Some(event::Content::DistanceMeasurement(_)) => "distance",
        Some(event::Content::BatteryStatus(_)) => "battery",
        Some(event::Content::Geolocation(_)) => "geolocation",
        Some(event::Content::UserInput(_)) => "userInput",
        Some(event::Content::TextMessage(_)) => "textMessage",
        None => "empty",
    }
}

/// Build a distance event (emulator and tests).
pub fn distance_event(source_id: u32, meters: f32) -> Event {
    let mut dm = DistanceMeasurement::new();
    dm.source_id = source_id;
    dm.distance = meters;
    let mut event = Event::new();
    event.content = Some(event::Content::DistanceMeasurement(dm));
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protos::obs::{Geolocation, UserInput};

    fn button_event() -> Event {
        let mut event = Event::new();
        event.content = Some(event::Content::UserInput(UserInput::new()));
        event
    }

    #[test]
    fn test_decode_cobs_notification() {
        let event = distance_event(1, 0.85);
        let frame = encode_frame(&event).unwrap();
        assert_eq!(*frame.last().unwrap(), 0);
        assert!(!frame[..frame.len() - 1].contains(&0));

        let decoded = decode_notification(&frame).unwrap();
        let dm = distance(&decoded).unwrap();
        assert_eq!(dm.source_id, 1);
        assert!((dm.distance - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_decode_bare_protobuf() {
        let raw = distance_event(2, 1.5).write_to_bytes().unwrap();
        let decoded = decode_notification(&raw).unwrap();
        assert_eq!(distance(&decoded).unwrap().source_id, 2);
    }

    #[test]
    fn test_decode_failures() {
        assert!(decode_notification(&[]).is_err());
        assert!(decode_notification(&[0]).is_err());
        // COBS code claims more bytes than present
        assert!(decode_notification(&[0x09, 0x52, 0x00]).is_err());
        // Valid COBS, garbage protobuf (field 15, wire type 7)
        assert!(decode_notification(&cobs::encode_frame(&[0x7F, 0x7F])).is_err());
    }

    #[test]
    fn test_event_without_content_rejected() {
        let mut event = Event::new();
        ensure_timestamp(&mut event, 1_000);
        let frame = cobs::encode_frame(&event.write_to_bytes().unwrap());
        assert_eq!(decode_notification(&frame), Err(ParseError::EmptyEvent));
    }

    #[test]
    fn test_swap_is_involution() {
        let mut event = distance_event(1, 1.0);
        swap_sources(&mut event);
        assert_eq!(distance(&event).unwrap().source_id, 2);
        swap_sources(&mut event);
        assert_eq!(distance(&event).unwrap().source_id, 1);

        let mut other = distance_event(7, 1.0);
        swap_sources(&mut other);
        assert_eq!(distance(&other).unwrap().source_id, 7);
    }

    #[test]
    fn test_correct_distance() {
        let mut event = distance_event(1, 0.85);
        correct_distance(&mut event, 60);
        assert_eq!(meters_to_cm(distance(&event).unwrap().distance), 55);

        let mut close = distance_event(1, 0.2);
        correct_distance(&mut close, 60);
        assert_eq!(distance(&close).unwrap().distance, 0.0);

        // Other content is untouched
        let mut button = button_event();
        correct_distance(&mut button, 60);
        assert_eq!(content_name(&button), "userInput");
    }

    #[test]
    fn test_ensure_timestamp() {
        let mut event = button_event();
        assert!(ensure_timestamp(&mut event, 1_700_000_000_123));
        assert_eq!(event.time.len(), 1);
        assert_eq!(event.time[0].seconds, 1_700_000_000);
        assert_eq!(event.time[0].nanoseconds, 123_000_000);
        assert_eq!(
            event.time[0].reference.enum_value(),
            Ok(time::Reference::UNIX)
        );

        // Existing timestamps are kept
        assert!(!ensure_timestamp(&mut event, 5));
        assert_eq!(event.time.len(), 1);
    }

    #[test]
    fn test_signal_and_units() {
        assert!(has_signal(0.01));
        assert!(!has_signal(0.0));
        assert!(!has_signal(-1.0));
        assert!(!has_signal(f32::NAN));
        assert_eq!(meters_to_cm(1.234), 123);
        assert_eq!(meters_to_cm(-3.0), 0);
        assert_eq!(meters_to_cm(1000.0), u16::MAX);
    }

    #[test]
    fn test_content_names() {
        let mut geo = Event::new();
        geo.content = Some(event::Content::Geolocation(Geolocation::new()));
        assert_eq!(content_name(&geo), "geolocation");
        assert_eq!(content_name(&distance_event(1, 1.0)), "distance");
    }
}
