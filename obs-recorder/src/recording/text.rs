//! Text recordings (Classic).
//!
//! Two header lines followed by one `;`-separated row per measurement:
//!
//! ```text
//! OBSDataFormat=2&OffsetLeft=30&OffsetRight=30&DeviceId=...&TimeZone=UTC&...
//! Date;Time;Millis;Comment;Latitude;...;Tms1;Lus1;Rus1
//! 17.10.2026;09:12:45;123400;;;;;;;;;87;110;;;;0;0;58;1;0;8120;
//! ```
//!
//! Optional fields without a value are left empty.

use std::io::Write;

use chrono::{DateTime, Local, Utc};

use obs_core::pipeline::ClassicRow;
use obs_core::protocol::classic::{
    flight_time_us, ClassicOffsets, FLIGHT_TIME_FACTOR, MAX_VALID_FLIGHT_TIME_US,
};

use super::{SessionMetadata, WriteError};

pub const DATA_FORMAT_VERSION: u32 = 2;

pub const COLUMNS: [&str; 23] = [
    "Date",
    "Time",
    "Millis",
    "Comment",
    "Latitude",
    "Longitude",
    "Altitude",
    "Course",
    "Speed",
    "HDOP",
    "Satellites",
    "BatteryLevel",
    "Left",
    "Right",
    "Confirmed",
    "Marked",
    "Invalid",
    "InsidePrivacyArea",
    "Factor",
    "Measurements",
    "Tms1",
    "Lus1",
    "Rus1",
];

pub struct TextWriter<W: Write> {
    out: W,
    local_time: bool,
}

impl<W: Write> TextWriter<W> {
    /// Write both header lines and return the writer with the header size.
    pub fn create(mut out: W, metadata: &SessionMetadata) -> Result<(Self, usize), WriteError> {
        let header = format!("{}\n{}\n", metadata_line(metadata), COLUMNS.join(";"));
        out.write_all(header.as_bytes())?;
        let writer = Self {
            out,
            local_time: metadata.local_time,
        };
        Ok((writer, header.len()))
    }

    /// Append a row stamped with `at`. Returns the number of bytes written.
    pub fn write_row(&mut self, row: &ClassicRow, at: DateTime<Utc>) -> Result<usize, WriteError> {
        let line = format_row(row, at, self.local_time) + "\n";
        self.out.write_all(line.as_bytes())?;
        Ok(line.len())
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn metadata_line(metadata: &SessionMetadata) -> String {
    let offsets = metadata
        .offsets
        .unwrap_or_else(|| ClassicOffsets::from_handlebar_width(metadata.handlebar_width_cm));
    // Offset at session start, e.g. `UTC+02:00`
    let time_zone = if metadata.local_time {
        format!("UTC{}", Local::now().offset())
    } else {
        "UTC".to_string()
    };

    [
        format!("OBSDataFormat={}", DATA_FORMAT_VERSION),
        format!("OffsetLeft={}", offsets.left_cm),
        format!("OffsetRight={}", offsets.right_cm),
        format!("DeviceId={}", metadata.device_id.as_deref().unwrap_or("")),
        format!("TimeZone={}", time_zone),
        format!("MaximumValidFlightTimeMicroseconds={}", MAX_VALID_FLIGHT_TIME_US),
        format!(
            "OBSFirmwareVersion={}",
            metadata.firmware_version.as_deref().unwrap_or("")
        ),
        "DataPerMeasurement=3".to_string(),
        "MaximumMeasurementsPerLine=1".to_string(),
    ]
    .join("&")
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn format_row(row: &ClassicRow, at: DateTime<Utc>, local_time: bool) -> String {
    let (date, time) = if local_time {
        let local = at.with_timezone(&Local);
        (
            local.format("%d.%m.%Y").to_string(),
            local.format("%H:%M:%S").to_string(),
        )
    } else {
        (
            at.format("%d.%m.%Y").to_string(),
            at.format("%H:%M:%S").to_string(),
        )
    };
    let location = row.location;
    let fields: [String; 23] = [
        date,
        time,
        row.clock_ms.to_string(),
        String::new(),
        opt(location.map(|l| format!("{:.6}", l.latitude))),
        opt(location.map(|l| format!("{:.6}", l.longitude))),
        opt(location.map(|l| format!("{:.1}", l.altitude))),
        opt(location.map(|l| format!("{:.1}", l.course_deg))),
        // km/h
        opt(location.map(|l| format!("{:.2}", l.speed_mps * 3.6))),
        opt(location.map(|l| format!("{:.2}", l.hdop))),
        String::new(),
        opt(row.battery_level),
        opt(row.left_cm),
        opt(row.right_cm),
        opt(row.confirmed_cm),
        if row.is_confirmed() {
            "OVERTAKING".to_string()
        } else {
            String::new()
        },
        "0".to_string(),
        "0".to_string(),
        FLIGHT_TIME_FACTOR.to_string(),
        "1".to_string(),
        "0".to_string(),
        opt(row.left_raw_cm.map(flight_time_us)),
        opt(row.right_raw_cm.map(flight_time_us)),
    ];
    fields.join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn metadata() -> SessionMetadata {
        SessionMetadata {
            device_id: Some("OBS-1234".into()),
            firmware_version: Some("v0.3.999".into()),
            offsets: Some(ClassicOffsets {
                left_cm: 30,
                right_cm: 32,
            }),
            ..Default::default()
        }
    }

    fn row() -> ClassicRow {
        ClassicRow {
            clock_ms: 123_400,
            left_cm: Some(110),
            right_cm: None,
            left_raw_cm: Some(140),
            right_raw_cm: None,
            confirmed_cm: None,
            battery_level: Some(87),
            location: None,
        }
    }

    #[test]
    fn test_header_lines() {
        let (writer, n) = TextWriter::create(Vec::new(), &metadata()).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(n, text.len());

        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "OBSDataFormat=2&OffsetLeft=30&OffsetRight=32&DeviceId=OBS-1234&TimeZone=UTC\
             &MaximumValidFlightTimeMicroseconds=18560&OBSFirmwareVersion=v0.3.999\
             &DataPerMeasurement=3&MaximumMeasurementsPerLine=1"
        );
        assert_eq!(lines[1].split(';').count(), COLUMNS.len());
        assert!(lines[1].starts_with("Date;Time;Millis;Comment;Latitude"));
    }

    #[test]
    fn test_header_defaults_to_handlebar_offsets() {
        let metadata = SessionMetadata {
            handlebar_width_cm: 70,
            ..Default::default()
        };
        let (writer, _) = TextWriter::create(Vec::new(), &metadata).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        assert!(text.starts_with("OBSDataFormat=2&OffsetLeft=35&OffsetRight=35&DeviceId=&"));
        assert!(text.contains("&OBSFirmwareVersion=&"));
    }

    #[test]
    fn test_local_time_zone_is_an_offset() {
        let metadata = SessionMetadata {
            local_time: true,
            ..metadata()
        };
        let (writer, _) = TextWriter::create(Vec::new(), &metadata).unwrap();
        let text = String::from_utf8(writer.into_inner()).unwrap();
        let zone = text
            .split('&')
            .find_map(|field| field.strip_prefix("TimeZone="))
            .unwrap();
        assert_eq!(zone, format!("UTC{}", Local::now().offset()));
        assert!(zone[3..].starts_with(['+', '-']), "{}", zone);
    }

    #[test]
    fn test_rows_leave_missing_fields_empty() {
        let (mut writer, _) = TextWriter::create(Vec::new(), &metadata()).unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 17, 9, 12, 45).unwrap();
        writer.write_row(&row(), at).unwrap();

        let confirmed = ClassicRow {
            confirmed_cm: Some(110),
            ..row()
        };
        writer.write_row(&confirmed, at).unwrap();

        let text = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[2],
            "17.10.2026;09:12:45;123400;;;;;;;;;87;110;;;;0;0;58;1;0;8120;"
        );
        let fields: Vec<&str> = lines[3].split(';').collect();
        assert_eq!(fields.len(), COLUMNS.len());
        assert_eq!(fields[14], "110");
        assert_eq!(fields[15], "OVERTAKING");
    }
}
