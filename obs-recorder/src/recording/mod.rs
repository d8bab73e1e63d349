//! Recording sessions.
//!
//! A [`Recorder`] holds at most one active session. Lite sensors are recorded
//! to binary `.bin` files, Classic sensors to `.csv` text files:
//!
//! ```text
//! <recordings dir>/
//! ├── obs-20261017-091245.bin            COBS(Event) 0x00 COBS(Event) 0x00 ...
//! ├── obs-20261017-091245.summary.json   counts, written when the session ends
//! ├── obs-20261017-143002.csv            header lines + one row per measurement
//! └── obs-20261017-143002.summary.json
//! ```
//!
//! All file I/O of a session runs on its own writer thread. `start` and
//! `finish` block until the file is open or closed; `record` only queues.
//! Callers on the async runtime go through `spawn_blocking` for the two
//! barriers.

pub mod binary;
mod session;
pub mod text;

use std::mem;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use obs_core::pipeline::{Record, DEFAULT_HANDLEBAR_WIDTH_CM};
use obs_core::protocol::classic::ClassicOffsets;
use obs_core::{DeviceType, ParseError};

pub use binary::{decode_binary, event_to_json, read_binary_recording, BinaryRecording};
pub use session::summary_path;

use session::RecordingSession;

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("A recording is already active")]
    AlreadyRecording,
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{path}: {source}")]
    Write { path: PathBuf, source: WriteError },
    #[error("Recording writer stopped unexpectedly")]
    WriterGone,
}

/// Failure to append one record. Logged and counted, never fatal.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("Cannot encode event: {0}")]
    Encode(#[from] ParseError),
    #[error("{record} record in a {session} recording")]
    Mismatch {
        session: DeviceType,
        record: DeviceType,
    },
}

/// What is known about the device when a session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub device_name: Option<String>,
    pub device_id: Option<String>,
    pub firmware_version: Option<String>,
    /// Offsets read from a Classic device
    pub offsets: Option<ClassicOffsets>,
    pub handlebar_width_cm: u16,
    /// Text rows in local time instead of UTC
    pub local_time: bool,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self {
            device_name: None,
            device_id: None,
            firmware_version: None,
            offsets: None,
            handlebar_width_cm: DEFAULT_HANDLEBAR_WIDTH_CM,
            local_time: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// File stem, unique within the recordings directory
    pub id: String,
    pub device_type: DeviceType,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub device_type: DeviceType,
    pub path: PathBuf,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub records_written: u64,
    /// Confirmed overtakes (button records)
    pub confirmed: u64,
    pub write_errors: u64,
    /// Including the text header
    pub bytes_written: u64,
    pub metadata: Option<SessionMetadata>,
}

impl SessionSummary {
    fn new(info: &SessionInfo, header_bytes: usize) -> Self {
        Self {
            id: info.id.clone(),
            device_type: info.device_type,
            path: info.path.clone(),
            started_at: info.started_at,
            finished_at: None,
            records_written: 0,
            confirmed: 0,
            write_errors: 0,
            bytes_written: header_bytes as u64,
            metadata: None,
        }
    }
}

enum Slot {
    Idle,
    /// File being opened
    Starting,
    Active(RecordingSession),
    /// File being closed
    Finishing,
}

/// Single-session recorder. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct Recorder {
    dir: PathBuf,
    slot: Arc<Mutex<Slot>>,
}

impl Recorder {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            slot: Arc::new(Mutex::new(Slot::Idle)),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a new session. Fails with [`RecordingError::AlreadyRecording`]
    /// unless the recorder is idle.
    pub fn start(
        &self,
        device_type: DeviceType,
        metadata: SessionMetadata,
    ) -> Result<SessionInfo, RecordingError> {
        {
            let mut slot = self.lock();
            if !matches!(*slot, Slot::Idle) {
                return Err(RecordingError::AlreadyRecording);
            }
            *slot = Slot::Starting;
        }

        match RecordingSession::open(&self.dir, device_type, metadata) {
            Ok(session) => {
                let info = session.info().clone();
                *self.lock() = Slot::Active(session);
                Ok(info)
            }
            Err(e) => {
                *self.lock() = Slot::Idle;
                Err(e)
            }
        }
    }

    /// Queue a record for the active session, if any.
    pub fn record(&self, record: Record) {
        match &*self.lock() {
            Slot::Active(session) => session.record(record),
            _ => debug!("Not recording, {} record dropped", record.device_type()),
        }
    }

    /// Close the active session and return its summary; `Ok(None)` if there
    /// was nothing to finish.
    pub fn finish(&self) -> Result<Option<SessionSummary>, RecordingError> {
        let session = {
            let mut slot = self.lock();
            match mem::replace(&mut *slot, Slot::Finishing) {
                Slot::Active(session) => session,
                other => {
                    *slot = other;
                    return Ok(None);
                }
            }
        };

        let result = session.finish();
        *self.lock() = Slot::Idle;
        result.map(Some)
    }

    pub fn is_recording(&self) -> bool {
        matches!(*self.lock(), Slot::Active(_))
    }

    pub fn current(&self) -> Option<SessionInfo> {
        match &*self.lock() {
            Slot::Active(session) => Some(session.info().clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obs_core::pipeline::ClassicRow;
    use obs_core::protocol::lite;
    use obs_core::protos::obs::{event, user_input, Event, UserInput};
    use protobuf::EnumOrUnknown;
    use std::fs;

    fn button() -> Event {
        let mut input = UserInput::new();
        input.type_ = EnumOrUnknown::new(user_input::Type::OVERTAKER);
        let mut event = Event::new();
        event.content = Some(event::Content::UserInput(input));
        event
    }

    fn classic_row(confirmed_cm: Option<u16>) -> ClassicRow {
        ClassicRow {
            clock_ms: 1_000,
            left_cm: Some(120),
            right_cm: Some(200),
            left_raw_cm: Some(150),
            right_raw_cm: Some(230),
            confirmed_cm,
            battery_level: None,
            location: None,
        }
    }

    fn file_count(dir: &std::path::Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter(|e| {
                let path = e.as_ref().unwrap().path();
                !path.to_string_lossy().ends_with(".summary.json")
            })
            .count()
    }

    #[test]
    fn test_second_start_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().to_path_buf());

        recorder
            .start(DeviceType::Lite, SessionMetadata::default())
            .unwrap();
        assert!(matches!(
            recorder.start(DeviceType::Lite, SessionMetadata::default()),
            Err(RecordingError::AlreadyRecording)
        ));
        assert_eq!(file_count(dir.path()), 1);

        recorder.finish().unwrap();
        assert!(!recorder.is_recording());
    }

    #[test]
    fn test_idle_operations_are_noops() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().join("recordings"));
        recorder.record(Record::Lite(button()));
        assert!(recorder.finish().unwrap().is_none());
        assert!(recorder.current().is_none());
        assert!(!dir.path().join("recordings").exists());
    }

    #[test]
    fn test_lite_session() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().to_path_buf());
        let info = recorder
            .start(DeviceType::Lite, SessionMetadata::default())
            .unwrap();
        assert_eq!(info.path.extension().unwrap(), "bin");
        assert!(info.id.starts_with("obs-"));
        assert_eq!(recorder.current(), Some(info.clone()));

        recorder.record(Record::Lite(lite::distance_event(1, 0.85)));
        recorder.record(Record::Lite(button()));
        recorder.record(Record::Classic(classic_row(None)));
        let summary = recorder.finish().unwrap().unwrap();

        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.confirmed, 1);
        assert_eq!(summary.write_errors, 1);
        assert!(summary.finished_at.is_some());

        let recording = read_binary_recording(&info.path).unwrap();
        assert_eq!(recording.events.len(), 2);
        assert_eq!(
            summary.bytes_written,
            fs::metadata(&info.path).unwrap().len()
        );

        let sidecar = fs::read_to_string(summary_path(&info.path)).unwrap();
        let stored: SessionSummary = serde_json::from_str(&sidecar).unwrap();
        assert_eq!(stored, summary);
    }

    #[test]
    fn test_classic_session() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().to_path_buf());
        let metadata = SessionMetadata {
            device_id: Some("OBS-42".into()),
            ..Default::default()
        };
        let info = recorder.start(DeviceType::Classic, metadata).unwrap();
        assert_eq!(info.path.extension().unwrap(), "csv");

        recorder.record(Record::Classic(classic_row(None)));
        recorder.record(Record::Classic(classic_row(Some(120))));
        let summary = recorder.finish().unwrap().unwrap();
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.confirmed, 1);

        let text = fs::read_to_string(&info.path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("&DeviceId=OBS-42&"));
        assert!(lines[3].contains(";OVERTAKING;"));
        assert_eq!(summary.bytes_written, text.len() as u64);
    }

    #[test]
    fn test_sessions_never_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().to_path_buf());
        let first = recorder
            .start(DeviceType::Classic, SessionMetadata::default())
            .unwrap();
        recorder.finish().unwrap();
        let second = recorder
            .start(DeviceType::Classic, SessionMetadata::default())
            .unwrap();
        recorder.finish().unwrap();
        assert_ne!(first.path, second.path);
    }

    #[test]
    fn test_concurrent_finish_closes_once() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::new(dir.path().to_path_buf());
        recorder
            .start(DeviceType::Lite, SessionMetadata::default())
            .unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let r = recorder.clone();
                std::thread::spawn(move || r.finish().unwrap())
            })
            .collect();
        let finished = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .count();
        assert_eq!(finished, 1);
    }
}
