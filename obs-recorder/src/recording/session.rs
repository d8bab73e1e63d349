//! One recording session and its writer thread.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use chrono::{DateTime, Utc};
use crossbeam::channel::{self, Receiver, Sender};
use log::{debug, error, info, warn};

use obs_core::pipeline::Record;
use obs_core::protos::obs::event;
use obs_core::DeviceType;

use super::binary::BinaryWriter;
use super::text::TextWriter;
use super::{RecordingError, SessionInfo, SessionMetadata, SessionSummary, WriteError};

const SUMMARY_EXTENSION: &str = "summary.json";

enum WriterCommand {
    Record(Record, DateTime<Utc>),
    Finish(Sender<SessionSummary>),
}

/// File format strategy of a session.
enum SessionWriter {
    Binary(BinaryWriter<BufWriter<File>>),
    Text(TextWriter<BufWriter<File>>),
}

impl SessionWriter {
    fn write(&mut self, record: &Record, at: DateTime<Utc>) -> Result<usize, WriteError> {
        match (self, record) {
            (SessionWriter::Binary(w), Record::Lite(event)) => {
                w.write_event(event, at.timestamp_millis())
            }
            (SessionWriter::Text(w), Record::Classic(row)) => w.write_row(row, at),
            (SessionWriter::Binary(_), r) => Err(WriteError::Mismatch {
                session: DeviceType::Lite,
                record: r.device_type(),
            }),
            (SessionWriter::Text(_), r) => Err(WriteError::Mismatch {
                session: DeviceType::Classic,
                record: r.device_type(),
            }),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SessionWriter::Binary(w) => w.flush(),
            SessionWriter::Text(w) => w.flush(),
        }
    }
}

fn is_confirmation(record: &Record) -> bool {
    match record {
        Record::Lite(e) => matches!(e.content, Some(event::Content::UserInput(_))),
        Record::Classic(row) => row.is_confirmed(),
    }
}

/// Path of the summary written next to a recording.
pub fn summary_path(recording: &Path) -> PathBuf {
    recording.with_extension(SUMMARY_EXTENSION)
}

/// Create `obs-<timestamp>.<ext>` in `dir`, never overwriting a file.
fn create_file(
    dir: &Path,
    device_type: DeviceType,
    started_at: DateTime<Utc>,
) -> Result<(File, PathBuf), RecordingError> {
    let io_err = |path: &Path, source| RecordingError::Io {
        path: path.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;

    let stem = format!("obs-{}", started_at.format("%Y%m%d-%H%M%S"));
    let ext = device_type.file_extension();
    let mut suffix = 0;
    loop {
        let name = if suffix == 0 {
            format!("{}.{}", stem, ext)
        } else {
            format!("{}-{}.{}", stem, suffix, ext)
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
            Err(e) => return Err(io_err(&path, e)),
        }
    }
}

pub(super) struct RecordingSession {
    info: SessionInfo,
    tx: Sender<WriterCommand>,
    thread: Option<JoinHandle<()>>,
}

impl RecordingSession {
    /// Create the file, write any header and start the writer thread.
    pub(super) fn open(
        dir: &Path,
        device_type: DeviceType,
        metadata: SessionMetadata,
    ) -> Result<RecordingSession, RecordingError> {
        let started_at = Utc::now();
        let (file, path) = create_file(dir, device_type, started_at)?;
        let out = BufWriter::new(file);

        let (writer, header_bytes) = match device_type {
            DeviceType::Lite => (
                SessionWriter::Binary(BinaryWriter::new(out, metadata.handlebar_width_cm)),
                0,
            ),
            DeviceType::Classic => {
                let (w, n) =
                    TextWriter::create(out, &metadata).map_err(|source| RecordingError::Write {
                        path: path.clone(),
                        source,
                    })?;
                (SessionWriter::Text(w), n)
            }
        };

        let info = SessionInfo {
            id: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            device_type,
            path: path.clone(),
            started_at,
        };

        let (tx, rx) = channel::unbounded();
        let worker = SessionWorker {
            info: info.clone(),
            metadata,
            writer,
            summary: SessionSummary::new(&info, header_bytes),
        };
        let thread = thread::Builder::new()
            .name("obs-session-writer".into())
            .spawn(move || worker.run(rx))
            .map_err(|source| RecordingError::Io {
                path: path.clone(),
                source,
            })?;

        info!("Recording {} to {}", device_type, path.display());
        Ok(RecordingSession {
            info,
            tx,
            thread: Some(thread),
        })
    }

    pub(super) fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Queue a record; never blocks.
    pub(super) fn record(&self, record: Record) {
        if self.tx.send(WriterCommand::Record(record, Utc::now())).is_err() {
            warn!("Recording {}: writer gone, record dropped", self.info.id);
        }
    }

    /// Flush everything queued, close the file and write the summary.
    pub(super) fn finish(mut self) -> Result<SessionSummary, RecordingError> {
        let (ack_tx, ack_rx) = channel::bounded(1);
        self.tx
            .send(WriterCommand::Finish(ack_tx))
            .map_err(|_| RecordingError::WriterGone)?;
        let summary = ack_rx.recv().map_err(|_| RecordingError::WriterGone)?;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Recording {}: writer thread panicked", self.info.id);
            }
        }
        Ok(summary)
    }
}

struct SessionWorker {
    info: SessionInfo,
    metadata: SessionMetadata,
    writer: SessionWriter,
    summary: SessionSummary,
}

impl SessionWorker {
    fn run(mut self, rx: Receiver<WriterCommand>) {
        for command in rx.iter() {
            match command {
                WriterCommand::Record(record, at) => self.write(&record, at),
                WriterCommand::Finish(ack) => {
                    let summary = self.close();
                    let _ = ack.send(summary);
                    return;
                }
            }
        }
        // Session dropped without finish
        self.close();
    }

    fn write(&mut self, record: &Record, at: DateTime<Utc>) {
        match self.writer.write(record, at) {
            Ok(n) => {
                self.summary.records_written += 1;
                self.summary.bytes_written += n as u64;
                if is_confirmation(record) {
                    self.summary.confirmed += 1;
                }
            }
            Err(e) => {
                self.summary.write_errors += 1;
                warn!("Recording {}: {}", self.info.id, e);
            }
        }
    }

    fn close(&mut self) -> SessionSummary {
        if let Err(e) = self.writer.flush() {
            self.summary.write_errors += 1;
            error!("Recording {}: flush failed: {}", self.info.id, e);
        }
        self.summary.finished_at = Some(Utc::now());
        self.summary.metadata = Some(self.metadata.clone());

        let path = summary_path(&self.info.path);
        match serde_json::to_string_pretty(&self.summary) {
            Ok(json) => {
                if let Err(e) = fs::write(&path, json + "\n") {
                    error!("Cannot write {}: {}", path.display(), e);
                }
            }
            Err(e) => error!("Cannot serialize summary: {}", e),
        }
        debug!(
            "Recording {} closed: {} records, {} errors",
            self.info.id, self.summary.records_written, self.summary.write_errors
        );
        self.summary.clone()
    }
}
