//! Append-only CSV session log with in-memory buffering on write failure.
//!
//! Rows are encoded up front and written one at a time with an explicit flush,
//! so a failing sink is detected per row. Once a row is buffered every later row
//! queues behind it; nothing is ever dropped or reordered.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use contracts::{cell, session_stem, EventRecord, EVENT_COLUMNS};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("failed to create log {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode log row: {0}")]
    Encode(#[from] csv::Error),
    #[error("{count} log rows are still buffered")]
    Buffered { count: usize },
}

pub type LogSink = Box<dyn Write + Send>;

/// `<participant_id>_<YYYYMMDD_HHMMSS>.csv`
pub fn log_file_name(participant_id: &str, started_at: DateTime<Utc>) -> String {
    let compact = started_at.format("%Y%m%d_%H%M%S").to_string();
    format!("{}.csv", session_stem(participant_id, &compact))
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedLog {
    pub path: Option<PathBuf>,
    pub file_name: String,
    pub rows: usize,
    pub buffered_rows: usize,
}

pub struct EventLog {
    path: Option<PathBuf>,
    file_name: String,
    sink: Option<LogSink>,
    started_at: DateTime<Utc>,
    header_written: bool,
    pending: VecDeque<Vec<u8>>,
    /// Error that started the current buffering episode, until taken.
    write_failure: Option<String>,
    records: Vec<EventRecord>,
    next_sequence: u64,
    finalized: bool,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("path", &self.path)
            .field("rows", &self.records.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl EventLog {
    /// Opens (or reopens) the session file under `dir`. Failure here is the one
    /// fatal log error: a session cannot start without a log file.
    pub fn open(
        dir: &Path,
        participant_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<Self, EventLogError> {
        let file_name = log_file_name(participant_id, started_at);
        let path = dir.join(&file_name);
        std::fs::create_dir_all(dir).map_err(|source| EventLogError::Create {
            path: dir.display().to_string(),
            source,
        })?;
        let mut log = Self::detached(file_name, started_at);
        log.path = Some(path);
        log.init()?;
        Ok(log)
    }

    /// Writes into an arbitrary sink; used by simulations and tests.
    pub fn with_sink(
        sink: LogSink,
        file_name: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Result<Self, EventLogError> {
        let mut log = Self::detached(file_name.into(), started_at);
        log.sink = Some(sink);
        log.write_header()?;
        Ok(log)
    }

    /// Keeps rows in memory only.
    pub fn in_memory(file_name: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        let mut log = Self::detached(file_name.into(), started_at);
        log.sink = Some(Box::new(std::io::sink()));
        log.header_written = true;
        log
    }

    fn detached(file_name: String, started_at: DateTime<Utc>) -> Self {
        Self {
            path: None,
            file_name,
            sink: None,
            started_at,
            header_written: false,
            pending: VecDeque::new(),
            write_failure: None,
            records: Vec::new(),
            next_sequence: 1,
            finalized: false,
        }
    }

    /// Idempotent: never truncates, and writes the header only to an empty file.
    pub fn init(&mut self) -> Result<(), EventLogError> {
        if self.sink.is_some() {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let file = open_append(&path)?;
        let is_empty = file
            .metadata()
            .map(|meta| meta.len() == 0)
            .map_err(|source| EventLogError::Create {
                path: path.display().to_string(),
                source,
            })?;
        self.sink = Some(Box::new(file));
        self.header_written = !is_empty;
        self.write_header()
    }

    fn write_header(&mut self) -> Result<(), EventLogError> {
        if self.header_written {
            return Ok(());
        }
        let header = encode_row(EVENT_COLUMNS.iter().copied())?;
        let target = self
            .path
            .as_ref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| self.file_name.clone());
        let sink = self.sink.as_mut().ok_or_else(|| EventLogError::Create {
            path: target.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotConnected, "no sink"),
        })?;
        write_row(sink, &header).map_err(|source| EventLogError::Create {
            path: target,
            source,
        })?;
        self.header_written = true;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn records(&self) -> &[EventRecord] {
        &self.records
    }

    pub fn buffered_rows(&self) -> usize {
        self.pending.len()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Stamps timing and sequence columns and appends the row. Returns the
    /// assigned `log_sequence`. Rows appended after finalize are still kept.
    pub fn append(&mut self, now_ms: u64, mut record: EventRecord) -> Result<u64, EventLogError> {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let at = self.started_at + Duration::milliseconds(now_ms as i64);
        record.timestamp = Some(at.to_rfc3339_opts(SecondsFormat::Millis, true));
        record.elapsed_ms = cell(now_ms);
        record.log_sequence = cell(sequence);

        let encoded = encode_row(record.to_row())?;
        self.records.push(record);

        if !self.pending.is_empty() {
            self.pending.push_back(encoded);
            return Ok(sequence);
        }
        if let Err(err) = self.write_encoded(&encoded) {
            warn!(sequence, error = %err, "log write failed; buffering row");
            self.pending.push_back(encoded);
            self.write_failure = Some(err.to_string());
        }
        Ok(sequence)
    }

    /// The write error that moved the log from direct writes to buffering, once
    /// per episode. An episode ends when the buffer drains.
    pub fn take_write_failure(&mut self) -> Option<String> {
        self.write_failure.take()
    }

    /// Writes buffered rows in order, stopping at the first failure. Returns how
    /// many rows reached the sink.
    pub fn retry_pending(&mut self) -> usize {
        if self.pending.is_empty() {
            return 0;
        }
        if self.sink.is_none() && self.init().is_err() {
            return 0;
        }
        let mut written = 0;
        while let Some(row) = self.pending.pop_front() {
            if let Err(err) = self.write_encoded(&row) {
                debug!(error = %err, remaining = self.pending.len() + 1, "log retry failed");
                self.pending.push_front(row);
                break;
            }
            written += 1;
        }
        written
    }

    /// Final flush. Buffered rows that still cannot be written stay in memory
    /// and are reported; the full content remains available via [`Self::render_csv`].
    pub fn finalize(&mut self) -> FinalizedLog {
        self.retry_pending();
        if let Some(sink) = self.sink.as_mut() {
            if let Err(err) = sink.flush() {
                warn!(error = %err, "final log flush failed");
            }
        }
        self.finalized = true;
        FinalizedLog {
            path: self.path.clone(),
            file_name: self.file_name.clone(),
            rows: self.records.len(),
            buffered_rows: self.pending.len(),
        }
    }

    /// Renders the complete log (header plus every appended row) from memory.
    pub fn render_csv(&self) -> Result<Vec<u8>, EventLogError> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        writer.write_record(EVENT_COLUMNS)?;
        for record in &self.records {
            writer.write_record(record.to_row())?;
        }
        writer
            .into_inner()
            .map_err(|err| EventLogError::Encode(csv::Error::from(err.into_error())))
    }

    fn write_encoded(&mut self, row: &[u8]) -> std::io::Result<()> {
        match self.sink.as_mut() {
            Some(sink) => write_row(sink, row),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "log file is not open",
            )),
        }
    }
}

fn open_append(path: &Path) -> Result<File, EventLogError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| EventLogError::Create {
            path: path.display().to_string(),
            source,
        })
}

fn write_row(sink: &mut LogSink, row: &[u8]) -> std::io::Result<()> {
    sink.write_all(row)?;
    sink.flush()
}

fn encode_row<'a>(fields: impl IntoIterator<Item = &'a str>) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(fields)?;
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use contracts::EventKind;
    use std::sync::{Arc, Mutex};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).single().expect("valid time")
    }

    /// Sink that fails while `broken` is set and records what reached it.
    #[derive(Clone, Default)]
    struct FlakySink {
        broken: Arc<Mutex<bool>>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if *self.broken.lock().expect("lock") {
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
            }
            self.written.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn lines(bytes: &[u8]) -> Vec<String> {
        String::from_utf8(bytes.to_vec())
            .expect("utf8")
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn file_name_uses_participant_and_start_time() {
        assert_eq!(log_file_name("P007", start()), "P007_20260314_092653.csv");
    }

    #[test]
    fn reopening_keeps_a_single_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut first = EventLog::open(dir.path(), "P1", start()).expect("open");
        first
            .append(0, EventRecord::new(EventKind::SessionStarted))
            .expect("append");
        first.init().expect("init is idempotent");
        first.finalize();
        drop(first);

        let mut second = EventLog::open(dir.path(), "P1", start()).expect("reopen");
        second
            .append(10, EventRecord::new(EventKind::SessionResumed))
            .expect("append");
        second.finalize();

        let path = dir.path().join("P1_20260314_092653.csv");
        let content = std::fs::read(&path).expect("read");
        let rows = lines(&content);
        assert_eq!(rows.len(), 3);
        assert!(rows[0].starts_with("timestamp,elapsed_ms,log_sequence,event_type"));
        assert_eq!(
            rows.iter().filter(|row| row.starts_with("timestamp,")).count(),
            1
        );
    }

    #[test]
    fn every_row_matches_the_header_width() {
        let mut log = EventLog::in_memory("mem.csv", start());
        let mut record = EventRecord::new(EventKind::TrialOutcome);
        record.error_detail = Some("contains, a comma".to_string());
        log.append(5, record).expect("append");
        log.append(9, EventRecord::new(EventKind::FeedbackShown))
            .expect("append");

        let rendered = log.render_csv().expect("render");
        let mut reader = csv::ReaderBuilder::new().from_reader(rendered.as_slice());
        let header_len = reader.headers().expect("headers").len();
        assert_eq!(header_len, EVENT_COLUMNS.len());
        let rows = reader
            .records()
            .collect::<Result<Vec<_>, _>>()
            .expect("rows");
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.len(), header_len);
        }
        assert_eq!(&rows[0][2], "1");
        assert_eq!(&rows[1][2], "2");
        assert_eq!(&rows[0][0], "2026-03-14T09:26:53.005Z");
        assert_eq!(&rows[1][EVENT_COLUMNS.len() - 1], "NA");
    }

    #[test]
    fn failed_rows_are_buffered_and_retried_in_order() {
        let sink = FlakySink::default();
        let mut log =
            EventLog::with_sink(Box::new(sink.clone()), "flaky.csv", start()).expect("header");

        log.append(0, EventRecord::new(EventKind::SessionStarted))
            .expect("append");
        *sink.broken.lock().expect("lock") = true;
        log.append(1, EventRecord::new(EventKind::StageEntered))
            .expect("append");
        assert!(log.take_write_failure().is_some());
        log.append(2, EventRecord::new(EventKind::InstructionAdvanced))
            .expect("append");
        assert_eq!(log.buffered_rows(), 2);
        assert!(log.take_write_failure().is_none(), "one report per episode");
        assert_eq!(log.retry_pending(), 0);

        *sink.broken.lock().expect("lock") = false;
        log.append(3, EventRecord::new(EventKind::StageEntered))
            .expect("append");
        assert_eq!(log.buffered_rows(), 3, "later rows queue behind the failure");

        let report = log.finalize();
        assert_eq!(report.buffered_rows, 0);
        assert_eq!(report.rows, 4);

        let written = lines(&sink.written.lock().expect("lock"));
        assert_eq!(written.len(), 5);
        let sequences = written[1..]
            .iter()
            .map(|row| row.split(',').nth(2).unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(sequences, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn unwritable_directory_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").expect("write");
        assert!(matches!(
            EventLog::open(&blocker, "P1", start()),
            Err(EventLogError::Create { .. })
        ));
    }
}
