//! Finalized-log submission: local backup copy first, then a bounded number of
//! upload attempts with exponential backoff against a remote sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::persistence::{now_stamp, SqlitePreferencesStore, SubmissionRecord};

pub const DEFAULT_UPLOAD_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const FILE_NAME_HEADER: &str = "x-log-file-name";

#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("remote sink rejected upload with status {status}")]
    Rejected { status: u16 },
    #[error("remote sink request failed: {0}")]
    Transport(String),
    #[error("failed to read backup {path}: {source}")]
    ReadBackup {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no remote sink is configured")]
    NoSink,
}

#[async_trait]
pub trait RemoteSink: Send + Sync {
    /// Delivers one finalized CSV log.
    async fn submit(&self, file_name: &str, body: Vec<u8>) -> Result<(), SubmissionError>;
}

/// Posts the log as a raw `text/csv` body.
#[derive(Debug, Clone)]
pub struct HttpRemoteSink {
    client: reqwest::Client,
    url: String,
}

impl HttpRemoteSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            url: url.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RemoteSink for HttpRemoteSink {
    async fn submit(&self, file_name: &str, body: Vec<u8>) -> Result<(), SubmissionError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/csv")
            .header(FILE_NAME_HEADER, file_name)
            .body(body)
            .send()
            .await
            .map_err(|err| SubmissionError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SubmissionError::Rejected {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReport {
    pub file_name: String,
    pub backup_path: Option<PathBuf>,
    pub backup_error: Option<String>,
    pub uploaded: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl SubmissionReport {
    /// The upload did not land; the backup is the copy to resubmit.
    pub fn needs_manual_resubmission(&self) -> bool {
        !self.uploaded
    }
}

#[derive(Clone)]
pub struct LogSubmitter {
    sink: Option<Arc<dyn RemoteSink>>,
    backup_dir: PathBuf,
    ledger: Option<PathBuf>,
    max_attempts: u32,
    backoff: Duration,
}

impl std::fmt::Debug for LogSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogSubmitter")
            .field("has_sink", &self.sink.is_some())
            .field("backup_dir", &self.backup_dir)
            .field("ledger", &self.ledger)
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

impl LogSubmitter {
    pub fn new(sink: Arc<dyn RemoteSink>, backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            sink: Some(sink),
            backup_dir: backup_dir.into(),
            ledger: None,
            max_attempts: DEFAULT_UPLOAD_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Writes backups only. Every submission reports a pending upload.
    pub fn backup_only(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            sink: None,
            backup_dir: backup_dir.into(),
            ledger: None,
            max_attempts: DEFAULT_UPLOAD_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }

    /// Records each submission in the `submissions` table of this SQLite file.
    pub fn with_ledger(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger = Some(path.into());
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub async fn submit(&self, session_id: &str, file_name: &str, body: Vec<u8>) -> SubmissionReport {
        let backup_path = self.backup_dir.join(file_name);
        let backup_error = match write_backup(&self.backup_dir, &backup_path, &body).await {
            Ok(()) => None,
            Err(err) => {
                warn!(path = %backup_path.display(), error = %err, "log backup write failed");
                Some(err.to_string())
            }
        };

        let (uploaded, attempts, last_error) = self.upload_with_retry(file_name, body).await;
        let report = SubmissionReport {
            file_name: file_name.to_string(),
            backup_path: backup_error.is_none().then_some(backup_path),
            backup_error,
            uploaded,
            attempts,
            last_error,
        };
        if report.uploaded {
            info!(file_name, attempts, "log uploaded");
        } else {
            warn!(
                file_name,
                attempts,
                backup = ?report.backup_path,
                "log upload failed; backup kept for manual resubmission"
            );
        }
        self.record(session_id, &report).await;
        report
    }

    /// Rewrites the backup with a later rendering of the same log.
    pub async fn refresh_backup(&self, file_name: &str, body: &[u8]) {
        let path = self.backup_dir.join(file_name);
        if let Err(err) = write_backup(&self.backup_dir, &path, body).await {
            warn!(path = %path.display(), error = %err, "log backup refresh failed");
        }
    }

    /// Uploads a previously written backup file without rewriting it.
    pub async fn resubmit(&self, backup_path: &Path) -> Result<SubmissionReport, SubmissionError> {
        if self.sink.is_none() {
            return Err(SubmissionError::NoSink);
        }
        let body = tokio::fs::read(backup_path)
            .await
            .map_err(|source| SubmissionError::ReadBackup {
                path: backup_path.display().to_string(),
                source,
            })?;
        let file_name = backup_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("session.csv")
            .to_string();

        let (uploaded, attempts, last_error) = self.upload_with_retry(&file_name, body).await;
        let report = SubmissionReport {
            file_name: file_name.clone(),
            backup_path: Some(backup_path.to_path_buf()),
            backup_error: None,
            uploaded,
            attempts,
            last_error,
        };
        let session_id = file_name.trim_end_matches(".csv").to_string();
        self.record(&session_id, &report).await;
        Ok(report)
    }

    async fn upload_with_retry(&self, file_name: &str, body: Vec<u8>) -> (bool, u32, Option<String>) {
        let Some(sink) = self.sink.as_ref() else {
            return (false, 0, Some(SubmissionError::NoSink.to_string()));
        };

        let mut last_error = None;
        for attempt in 1..=self.max_attempts {
            match sink.submit(file_name, body.clone()).await {
                Ok(()) => return (true, attempt, None),
                Err(err) => {
                    warn!(file_name, attempt, error = %err, "log upload attempt failed");
                    last_error = Some(err.to_string());
                }
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(self.backoff * 2_u32.saturating_pow(attempt - 1)).await;
            }
        }
        (false, self.max_attempts, last_error)
    }

    async fn record(&self, session_id: &str, report: &SubmissionReport) {
        let Some(ledger) = self.ledger.clone() else {
            return;
        };
        let record = SubmissionRecord {
            session_id: session_id.to_string(),
            file_name: report.file_name.clone(),
            backup_path: report
                .backup_path
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_default(),
            uploaded: report.uploaded,
            attempts: report.attempts,
            last_error: report.last_error.clone(),
            recorded_at: now_stamp(),
        };
        let outcome = tokio::task::spawn_blocking(move || {
            let mut store = SqlitePreferencesStore::open(ledger)?;
            store.record_submission(&record)
        })
        .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(error = %err, "failed to record submission"),
            Err(err) => warn!(error = %err, "submission ledger task failed"),
        }
    }
}

async fn write_backup(dir: &Path, path: &Path, body: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(path, body).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Fails the first `failures` submissions, then accepts.
    struct FlakySink {
        failures: u32,
        calls: AtomicU32,
        received: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl FlakySink {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                calls: AtomicU32::new(0),
                received: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RemoteSink for FlakySink {
        async fn submit(&self, file_name: &str, body: Vec<u8>) -> Result<(), SubmissionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(SubmissionError::Rejected { status: 503 });
            }
            self.received
                .lock()
                .expect("lock")
                .push((file_name.to_string(), body));
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn upload_retries_with_backoff_until_accepted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = Arc::new(FlakySink::new(2));
        let submitter = LogSubmitter::new(sink.clone(), dir.path().join("backup"));

        let started = tokio::time::Instant::now();
        let report = submitter
            .submit("P1_20260101_090000", "P1_20260101_090000.csv", b"a,b\n1,2\n".to_vec())
            .await;

        assert!(report.uploaded);
        assert_eq!(report.attempts, 3);
        assert!(started.elapsed() >= Duration::from_millis(1_500));
        assert_eq!(sink.received.lock().expect("lock").len(), 1);

        let backup = report.backup_path.expect("backup path");
        assert_eq!(std::fs::read(backup).expect("backup"), b"a,b\n1,2\n");
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_upload_keeps_backup_and_ledger_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ledger = dir.path().join("ledger.sqlite");
        let sink = Arc::new(FlakySink::new(u32::MAX));
        let submitter =
            LogSubmitter::new(sink.clone(), dir.path().join("backup")).with_ledger(&ledger);

        let report = submitter
            .submit("P2_20260101_090000", "P2_20260101_090000.csv", b"x\n".to_vec())
            .await;

        assert!(!report.uploaded);
        assert!(report.needs_manual_resubmission());
        assert_eq!(report.attempts, DEFAULT_UPLOAD_ATTEMPTS);
        assert_eq!(sink.calls.load(Ordering::SeqCst), DEFAULT_UPLOAD_ATTEMPTS);
        assert!(report.backup_path.as_ref().expect("backup").exists());

        let store = SqlitePreferencesStore::open(&ledger).expect("ledger");
        let pending = store.pending_submissions().expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].session_id, "P2_20260101_090000");
    }

    #[tokio::test(start_paused = true)]
    async fn resubmit_reads_the_backup_copy() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backup = dir.path().join("P3_20260101_090000.csv");
        std::fs::write(&backup, b"header\nrow\n").expect("write");

        let sink = Arc::new(FlakySink::new(0));
        let submitter = LogSubmitter::new(sink.clone(), dir.path());
        let report = submitter.resubmit(&backup).await.expect("resubmit");

        assert!(report.uploaded);
        let received = sink.received.lock().expect("lock");
        assert_eq!(received[0].0, "P3_20260101_090000.csv");
        assert_eq!(received[0].1, b"header\nrow\n");
    }

    #[tokio::test]
    async fn backup_only_submitter_never_claims_upload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let submitter = LogSubmitter::backup_only(dir.path());
        let report = submitter.submit("P4", "P4.csv", b"x".to_vec()).await;
        assert!(!report.uploaded);
        assert_eq!(report.attempts, 0);
        assert!(report.backup_path.is_some());

        let err = submitter
            .resubmit(&dir.path().join("P4.csv"))
            .await
            .expect_err("no sink");
        assert!(matches!(err, SubmissionError::NoSink));
    }
}
