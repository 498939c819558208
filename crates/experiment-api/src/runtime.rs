//! One tokio task per session. The task owns the engine; commands arrive over
//! an `mpsc` channel, engine timers become `sleep_until` deadlines, and notices
//! fan out over a `broadcast` channel.

use std::time::Duration;

use contracts::{EventRecord, InputKind, OutcomeSignal, SessionNotice, SessionStatus};
use experiment_core::{Acceptance, FinalizedLog, InputDisposition, Session, SessionError};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::upload::{LogSubmitter, SubmissionReport};

const COMMAND_BUFFER: usize = 256;
const NOTICE_BUFFER: usize = 1024;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("session runtime has stopped")]
    Closed,
    #[error("no outcome signal is available to redeliver")]
    NoSignal,
    #[error("session is still running")]
    StillRunning,
}

/// A notice stamped with the session it came from and its publish order.
#[derive(Debug, Clone, Serialize)]
pub struct NoticeEnvelope {
    pub session_id: String,
    pub sequence: u64,
    pub at_ms: u64,
    pub notice: SessionNotice,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalizeReport {
    pub session_id: String,
    pub file_name: String,
    pub path: Option<String>,
    pub rows: usize,
    pub buffered_rows: usize,
    pub submission: Option<SubmissionReport>,
}

impl FinalizeReport {
    fn new(session_id: &str, log: &FinalizedLog, submission: Option<SubmissionReport>) -> Self {
        Self {
            session_id: session_id.to_string(),
            file_name: log.file_name.clone(),
            path: log.path.as_ref().map(|path| path.display().to_string()),
            rows: log.rows,
            buffered_rows: log.buffered_rows,
            submission,
        }
    }
}

/// A window of logged rows, `start..start + records.len()` of `total`.
#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub total: usize,
    pub start: usize,
    pub records: Vec<EventRecord>,
}

type Reply<T> = oneshot::Sender<Result<T, RuntimeError>>;

enum SessionCommand {
    Start(Reply<SessionStatus>),
    Input(InputKind, Reply<InputDisposition>),
    Outcome(Option<OutcomeSignal>, Reply<Acceptance>),
    ForceEnd(Reply<bool>),
    Abort(String, Reply<FinalizeReport>),
    Status(Reply<SessionStatus>),
    Records(usize, usize, Reply<RecordPage>),
    Finalize(Reply<FinalizeReport>),
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    session_id: String,
    commands: mpsc::Sender<SessionCommand>,
    notices: broadcast::Sender<NoticeEnvelope>,
}

impl SessionHandle {
    /// Moves the session into its own task. The session is not started until
    /// [`SessionHandle::start`], so subscribers can attach first.
    pub fn spawn(session: Session, submitter: Option<LogSubmitter>) -> Self {
        let session_id = session.session_id().to_string();
        let (commands, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);

        let actor = SessionActor {
            session,
            origin: Instant::now(),
            submitter,
            submission: None,
            submitted: false,
            notices: notices.clone(),
            next_notice: 0,
        };
        tokio::spawn(actor.run(receiver));

        Self {
            session_id,
            commands,
            notices,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NoticeEnvelope> {
        self.notices.subscribe()
    }

    pub async fn start(&self) -> Result<SessionStatus, RuntimeError> {
        self.request(SessionCommand::Start).await
    }

    pub async fn input(&self, input: InputKind) -> Result<InputDisposition, RuntimeError> {
        self.request(|reply| SessionCommand::Input(input, reply)).await
    }

    /// Delivers `signal`, or redelivers the last signal the movement task
    /// produced when `signal` is `None`.
    pub async fn deliver_outcome(
        &self,
        signal: Option<OutcomeSignal>,
    ) -> Result<Acceptance, RuntimeError> {
        self.request(|reply| SessionCommand::Outcome(signal, reply))
            .await
    }

    pub async fn force_end(&self) -> Result<bool, RuntimeError> {
        self.request(SessionCommand::ForceEnd).await
    }

    pub async fn abort(&self, detail: impl Into<String>) -> Result<FinalizeReport, RuntimeError> {
        let detail = detail.into();
        self.request(|reply| SessionCommand::Abort(detail, reply))
            .await
    }

    pub async fn status(&self) -> Result<SessionStatus, RuntimeError> {
        self.request(SessionCommand::Status).await
    }

    /// Rows `start..start + limit` of the in-memory log.
    pub async fn records(&self, start: usize, limit: usize) -> Result<RecordPage, RuntimeError> {
        self.request(|reply| SessionCommand::Records(start, limit, reply))
            .await
    }

    /// Waits for the ended session's log to be finalized and submitted.
    pub async fn finalize(&self) -> Result<FinalizeReport, RuntimeError> {
        self.request(SessionCommand::Finalize).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, RuntimeError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| RuntimeError::Closed)?;
        response.await.map_err(|_| RuntimeError::Closed)?
    }
}

struct SessionActor {
    session: Session,
    origin: Instant,
    submitter: Option<LogSubmitter>,
    submission: Option<SubmissionReport>,
    submitted: bool,
    notices: broadcast::Sender<NoticeEnvelope>,
    next_notice: u64,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<SessionCommand>) {
        loop {
            self.publish_notices();
            if self.session.is_ended() && !self.submitted {
                self.submit().await;
            }

            let deadline = self.session.next_deadline();
            let wake_at = self.origin + Duration::from_millis(deadline.unwrap_or(0));
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                    let now_ms = self.now_ms();
                    self.session.advance_to(now_ms);
                }
            }
        }
        debug!(session_id = %self.session.session_id(), "session runtime stopped");
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn handle(&mut self, command: SessionCommand) {
        let now_ms = self.now_ms();
        match command {
            SessionCommand::Start(reply) => {
                let result = self
                    .session
                    .start(now_ms)
                    .map(|()| self.session.status())
                    .map_err(RuntimeError::from);
                let _ = reply.send(result);
            }
            SessionCommand::Input(input, reply) => {
                let result = self
                    .session
                    .handle_input(now_ms, input)
                    .map_err(RuntimeError::from);
                let _ = reply.send(result);
            }
            SessionCommand::Outcome(signal, reply) => {
                let signal = signal.or_else(|| self.session.last_signal().cloned());
                let result = match signal {
                    Some(signal) => self
                        .session
                        .deliver_outcome(now_ms, signal)
                        .map_err(RuntimeError::from),
                    None => Err(RuntimeError::NoSignal),
                };
                let _ = reply.send(result);
            }
            SessionCommand::ForceEnd(reply) => {
                let result = self
                    .session
                    .force_end_movement(now_ms)
                    .map_err(RuntimeError::from);
                let _ = reply.send(result);
            }
            SessionCommand::Abort(detail, reply) => {
                let result = self
                    .session
                    .abort(now_ms, &detail)
                    .map(|log| FinalizeReport::new(self.session.session_id(), &log, None))
                    .map_err(RuntimeError::from);
                let _ = reply.send(result);
            }
            SessionCommand::Status(reply) => {
                self.session.advance_to(now_ms);
                let _ = reply.send(Ok(self.session.status()));
            }
            SessionCommand::Records(start, limit, reply) => {
                let records = self.session.records();
                let start = start.min(records.len());
                let end = start.saturating_add(limit).min(records.len());
                let _ = reply.send(Ok(RecordPage {
                    total: records.len(),
                    start,
                    records: records[start..end].to_vec(),
                }));
            }
            SessionCommand::Finalize(reply) => {
                let result = match self.session.finalized() {
                    Some(log) if self.submitted => Ok(FinalizeReport::new(
                        self.session.session_id(),
                        log,
                        self.submission.clone(),
                    )),
                    _ => Err(RuntimeError::StillRunning),
                };
                let _ = reply.send(result);
            }
        }
    }

    fn publish_notices(&mut self) {
        let at_ms = self.session.now_ms();
        for notice in self.session.drain_notices() {
            let envelope = NoticeEnvelope {
                session_id: self.session.session_id().to_string(),
                sequence: self.next_notice,
                at_ms,
                notice,
            };
            self.next_notice += 1;
            // No receivers is fine; presentation is optional.
            let _ = self.notices.send(envelope);
        }
    }

    async fn submit(&mut self) {
        self.submitted = true;
        let log = match self.session.finalized() {
            Some(log) => log.clone(),
            None => self.session.finalize(),
        };
        info!(
            session_id = %self.session.session_id(),
            rows = log.rows,
            end_reason = ?self.session.end_reason(),
            "session ended; log finalized"
        );

        let Some(submitter) = self.submitter.as_ref() else {
            return;
        };
        let body = match self.session.render_log() {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "failed to render log for submission");
                return;
            }
        };
        let report = submitter
            .submit(self.session.session_id(), &log.file_name, body)
            .await;
        if !report.uploaded && report.attempts > 0 {
            let detail = report
                .last_error
                .clone()
                .unwrap_or_else(|| "upload failed".to_string());
            self.session.record_upload_failure(report.attempts, &detail);
            self.session.finalize();
            if report.backup_path.is_some() {
                match self.session.render_log() {
                    Ok(body) => submitter.refresh_backup(&log.file_name, &body).await,
                    Err(err) => warn!(error = %err, "failed to render log for backup"),
                }
            }
        }
        self.submission = Some(report);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use contracts::{EndReason, ExperimentConfig, SessionStage};
    use experiment_core::{EventLog, MemoryPreferencesStore, SessionDeps, StaticLayout};

    use super::*;
    use crate::upload::{RemoteSink, SubmissionError};

    struct AcceptingSink;

    #[async_trait]
    impl RemoteSink for AcceptingSink {
        async fn submit(&self, _file_name: &str, _body: Vec<u8>) -> Result<(), SubmissionError> {
            Ok(())
        }
    }

    struct RejectingSink;

    #[async_trait]
    impl RemoteSink for RejectingSink {
        async fn submit(&self, _file_name: &str, _body: Vec<u8>) -> Result<(), SubmissionError> {
            Err(SubmissionError::Rejected { status: 503 })
        }
    }

    fn session(intro_screens: u32) -> Session {
        let mut config = ExperimentConfig::default();
        config.participant.participant_id = "RT01".to_string();
        config.intro_screens = intro_screens;
        let started_at = Utc
            .with_ymd_and_hms(2026, 3, 4, 10, 0, 0)
            .single()
            .expect("time");
        Session::new(
            config,
            SessionDeps {
                layout: Box::new(StaticLayout::default_room()),
                store: Box::new(MemoryPreferencesStore::new()),
                log: EventLog::in_memory("RT01_20260304_100000.csv", started_at),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn notices_reach_subscribers_in_order() {
        let handle = SessionHandle::spawn(session(2), None);
        let mut notices = handle.subscribe();

        let status = handle.start().await.expect("start");
        assert_eq!(status.stage, SessionStage::Intro);
        handle.input(InputKind::Continue).await.expect("continue");

        let first = notices.recv().await.expect("first notice");
        let second = notices.recv().await.expect("second notice");
        assert!(first.sequence < second.sequence);
        assert_eq!(first.session_id, "RT01_20260304_100000");
    }

    #[tokio::test(start_paused = true)]
    async fn engine_timers_fire_on_the_runtime_clock() {
        let handle = SessionHandle::spawn(session(1), None);
        handle.start().await.expect("start");
        handle.input(InputKind::Continue).await.expect("intro");
        handle.input(InputKind::Continue).await.expect("instructions");

        let status = handle.status().await.expect("status");
        assert_eq!(status.stage, SessionStage::CalibrationPhase);

        let phase = ExperimentConfig::default().calibration.phase_secs;
        tokio::time::sleep(Duration::from_secs_f64(phase + 0.5)).await;
        let status = handle.status().await.expect("status");
        assert_ne!(status.stage, SessionStage::CalibrationPhase);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_finalizes_and_submits_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let submitter = LogSubmitter::new(Arc::new(AcceptingSink), dir.path());
        let handle = SessionHandle::spawn(session(1), Some(submitter));
        handle.start().await.expect("start");

        assert!(matches!(
            handle.finalize().await,
            Err(RuntimeError::StillRunning)
        ));

        let aborted = handle.abort("operator stop").await.expect("abort");
        assert_eq!(aborted.file_name, "RT01_20260304_100000.csv");

        let report = handle.finalize().await.expect("finalize");
        let submission = report.submission.expect("submission");
        assert!(submission.uploaded);
        assert!(dir.path().join("RT01_20260304_100000.csv").exists());

        let status = handle.status().await.expect("status");
        assert_eq!(status.end_reason, Some(EndReason::Aborted));
        assert!(matches!(
            handle.input(InputKind::Continue).await,
            Err(RuntimeError::Session(SessionError::Ended(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_is_logged_and_kept_in_the_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let submitter = LogSubmitter::new(Arc::new(RejectingSink), dir.path())
            .with_retry(2, Duration::from_millis(10));
        let handle = SessionHandle::spawn(session(1), Some(submitter));
        handle.start().await.expect("start");
        handle.abort("operator stop").await.expect("abort");

        let report = handle.finalize().await.expect("finalize");
        let submission = report.submission.expect("submission");
        assert!(!submission.uploaded);
        assert_eq!(submission.attempts, 2);

        let page = handle.records(0, 1_000).await.expect("records");
        let failure = page
            .records
            .iter()
            .find(|record| record.event_type.as_deref() == Some("UploadFailure"))
            .expect("upload failure row");
        assert_eq!(failure.error_kind.as_deref(), Some("UploadFailure"));
        assert_eq!(failure.retry_count.as_deref(), Some("2"));
        assert_eq!(report.rows, page.total);

        let backup = std::fs::read_to_string(dir.path().join("RT01_20260304_100000.csv"))
            .expect("backup");
        assert!(backup.contains("UploadFailure"));
    }

    #[tokio::test(start_paused = true)]
    async fn redelivery_without_a_signal_is_rejected() {
        let handle = SessionHandle::spawn(session(1), None);
        handle.start().await.expect("start");
        assert!(matches!(
            handle.deliver_outcome(None).await,
            Err(RuntimeError::NoSignal)
        ));
    }
}
