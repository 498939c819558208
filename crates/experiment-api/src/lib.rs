//! Async runtime around the experiment engine: per-session actors, SQLite
//! preferences, log submission, and the HTTP/WebSocket surface.

mod persistence;
mod runtime;
mod server;
mod upload;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use contracts::{ConfigError, ExperimentConfig};
use experiment_core::{
    layout_source_from_config, log_file_name, EventLog, EventLogError, MemoryPreferencesStore,
    PreferencesStore, Session, SessionDeps,
};
use thiserror::Error;
use tracing::warn;

pub use persistence::{PersistenceError, SqlitePreferencesStore, SubmissionRecord};
pub use runtime::{FinalizeReport, NoticeEnvelope, RecordPage, RuntimeError, SessionHandle};
pub use server::{router, serve, ServerError};
pub use upload::{
    HttpRemoteSink, LogSubmitter, RemoteSink, SubmissionError, SubmissionReport,
    DEFAULT_UPLOAD_ATTEMPTS,
};

pub const ENV_LOG_DIR: &str = "EFFORT_LOG_DIR";
pub const ENV_SQLITE_PATH: &str = "EFFORT_SQLITE_PATH";
pub const ENV_UPLOAD_URL: &str = "EFFORT_UPLOAD_URL";

/// Where a session's files go and where its log is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSettings {
    pub log_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub sqlite_path: Option<PathBuf>,
    pub upload_url: Option<String>,
}

impl RuntimeSettings {
    /// Reads the config's log section, then applies environment overrides.
    pub fn from_config(config: &ExperimentConfig) -> Self {
        let mut settings = Self {
            log_dir: PathBuf::from(&config.log.dir),
            backup_dir: PathBuf::from(&config.log.backup_dir),
            sqlite_path: None,
            upload_url: None,
        };
        if let Some(dir) = env_value(ENV_LOG_DIR) {
            settings.log_dir = PathBuf::from(dir);
            settings.backup_dir = settings.log_dir.join("backup");
        }
        settings.sqlite_path = env_value(ENV_SQLITE_PATH).map(PathBuf::from);
        settings.upload_url = env_value(ENV_UPLOAD_URL);
        settings
    }

    pub fn submitter(&self) -> LogSubmitter {
        let submitter = match self.upload_url.as_ref() {
            Some(url) => LogSubmitter::new(Arc::new(HttpRemoteSink::new(url.clone())), &self.backup_dir),
            None => LogSubmitter::backup_only(&self.backup_dir),
        };
        match self.sqlite_path.as_ref() {
            Some(path) => submitter.with_ledger(path),
            None => submitter,
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Error)]
pub enum OpenSessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Log(#[from] EventLogError),
}

/// The id [`open_session`] will give a session started at `started_at`.
pub fn session_id_for(participant_id: &str, started_at: DateTime<Utc>) -> String {
    log_file_name(participant_id, started_at)
        .trim_end_matches(".csv")
        .to_string()
}

/// Validates the config and wires a session to its log file and store. Only
/// a log file that cannot be created is fatal; an unusable SQLite store falls
/// back to process memory.
pub fn open_session(
    config: ExperimentConfig,
    settings: &RuntimeSettings,
    started_at: DateTime<Utc>,
) -> Result<Session, OpenSessionError> {
    config.validate()?;
    let log = EventLog::open(
        &settings.log_dir,
        &config.participant.participant_id,
        started_at,
    )?;
    let store = open_store(settings.sqlite_path.as_deref());
    let layout = layout_source_from_config(&config.layout);
    Ok(Session::new(config, SessionDeps { layout, store, log }))
}

fn open_store(path: Option<&Path>) -> Box<dyn PreferencesStore> {
    let Some(path) = path else {
        return Box::new(MemoryPreferencesStore::new());
    };
    match SqlitePreferencesStore::open(path) {
        Ok(store) => Box::new(store),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "sqlite preferences unavailable; progress will not survive a restart"
            );
            Box::new(MemoryPreferencesStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use contracts::InputKind;
    use experiment_core::{load_session_state, InputDisposition};

    fn settings(dir: &Path) -> RuntimeSettings {
        RuntimeSettings {
            log_dir: dir.join("logs"),
            backup_dir: dir.join("logs/backup"),
            sqlite_path: Some(dir.join("prefs.sqlite")),
            upload_url: None,
        }
    }

    fn started_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 6, 7, 8, 9)
            .single()
            .expect("time")
    }

    #[test]
    fn open_session_creates_the_log_file_up_front() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ExperimentConfig::default();
        config.participant.participant_id = "P77".to_string();

        let session = open_session(config, &settings(dir.path()), started_at()).expect("open");
        assert_eq!(session.session_id(), "P77_20260506_070809");
        assert_eq!(session_id_for("P77", started_at()), session.session_id());
        assert!(dir.path().join("logs/P77_20260506_070809.csv").exists());
    }

    #[test]
    fn invalid_config_is_rejected_before_any_file_is_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = ExperimentConfig::default();
        config.formal.blocks.clear();

        let err = open_session(config, &settings(dir.path()), started_at()).expect_err("invalid");
        assert!(matches!(err, OpenSessionError::Config(_)));
        assert!(!dir.path().join("logs").exists());
    }

    #[test]
    fn calibration_survives_a_restart_through_sqlite() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = settings(dir.path());
        let mut config = ExperimentConfig::default();
        config.participant.participant_id = "P78".to_string();
        config.intro_screens = 1;
        config.calibration.phase_count = 1;

        let mut session = open_session(config.clone(), &settings, started_at()).expect("open");
        session.start(0).expect("start");
        session.handle_input(10, InputKind::Continue).expect("intro");
        session
            .handle_input(20, InputKind::Continue)
            .expect("calibration instructions");
        for tap in 0..30_u64 {
            assert_eq!(
                session.handle_input(100 + tap * 100, InputKind::Press),
                Ok(InputDisposition::Accepted)
            );
        }
        session.advance_to(20_000);
        let calibrated = session.presses_per_level().expect("calibrated");
        drop(session);

        let store = SqlitePreferencesStore::open(settings.sqlite_path.as_ref().expect("path"))
            .expect("store");
        let state = load_session_state(&store, "P78")
            .expect("load")
            .expect("state");
        assert_eq!(state.presses_per_level, Some(calibrated));
    }

    #[test]
    fn submitter_without_url_only_writes_backups() {
        let dir = tempfile::tempdir().expect("tempdir");
        let submitter = settings(dir.path()).submitter();
        assert_eq!(submitter.backup_dir(), dir.path().join("logs/backup").as_path());
    }
}
