//! Preferences store: staged key/value writes that must be flushed before a
//! dependent stage transition, plus the typed session-state record kept in it.

use std::collections::BTreeMap;

use contracts::{ParticipantInfo, PressesPerLevel, TransactionToken};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("preferences backend error: {0}")]
    Backend(String),
    #[error("preferences value is not valid json: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait PreferencesStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Stages a write; it becomes durable on the next [`PreferencesStore::flush`].
    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    fn flush(&mut self) -> Result<(), StoreError>;
}

/// Process-local store. Reads see staged values.
#[derive(Debug, Clone, Default)]
pub struct MemoryPreferencesStore {
    committed: BTreeMap<String, String>,
    staged: BTreeMap<String, String>,
    failing: bool,
}

impl MemoryPreferencesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every write and flush fails while set.
    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    pub fn committed(&self, key: &str) -> Option<&str> {
        self.committed.get(key).map(String::as_str)
    }

    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

impl PreferencesStore for MemoryPreferencesStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .staged
            .get(key)
            .or_else(|| self.committed.get(key))
            .cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.failing {
            return Err(StoreError::Backend("store is read-only".to_string()));
        }
        self.staged.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if self.failing {
            return Err(StoreError::Backend("store is read-only".to_string()));
        }
        self.committed.append(&mut self.staged);
        Ok(())
    }
}

/// Cross-boundary scalars for one participant, used to resume a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub participant: ParticipantInfo,
    #[serde(default)]
    pub presses_per_level: Option<PressesPerLevel>,
    #[serde(default)]
    pub calibration_max_presses: Option<u32>,
    #[serde(default)]
    pub practice_attempts: u32,
    #[serde(default)]
    pub practice_passed: bool,
    #[serde(default)]
    pub block_order: Option<Vec<usize>>,
    /// Number of formal blocks finished, in `block_order` positions.
    #[serde(default)]
    pub completed_blocks: usize,
    #[serde(default)]
    pub total_score: u32,
    #[serde(default)]
    pub processed_tokens: Vec<TransactionToken>,
}

impl SessionState {
    pub fn for_participant(participant: ParticipantInfo) -> Self {
        Self {
            participant,
            ..Self::default()
        }
    }

    /// True when a later run has something to skip.
    pub fn has_progress(&self) -> bool {
        self.presses_per_level.is_some() || self.practice_passed || self.completed_blocks > 0
    }
}

pub fn session_state_key(participant_id: &str) -> String {
    format!("session_state/{participant_id}")
}

pub fn load_session_state(
    store: &dyn PreferencesStore,
    participant_id: &str,
) -> Result<Option<SessionState>, StoreError> {
    match store.get(&session_state_key(participant_id))? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Stages and flushes the state in one step.
pub fn save_session_state(
    store: &mut dyn PreferencesStore,
    state: &SessionState,
) -> Result<(), StoreError> {
    let encoded = serde_json::to_string(state)?;
    store.set(&session_state_key(&state.participant.participant_id), &encoded)?;
    store.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn participant(id: &str) -> ParticipantInfo {
        ParticipantInfo {
            participant_id: id.to_string(),
            age: Some(31),
            gender: None,
        }
    }

    #[test]
    fn staged_writes_commit_on_flush() {
        let mut store = MemoryPreferencesStore::new();
        store.set("a", "1").expect("set");
        assert_eq!(store.get("a").expect("get").as_deref(), Some("1"));
        assert_eq!(store.committed("a"), None);
        store.flush().expect("flush");
        assert_eq!(store.committed("a"), Some("1"));
        assert_eq!(store.staged_len(), 0);
    }

    #[test]
    fn session_state_round_trips_through_the_store() {
        let mut store = MemoryPreferencesStore::new();
        let mut state = SessionState::for_participant(participant("P9"));
        state.presses_per_level = Some(PressesPerLevel([3, 6, 9]));
        state.block_order = Some(vec![2, 0, 1]);
        state.completed_blocks = 1;
        save_session_state(&mut store, &state).expect("save");

        let loaded = load_session_state(&store, "P9")
            .expect("load")
            .expect("present");
        assert_eq!(loaded, state);
        assert!(loaded.has_progress());
        assert!(load_session_state(&store, "P10").expect("load").is_none());
    }

    #[test]
    fn failing_store_reports_backend_errors() {
        let mut store = MemoryPreferencesStore::new();
        store.set_failing(true);
        let state = SessionState::for_participant(participant("P1"));
        assert!(matches!(
            save_session_state(&mut store, &state),
            Err(StoreError::Backend(_))
        ));
    }
}
