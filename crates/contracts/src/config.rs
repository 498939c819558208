//! Session configuration loaded from JSON, with defaults matching the standard protocol.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{serde_u64_string, BlockSpec, BlockType, RatioPolicy, EFFORT_LEVEL_COUNT, SCHEMA_VERSION_V1};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported schema_version {got} (expected {expected})")]
    SchemaVersion { got: String, expected: String },
    #[error("invalid config field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub participant_id: String,
    #[serde(default)]
    pub age: Option<u32>,
    #[serde(default)]
    pub gender: Option<String>,
}

impl Default for ParticipantInfo {
    fn default() -> Self {
        Self {
            participant_id: "P000".to_string(),
            age: None,
            gender: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LayoutConfig {
    /// Character rows; empty means the built-in 18x10 room.
    pub rows: Vec<String>,
    pub path: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub floor_symbol: char,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            path: None,
            width: None,
            height: None,
            floor_symbol: '.',
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CalibrationConfig {
    pub phase_count: u32,
    pub phase_secs: f64,
    pub break_secs: f64,
    pub level_fractions: [f64; EFFORT_LEVEL_COUNT],
    pub minimum_presses: [u32; EFFORT_LEVEL_COUNT],
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            phase_count: 3,
            phase_secs: 5.0,
            break_secs: 10.0,
            level_fractions: [0.3, 0.6, 0.9],
            minimum_presses: [1, 2, 3],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DecisionConfig {
    pub formal_window_secs: f64,
    pub practice_window_secs: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            formal_window_secs: 2.5,
            practice_window_secs: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MovementConfig {
    pub countdown_secs: f64,
    pub goal_distance: u32,
    pub rushing_threshold_secs: f64,
    pub reward_points: u32,
}

impl Default for MovementConfig {
    fn default() -> Self {
        Self {
            countdown_secs: 10.0,
            goal_distance: 5,
            rushing_threshold_secs: 0.1,
            reward_points: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckQuestion {
    pub question_id: String,
    pub correct_choice: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PracticeConfig {
    pub block: BlockSpec,
    pub questions: Vec<CheckQuestion>,
    pub pass_score: u32,
    pub max_attempts: u32,
}

impl Default for PracticeConfig {
    fn default() -> Self {
        Self {
            block: BlockSpec {
                block_type: BlockType::Practice,
                ratio: RatioPolicy::new(2, 2, 2),
                repetitions: 2,
            },
            questions: vec![
                CheckQuestion {
                    question_id: "work_key".to_string(),
                    correct_choice: 1,
                },
                CheckQuestion {
                    question_id: "skip_reward".to_string(),
                    correct_choice: 2,
                },
                CheckQuestion {
                    question_id: "effort_meaning".to_string(),
                    correct_choice: 3,
                },
                CheckQuestion {
                    question_id: "full_duration".to_string(),
                    correct_choice: 1,
                },
            ],
            pass_score: 14,
            max_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FormalConfig {
    pub blocks: Vec<BlockSpec>,
    pub rest_secs: f64,
}

impl Default for FormalConfig {
    fn default() -> Self {
        Self {
            blocks: vec![
                BlockSpec {
                    block_type: BlockType::HighDemand,
                    ratio: RatioPolicy::new(3, 2, 1),
                    repetitions: 3,
                },
                BlockSpec {
                    block_type: BlockType::Balanced,
                    ratio: RatioPolicy::new(2, 2, 2),
                    repetitions: 3,
                },
                BlockSpec {
                    block_type: BlockType::LowDemand,
                    ratio: RatioPolicy::new(1, 2, 3),
                    repetitions: 3,
                },
            ],
            rest_secs: 30.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub dir: String,
    pub backup_dir: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            backup_dir: "logs/backup".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExperimentConfig {
    pub schema_version: String,
    #[serde(default)]
    pub participant: ParticipantInfo,
    #[serde(with = "serde_u64_string")]
    pub seed: u64,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default = "default_intro_screens")]
    pub intro_screens: u32,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub movement: MovementConfig,
    #[serde(default)]
    pub practice: PracticeConfig,
    #[serde(default)]
    pub formal: FormalConfig,
    #[serde(default = "default_feedback_secs")]
    pub feedback_secs: f64,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_resume")]
    pub resume: bool,
    #[serde(default)]
    pub log: LogConfig,
    pub notes: Option<String>,
}

fn default_intro_screens() -> u32 {
    3
}

fn default_feedback_secs() -> f64 {
    1.5
}

fn default_settle_ms() -> u64 {
    300
}

fn default_resume() -> bool {
    true
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            participant: ParticipantInfo::default(),
            seed: 1337,
            layout: LayoutConfig::default(),
            intro_screens: default_intro_screens(),
            calibration: CalibrationConfig::default(),
            decision: DecisionConfig::default(),
            movement: MovementConfig::default(),
            practice: PracticeConfig::default(),
            formal: FormalConfig::default(),
            feedback_secs: default_feedback_secs(),
            settle_ms: default_settle_ms(),
            resume: default_resume(),
            log: LogConfig::default(),
            notes: None,
        }
    }
}

impl ExperimentConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schema_version != SCHEMA_VERSION_V1 {
            return Err(ConfigError::SchemaVersion {
                got: self.schema_version.clone(),
                expected: SCHEMA_VERSION_V1.to_string(),
            });
        }
        if self.participant.participant_id.trim().is_empty() {
            return Err(ConfigError::invalid(
                "participant.participant_id",
                "must not be empty",
            ));
        }
        if self.calibration.phase_count == 0 {
            return Err(ConfigError::invalid("calibration.phase_count", "must be >= 1"));
        }
        if !(self.calibration.phase_secs > 0.0) {
            return Err(ConfigError::invalid("calibration.phase_secs", "must be > 0"));
        }
        if self.calibration.minimum_presses.iter().any(|minimum| *minimum == 0) {
            return Err(ConfigError::invalid(
                "calibration.minimum_presses",
                "every minimum must be >= 1",
            ));
        }
        if !(self.decision.formal_window_secs > 0.0) || !(self.decision.practice_window_secs > 0.0)
        {
            return Err(ConfigError::invalid("decision", "response windows must be > 0"));
        }
        if !(self.movement.countdown_secs > 0.0) {
            return Err(ConfigError::invalid("movement.countdown_secs", "must be > 0"));
        }
        if self.movement.goal_distance == 0 {
            return Err(ConfigError::invalid("movement.goal_distance", "must be >= 1"));
        }
        if self.practice.block.trial_count() == 0 {
            return Err(ConfigError::invalid("practice.block", "must contain trials"));
        }
        if self.practice.max_attempts == 0 {
            return Err(ConfigError::invalid("practice.max_attempts", "must be >= 1"));
        }
        if self.formal.blocks.is_empty() {
            return Err(ConfigError::invalid("formal.blocks", "must not be empty"));
        }
        if let Some(empty) = self
            .formal
            .blocks
            .iter()
            .position(|block| block.trial_count() == 0)
        {
            return Err(ConfigError::invalid(
                "formal.blocks",
                format!("block {empty} has no trials"),
            ));
        }
        if self.formal.rest_secs < 0.0 || self.feedback_secs < 0.0 {
            return Err(ConfigError::invalid("durations", "must be >= 0"));
        }
        Ok(())
    }

    pub fn formal_trial_count(&self) -> u32 {
        self.formal.blocks.iter().map(BlockSpec::trial_count).sum()
    }
}

/// Converts configured seconds to whole milliseconds on the session clock.
pub fn secs_to_ms(secs: f64) -> u64 {
    if secs <= 0.0 {
        return 0;
    }
    (secs * 1000.0).round() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ExperimentConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.formal_trial_count(), 54);
        assert_eq!(config.practice.block.trial_count(), 12);
    }

    #[test]
    fn minimal_json_fills_defaults() {
        let config = ExperimentConfig::from_json_str(
            r#"{"schema_version":"1.0","seed":"42","notes":null,"participant":{"participant_id":"P7"}}"#,
        )
        .expect("minimal config");
        assert_eq!(config.seed, 42);
        assert_eq!(config.participant.participant_id, "P7");
        assert_eq!(config.calibration.phase_count, 3);
        assert_eq!(config.decision.formal_window_secs, 2.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_empty_formal_run() {
        let mut config = ExperimentConfig::default();
        config.formal.blocks.clear();
        let err = config.validate().expect_err("empty formal blocks");
        assert!(err.to_string().contains("formal.blocks"));
    }

    #[test]
    fn validate_rejects_schema_mismatch() {
        let mut config = ExperimentConfig::default();
        config.schema_version = "0.9".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SchemaVersion { .. })
        ));
    }

    #[test]
    fn secs_to_ms_rounds_to_nearest_millisecond() {
        assert_eq!(secs_to_ms(2.5), 2500);
        assert_eq!(secs_to_ms(0.0004), 0);
        assert_eq!(secs_to_ms(-1.0), 0);
    }
}
