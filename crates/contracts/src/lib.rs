//! v1 cross-boundary contracts for the experiment engine, runtime, persisted log, and presentation subscribers.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod event_record;
pub mod notice;
pub mod serde_u64_string;

pub use config::{
    CalibrationConfig, CheckQuestion, ConfigError, DecisionConfig, ExperimentConfig, FormalConfig,
    LayoutConfig, LogConfig, MovementConfig, ParticipantInfo, PracticeConfig, secs_to_ms,
};
pub use event_record::{
    cell, flag_cell, seconds_cell, EventKind, EventRecord, EVENT_COLUMNS, PLACEHOLDER,
};
pub use notice::{EndReason, SessionNotice, SessionStage, SessionStatus};

pub const SCHEMA_VERSION_V1: &str = "1.0";
pub const EFFORT_LEVEL_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(try_from = "u8", into = "u8")]
pub enum EffortLevel {
    One,
    Two,
    Three,
}

impl EffortLevel {
    pub const ALL: [EffortLevel; EFFORT_LEVEL_COUNT] =
        [EffortLevel::One, EffortLevel::Two, EffortLevel::Three];

    pub fn as_u8(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
        }
    }

    /// Zero-based position in per-level tables.
    pub fn index(self) -> usize {
        usize::from(self.as_u8() - 1)
    }
}

impl TryFrom<u8> for EffortLevel {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            other => Err(format!("effort level must be 1, 2 or 3 (got {other})")),
        }
    }
}

impl From<EffortLevel> for u8 {
    fn from(value: EffortLevel) -> Self {
        value.as_u8()
    }
}

impl fmt::Display for EffortLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Calibrated presses required per movement step, indexed by effort level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PressesPerLevel(pub [u32; EFFORT_LEVEL_COUNT]);

impl PressesPerLevel {
    pub fn for_level(&self, level: EffortLevel) -> u32 {
        self.0[level.index()]
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn manhattan(self, other: GridPos) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }

    pub fn step(self, direction: Direction) -> GridPos {
        let (dx, dy) = direction.delta();
        GridPos::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for GridPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.y)
    }
}

/// Row 0 is the top of the layout, so `Up` decreases `y`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    pub const ALL: [Direction; 4] = [
        Direction::Up,
        Direction::Down,
        Direction::Left,
        Direction::Right,
    ];

    pub fn delta(self) -> (i32, i32) {
        match self {
            Self::Up => (0, -1),
            Self::Down => (0, 1),
            Self::Left => (-1, 0),
            Self::Right => (1, 0),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Left => "left",
            Self::Right => "right",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Practice,
    HighDemand,
    Balanced,
    LowDemand,
}

impl BlockType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Practice => "practice",
            Self::HighDemand => "high_demand",
            Self::Balanced => "balanced",
            Self::LowDemand => "low_demand",
        }
    }
}

/// Per-unit trial counts for each effort level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatioPolicy {
    pub level_1: u32,
    pub level_2: u32,
    pub level_3: u32,
}

impl RatioPolicy {
    pub const fn new(level_3: u32, level_2: u32, level_1: u32) -> Self {
        Self {
            level_1,
            level_2,
            level_3,
        }
    }

    pub fn count_for(&self, level: EffortLevel) -> u32 {
        match level {
            EffortLevel::One => self.level_1,
            EffortLevel::Two => self.level_2,
            EffortLevel::Three => self.level_3,
        }
    }

    pub fn unit_size(&self) -> u32 {
        self.level_1 + self.level_2 + self.level_3
    }

    /// Rendered as `level3:level2:level1`.
    pub fn label(&self) -> String {
        format!("{}:{}:{}", self.level_3, self.level_2, self.level_1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSpec {
    pub block_type: BlockType,
    pub ratio: RatioPolicy,
    pub repetitions: u32,
}

impl BlockSpec {
    pub fn trial_count(&self) -> u32 {
        self.ratio.unit_size() * self.repetitions
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Trial {
    /// Position in the whole sequence (practice attempt or formal run).
    pub trial_index: usize,
    pub block_index: usize,
    pub block_type: BlockType,
    pub trial_in_block: usize,
    pub effort_level: EffortLevel,
    pub required_presses: u32,
    pub start_position: GridPos,
    pub goal_position: GridPos,
    pub goal_distance: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub block_index: usize,
    pub block_type: BlockType,
    pub ratio: RatioPolicy,
    pub trials: Vec<Trial>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Work,
    Skip,
    Timeout,
}

impl DecisionType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Work => "Work",
            Self::Skip => "Skip",
            Self::Timeout => "Timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionRecord {
    pub trial_index: usize,
    pub decision_type: DecisionType,
    pub reaction_time_seconds: Option<f64>,
    pub transaction_token: Option<TransactionToken>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeType {
    Success,
    Failure,
    Skip,
    Timeout,
}

impl OutcomeType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Failure => "Failure",
            Self::Skip => "Skip",
            Self::Timeout => "Timeout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrialOutcome {
    pub trial_index: usize,
    pub outcome_type: OutcomeType,
    pub reward_collected: bool,
    pub reward_points: u32,
    pub movement_duration_seconds: f64,
    pub button_presses: u32,
    pub time_per_press_seconds: Option<f64>,
    pub is_rushing: bool,
}

impl TrialOutcome {
    /// Outcome for trials that never entered the movement task.
    pub fn without_movement(trial_index: usize, outcome_type: OutcomeType) -> Self {
        Self {
            trial_index,
            outcome_type,
            reward_collected: false,
            reward_points: 0,
            movement_duration_seconds: 0.0,
            button_presses: 0,
            time_per_press_seconds: None,
            is_rushing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TransactionToken(String);

impl TransactionToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransactionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MovementEndCause {
    CountdownExpired,
    ForcedEnd,
}

impl MovementEndCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CountdownExpired => "countdown_expired",
            Self::ForcedEnd => "forced_end",
        }
    }
}

/// Work-outcome signal carried across the movement/orchestrator boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeSignal {
    pub token: TransactionToken,
    pub trial_index: usize,
    pub cause: MovementEndCause,
    pub outcome: TrialOutcome,
}

/// Qualifying inputs from the external input event source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputKind {
    Press,
    Work,
    Skip,
    Move { direction: Direction },
    Continue,
    Answer { question_index: usize, choice: u8 },
}

impl InputKind {
    pub fn label(&self) -> String {
        match self {
            Self::Press => "press".to_string(),
            Self::Work => "work".to_string(),
            Self::Skip => "skip".to_string(),
            Self::Move { direction } => format!("move_{}", direction.as_str()),
            Self::Continue => "continue".to_string(),
            Self::Answer {
                question_index,
                choice,
            } => format!("answer_{question_index}_{choice}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SessionNotFound,
    SessionStateConflict,
    InvalidInput,
    InvalidConfig,
    ContractVersionUnsupported,
    UploadFailed,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}

/// Builds the stem shared by the log file name and the session id.
pub fn session_stem(participant_id: &str, started_at_compact: &str) -> String {
    let cleaned = participant_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    format!("{cleaned}_{started_at_compact}")
}

pub fn read_config_file(path: impl AsRef<Path>) -> Result<ExperimentConfig, ConfigError> {
    let raw = std::fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
        path: path.as_ref().display().to_string(),
        source,
    })?;
    let config = ExperimentConfig::from_json_str(&raw)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effort_level_serializes_as_number() {
        let encoded = serde_json::to_string(&EffortLevel::Three).expect("serialize");
        assert_eq!(encoded, "3");
        let decoded: EffortLevel = serde_json::from_str("2").expect("deserialize");
        assert_eq!(decoded, EffortLevel::Two);
        assert!(serde_json::from_str::<EffortLevel>("4").is_err());
    }

    #[test]
    fn ratio_label_lists_highest_level_first() {
        let ratio = RatioPolicy::new(3, 2, 1);
        assert_eq!(ratio.label(), "3:2:1");
        assert_eq!(ratio.count_for(EffortLevel::Three), 3);
        assert_eq!(ratio.count_for(EffortLevel::One), 1);
        assert_eq!(ratio.unit_size(), 6);
    }

    #[test]
    fn input_kind_uses_tagged_json() {
        let input: InputKind =
            serde_json::from_str(r#"{"type":"move","direction":"left"}"#).expect("move input");
        assert_eq!(
            input,
            InputKind::Move {
                direction: Direction::Left
            }
        );
        assert_eq!(input.label(), "move_left");
    }

    #[test]
    fn session_stem_sanitizes_participant_id() {
        assert_eq!(session_stem("P 01/a", "20260101_120000"), "P_01_a_20260101_120000");
    }

    #[test]
    fn manhattan_distance_is_symmetric() {
        let a = GridPos::new(2, 7);
        let b = GridPos::new(5, 3);
        assert_eq!(a.manhattan(b), 7);
        assert_eq!(b.manhattan(a), 7);
        assert_eq!(a.step(Direction::Up), GridPos::new(2, 6));
    }
}
