//! Wide, fixed-column event row shared by every event kind in the session log.
//!
//! Each row carries the full column set; columns an event does not use render as
//! [`PLACEHOLDER`] so every line parses with the same layout.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const PLACEHOLDER: &str = "NA";

macro_rules! event_schema {
    ($($field:ident),+ $(,)?) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct EventRecord {
            $(pub $field: Option<String>,)+
        }

        pub const EVENT_COLUMNS: &[&str] = &[$(stringify!($field),)+];

        impl EventRecord {
            pub fn to_row(&self) -> Vec<&str> {
                vec![$(self.$field.as_deref().unwrap_or(PLACEHOLDER),)+]
            }

            /// Looks up a column by header name; `None` for unset or unknown columns.
            pub fn get(&self, column: &str) -> Option<&str> {
                $(
                    if column == stringify!($field) {
                        return self.$field.as_deref();
                    }
                )+
                None
            }
        }
    };
}

event_schema!(
    timestamp,
    elapsed_ms,
    log_sequence,
    event_type,
    session_id,
    participant_id,
    participant_age,
    participant_gender,
    session_stage,
    is_practice,
    practice_attempt,
    block_index,
    block_type,
    block_ratio,
    block_order,
    block_position,
    trial_index,
    trial_in_block,
    effort_level,
    required_presses,
    start_x,
    start_y,
    goal_x,
    goal_y,
    goal_distance_requested,
    goal_distance_actual,
    placement_quality,
    player_x,
    player_y,
    input_label,
    step_direction,
    step_result,
    steps_taken,
    button_presses,
    press_in_step,
    decision_type,
    reaction_time_s,
    response_window_s,
    transaction_token,
    outcome_type,
    reward_collected,
    reward_points,
    movement_duration_s,
    countdown_s,
    time_per_press_s,
    is_rushing,
    end_cause,
    total_score,
    block_score,
    practice_score,
    comprehension_score,
    combined_score,
    pass_score,
    gate_passed,
    calibration_phase,
    calibration_presses,
    calibration_phase_s,
    calibration_max_presses,
    calibration_max_rate,
    presses_level_1,
    presses_level_2,
    presses_level_3,
    question_index,
    question_id,
    answer_given,
    answer_correct,
    feedback,
    rest_duration_s,
    error_kind,
    error_detail,
    retry_count,
    end_reason,
);

impl EventRecord {
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_type: Some(kind.as_str().to_string()),
            ..Self::default()
        }
    }

    pub fn kind(&self) -> Option<EventKind> {
        self.event_type.as_deref().and_then(EventKind::parse)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStarted,
    BlockOrderFixed,
    StageEntered,
    InstructionAdvanced,
    CalibrationPhaseStarted,
    CalibrationPress,
    CalibrationPhaseEnded,
    CalibrationCompleted,
    BlockStarted,
    TrialStarted,
    DecisionPresented,
    DecisionMade,
    DecisionTimeout,
    MovementStarted,
    ButtonPress,
    StepTaken,
    StepBlocked,
    GoalCollected,
    MovementEnded,
    TrialOutcome,
    FeedbackShown,
    BlockEnded,
    RestBreakStarted,
    RestBreakEnded,
    CheckQuestionAnswered,
    PracticeGateEvaluated,
    PlacementDegraded,
    DuplicateOutcome,
    ProtocolViolation,
    MissingCollaborator,
    TrialAborted,
    StoreFailure,
    LogWriteFailure,
    LogWriteRecovered,
    UploadFailure,
    SessionResumed,
    SessionEnded,
}

impl EventKind {
    pub const ALL: [EventKind; 37] = [
        EventKind::SessionStarted,
        EventKind::BlockOrderFixed,
        EventKind::StageEntered,
        EventKind::InstructionAdvanced,
        EventKind::CalibrationPhaseStarted,
        EventKind::CalibrationPress,
        EventKind::CalibrationPhaseEnded,
        EventKind::CalibrationCompleted,
        EventKind::BlockStarted,
        EventKind::TrialStarted,
        EventKind::DecisionPresented,
        EventKind::DecisionMade,
        EventKind::DecisionTimeout,
        EventKind::MovementStarted,
        EventKind::ButtonPress,
        EventKind::StepTaken,
        EventKind::StepBlocked,
        EventKind::GoalCollected,
        EventKind::MovementEnded,
        EventKind::TrialOutcome,
        EventKind::FeedbackShown,
        EventKind::BlockEnded,
        EventKind::RestBreakStarted,
        EventKind::RestBreakEnded,
        EventKind::CheckQuestionAnswered,
        EventKind::PracticeGateEvaluated,
        EventKind::PlacementDegraded,
        EventKind::DuplicateOutcome,
        EventKind::ProtocolViolation,
        EventKind::MissingCollaborator,
        EventKind::TrialAborted,
        EventKind::StoreFailure,
        EventKind::LogWriteFailure,
        EventKind::LogWriteRecovered,
        EventKind::UploadFailure,
        EventKind::SessionResumed,
        EventKind::SessionEnded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "SessionStarted",
            Self::BlockOrderFixed => "BlockOrderFixed",
            Self::StageEntered => "StageEntered",
            Self::InstructionAdvanced => "InstructionAdvanced",
            Self::CalibrationPhaseStarted => "CalibrationPhaseStarted",
            Self::CalibrationPress => "CalibrationPress",
            Self::CalibrationPhaseEnded => "CalibrationPhaseEnded",
            Self::CalibrationCompleted => "CalibrationCompleted",
            Self::BlockStarted => "BlockStarted",
            Self::TrialStarted => "TrialStarted",
            Self::DecisionPresented => "DecisionPresented",
            Self::DecisionMade => "DecisionMade",
            Self::DecisionTimeout => "DecisionTimeout",
            Self::MovementStarted => "MovementStarted",
            Self::ButtonPress => "ButtonPress",
            Self::StepTaken => "StepTaken",
            Self::StepBlocked => "StepBlocked",
            Self::GoalCollected => "GoalCollected",
            Self::MovementEnded => "MovementEnded",
            Self::TrialOutcome => "TrialOutcome",
            Self::FeedbackShown => "FeedbackShown",
            Self::BlockEnded => "BlockEnded",
            Self::RestBreakStarted => "RestBreakStarted",
            Self::RestBreakEnded => "RestBreakEnded",
            Self::CheckQuestionAnswered => "CheckQuestionAnswered",
            Self::PracticeGateEvaluated => "PracticeGateEvaluated",
            Self::PlacementDegraded => "PlacementDegraded",
            Self::DuplicateOutcome => "DuplicateOutcome",
            Self::ProtocolViolation => "ProtocolViolation",
            Self::MissingCollaborator => "MissingCollaborator",
            Self::TrialAborted => "TrialAborted",
            Self::StoreFailure => "StoreFailure",
            Self::LogWriteFailure => "LogWriteFailure",
            Self::LogWriteRecovered => "LogWriteRecovered",
            Self::UploadFailure => "UploadFailure",
            Self::SessionResumed => "SessionResumed",
            Self::SessionEnded => "SessionEnded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == raw)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn cell(value: impl ToString) -> Option<String> {
    Some(value.to_string())
}

pub fn seconds_cell(secs: f64) -> Option<String> {
    Some(format!("{secs:.3}"))
}

pub fn flag_cell(value: bool) -> Option<String> {
    Some(if value { "1" } else { "0" }.to_string())
}
