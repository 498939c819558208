//! Transition notices published to presentation subscribers, and the status view.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DecisionType, EffortLevel, GridPos, PressesPerLevel, TrialOutcome};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    NotStarted,
    Intro,
    CalibrationInstructions,
    CalibrationPhase,
    CalibrationBreak,
    PracticeInstructions,
    Decision,
    Movement,
    Settling,
    Feedback,
    CheckQuestions,
    RestBreak,
    Ended,
}

impl SessionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Intro => "intro",
            Self::CalibrationInstructions => "calibration_instructions",
            Self::CalibrationPhase => "calibration_phase",
            Self::CalibrationBreak => "calibration_break",
            Self::PracticeInstructions => "practice_instructions",
            Self::Decision => "decision",
            Self::Movement => "movement",
            Self::Settling => "settling",
            Self::Feedback => "feedback",
            Self::CheckQuestions => "check_questions",
            Self::RestBreak => "rest_break",
            Self::Ended => "ended",
        }
    }
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    FailedPractice,
    Aborted,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::FailedPractice => "failed_practice",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotice {
    StageEntered {
        stage: SessionStage,
        at_ms: u64,
    },
    IntroScreen {
        screen: u32,
        of: u32,
    },
    CalibrationPhaseStarted {
        phase: u32,
        duration_ms: u64,
    },
    CalibrationBreakStarted {
        next_phase: u32,
        duration_ms: u64,
    },
    CalibrationCompleted {
        presses_per_level: PressesPerLevel,
    },
    DecisionPresented {
        trial_index: usize,
        effort_level: EffortLevel,
        response_window_ms: u64,
    },
    DecisionResolved {
        trial_index: usize,
        decision_type: DecisionType,
    },
    MovementStarted {
        trial_index: usize,
        start: GridPos,
        goal: GridPos,
        presses_per_step: u32,
        countdown_ms: u64,
    },
    PlayerMoved {
        position: GridPos,
    },
    GoalCollected {
        trial_index: usize,
    },
    TrialCompleted {
        outcome: TrialOutcome,
    },
    CheckQuestion {
        question_index: usize,
        question_id: String,
    },
    PracticeGate {
        attempt: u32,
        combined_score: u32,
        passed: bool,
    },
    RestBreakStarted {
        next_block: usize,
        duration_ms: u64,
    },
    Warning {
        message: String,
    },
    SessionEnded {
        reason: EndReason,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStatus {
    pub schema_version: String,
    pub session_id: String,
    pub participant_id: String,
    pub stage: SessionStage,
    pub practice_attempt: u32,
    pub block_position: Option<usize>,
    pub current_trial_index: Option<usize>,
    pub trials_completed: usize,
    pub total_score: u32,
    pub presses_per_level: Option<PressesPerLevel>,
    pub end_reason: Option<EndReason>,
    pub buffered_log_rows: usize,
}

impl SessionStatus {
    pub fn is_ended(&self) -> bool {
        self.end_reason.is_some()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session_id={} stage={} trials_completed={} total_score={}",
            self.session_id, self.stage, self.trials_completed, self.total_score
        )?;
        if let Some(reason) = self.end_reason {
            write!(f, " end_reason={}", reason.as_str())?;
        }
        Ok(())
    }
}
