//! Session orchestrator: the hierarchical state machine that sequences intro,
//! calibration, practice with its comprehension gate, and the formal blocks.
//!
//! The engine is synchronous and clock-injected. Every public operation takes
//! `now_ms` (milliseconds since session start); due timers fire before an input
//! at the same instant is handled. Transitions append rows to the event log and
//! queue [`SessionNotice`]s for presentation subscribers.

mod flow;
mod records;
mod trial;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;

use contracts::{
    secs_to_ms, Block, DecisionRecord, EndReason, EventKind, EventRecord, ExperimentConfig,
    InputKind, MovementEndCause, OutcomeSignal, PressesPerLevel, SessionNotice, SessionStage,
    SessionStatus, Trial, TrialOutcome, SCHEMA_VERSION_V1,
};
use rand::rngs::StdRng;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::calibration::{CalibrationService, CalibrationStep};
use crate::catalog::{block_order, TrialCatalog};
use crate::decision::{DecisionPhase, Resolution};
use crate::event_log::{EventLog, FinalizedLog};
use crate::grid::{GridTopology, LayoutSource};
use crate::movement::{
    MovementController, MovementParams, MovementState, MovementSummary, StepEffect,
};
use crate::store::{load_session_state, save_session_state, PreferencesStore, SessionState};
use crate::timer::{FiredTimer, TimerKind, TimerQueue};
use crate::transaction::{Acceptance, TransactionGuard, ViolationReason};
use crate::{seeded_rng, PRACTICE_BLOCK_INDEX};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session has not been started")]
    NotStarted,
    #[error("session was already started")]
    AlreadyStarted,
    #[error("session has ended ({0})")]
    Ended(&'static str),
}

/// Whether an input changed session state. Inputs that do not qualify in the
/// current stage are ignored without side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputDisposition {
    Accepted,
    Ignored,
}

/// Collaborators injected into a session.
pub struct SessionDeps {
    pub layout: Box<dyn LayoutSource>,
    pub store: Box<dyn PreferencesStore>,
    pub log: EventLog,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Practice,
    Formal { position: usize },
}

#[derive(Debug, Clone)]
struct ActiveBlock {
    block: Block,
    kind: BlockKind,
    cursor: usize,
    score: u32,
}

impl ActiveBlock {
    fn is_practice(&self) -> bool {
        self.kind == BlockKind::Practice
    }

    fn current(&self) -> Option<&Trial> {
        self.block.trials.get(self.cursor)
    }
}

#[derive(Debug)]
struct TrialRun {
    trial: Trial,
    decision: DecisionPhase,
    record: Option<DecisionRecord>,
    movement: Option<MovementController>,
    last_signal: Option<OutcomeSignal>,
    /// Committed outcome waiting for the orchestrator to consume it.
    outcome: Option<TrialOutcome>,
    consumed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct CheckRound {
    question_index: usize,
    correct: u32,
}

pub struct Session {
    config: ExperimentConfig,
    session_id: String,
    layout: Box<dyn LayoutSource>,
    grid: Option<GridTopology>,
    store: Box<dyn PreferencesStore>,
    log: EventLog,
    rng: StdRng,
    timers: TimerQueue,
    notices: VecDeque<SessionNotice>,
    now_ms: u64,
    stage: SessionStage,
    started: bool,
    intro_screen: u32,
    calibration: CalibrationService,
    presses: Option<PressesPerLevel>,
    practice_attempt: u32,
    practice_successes: u32,
    check: Option<CheckRound>,
    block_order: Vec<usize>,
    formal_completed: usize,
    block: Option<ActiveBlock>,
    trial: Option<TrialRun>,
    guard: TransactionGuard,
    next_trial_index: usize,
    trials_completed: usize,
    total_score: u32,
    persisted: SessionState,
    end_reason: Option<EndReason>,
    finalized: Option<FinalizedLog>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("stage", &self.stage)
            .field("now_ms", &self.now_ms)
            .finish()
    }
}

impl Session {
    pub fn new(config: ExperimentConfig, deps: SessionDeps) -> Self {
        let session_id = deps
            .log
            .file_name()
            .trim_end_matches(".csv")
            .to_string();
        let rng = seeded_rng(config.seed, &config.participant.participant_id);
        let persisted = SessionState::for_participant(config.participant.clone());
        Self {
            calibration: CalibrationService::new(config.calibration.clone()),
            session_id,
            layout: deps.layout,
            grid: None,
            store: deps.store,
            log: deps.log,
            rng,
            timers: TimerQueue::new(),
            notices: VecDeque::new(),
            now_ms: 0,
            stage: SessionStage::NotStarted,
            started: false,
            intro_screen: 0,
            presses: None,
            practice_attempt: 0,
            practice_successes: 0,
            check: None,
            block_order: Vec::new(),
            formal_completed: 0,
            block: None,
            trial: None,
            guard: TransactionGuard::new(),
            next_trial_index: 0,
            trials_completed: 0,
            total_score: 0,
            persisted,
            end_reason: None,
            finalized: None,
            config,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn stage(&self) -> SessionStage {
        self.stage
    }

    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    pub fn is_ended(&self) -> bool {
        self.end_reason.is_some()
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        self.end_reason
    }

    pub fn presses_per_level(&self) -> Option<PressesPerLevel> {
        self.presses
    }

    pub fn block_order(&self) -> &[usize] {
        &self.block_order
    }

    pub fn total_score(&self) -> u32 {
        self.total_score
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn records(&self) -> &[EventRecord] {
        self.log.records()
    }

    pub fn grid(&self) -> Option<&GridTopology> {
        self.grid.as_ref()
    }

    /// Current participant and goal cells while a movement task is running.
    pub fn movement_positions(&self) -> Option<(contracts::GridPos, contracts::GridPos)> {
        let movement = self.trial.as_ref()?.movement.as_ref()?;
        Some((movement.player(), movement.goal()))
    }

    /// The most recent outcome signal emitted by a movement task, for redelivery.
    pub fn last_signal(&self) -> Option<&OutcomeSignal> {
        self.trial.as_ref()?.last_signal.as_ref()
    }

    pub fn next_deadline(&mut self) -> Option<u64> {
        if self.is_ended() {
            return None;
        }
        self.timers.next_deadline()
    }

    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        self.notices.drain(..).collect()
    }

    pub fn start(&mut self, now_ms: u64) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        self.started = true;
        self.now_ms = now_ms;
        info!(
            session_id = %self.session_id,
            participant_id = %self.config.participant.participant_id,
            seed = self.config.seed,
            "session started"
        );
        let mut started = self.record(EventKind::SessionStarted);
        started.response_window_s = contracts::seconds_cell(self.config.decision.formal_window_secs);
        started.countdown_s = contracts::seconds_cell(self.config.movement.countdown_secs);
        started.pass_score = contracts::cell(self.config.practice.pass_score);
        started.goal_distance_requested = contracts::cell(self.config.movement.goal_distance);
        self.emit(started);

        self.restore_progress();
        self.fix_block_order();
        self.enter_intro();
        Ok(())
    }

    /// Fires every timer due at or before `now_ms`, each at its own due time.
    pub fn advance_to(&mut self, now_ms: u64) {
        if !self.started {
            return;
        }
        while !self.is_ended() {
            let Some(FiredTimer { kind, due_ms }) = self.timers.pop_due(now_ms) else {
                break;
            };
            self.now_ms = self.now_ms.max(due_ms);
            self.on_timer(kind);
        }
        self.now_ms = self.now_ms.max(now_ms);
    }

    pub fn handle_input(
        &mut self,
        now_ms: u64,
        input: InputKind,
    ) -> Result<InputDisposition, SessionError> {
        self.ensure_running()?;
        self.advance_to(now_ms);
        self.ensure_running()?;

        let accepted = match input {
            InputKind::Continue => self.on_continue(),
            InputKind::Press => self.on_calibration_press(),
            InputKind::Work => self.on_decision(contracts::DecisionType::Work),
            InputKind::Skip => self.on_decision(contracts::DecisionType::Skip),
            InputKind::Move { direction } => self.on_move(direction),
            InputKind::Answer {
                question_index,
                choice,
            } => self.on_answer(question_index, choice),
        };
        if !accepted {
            debug!(stage = %self.stage, input = %input.label(), "input ignored");
        }
        Ok(if accepted {
            InputDisposition::Accepted
        } else {
            InputDisposition::Ignored
        })
    }

    /// Redelivers an outcome signal from outside the engine. A signal is only
    /// acted on when it matches what an ended movement task produced, and only
    /// the first delivery of a Work token ever is.
    pub fn deliver_outcome(
        &mut self,
        now_ms: u64,
        signal: OutcomeSignal,
    ) -> Result<Acceptance, SessionError> {
        self.ensure_running()?;
        self.advance_to(now_ms);
        self.ensure_running()?;
        if let Some(reason) = self.redelivery_violation(&signal) {
            self.emit_violation(&signal.token, signal.trial_index, &reason);
            return Ok(Acceptance::Violation(reason));
        }
        Ok(self.receive_outcome(signal))
    }

    /// Ends the running movement task immediately.
    pub fn force_end_movement(&mut self, now_ms: u64) -> Result<bool, SessionError> {
        self.ensure_running()?;
        self.advance_to(now_ms);
        self.ensure_running()?;
        if self.stage != SessionStage::Movement {
            return Ok(false);
        }
        self.timers.cancel(TimerKind::MovementCountdown);
        self.end_movement(MovementEndCause::ForcedEnd);
        Ok(true)
    }

    pub fn abort(&mut self, now_ms: u64, detail: &str) -> Result<FinalizedLog, SessionError> {
        self.ensure_running()?;
        self.now_ms = self.now_ms.max(now_ms);
        warn!(session_id = %self.session_id, detail, "session aborted");
        self.end_session(EndReason::Aborted, Some(detail));
        Ok(self.finalize())
    }

    /// Flushes the log. Called automatically when the session ends; safe to
    /// call again.
    pub fn finalize(&mut self) -> FinalizedLog {
        let report = self.log.finalize();
        if report.buffered_rows > 0 {
            warn!(
                buffered = report.buffered_rows,
                "log finalized with rows still buffered in memory"
            );
        }
        self.finalized = Some(report.clone());
        report
    }

    pub fn finalized(&self) -> Option<&FinalizedLog> {
        self.finalized.as_ref()
    }

    /// Full CSV content, including rows the file sink has not accepted yet.
    pub fn render_log(&self) -> Result<Vec<u8>, crate::event_log::EventLogError> {
        self.log.render_csv()
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            session_id: self.session_id.clone(),
            participant_id: self.config.participant.participant_id.clone(),
            stage: self.stage,
            practice_attempt: self.practice_attempt,
            block_position: self.block.as_ref().and_then(|block| match block.kind {
                BlockKind::Formal { position } => Some(position),
                BlockKind::Practice => None,
            }),
            current_trial_index: self.trial.as_ref().map(|run| run.trial.trial_index),
            trials_completed: self.trials_completed,
            total_score: self.total_score,
            presses_per_level: self.presses,
            end_reason: self.end_reason,
            buffered_log_rows: self.log.buffered_rows(),
        }
    }

    fn ensure_running(&self) -> Result<(), SessionError> {
        if !self.started {
            return Err(SessionError::NotStarted);
        }
        match self.end_reason {
            Some(reason) => Err(SessionError::Ended(reason.as_str())),
            None => Ok(()),
        }
    }

    fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::CalibrationPhaseEnd => self.on_calibration_phase_end(),
            TimerKind::CalibrationBreakEnd => self.on_calibration_break_end(),
            TimerKind::ResponseDeadline => self.on_response_deadline(),
            TimerKind::MovementCountdown => self.end_movement(MovementEndCause::CountdownExpired),
            TimerKind::OutcomeSettle => self.on_outcome_settled(),
            TimerKind::FeedbackEnd => self.on_feedback_end(),
            TimerKind::RestBreakEnd => self.on_rest_end(),
        }
    }

    fn enter_stage(&mut self, stage: SessionStage) {
        if self.stage == stage {
            return;
        }
        debug!(from = %self.stage, to = %stage, at_ms = self.now_ms, "stage transition");
        self.stage = stage;
        self.publish(SessionNotice::StageEntered {
            stage,
            at_ms: self.now_ms,
        });
        let record = self.record(EventKind::StageEntered);
        self.emit(record);
    }

    fn publish(&mut self, notice: SessionNotice) {
        self.notices.push_back(notice);
    }

    fn decision_window_ms(&self, practice: bool) -> u64 {
        if practice {
            secs_to_ms(self.config.decision.practice_window_secs)
        } else {
            secs_to_ms(self.config.decision.formal_window_secs)
        }
    }

    fn movement_params(&self) -> MovementParams {
        MovementParams {
            countdown_ms: secs_to_ms(self.config.movement.countdown_secs),
            goal_distance: self.config.movement.goal_distance,
            rushing_threshold_secs: self.config.movement.rushing_threshold_secs,
            reward_points: self.config.movement.reward_points,
        }
    }
}
