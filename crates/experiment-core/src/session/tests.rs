use super::*;

use chrono::{TimeZone, Utc};
use contracts::{BlockType, Direction, OutcomeType, ParticipantInfo, RatioPolicy};

use crate::grid::{LayoutError, StaticLayout};
use crate::store::MemoryPreferencesStore;

fn test_config() -> ExperimentConfig {
    let mut config = ExperimentConfig::default();
    config.participant = ParticipantInfo {
        participant_id: "T01".to_string(),
        age: Some(24),
        gender: Some("f".to_string()),
    };
    config.seed = 2024;
    config.intro_screens = 1;
    config.calibration.phase_count = 1;
    config.practice.block.repetitions = 1;
    config.practice.pass_score = 8;
    config
}

fn session_with(
    config: ExperimentConfig,
    layout: Box<dyn LayoutSource>,
    store: Box<dyn PreferencesStore>,
) -> Session {
    let started_at = Utc
        .with_ymd_and_hms(2026, 5, 4, 10, 0, 0)
        .single()
        .expect("valid time");
    let log = EventLog::in_memory("T01_20260504_100000.csv", started_at);
    Session::new(
        config,
        SessionDeps {
            layout,
            store,
            log,
        },
    )
}

fn session(config: ExperimentConfig) -> Session {
    session_with(
        config,
        Box::new(StaticLayout::default_room()),
        Box::new(MemoryPreferencesStore::new()),
    )
}

struct BrokenLayout;

/// Log sink that fails while `broken` is set.
#[derive(Clone, Default)]
struct SwitchableSink {
    broken: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl std::io::Write for SwitchableSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn small_room() -> StaticLayout {
    StaticLayout {
        rows: ["#######", "#.....#", "#.....#", "#.....#", "#######"]
            .iter()
            .map(|row| row.to_string())
            .collect(),
        width: None,
        height: None,
        floor_symbol: '.',
    }
}

impl LayoutSource for BrokenLayout {
    fn load(&mut self) -> Result<GridTopology, LayoutError> {
        Err(LayoutError::NoWalkableCells)
    }

    fn describe(&self) -> String {
        "broken layout".to_string()
    }
}

/// Manual clock around a session.
struct Driver {
    session: Session,
    now: u64,
}

impl Driver {
    fn start(session: Session) -> Self {
        let mut driver = Self { session, now: 0 };
        driver.session.start(0).expect("start");
        driver
    }

    fn input(&mut self, after_ms: u64, input: InputKind) -> InputDisposition {
        self.now += after_ms;
        self.session.handle_input(self.now, input).expect("running")
    }

    fn wait(&mut self, ms: u64) {
        self.now += ms;
        self.session.advance_to(self.now);
    }

    fn wait_for(&mut self, stage: SessionStage) {
        for _ in 0..64 {
            if self.session.stage() == stage {
                return;
            }
            let Some(deadline) = self.session.next_deadline() else {
                break;
            };
            self.now = self.now.max(deadline);
            self.session.advance_to(self.now);
        }
        assert_eq!(self.session.stage(), stage, "stage never reached");
    }

    /// Intro, one calibration phase with `presses` taps, up to practice instructions.
    fn calibrate(&mut self, presses: u32) {
        self.input(500, InputKind::Continue);
        assert_eq!(self.session.stage(), SessionStage::CalibrationInstructions);
        self.input(500, InputKind::Continue);
        assert_eq!(self.session.stage(), SessionStage::CalibrationPhase);
        for _ in 0..presses {
            self.input(50, InputKind::Press);
        }
        self.wait_for(SessionStage::PracticeInstructions);
    }

    fn walk_to_goal(&mut self) {
        let presses = self
            .session
            .trial
            .as_ref()
            .map(|run| run.trial.required_presses)
            .expect("trial");
        for _ in 0..32 {
            let (player, goal) = self.session.movement_positions().expect("movement");
            if player == goal || self.session.trial.as_ref().is_some_and(|run| {
                run.movement.as_ref().is_some_and(MovementController::reward_collected)
            }) {
                return;
            }
            let direction = if goal.x > player.x {
                Direction::Right
            } else if goal.x < player.x {
                Direction::Left
            } else if goal.y < player.y {
                Direction::Up
            } else {
                Direction::Down
            };
            for _ in 0..presses {
                self.input(20, InputKind::Move { direction });
            }
        }
    }

    /// Answers every check question, correctly or not.
    fn answer_all(&mut self, correct: bool) {
        let questions = self.session.config().practice.questions.clone();
        for (index, question) in questions.iter().enumerate() {
            let choice = if correct {
                question.correct_choice
            } else {
                question.correct_choice % 3 + 1
            };
            self.input(
                300,
                InputKind::Answer {
                    question_index: index,
                    choice,
                },
            );
        }
    }

    fn count(&self, kind: EventKind) -> usize {
        self.session
            .records()
            .iter()
            .filter(|record| record.kind() == Some(kind))
            .count()
    }

    fn rows(&self, kind: EventKind) -> Vec<&EventRecord> {
        self.session
            .records()
            .iter()
            .filter(|record| record.kind() == Some(kind))
            .collect()
    }
}

#[test]
fn block_order_is_fixed_and_logged_before_the_intro() {
    let driver = Driver::start(session(test_config()));
    let kinds = driver
        .session
        .records()
        .iter()
        .filter_map(EventRecord::kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds[0], EventKind::SessionStarted);
    assert_eq!(kinds[1], EventKind::BlockOrderFixed);
    assert_eq!(driver.session.stage(), SessionStage::Intro);

    let mut order = driver.session.block_order().to_vec();
    order.sort_unstable();
    assert_eq!(order, vec![0, 1, 2]);
    let logged = driver.rows(EventKind::BlockOrderFixed)[0]
        .block_order
        .clone()
        .expect("order column");
    assert_eq!(logged.split('|').count(), 3);
}

#[test]
fn calibration_sets_presses_per_level_from_the_peak_phase() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    assert_eq!(
        driver.session.presses_per_level(),
        Some(PressesPerLevel([3, 6, 9]))
    );
    assert_eq!(driver.count(EventKind::CalibrationPress), 52);
    assert_eq!(driver.count(EventKind::CalibrationCompleted), 1);

    // presses outside an active phase are ignored
    assert_eq!(
        driver.input(10, InputKind::Press),
        InputDisposition::Ignored
    );
}

#[test]
fn duplicate_outcome_is_processed_once() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    assert_eq!(driver.session.stage(), SessionStage::Decision);

    driver.input(400, InputKind::Work);
    assert_eq!(driver.session.stage(), SessionStage::Movement);
    driver.walk_to_goal();
    driver.wait_for(SessionStage::Settling);

    let signal = driver.session.last_signal().cloned().expect("signal");
    let during_settle = driver
        .session
        .deliver_outcome(driver.now + 10, signal.clone())
        .expect("running");
    assert_eq!(during_settle, Acceptance::Duplicate);

    driver.wait_for(SessionStage::Feedback);
    let after_commit = driver
        .session
        .deliver_outcome(driver.now + 10, signal)
        .expect("running");
    assert_eq!(after_commit, Acceptance::Duplicate);

    assert_eq!(driver.count(EventKind::TrialOutcome), 1);
    assert_eq!(driver.count(EventKind::DuplicateOutcome), 2);
    let outcome = driver.rows(EventKind::TrialOutcome)[0];
    assert_eq!(outcome.outcome_type.as_deref(), Some("Success"));
    assert_eq!(outcome.reward_collected.as_deref(), Some("1"));
}

#[test]
fn settling_delay_precedes_the_outcome_row() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    driver.input(400, InputKind::Work);
    driver.wait_for(SessionStage::Settling);
    let ended = driver.rows(EventKind::MovementEnded)[0]
        .elapsed_ms
        .clone()
        .expect("elapsed");
    driver.wait_for(SessionStage::Feedback);
    let committed = driver.rows(EventKind::TrialOutcome)[0]
        .elapsed_ms
        .clone()
        .expect("elapsed");
    let ended: u64 = ended.parse().expect("number");
    let committed: u64 = committed.parse().expect("number");
    assert_eq!(committed - ended, 300);

    let outcome = driver.rows(EventKind::TrialOutcome)[0];
    assert_eq!(outcome.outcome_type.as_deref(), Some("Failure"));
    assert_eq!(outcome.movement_duration_s.as_deref(), Some("10.000"));
}

#[test]
fn silence_times_out_with_zero_reward() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    driver.wait_for(SessionStage::Feedback);

    assert_eq!(driver.count(EventKind::DecisionTimeout), 1);
    assert_eq!(driver.count(EventKind::MovementStarted), 0);
    let outcome = driver.rows(EventKind::TrialOutcome)[0];
    assert_eq!(outcome.outcome_type.as_deref(), Some("Timeout"));
    assert_eq!(outcome.reward_points.as_deref(), Some("0"));
    assert_eq!(outcome.reaction_time_s, None);

    // a late choice after the window is ignored
    assert_eq!(
        driver.input(10, InputKind::Work),
        InputDisposition::Ignored
    );
}

#[test]
fn signals_for_skipped_trials_are_protocol_violations() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    let trial_index = driver.session.status().current_trial_index.expect("trial");
    driver.input(300, InputKind::Skip);
    assert_eq!(driver.session.stage(), SessionStage::Feedback);

    let stray = OutcomeSignal {
        token: contracts::TransactionToken::new("forged"),
        trial_index,
        cause: MovementEndCause::CountdownExpired,
        outcome: TrialOutcome::without_movement(trial_index, OutcomeType::Success),
    };
    let acceptance = driver
        .session
        .deliver_outcome(driver.now + 5, stray)
        .expect("running");
    assert!(matches!(acceptance, Acceptance::Violation(_)));
    assert_eq!(driver.count(EventKind::ProtocolViolation), 1);
    assert_eq!(driver.count(EventKind::TrialOutcome), 1);
    assert_eq!(
        driver.rows(EventKind::TrialOutcome)[0].outcome_type.as_deref(),
        Some("Skip")
    );
}

#[test]
fn missing_grid_aborts_the_trial_as_failure() {
    let mut driver = Driver::start(session_with(
        test_config(),
        Box::new(BrokenLayout),
        Box::new(MemoryPreferencesStore::new()),
    ));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    driver.input(300, InputKind::Work);

    assert_eq!(driver.session.stage(), SessionStage::Feedback);
    // once when the practice block is planned, once at movement setup
    assert_eq!(driver.count(EventKind::MissingCollaborator), 2);
    assert!(driver.rows(EventKind::MissingCollaborator)[0]
        .error_detail
        .as_deref()
        .is_some_and(|detail| detail.contains("broken layout")));
    assert_eq!(driver.count(EventKind::TrialAborted), 1);
    let outcome = driver.rows(EventKind::TrialOutcome)[0];
    assert_eq!(outcome.outcome_type.as_deref(), Some("Failure"));
    assert!(driver.session.grid().is_none());
}

#[test]
fn failing_practice_twice_ends_the_session() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);

    for attempt in 1..=2 {
        driver.input(500, InputKind::Continue);
        for _ in 0..6 {
            driver.wait_for(SessionStage::Decision);
            driver.input(200, InputKind::Skip);
        }
        driver.wait_for(SessionStage::CheckQuestions);
        driver.answer_all(true);
        let gate = driver.rows(EventKind::PracticeGateEvaluated)[attempt - 1];
        assert_eq!(gate.combined_score.as_deref(), Some("4"));
        assert_eq!(gate.gate_passed.as_deref(), Some("0"));
    }

    assert!(driver.session.is_ended());
    assert_eq!(driver.session.end_reason(), Some(EndReason::FailedPractice));
    assert_eq!(driver.session.stage(), SessionStage::Ended);
    assert!(driver.session.finalized().is_some());
    let ended = driver.rows(EventKind::SessionEnded)[0];
    assert_eq!(ended.end_reason.as_deref(), Some("failed_practice"));
    assert!(matches!(
        driver.session.handle_input(driver.now + 1, InputKind::Continue),
        Err(SessionError::Ended("failed_practice"))
    ));
}

#[test]
fn one_wrong_answer_fails_the_gate_even_with_a_high_score() {
    let mut config = test_config();
    config.practice.pass_score = 1;
    let mut driver = Driver::start(session(config));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    for _ in 0..6 {
        driver.wait_for(SessionStage::Decision);
        driver.input(200, InputKind::Skip);
    }
    driver.wait_for(SessionStage::CheckQuestions);
    driver.input(
        300,
        InputKind::Answer {
            question_index: 0,
            choice: 3,
        },
    );
    for index in 1..4 {
        let choice = driver.session.config().practice.questions[index].correct_choice;
        driver.input(
            300,
            InputKind::Answer {
                question_index: index,
                choice,
            },
        );
    }
    let gate = driver.rows(EventKind::PracticeGateEvaluated)[0];
    assert_eq!(gate.gate_passed.as_deref(), Some("0"));
    assert_eq!(driver.session.stage(), SessionStage::PracticeInstructions);
}

#[test]
fn stored_progress_resumes_at_the_next_formal_block() {
    let mut store = MemoryPreferencesStore::new();
    let mut state = SessionState::for_participant(test_config().participant);
    state.presses_per_level = Some(PressesPerLevel([2, 4, 6]));
    state.practice_attempts = 1;
    state.practice_passed = true;
    state.block_order = Some(vec![2, 0, 1]);
    state.completed_blocks = 1;
    state.total_score = 11;
    save_session_state(&mut store, &state).expect("save");

    let mut driver = Driver::start(session_with(
        test_config(),
        Box::new(StaticLayout::default_room()),
        Box::new(store),
    ));
    assert_eq!(driver.count(EventKind::SessionResumed), 1);
    assert_eq!(driver.session.block_order(), &[2, 0, 1]);
    driver.input(500, InputKind::Continue);

    let status = driver.session.status();
    assert_eq!(status.stage, SessionStage::Decision);
    assert_eq!(status.block_position, Some(1));
    assert_eq!(status.total_score, 11);
    let active = driver.session.block.as_ref().expect("block");
    assert_eq!(active.block.block_type, BlockType::HighDemand);
    assert_eq!(active.block.ratio, RatioPolicy::new(3, 2, 1));
    assert!(active
        .block
        .trials
        .iter()
        .all(|trial| trial.required_presses == [2, 4, 6][trial.effort_level.index()]));
}

#[test]
fn store_failures_are_logged_and_the_session_continues() {
    let mut store = MemoryPreferencesStore::new();
    store.set_failing(true);
    let mut driver = Driver::start(session_with(
        test_config(),
        Box::new(StaticLayout::default_room()),
        Box::new(store),
    ));
    assert!(driver.count(EventKind::StoreFailure) >= 1);
    driver.calibrate(52);
    assert!(driver.count(EventKind::StoreFailure) >= 2);
    assert_eq!(driver.session.stage(), SessionStage::PracticeInstructions);
}

#[test]
fn forced_end_stops_the_movement_once() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    driver.input(400, InputKind::Work);
    driver.input(
        100,
        InputKind::Move {
            direction: Direction::Up,
        },
    );
    assert!(driver.session.force_end_movement(driver.now + 100).expect("running"));
    assert!(!driver.session.force_end_movement(driver.now + 150).expect("running"));
    driver.wait(1_000);
    assert_eq!(driver.count(EventKind::MovementEnded), 1);
    assert_eq!(
        driver.rows(EventKind::MovementEnded)[0].end_cause.as_deref(),
        Some("forced_end")
    );
    assert_eq!(driver.count(EventKind::TrialOutcome), 1);
}

#[test]
fn abort_ends_and_finalizes() {
    let mut driver = Driver::start(session(test_config()));
    driver.input(100, InputKind::Continue);
    let report = driver.session.abort(driver.now + 10, "operator").expect("abort");
    assert_eq!(driver.session.end_reason(), Some(EndReason::Aborted));
    assert_eq!(report.buffered_rows, 0);
    assert_eq!(report.rows, driver.session.records().len());
    assert!(driver.session.next_deadline().is_none());
    assert!(matches!(
        driver.session.abort(driver.now + 20, "again"),
        Err(SessionError::Ended("aborted"))
    ));
}

#[test]
fn practice_decision_uses_the_longer_window() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    let presented = driver.rows(EventKind::DecisionPresented)[0];
    assert_eq!(presented.response_window_s.as_deref(), Some("5.000"));
    assert_eq!(presented.is_practice.as_deref(), Some("1"));
}

#[test]
fn outcome_for_a_running_movement_is_rejected() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    driver.input(400, InputKind::Work);
    assert_eq!(driver.session.stage(), SessionStage::Movement);

    let (trial_index, token) = {
        let run = driver.session.trial.as_ref().expect("trial");
        let movement = run.movement.as_ref().expect("movement");
        (run.trial.trial_index, movement.token().clone())
    };
    let forged = OutcomeSignal {
        token,
        trial_index,
        cause: MovementEndCause::ForcedEnd,
        outcome: TrialOutcome {
            reward_collected: true,
            reward_points: 500,
            ..TrialOutcome::without_movement(trial_index, OutcomeType::Success)
        },
    };
    let acceptance = driver
        .session
        .deliver_outcome(driver.now + 100, forged)
        .expect("running");
    assert_eq!(
        acceptance,
        Acceptance::Violation(ViolationReason::MovementStillActive)
    );
    assert_eq!(driver.session.stage(), SessionStage::Movement);
    assert_eq!(
        driver.rows(EventKind::ProtocolViolation)[0]
            .error_detail
            .as_deref(),
        Some("movement_still_active")
    );
    assert_eq!(driver.count(EventKind::TrialOutcome), 0);

    driver.wait_for(SessionStage::Feedback);
    assert_eq!(driver.count(EventKind::MovementEnded), 1);
    let outcome = driver.rows(EventKind::TrialOutcome)[0];
    assert_eq!(outcome.outcome_type.as_deref(), Some("Failure"));
    assert_eq!(outcome.reward_points.as_deref(), Some("0"));

    driver.wait_for(SessionStage::Decision);
    assert_eq!(
        driver.session.grid().map(GridTopology::occupied_count),
        Some(0)
    );
}

#[test]
fn altered_redelivery_is_rejected() {
    let mut driver = Driver::start(session(test_config()));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    driver.input(400, InputKind::Work);
    driver.wait_for(SessionStage::Settling);

    let mut altered = driver.session.last_signal().cloned().expect("signal");
    altered.outcome.outcome_type = OutcomeType::Success;
    altered.outcome.reward_points = 500;
    let acceptance = driver
        .session
        .deliver_outcome(driver.now + 10, altered)
        .expect("running");
    assert_eq!(
        acceptance,
        Acceptance::Violation(ViolationReason::PayloadMismatch)
    );

    driver.wait_for(SessionStage::Feedback);
    assert_eq!(driver.count(EventKind::TrialOutcome), 1);
    let outcome = driver.rows(EventKind::TrialOutcome)[0];
    assert_eq!(outcome.outcome_type.as_deref(), Some("Failure"));
    assert_eq!(outcome.reward_points.as_deref(), Some("0"));
}

#[test]
fn trials_are_planned_on_the_configured_layout() {
    let mut config = test_config();
    config.movement.goal_distance = 3;
    let mut driver = Driver::start(session_with(
        config,
        Box::new(small_room()),
        Box::new(MemoryPreferencesStore::new()),
    ));
    driver.calibrate(52);
    driver.input(500, InputKind::Continue);
    assert_eq!(driver.session.stage(), SessionStage::Decision);

    let grid = driver.session.grid().expect("live grid");
    assert_eq!((grid.width(), grid.height()), (7, 5));
    let trials = &driver.session.block.as_ref().expect("block").block.trials;
    assert_eq!(trials.len(), 6);
    for trial in trials {
        assert!(grid.is_walkable(trial.start_position), "start {:?}", trial.start_position);
        assert!(grid.is_walkable(trial.goal_position), "goal {:?}", trial.goal_position);
    }
    assert_eq!(driver.count(EventKind::MissingCollaborator), 0);
}

#[test]
fn formal_decision_times_out_after_two_and_a_half_seconds() {
    let mut store = MemoryPreferencesStore::new();
    let mut state = SessionState::for_participant(test_config().participant);
    state.presses_per_level = Some(PressesPerLevel([2, 4, 6]));
    state.practice_attempts = 1;
    state.practice_passed = true;
    state.block_order = Some(vec![0, 1, 2]);
    state.completed_blocks = 0;
    save_session_state(&mut store, &state).expect("save");

    let mut driver = Driver::start(session_with(
        test_config(),
        Box::new(StaticLayout::default_room()),
        Box::new(store),
    ));
    driver.input(500, InputKind::Continue);
    assert_eq!(driver.session.stage(), SessionStage::Decision);
    let presented = driver.rows(EventKind::DecisionPresented)[0];
    assert_eq!(presented.is_practice.as_deref(), Some("0"));
    assert_eq!(presented.response_window_s.as_deref(), Some("2.500"));
    let presented_at: u64 = presented
        .elapsed_ms
        .as_deref()
        .expect("elapsed")
        .parse()
        .expect("number");

    // the deadline fires before an input at the same instant
    assert_eq!(driver.input(2_500, InputKind::Work), InputDisposition::Ignored);

    let timeout = driver.rows(EventKind::DecisionTimeout)[0];
    assert_eq!(timeout.elapsed_ms, contracts::cell(presented_at + 2_500));
    assert_eq!(timeout.reaction_time_s, None);
    let outcome = driver.rows(EventKind::TrialOutcome)[0];
    assert_eq!(outcome.outcome_type.as_deref(), Some("Timeout"));
    assert_eq!(outcome.reward_points.as_deref(), Some("0"));
    assert_eq!(driver.count(EventKind::DecisionMade), 0);
    assert_eq!(driver.count(EventKind::MovementStarted), 0);
}

#[test]
fn log_write_failure_is_logged_once_per_episode() {
    let sink = SwitchableSink::default();
    let started_at = Utc
        .with_ymd_and_hms(2026, 5, 4, 10, 0, 0)
        .single()
        .expect("valid time");
    let log = EventLog::with_sink(Box::new(sink.clone()), "T01_20260504_100000.csv", started_at)
        .expect("header");
    let mut driver = Driver::start(Session::new(
        test_config(),
        SessionDeps {
            layout: Box::new(StaticLayout::default_room()),
            store: Box::new(MemoryPreferencesStore::new()),
            log,
        },
    ));
    assert_eq!(driver.count(EventKind::LogWriteFailure), 0);

    sink.broken.store(true, std::sync::atomic::Ordering::SeqCst);
    driver.input(500, InputKind::Continue);
    driver.input(500, InputKind::Continue);
    assert_eq!(driver.count(EventKind::LogWriteFailure), 1);
    let failure = driver.rows(EventKind::LogWriteFailure)[0];
    assert_eq!(failure.error_kind.as_deref(), Some("LogWriteFailure"));
    assert!(failure
        .error_detail
        .as_deref()
        .is_some_and(|detail| detail.contains("still_buffered=")));
    assert!(driver.session.status().buffered_log_rows > 0);
    assert!(driver
        .session
        .drain_notices()
        .iter()
        .any(|notice| matches!(notice, SessionNotice::Warning { message } if message.starts_with("LogWriteFailure"))));

    sink.broken.store(false, std::sync::atomic::Ordering::SeqCst);
    let report = driver.session.abort(driver.now + 10, "operator").expect("abort");
    assert_eq!(report.buffered_rows, 0);
    assert_eq!(driver.count(EventKind::LogWriteFailure), 1);
}
