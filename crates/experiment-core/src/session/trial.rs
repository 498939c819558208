use super::*;

use contracts::{cell, flag_cell, seconds_cell, DecisionType, Direction, OutcomeType};

impl Session {
    pub(super) fn start_current_trial(&mut self) {
        let Some(active) = &self.block else {
            return;
        };
        let Some(trial) = active.current().cloned() else {
            return;
        };
        let window_ms = self.decision_window_ms(active.is_practice());
        self.trial = Some(TrialRun {
            decision: DecisionPhase::new(trial.trial_index, trial.effort_level, window_ms),
            trial,
            record: None,
            movement: None,
            last_signal: None,
            outcome: None,
            consumed: false,
        });
        self.emit_kind(EventKind::TrialStarted);
        self.present_decision();
    }

    fn present_decision(&mut self) {
        let now_ms = self.now_ms;
        let Some(run) = self.trial.as_mut() else {
            return;
        };
        let Some(deadline_ms) = run.decision.present(now_ms) else {
            return;
        };
        let trial_index = run.trial.trial_index;
        let effort_level = run.trial.effort_level;
        let window_ms = run.decision.window_ms();
        self.timers.arm(TimerKind::ResponseDeadline, deadline_ms);
        self.enter_stage(SessionStage::Decision);
        let mut record = self.record(EventKind::DecisionPresented);
        record.response_window_s = seconds_cell(window_ms as f64 / 1000.0);
        self.emit(record);
        self.publish(SessionNotice::DecisionPresented {
            trial_index,
            effort_level,
            response_window_ms: window_ms,
        });
    }

    pub(super) fn on_decision(&mut self, decision: DecisionType) -> bool {
        if self.stage != SessionStage::Decision {
            return false;
        }
        let now_ms = self.now_ms;
        let Some(resolution) = self
            .trial
            .as_mut()
            .and_then(|run| run.decision.choose(now_ms, decision))
        else {
            return false;
        };
        self.timers.cancel(TimerKind::ResponseDeadline);
        self.resolve_decision(resolution);
        true
    }

    pub(super) fn on_response_deadline(&mut self) {
        let now_ms = self.now_ms;
        let Some(resolution) = self
            .trial
            .as_mut()
            .and_then(|run| run.decision.expire(now_ms))
        else {
            return;
        };
        self.resolve_decision(resolution);
    }

    fn resolve_decision(&mut self, resolution: Resolution) {
        let Some(run) = self.trial.as_mut() else {
            return;
        };
        let trial_index = run.trial.trial_index;
        let token = match resolution.decision {
            DecisionType::Work => Some(self.guard.mint(trial_index, &mut self.rng)),
            other => {
                self.guard.record_non_work(trial_index, other);
                None
            }
        };
        run.record = Some(DecisionRecord {
            trial_index,
            decision_type: resolution.decision,
            reaction_time_seconds: resolution.reaction_time_secs,
            transaction_token: token.clone(),
        });

        let kind = if resolution.decision == DecisionType::Timeout {
            EventKind::DecisionTimeout
        } else {
            EventKind::DecisionMade
        };
        let mut record = self.record(kind);
        record.reaction_time_s = resolution.reaction_time_secs.and_then(seconds_cell);
        if resolution.decision != DecisionType::Timeout {
            record.input_label = Some(resolution.decision.as_str().to_lowercase());
        }
        self.emit(record);
        self.publish(SessionNotice::DecisionResolved {
            trial_index,
            decision_type: resolution.decision,
        });

        match (resolution.decision, token) {
            (DecisionType::Work, Some(token)) => self.start_movement(token),
            (DecisionType::Skip, _) => {
                self.commit_outcome(TrialOutcome::without_movement(trial_index, OutcomeType::Skip))
            }
            _ => self.commit_outcome(TrialOutcome::without_movement(
                trial_index,
                OutcomeType::Timeout,
            )),
        }
    }

    /// Builds the live grid on first use; `false` when the layout source cannot
    /// provide one. A failed load is retried at the next call.
    pub(super) fn ensure_grid(&mut self) -> bool {
        if self.grid.is_some() {
            return true;
        }
        match self.layout.load() {
            Ok(grid) => {
                info!(source = %self.layout.describe(), "live grid constructed");
                self.grid = Some(grid);
                true
            }
            Err(err) => {
                warn!(source = %self.layout.describe(), error = %err, "live grid unavailable");
                self.emit_error(
                    EventKind::MissingCollaborator,
                    format!("grid: {} ({err})", self.layout.describe()),
                );
                false
            }
        }
    }

    fn start_movement(&mut self, token: contracts::TransactionToken) {
        if !self.ensure_grid() {
            self.abort_trial(token, "live grid unavailable at movement setup");
            return;
        }
        let params = self.movement_params();
        let (Some(run), Some(grid)) = (self.trial.as_mut(), self.grid.as_mut()) else {
            return;
        };
        let (mut movement, report) =
            MovementController::setup(&run.trial, token, params, grid, &mut self.rng);
        let trial_index = run.trial.trial_index;
        let presses_per_step = movement.presses_per_step();
        let countdown_ms = movement.countdown_ms();
        let ends_at_ms = movement.activate(self.now_ms);
        run.movement = Some(movement);

        if report.goal.is_degraded() {
            self.emit_placement(trial_index, &report.goal);
        }
        if let Some(ends_at_ms) = ends_at_ms {
            self.timers.arm(TimerKind::MovementCountdown, ends_at_ms);
        }
        self.enter_stage(SessionStage::Movement);

        let mut record = self.record(EventKind::MovementStarted);
        record.start_x = cell(report.start.x);
        record.start_y = cell(report.start.y);
        record.goal_distance_actual = cell(report.goal.actual_distance);
        record.placement_quality = Some(report.goal.quality.as_str().to_string());
        record.countdown_s = seconds_cell(countdown_ms as f64 / 1000.0);
        if report.start_replaced || report.goal_replanned {
            record.error_detail = Some(format!(
                "start_replaced={} goal_replanned={}",
                report.start_replaced, report.goal_replanned
            ));
        }
        self.emit(record);
        self.publish(SessionNotice::MovementStarted {
            trial_index,
            start: report.start,
            goal: report.goal.position,
            presses_per_step,
            countdown_ms,
        });
    }

    /// A Work trial whose movement cannot run ends as a Failure through the
    /// guard so its token can never be processed again.
    fn abort_trial(&mut self, token: contracts::TransactionToken, detail: &str) {
        let Some(run) = self.trial.as_ref() else {
            return;
        };
        let trial_index = run.trial.trial_index;
        let outcome = TrialOutcome::without_movement(trial_index, OutcomeType::Failure);
        self.emit_error(EventKind::TrialAborted, detail);
        let signal = OutcomeSignal {
            token: token.clone(),
            trial_index,
            cause: MovementEndCause::ForcedEnd,
            outcome,
        };
        if self.guard.accept(signal) == Acceptance::Pending {
            if let Some(outcome) = self.guard.commit(&token) {
                self.commit_outcome(outcome);
            }
        }
    }

    pub(super) fn on_move(&mut self, direction: Direction) -> bool {
        if self.stage != SessionStage::Movement {
            return false;
        }
        let now_ms = self.now_ms;
        let (Some(run), Some(grid)) = (self.trial.as_mut(), self.grid.as_mut()) else {
            return false;
        };
        let Some(movement) = run.movement.as_mut() else {
            return false;
        };
        let Some(report) = movement.press(now_ms, direction, grid) else {
            return false;
        };
        let trial_index = run.trial.trial_index;
        debug!(
            trial_index,
            presses = report.button_presses,
            press_in_step = report.press_in_step,
            "movement press"
        );

        let mut record = self.record(EventKind::ButtonPress);
        record.input_label = Some(InputKind::Move { direction }.label());
        record.button_presses = cell(report.button_presses);
        record.press_in_step = cell(report.press_in_step);
        record.step_direction = Some(direction.as_str().to_string());
        self.emit(record);

        match report.effect {
            StepEffect::None => {}
            StepEffect::Moved { to, .. } => {
                let mut record = self.record(EventKind::StepTaken);
                record.step_direction = Some(direction.as_str().to_string());
                record.step_result = Some("moved".to_string());
                record.steps_taken = cell(report.steps_taken);
                self.emit(record);
                self.publish(SessionNotice::PlayerMoved { position: to });
            }
            StepEffect::Blocked { toward, .. } => {
                let mut record = self.record(EventKind::StepBlocked);
                record.step_direction = Some(direction.as_str().to_string());
                record.step_result = Some("blocked".to_string());
                record.steps_taken = cell(report.steps_taken);
                record.error_detail = Some(format!("wall_at={toward}"));
                self.emit(record);
            }
        }
        if report.collected_now {
            info!(trial_index, at_ms = now_ms, "goal collected");
            let mut record = self.record(EventKind::GoalCollected);
            record.reward_collected = flag_cell(true);
            self.emit(record);
            self.publish(SessionNotice::GoalCollected { trial_index });
        }
        true
    }

    pub(super) fn end_movement(&mut self, cause: MovementEndCause) {
        let now_ms = self.now_ms;
        let Some(run) = self.trial.as_mut() else {
            return;
        };
        let Some(movement) = run.movement.as_mut() else {
            return;
        };
        let Some(summary) = movement.end(now_ms, cause) else {
            return;
        };
        if let Some(grid) = self.grid.as_mut() {
            movement.cleanup(grid);
        }
        let token = movement.token().clone();
        let signal = OutcomeSignal {
            token,
            trial_index: run.trial.trial_index,
            cause,
            outcome: summary.outcome.clone(),
        };
        run.last_signal = Some(signal.clone());
        self.emit_movement_ended(&summary);
        self.receive_outcome(signal);
    }

    fn emit_movement_ended(&mut self, summary: &MovementSummary) {
        let mut record = self.record(EventKind::MovementEnded);
        Self::outcome_cells(&mut record, &summary.outcome);
        record.outcome_type = None;
        record.end_cause = Some(summary.cause.as_str().to_string());
        record.steps_taken = cell(summary.steps_taken);
        record.player_x = cell(summary.final_position.x);
        record.player_y = cell(summary.final_position.y);
        record.countdown_s = seconds_cell(summary.countdown_secs);
        self.emit(record);
    }

    /// Entry point for every outcome signal, internal or redelivered.
    pub(super) fn receive_outcome(&mut self, signal: OutcomeSignal) -> Acceptance {
        let token = signal.token.clone();
        let trial_index = signal.trial_index;
        let acceptance = self.guard.accept(signal);
        match &acceptance {
            Acceptance::Pending => {
                self.enter_stage(SessionStage::Settling);
                self.timers.arm(
                    TimerKind::OutcomeSettle,
                    self.now_ms + self.config.settle_ms,
                );
            }
            Acceptance::Duplicate => {
                warn!(trial_index, token = %token, "duplicate outcome rejected");
                let mut record = self.record(EventKind::DuplicateOutcome);
                record.transaction_token = Some(token.as_str().to_string());
                record.error_kind = Some(EventKind::DuplicateOutcome.as_str().to_string());
                record.error_detail = Some(format!("signal_for_trial_{trial_index}"));
                self.emit(record);
            }
            Acceptance::Violation(reason) => self.emit_violation(&token, trial_index, reason),
        }
        acceptance
    }

    /// Signals from outside the engine may only repeat what the movement task
    /// produced, and only after it has ended.
    pub(super) fn redelivery_violation(&self, signal: &OutcomeSignal) -> Option<ViolationReason> {
        let run = self.trial.as_ref()?;
        if let Some(movement) = &run.movement {
            if movement.token() == &signal.token
                && !matches!(movement.state(), MovementState::Ended { .. })
            {
                return Some(ViolationReason::MovementStillActive);
            }
        }
        match &run.last_signal {
            Some(produced) if produced.token == signal.token && produced != signal => {
                Some(ViolationReason::PayloadMismatch)
            }
            _ => None,
        }
    }

    pub(super) fn emit_violation(
        &mut self,
        token: &contracts::TransactionToken,
        trial_index: usize,
        reason: &ViolationReason,
    ) {
        warn!(trial_index, token = %token, reason = %reason.detail(), "protocol violation");
        let mut record = self.record(EventKind::ProtocolViolation);
        record.transaction_token = Some(token.as_str().to_string());
        record.error_kind = Some(EventKind::ProtocolViolation.as_str().to_string());
        record.error_detail = Some(reason.detail());
        self.emit(record);
    }

    /// Settling delay elapsed: check-and-set the pending token.
    pub(super) fn on_outcome_settled(&mut self) {
        let Some(token) = self.guard.pending_token().cloned() else {
            return;
        };
        if let Some(outcome) = self.guard.commit(&token) {
            self.commit_outcome(outcome);
        }
    }

    /// Hands the outcome to the orchestrator, which consumes it exactly once.
    fn commit_outcome(&mut self, outcome: TrialOutcome) {
        let Some(run) = self.trial.as_mut() else {
            return;
        };
        if run.outcome.is_some() || run.consumed {
            return;
        }
        run.outcome = Some(outcome);
        self.consume_outcome();
    }

    fn consume_outcome(&mut self) {
        let Some(run) = self.trial.as_mut() else {
            return;
        };
        let Some(outcome) = run.outcome.take() else {
            return;
        };
        run.consumed = true;

        self.trials_completed += 1;
        let practice = self.block.as_ref().is_some_and(ActiveBlock::is_practice);
        if let Some(active) = self.block.as_mut() {
            active.score += outcome.reward_points;
        }
        if practice {
            if outcome.outcome_type == OutcomeType::Success {
                self.practice_successes += 1;
            }
        } else {
            self.total_score += outcome.reward_points;
        }

        let mut record = self.record(EventKind::TrialOutcome);
        Self::outcome_cells(&mut record, &outcome);
        if practice {
            record.practice_score = cell(self.practice_successes);
        }
        if let Some(reaction) = self
            .trial
            .as_ref()
            .and_then(|run| run.record.as_ref())
            .and_then(|decision| decision.reaction_time_seconds)
        {
            record.reaction_time_s = seconds_cell(reaction);
        }
        self.emit(record);
        self.publish(SessionNotice::TrialCompleted {
            outcome: outcome.clone(),
        });
        self.show_feedback(&outcome);
    }

    fn show_feedback(&mut self, outcome: &TrialOutcome) {
        self.enter_stage(SessionStage::Feedback);
        let feedback = match outcome.outcome_type {
            OutcomeType::Success => "reward",
            OutcomeType::Failure => "no_reward",
            OutcomeType::Skip => "skipped",
            OutcomeType::Timeout => "too_slow",
        };
        let mut record = self.record(EventKind::FeedbackShown);
        record.feedback = Some(feedback.to_string());
        record.outcome_type = Some(outcome.outcome_type.as_str().to_string());
        self.emit(record);
        let duration_ms = secs_to_ms(self.config.feedback_secs);
        self.timers
            .arm(TimerKind::FeedbackEnd, self.now_ms + duration_ms);
    }

    pub(super) fn on_feedback_end(&mut self) {
        if self.stage != SessionStage::Feedback {
            return;
        }
        self.advance_trial();
    }
}
