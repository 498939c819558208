use super::*;

use contracts::{cell, flag_cell, seconds_cell, BlockSpec};

impl Session {
    pub(super) fn restore_progress(&mut self) {
        if !self.config.resume {
            return;
        }
        let participant_id = self.config.participant.participant_id.clone();
        let state = match load_session_state(self.store.as_ref(), &participant_id) {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(err) => {
                warn!(error = %err, "stored session state unreadable; starting fresh");
                self.emit_error(EventKind::StoreFailure, err.to_string());
                return;
            }
        };
        if !state.has_progress() {
            return;
        }

        self.presses = state.presses_per_level;
        self.practice_attempt = state.practice_attempts;
        self.formal_completed = state.completed_blocks;
        self.total_score = state.total_score;
        self.guard.restore_processed(state.processed_tokens.iter().cloned());
        info!(
            participant_id = %participant_id,
            completed_blocks = state.completed_blocks,
            practice_passed = state.practice_passed,
            "resuming stored progress"
        );
        self.persisted = SessionState {
            participant: self.config.participant.clone(),
            ..state
        };

        let mut record = self.record(EventKind::SessionResumed);
        record.gate_passed = flag_cell(self.persisted.practice_passed);
        record.block_position = cell(self.formal_completed);
        if let Some(presses) = self.presses {
            record.presses_level_1 = cell(presses.0[0]);
            record.presses_level_2 = cell(presses.0[1]);
            record.presses_level_3 = cell(presses.0[2]);
        }
        self.emit(record);
    }

    /// Formal block order is permuted once per participant and logged before
    /// anything else happens.
    pub(super) fn fix_block_order(&mut self) {
        let count = self.config.formal.blocks.len();
        let stored = self
            .persisted
            .block_order
            .clone()
            .filter(|order| is_permutation(order, count));
        self.block_order = match stored {
            Some(order) => order,
            None => block_order(count, &mut self.rng),
        };
        let labels = self
            .block_order
            .iter()
            .filter_map(|index| self.config.formal.blocks.get(*index))
            .map(|spec| spec.block_type.as_str())
            .collect::<Vec<_>>()
            .join("|");
        info!(order = %labels, "formal block order fixed");
        let mut record = self.record(EventKind::BlockOrderFixed);
        record.block_order = Some(labels);
        self.emit(record);
        self.persist();
    }

    pub(super) fn enter_intro(&mut self) {
        if self.config.intro_screens == 0 {
            self.after_intro();
            return;
        }
        self.intro_screen = 1;
        self.enter_stage(SessionStage::Intro);
        self.publish(SessionNotice::IntroScreen {
            screen: 1,
            of: self.config.intro_screens,
        });
    }

    pub(super) fn on_continue(&mut self) -> bool {
        match self.stage {
            SessionStage::Intro => {
                let mut record = self.record(EventKind::InstructionAdvanced);
                record.input_label = Some(InputKind::Continue.label());
                record.feedback = Some(format!("intro_{}", self.intro_screen));
                self.emit(record);
                if self.intro_screen < self.config.intro_screens {
                    self.intro_screen += 1;
                    self.publish(SessionNotice::IntroScreen {
                        screen: self.intro_screen,
                        of: self.config.intro_screens,
                    });
                } else {
                    self.after_intro();
                }
                true
            }
            SessionStage::CalibrationInstructions => {
                self.emit_instruction_advanced("calibration");
                self.begin_calibration();
                true
            }
            SessionStage::PracticeInstructions => {
                self.emit_instruction_advanced("practice");
                self.start_practice_block();
                true
            }
            _ => false,
        }
    }

    fn emit_instruction_advanced(&mut self, screen: &str) {
        let mut record = self.record(EventKind::InstructionAdvanced);
        record.input_label = Some(InputKind::Continue.label());
        record.feedback = Some(screen.to_string());
        self.emit(record);
    }

    fn after_intro(&mut self) {
        if self.presses.is_none() {
            self.enter_stage(SessionStage::CalibrationInstructions);
        } else {
            self.after_calibration();
        }
    }

    fn after_calibration(&mut self) {
        if self.persisted.practice_passed {
            self.begin_formal();
        } else {
            self.enter_practice_instructions();
        }
    }

    // ---------------------------------------------------------------------
    // Calibration
    // ---------------------------------------------------------------------

    fn begin_calibration(&mut self) {
        if let Some(step) = self.calibration.begin(self.now_ms) {
            self.apply_calibration_step(step);
        }
    }

    pub(super) fn on_calibration_press(&mut self) -> bool {
        let Some(count) = self.calibration.press() else {
            return false;
        };
        debug!(count, "calibration press");
        let mut record = self.record(EventKind::CalibrationPress);
        record.calibration_phase = self.calibration.current_phase().and_then(cell);
        record.calibration_presses = cell(count);
        record.input_label = Some(InputKind::Press.label());
        self.emit(record);
        true
    }

    pub(super) fn on_calibration_phase_end(&mut self) {
        let phase = self.calibration.current_phase();
        let Some(step) = self.calibration.on_phase_end(self.now_ms) else {
            return;
        };
        let presses = self.calibration.phase_presses().last().copied().unwrap_or(0);
        let mut record = self.record(EventKind::CalibrationPhaseEnded);
        record.calibration_phase = phase.and_then(cell);
        record.calibration_presses = cell(presses);
        record.calibration_phase_s = seconds_cell(self.config.calibration.phase_secs);
        self.emit(record);
        self.apply_calibration_step(step);
    }

    pub(super) fn on_calibration_break_end(&mut self) {
        if let Some(step) = self.calibration.on_break_end(self.now_ms) {
            self.apply_calibration_step(step);
        }
    }

    fn apply_calibration_step(&mut self, step: CalibrationStep) {
        match step {
            CalibrationStep::PhaseStarted { phase, ends_at_ms } => {
                self.enter_stage(SessionStage::CalibrationPhase);
                self.timers.arm(TimerKind::CalibrationPhaseEnd, ends_at_ms);
                let mut record = self.record(EventKind::CalibrationPhaseStarted);
                record.calibration_phase = cell(phase);
                record.calibration_phase_s = seconds_cell(self.config.calibration.phase_secs);
                self.emit(record);
                self.publish(SessionNotice::CalibrationPhaseStarted {
                    phase,
                    duration_ms: self.calibration.phase_duration_ms(),
                });
            }
            CalibrationStep::BreakStarted {
                next_phase,
                ends_at_ms,
            } => {
                self.enter_stage(SessionStage::CalibrationBreak);
                self.timers.arm(TimerKind::CalibrationBreakEnd, ends_at_ms);
                self.publish(SessionNotice::CalibrationBreakStarted {
                    next_phase,
                    duration_ms: self.calibration.break_duration_ms(),
                });
            }
            CalibrationStep::Completed(result) => {
                info!(
                    max_presses = result.max_presses,
                    levels = ?result.presses_per_level.0,
                    "calibration completed"
                );
                self.presses = Some(result.presses_per_level);
                self.persisted.calibration_max_presses = Some(result.max_presses);
                let mut record = self.record(EventKind::CalibrationCompleted);
                record.calibration_max_presses = cell(result.max_presses);
                record.calibration_max_rate = seconds_cell(result.max_rate_per_sec);
                record.presses_level_1 = cell(result.presses_per_level.0[0]);
                record.presses_level_2 = cell(result.presses_per_level.0[1]);
                record.presses_level_3 = cell(result.presses_per_level.0[2]);
                self.emit(record);
                self.publish(SessionNotice::CalibrationCompleted {
                    presses_per_level: result.presses_per_level,
                });
                self.persist();
                self.after_calibration();
            }
        }
    }

    // ---------------------------------------------------------------------
    // Practice and comprehension gate
    // ---------------------------------------------------------------------

    fn enter_practice_instructions(&mut self) {
        if self.practice_attempt >= self.config.practice.max_attempts {
            self.end_session(EndReason::FailedPractice, Some("practice attempts exhausted"));
            return;
        }
        self.enter_stage(SessionStage::PracticeInstructions);
    }

    fn start_practice_block(&mut self) {
        self.practice_attempt += 1;
        self.practice_successes = 0;
        let spec = self.config.practice.block.clone();
        self.start_block(&spec, BlockKind::Practice);
    }

    pub(super) fn on_answer(&mut self, question_index: usize, choice: u8) -> bool {
        if self.stage != SessionStage::CheckQuestions {
            return false;
        }
        let Some(mut round) = self.check else {
            return false;
        };
        if question_index != round.question_index {
            return false;
        }
        let Some(question) = self.config.practice.questions.get(question_index).cloned() else {
            return false;
        };
        let correct = choice == question.correct_choice;
        if correct {
            round.correct += 1;
        }
        let mut record = self.record(EventKind::CheckQuestionAnswered);
        record.question_index = cell(question_index);
        record.question_id = Some(question.question_id.clone());
        record.answer_given = cell(choice);
        record.answer_correct = flag_cell(correct);
        record.comprehension_score = cell(round.correct);
        self.emit(record);

        round.question_index += 1;
        self.check = Some(round);
        if round.question_index < self.config.practice.questions.len() {
            self.present_question(round.question_index);
        } else {
            self.evaluate_gate();
        }
        true
    }

    fn enter_check_questions(&mut self) {
        self.check = Some(CheckRound::default());
        if self.config.practice.questions.is_empty() {
            self.evaluate_gate();
            return;
        }
        self.enter_stage(SessionStage::CheckQuestions);
        self.present_question(0);
    }

    fn present_question(&mut self, question_index: usize) {
        if let Some(question) = self.config.practice.questions.get(question_index) {
            let question_id = question.question_id.clone();
            self.publish(SessionNotice::CheckQuestion {
                question_index,
                question_id,
            });
        }
    }

    /// Combined score = successful practice trials + correct answers. Passing
    /// needs the threshold and every answer right.
    fn evaluate_gate(&mut self) {
        let correct = self.check.map(|round| round.correct).unwrap_or(0);
        let question_count = self.config.practice.questions.len() as u32;
        let combined = self.practice_successes + correct;
        let passed = combined >= self.config.practice.pass_score && correct == question_count;
        info!(
            attempt = self.practice_attempt,
            combined, passed, "practice gate evaluated"
        );

        let mut record = self.record(EventKind::PracticeGateEvaluated);
        record.practice_score = cell(self.practice_successes);
        record.comprehension_score = cell(correct);
        record.combined_score = cell(combined);
        record.pass_score = cell(self.config.practice.pass_score);
        record.gate_passed = flag_cell(passed);
        if !passed {
            record.error_kind = Some("PracticeGateFailure".to_string());
        }
        self.emit(record);
        self.publish(SessionNotice::PracticeGate {
            attempt: self.practice_attempt,
            combined_score: combined,
            passed,
        });

        self.check = None;
        self.block = None;
        self.persisted.practice_attempts = self.practice_attempt;
        self.persisted.practice_passed = passed;
        self.persist();

        if passed {
            self.begin_formal();
        } else {
            self.enter_practice_instructions();
        }
    }

    // ---------------------------------------------------------------------
    // Blocks
    // ---------------------------------------------------------------------

    fn begin_formal(&mut self) {
        if self.formal_completed >= self.block_order.len() {
            self.end_session(EndReason::Completed, None);
            return;
        }
        self.start_formal_block(self.formal_completed);
    }

    fn start_formal_block(&mut self, position: usize) {
        let Some(spec) = self
            .block_order
            .get(position)
            .and_then(|index| self.config.formal.blocks.get(*index))
            .cloned()
        else {
            self.end_session(EndReason::Completed, None);
            return;
        };
        self.start_block(&spec, BlockKind::Formal { position });
    }

    fn start_block(&mut self, spec: &BlockSpec, kind: BlockKind) {
        let presses = self.presses.unwrap_or(PressesPerLevel(
            self.config.calibration.minimum_presses,
        ));
        let block_index = match kind {
            BlockKind::Practice => PRACTICE_BLOCK_INDEX,
            BlockKind::Formal { position } => position + 1,
        };
        let goal_distance = self.config.movement.goal_distance;

        // The default room stands in only after a failed, logged layout load.
        self.ensure_grid();
        let plan = {
            let mut planning_room;
            let grid = match self.grid.as_mut() {
                Some(grid) => grid,
                None => {
                    planning_room = GridTopology::default_room();
                    &mut planning_room
                }
            };
            TrialCatalog::new(grid, presses, goal_distance).generate(
                &[spec],
                block_index,
                self.next_trial_index,
                &mut self.rng,
            )
        };
        self.next_trial_index += plan.trial_count();
        for (trial_index, placement) in &plan.degraded {
            self.emit_placement(*trial_index, placement);
        }
        let Some(block) = plan.blocks.into_iter().next() else {
            self.end_session(EndReason::Completed, None);
            return;
        };

        info!(
            block_index,
            block_type = block.block_type.as_str(),
            trials = block.trials.len(),
            "block started"
        );
        self.block = Some(ActiveBlock {
            block,
            kind,
            cursor: 0,
            score: 0,
        });
        self.emit_kind(EventKind::BlockStarted);
        self.start_current_trial();
    }

    /// Called after feedback. Refuses to move on while the current trial's
    /// outcome has not been consumed.
    pub(super) fn advance_trial(&mut self) {
        if let Some(run) = &self.trial {
            if !run.consumed {
                self.emit_error(
                    EventKind::ProtocolViolation,
                    "advance_before_outcome_consumed",
                );
                return;
            }
        }
        self.timers.cancel(TimerKind::MovementCountdown);
        if let Some(mut movement) = self.trial.take().and_then(|run| run.movement) {
            if let Some(grid) = self.grid.as_mut() {
                movement.cleanup(grid);
            }
        }
        let has_next = match self.block.as_mut() {
            Some(active) => {
                active.cursor += 1;
                active.cursor < active.block.trials.len()
            }
            None => false,
        };
        if has_next {
            self.start_current_trial();
        } else {
            self.finish_block();
        }
    }

    fn finish_block(&mut self) {
        let Some(active) = self.block.clone() else {
            return;
        };
        let mut record = self.record(EventKind::BlockEnded);
        record.block_score = cell(active.score);
        self.emit(record);

        match active.kind {
            BlockKind::Practice => self.enter_check_questions(),
            BlockKind::Formal { position } => {
                self.formal_completed = position + 1;
                self.persist();
                self.block = None;
                if self.formal_completed < self.block_order.len() {
                    self.start_rest(self.formal_completed);
                } else {
                    self.end_session(EndReason::Completed, None);
                }
            }
        }
    }

    fn start_rest(&mut self, next_position: usize) {
        self.enter_stage(SessionStage::RestBreak);
        self.checkpoint_log();
        let duration_ms = secs_to_ms(self.config.formal.rest_secs);
        self.timers
            .arm(TimerKind::RestBreakEnd, self.now_ms + duration_ms);
        let mut record = self.record(EventKind::RestBreakStarted);
        record.rest_duration_s = seconds_cell(self.config.formal.rest_secs);
        record.block_position = cell(next_position);
        self.emit(record);
        self.publish(SessionNotice::RestBreakStarted {
            next_block: next_position,
            duration_ms,
        });
    }

    pub(super) fn on_rest_end(&mut self) {
        if self.stage != SessionStage::RestBreak {
            return;
        }
        let mut record = self.record(EventKind::RestBreakEnded);
        record.rest_duration_s = seconds_cell(self.config.formal.rest_secs);
        self.emit(record);
        self.start_formal_block(self.formal_completed);
    }

    // ---------------------------------------------------------------------
    // End
    // ---------------------------------------------------------------------

    pub(super) fn end_session(&mut self, reason: EndReason, detail: Option<&str>) {
        if self.end_reason.is_some() {
            return;
        }
        self.timers.cancel_all();
        if let Some(run) = self.trial.as_mut() {
            if let Some(movement) = run.movement.as_mut() {
                movement.end(self.now_ms, MovementEndCause::ForcedEnd);
                if let Some(grid) = self.grid.as_mut() {
                    movement.cleanup(grid);
                }
            }
        }
        if reason == EndReason::Completed {
            self.persist();
        }

        self.enter_stage(SessionStage::Ended);
        self.end_reason = Some(reason);
        info!(
            session_id = %self.session_id,
            reason = reason.as_str(),
            total_score = self.total_score,
            "session ended"
        );
        let mut record = self.record(EventKind::SessionEnded);
        record.end_reason = Some(reason.as_str().to_string());
        record.error_detail = detail.map(str::to_string);
        self.emit(record);
        self.publish(SessionNotice::SessionEnded { reason });
        self.finalize();
    }
}

fn is_permutation(order: &[usize], count: usize) -> bool {
    if order.len() != count {
        return false;
    }
    let mut seen = vec![false; count];
    for index in order {
        match seen.get_mut(*index) {
            Some(slot) if !*slot => *slot = true,
            _ => return false,
        }
    }
    true
}
