use super::*;

use contracts::{cell, flag_cell, seconds_cell};

use crate::grid::Placement;

impl Session {
    /// Row pre-filled with session, block and trial context.
    pub(super) fn record(&self, kind: EventKind) -> EventRecord {
        let participant = &self.config.participant;
        let mut record = EventRecord::new(kind);
        record.session_id = Some(self.session_id.clone());
        record.participant_id = Some(participant.participant_id.clone());
        record.participant_age = participant.age.and_then(cell);
        record.participant_gender = participant.gender.clone();
        record.session_stage = Some(self.stage.as_str().to_string());
        record.total_score = cell(self.total_score);
        if self.practice_attempt > 0 {
            record.practice_attempt = cell(self.practice_attempt);
        }

        if let Some(active) = &self.block {
            record.is_practice = flag_cell(active.is_practice());
            record.block_index = cell(active.block.block_index);
            record.block_type = Some(active.block.block_type.as_str().to_string());
            record.block_ratio = Some(active.block.ratio.label());
            record.block_score = cell(active.score);
            if let BlockKind::Formal { position } = active.kind {
                record.block_position = cell(position);
            }
        }
        if let Some(run) = &self.trial {
            let trial = &run.trial;
            record.trial_index = cell(trial.trial_index);
            record.trial_in_block = cell(trial.trial_in_block);
            record.effort_level = cell(trial.effort_level.as_u8());
            record.required_presses = cell(trial.required_presses);
            record.start_x = cell(trial.start_position.x);
            record.start_y = cell(trial.start_position.y);
            record.goal_x = cell(trial.goal_position.x);
            record.goal_y = cell(trial.goal_position.y);
            record.goal_distance_requested = cell(trial.goal_distance);
            if let Some(decision) = &run.record {
                record.decision_type = Some(decision.decision_type.as_str().to_string());
                record.transaction_token = decision
                    .transaction_token
                    .as_ref()
                    .map(|token| token.as_str().to_string());
            }
            if let Some(movement) = &run.movement {
                record.player_x = cell(movement.player().x);
                record.player_y = cell(movement.player().y);
                record.goal_x = cell(movement.goal().x);
                record.goal_y = cell(movement.goal().y);
            }
        }
        record
    }

    pub(super) fn emit(&mut self, record: EventRecord) {
        if let Err(err) = self.log.append(self.now_ms, record) {
            warn!(error = %err, "failed to encode log row");
        }
        if let Some(failure) = self.log.take_write_failure() {
            self.emit_log_failure(failure);
        }
    }

    /// Queued behind the rows it reports on; appended directly so it cannot
    /// open another episode.
    fn emit_log_failure(&mut self, failure: String) {
        let still_buffered = self.log.buffered_rows();
        let mut record = self.record(EventKind::LogWriteFailure);
        record.error_kind = Some(EventKind::LogWriteFailure.as_str().to_string());
        record.error_detail = Some(format!("{failure}; still_buffered={still_buffered}"));
        record.retry_count = cell(0);
        if let Err(err) = self.log.append(self.now_ms, record) {
            warn!(error = %err, "failed to encode log row");
        }
        self.publish(SessionNotice::Warning {
            message: format!("LogWriteFailure: {failure}"),
        });
    }

    pub(super) fn emit_kind(&mut self, kind: EventKind) {
        let record = self.record(kind);
        self.emit(record);
    }

    pub(super) fn emit_error(&mut self, kind: EventKind, detail: impl Into<String>) {
        let detail = detail.into();
        let mut record = self.record(kind);
        record.error_kind = Some(kind.as_str().to_string());
        record.error_detail = Some(detail.clone());
        self.emit(record);
        self.publish(SessionNotice::Warning {
            message: format!("{}: {detail}", kind.as_str()),
        });
    }

    pub(super) fn emit_placement(&mut self, trial_index: usize, placement: &Placement) {
        warn!(
            trial_index,
            requested = placement.requested_distance,
            actual = placement.actual_distance,
            quality = placement.quality.as_str(),
            "goal placement degraded"
        );
        let mut record = self.record(EventKind::PlacementDegraded);
        record.trial_index = cell(trial_index);
        record.goal_x = cell(placement.position.x);
        record.goal_y = cell(placement.position.y);
        record.goal_distance_requested = cell(placement.requested_distance);
        record.goal_distance_actual = cell(placement.actual_distance);
        record.placement_quality = Some(placement.quality.as_str().to_string());
        record.error_kind = Some(EventKind::PlacementDegraded.as_str().to_string());
        record.error_detail = Some(format!("tolerance={}", placement.tolerance));
        self.emit(record);
    }

    pub(super) fn outcome_cells(record: &mut EventRecord, outcome: &TrialOutcome) {
        record.outcome_type = Some(outcome.outcome_type.as_str().to_string());
        record.reward_collected = flag_cell(outcome.reward_collected);
        record.reward_points = cell(outcome.reward_points);
        record.movement_duration_s = seconds_cell(outcome.movement_duration_seconds);
        record.button_presses = cell(outcome.button_presses);
        record.time_per_press_s = outcome.time_per_press_seconds.and_then(seconds_cell);
        record.is_rushing = flag_cell(outcome.is_rushing);
    }

    /// Stages the session state and flushes it. A failing store is logged and
    /// the session carries on.
    pub(super) fn persist(&mut self) {
        self.persisted.presses_per_level = self.presses;
        self.persisted.block_order = Some(self.block_order.clone());
        self.persisted.completed_blocks = self.formal_completed;
        self.persisted.total_score = self.total_score;
        self.persisted.processed_tokens = self.guard.processed_tokens();
        if let Err(err) = save_session_state(self.store.as_mut(), &self.persisted) {
            warn!(error = %err, "preferences write failed");
            self.emit_error(EventKind::StoreFailure, err.to_string());
        }
    }

    /// Appends an `UploadFailure` row after the submitter gave up. Allowed after
    /// the session has ended; the row reaches the local file and any later render.
    pub fn record_upload_failure(&mut self, attempts: u32, detail: &str) {
        warn!(attempts, detail, "log upload failed");
        let mut record = self.record(EventKind::UploadFailure);
        record.error_kind = Some(EventKind::UploadFailure.as_str().to_string());
        record.error_detail = Some(detail.to_string());
        record.retry_count = cell(attempts);
        self.emit(record);
    }

    /// Checkpoint retry of buffered log rows.
    pub(super) fn checkpoint_log(&mut self) {
        let pending = self.log.buffered_rows();
        if pending == 0 {
            return;
        }
        let recovered = self.log.retry_pending();
        if recovered > 0 {
            info!(recovered, "buffered log rows written");
            let mut record = self.record(EventKind::LogWriteRecovered);
            record.retry_count = cell(recovered);
            record.error_detail = Some(format!("still_buffered={}", self.log.buffered_rows()));
            self.emit(record);
        }
    }
}
