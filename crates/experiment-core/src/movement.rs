//! Movement/effort execution: press-gated grid steps toward a goal under a countdown.
//!
//! Collecting the goal does not end the trial. Only the countdown or a forced
//! end does, and the transition to `Ended` happens exactly once.

use contracts::{
    Direction, GridPos, MovementEndCause, OutcomeType, TransactionToken, Trial, TrialOutcome,
};
use rand::Rng;

use crate::grid::{GridTopology, Placement, PlacementQuality};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementState {
    Setup,
    Active { started_ms: u64, ends_at_ms: u64 },
    Ended { started_ms: u64, ended_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementParams {
    pub countdown_ms: u64,
    pub goal_distance: u32,
    pub rushing_threshold_secs: f64,
    pub reward_points: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetupReport {
    pub start: GridPos,
    pub start_replaced: bool,
    pub goal: Placement,
    pub goal_replanned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEffect {
    None,
    Moved { from: GridPos, to: GridPos },
    Blocked { at: GridPos, toward: GridPos },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PressReport {
    pub button_presses: u32,
    /// Counter after this press; 0 when the press completed a step.
    pub press_in_step: u32,
    pub direction: Direction,
    pub effect: StepEffect,
    pub collected_now: bool,
    pub position: GridPos,
    pub steps_taken: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MovementSummary {
    pub cause: MovementEndCause,
    pub outcome: TrialOutcome,
    pub steps_taken: u32,
    pub final_position: GridPos,
    pub countdown_secs: f64,
}

#[derive(Debug, Clone)]
pub struct MovementController {
    trial: Trial,
    token: TransactionToken,
    params: MovementParams,
    state: MovementState,
    player: GridPos,
    goal: GridPos,
    presses_per_step: u32,
    press_in_step: u32,
    button_presses: u32,
    steps_taken: u32,
    collected_at_ms: Option<u64>,
    released: bool,
}

impl MovementController {
    /// Places the participant and the goal. The planned start is kept when it is
    /// still free, otherwise one is drawn from the free list; the planned goal is
    /// kept when it is still free at the exact distance, otherwise re-placed.
    pub fn setup<R: Rng + ?Sized>(
        trial: &Trial,
        token: TransactionToken,
        params: MovementParams,
        grid: &mut GridTopology,
        rng: &mut R,
    ) -> (Self, SetupReport) {
        let planned_start_usable =
            grid.is_walkable(trial.start_position) && !grid.is_occupied(trial.start_position);
        let (start, start_replaced) = if planned_start_usable {
            (trial.start_position, false)
        } else {
            match grid.random_available_position(rng) {
                Some(pos) => (pos, true),
                None => (trial.start_position, false),
            }
        };
        grid.occupy(start);

        let goal_distance = params.goal_distance;
        let planned_goal = trial.goal_position;
        let planned_goal_usable = planned_goal != start
            && grid.is_walkable(planned_goal)
            && grid.is_interior(planned_goal)
            && !grid.is_occupied(planned_goal)
            && start.manhattan(planned_goal) == goal_distance;
        let (goal, goal_replanned) = if planned_goal_usable {
            (
                Placement {
                    position: planned_goal,
                    requested_distance: goal_distance,
                    actual_distance: goal_distance,
                    tolerance: 0,
                    quality: PlacementQuality::Exact,
                },
                false,
            )
        } else {
            (grid.position_at_distance(start, goal_distance, rng), true)
        };
        if goal.position != start {
            grid.occupy(goal.position);
        }

        let controller = Self {
            trial: trial.clone(),
            token,
            params,
            state: MovementState::Setup,
            player: start,
            goal: goal.position,
            presses_per_step: trial.required_presses.max(1),
            press_in_step: 0,
            button_presses: 0,
            steps_taken: 0,
            collected_at_ms: None,
            released: false,
        };
        let report = SetupReport {
            start,
            start_replaced,
            goal,
            goal_replanned,
        };
        (controller, report)
    }

    pub fn trial(&self) -> &Trial {
        &self.trial
    }

    pub fn token(&self) -> &TransactionToken {
        &self.token
    }

    pub fn state(&self) -> MovementState {
        self.state
    }

    pub fn player(&self) -> GridPos {
        self.player
    }

    pub fn goal(&self) -> GridPos {
        self.goal
    }

    pub fn presses_per_step(&self) -> u32 {
        self.presses_per_step
    }

    pub fn reward_collected(&self) -> bool {
        self.collected_at_ms.is_some()
    }

    pub fn countdown_ms(&self) -> u64 {
        self.params.countdown_ms
    }

    /// Starts the countdown; returns its deadline.
    pub fn activate(&mut self, now_ms: u64) -> Option<u64> {
        if self.state != MovementState::Setup {
            return None;
        }
        let ends_at_ms = now_ms + self.params.countdown_ms;
        self.state = MovementState::Active {
            started_ms: now_ms,
            ends_at_ms,
        };
        Some(ends_at_ms)
    }

    pub fn press(
        &mut self,
        now_ms: u64,
        direction: Direction,
        grid: &mut GridTopology,
    ) -> Option<PressReport> {
        let MovementState::Active { .. } = self.state else {
            return None;
        };

        self.button_presses += 1;
        self.press_in_step += 1;

        let mut effect = StepEffect::None;
        let mut collected_now = false;
        if self.press_in_step >= self.presses_per_step {
            self.press_in_step = 0;
            let from = self.player;
            let target = from.step(direction);
            let reaches_goal = target == self.goal && self.collected_at_ms.is_none();
            if reaches_goal {
                grid.release(target);
            }
            if grid.is_walkable(target) && !grid.is_occupied(target) {
                grid.release(from);
                grid.occupy(target);
                self.player = target;
                self.steps_taken += 1;
                effect = StepEffect::Moved { from, to: target };
                if reaches_goal {
                    self.collected_at_ms = Some(now_ms);
                    collected_now = true;
                }
            } else {
                effect = StepEffect::Blocked {
                    at: from,
                    toward: target,
                };
            }
        }

        Some(PressReport {
            button_presses: self.button_presses,
            press_in_step: self.press_in_step,
            direction,
            effect,
            collected_now,
            position: self.player,
            steps_taken: self.steps_taken,
        })
    }

    /// Ends the task once; later calls return `None`.
    pub fn end(&mut self, now_ms: u64, cause: MovementEndCause) -> Option<MovementSummary> {
        let started_ms = match self.state {
            MovementState::Setup => now_ms,
            MovementState::Active { started_ms, .. } => started_ms,
            MovementState::Ended { .. } => return None,
        };
        self.state = MovementState::Ended {
            started_ms,
            ended_ms: now_ms,
        };

        let finished_ms = self.collected_at_ms.unwrap_or(now_ms);
        let movement_duration_seconds = finished_ms.saturating_sub(started_ms) as f64 / 1000.0;
        let time_per_press_seconds =
            movement_duration_seconds / f64::from(self.trial.required_presses.max(1));
        let reward_collected = self.collected_at_ms.is_some();
        let outcome = TrialOutcome {
            trial_index: self.trial.trial_index,
            outcome_type: if reward_collected {
                OutcomeType::Success
            } else {
                OutcomeType::Failure
            },
            reward_collected,
            reward_points: if reward_collected {
                self.params.reward_points
            } else {
                0
            },
            movement_duration_seconds,
            button_presses: self.button_presses,
            time_per_press_seconds: Some(time_per_press_seconds),
            is_rushing: time_per_press_seconds < self.params.rushing_threshold_secs,
        };

        Some(MovementSummary {
            cause,
            outcome,
            steps_taken: self.steps_taken,
            final_position: self.player,
            countdown_secs: self.params.countdown_ms as f64 / 1000.0,
        })
    }

    /// Releases the cells held by the participant and an uncollected goal.
    pub fn cleanup(&mut self, grid: &mut GridTopology) {
        if self.released {
            return;
        }
        grid.release(self.player);
        if self.collected_at_ms.is_none() {
            grid.release(self.goal);
        }
        self.released = true;
    }
}
