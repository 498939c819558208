//! Synthetic participant and a virtual-clock driver that runs a session to its end.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use contracts::{
    Direction, EffortLevel, EndReason, ExperimentConfig, GridPos, InputKind, SessionNotice,
    SessionStage,
};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::seeded_rng;
use crate::session::Session;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BotProfile {
    /// Delay before pressing continue on an instruction screen.
    pub continue_delay_ms: u64,
    pub calibration_interval_ms: u64,
    pub decision_latency_ms: u64,
    /// Probability of choosing Work at effort levels 1, 2 and 3.
    pub work_probability: [f64; 3],
    /// Used instead of `work_probability` while practising.
    pub practice_work_probability: f64,
    /// Probability of letting a formal response window run out.
    pub timeout_probability: f64,
    pub move_interval_ms: u64,
    pub answer_accuracy: f64,
}

impl Default for BotProfile {
    fn default() -> Self {
        Self {
            continue_delay_ms: 800,
            calibration_interval_ms: 110,
            decision_latency_ms: 700,
            work_probability: [0.95, 0.8, 0.6],
            practice_work_probability: 1.0,
            timeout_probability: 0.02,
            move_interval_ms: 140,
            answer_accuracy: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BotAction {
    Input(InputKind),
    MoveTick { trial_index: usize },
}

/// Heap entry ordered by due time, then scheduling order. The action rides
/// along and takes no part in the ordering.
#[derive(Debug, Clone, Copy)]
struct Scheduled {
    at_ms: u64,
    sequence: u64,
    action: BotAction,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        (self.at_ms, self.sequence) == (other.at_ms, other.sequence)
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.at_ms, self.sequence).cmp(&(other.at_ms, other.sequence))
    }
}

#[derive(Debug, Clone, Copy)]
struct Pursuit {
    trial_index: usize,
    position: GridPos,
    goal: GridPos,
}

#[derive(Debug)]
pub struct SyntheticParticipant {
    profile: BotProfile,
    rng: StdRng,
    correct_choices: Vec<u8>,
    queue: BinaryHeap<Reverse<Scheduled>>,
    next_sequence: u64,
    pursuit: Option<Pursuit>,
    practising: bool,
}

impl SyntheticParticipant {
    pub fn new(profile: BotProfile, seed: u64, config: &ExperimentConfig) -> Self {
        Self {
            profile,
            rng: seeded_rng(seed, "synthetic-participant"),
            correct_choices: config
                .practice
                .questions
                .iter()
                .map(|question| question.correct_choice)
                .collect(),
            queue: BinaryHeap::new(),
            next_sequence: 0,
            pursuit: None,
            practising: false,
        }
    }

    fn schedule(&mut self, at_ms: u64, action: BotAction) {
        self.queue.push(Reverse(Scheduled {
            at_ms,
            sequence: self.next_sequence,
            action,
        }));
        self.next_sequence += 1;
    }

    fn next_at(&self) -> Option<u64> {
        self.queue.peek().map(|Reverse(scheduled)| scheduled.at_ms)
    }

    fn pop(&mut self) -> Option<(u64, BotAction)> {
        let Reverse(scheduled) = self.queue.pop()?;
        Some((scheduled.at_ms, scheduled.action))
    }

    /// Reacts to a notice published at `now_ms` by scheduling future inputs.
    pub fn observe(&mut self, now_ms: u64, notice: &SessionNotice) {
        match notice {
            SessionNotice::IntroScreen { .. } => {
                self.schedule(
                    now_ms + self.profile.continue_delay_ms,
                    BotAction::Input(InputKind::Continue),
                );
            }
            SessionNotice::StageEntered { stage, .. } => {
                if *stage == SessionStage::PracticeInstructions {
                    self.practising = true;
                }
                if matches!(
                    stage,
                    SessionStage::CalibrationInstructions | SessionStage::PracticeInstructions
                ) {
                    self.schedule(
                        now_ms + self.profile.continue_delay_ms,
                        BotAction::Input(InputKind::Continue),
                    );
                }
            }
            SessionNotice::CalibrationPhaseStarted { duration_ms, .. } => {
                let interval = self.profile.calibration_interval_ms.max(1);
                let mut at = now_ms + interval;
                while at < now_ms + duration_ms {
                    self.schedule(at, BotAction::Input(InputKind::Press));
                    at += interval;
                }
            }
            SessionNotice::DecisionPresented { effort_level, .. } => {
                self.pursuit = None;
                let timeout_probability = if self.practising {
                    0.0
                } else {
                    self.profile.timeout_probability.clamp(0.0, 1.0)
                };
                if self.rng.gen_bool(timeout_probability) {
                    return;
                }
                let input = if self.rng.gen_bool(self.work_probability(*effort_level)) {
                    InputKind::Work
                } else {
                    InputKind::Skip
                };
                let jitter = self.rng.gen_range(0..=self.profile.decision_latency_ms / 4);
                self.schedule(
                    now_ms + self.profile.decision_latency_ms + jitter,
                    BotAction::Input(input),
                );
            }
            SessionNotice::MovementStarted {
                trial_index,
                start,
                goal,
                ..
            } => {
                self.pursuit = Some(Pursuit {
                    trial_index: *trial_index,
                    position: *start,
                    goal: *goal,
                });
                self.schedule(
                    now_ms + self.profile.move_interval_ms,
                    BotAction::MoveTick {
                        trial_index: *trial_index,
                    },
                );
            }
            SessionNotice::PlayerMoved { position } => {
                if let Some(pursuit) = self.pursuit.as_mut() {
                    pursuit.position = *position;
                }
            }
            SessionNotice::GoalCollected { .. } | SessionNotice::TrialCompleted { .. } => {
                self.pursuit = None;
            }
            SessionNotice::PracticeGate { passed, .. } => {
                self.practising = !*passed;
            }
            SessionNotice::CheckQuestion { question_index, .. } => {
                let correct = self.correct_choices.get(*question_index).copied().unwrap_or(1);
                let choice = if self.rng.gen_bool(self.profile.answer_accuracy.clamp(0.0, 1.0)) {
                    correct
                } else {
                    correct % 3 + 1
                };
                self.schedule(
                    now_ms + self.profile.continue_delay_ms,
                    BotAction::Input(InputKind::Answer {
                        question_index: *question_index,
                        choice,
                    }),
                );
            }
            _ => {}
        }
    }

    fn work_probability(&self, level: EffortLevel) -> f64 {
        if self.practising {
            return self.profile.practice_work_probability.clamp(0.0, 1.0);
        }
        self.profile.work_probability[level.index()].clamp(0.0, 1.0)
    }

    /// Resolves a due action into an input, rescheduling movement ticks.
    fn resolve(&mut self, at_ms: u64, action: BotAction) -> Option<InputKind> {
        match action {
            BotAction::Input(input) => Some(input),
            BotAction::MoveTick { trial_index } => {
                let pursuit = self.pursuit?;
                if pursuit.trial_index != trial_index {
                    return None;
                }
                self.schedule(
                    at_ms + self.profile.move_interval_ms,
                    BotAction::MoveTick { trial_index },
                );
                Some(InputKind::Move {
                    direction: toward(pursuit.position, pursuit.goal),
                })
            }
        }
    }
}

/// Horizontal first, then vertical.
fn toward(from: GridPos, to: GridPos) -> Direction {
    if to.x > from.x {
        Direction::Right
    } else if to.x < from.x {
        Direction::Left
    } else if to.y < from.y {
        Direction::Up
    } else {
        Direction::Down
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationReport {
    pub session_id: String,
    pub end_reason: Option<EndReason>,
    pub total_score: u32,
    pub trials_completed: usize,
    pub log_rows: usize,
    pub buffered_rows: usize,
    pub virtual_ms: u64,
}

/// Drives a fresh session on a virtual clock until it ends or `max_ms` passes.
pub fn simulate_session(
    session: &mut Session,
    bot: &mut SyntheticParticipant,
    max_ms: u64,
) -> SimulationReport {
    if session.start(0).is_ok() {
        feed(session, bot);
    }

    while !session.is_ended() {
        let bot_at = bot.next_at();
        let timer_at = session.next_deadline();
        let at_ms = match (bot_at, timer_at) {
            (Some(bot_at), Some(timer_at)) => bot_at.min(timer_at),
            (Some(at), None) | (None, Some(at)) => at,
            (None, None) => break,
        };
        if at_ms > max_ms {
            break;
        }

        if bot_at == Some(at_ms) {
            let Some((due_ms, action)) = bot.pop() else {
                break;
            };
            if let Some(input) = bot.resolve(due_ms, action) {
                if let Err(err) = session.handle_input(due_ms, input) {
                    debug!(error = %err, "synthetic input rejected");
                }
            }
        } else {
            session.advance_to(at_ms);
        }
        feed(session, bot);
    }

    let status = session.status();
    SimulationReport {
        session_id: status.session_id,
        end_reason: status.end_reason,
        total_score: status.total_score,
        trials_completed: status.trials_completed,
        log_rows: session.records().len(),
        buffered_rows: status.buffered_log_rows,
        virtual_ms: session.now_ms(),
    }
}

fn feed(session: &mut Session, bot: &mut SyntheticParticipant) {
    let now_ms = session.now_ms();
    for notice in session.drain_notices() {
        let at_ms = match &notice {
            SessionNotice::StageEntered { at_ms, .. } => *at_ms,
            _ => now_ms,
        };
        bot.observe(at_ms, &notice);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pursuit_moves_horizontally_first() {
        let from = GridPos::new(3, 3);
        assert_eq!(toward(from, GridPos::new(5, 1)), Direction::Right);
        assert_eq!(toward(from, GridPos::new(1, 6)), Direction::Left);
        assert_eq!(toward(from, GridPos::new(3, 1)), Direction::Up);
        assert_eq!(toward(from, GridPos::new(3, 7)), Direction::Down);
    }

    #[test]
    fn calibration_notice_schedules_taps_for_the_phase() {
        let config = ExperimentConfig::default();
        let mut bot = SyntheticParticipant::new(BotProfile::default(), 1, &config);
        bot.observe(
            1_000,
            &SessionNotice::CalibrationPhaseStarted {
                phase: 1,
                duration_ms: 5_000,
            },
        );
        let mut taps = 0;
        while let Some((at_ms, action)) = bot.pop() {
            assert!(at_ms < 6_000);
            assert_eq!(action, BotAction::Input(InputKind::Press));
            taps += 1;
        }
        assert_eq!(taps, 45);
        assert!(bot.queue.is_empty());
    }

    #[test]
    fn same_instant_actions_keep_their_scheduling_order() {
        let config = ExperimentConfig::default();
        let mut bot = SyntheticParticipant::new(BotProfile::default(), 1, &config);
        bot.schedule(500, BotAction::Input(InputKind::Skip));
        bot.schedule(200, BotAction::Input(InputKind::Continue));
        bot.schedule(500, BotAction::MoveTick { trial_index: 4 });

        assert_eq!(bot.next_at(), Some(200));
        assert_eq!(bot.pop(), Some((200, BotAction::Input(InputKind::Continue))));
        assert_eq!(bot.pop(), Some((500, BotAction::Input(InputKind::Skip))));
        assert_eq!(bot.pop(), Some((500, BotAction::MoveTick { trial_index: 4 })));
        assert_eq!(bot.pop(), None);
        assert!(bot.queue.is_empty());
    }
}
