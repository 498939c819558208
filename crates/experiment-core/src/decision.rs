//! Decision phase: present an effort cue, resolve Work/Skip or time out once.

use contracts::{DecisionType, EffortLevel};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecisionState {
    Idle,
    Presenting { presented_ms: u64, deadline_ms: u64 },
    Decided { decision: DecisionType, reaction_time_secs: f64 },
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub decision: DecisionType,
    /// `None` for timeouts.
    pub reaction_time_secs: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct DecisionPhase {
    trial_index: usize,
    effort_level: EffortLevel,
    window_ms: u64,
    state: DecisionState,
}

impl DecisionPhase {
    pub fn new(trial_index: usize, effort_level: EffortLevel, window_ms: u64) -> Self {
        Self {
            trial_index,
            effort_level,
            window_ms,
            state: DecisionState::Idle,
        }
    }

    pub fn trial_index(&self) -> usize {
        self.trial_index
    }

    pub fn effort_level(&self) -> EffortLevel {
        self.effort_level
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    pub fn state(&self) -> DecisionState {
        self.state
    }

    /// Enters `Presenting`; returns the response deadline.
    pub fn present(&mut self, now_ms: u64) -> Option<u64> {
        if self.state != DecisionState::Idle {
            return None;
        }
        let deadline_ms = now_ms + self.window_ms;
        self.state = DecisionState::Presenting {
            presented_ms: now_ms,
            deadline_ms,
        };
        Some(deadline_ms)
    }

    /// First qualifying choice wins; anything after resolution is ignored.
    pub fn choose(&mut self, now_ms: u64, decision: DecisionType) -> Option<Resolution> {
        let DecisionState::Presenting {
            presented_ms,
            deadline_ms,
        } = self.state
        else {
            return None;
        };
        if decision == DecisionType::Timeout || now_ms > deadline_ms {
            return None;
        }
        let reaction_time_secs = now_ms.saturating_sub(presented_ms) as f64 / 1000.0;
        self.state = DecisionState::Decided {
            decision,
            reaction_time_secs,
        };
        Some(Resolution {
            decision,
            reaction_time_secs: Some(reaction_time_secs),
        })
    }

    pub fn expire(&mut self, now_ms: u64) -> Option<Resolution> {
        let DecisionState::Presenting { deadline_ms, .. } = self.state else {
            return None;
        };
        if now_ms < deadline_ms {
            return None;
        }
        self.state = DecisionState::TimedOut;
        Some(Resolution {
            decision: DecisionType::Timeout,
            reaction_time_secs: None,
        })
    }

    pub fn is_resolved(&self) -> bool {
        matches!(
            self.state,
            DecisionState::Decided { .. } | DecisionState::TimedOut
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_choice_is_final() {
        let mut phase = DecisionPhase::new(0, EffortLevel::Two, 2_500);
        assert_eq!(phase.present(1_000), Some(3_500));
        let resolution = phase.choose(1_640, DecisionType::Work).expect("work resolves");
        assert_eq!(resolution.decision, DecisionType::Work);
        assert!((resolution.reaction_time_secs.expect("rt") - 0.64).abs() < 1e-9);
        assert_eq!(phase.choose(1_700, DecisionType::Skip), None);
        assert_eq!(phase.expire(3_500), None);
        assert!(phase.is_resolved());
    }

    #[test]
    fn silence_times_out_at_the_deadline() {
        let mut phase = DecisionPhase::new(3, EffortLevel::Three, 2_500);
        phase.present(0);
        assert_eq!(phase.expire(2_499), None);
        let resolution = phase.expire(2_500).expect("timeout");
        assert_eq!(resolution.decision, DecisionType::Timeout);
        assert_eq!(resolution.reaction_time_secs, None);
        assert_eq!(phase.choose(2_600, DecisionType::Work), None);
        assert_eq!(phase.state(), DecisionState::TimedOut);
    }

    #[test]
    fn choices_before_presentation_are_ignored() {
        let mut phase = DecisionPhase::new(1, EffortLevel::One, 2_500);
        assert_eq!(phase.choose(10, DecisionType::Work), None);
        assert_eq!(phase.state(), DecisionState::Idle);
    }
}
