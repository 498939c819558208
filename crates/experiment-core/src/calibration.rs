//! Effort calibration: fixed-length input-rate phases separated by breaks.
//!
//! The peak phase (not the mean) is the baseline for every effort level.

use contracts::{secs_to_ms, CalibrationConfig, PressesPerLevel, EFFORT_LEVEL_COUNT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    Waiting,
    Phase { phase: u32, started_ms: u64 },
    Break { next_phase: u32 },
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationStep {
    PhaseStarted { phase: u32, ends_at_ms: u64 },
    BreakStarted { next_phase: u32, ends_at_ms: u64 },
    Completed(CalibrationResult),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationResult {
    pub phase_presses: Vec<u32>,
    pub max_presses: u32,
    pub max_rate_per_sec: f64,
    pub presses_per_level: PressesPerLevel,
}

#[derive(Debug, Clone)]
pub struct CalibrationService {
    config: CalibrationConfig,
    state: CalibrationState,
    phase_presses: Vec<u32>,
    current_presses: u32,
}

impl CalibrationService {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            state: CalibrationState::Waiting,
            phase_presses: Vec::new(),
            current_presses: 0,
        }
    }

    pub fn state(&self) -> CalibrationState {
        self.state
    }

    pub fn phase_presses(&self) -> &[u32] {
        &self.phase_presses
    }

    pub fn phase_duration_ms(&self) -> u64 {
        secs_to_ms(self.config.phase_secs)
    }

    pub fn break_duration_ms(&self) -> u64 {
        secs_to_ms(self.config.break_secs)
    }

    pub fn begin(&mut self, now_ms: u64) -> Option<CalibrationStep> {
        if self.state != CalibrationState::Waiting {
            return None;
        }
        self.phase_presses.clear();
        Some(self.start_phase(1, now_ms))
    }

    /// Counts a press during an active phase; returns the running count for the phase.
    pub fn press(&mut self) -> Option<u32> {
        match self.state {
            CalibrationState::Phase { .. } => {
                self.current_presses += 1;
                Some(self.current_presses)
            }
            _ => None,
        }
    }

    pub fn current_phase(&self) -> Option<u32> {
        match self.state {
            CalibrationState::Phase { phase, .. } => Some(phase),
            _ => None,
        }
    }

    pub fn on_phase_end(&mut self, now_ms: u64) -> Option<CalibrationStep> {
        let CalibrationState::Phase { phase, .. } = self.state else {
            return None;
        };
        self.phase_presses.push(self.current_presses);
        self.current_presses = 0;

        if phase < self.config.phase_count {
            let next_phase = phase + 1;
            self.state = CalibrationState::Break { next_phase };
            return Some(CalibrationStep::BreakStarted {
                next_phase,
                ends_at_ms: now_ms + self.break_duration_ms(),
            });
        }

        self.state = CalibrationState::Completed;
        Some(CalibrationStep::Completed(self.result()))
    }

    pub fn on_break_end(&mut self, now_ms: u64) -> Option<CalibrationStep> {
        let CalibrationState::Break { next_phase } = self.state else {
            return None;
        };
        Some(self.start_phase(next_phase, now_ms))
    }

    pub fn result(&self) -> CalibrationResult {
        let max_presses = self.phase_presses.iter().copied().max().unwrap_or(0);
        CalibrationResult {
            phase_presses: self.phase_presses.clone(),
            max_presses,
            max_rate_per_sec: rate_per_sec(max_presses, self.config.phase_secs),
            presses_per_level: presses_per_level(
                &self.phase_presses,
                self.config.phase_secs,
                &self.config.level_fractions,
                &self.config.minimum_presses,
            ),
        }
    }

    fn start_phase(&mut self, phase: u32, now_ms: u64) -> CalibrationStep {
        self.current_presses = 0;
        self.state = CalibrationState::Phase {
            phase,
            started_ms: now_ms,
        };
        CalibrationStep::PhaseStarted {
            phase,
            ends_at_ms: now_ms + self.phase_duration_ms(),
        }
    }
}

fn rate_per_sec(presses: u32, phase_secs: f64) -> f64 {
    if phase_secs <= 0.0 {
        return 0.0;
    }
    f64::from(presses) / phase_secs
}

/// `round(max(phase presses) / phase_secs * fraction[i])`, clamped to `minimums[i]`.
/// Exact halves round to even.
pub fn presses_per_level(
    phase_presses: &[u32],
    phase_secs: f64,
    fractions: &[f64; EFFORT_LEVEL_COUNT],
    minimums: &[u32; EFFORT_LEVEL_COUNT],
) -> PressesPerLevel {
    let max_rate = rate_per_sec(
        phase_presses.iter().copied().max().unwrap_or(0),
        phase_secs,
    );
    let mut levels = [0_u32; EFFORT_LEVEL_COUNT];
    for (index, level) in levels.iter_mut().enumerate() {
        let raw = (max_rate * fractions[index]).round_ties_even();
        let raw = if raw.is_finite() && raw > 0.0 {
            raw as u32
        } else {
            0
        };
        *level = raw.max(minimums[index]);
    }
    PressesPerLevel(levels)
}
