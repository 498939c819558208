//! At-most-once processing of movement outcomes keyed by decision tokens.

use std::collections::BTreeMap;

use contracts::{DecisionType, OutcomeSignal, TransactionToken, TrialOutcome};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenStatus {
    Minted,
    Pending,
    Processed,
}

#[derive(Debug, Clone)]
struct TokenEntry {
    trial_index: usize,
    status: TokenStatus,
    pending: Option<OutcomeSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViolationReason {
    UnknownToken,
    NonWorkTrial(DecisionType),
    TrialMismatch { expected: usize, got: usize },
    /// Signal for a token whose movement task has not ended yet.
    MovementStillActive,
    /// Redelivered payload differs from the one the movement task produced.
    PayloadMismatch,
}

impl ViolationReason {
    pub fn detail(&self) -> String {
        match self {
            Self::UnknownToken => "unknown_token".to_string(),
            Self::NonWorkTrial(decision) => format!("signal_for_{}_trial", decision.as_str()),
            Self::TrialMismatch { expected, got } => {
                format!("token_for_trial_{expected}_signal_for_trial_{got}")
            }
            Self::MovementStillActive => "movement_still_active".to_string(),
            Self::PayloadMismatch => "payload_mismatch".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Acceptance {
    /// Held until the settling delay elapses, then committed.
    Pending,
    Duplicate,
    Violation(ViolationReason),
}

#[derive(Debug, Clone, Default)]
pub struct TransactionGuard {
    tokens: BTreeMap<TransactionToken, TokenEntry>,
    non_work_trials: BTreeMap<usize, DecisionType>,
}

impl TransactionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh v4 token for a Work decision. The bytes come from the
    /// session RNG so a seeded session reproduces its tokens.
    pub fn mint<R: Rng + ?Sized>(&mut self, trial_index: usize, rng: &mut R) -> TransactionToken {
        loop {
            let bytes: [u8; 16] = rng.gen();
            let token = TransactionToken::new(
                uuid::Builder::from_random_bytes(bytes)
                    .into_uuid()
                    .to_string(),
            );
            if self.tokens.contains_key(&token) {
                continue;
            }
            self.tokens.insert(
                token.clone(),
                TokenEntry {
                    trial_index,
                    status: TokenStatus::Minted,
                    pending: None,
                },
            );
            return token;
        }
    }

    /// Records a Skip/Timeout decision so late signals for that trial are
    /// reported as protocol violations with a precise reason.
    pub fn record_non_work(&mut self, trial_index: usize, decision: DecisionType) {
        self.non_work_trials.insert(trial_index, decision);
    }

    /// Marks tokens processed in an earlier run of this session.
    pub fn restore_processed(&mut self, tokens: impl IntoIterator<Item = TransactionToken>) {
        for token in tokens {
            self.tokens.insert(
                token,
                TokenEntry {
                    trial_index: usize::MAX,
                    status: TokenStatus::Processed,
                    pending: None,
                },
            );
        }
    }

    pub fn accept(&mut self, signal: OutcomeSignal) -> Acceptance {
        let Some(entry) = self.tokens.get_mut(&signal.token) else {
            if let Some(decision) = self.non_work_trials.get(&signal.trial_index) {
                return Acceptance::Violation(ViolationReason::NonWorkTrial(*decision));
            }
            return Acceptance::Violation(ViolationReason::UnknownToken);
        };
        match entry.status {
            TokenStatus::Pending | TokenStatus::Processed => Acceptance::Duplicate,
            TokenStatus::Minted if entry.trial_index != signal.trial_index => {
                Acceptance::Violation(ViolationReason::TrialMismatch {
                    expected: entry.trial_index,
                    got: signal.trial_index,
                })
            }
            TokenStatus::Minted => {
                entry.status = TokenStatus::Pending;
                entry.pending = Some(signal);
                Acceptance::Pending
            }
        }
    }

    /// Check-and-set: the first commit of a pending token yields its outcome,
    /// every later call yields `None`.
    pub fn commit(&mut self, token: &TransactionToken) -> Option<TrialOutcome> {
        let entry = self.tokens.get_mut(token)?;
        if entry.status != TokenStatus::Pending {
            return None;
        }
        entry.status = TokenStatus::Processed;
        entry.pending.take().map(|signal| signal.outcome)
    }

    pub fn pending_token(&self) -> Option<&TransactionToken> {
        self.tokens
            .iter()
            .find(|(_, entry)| entry.status == TokenStatus::Pending)
            .map(|(token, _)| token)
    }

    pub fn is_processed(&self, token: &TransactionToken) -> bool {
        self.tokens
            .get(token)
            .is_some_and(|entry| entry.status == TokenStatus::Processed)
    }

    pub fn processed_tokens(&self) -> Vec<TransactionToken> {
        self.tokens
            .iter()
            .filter(|(_, entry)| entry.status == TokenStatus::Processed)
            .map(|(token, _)| token.clone())
            .collect()
    }
}
