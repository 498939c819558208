//! Deterministic, clock-injected engine for the effort-decision experiment.
//!
//! Components compose bottom-up: grid topology and placement, calibration,
//! trial catalog, decision and movement controllers, the transaction guard,
//! the timer queue, the append-only event log, and the preferences store. The
//! [`session::Session`] orchestrator wires them into one timeline.

pub mod calibration;
pub mod catalog;
pub mod decision;
pub mod event_log;
pub mod grid;
pub mod movement;
pub mod session;
pub mod store;
pub mod synthetic;
pub mod timer;
pub mod transaction;

use rand::rngs::StdRng;
use rand::SeedableRng;

pub use calibration::{presses_per_level, CalibrationResult, CalibrationService};
pub use catalog::{block_order, expand_levels, CatalogPlan, TrialCatalog};
pub use decision::{DecisionPhase, DecisionState, Resolution};
pub use event_log::{log_file_name, EventLog, EventLogError, FinalizedLog};
pub use grid::{
    layout_source_from_config, FileLayout, GridTopology, LayoutError, LayoutSource, Placement,
    PlacementQuality, StaticLayout,
};
pub use movement::{MovementController, MovementParams, MovementSummary};
pub use session::{InputDisposition, Session, SessionDeps, SessionError};
pub use store::{
    load_session_state, save_session_state, MemoryPreferencesStore, PreferencesStore,
    SessionState, StoreError,
};
pub use synthetic::{simulate_session, BotProfile, SimulationReport, SyntheticParticipant};
pub use timer::{TimerKind, TimerQueue};
pub use transaction::{Acceptance, TransactionGuard, ViolationReason};

/// Practice trials share block index 0; formal blocks count from 1.
pub const PRACTICE_BLOCK_INDEX: usize = 0;

/// Derives an independent RNG stream from the session seed and a stream label.
pub fn seeded_rng(seed: u64, stream: &str) -> StdRng {
    StdRng::seed_from_u64(stream_seed(seed, stream))
}

pub fn stream_seed(seed: u64, stream: &str) -> u64 {
    mix64(seed ^ hash_bytes(stream.as_bytes()))
}

fn hash_bytes(input: &[u8]) -> u64 {
    // FNV-1a 64-bit
    let mut hash = 0xcbf29ce484222325_u64;
    for byte in input {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
