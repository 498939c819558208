//! Trial catalog: block order permutations and ratio-exact, shuffled trial blocks.

use contracts::{Block, BlockSpec, EffortLevel, GridPos, PressesPerLevel, Trial};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::grid::{GridTopology, Placement};

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogPlan {
    pub blocks: Vec<Block>,
    /// Goal placements that could not honour the exact distance, by trial index.
    pub degraded: Vec<(usize, Placement)>,
}

impl CatalogPlan {
    pub fn trial_count(&self) -> usize {
        self.blocks.iter().map(|block| block.trials.len()).sum()
    }
}

/// One random permutation of `0..count`.
pub fn block_order<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Vec<usize> {
    let mut order = (0..count).collect::<Vec<_>>();
    order.shuffle(rng);
    order
}

/// Expands a ratio policy into exactly `count_for(level) * repetitions` trials per level, shuffled.
pub fn expand_levels<R: Rng + ?Sized>(spec: &BlockSpec, rng: &mut R) -> Vec<EffortLevel> {
    let mut levels = Vec::with_capacity(spec.trial_count() as usize);
    for level in EffortLevel::ALL.iter().rev() {
        let count = spec.ratio.count_for(*level) * spec.repetitions;
        levels.extend(std::iter::repeat(*level).take(count as usize));
    }
    levels.shuffle(rng);
    levels
}

pub struct TrialCatalog<'a> {
    grid: &'a mut GridTopology,
    presses: PressesPerLevel,
    goal_distance: u32,
}

impl<'a> TrialCatalog<'a> {
    pub fn new(grid: &'a mut GridTopology, presses: PressesPerLevel, goal_distance: u32) -> Self {
        Self {
            grid,
            presses,
            goal_distance,
        }
    }

    /// Builds blocks in the given presentation order. Trial indices run across
    /// the whole plan starting at `first_trial_index`.
    pub fn generate<R: Rng + ?Sized>(
        &mut self,
        specs: &[&BlockSpec],
        first_block_index: usize,
        first_trial_index: usize,
        rng: &mut R,
    ) -> CatalogPlan {
        let mut blocks = Vec::with_capacity(specs.len());
        let mut degraded = Vec::new();
        let mut trial_index = first_trial_index;

        for (offset, spec) in specs.iter().enumerate() {
            let block_index = first_block_index + offset;
            let levels = expand_levels(spec, rng);
            let mut trials = Vec::with_capacity(levels.len());
            for (trial_in_block, effort_level) in levels.into_iter().enumerate() {
                let start_position = self
                    .grid
                    .random_available_position(rng)
                    .unwrap_or(GridPos::new(1, 1));
                let placement = self
                    .grid
                    .position_at_distance(start_position, self.goal_distance, rng);
                if placement.is_degraded() {
                    degraded.push((trial_index, placement));
                }
                trials.push(Trial {
                    trial_index,
                    block_index,
                    block_type: spec.block_type,
                    trial_in_block,
                    effort_level,
                    required_presses: self.presses.for_level(effort_level),
                    start_position,
                    goal_position: placement.position,
                    goal_distance: self.goal_distance,
                });
                trial_index += 1;
            }
            blocks.push(Block {
                block_index,
                block_type: spec.block_type,
                ratio: spec.ratio,
                trials,
            });
        }

        CatalogPlan { blocks, degraded }
    }
}
