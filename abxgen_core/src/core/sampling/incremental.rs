use log::trace;
use rand::{Rng, SeedableRng, rngs::StdRng, seq::index};
use rand_distr::{Distribution, Hypergeometric};

use crate::core::error::{AbxError, Result};

/// Draws `amount` indices without replacement from a space of `total`
/// indices that is revealed block by block.
///
/// Each call to [`IncrementalSampler::sample`] takes the next `n` indices of
/// the space. The share of the block is hypergeometric, so the union of all
/// calls is a uniform sample of the whole space.
#[derive(Debug, Clone)]
pub struct IncrementalSampler {
    remaining_total: u64,
    remaining_amount: u64,
    rng: StdRng,
}

impl IncrementalSampler {
    pub fn new(total: u64, amount: u64, rng: StdRng) -> Result<IncrementalSampler> {
        if amount > total {
            return Err(AbxError::Configuration(format!(
                "cannot sample {} triplets out of {}",
                amount, total
            )));
        }

        Ok(IncrementalSampler {
            remaining_total: total,
            remaining_amount: amount,
            rng,
        })
    }

    pub fn remaining_total(&self) -> u64 {
        self.remaining_total
    }

    pub fn remaining_amount(&self) -> u64 {
        self.remaining_amount
    }

    /// Number of draws falling in the next `n` indices.
    fn draw_share(&mut self, n: u64) -> Result<u64> {
        if n > self.remaining_total {
            return Err(AbxError::Configuration(format!(
                "block of {} indices exceeds the {} left to sample from",
                n, self.remaining_total
            )));
        }

        let share = if self.remaining_amount == 0 || n == 0 {
            0
        } else if n == self.remaining_total {
            self.remaining_amount
        } else if self.remaining_amount == self.remaining_total {
            n
        } else {
            let distribution = Hypergeometric::new(self.remaining_total, self.remaining_amount, n)
                .map_err(|e| AbxError::Configuration(format!("invalid sampling state: {}", e)))?;
            distribution.sample(&mut self.rng)
        };

        self.remaining_total -= n;
        self.remaining_amount -= share;

        Ok(share)
    }

    /// Sorted, distinct indices in `[0, n)`.
    pub fn sample(&mut self, n: u64) -> Result<Vec<u64>> {
        let share = self.draw_share(n)?;

        if share == 0 {
            return Ok(Vec::new());
        }

        let mut indices: Vec<u64> = index::sample(&mut self.rng, n as usize, share as usize)
            .into_iter()
            .map(|i| i as u64)
            .collect();
        indices.sort_unstable();

        trace!("Sampled {} of {} indices", share, n);

        Ok(indices)
    }

    /// Pre-draws the share of each group and returns one independent sampler
    /// per group, in order. `group_sizes` must cover the remaining space.
    pub fn split(mut self, group_sizes: &[u64]) -> Result<Vec<IncrementalSampler>> {
        let covered = group_sizes
            .iter()
            .try_fold(0u64, |acc, size| acc.checked_add(*size))
            .ok_or_else(|| AbxError::Configuration("group sizes overflow".to_string()))?;

        if covered != self.remaining_total {
            return Err(AbxError::Configuration(format!(
                "group sizes cover {} indices, expected {}",
                covered, self.remaining_total
            )));
        }

        let mut samplers = Vec::with_capacity(group_sizes.len());

        for size in group_sizes {
            let share = self.draw_share(*size)?;
            let rng = StdRng::seed_from_u64(self.rng.random());
            samplers.push(IncrementalSampler::new(*size, share, rng)?);
        }

        Ok(samplers)
    }
}
