pub mod incremental;
pub mod threshold;

pub use incremental::IncrementalSampler;
pub use threshold::{ThresholdSample, threshold_sample};

use rand::{SeedableRng, rngs::StdRng};

use crate::core::error::{AbxError, Result};

/// Resolves a requested sample: below 1 it is a proportion of `total`,
/// otherwise an absolute count.
pub fn sample_amount(requested: f64, total: u64) -> Result<u64> {
    if !requested.is_finite() || requested <= 0.0 {
        return Err(AbxError::Configuration(format!(
            "sample must be a positive proportion or count, got {}",
            requested
        )));
    }

    if requested < 1.0 {
        return Ok((requested * total as f64).round() as u64);
    }

    if requested.fract() != 0.0 {
        return Err(AbxError::Configuration(format!(
            "sample count {} is not an integer",
            requested
        )));
    }

    let amount = requested as u64;

    if amount > total {
        return Err(AbxError::Configuration(format!(
            "cannot sample {} triplets out of {}",
            amount, total
        )));
    }

    Ok(amount)
}

pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}
