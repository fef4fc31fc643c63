pub mod dedup;
pub mod external_sort;
pub mod temp_scope;

pub use dedup::dedup_sorted;
pub use external_sort::{SortPlan, external_sort};
pub use temp_scope::TempScope;

use log::trace;

use crate::core::{
    error::{AbxError, Result},
    storage_providers::{
        dataset::{DatasetReader, DatasetWriter},
        traits::StorageIO,
    },
    type_fitting::{IntType, fit_integer_type},
};

/// Smallest unsigned type holding every key `< modulus²`.
pub fn pair_key_type(modulus: u64) -> Result<IntType> {
    let space = modulus as u128 * modulus as u128;

    let max_key = u64::try_from(space.saturating_sub(1)).map_err(|_| {
        AbxError::Configuration(format!("pair keys of modulus {} exceed 64 bits", modulus))
    })?;

    Ok(fit_integer_type(max_key, false))
}

#[inline(always)]
pub fn encode_pair_key(item: u64, shared: u64, modulus: u64) -> u64 {
    item + modulus * shared
}

/// Splits a key into `(item, shared X)`.
#[inline(always)]
pub fn decode_pair_key(key: u64, modulus: u64) -> (u64, u64) {
    (key % modulus, key / modulus)
}

/// Streams triplets `(a, b, x)` and emits the keys `a + m·x` then
/// `b + m·x` for each, in triplet order. Returns the keys written.
pub fn extract_pairs<S: StorageIO, T: StorageIO>(
    triplets: &mut DatasetReader<S>,
    modulus: u64,
    output: &mut DatasetWriter<T>,
) -> Result<u64> {
    if triplets.columns() != 3 {
        return Err(AbxError::InvalidData(format!(
            "triplet dataset has {} columns",
            triplets.columns()
        )));
    }

    pair_key_type(modulus)?;

    let mut keys = Vec::new();
    let mut written = 0u64;

    while let Some(chunk) = triplets.read()? {
        keys.clear();
        keys.reserve(chunk.len() / 3 * 2);

        for triplet in chunk.chunks_exact(3) {
            let (a, b, x) = (triplet[0], triplet[1], triplet[2]);

            if a >= modulus || b >= modulus || x >= modulus {
                return Err(AbxError::InvalidData(format!(
                    "triplet ({}, {}, {}) out of modulus {}",
                    a, b, x, modulus
                )));
            }

            keys.push(encode_pair_key(a, x, modulus));
            keys.push(encode_pair_key(b, x, modulus));
        }

        output.append(&keys)?;
        written += keys.len() as u64;
    }

    trace!("Extracted {} pair keys with modulus {}", written, modulus);

    Ok(written)
}
