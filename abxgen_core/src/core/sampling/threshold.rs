use rand::{Rng, seq::index};

use crate::core::error::{AbxError, Result};

/// Rows kept by [`threshold_sample`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThresholdSample {
    /// Positions into the signature slice, increasing.
    pub keep: Vec<usize>,
    /// Output offset of the first row of every signature run.
    pub run_starts: Vec<u64>,
}

/// Caps every run of equal signatures at `cap` rows.
///
/// `signatures` must be sorted. Runs longer than `cap` keep `cap` rows drawn
/// uniformly without replacement, shorter runs are kept whole.
pub fn threshold_sample<R: Rng + ?Sized>(signatures: &[u64], cap: usize, rng: &mut R) -> Result<ThresholdSample> {
    if cap == 0 {
        return Err(AbxError::Configuration("threshold must be at least 1".to_string()));
    }

    if signatures.windows(2).any(|w| w[0] > w[1]) {
        return Err(AbxError::InvalidData("signatures are not sorted".to_string()));
    }

    let mut sample = ThresholdSample::default();
    let mut start = 0;

    while start < signatures.len() {
        let signature = signatures[start];
        let end = start + signatures[start..].partition_point(|s| *s == signature);
        let len = end - start;

        sample.run_starts.push(sample.keep.len() as u64);

        if len > cap {
            let mut picked = index::sample(rng, len, cap).into_vec();
            picked.sort_unstable();
            sample.keep.extend(picked.into_iter().map(|i| start + i));
        } else {
            sample.keep.extend(start..end);
        }

        start = end;
    }

    Ok(sample)
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn test_runs_are_capped() {
        let mut rng = StdRng::seed_from_u64(3);
        let signatures = [1, 1, 1, 1, 1, 4, 4, 9, 9, 9];

        let sample = threshold_sample(&signatures, 2, &mut rng).unwrap();
        assert_eq!(sample.keep.len(), 6);
        assert_eq!(sample.run_starts, vec![0, 2, 4]);
        assert!(sample.keep[..2].iter().all(|i| *i < 5));
        assert_eq!(&sample.keep[2..4], &[5, 6]);
        assert!(sample.keep[4..].iter().all(|i| (7..10).contains(i)));
        assert!(sample.keep.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_short_runs_pass_through() {
        let mut rng = StdRng::seed_from_u64(3);
        let sample = threshold_sample(&[0, 2, 2, 3], 5, &mut rng).unwrap();
        assert_eq!(sample.keep, vec![0, 1, 2, 3]);
        assert_eq!(sample.run_starts, vec![0, 1, 3]);
    }

    #[test]
    fn test_invalid_input() {
        let mut rng = StdRng::seed_from_u64(3);
        assert!(threshold_sample(&[2, 1], 1, &mut rng).is_err());
        assert!(threshold_sample(&[1], 0, &mut rng).is_err());
        assert_eq!(threshold_sample(&[], 3, &mut rng).unwrap(), ThresholdSample::default());
    }
}
