use log::trace;
use rand::rngs::StdRng;

use crate::core::{
    block_index::{Block, BlockIndex, ByGroup},
    error::{AbxError, Result},
    sampling::{IncrementalSampler, threshold_sample},
    sideop::{
        filters::FilterManager,
        regressors::{NamedValues, RegressorInput, RegressorManager, RegressorScope, RegressorValues},
    },
};

/// By-group local item indices `(a, b, x)`.
pub type Triplet = [u32; 3];

/// Output of one on-across block.
#[derive(Debug, Clone, Default)]
pub struct BlockTriplets {
    pub triplets: Vec<Triplet>,
    /// Row aligned with `triplets`, in regressor declaration order. Empty
    /// when regressors were not requested.
    pub regressors: Vec<NamedValues>,
    /// Block-relative offset of each signature run when capping ran.
    pub run_starts: Option<Vec<u64>>,
}

impl BlockTriplets {
    pub fn len(&self) -> usize {
        self.triplets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triplets.is_empty()
    }
}

/// Signature cap and the generator drawing the kept rows.
pub struct Threshold<'r> {
    pub cap: usize,
    pub rng: &'r mut StdRng,
}

pub struct TripletGenerator<'a> {
    index: &'a BlockIndex,
    filters: &'a FilterManager,
    regressors: &'a RegressorManager,
}

impl<'a> TripletGenerator<'a> {
    pub fn new(index: &'a BlockIndex, filters: &'a FilterManager, regressors: &'a RegressorManager) -> Self {
        Self { index, filters, regressors }
    }

    /// False when the on-across-by filters reject the block.
    pub fn block_enabled(&self, group: &ByGroup, block: &Block) -> Result<bool> {
        self.filters.on_across_by_filter(&group.block_context(block))
    }

    /// Generates the triplets of one block.
    ///
    /// Linear index `i` maps to `(A[i / (|B|·|X|)], B[(i / |X|) mod |B|],
    /// X[i mod |X|])`. With a sampler, only the drawn indices are decoded;
    /// when an ABX filter exists the draw is deferred to the survivors.
    pub fn on_across_triplets(
        &self,
        group: &ByGroup,
        block: &Block,
        with_regressors: bool,
        mut sampler: Option<&mut IncrementalSampler>,
        threshold: Option<Threshold<'_>>,
    ) -> Result<BlockTriplets> {
        let ctx = group.block_context(block);
        let view = &group.view;
        let candidates = self.index.candidates(group, block);

        let mut a = candidates.a;
        let mut b = candidates.b;
        let mut x = candidates.x;

        if self.filters.has_a() {
            a = self.filters.a_filter(&ctx, view, a)?;
        }
        if self.filters.has_b() {
            b = self.filters.b_filter(&ctx, view, b)?;
        }
        if self.filters.has_x() {
            x = self.filters.x_filter(&ctx, view, x)?;
        }

        let item_regressors = if with_regressors {
            [
                self.regressors.evaluate(RegressorScope::A, &ctx, view, RegressorInput::Items(&a))?,
                self.regressors.evaluate(RegressorScope::B, &ctx, view, RegressorInput::Items(&b))?,
                self.regressors.evaluate(RegressorScope::X, &ctx, view, RegressorInput::Items(&x))?,
            ]
        } else {
            Default::default()
        };

        let (nb, nx) = (b.len() as u64, x.len() as u64);
        let size = (a.len() as u64)
            .checked_mul(nb)
            .and_then(|s| s.checked_mul(nx))
            .ok_or_else(|| {
                AbxError::Configuration(format!(
                    "block of {}x{}x{} candidates overflows the index space",
                    a.len(),
                    nb,
                    nx
                ))
            })?;

        let decode = |i: u64| -> [u32; 3] {
            [(i / (nb * nx)) as u32, ((i / nx) % nb) as u32, (i % nx) as u32]
        };

        // Positions into (a, b, x), kept row aligned with the triplets.
        let mut positions: Vec<[u32; 3]> = if size == 0 {
            Vec::new()
        } else {
            match sampler.as_deref_mut() {
                Some(sampler) if !self.filters.has_abx() => {
                    sampler.sample(size)?.into_iter().map(decode).collect()
                }
                _ => (0..size).map(decode).collect(),
            }
        };

        let mut triplets: Vec<Triplet> = positions
            .iter()
            .map(|p| [a[p[0] as usize], b[p[1] as usize], x[p[2] as usize]])
            .collect();

        if self.filters.has_abx() && !triplets.is_empty() {
            let mask = self.filters.abx_filter(&ctx, view, &triplets)?;
            retain_by_mask(&mut triplets, &mask);
            retain_by_mask(&mut positions, &mask);

            if let Some(sampler) = sampler.as_deref_mut() {
                let drawn = sampler.sample(triplets.len() as u64)?;
                triplets = drawn.iter().map(|i| triplets[*i as usize]).collect();
                positions = drawn.iter().map(|i| positions[*i as usize]).collect();
            }
        }

        trace!(
            "Block on={} across={:?}: |A|={} |B|={} |X|={} size={} kept={}",
            block.on_key,
            block.across_key,
            a.len(),
            nb,
            nx,
            size,
            triplets.len()
        );

        if !with_regressors {
            return Ok(BlockTriplets {
                triplets,
                regressors: Vec::new(),
                run_starts: None,
            });
        }

        let rows = triplets.len();
        let mut columns: Vec<(RegressorScope, NamedValues)> = Vec::new();

        let group_ctx = group.context();
        for named in self.regressors.evaluate(RegressorScope::By, &group_ctx, view, RegressorInput::Context)? {
            columns.push((RegressorScope::By, broadcast(named, rows)));
        }
        for named in self.regressors.evaluate(RegressorScope::OnAcrossBy, &ctx, view, RegressorInput::Context)? {
            columns.push((RegressorScope::OnAcrossBy, broadcast(named, rows)));
        }

        let [a_values, b_values, x_values] = item_regressors;
        for (component, (scope, values)) in [
            (RegressorScope::A, a_values),
            (RegressorScope::B, b_values),
            (RegressorScope::X, x_values),
        ]
        .into_iter()
        .enumerate()
        {
            for named in values {
                let values = named.values.take(positions.iter().map(|p| p[component] as usize));
                columns.push((scope, NamedValues { output: named.output, values }));
            }
        }

        for named in self.regressors.evaluate(RegressorScope::Abx, &ctx, view, RegressorInput::Triplets(&triplets))? {
            columns.push((RegressorScope::Abx, named));
        }

        let mut run_starts = None;

        if let Some(threshold) = threshold {
            let signature_columns: Vec<&RegressorValues> = columns
                .iter()
                .filter(|(scope, _)| matches!(scope, RegressorScope::B | RegressorScope::X))
                .map(|(_, named)| &named.values)
                .collect();

            let signatures = encode_signatures(&signature_columns, rows)?;

            let mut order: Vec<usize> = (0..rows).collect();
            order.sort_by_key(|row| signatures[*row]);
            let sorted: Vec<u64> = order.iter().map(|row| signatures[*row]).collect();

            let sample = threshold_sample(&sorted, threshold.cap, threshold.rng)?;
            let permutation: Vec<usize> = sample.keep.iter().map(|k| order[*k]).collect();

            triplets = permutation.iter().map(|row| triplets[*row]).collect();
            for (_, named) in columns.iter_mut() {
                named.values = named.values.take(permutation.iter().copied());
            }

            run_starts = Some(sample.run_starts);
        }

        let outputs = self.regressors.outputs();
        let mut regressors = Vec::with_capacity(outputs.len());
        for output in &outputs {
            if let Some(position) = columns.iter().position(|(_, named)| named.output.name == output.name) {
                regressors.push(columns.swap_remove(position).1);
            }
        }

        Ok(BlockTriplets {
            triplets,
            regressors,
            run_starts,
        })
    }
}

fn broadcast(named: NamedValues, rows: usize) -> NamedValues {
    NamedValues {
        values: named.values.broadcast(rows),
        output: named.output,
    }
}

fn retain_by_mask<T>(rows: &mut Vec<T>, mask: &[bool]) {
    let mut flags = mask.iter();
    rows.retain(|_| flags.next().copied().unwrap_or(false));
}

/// Encodes each row of the given columns as one mixed-radix integer. Every
/// value position gets the radix `max - min + 1` observed over `rows`, the
/// first column being the most significant digit.
pub fn encode_signatures(columns: &[&RegressorValues], rows: usize) -> Result<Vec<u64>> {
    let mut signatures = vec![0u64; rows];

    if rows == 0 {
        return Ok(signatures);
    }

    let mut space: u64 = 1;

    for column in columns {
        for offset in 0..column.width {
            let digits = (0..rows).map(|row| column.row(row)[offset]);
            let (min, max) = digits
                .clone()
                .fold((i64::MAX, i64::MIN), |(lo, hi), v| (lo.min(v), hi.max(v)));

            let radix = u64::try_from(max as i128 - min as i128 + 1).map_err(|_| signature_overflow())?;
            space = space.checked_mul(radix).ok_or_else(signature_overflow)?;

            for (signature, digit) in signatures.iter_mut().zip(digits) {
                *signature = *signature * radix + (digit as i128 - min as i128) as u64;
            }
        }
    }

    Ok(signatures)
}

fn signature_overflow() -> AbxError {
    AbxError::Configuration("regressor signature space exceeds 64 bits".to_string())
}
