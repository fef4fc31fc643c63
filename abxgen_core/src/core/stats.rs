use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use ahash::AHashSet;
use itertools::Itertools;
use log::{debug, info};
use stopwatch::Stopwatch;

use crate::core::{
    block_index::{AttrKey, BlockIndex, ByGroup},
    error::{AbxError, Result},
    sideop::{filters::FilterManager, regressors::RegressorManager},
    triplets::TripletGenerator,
};

/// Statistics of one by-group. Level lists are in level order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByStats {
    pub by_id: u32,
    pub by_values: Vec<String>,
    pub nb_items: u64,
    pub on_levels: Vec<(String, u64)>,
    pub nb_on_levels: usize,
    pub across_levels: Vec<(String, u64)>,
    pub nb_across_levels: usize,
    pub on_across_levels: Vec<(String, u64)>,
    pub nb_on_across_levels: usize,
    /// Triplet count of every block, aligned with the group blocks. Blocks
    /// rejected by the on-across-by filters count zero.
    pub block_sizes: Vec<u64>,
    pub nb_triplets: u64,
    /// Σ |A|·|B| over the blocks.
    pub nb_across_pairs: u64,
    /// Σ |A|·|X| over the blocks.
    pub nb_on_pairs: u64,
    pub nb_levels: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    /// A singleton or triplet filter is configured.
    pub approximate: bool,
    /// Triplet counts are estimates and must not size outputs.
    pub approximate_nb_triplets: bool,
    pub nb_by_levels: usize,
    pub nb_blocks: usize,
    pub nb_triplets: u64,
    pub nb_levels: Option<u64>,
    pub by_stats: Vec<ByStats>,
}

fn checked_product(factors: &[u64]) -> Result<u64> {
    factors
        .iter()
        .try_fold(1u64, |acc, f| acc.checked_mul(*f))
        .ok_or_else(|| AbxError::Configuration(format!("count {:?} overflows 64 bits", factors)))
}

fn checked_sum(acc: u64, value: u64) -> Result<u64> {
    acc.checked_add(value)
        .ok_or_else(|| AbxError::Configuration("count overflows 64 bits".to_string()))
}

fn render_key(index: &BlockIndex, group: &ByGroup, key: &AttrKey) -> String {
    let table = group.view.table();
    index
        .across
        .iter()
        .zip(key.iter())
        .map(|(column, code)| column.level_name(table, *code))
        .join(",")
}

/// Computes the statistics of every retained by-group.
///
/// Block triplet counts are `|A|·|B|·|X|` unless a singleton or triplet
/// filter is configured or across has several coordinates, in which case the
/// generator runs without regressors and rows are counted. `approximate`
/// keeps the product even with filters.
pub fn compute_statistics(
    index: &BlockIndex,
    filters: &FilterManager,
    approximate: bool,
) -> Result<Stats> {
    let stopwatch = Stopwatch::start_new();
    let filtered = filters.has_item_or_triplet_filters();
    let cheap = (approximate || !filtered) && !index.is_multi_across();

    let no_regressors = RegressorManager::default();
    let generator = TripletGenerator::new(index, filters, &no_regressors);

    let mut stats = Stats {
        approximate: filtered,
        approximate_nb_triplets: approximate && filtered,
        nb_by_levels: index.groups.len(),
        ..Default::default()
    };

    for group in &index.groups {
        let table = group.view.table();
        let nb_items = group.items.len() as u64;

        let on_levels: Vec<(String, u64)> = group
            .on_groups
            .iter()
            .sorted_by_key(|(code, _)| **code)
            .map(|(code, items)| (table.column(index.on).levels[*code as usize].clone(), items.len() as u64))
            .collect();

        let across_levels: Vec<(String, u64)> = group
            .across_groups
            .iter()
            .sorted_by(|l, r| l.0.cmp(r.0))
            .map(|(key, items)| (render_key(index, group, key), items.len() as u64))
            .collect();

        let on_across_levels: Vec<(String, u64)> = group
            .blocks
            .iter()
            .map(|block| {
                let on = table.column(index.on).levels[block.on_key as usize].clone();
                (format!("{}|{}", on, render_key(index, group, &block.across_key)), block.items.len() as u64)
            })
            .collect();

        let mut by_stats = ByStats {
            by_id: group.id,
            by_values: group.key_values.clone(),
            nb_items,
            nb_on_levels: on_levels.len(),
            on_levels,
            nb_across_levels: across_levels.len(),
            across_levels,
            nb_on_across_levels: on_across_levels.len(),
            on_across_levels,
            ..Default::default()
        };

        for block in &group.blocks {
            if !generator.block_enabled(group, block)? {
                by_stats.block_sizes.push(0);
                continue;
            }

            let n_a = block.items.len() as u64;
            let on_count = group.on_groups.get(&block.on_key).map(|v| v.len() as u64).unwrap_or(0);
            let n_x = on_count - n_a;
            let n_b = if index.is_synthetic_across() {
                nb_items - on_count
            } else {
                let across_count = group
                    .across_groups
                    .get(&block.across_key)
                    .map(|v| v.len() as u64)
                    .unwrap_or(0);
                across_count - n_a
            };

            by_stats.nb_across_pairs = checked_sum(by_stats.nb_across_pairs, checked_product(&[n_a, n_b])?)?;
            by_stats.nb_on_pairs = checked_sum(by_stats.nb_on_pairs, checked_product(&[n_a, n_x])?)?;

            let size = if cheap {
                checked_product(&[n_a, n_b, n_x])?
            } else {
                generator.on_across_triplets(group, block, false, None, None)?.len() as u64
            };

            by_stats.block_sizes.push(size);
            by_stats.nb_triplets = checked_sum(by_stats.nb_triplets, size)?;
        }

        debug!(
            "By group {} {:?}: {} items, {} blocks, {} triplets",
            group.id, group.key_values, nb_items, by_stats.nb_on_across_levels, by_stats.nb_triplets
        );

        stats.nb_blocks += by_stats.nb_on_across_levels;
        stats.nb_triplets = checked_sum(stats.nb_triplets, by_stats.nb_triplets)?;
        stats.by_stats.push(by_stats);
    }

    info!(
        "Statistics: {} by groups, {} blocks, {} triplets{} in {}ms",
        stats.nb_by_levels,
        stats.nb_blocks,
        stats.nb_triplets,
        if stats.approximate_nb_triplets { " (approximate)" } else { "" },
        stopwatch.elapsed_ms()
    );

    Ok(stats)
}

/// Counts, per block, the (B level, X level) combinations, where levels are
/// `on` values, or `on` and `across` values when across is given.
pub fn compute_nb_levels(index: &BlockIndex, filters: &FilterManager, stats: &mut Stats) -> Result<()> {
    if filters.has_item_or_triplet_filters() {
        return Err(AbxError::Unsupported(
            "nb_levels cannot be computed with A, B, X or ABX filters".to_string(),
        ));
    }

    let no_regressors = RegressorManager::default();
    let generator = TripletGenerator::new(index, filters, &no_regressors);
    let mut total = 0u64;

    for (group, by_stats) in index.groups.iter().zip(stats.by_stats.iter_mut()) {
        let table = group.view.table();
        let level_of = |item: u32| -> AttrKey {
            let mut key = AttrKey::new();
            key.push(group.view.code(item, index.on));
            if !index.is_synthetic_across() {
                let row = group.view.global_row(item);
                key.extend(index.across.iter().map(|c| c.code(table, row)));
            }
            key
        };

        let mut n = 0u64;

        for block in &group.blocks {
            if !generator.block_enabled(group, block)? {
                continue;
            }

            let candidates = index.candidates(group, block);
            if candidates.b.is_empty() || candidates.x.is_empty() {
                continue;
            }

            let b_levels: AHashSet<AttrKey> = candidates.b.iter().map(|i| level_of(*i)).collect();
            let x_levels: AHashSet<AttrKey> = candidates.x.iter().map(|i| level_of(*i)).collect();

            n = checked_sum(n, checked_product(&[b_levels.len() as u64, x_levels.len() as u64])?)?;
        }

        by_stats.nb_levels = Some(n);
        total = checked_sum(total, n)?;
    }

    stats.nb_levels = Some(total);

    Ok(())
}

impl Stats {
    pub fn print_stats<W: Write>(&self, out: &mut W, summarized: bool) -> Result<()> {
        writeln!(out, "\n\n###### Global stats ######\n")?;
        writeln!(out, "approximate: {}", self.approximate)?;
        writeln!(out, "approximate_nb_triplets: {}", self.approximate_nb_triplets)?;
        writeln!(out, "nb_by_levels: {}", self.nb_by_levels)?;
        writeln!(out, "nb_blocks: {}", self.nb_blocks)?;
        writeln!(out, "nb_triplets: {}", self.nb_triplets)?;
        writeln!(out, "nb_levels: {}", display_optional(self.nb_levels))?;

        writeln!(out, "\n\n###### by blocks stats ######\n")?;

        for by in &self.by_stats {
            writeln!(out, "### by level: {} ###", by.by_values.join(","))?;
            writeln!(out, "nb_triplets: {}", by.nb_triplets)?;
            writeln!(out, "nb_levels: {}", display_optional(by.nb_levels))?;
            writeln!(out, "nb_across_pairs: {}", by.nb_across_pairs)?;
            writeln!(out, "nb_on_pairs: {}", by.nb_on_pairs)?;
            writeln!(out, "nb_on_levels: {}", by.nb_on_levels)?;
            writeln!(out, "nb_across_levels: {}", by.nb_across_levels)?;
            writeln!(out, "nb_on_across_levels: {}", by.nb_on_across_levels)?;

            if !summarized {
                writeln!(out, "nb_items: {}", by.nb_items)?;
                writeln!(out, "on_levels: {:?}", by.on_levels)?;
                writeln!(out, "across_levels: {:?}", by.across_levels)?;
                writeln!(out, "on_across_levels: {:?}", by.on_across_levels)?;
                writeln!(out, "block_sizes: {:?}", by.block_sizes)?;
            }
        }

        Ok(())
    }

    pub fn write_stats_file(&self, path: impl AsRef<Path>, summarized: bool) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        self.print_stats(&mut out, summarized)?;
        out.flush()?;
        Ok(())
    }
}

fn display_optional(value: Option<u64>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => "n/a".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::{
        block_index::ColumnRef,
        database::ItemTable,
        sideop::{
            Context, GroupView,
            filters::{BlockFilter, FilterScope, ItemFilter, Predicate},
        },
    };

    fn table() -> Arc<ItemTable> {
        let rows: Vec<Vec<String>> = [
            ["x", "p"],
            ["x", "p"],
            ["x", "q"],
            ["y", "p"],
            ["y", "q"],
            ["y", "q"],
        ]
        .iter()
        .map(|r| r.iter().map(|v| v.to_string()).collect())
        .collect();
        Arc::new(ItemTable::new(&["on", "across"], &rows).unwrap())
    }

    fn build(filters: &FilterManager) -> BlockIndex {
        BlockIndex::build(table(), 0, vec![ColumnRef::Column(1)], vec![ColumnRef::Constant], filters).unwrap()
    }

    #[test]
    fn test_exact_counts_match_enumeration() {
        let filters = FilterManager::default();
        let index = build(&filters);
        let stats = compute_statistics(&index, &filters, false).unwrap();

        // (x,p): 2*1*1, (x,q): 1*2*2, (y,p): 1*2*2, (y,q): 2*1*1
        assert_eq!(stats.by_stats[0].block_sizes, vec![2, 4, 4, 2]);
        assert_eq!(stats.nb_triplets, 12);
        assert_eq!(stats.nb_blocks, 4);
        assert!(!stats.approximate);
        assert_eq!(stats.by_stats[0].on_levels, vec![("x".to_string(), 3), ("y".to_string(), 3)]);
        assert_eq!(stats.by_stats[0].nb_across_pairs, 2 + 2 + 2 + 2);

        let regressors = RegressorManager::default();
        let generator = TripletGenerator::new(&index, &filters, &regressors);
        let group = &index.groups[0];
        let enumerated: u64 = group
            .blocks
            .iter()
            .map(|b| generator.on_across_triplets(group, b, false, None, None).unwrap().len() as u64)
            .sum();
        assert_eq!(enumerated, stats.nb_triplets);
    }

    #[test]
    fn test_filters_force_exact_count_unless_approximate() {
        let some_x: Arc<dyn Predicate> = Arc::new(
            ItemFilter::new("x_in_2_5", FilterScope::X, |_: &Context, _: &GroupView, i| i == 2 || i == 5).unwrap(),
        );
        let filters = FilterManager::new(vec![some_x]);
        let index = build(&filters);

        let exact = compute_statistics(&index, &filters, false).unwrap();
        assert!(exact.approximate);
        assert!(!exact.approximate_nb_triplets);
        assert_eq!(exact.by_stats[0].block_sizes, vec![2, 0, 2, 0]);

        let approximate = compute_statistics(&index, &filters, true).unwrap();
        assert!(approximate.approximate_nb_triplets);
        assert_eq!(approximate.nb_triplets, 12);

        let mut stats = exact.clone();
        assert!(matches!(
            compute_nb_levels(&index, &filters, &mut stats),
            Err(AbxError::Unsupported(_))
        ));
    }

    #[test]
    fn test_rejected_blocks_count_zero() {
        let no_y: Arc<dyn Predicate> = Arc::new(BlockFilter::new("on != y", |c: &Context| c.get("on") != Some("y")));
        let filters = FilterManager::new(vec![no_y]);
        let index = build(&filters);

        let stats = compute_statistics(&index, &filters, false).unwrap();
        assert_eq!(stats.by_stats[0].block_sizes, vec![2, 4, 0, 0]);
        assert_eq!(stats.nb_triplets, 6);
    }

    #[test]
    fn test_nb_levels_and_report() {
        let filters = FilterManager::default();
        let index = build(&filters);
        let mut stats = compute_statistics(&index, &filters, false).unwrap();
        compute_nb_levels(&index, &filters, &mut stats).unwrap();

        // Every block sees one B level and one X level.
        assert_eq!(stats.nb_levels, Some(4));

        let mut out = Vec::new();
        stats.print_stats(&mut out, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("nb_triplets: 12"));
        assert!(text.contains("### by level: 0 ###"));
        assert!(!text.contains("block_sizes"));

        let mut out = Vec::new();
        stats.print_stats(&mut out, false).unwrap();
        assert!(String::from_utf8(out).unwrap().contains("block_sizes: [2, 4, 4, 2]"));
    }
}
