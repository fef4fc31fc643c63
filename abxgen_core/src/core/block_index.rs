use std::sync::Arc;

use ahash::AHashMap;
use itertools::Itertools;
use log::{debug, info};
use smallvec::SmallVec;

use crate::core::{
    database::{ItemTable, RESERVED_CHAR},
    error::{AbxError, Result},
    sideop::{Context, GroupView, filters::FilterManager},
    type_fitting::{IntType, fit_integer_type},
};

/// A tuple of level codes.
pub type AttrKey = SmallVec<[u32; 4]>;

/// Name reported for the synthetic by attribute.
pub const SYNTHETIC_BY: &str = "#by";

/// Source of one grouping coordinate. Synthetic attributes never touch the
/// item table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRef {
    Column(usize),
    /// Row-unique: every item is its own level.
    RowNumber,
    /// Single level shared by every item.
    Constant,
}

impl ColumnRef {
    #[inline]
    pub fn code(&self, table: &ItemTable, row: u32) -> u32 {
        match self {
            ColumnRef::Column(column) => table.code(row as usize, *column),
            ColumnRef::RowNumber => row,
            ColumnRef::Constant => 0,
        }
    }

    pub fn value(&self, table: &ItemTable, row: u32) -> String {
        match self {
            ColumnRef::Column(column) => table.value(row as usize, *column).to_string(),
            ColumnRef::RowNumber => row.to_string(),
            ColumnRef::Constant => "0".to_string(),
        }
    }

    /// Level value of `code`, as produced by [`ColumnRef::code`].
    pub fn level_name(&self, table: &ItemTable, code: u32) -> String {
        match self {
            ColumnRef::Column(column) => table.column(*column).levels[code as usize].clone(),
            _ => code.to_string(),
        }
    }

    pub fn name<'a>(&self, table: &'a ItemTable, synthetic: &'a str) -> &'a str {
        match self {
            ColumnRef::Column(column) => table.column(*column).name.as_str(),
            _ => synthetic,
        }
    }
}

/// Resolves user attribute names. An empty list becomes the synthetic
/// attribute `fallback`.
pub fn resolve_attributes(table: &ItemTable, names: &[String], fallback: ColumnRef) -> Result<Vec<ColumnRef>> {
    if names.is_empty() {
        return Ok(vec![fallback]);
    }

    names.iter().map(|name| resolve_attribute(table, name).map(ColumnRef::Column)).collect()
}

pub fn resolve_attribute(table: &ItemTable, name: &str) -> Result<usize> {
    if name.contains(RESERVED_CHAR) {
        return Err(AbxError::Configuration(format!(
            "attribute '{}' contains the reserved character '{}'",
            name, RESERVED_CHAR
        )));
    }

    table.column_index(name).ok_or_else(|| {
        AbxError::Configuration(format!("attribute '{}' is not defined in the database", name))
    })
}

/// One on×across block of a by-group. `items` is the A set.
#[derive(Debug, Clone)]
pub struct Block {
    pub on_key: u32,
    pub across_key: AttrKey,
    pub items: Vec<u32>,
}

/// Raw candidate sets of a block, sorted local indices.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    pub a: Vec<u32>,
    pub b: Vec<u32>,
    pub x: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct ByGroup {
    /// Position among the retained groups.
    pub id: u32,
    pub key: AttrKey,
    pub key_values: Vec<String>,
    pub view: GroupView,
    /// Local indices surviving generic filters, sorted.
    pub items: Vec<u32>,
    /// Largest surviving local index. May exceed `items.len() - 1`.
    pub max_index: u32,
    pub index_type: IntType,
    pub on_groups: AHashMap<u32, Vec<u32>>,
    pub across_groups: AHashMap<AttrKey, Vec<u32>>,
    /// Sorted by `(on_key, across_key)`.
    pub blocks: Vec<Block>,
    /// Items whose across tuple differs from the key in every coordinate.
    /// Only built for multi-coordinate across.
    pub anti_across: Option<AHashMap<AttrKey, Vec<u32>>>,
}

impl ByGroup {
    pub fn context(&self) -> Context<'_> {
        Context::new(&self.view, 0)
    }

    pub fn block_context<'a>(&'a self, block: &Block) -> Context<'a> {
        Context::new(&self.view, block.items[0])
    }

    /// `max_index + 1`, the pair key modulus.
    pub fn modulus(&self) -> u64 {
        self.max_index as u64 + 1
    }
}

/// Grouping structures of a task, built once at construction.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    pub on: usize,
    pub across: Vec<ColumnRef>,
    pub by: Vec<ColumnRef>,
    pub groups: Vec<ByGroup>,
}

impl BlockIndex {
    pub fn build(
        table: Arc<ItemTable>,
        on: usize,
        across: Vec<ColumnRef>,
        by: Vec<ColumnRef>,
        filters: &FilterManager,
    ) -> Result<BlockIndex> {
        if table.len() > u32::MAX as usize {
            return Err(AbxError::Configuration(format!(
                "{} items exceed the supported database size",
                table.len()
            )));
        }

        let mut by_rows: AHashMap<AttrKey, Vec<u32>> = AHashMap::new();

        for row in 0..table.len() as u32 {
            let key: AttrKey = by.iter().map(|c| c.code(&table, row)).collect();
            by_rows.entry(key).or_default().push(row);
        }

        let nb_by_keys = by_rows.len();
        let mut groups = Vec::with_capacity(nb_by_keys);

        for (key, rows) in by_rows.into_iter().sorted_by(|l, r| l.0.cmp(&r.0)) {
            let view = GroupView::new(table.clone(), rows);
            let ctx = Context::new(&view, 0);

            if !filters.by_filter(&ctx, &view)? {
                debug!("By group {:?} rejected by the by filters", key);
                continue;
            }

            let all: Vec<u32> = (0..view.len() as u32).collect();
            let items = filters.generic_filter(&ctx, &view, all)?;

            let id = groups.len() as u32;
            groups.push(index_group(id, key, view, items, on, &across, &by));
        }

        info!(
            "Indexed {} by groups ({} rejected), {} on-across blocks",
            groups.len(),
            nb_by_keys - groups.len(),
            groups.iter().map(|g| g.blocks.len()).sum::<usize>()
        );

        Ok(BlockIndex { on, across, by, groups })
    }

    /// True when across falls back to the row-unique synthetic attribute.
    pub fn is_synthetic_across(&self) -> bool {
        self.across == [ColumnRef::RowNumber]
    }

    pub fn is_multi_across(&self) -> bool {
        self.across.len() > 1
    }

    /// A, B and X candidate sets of `block`.
    ///
    /// X holds items sharing on but not across with A. B holds items sharing
    /// across but not on with A, or any item of another on level when across
    /// is synthetic.
    pub fn candidates(&self, group: &ByGroup, block: &Block) -> Candidates {
        let a = block.items.clone();
        let empty = Vec::new();
        let on_set = group.on_groups.get(&block.on_key).unwrap_or(&empty);

        let b = if self.is_synthetic_across() {
            sorted_difference(&group.items, on_set)
        } else {
            let across_set = group.across_groups.get(&block.across_key).unwrap_or(&empty);
            sorted_difference(across_set, &a)
        };

        let x = match &group.anti_across {
            Some(anti_across) => {
                let anti = anti_across.get(&block.across_key).unwrap_or(&empty);
                sorted_intersection(anti, on_set)
            }
            None => sorted_difference(on_set, &a),
        };

        Candidates { a, b, x }
    }
}

fn index_group(
    id: u32,
    key: AttrKey,
    view: GroupView,
    items: Vec<u32>,
    on: usize,
    across: &[ColumnRef],
    by: &[ColumnRef],
) -> ByGroup {
    let table = view.table();

    let key_values = by.iter().map(|c| c.value(table, view.global_row(0))).collect();

    let mut on_groups: AHashMap<u32, Vec<u32>> = AHashMap::new();
    let mut across_groups: AHashMap<AttrKey, Vec<u32>> = AHashMap::new();
    let mut on_across: AHashMap<(u32, AttrKey), Vec<u32>> = AHashMap::new();

    for item in &items {
        let row = view.global_row(*item);
        let on_key = view.code(*item, on);
        let across_key: AttrKey = across.iter().map(|c| c.code(table, row)).collect();

        on_groups.entry(on_key).or_default().push(*item);
        across_groups.entry(across_key.clone()).or_default().push(*item);
        on_across.entry((on_key, across_key)).or_default().push(*item);
    }

    let blocks = on_across
        .into_iter()
        .sorted_by(|l, r| l.0.cmp(&r.0))
        .map(|((on_key, across_key), items)| Block { on_key, across_key, items })
        .collect();

    let anti_across = if across.len() > 1 {
        let mut anti: AHashMap<AttrKey, Vec<u32>> = AHashMap::with_capacity(across_groups.len());

        for across_key in across_groups.keys() {
            let differing = items
                .iter()
                .copied()
                .filter(|item| {
                    let row = view.global_row(*item);
                    across
                        .iter()
                        .zip(across_key.iter())
                        .all(|(column, code)| column.code(table, row) != *code)
                })
                .collect();
            anti.insert(across_key.clone(), differing);
        }

        Some(anti)
    } else {
        None
    };

    let max_index = items.last().copied().unwrap_or(0);
    let index_type = fit_integer_type(max_index as u64, false);

    ByGroup {
        id,
        key,
        key_values,
        view,
        items,
        max_index,
        index_type,
        on_groups,
        across_groups,
        blocks,
        anti_across,
    }
}

/// `left \ right` over sorted slices.
pub fn sorted_difference(left: &[u32], right: &[u32]) -> Vec<u32> {
    left.iter()
        .copied()
        .filter(|item| right.binary_search(item).is_err())
        .collect()
}

/// `left ∩ right` over sorted slices.
pub fn sorted_intersection(left: &[u32], right: &[u32]) -> Vec<u32> {
    let (small, large) = if left.len() <= right.len() { (left, right) } else { (right, left) };

    small
        .iter()
        .copied()
        .filter(|item| large.binary_search(item).is_ok())
        .collect()
}
