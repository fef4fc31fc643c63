use std::sync::Arc;

use crate::core::{
    error::{AbxError, Result},
    triplets::Triplet,
};

use super::{Context, GroupView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterScope {
    /// Keeps or drops a whole by-group.
    By,
    /// Row subset of a by-group, applied before any grouping.
    Generic,
    /// Keeps or drops a whole on-across block.
    OnAcrossBy,
    A,
    B,
    X,
    /// Applied to materialized triplets.
    Abx,
}

/// A late-bound filter. Only the method matching `scope()` is ever called.
pub trait Predicate: Send + Sync {
    fn name(&self) -> &str;

    fn scope(&self) -> FilterScope;

    fn keep_group(&self, _ctx: &Context, _view: &GroupView) -> Result<bool> {
        Ok(true)
    }

    fn keep_block(&self, _ctx: &Context) -> Result<bool> {
        Ok(true)
    }

    /// Returns the retained subset of `candidates`.
    fn retain_items(&self, _ctx: &Context, _view: &GroupView, candidates: &[u32]) -> Result<Vec<u32>> {
        Ok(candidates.to_vec())
    }

    /// Returns one keep flag per triplet.
    fn retain_triplets(&self, _ctx: &Context, _view: &GroupView, triplets: &[Triplet]) -> Result<Vec<bool>> {
        Ok(vec![true; triplets.len()])
    }
}

/// By-group filter built from a closure.
pub struct GroupFilter<F> {
    name: String,
    f: F,
}

impl<F> GroupFilter<F>
where
    F: Fn(&Context, &GroupView) -> bool + Send + Sync,
{
    pub fn new(name: &str, f: F) -> Self {
        Self { name: name.to_string(), f }
    }
}

impl<F> Predicate for GroupFilter<F>
where
    F: Fn(&Context, &GroupView) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> FilterScope {
        FilterScope::By
    }

    fn keep_group(&self, ctx: &Context, view: &GroupView) -> Result<bool> {
        Ok((self.f)(ctx, view))
    }
}

/// On-across block filter built from a closure.
pub struct BlockFilter<F> {
    name: String,
    f: F,
}

impl<F> BlockFilter<F>
where
    F: Fn(&Context) -> bool + Send + Sync,
{
    pub fn new(name: &str, f: F) -> Self {
        Self { name: name.to_string(), f }
    }
}

impl<F> Predicate for BlockFilter<F>
where
    F: Fn(&Context) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> FilterScope {
        FilterScope::OnAcrossBy
    }

    fn keep_block(&self, ctx: &Context) -> Result<bool> {
        Ok((self.f)(ctx))
    }
}

/// Per-item filter for the `Generic`, `A`, `B` or `X` scopes.
pub struct ItemFilter<F> {
    name: String,
    scope: FilterScope,
    f: F,
}

impl<F> ItemFilter<F>
where
    F: Fn(&Context, &GroupView, u32) -> bool + Send + Sync,
{
    pub fn new(name: &str, scope: FilterScope, f: F) -> Result<Self> {
        match scope {
            FilterScope::Generic | FilterScope::A | FilterScope::B | FilterScope::X => {
                Ok(Self { name: name.to_string(), scope, f })
            }
            other => Err(AbxError::Configuration(format!(
                "item filter '{}' cannot have scope {:?}",
                name, other
            ))),
        }
    }
}

impl<F> Predicate for ItemFilter<F>
where
    F: Fn(&Context, &GroupView, u32) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> FilterScope {
        self.scope
    }

    fn retain_items(&self, ctx: &Context, view: &GroupView, candidates: &[u32]) -> Result<Vec<u32>> {
        Ok(candidates
            .iter()
            .copied()
            .filter(|item| (self.f)(ctx, view, *item))
            .collect())
    }
}

/// Per-triplet filter.
pub struct TripletFilter<F> {
    name: String,
    f: F,
}

impl<F> TripletFilter<F>
where
    F: Fn(&Context, &GroupView, &Triplet) -> bool + Send + Sync,
{
    pub fn new(name: &str, f: F) -> Self {
        Self { name: name.to_string(), f }
    }
}

impl<F> Predicate for TripletFilter<F>
where
    F: Fn(&Context, &GroupView, &Triplet) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> FilterScope {
        FilterScope::Abx
    }

    fn retain_triplets(&self, ctx: &Context, view: &GroupView, triplets: &[Triplet]) -> Result<Vec<bool>> {
        Ok(triplets.iter().map(|t| (self.f)(ctx, view, t)).collect())
    }
}

/// Filters of a task, bucketed by scope. Filters of one scope are combined
/// with a logical AND, in declaration order.
#[derive(Clone, Default)]
pub struct FilterManager {
    by: Vec<Arc<dyn Predicate>>,
    generic: Vec<Arc<dyn Predicate>>,
    on_across_by: Vec<Arc<dyn Predicate>>,
    a: Vec<Arc<dyn Predicate>>,
    b: Vec<Arc<dyn Predicate>>,
    x: Vec<Arc<dyn Predicate>>,
    abx: Vec<Arc<dyn Predicate>>,
}

impl FilterManager {
    pub fn new(filters: Vec<Arc<dyn Predicate>>) -> FilterManager {
        let mut manager = FilterManager::default();

        for filter in filters {
            let bucket = match filter.scope() {
                FilterScope::By => &mut manager.by,
                FilterScope::Generic => &mut manager.generic,
                FilterScope::OnAcrossBy => &mut manager.on_across_by,
                FilterScope::A => &mut manager.a,
                FilterScope::B => &mut manager.b,
                FilterScope::X => &mut manager.x,
                FilterScope::Abx => &mut manager.abx,
            };
            bucket.push(filter);
        }

        manager
    }

    pub fn has_a(&self) -> bool {
        !self.a.is_empty()
    }

    pub fn has_b(&self) -> bool {
        !self.b.is_empty()
    }

    pub fn has_x(&self) -> bool {
        !self.x.is_empty()
    }

    pub fn has_abx(&self) -> bool {
        !self.abx.is_empty()
    }

    pub fn has_singleton_filters(&self) -> bool {
        self.has_a() || self.has_b() || self.has_x()
    }

    /// True when any A, B, X or ABX filter is configured. Such filters
    /// cannot be summarized analytically.
    pub fn has_item_or_triplet_filters(&self) -> bool {
        self.has_singleton_filters() || self.has_abx()
    }

    pub fn by_filter(&self, ctx: &Context, view: &GroupView) -> Result<bool> {
        for filter in &self.by {
            if !filter.keep_group(ctx, view)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn generic_filter(&self, ctx: &Context, view: &GroupView, items: Vec<u32>) -> Result<Vec<u32>> {
        apply_item_filters(&self.generic, ctx, view, items)
    }

    pub fn on_across_by_filter(&self, ctx: &Context) -> Result<bool> {
        for filter in &self.on_across_by {
            if !filter.keep_block(ctx)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn a_filter(&self, ctx: &Context, view: &GroupView, items: Vec<u32>) -> Result<Vec<u32>> {
        apply_item_filters(&self.a, ctx, view, items)
    }

    pub fn b_filter(&self, ctx: &Context, view: &GroupView, items: Vec<u32>) -> Result<Vec<u32>> {
        apply_item_filters(&self.b, ctx, view, items)
    }

    pub fn x_filter(&self, ctx: &Context, view: &GroupView, items: Vec<u32>) -> Result<Vec<u32>> {
        apply_item_filters(&self.x, ctx, view, items)
    }

    /// Keep mask over `triplets`, the AND of every ABX filter.
    pub fn abx_filter(&self, ctx: &Context, view: &GroupView, triplets: &[Triplet]) -> Result<Vec<bool>> {
        let mut mask = vec![true; triplets.len()];

        for filter in &self.abx {
            let flags = filter.retain_triplets(ctx, view, triplets)?;
            if flags.len() != triplets.len() {
                return Err(AbxError::evaluation(
                    filter.name(),
                    format!("returned {} flags for {} triplets", flags.len(), triplets.len()),
                ));
            }
            for (keep, flag) in mask.iter_mut().zip(flags) {
                *keep &= flag;
            }
        }

        Ok(mask)
    }
}

/// Applies filters in turn. `items` must be sorted; every filter must return
/// a subset of its input, which is re-sorted and deduplicated.
fn apply_item_filters(
    filters: &[Arc<dyn Predicate>],
    ctx: &Context,
    view: &GroupView,
    mut items: Vec<u32>,
) -> Result<Vec<u32>> {
    for filter in filters {
        let mut retained = filter.retain_items(ctx, view, &items)?;
        retained.sort_unstable();
        retained.dedup();

        if let Some(stray) = retained.iter().find(|r| items.binary_search(r).is_err()) {
            return Err(AbxError::evaluation(
                filter.name(),
                format!("retained item {} that was not a candidate", stray),
            ));
        }

        items = retained;
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::database::ItemTable;

    fn view() -> GroupView {
        let rows: Vec<Vec<String>> = ["a", "b", "a", "c"].iter().map(|v| vec![v.to_string()]).collect();
        let table = Arc::new(ItemTable::new(&["phone"], &rows).unwrap());
        GroupView::new(table, vec![0, 1, 2, 3])
    }

    #[test]
    fn test_item_filters_are_combined_in_order() {
        let view = view();
        let ctx = Context::new(&view, 0);

        let not_b: Arc<dyn Predicate> = Arc::new(
            ItemFilter::new("not_b", FilterScope::A, |_: &Context, v: &GroupView, i| v.value(i, 0) != "b").unwrap(),
        );
        let not_c: Arc<dyn Predicate> = Arc::new(
            ItemFilter::new("not_c", FilterScope::A, |_: &Context, v: &GroupView, i| v.value(i, 0) != "c").unwrap(),
        );

        let manager = FilterManager::new(vec![not_b, not_c]);
        assert!(manager.has_a());
        assert!(manager.has_item_or_triplet_filters());
        assert_eq!(manager.a_filter(&ctx, &view, vec![0, 1, 2, 3]).unwrap(), vec![0, 2]);
        assert_eq!(manager.b_filter(&ctx, &view, vec![0, 1]).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_stray_item_is_an_evaluation_error() {
        struct Liar;

        impl Predicate for Liar {
            fn name(&self) -> &str {
                "liar"
            }

            fn scope(&self) -> FilterScope {
                FilterScope::X
            }

            fn retain_items(&self, _ctx: &Context, _view: &GroupView, _candidates: &[u32]) -> Result<Vec<u32>> {
                Ok(vec![42])
            }
        }

        let view = view();
        let ctx = Context::new(&view, 0);
        let manager = FilterManager::new(vec![Arc::new(Liar)]);
        assert!(matches!(
            manager.x_filter(&ctx, &view, vec![0, 1]),
            Err(AbxError::Evaluation { .. })
        ));
    }

    #[test]
    fn test_abx_masks_are_anded() {
        let view = view();
        let ctx = Context::new(&view, 0);

        let first: Arc<dyn Predicate> = Arc::new(TripletFilter::new("a_not_0", |_: &Context, _: &GroupView, t: &Triplet| t[0] != 0));
        let second: Arc<dyn Predicate> = Arc::new(TripletFilter::new("x_not_3", |_: &Context, _: &GroupView, t: &Triplet| t[2] != 3));

        let manager = FilterManager::new(vec![first, second]);
        let mask = manager
            .abx_filter(&ctx, &view, &[[0, 1, 2], [2, 1, 0], [2, 1, 3]])
            .unwrap();
        assert_eq!(mask, vec![false, true, false]);
    }

    #[test]
    fn test_item_filter_rejects_block_scope() {
        let result = ItemFilter::new("bad", FilterScope::OnAcrossBy, |_: &Context, _: &GroupView, _| true);
        assert!(result.is_err());
    }
}
