//! Side operations injected into a task: filters and regressors.
//!
//! The generator never looks inside a filter or a regressor. It only calls
//! the [`filters::Predicate`] and [`regressors::RegressorFn`] interfaces with
//! a block [`Context`], the by-group [`GroupView`] and the candidates at hand.

pub mod expressions;
pub mod filters;
pub mod regressors;

use std::sync::Arc;

use crate::core::database::ItemTable;

/// A by-group sub-table. Local index `i` maps to database row `rows[i]`.
#[derive(Debug, Clone)]
pub struct GroupView {
    table: Arc<ItemTable>,
    rows: Arc<[u32]>,
}

impl GroupView {
    pub fn new(table: Arc<ItemTable>, rows: Vec<u32>) -> GroupView {
        GroupView {
            table,
            rows: rows.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn table(&self) -> &ItemTable {
        &self.table
    }

    #[inline]
    pub fn global_row(&self, local: u32) -> u32 {
        self.rows[local as usize]
    }

    pub fn global_rows(&self) -> &[u32] {
        &self.rows
    }

    #[inline]
    pub fn code(&self, local: u32, column: usize) -> u32 {
        self.table.code(self.global_row(local) as usize, column)
    }

    #[inline]
    pub fn value(&self, local: u32, column: usize) -> &str {
        self.table.value(self.global_row(local) as usize, column)
    }

    pub fn value_by_name(&self, local: u32, name: &str) -> Option<&str> {
        self.table
            .column_index(name)
            .map(|column| self.value(local, column))
    }
}

/// Attribute values shared by every item of a by-group or of a block,
/// read from one representative item.
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    view: &'a GroupView,
    row: u32,
}

impl<'a> Context<'a> {
    pub fn new(view: &'a GroupView, row: u32) -> Context<'a> {
        Context { view, row }
    }

    /// Local index of the representative item.
    pub fn row(&self) -> u32 {
        self.row
    }

    pub fn view(&self) -> &'a GroupView {
        self.view
    }

    pub fn get(&self, name: &str) -> Option<&'a str> {
        self.view.value_by_name(self.row, name)
    }

    pub fn code(&self, name: &str) -> Option<u32> {
        self.view
            .table()
            .column_index(name)
            .map(|column| self.view.code(self.row, column))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_view_maps_local_to_database_rows() {
        let rows: Vec<Vec<String>> = [["a", "x"], ["b", "y"], ["c", "x"]]
            .iter()
            .map(|r| r.iter().map(|v| v.to_string()).collect())
            .collect();
        let table = Arc::new(ItemTable::new(&["phone", "talker"], &rows).unwrap());

        let view = GroupView::new(table, vec![2, 0]);
        assert_eq!(view.len(), 2);
        assert_eq!(view.value(0, 0), "c");
        assert_eq!(view.value_by_name(1, "phone"), Some("a"));

        let ctx = Context::new(&view, 1);
        assert_eq!(ctx.get("talker"), Some("x"));
        assert_eq!(ctx.get("missing"), None);
    }
}
