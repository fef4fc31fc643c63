use std::sync::Arc;

use ahash::AHashSet;

use crate::core::{
    error::{AbxError, Result},
    triplets::Triplet,
    type_fitting::IntType,
};

use super::{Context, GroupView};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegressorScope {
    By,
    OnAcrossBy,
    A,
    B,
    X,
    Abx,
}

impl RegressorScope {
    /// Scopes whose value is constant across a by-group or a block.
    pub fn is_broadcast(&self) -> bool {
        matches!(self, RegressorScope::By | RegressorScope::OnAcrossBy)
    }
}

/// Declared shape of one regressor output column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegressorOutput {
    pub name: String,
    pub width: usize,
    pub item_type: IntType,
}

/// Row-major, integer-coded regressor values.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegressorValues {
    pub width: usize,
    pub data: Vec<i64>,
}

impl RegressorValues {
    pub fn new(width: usize) -> RegressorValues {
        RegressorValues { width, data: Vec::new() }
    }

    pub fn from_column(data: Vec<i64>) -> RegressorValues {
        RegressorValues { width: 1, data }
    }

    pub fn rows(&self) -> usize {
        if self.width == 0 { 0 } else { self.data.len() / self.width }
    }

    #[inline]
    pub fn row(&self, index: usize) -> &[i64] {
        &self.data[index * self.width..(index + 1) * self.width]
    }

    pub fn push_row(&mut self, row: &[i64]) {
        debug_assert_eq!(row.len(), self.width);
        self.data.extend_from_slice(row);
    }

    /// Rows picked by `indices`, in that order.
    pub fn take(&self, indices: impl IntoIterator<Item = usize>) -> RegressorValues {
        let mut out = RegressorValues::new(self.width);
        for index in indices {
            out.push_row(self.row(index));
        }
        out
    }

    /// Repeats row 0 `rows` times.
    pub fn broadcast(&self, rows: usize) -> RegressorValues {
        let mut out = RegressorValues::new(self.width);
        out.data.reserve(rows * self.width);
        for _ in 0..rows {
            out.push_row(self.row(0));
        }
        out
    }

    /// Values as the raw `u64` bits stored in datasets.
    pub fn to_bits(&self) -> Vec<u64> {
        self.data.iter().map(|v| *v as u64).collect()
    }
}

#[derive(Clone, Copy)]
pub enum RegressorInput<'a> {
    /// By and on-across-by scopes: evaluate once for the context.
    Context,
    /// A, B and X scopes: one output row per candidate item.
    Items(&'a [u32]),
    /// ABX scope: one output row per triplet.
    Triplets(&'a [Triplet]),
}

impl RegressorInput<'_> {
    fn expected_rows(&self) -> usize {
        match self {
            RegressorInput::Context => 1,
            RegressorInput::Items(items) => items.len(),
            RegressorInput::Triplets(triplets) => triplets.len(),
        }
    }
}

/// A late-bound regressor producing one value column per declared output.
pub trait RegressorFn: Send + Sync {
    fn scope(&self) -> RegressorScope;

    fn outputs(&self) -> &[RegressorOutput];

    fn evaluate(&self, ctx: &Context, view: &GroupView, input: RegressorInput<'_>) -> Result<Vec<RegressorValues>>;
}

/// A, B or X regressor computing one value per item.
pub struct ItemRegressor<F> {
    scope: RegressorScope,
    outputs: [RegressorOutput; 1],
    f: F,
}

impl<F> ItemRegressor<F>
where
    F: Fn(&Context, &GroupView, u32) -> i64 + Send + Sync,
{
    pub fn new(name: &str, scope: RegressorScope, item_type: IntType, f: F) -> Result<Self> {
        match scope {
            RegressorScope::A | RegressorScope::B | RegressorScope::X => Ok(Self {
                scope,
                outputs: [RegressorOutput { name: name.to_string(), width: 1, item_type }],
                f,
            }),
            other => Err(AbxError::Configuration(format!(
                "item regressor '{}' cannot have scope {:?}",
                name, other
            ))),
        }
    }
}

impl<F> RegressorFn for ItemRegressor<F>
where
    F: Fn(&Context, &GroupView, u32) -> i64 + Send + Sync,
{
    fn scope(&self) -> RegressorScope {
        self.scope
    }

    fn outputs(&self) -> &[RegressorOutput] {
        &self.outputs
    }

    fn evaluate(&self, ctx: &Context, view: &GroupView, input: RegressorInput<'_>) -> Result<Vec<RegressorValues>> {
        match input {
            RegressorInput::Items(items) => Ok(vec![RegressorValues::from_column(
                items.iter().map(|item| (self.f)(ctx, view, *item)).collect(),
            )]),
            _ => Err(AbxError::evaluation(&self.outputs[0].name, "expected item candidates")),
        }
    }
}

/// By or on-across-by regressor computing one value per context.
pub struct ContextRegressor<F> {
    scope: RegressorScope,
    outputs: [RegressorOutput; 1],
    f: F,
}

impl<F> ContextRegressor<F>
where
    F: Fn(&Context) -> i64 + Send + Sync,
{
    pub fn new(name: &str, scope: RegressorScope, item_type: IntType, f: F) -> Result<Self> {
        if !scope.is_broadcast() {
            return Err(AbxError::Configuration(format!(
                "context regressor '{}' cannot have scope {:?}",
                name, scope
            )));
        }

        Ok(Self {
            scope,
            outputs: [RegressorOutput { name: name.to_string(), width: 1, item_type }],
            f,
        })
    }
}

impl<F> RegressorFn for ContextRegressor<F>
where
    F: Fn(&Context) -> i64 + Send + Sync,
{
    fn scope(&self) -> RegressorScope {
        self.scope
    }

    fn outputs(&self) -> &[RegressorOutput] {
        &self.outputs
    }

    fn evaluate(&self, ctx: &Context, _view: &GroupView, _input: RegressorInput<'_>) -> Result<Vec<RegressorValues>> {
        Ok(vec![RegressorValues::from_column(vec![(self.f)(ctx)])])
    }
}

/// ABX regressor computing one value per triplet.
pub struct TripletRegressor<F> {
    outputs: [RegressorOutput; 1],
    f: F,
}

impl<F> TripletRegressor<F>
where
    F: Fn(&Context, &GroupView, &Triplet) -> i64 + Send + Sync,
{
    pub fn new(name: &str, item_type: IntType, f: F) -> Self {
        Self {
            outputs: [RegressorOutput { name: name.to_string(), width: 1, item_type }],
            f,
        }
    }
}

impl<F> RegressorFn for TripletRegressor<F>
where
    F: Fn(&Context, &GroupView, &Triplet) -> i64 + Send + Sync,
{
    fn scope(&self) -> RegressorScope {
        RegressorScope::Abx
    }

    fn outputs(&self) -> &[RegressorOutput] {
        &self.outputs
    }

    fn evaluate(&self, ctx: &Context, view: &GroupView, input: RegressorInput<'_>) -> Result<Vec<RegressorValues>> {
        match input {
            RegressorInput::Triplets(triplets) => Ok(vec![RegressorValues::from_column(
                triplets.iter().map(|t| (self.f)(ctx, view, t)).collect(),
            )]),
            _ => Err(AbxError::evaluation(&self.outputs[0].name, "expected triplets")),
        }
    }
}

/// One evaluated output column.
#[derive(Debug, Clone)]
pub struct NamedValues {
    pub output: RegressorOutput,
    pub values: RegressorValues,
}

#[derive(Clone, Default)]
pub struct RegressorManager {
    regressors: Vec<Arc<dyn RegressorFn>>,
}

impl RegressorManager {
    pub fn new(regressors: Vec<Arc<dyn RegressorFn>>) -> Result<RegressorManager> {
        let mut seen = AHashSet::new();

        for regressor in &regressors {
            for output in regressor.outputs() {
                validate_output_name(&output.name)?;

                if output.width == 0 {
                    return Err(AbxError::Configuration(format!(
                        "regressor output '{}' has zero width",
                        output.name
                    )));
                }

                if !seen.insert(output.name.clone()) {
                    return Err(AbxError::Configuration(format!(
                        "regressor output '{}' is declared twice",
                        output.name
                    )));
                }
            }
        }

        Ok(RegressorManager { regressors })
    }

    pub fn is_empty(&self) -> bool {
        self.regressors.is_empty()
    }

    /// Every output column, in declaration order.
    pub fn outputs(&self) -> Vec<RegressorOutput> {
        self.regressors
            .iter()
            .flat_map(|r| r.outputs().iter().cloned())
            .collect()
    }

    /// Evaluates every regressor of `scope` and checks the returned shapes.
    pub fn evaluate(
        &self,
        scope: RegressorScope,
        ctx: &Context,
        view: &GroupView,
        input: RegressorInput<'_>,
    ) -> Result<Vec<NamedValues>> {
        let expected_rows = input.expected_rows();
        let mut evaluated = Vec::new();

        for regressor in self.regressors.iter().filter(|r| r.scope() == scope) {
            let outputs = regressor.outputs();
            let values = regressor.evaluate(ctx, view, input)?;

            if values.len() != outputs.len() {
                let name = outputs.first().map(|o| o.name.as_str()).unwrap_or("regressor");
                return Err(AbxError::evaluation(
                    name,
                    format!("returned {} outputs, declared {}", values.len(), outputs.len()),
                ));
            }

            for (output, values) in outputs.iter().zip(values) {
                if values.width != output.width || values.data.len() != expected_rows * output.width {
                    return Err(AbxError::evaluation(
                        &output.name,
                        format!(
                            "returned {} values of width {}, expected {} rows of width {}",
                            values.data.len(),
                            values.width,
                            expected_rows,
                            output.width
                        ),
                    ));
                }

                if let Some(value) = values.data.iter().find(|v| !output.item_type.holds(**v)) {
                    return Err(AbxError::evaluation(
                        &output.name,
                        format!("value {} does not fit the declared type {}", value, output.item_type),
                    ));
                }

                evaluated.push(NamedValues {
                    output: output.clone(),
                    values,
                });
            }
        }

        Ok(evaluated)
    }
}

/// Output names become dataset file names.
fn validate_output_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && name != "runs";

    if valid {
        Ok(())
    } else {
        Err(AbxError::Configuration(format!(
            "invalid regressor output name '{}'",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::database::ItemTable;

    fn view() -> GroupView {
        let rows: Vec<Vec<String>> = ["a", "b", "c"].iter().map(|v| vec![v.to_string()]).collect();
        let table = Arc::new(ItemTable::new(&["phone"], &rows).unwrap());
        GroupView::new(table, vec![0, 1, 2])
    }

    #[test]
    fn test_values_take_and_broadcast() {
        let values = RegressorValues { width: 2, data: vec![1, 2, 3, 4, 5, 6] };
        assert_eq!(values.rows(), 3);
        assert_eq!(values.take([2, 0]).data, vec![5, 6, 1, 2]);
        assert_eq!(values.broadcast(2).data, vec![1, 2, 1, 2]);
    }

    #[test]
    fn test_manager_rejects_duplicated_outputs() {
        let first: Arc<dyn RegressorFn> = Arc::new(
            ItemRegressor::new("phone_A", RegressorScope::A, IntType::U8, |_: &Context, _: &GroupView, i| i as i64).unwrap(),
        );
        let second: Arc<dyn RegressorFn> = Arc::new(
            ItemRegressor::new("phone_A", RegressorScope::B, IntType::U8, |_: &Context, _: &GroupView, i| i as i64).unwrap(),
        );
        assert!(matches!(
            RegressorManager::new(vec![first, second]),
            Err(AbxError::Configuration(_))
        ));
    }

    #[test]
    fn test_manager_checks_row_counts() {
        struct Short {
            outputs: [RegressorOutput; 1],
        }

        impl RegressorFn for Short {
            fn scope(&self) -> RegressorScope {
                RegressorScope::A
            }

            fn outputs(&self) -> &[RegressorOutput] {
                &self.outputs
            }

            fn evaluate(&self, _ctx: &Context, _view: &GroupView, _input: RegressorInput<'_>) -> Result<Vec<RegressorValues>> {
                Ok(vec![RegressorValues::from_column(vec![1])])
            }
        }

        let view = view();
        let ctx = Context::new(&view, 0);
        let manager = RegressorManager::new(vec![Arc::new(Short {
            outputs: [RegressorOutput { name: "short".to_string(), width: 1, item_type: IntType::U8 }],
        })])
        .unwrap();

        let result = manager.evaluate(RegressorScope::A, &ctx, &view, RegressorInput::Items(&[0, 1]));
        assert!(matches!(result, Err(AbxError::Evaluation { .. })));
    }

    #[test]
    fn test_manager_rejects_values_outside_the_declared_type() {
        let view = view();
        let ctx = Context::new(&view, 0);

        let wide: Arc<dyn RegressorFn> = Arc::new(
            ItemRegressor::new("wide_A", RegressorScope::A, IntType::U8, |_: &Context, _: &GroupView, i| 254 + i as i64).unwrap(),
        );
        let manager = RegressorManager::new(vec![wide]).unwrap();

        let fits = manager
            .evaluate(RegressorScope::A, &ctx, &view, RegressorInput::Items(&[0, 1]))
            .unwrap();
        assert_eq!(fits[0].values.data, vec![254, 255]);

        let result = manager.evaluate(RegressorScope::A, &ctx, &view, RegressorInput::Items(&[1, 2]));
        assert!(matches!(result, Err(AbxError::Evaluation { .. })));
    }

    #[test]
    fn test_evaluate_only_matching_scope() {
        let view = view();
        let ctx = Context::new(&view, 0);

        let item: Arc<dyn RegressorFn> = Arc::new(
            ItemRegressor::new("phone_B", RegressorScope::B, IntType::U8, |_: &Context, v: &GroupView, i| v.code(i, 0) as i64).unwrap(),
        );
        let block: Arc<dyn RegressorFn> = Arc::new(
            ContextRegressor::new("phone", RegressorScope::OnAcrossBy, IntType::U8, |c: &Context| c.code("phone").unwrap_or(0) as i64).unwrap(),
        );

        let manager = RegressorManager::new(vec![item, block]).unwrap();
        let evaluated = manager
            .evaluate(RegressorScope::B, &ctx, &view, RegressorInput::Items(&[2, 1]))
            .unwrap();
        assert_eq!(evaluated.len(), 1);
        assert_eq!(evaluated[0].values.data, vec![2, 1]);

        let evaluated = manager
            .evaluate(RegressorScope::OnAcrossBy, &ctx, &view, RegressorInput::Context)
            .unwrap();
        assert_eq!(evaluated[0].values.data, vec![0]);
    }
}
