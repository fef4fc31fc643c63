//! Command-line filter and regressor expressions.
//!
//! Filters: `OPERAND (==|!=) OPERAND`, where an operand is `attr_A`,
//! `attr_B`, `attr_X` (the attribute of one triplet component), a bare
//! `attr` (the attribute of the block) or a quoted or numeric literal.
//! Regressors: `attr_A`, `attr_B`, `attr_X` or `attr`, valued with the
//! attribute level code.

use std::sync::Arc;

use crate::core::{
    database::ItemTable,
    error::{AbxError, Result},
    triplets::Triplet,
    type_fitting::fit_integer_type,
};

use super::{
    Context, GroupView,
    filters::{FilterScope, Predicate},
    regressors::{ContextRegressor, ItemRegressor, RegressorFn, RegressorScope},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Component {
    A,
    B,
    X,
}

impl Component {
    fn position(&self) -> usize {
        match self {
            Component::A => 0,
            Component::B => 1,
            Component::X => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Item { column: usize, component: Component },
    Block { column: usize },
    Literal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
}

/// Filter compiled from an expression.
#[derive(Debug)]
pub struct ExpressionFilter {
    name: String,
    scope: FilterScope,
    lhs: Operand,
    op: CmpOp,
    rhs: Operand,
}

/// Which candidate items the operands may refer to.
#[derive(Clone, Copy, Default)]
struct Bindings {
    a: Option<u32>,
    b: Option<u32>,
    x: Option<u32>,
}

impl ExpressionFilter {
    fn resolve<'v>(&self, operand: &'v Operand, ctx: &Context, view: &'v GroupView, bindings: Bindings) -> Result<&'v str> {
        match operand {
            Operand::Literal(value) => Ok(value.as_str()),
            Operand::Block { column } => Ok(view.value(ctx.row(), *column)),
            Operand::Item { column, component } => {
                let item = match component {
                    Component::A => bindings.a,
                    Component::B => bindings.b,
                    Component::X => bindings.x,
                };

                item.map(|item| view.value(item, *column))
                    .ok_or_else(|| AbxError::evaluation(&self.name, format!("{:?} is not bound", component)))
            }
        }
    }

    fn evaluate(&self, ctx: &Context, view: &GroupView, bindings: Bindings) -> Result<bool> {
        let lhs = self.resolve(&self.lhs, ctx, view, bindings)?;
        let rhs = self.resolve(&self.rhs, ctx, view, bindings)?;

        Ok(match self.op {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        })
    }
}

impl Predicate for ExpressionFilter {
    fn name(&self) -> &str {
        &self.name
    }

    fn scope(&self) -> FilterScope {
        self.scope
    }

    fn keep_group(&self, ctx: &Context, view: &GroupView) -> Result<bool> {
        self.evaluate(ctx, view, Bindings::default())
    }

    fn keep_block(&self, ctx: &Context) -> Result<bool> {
        self.evaluate(ctx, ctx.view(), Bindings::default())
    }

    fn retain_items(&self, ctx: &Context, view: &GroupView, candidates: &[u32]) -> Result<Vec<u32>> {
        let mut retained = Vec::with_capacity(candidates.len());

        for item in candidates {
            let bindings = match self.scope {
                FilterScope::A => Bindings { a: Some(*item), ..Default::default() },
                FilterScope::B => Bindings { b: Some(*item), ..Default::default() },
                _ => Bindings { x: Some(*item), ..Default::default() },
            };

            if self.evaluate(ctx, view, bindings)? {
                retained.push(*item);
            }
        }

        Ok(retained)
    }

    fn retain_triplets(&self, ctx: &Context, view: &GroupView, triplets: &[Triplet]) -> Result<Vec<bool>> {
        triplets
            .iter()
            .map(|t| {
                let bindings = Bindings { a: Some(t[0]), b: Some(t[1]), x: Some(t[2]) };
                self.evaluate(ctx, view, bindings)
            })
            .collect()
    }
}

/// Parses a filter expression. `by` lists the task's by attributes: a filter
/// that only reads block attributes, all of them by attributes, is applied
/// per by-group; otherwise per on-across block.
pub fn parse_filter(expression: &str, table: &ItemTable, by: &[String]) -> Result<Arc<dyn Predicate>> {
    let (op, lhs, rhs) = if let Some((lhs, rhs)) = expression.split_once("==") {
        (CmpOp::Eq, lhs, rhs)
    } else if let Some((lhs, rhs)) = expression.split_once("!=") {
        (CmpOp::Ne, lhs, rhs)
    } else {
        return Err(AbxError::Parse(format!(
            "filter '{}' needs a '==' or '!=' comparison",
            expression
        )));
    };

    let lhs = parse_operand(lhs.trim(), table, expression)?;
    let rhs = parse_operand(rhs.trim(), table, expression)?;

    let mut components: Vec<Component> = [&lhs, &rhs]
        .iter()
        .filter_map(|o| match o {
            Operand::Item { component, .. } => Some(*component),
            _ => None,
        })
        .collect();
    components.sort_by_key(|c| c.position());
    components.dedup();

    let scope = match components.as_slice() {
        [] => {
            let all_by = [&lhs, &rhs].iter().all(|o| match o {
                Operand::Block { column } => by.iter().any(|b| b == &table.column(*column).name),
                _ => true,
            });
            if all_by { FilterScope::By } else { FilterScope::OnAcrossBy }
        }
        [Component::A] => FilterScope::A,
        [Component::B] => FilterScope::B,
        [Component::X] => FilterScope::X,
        _ => FilterScope::Abx,
    };

    Ok(Arc::new(ExpressionFilter {
        name: expression.trim().to_string(),
        scope,
        lhs,
        op,
        rhs,
    }))
}

/// Parses a regressor expression.
pub fn parse_regressor(expression: &str, table: &ItemTable) -> Result<Arc<dyn RegressorFn>> {
    let name = expression.trim();

    match parse_operand(name, table, expression)? {
        Operand::Item { column, component } => {
            let scope = match component {
                Component::A => RegressorScope::A,
                Component::B => RegressorScope::B,
                Component::X => RegressorScope::X,
            };
            let item_type = fit_integer_type(table.column(column).nb_levels().saturating_sub(1) as u64, false);

            let regressor = ItemRegressor::new(name, scope, item_type, move |_: &Context, view: &GroupView, item| {
                view.code(item, column) as i64
            })?;

            Ok(Arc::new(regressor))
        }
        Operand::Block { column } => {
            let item_type = fit_integer_type(table.column(column).nb_levels().saturating_sub(1) as u64, false);

            let regressor = ContextRegressor::new(name, RegressorScope::OnAcrossBy, item_type, move |ctx: &Context| {
                ctx.view().code(ctx.row(), column) as i64
            })?;

            Ok(Arc::new(regressor))
        }
        Operand::Literal(_) => Err(AbxError::Parse(format!(
            "regressor '{}' must name an attribute",
            expression
        ))),
    }
}

fn parse_operand(token: &str, table: &ItemTable, expression: &str) -> Result<Operand> {
    if token.is_empty() {
        return Err(AbxError::Parse(format!("missing operand in '{}'", expression)));
    }

    for quote in ['\'', '"'] {
        if token.len() >= 2 && token.starts_with(quote) && token.ends_with(quote) {
            return Ok(Operand::Literal(token[1..token.len() - 1].to_string()));
        }
    }

    if let Some(column) = table.column_index(token) {
        return Ok(Operand::Block { column });
    }

    if let Some((attribute, suffix)) = token.rsplit_once('_') {
        let component = match suffix {
            "A" => Some(Component::A),
            "B" => Some(Component::B),
            "X" => Some(Component::X),
            _ => None,
        };

        if let Some(component) = component {
            return match table.column_index(attribute) {
                Some(column) => Ok(Operand::Item { column, component }),
                None => Err(AbxError::Configuration(format!(
                    "attribute '{}' in '{}' is not defined in the database",
                    attribute, expression
                ))),
            };
        }
    }

    if token.parse::<f64>().is_ok() {
        return Ok(Operand::Literal(token.to_string()));
    }

    Err(AbxError::Configuration(format!(
        "'{}' in '{}' is neither an attribute nor a literal",
        token, expression
    )))
}
