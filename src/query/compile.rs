/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Compiles an algebra tree into a tree of evaluation steps.
//!
//! Strategies are chosen here, once per query: join algorithms, left join
//! variants, slice windows. A compiled step is immutable and can be evaluated
//! any number of times, with any context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use itertools::Itertools;
use log::debug;
use miette::{bail, Diagnostic, Result};
use thiserror::Error;

use crate::data::binding::BindingSet;
use crate::query::algebra::{JoinAlgorithm, ServiceExpr, TupleExpr};
use crate::query::filter::{ExtensionStep, FilterStep};
use crate::query::group::GroupStep;
use crate::query::join::{HashJoin, JoinStep, NestedLoopJoin};
use crate::query::left_join::{
    split_condition, HashLeftJoin, LeftJoinStep, LeftJoinStrategy, NestedLoopLeftJoin,
};
use crate::query::pattern::PatternStep;
use crate::query::project::{DistinctStep, ProjectionStep, ReducedStep};
use crate::query::service::{ServiceCall, ServiceJoin, ServiceLeftJoin, ServiceStep};
use crate::query::set_ops::{
    InMemorySetFactory, IntersectionStep, MinusStep, SetFactory, UnionStep,
};
use crate::query::slice::SliceStep;
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::query::sort::OrderStep;
use crate::query::values::ValuesStep;
use crate::runtime::evaluator::Poison;
use crate::runtime::federation::ServiceResolver;
use crate::runtime::options::EvalOptions;
use crate::runtime::source::TripleSource;

/// A compiled operator
pub(crate) enum EvalStep {
    Pattern(PatternStep),
    Join(Box<JoinStep>),
    LeftJoin(Box<LeftJoinStep>),
    Union(Box<UnionStep>),
    Minus(Box<MinusStep>),
    Intersection(Box<IntersectionStep>),
    Slice(Box<SliceStep>),
    Values(ValuesStep),
    Filter(Box<FilterStep>),
    Extension(Box<ExtensionStep>),
    Projection(Box<ProjectionStep>),
    Distinct(Box<DistinctStep>),
    Reduced(Box<ReducedStep>),
    Order(Box<OrderStep>),
    Group(Box<GroupStep>),
    Service(Box<ServiceStep>),
    Empty,
    Singleton,
    Tracked(Box<TrackedStep>),
}

impl std::fmt::Debug for EvalStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.step_type())
    }
}

impl EvalStep {
    /// Evaluates the step. Every produced row extends `bindings`.
    /// Loops pulling rows from upstream stop with an error once `poison` is killed.
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        match self {
            EvalStep::Pattern(s) => s.evaluate(bindings, poison),
            EvalStep::Join(s) => s.evaluate(bindings, poison),
            EvalStep::LeftJoin(s) => s.evaluate(bindings, poison),
            EvalStep::Union(s) => s.evaluate(bindings, poison),
            EvalStep::Minus(s) => s.evaluate(bindings, poison),
            EvalStep::Intersection(s) => s.evaluate(bindings, poison),
            EvalStep::Slice(s) => s.evaluate(bindings, poison),
            EvalStep::Values(s) => s.evaluate(bindings),
            EvalStep::Filter(s) => s.evaluate(bindings, poison),
            EvalStep::Extension(s) => s.evaluate(bindings, poison),
            EvalStep::Projection(s) => s.evaluate(bindings, poison),
            EvalStep::Distinct(s) => s.evaluate(bindings, poison),
            EvalStep::Reduced(s) => s.evaluate(bindings, poison),
            EvalStep::Order(s) => s.evaluate(bindings, poison),
            EvalStep::Group(s) => s.evaluate(bindings, poison),
            EvalStep::Service(s) => s.evaluate(bindings, poison),
            EvalStep::Empty => Ok(Solutions::empty()),
            EvalStep::Singleton => Ok(Solutions::singleton(bindings.clone())),
            EvalStep::Tracked(s) => s.evaluate(bindings, poison),
        }
    }

    pub(crate) fn step_type(&self) -> &str {
        match self {
            EvalStep::Pattern(_) => "statement_pattern",
            EvalStep::Join(j) => j.join_type(),
            EvalStep::LeftJoin(j) => j.join_type(),
            EvalStep::Union(_) => "union",
            EvalStep::Minus(_) => "minus",
            EvalStep::Intersection(_) => "intersection",
            EvalStep::Slice(s) => s.slice_type(),
            EvalStep::Values(_) => "values",
            EvalStep::Filter(_) => "filter",
            EvalStep::Extension(_) => "extension",
            EvalStep::Projection(_) => "projection",
            EvalStep::Distinct(_) => "distinct",
            EvalStep::Reduced(_) => "reduced",
            EvalStep::Order(_) => "order",
            EvalStep::Group(_) => "group",
            EvalStep::Service(_) => "service",
            EvalStep::Empty => "empty_set",
            EvalStep::Singleton => "singleton_set",
            EvalStep::Tracked(t) => t.inner.step_type(),
        }
    }
}

/// Counts the rows a step produced over all its evaluations
pub(crate) struct TrackedStep {
    pub(crate) inner: EvalStep,
    pub(crate) counter: Arc<AtomicUsize>,
}

impl TrackedStep {
    fn evaluate<'a>(&'a self, bindings: &BindingSet, poison: &Poison) -> Result<Solutions<'a>> {
        Ok(Solutions::new(TrackedIter {
            inner: Some(self.inner.evaluate(bindings, poison)?),
            counter: &self.counter,
        }))
    }
}

struct TrackedIter<'a> {
    inner: Option<Solutions<'a>>,
    counter: &'a AtomicUsize,
}

impl SolutionIter for TrackedIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        let row = pull_from(&mut self.inner)?;
        if row.is_some() {
            self.counter.fetch_add(1, Ordering::Relaxed);
        }
        Ok(row)
    }
    fn release(&mut self) {
        close_child(&mut self.inner);
    }
}

/// Number of rows produced by one compiled step, in pre-order of the plan
#[derive(Debug, Clone)]
pub struct ResultSize {
    /// strategy of the step
    pub step_type: String,
    /// depth in the plan, the root being 0
    pub depth: usize,
    pub(crate) counter: Arc<AtomicUsize>,
}

impl ResultSize {
    /// Rows produced so far
    pub fn rows(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("Join algorithm {0:?} cannot be used with a right argument of this kind")]
#[diagnostic(code(compile::bad_join_algorithm))]
#[diagnostic(help("A vectored join needs a SERVICE as its right argument"))]
struct BadJoinAlgorithm(JoinAlgorithm);

/// Builds evaluation steps from algebra trees
pub(crate) struct QueryCompiler {
    source: Arc<dyn TripleSource>,
    resolver: Arc<ServiceResolver>,
    options: EvalOptions,
    set_factory: Arc<dyn SetFactory>,
}

impl QueryCompiler {
    pub(crate) fn new(
        source: Arc<dyn TripleSource>,
        resolver: Arc<ServiceResolver>,
        options: EvalOptions,
    ) -> Self {
        Self {
            source,
            resolver,
            options,
            set_factory: Arc::new(InMemorySetFactory),
        }
    }

    pub(crate) fn set_factory(&mut self, set_factory: Arc<dyn SetFactory>) {
        self.set_factory = set_factory;
    }

    pub(crate) fn compile(&self, expr: &TupleExpr) -> Result<EvalStep> {
        self.compile_expr(expr, 0, &mut None)
    }

    /// Compiles with every step wrapped in a row counter
    pub(crate) fn compile_tracked(&self, expr: &TupleExpr) -> Result<(EvalStep, Vec<ResultSize>)> {
        let mut sizes = Some(vec![]);
        let step = self.compile_expr(expr, 0, &mut sizes)?;
        Ok((step, sizes.unwrap_or_default()))
    }

    fn service_call(&self, service: &ServiceExpr) -> ServiceCall {
        ServiceCall {
            service: service.clone(),
            resolver: self.resolver.clone(),
        }
    }

    fn compile_expr(
        &self,
        expr: &TupleExpr,
        depth: usize,
        sizes: &mut Option<Vec<ResultSize>>,
    ) -> Result<EvalStep> {
        if let TupleExpr::Slice {
            arg,
            offset: None | Some(0),
            limit: None,
        } = expr
        {
            debug!("slice without offset and limit elided");
            return self.compile_expr(arg, depth, sizes);
        }
        // reserve the slot so that sizes come out in pre-order
        let slot = sizes.as_mut().map(|s| {
            s.push(ResultSize {
                step_type: String::new(),
                depth,
                counter: Default::default(),
            });
            s.len() - 1
        });
        let mut sub = |e: &TupleExpr| self.compile_expr(e, depth + 1, sizes);

        let step = match expr {
            TupleExpr::StatementPattern(sp) => EvalStep::Pattern(PatternStep {
                pattern: sp.clone(),
                source: self.source.clone(),
            }),
            TupleExpr::Join {
                left,
                right,
                algorithm,
                join_vars,
            } => {
                let join_vars = join_vars
                    .clone()
                    .unwrap_or_else(|| TupleExpr::join_variables(left, right));
                let algorithm = algorithm.unwrap_or_else(|| choose_join_algorithm(right));
                let left_step = sub(left)?;
                let join = match (algorithm, right.as_ref()) {
                    (JoinAlgorithm::Vectored, TupleExpr::Service(service)) => {
                        JoinStep::Service(ServiceJoin {
                            left: left_step,
                            call: self.service_call(service),
                            batch_size: self.options.service_batch_size,
                        })
                    }
                    (JoinAlgorithm::Vectored, _) => bail!(BadJoinAlgorithm(algorithm)),
                    (JoinAlgorithm::Hash, _) => JoinStep::Hash(HashJoin {
                        left: left_step,
                        right: sub(right)?,
                        join_vars: join_vars.iter().cloned().collect_vec(),
                    }),
                    (JoinAlgorithm::NestedLoop, _) => JoinStep::NestedLoop(NestedLoopJoin {
                        left: left_step,
                        right: sub(right)?,
                    }),
                };
                debug!("using {} on {:?}", join.join_type(), join_vars);
                EvalStep::Join(Box::new(join))
            }
            TupleExpr::LeftJoin {
                left,
                right,
                condition,
            } => {
                let left_names = left.binding_names();
                let mut problem_vars = right.binding_names();
                if let Some(cond) = condition {
                    problem_vars.extend(cond.bindings());
                }
                problem_vars.retain(|v| !left_names.contains(v));

                let left_step = sub(left)?;
                let strategy = if let TupleExpr::Service(service) = right.as_ref() {
                    LeftJoinStrategy::Service(ServiceLeftJoin {
                        left: left_step,
                        call: self.service_call(service),
                        batch_size: self.options.service_batch_size,
                        condition: condition.clone(),
                    })
                } else if is_out_of_scope(right) {
                    LeftJoinStrategy::Hash(HashLeftJoin {
                        left: left_step,
                        right: sub(right)?,
                        join_vars: TupleExpr::join_variables(left, right)
                            .into_iter()
                            .collect_vec(),
                        condition: condition.clone(),
                    })
                } else {
                    let (guard, residual) = split_condition(
                        condition.clone(),
                        &left.assured_binding_names(),
                        &right.binding_names(),
                    );
                    LeftJoinStrategy::NestedLoop(NestedLoopLeftJoin {
                        left: left_step,
                        right: sub(right)?,
                        guard,
                        residual,
                    })
                };
                let join = LeftJoinStep {
                    problem_vars,
                    strategy,
                };
                debug!(
                    "using {}, not well designed when the context binds any of {:?}",
                    join.join_type(),
                    join.problem_vars
                );
                EvalStep::LeftJoin(Box::new(join))
            }
            TupleExpr::Union(left, right) => EvalStep::Union(Box::new(UnionStep {
                left: sub(left)?,
                right: sub(right)?,
            })),
            TupleExpr::Difference(left, right) => EvalStep::Minus(Box::new(MinusStep {
                left: sub(left)?,
                right: sub(right)?,
            })),
            TupleExpr::Intersection(left, right) => {
                EvalStep::Intersection(Box::new(IntersectionStep {
                    left: sub(left)?,
                    right: sub(right)?,
                    set_factory: self.set_factory.clone(),
                }))
            }
            TupleExpr::Slice { arg, offset, limit } => {
                let mut arg = sub(arg)?;
                if let Some(limit) = limit {
                    limit_sort(&mut arg, offset.unwrap_or(0).saturating_add(*limit));
                }
                match SliceStep::new(arg, *offset, *limit) {
                    Ok(slice) => {
                        debug!("using {} slice", slice.slice_type());
                        EvalStep::Slice(Box::new(slice))
                    }
                    Err(arg) => arg,
                }
            }
            TupleExpr::BindingSetAssignment { rows, .. } => {
                EvalStep::Values(ValuesStep { rows: rows.clone() })
            }
            TupleExpr::Filter { arg, condition } => EvalStep::Filter(Box::new(FilterStep {
                arg: sub(arg)?,
                condition: Some(condition.clone()),
            })),
            TupleExpr::Extension { arg, elements } => {
                EvalStep::Extension(Box::new(ExtensionStep {
                    arg: sub(arg)?,
                    elements: elements.clone(),
                }))
            }
            TupleExpr::Projection {
                arg,
                elements,
                subquery,
            } => EvalStep::Projection(Box::new(ProjectionStep {
                arg: sub(arg)?,
                elements: elements.clone(),
                subquery: *subquery,
            })),
            TupleExpr::Distinct(arg) => EvalStep::Distinct(Box::new(DistinctStep {
                arg: sub(arg)?,
                set_factory: self.set_factory.clone(),
            })),
            TupleExpr::Reduced(arg) => {
                EvalStep::Reduced(Box::new(ReducedStep { arg: sub(arg)? }))
            }
            TupleExpr::Order { arg, elements } => EvalStep::Order(Box::new(OrderStep {
                arg: sub(arg)?,
                elements: elements.clone(),
                limit: None,
            })),
            TupleExpr::Group {
                arg,
                group_by,
                aggregates,
            } => EvalStep::Group(Box::new(GroupStep {
                arg: sub(arg)?,
                group_by: group_by.clone(),
                aggregates: aggregates.clone(),
            })),
            TupleExpr::Service(service) => EvalStep::Service(Box::new(ServiceStep {
                call: self.service_call(service),
            })),
            TupleExpr::EmptySet => EvalStep::Empty,
            TupleExpr::SingletonSet => EvalStep::Singleton,
        };

        Ok(match (sizes.as_mut(), slot) {
            (Some(sizes), Some(slot)) => {
                let size = &mut sizes[slot];
                size.step_type = step.step_type().to_string();
                EvalStep::Tracked(Box::new(TrackedStep {
                    inner: step,
                    counter: size.counter.clone(),
                }))
            }
            _ => step,
        })
    }
}

/// Tells a sort feeding a slice that only its first `n` rows will be read.
/// Only looks through steps that neither drop nor add rows.
fn limit_sort(step: &mut EvalStep, n: usize) {
    match step {
        EvalStep::Order(order) => {
            debug!("sort keeps only its top {} rows", n);
            order.limit = Some(n);
        }
        EvalStep::Tracked(t) => limit_sort(&mut t.inner, n),
        EvalStep::Extension(e) => limit_sort(&mut e.arg, n),
        EvalStep::Projection(p)
            if !p.subquery && p.elements.iter().all(|e| e.source == e.target) =>
        {
            limit_sort(&mut p.arg, n)
        }
        _ => {}
    }
}

/// A right side that must not see the left row: a subquery, or anything containing one
fn is_out_of_scope(right: &TupleExpr) -> bool {
    right.is_variable_scope_change() || right.contains_subquery()
}

fn choose_join_algorithm(right: &TupleExpr) -> JoinAlgorithm {
    if matches!(right, TupleExpr::Service(_)) {
        JoinAlgorithm::Vectored
    } else if is_out_of_scope(right) {
        JoinAlgorithm::Hash
    } else {
        JoinAlgorithm::NestedLoop
    }
}
