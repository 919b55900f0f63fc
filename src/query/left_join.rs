/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! `OPTIONAL`.
//!
//! Every strategy assumes the join is well designed for the context it is
//! evaluated in. When the context binds a variable that only the optional part
//! (or its condition) can bind, the strategy is run on the context with those
//! variables removed and the results are filtered against the full context
//! afterwards.

use std::collections::BTreeSet;
use std::mem;

use itertools::Itertools;
use log::{debug, trace};
use miette::Result;

use crate::data::binding::BindingSet;
use crate::data::expr::Expr;
use crate::data::symb::Symbol;
use crate::query::compile::EvalStep;
use crate::query::join::HashTable;
use crate::query::service::ServiceLeftJoin;
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;

pub(crate) struct LeftJoinStep {
    /// variables of the optional part and the condition not bound by the mandatory part
    pub(crate) problem_vars: BTreeSet<Symbol>,
    pub(crate) strategy: LeftJoinStrategy,
}

pub(crate) enum LeftJoinStrategy {
    NestedLoop(NestedLoopLeftJoin),
    Hash(HashLeftJoin),
    Service(ServiceLeftJoin),
}

impl LeftJoinStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        let problems = self.problem_vars_in(bindings);
        if problems.is_empty() {
            return self.evaluate_well_designed(bindings, poison);
        }
        debug!(
            "left join is not well designed for context variables {:?}",
            problems
        );
        let inner = self.evaluate_well_designed(&bindings.without(&problems), poison)?;
        Ok(Solutions::new(BadLeftJoinIter {
            inner: Some(inner),
            bindings: bindings.clone(),
            poison: poison.clone(),
        }))
    }

    /// Context variables that would wrongly constrain the optional part
    pub(crate) fn problem_vars_in(&self, bindings: &BindingSet) -> Vec<Symbol> {
        self.problem_vars
            .iter()
            .filter(|v| bindings.contains(v))
            .cloned()
            .collect_vec()
    }

    fn evaluate_well_designed<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        match &self.strategy {
            LeftJoinStrategy::NestedLoop(j) => j.evaluate(bindings, poison),
            LeftJoinStrategy::Hash(j) => j.evaluate(bindings, poison),
            LeftJoinStrategy::Service(j) => j.evaluate(bindings, poison),
        }
    }

    pub(crate) fn join_type(&self) -> &str {
        match &self.strategy {
            LeftJoinStrategy::NestedLoop(j) if j.guard.is_some() => {
                "conditional_nested_loop_left_join"
            }
            LeftJoinStrategy::NestedLoop(_) => "nested_loop_left_join",
            LeftJoinStrategy::Hash(_) => "hash_left_join",
            LeftJoinStrategy::Service(_) => "service_left_join",
        }
    }
}

/// Tests a condition, an evaluation error counts as false
pub(crate) fn passes(condition: &Option<Expr>, row: &BindingSet) -> bool {
    match condition {
        None => true,
        Some(cond) => match cond.test(row) {
            Ok(b) => b,
            Err(err) => {
                debug!("condition {} is treated as false: {}", cond, err);
                false
            }
        },
    }
}

/// Splits a left join condition into the conjuncts decidable from the left row alone
/// and the rest, which needs the merged row
pub(crate) fn split_condition(
    condition: Option<Expr>,
    left_assured: &BTreeSet<Symbol>,
    right_names: &BTreeSet<Symbol>,
) -> (Option<Expr>, Option<Expr>) {
    let condition = match condition {
        None => return (None, None),
        Some(c) => c,
    };
    let (guards, residual): (Vec<_>, Vec<_>) =
        condition.to_conjunction().into_iter().partition(|c| {
            c.bindings()
                .iter()
                .all(|v| left_assured.contains(v) || !right_names.contains(v))
        });
    (Expr::build_and(guards), Expr::build_and(residual))
}

/// Evaluates the optional part once per left row
pub(crate) struct NestedLoopLeftJoin {
    pub(crate) left: EvalStep,
    pub(crate) right: EvalStep,
    /// the part of the condition that only reads variables the optional part cannot change
    pub(crate) guard: Option<Expr>,
    /// the rest of the condition, tested on merged rows
    pub(crate) residual: Option<Expr>,
}

impl NestedLoopLeftJoin {
    fn evaluate<'a>(&'a self, bindings: &BindingSet, poison: &Poison) -> Result<Solutions<'a>> {
        let left = self.left.evaluate(bindings, poison)?;
        Ok(Solutions::new(LeftJoinIter {
            join: self,
            left: Some(left),
            state: LeftJoinState::Idle,
            poison: poison.clone(),
        }))
    }
}

enum LeftJoinState<'a> {
    /// waiting for the next left row
    Idle,
    /// pulling the optional part evaluated for `left`
    DrainingRight {
        left: BindingSet,
        right: Solutions<'a>,
        matched: bool,
    },
    /// nothing matched `left`, it is emitted alone
    EmitLeftOnly(BindingSet),
    Done,
}

struct LeftJoinIter<'a> {
    join: &'a NestedLoopLeftJoin,
    left: Option<Solutions<'a>>,
    state: LeftJoinState<'a>,
    poison: Poison,
}

impl<'a> LeftJoinIter<'a> {
    fn transition(&mut self, state: LeftJoinState<'a>) -> Result<Option<BindingSet>> {
        match state {
            LeftJoinState::Idle => {
                self.poison.check()?;
                match pull_from(&mut self.left)? {
                    None => {
                        self.state = LeftJoinState::Done;
                        Ok(None)
                    }
                    Some(left) => {
                        if passes(&self.join.guard, &left) {
                            let right = self.join.right.evaluate(&left, &self.poison)?;
                            self.state = LeftJoinState::DrainingRight {
                                left,
                                right,
                                matched: false,
                            };
                        } else {
                            self.state = LeftJoinState::EmitLeftOnly(left);
                        }
                        self.advance()
                    }
                }
            }
            LeftJoinState::DrainingRight {
                left,
                mut right,
                mut matched,
            } => {
                while let Some(right_row) = right.try_next()? {
                    self.poison.check()?;
                    if !right_row.is_compatible(&left) {
                        continue;
                    }
                    let mut row = left.clone();
                    row.extend_missing(&right_row);
                    if passes(&self.join.residual, &row) {
                        matched = true;
                        self.state = LeftJoinState::DrainingRight {
                            left,
                            right,
                            matched,
                        };
                        return Ok(Some(row));
                    }
                }
                self.state = if matched {
                    LeftJoinState::Idle
                } else {
                    LeftJoinState::EmitLeftOnly(left)
                };
                self.advance()
            }
            LeftJoinState::EmitLeftOnly(left) => {
                self.state = LeftJoinState::Idle;
                Ok(Some(left))
            }
            LeftJoinState::Done => Ok(None),
        }
    }
}

impl SolutionIter for LeftJoinIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        let state = mem::replace(&mut self.state, LeftJoinState::Done);
        self.transition(state)
    }
    fn release(&mut self) {
        close_child(&mut self.left);
        if let LeftJoinState::DrainingRight { mut right, .. } =
            mem::replace(&mut self.state, LeftJoinState::Done)
        {
            right.close();
        }
    }
}

/// Materializes the optional part once, for a right side that is its own variable scope
pub(crate) struct HashLeftJoin {
    pub(crate) left: EvalStep,
    pub(crate) right: EvalStep,
    pub(crate) join_vars: Vec<Symbol>,
    pub(crate) condition: Option<Expr>,
}

impl HashLeftJoin {
    fn evaluate<'a>(&'a self, bindings: &BindingSet, poison: &Poison) -> Result<Solutions<'a>> {
        let mut left = self.left.evaluate(bindings, poison)?;
        if !left.has_next()? {
            return Ok(Solutions::empty());
        }
        let right = self.right.evaluate(bindings, poison)?;
        let table = HashTable::build(right, &self.join_vars, poison)?;
        trace!(
            "hash left join materialized {} rows on {:?}",
            table.rows.len(),
            self.join_vars
        );
        Ok(Solutions::new(HashLeftJoinIter {
            join: self,
            left: Some(left),
            table,
            pending: vec![].into_iter(),
            poison: poison.clone(),
        }))
    }
}

struct HashLeftJoinIter<'a> {
    join: &'a HashLeftJoin,
    left: Option<Solutions<'a>>,
    table: HashTable<'a>,
    pending: std::vec::IntoIter<BindingSet>,
    poison: Poison,
}

impl SolutionIter for HashLeftJoinIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        loop {
            if let Some(row) = self.pending.next() {
                return Ok(Some(row));
            }
            self.poison.check()?;
            let left = match pull_from(&mut self.left)? {
                None => return Ok(None),
                Some(row) => row,
            };
            let merged = self
                .table
                .matches(&left)
                .into_iter()
                .map(|idx| {
                    let mut row = left.clone();
                    row.extend_missing(&self.table.rows[idx]);
                    row
                })
                .filter(|row| passes(&self.join.condition, row))
                .collect_vec();
            if merged.is_empty() {
                return Ok(Some(left));
            }
            self.pending = merged.into_iter();
        }
    }
    fn release(&mut self) {
        close_child(&mut self.left);
    }
}

/// Re-applies the context bindings that were hidden from a badly designed left join
struct BadLeftJoinIter<'a> {
    inner: Option<Solutions<'a>>,
    bindings: BindingSet,
    poison: Poison,
}

impl SolutionIter for BadLeftJoinIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        while let Some(mut row) = pull_from(&mut self.inner)? {
            self.poison.check()?;
            if row.is_compatible(&self.bindings) {
                row.extend_missing(&self.bindings);
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
    fn release(&mut self) {
        close_child(&mut self.inner);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::data::expr::CmpOp;
    use crate::data::value::Term;
    use crate::query::pattern::tests::scan;
    use crate::runtime::source::tests::{chain_store, InstrumentedSource};

    #[test]
    fn condition_split() {
        let left_assured = BTreeSet::from([Symbol::new("x")]);
        let right_names = BTreeSet::from([Symbol::new("x"), Symbol::new("y")]);
        let cond = Expr::And(
            Box::new(Expr::cmp(CmpOp::Gt, Expr::var("x"), Expr::val(1))),
            Box::new(Expr::cmp(CmpOp::Lt, Expr::var("y"), Expr::val(5))),
        );
        let (guard, residual) = split_condition(Some(cond), &left_assured, &right_names);
        assert_eq!(guard.unwrap().bindings(), BTreeSet::from([Symbol::new("x")]));
        assert_eq!(
            residual.unwrap().bindings(),
            BTreeSet::from([Symbol::new("y")])
        );
        assert_eq!(split_condition(None, &left_assured, &right_names), (None, None));
    }

    #[test]
    fn erroring_condition_is_false() {
        let cond = Some(Expr::cmp(CmpOp::Eq, Expr::var("unbound"), Expr::val(1)));
        assert!(!passes(&cond, &BindingSet::new()));
        assert!(passes(&None, &BindingSet::new()));
    }

    #[test]
    fn failing_optional_part_releases_everything() {
        let source = Arc::new(InstrumentedSource::new(chain_store()).failing_on("q"));
        let join = LeftJoinStep {
            problem_vars: BTreeSet::new(),
            strategy: LeftJoinStrategy::NestedLoop(NestedLoopLeftJoin {
                left: scan(&source, "s", "p", "o"),
                right: scan(&source, "o", "q", "z"),
                guard: None,
                residual: None,
            }),
        };
        let mut rows = join.evaluate(&BindingSet::new(), &Poison::default()).unwrap();
        assert!(rows.try_next().unwrap().is_some());
        assert!(rows.try_next().is_err());
        assert!(rows.is_closed());
        assert_eq!(source.open(), 0);

        let hashed = LeftJoinStep {
            problem_vars: BTreeSet::new(),
            strategy: LeftJoinStrategy::Hash(HashLeftJoin {
                left: scan(&source, "s", "p", "o"),
                right: scan(&source, "o", "q", "z"),
                join_vars: vec![Symbol::new("o")],
                condition: None,
            }),
        };
        assert!(hashed.evaluate(&BindingSet::new(), &Poison::default()).is_err());
        assert_eq!(source.open(), 0);
    }

    #[test]
    fn badly_designed_join_stops_when_killed() {
        let source = Arc::new(InstrumentedSource::new(chain_store()));
        let join = LeftJoinStep {
            problem_vars: BTreeSet::from([Symbol::new("z")]),
            strategy: LeftJoinStrategy::NestedLoop(NestedLoopLeftJoin {
                left: scan(&source, "s", "p", "o"),
                right: scan(&source, "o", "q", "z"),
                guard: None,
                residual: None,
            }),
        };
        let poison = Poison::default();
        let ctx = BindingSet::singleton("z", Term::iri("nothing"));
        let mut rows = join.evaluate(&ctx, &poison).unwrap();
        poison.kill();
        assert!(rows.try_next().is_err());
        assert_eq!(source.open(), 0);
    }
}
