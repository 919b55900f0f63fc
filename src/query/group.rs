/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! `GROUP BY` with aggregates. The input is materialized before the first group is returned.

use std::collections::HashMap;

use itertools::Itertools;
use log::{debug, trace};
use miette::Result;

use crate::data::aggr::{AggrState, Aggregate};
use crate::data::binding::BindingSet;
use crate::data::symb::Symbol;
use crate::data::value::Term;
use crate::query::compile::EvalStep;
use crate::query::solutions::{close_child, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;

pub(crate) struct GroupStep {
    pub(crate) arg: EvalStep,
    pub(crate) group_by: Vec<Symbol>,
    pub(crate) aggregates: Vec<(Symbol, Aggregate)>,
}

type GroupKey = Vec<Option<Term>>;

impl GroupStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        Ok(Solutions::new(GroupIter {
            step: self,
            arg: Some(self.arg.evaluate(bindings, poison)?),
            groups: None,
            bindings: bindings.clone(),
            poison: poison.clone(),
        }))
    }

    fn start_group(&self) -> Vec<AggrState> {
        self.aggregates.iter().map(|(_, a)| a.start()).collect_vec()
    }

    /// Groups in order of first appearance
    fn collect_groups(
        &self,
        mut arg: Solutions<'_>,
        poison: &Poison,
    ) -> Result<Vec<(GroupKey, Vec<AggrState>)>> {
        let mut index: HashMap<GroupKey, usize> = HashMap::new();
        let mut groups: Vec<(GroupKey, Vec<AggrState>)> = vec![];
        while let Some(row) = arg.try_next()? {
            poison.check()?;
            let key = self
                .group_by
                .iter()
                .map(|v| row.get(v).cloned())
                .collect_vec();
            let idx = match index.get(&key) {
                Some(idx) => *idx,
                None => {
                    index.insert(key.clone(), groups.len());
                    groups.push((key, self.start_group()));
                    groups.len() - 1
                }
            };
            for (state, (_, aggr)) in groups[idx].1.iter_mut().zip(&self.aggregates) {
                state.feed(aggr, &row);
            }
        }
        // aggregating nothing without keys still yields one group
        if groups.is_empty() && self.group_by.is_empty() {
            groups.push((vec![], self.start_group()));
        }
        trace!("grouped into {} groups", groups.len());
        Ok(groups)
    }

    fn group_row(&self, key: GroupKey, states: Vec<AggrState>) -> BindingSet {
        let mut row = BindingSet::new();
        for (var, val) in self.group_by.iter().zip(key) {
            if let Some(val) = val {
                row.insert(var.clone(), val);
            }
        }
        for (state, (var, aggr)) in states.iter().zip(&self.aggregates) {
            match state.result() {
                Ok(val) => {
                    row.insert(var.clone(), val);
                }
                Err(err) => debug!("{} = {} left unbound: {}", var, aggr, err),
            }
        }
        row
    }
}

struct GroupIter<'a> {
    step: &'a GroupStep,
    arg: Option<Solutions<'a>>,
    groups: Option<std::vec::IntoIter<(GroupKey, Vec<AggrState>)>>,
    bindings: BindingSet,
    poison: Poison,
}

impl SolutionIter for GroupIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        if self.groups.is_none() {
            let groups = match self.arg.take() {
                Some(arg) => self.step.collect_groups(arg, &self.poison)?,
                None => vec![],
            };
            self.groups = Some(groups.into_iter());
        }
        while let Some((key, states)) = self.groups.as_mut().and_then(|it| it.next()) {
            if let Some(row) = self.step.group_row(key, states).merge(&self.bindings) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
        self.groups = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::aggr::AggrOp;
    use crate::data::expr::Expr;
    use crate::query::solutions::tests::OpenCounter;
    use crate::query::values::ValuesStep;

    fn sales() -> EvalStep {
        let row = |who: &str, amount: i64| BindingSet::singleton("who", who).with("amount", amount);
        EvalStep::Values(ValuesStep {
            rows: vec![
                row("ann", 10),
                row("bob", 5),
                row("ann", 7),
                BindingSet::singleton("who", "cid").with("amount", "n/a"),
            ],
        })
    }

    fn run(step: &GroupStep, ctx: &BindingSet) -> Vec<BindingSet> {
        step.evaluate(ctx, &Poison::default())
            .unwrap()
            .into_vec()
            .unwrap()
    }

    #[test]
    fn aggregates_per_group() {
        let step = GroupStep {
            arg: sales(),
            group_by: vec![Symbol::new("who")],
            aggregates: vec![
                (Symbol::new("n"), Aggregate::count_rows()),
                (
                    Symbol::new("total"),
                    Aggregate::new(AggrOp::Sum, Expr::var("amount")),
                ),
            ],
        };
        let rows = run(&step, &BindingSet::new());
        assert_eq!(
            rows,
            vec![
                BindingSet::singleton("who", "ann").with("n", 2).with("total", 17),
                BindingSet::singleton("who", "bob").with("n", 1).with("total", 5),
                // the sum over a string is an error, so `total` stays unbound
                BindingSet::singleton("who", "cid").with("n", 1),
            ]
        );
    }

    #[test]
    fn no_rows_without_keys_gives_one_group() {
        let aggregates = vec![
            (Symbol::new("n"), Aggregate::count_rows()),
            (
                Symbol::new("top"),
                Aggregate::new(AggrOp::Max, Expr::var("amount")),
            ),
        ];
        let step = GroupStep {
            arg: EvalStep::Empty,
            group_by: vec![],
            aggregates: aggregates.clone(),
        };
        let ctx = BindingSet::singleton("c", 1);
        assert_eq!(run(&step, &ctx), vec![BindingSet::singleton("n", 0).with("c", 1)]);

        let keyed = GroupStep {
            arg: EvalStep::Empty,
            group_by: vec![Symbol::new("who")],
            aggregates,
        };
        assert!(run(&keyed, &ctx).is_empty());
    }

    #[test]
    fn killed_grouping_releases_input() {
        let counter = OpenCounter::default();
        let step = GroupStep {
            arg: EvalStep::Empty,
            group_by: vec![],
            aggregates: vec![],
        };
        let poison = Poison::default();
        poison.kill();
        let rows = counter.track(vec![BindingSet::singleton("x", 1)]);
        assert!(step.collect_groups(rows, &poison).is_err());
        assert_eq!(counter.open(), 0);
    }
}
