/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Inner joins.

use std::collections::HashMap;

use log::trace;
use miette::Result;

use crate::data::binding::BindingSet;
use crate::data::symb::Symbol;
use crate::data::value::Term;
use crate::query::compile::EvalStep;
use crate::query::service::ServiceJoin;
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;

pub(crate) enum JoinStep {
    NestedLoop(NestedLoopJoin),
    Hash(HashJoin),
    Service(ServiceJoin),
}

impl JoinStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        match self {
            JoinStep::NestedLoop(j) => j.evaluate(bindings, poison),
            JoinStep::Hash(j) => j.evaluate(bindings, poison),
            JoinStep::Service(j) => j.evaluate(bindings, poison),
        }
    }
    pub(crate) fn join_type(&self) -> &str {
        match self {
            JoinStep::NestedLoop(_) => "nested_loop_join",
            JoinStep::Hash(_) => "hash_join",
            JoinStep::Service(_) => "service_join",
        }
    }
}

/// Re-evaluates the right side once per left row, with the left row as context
pub(crate) struct NestedLoopJoin {
    pub(crate) left: EvalStep,
    pub(crate) right: EvalStep,
}

impl NestedLoopJoin {
    fn evaluate<'a>(&'a self, bindings: &BindingSet, poison: &Poison) -> Result<Solutions<'a>> {
        let mut left = self.left.evaluate(bindings, poison)?;
        if !left.has_next()? {
            return Ok(Solutions::empty());
        }
        Ok(Solutions::new(NestedLoopIter {
            right_step: &self.right,
            left: Some(left),
            right: None,
            poison: poison.clone(),
        }))
    }
}

struct NestedLoopIter<'a> {
    right_step: &'a EvalStep,
    left: Option<Solutions<'a>>,
    right: Option<Solutions<'a>>,
    poison: Poison,
}

impl SolutionIter for NestedLoopIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        loop {
            // right rows extend the left row they were evaluated with
            if let Some(row) = pull_from(&mut self.right)? {
                return Ok(Some(row));
            }
            self.poison.check()?;
            match pull_from(&mut self.left)? {
                None => return Ok(None),
                Some(left_row) => {
                    self.right = Some(self.right_step.evaluate(&left_row, &self.poison)?)
                }
            }
        }
    }
    fn release(&mut self) {
        close_child(&mut self.left);
        close_child(&mut self.right);
    }
}

/// Materializes the right side once, keyed on the join variables, and probes it per left row
pub(crate) struct HashJoin {
    pub(crate) left: EvalStep,
    pub(crate) right: EvalStep,
    pub(crate) join_vars: Vec<Symbol>,
}

impl HashJoin {
    fn evaluate<'a>(&'a self, bindings: &BindingSet, poison: &Poison) -> Result<Solutions<'a>> {
        let mut left = self.left.evaluate(bindings, poison)?;
        if !left.has_next()? {
            return Ok(Solutions::empty());
        }
        let right = self.right.evaluate(bindings, poison)?;
        let table = HashTable::build(right, &self.join_vars, poison)?;
        trace!(
            "hash join materialized {} rows on {:?}",
            table.rows.len(),
            self.join_vars
        );
        Ok(Solutions::new(HashJoinIter {
            left: Some(left),
            table,
            current: None,
            poison: poison.clone(),
        }))
    }
}

/// Right side of a hash join.
///
/// Rows binding every join variable are bucketed by their key,
/// the others can only be found by a compatibility scan.
pub(crate) struct HashTable<'v> {
    join_vars: &'v [Symbol],
    pub(crate) rows: Vec<BindingSet>,
    buckets: HashMap<Vec<Term>, Vec<usize>>,
    partial: Vec<usize>,
}

impl<'v> HashTable<'v> {
    /// Drains `source` into the table and closes it
    pub(crate) fn build(
        mut source: Solutions<'_>,
        join_vars: &'v [Symbol],
        poison: &Poison,
    ) -> Result<Self> {
        let mut ret = Self {
            join_vars,
            rows: vec![],
            buckets: Default::default(),
            partial: vec![],
        };
        while let Some(row) = source.try_next()? {
            poison.check()?;
            let idx = ret.rows.len();
            match ret.key_of(&row) {
                Some(key) => ret.buckets.entry(key).or_default().push(idx),
                None => ret.partial.push(idx),
            }
            ret.rows.push(row);
        }
        Ok(ret)
    }
    fn key_of(&self, row: &BindingSet) -> Option<Vec<Term>> {
        self.join_vars
            .iter()
            .map(|v| row.get(v).cloned())
            .collect()
    }
    /// Indices of rows compatible with `row`, in materialization order
    pub(crate) fn matches(&self, row: &BindingSet) -> Vec<usize> {
        let mut candidates = match self.key_of(row) {
            Some(key) => {
                let mut found = self.buckets.get(&key).cloned().unwrap_or_default();
                found.extend_from_slice(&self.partial);
                found.sort_unstable();
                found
            }
            None => (0..self.rows.len()).collect(),
        };
        candidates.retain(|i| self.rows[*i].is_compatible(row));
        candidates
    }
}

struct HashJoinIter<'a> {
    left: Option<Solutions<'a>>,
    table: HashTable<'a>,
    current: Option<(BindingSet, std::vec::IntoIter<usize>)>,
    poison: Poison,
}

impl SolutionIter for HashJoinIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        loop {
            if let Some((left_row, matched)) = &mut self.current {
                if let Some(idx) = matched.next() {
                    let mut row = left_row.clone();
                    row.extend_missing(&self.table.rows[idx]);
                    return Ok(Some(row));
                }
                self.current = None;
            }
            self.poison.check()?;
            match pull_from(&mut self.left)? {
                None => return Ok(None),
                Some(left_row) => {
                    let matched = self.table.matches(&left_row);
                    self.current = Some((left_row, matched.into_iter()));
                }
            }
        }
    }
    fn release(&mut self) {
        close_child(&mut self.left);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::query::pattern::tests::scan;
    use crate::query::solutions::tests::OpenCounter;
    use crate::query::values::ValuesStep;
    use crate::runtime::source::tests::{chain_store, InstrumentedSource};

    fn values(rows: Vec<BindingSet>) -> EvalStep {
        EvalStep::Values(ValuesStep { rows })
    }

    fn row(pairs: &[(&str, i64)]) -> BindingSet {
        pairs.iter().map(|(k, v)| (*k, *v)).collect()
    }

    fn run(join: &JoinStep, ctx: &BindingSet) -> Vec<BindingSet> {
        join.evaluate(ctx, &Poison::default())
            .unwrap()
            .into_vec()
            .unwrap()
    }

    #[test]
    fn hash_table_finds_rows_without_the_key() {
        let join_vars = vec![Symbol::new("x")];
        let counter = OpenCounter::default();
        let source = counter.track(vec![
            row(&[("x", 1), ("y", 10)]),
            row(&[("y", 20)]),
            row(&[("x", 2), ("y", 30)]),
            row(&[("x", 1), ("y", 40)]),
        ]);
        let table = HashTable::build(source, &join_vars, &Poison::default()).unwrap();
        assert_eq!(counter.open(), 0);
        assert_eq!(table.matches(&row(&[("x", 1)])), vec![0, 1, 3]);
        assert_eq!(table.matches(&row(&[("x", 1), ("y", 40)])), vec![3]);
        // an unbound key can meet any row
        assert_eq!(table.matches(&row(&[("z", 0)])), vec![0, 1, 2, 3]);
    }

    #[test]
    fn killed_hash_build_releases_its_source() {
        let join_vars = vec![Symbol::new("x")];
        let counter = OpenCounter::default();
        let poison = Poison::default();
        poison.kill();
        let source = counter.track(vec![row(&[("x", 1)]), row(&[("x", 2)])]);
        assert!(HashTable::build(source, &join_vars, &poison).is_err());
        assert_eq!(counter.open(), 0);
    }

    #[test]
    fn hash_and_nested_loop_agree() {
        let left = vec![row(&[("x", 1)]), row(&[("x", 2)]), row(&[("x", 3)])];
        let right = vec![
            row(&[("x", 2), ("y", 20)]),
            row(&[("x", 1), ("y", 10)]),
            row(&[("x", 2), ("y", 21)]),
        ];
        let nested = JoinStep::NestedLoop(NestedLoopJoin {
            left: values(left.clone()),
            right: values(right.clone()),
        });
        let hashed = JoinStep::Hash(HashJoin {
            left: values(left),
            right: values(right),
            join_vars: vec![Symbol::new("x")],
        });
        let expected = vec![
            row(&[("x", 1), ("y", 10)]),
            row(&[("x", 2), ("y", 20)]),
            row(&[("x", 2), ("y", 21)]),
        ];
        for join in [nested, hashed] {
            assert_eq!(run(&join, &BindingSet::new()), expected, "{}", join.join_type());
        }
    }

    #[test]
    fn right_rows_extend_the_context() {
        let join = JoinStep::Hash(HashJoin {
            left: values(vec![row(&[("x", 1)])]),
            right: values(vec![row(&[("w", 7)]), row(&[("w", 8), ("c", 2)])]),
            join_vars: vec![],
        });
        let ctx = row(&[("c", 1)]);
        assert_eq!(run(&join, &ctx), vec![row(&[("c", 1), ("x", 1), ("w", 7)])]);
    }

    #[test]
    fn failing_right_side_releases_both_sides() {
        let source = Arc::new(InstrumentedSource::new(chain_store()).failing_on("q"));
        let join = JoinStep::NestedLoop(NestedLoopJoin {
            left: scan(&source, "s", "p", "o"),
            right: scan(&source, "o", "q", "z"),
        });
        let mut rows = join.evaluate(&BindingSet::new(), &Poison::default()).unwrap();
        assert!(rows.try_next().unwrap().is_some());
        assert_eq!(source.open(), 2);
        assert!(rows.try_next().is_err());
        assert!(rows.is_closed());
        assert_eq!(source.open(), 0);
    }

    #[test]
    fn failing_hash_build_releases_the_left_side() {
        let source = Arc::new(InstrumentedSource::new(chain_store()).failing_on("q"));
        let join = JoinStep::Hash(HashJoin {
            left: scan(&source, "s", "p", "o"),
            right: scan(&source, "o", "q", "z"),
            join_vars: vec![Symbol::new("o")],
        });
        assert!(join.evaluate(&BindingSet::new(), &Poison::default()).is_err());
        assert_eq!(source.open(), 0);
    }
}
