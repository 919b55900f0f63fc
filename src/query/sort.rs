/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::cmp::Ordering;

use itertools::Itertools;
use log::trace;
use miette::Result;

use crate::data::binding::BindingSet;
use crate::data::value::Term;
use crate::query::algebra::OrderElem;
use crate::query::compile::EvalStep;
use crate::query::solutions::{close_child, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;

/// `ORDER BY`, sorts in memory
pub(crate) struct OrderStep {
    pub(crate) arg: EvalStep,
    pub(crate) elements: Vec<OrderElem>,
    /// only this many leading rows will ever be read
    pub(crate) limit: Option<usize>,
}

type SortKeys = Vec<Option<Term>>;

impl OrderStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        Ok(Solutions::new(OrderIter {
            step: self,
            arg: Some(self.arg.evaluate(bindings, poison)?),
            sorted: None,
            poison: poison.clone(),
        }))
    }

    fn sort_and_collect(&self, mut arg: Solutions<'_>, poison: &Poison) -> Result<Vec<BindingSet>> {
        let mut all_data = vec![];
        while let Some(row) = arg.try_next()? {
            poison.check()?;
            // an erroring key sorts like an unbound one
            let keys = self
                .elements
                .iter()
                .map(|e| e.expr.eval(&row).ok())
                .collect_vec();
            all_data.push((keys, row));
            if let Some(n) = self.limit {
                if all_data.len() >= 2 * n.max(1) {
                    self.sort(&mut all_data);
                    all_data.truncate(n);
                }
            }
        }
        trace!("sorting {} rows", all_data.len());
        self.sort(&mut all_data);
        if let Some(n) = self.limit {
            all_data.truncate(n);
        }
        Ok(all_data.into_iter().map(|(_, row)| row).collect_vec())
    }

    /// Stable, so a truncated buffer keeps the earliest of equal rows
    fn sort(&self, data: &mut [(SortKeys, BindingSet)]) {
        data.sort_by(|(a, _), (b, _)| {
            for (i, elem) in self.elements.iter().enumerate() {
                match compare_keys(&a[i], &b[i]) {
                    Ordering::Equal => {}
                    o => {
                        return if elem.ascending { o } else { o.reverse() };
                    }
                }
            }
            Ordering::Equal
        });
    }
}

/// Unbound first, then blank nodes, IRIs and literals
fn compare_keys(a: &Option<Term>, b: &Option<Term>) -> Ordering {
    match (a, b) {
        (Some(l), Some(r)) => l.order_cmp(r),
        _ => a.cmp(b),
    }
}

struct OrderIter<'a> {
    step: &'a OrderStep,
    arg: Option<Solutions<'a>>,
    sorted: Option<std::vec::IntoIter<BindingSet>>,
    poison: Poison,
}

impl SolutionIter for OrderIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        if self.sorted.is_none() {
            let data = match self.arg.take() {
                Some(arg) => self.step.sort_and_collect(arg, &self.poison)?,
                None => vec![],
            };
            self.sorted = Some(data.into_iter());
        }
        Ok(self.sorted.as_mut().and_then(|it| it.next()))
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
        self.sorted = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::expr::Expr;
    use crate::query::solutions::tests::OpenCounter;
    use crate::query::values::ValuesStep;

    fn by_x_then_y_desc() -> Vec<OrderElem> {
        vec![
            OrderElem {
                expr: Expr::var("x"),
                ascending: true,
            },
            OrderElem {
                expr: Expr::var("y"),
                ascending: false,
            },
        ]
    }

    #[test]
    fn sorts_by_keys_with_unbound_first() {
        let step = OrderStep {
            arg: EvalStep::Values(ValuesStep {
                rows: vec![
                    BindingSet::singleton("x", 2).with("y", "b"),
                    BindingSet::singleton("y", "c"),
                    BindingSet::singleton("x", 1.5),
                    BindingSet::singleton("x", 2).with("y", "a"),
                ],
            }),
            elements: by_x_then_y_desc(),
            limit: None,
        };
        let res = step
            .evaluate(&BindingSet::new(), &Poison::default())
            .unwrap()
            .into_vec()
            .unwrap();
        assert_eq!(
            res,
            vec![
                BindingSet::singleton("y", "c"),
                BindingSet::singleton("x", 1.5),
                BindingSet::singleton("x", 2).with("y", "b"),
                BindingSet::singleton("x", 2).with("y", "a"),
            ]
        );
    }

    #[test]
    fn top_n_matches_full_sort() {
        // ties on x keep their input order
        let rows = (0..50i64)
            .map(|i| BindingSet::singleton("x", (i * 7) % 5).with("i", i))
            .collect_vec();
        let elements = vec![OrderElem {
            expr: Expr::var("x"),
            ascending: true,
        }];
        let full = OrderStep {
            arg: EvalStep::Values(ValuesStep { rows: rows.clone() }),
            elements: elements.clone(),
            limit: None,
        };
        let full = full
            .evaluate(&BindingSet::new(), &Poison::default())
            .unwrap()
            .into_vec()
            .unwrap();
        for n in [0, 1, 3, 12, 60] {
            let top = OrderStep {
                arg: EvalStep::Values(ValuesStep { rows: rows.clone() }),
                elements: elements.clone(),
                limit: Some(n),
            };
            let top = top
                .evaluate(&BindingSet::new(), &Poison::default())
                .unwrap()
                .into_vec()
                .unwrap();
            assert_eq!(top, full.iter().take(n).cloned().collect_vec(), "top {}", n);
        }
    }

    #[test]
    fn killed_sort_releases_input() {
        let counter = OpenCounter::default();
        let step = OrderStep {
            arg: EvalStep::Empty,
            elements: by_x_then_y_desc(),
            limit: None,
        };
        let poison = Poison::default();
        poison.kill();
        let rows = counter.track(vec![BindingSet::singleton("x", 1)]);
        assert!(step.sort_and_collect(rows, &poison).is_err());
        assert_eq!(counter.open(), 0);
    }
}
