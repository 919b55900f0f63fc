/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! `FILTER` and `BIND`.

use log::{debug, trace};
use miette::Result;

use crate::data::binding::BindingSet;
use crate::data::expr::Expr;
use crate::data::symb::Symbol;
use crate::query::compile::EvalStep;
use crate::query::left_join::passes;
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;

pub(crate) struct FilterStep {
    pub(crate) arg: EvalStep,
    pub(crate) condition: Option<Expr>,
}

impl FilterStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        Ok(Solutions::new(FilterIter {
            arg: Some(self.arg.evaluate(bindings, poison)?),
            condition: &self.condition,
            poison: poison.clone(),
        }))
    }
}

struct FilterIter<'a> {
    arg: Option<Solutions<'a>>,
    condition: &'a Option<Expr>,
    poison: Poison,
}

impl SolutionIter for FilterIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        while let Some(row) = pull_from(&mut self.arg)? {
            self.poison.check()?;
            if passes(self.condition, &row) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
    }
}

pub(crate) struct ExtensionStep {
    pub(crate) arg: EvalStep,
    pub(crate) elements: Vec<(Symbol, Expr)>,
}

impl ExtensionStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        Ok(Solutions::new(ExtensionIter {
            arg: Some(self.arg.evaluate(bindings, poison)?),
            elements: &self.elements,
        }))
    }
}

struct ExtensionIter<'a> {
    arg: Option<Solutions<'a>>,
    elements: &'a [(Symbol, Expr)],
}

impl SolutionIter for ExtensionIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        let mut row = match pull_from(&mut self.arg)? {
            None => return Ok(None),
            Some(row) => row,
        };
        for (var, expr) in self.elements {
            if row.contains(var) {
                trace!("{} is already bound, BIND skipped", var);
                continue;
            }
            match expr.eval(&row) {
                Ok(val) => {
                    row.insert(var.clone(), val);
                }
                Err(err) => debug!("{} left unbound: {}", var, err),
            }
        }
        Ok(Some(row))
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::expr::{ArithOp, CmpOp};
    use crate::data::value::Term;
    use crate::query::values::ValuesStep;

    fn run(step: Result<Solutions<'_>>) -> Vec<BindingSet> {
        step.unwrap().into_vec().unwrap()
    }

    fn rows() -> EvalStep {
        EvalStep::Values(ValuesStep {
            rows: vec![
                BindingSet::singleton("x", 1),
                BindingSet::singleton("x", 5),
                BindingSet::singleton("x", "text"),
            ],
        })
    }

    #[test]
    fn filter_errors_drop_rows() {
        let step = FilterStep {
            arg: rows(),
            condition: Some(Expr::cmp(CmpOp::Gt, Expr::var("x"), Expr::val(2))),
        };
        let res = run(step.evaluate(&BindingSet::new(), &Poison::default()));
        assert_eq!(res, vec![BindingSet::singleton("x", 5)]);
    }

    #[test]
    fn bind_leaves_variable_unbound_on_error() {
        let step = ExtensionStep {
            arg: rows(),
            elements: vec![
                (
                    Symbol::new("y"),
                    Expr::arith(ArithOp::Add, Expr::var("x"), Expr::val(1)),
                ),
                (Symbol::new("x"), Expr::val(100)),
            ],
        };
        let res = run(step.evaluate(&BindingSet::new(), &Poison::default()));
        assert_eq!(res[0].get("y"), Some(&Term::from(2)));
        assert_eq!(res[0].get("x"), Some(&Term::from(1)));
        assert_eq!(res[2].get("y"), None);
        assert_eq!(res[2].len(), 1);
    }

    #[test]
    fn rejecting_filter_notices_kill() {
        let step = FilterStep {
            arg: EvalStep::Values(ValuesStep {
                rows: (0..100).map(|i| BindingSet::singleton("x", i)).collect(),
            }),
            condition: Some(Expr::cmp(CmpOp::Lt, Expr::var("x"), Expr::val(-1))),
        };
        let poison = Poison::default();
        let mut rows = step.evaluate(&BindingSet::new(), &poison).unwrap();
        poison.kill();
        assert!(rows.try_next().is_err());
        assert!(rows.is_closed());
    }
}
