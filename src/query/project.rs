/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Projection, `DISTINCT` and `REDUCED`.

use std::sync::Arc;

use miette::Result;

use crate::data::binding::BindingSet;
use crate::query::algebra::ProjectionElem;
use crate::query::compile::EvalStep;
use crate::query::set_ops::{SetFactory, SolutionSet};
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;

pub(crate) struct ProjectionStep {
    pub(crate) arg: EvalStep,
    pub(crate) elements: Vec<ProjectionElem>,
    /// a subquery only sees the outer bindings of the variables it projects
    pub(crate) subquery: bool,
}

impl ProjectionStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        let arg = if self.subquery {
            let mut inner = BindingSet::new();
            for elem in &self.elements {
                if let Some(val) = bindings.get(&elem.target) {
                    inner.insert(elem.source.clone(), val.clone());
                }
            }
            self.arg.evaluate(&inner, poison)?
        } else {
            self.arg.evaluate(bindings, poison)?
        };
        Ok(Solutions::new(ProjectionIter {
            arg: Some(arg),
            elements: &self.elements,
            bindings: bindings.clone(),
            poison: poison.clone(),
        }))
    }
}

struct ProjectionIter<'a> {
    arg: Option<Solutions<'a>>,
    elements: &'a [ProjectionElem],
    bindings: BindingSet,
    poison: Poison,
}

impl SolutionIter for ProjectionIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        while let Some(row) = pull_from(&mut self.arg)? {
            self.poison.check()?;
            let mut projected = BindingSet::new();
            for elem in self.elements {
                if let Some(val) = row.get(&elem.source) {
                    projected.insert(elem.target.clone(), val.clone());
                }
            }
            if let Some(merged) = projected.merge(&self.bindings) {
                return Ok(Some(merged));
            }
        }
        Ok(None)
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
    }
}

pub(crate) struct DistinctStep {
    pub(crate) arg: EvalStep,
    pub(crate) set_factory: Arc<dyn SetFactory>,
}

impl DistinctStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        Ok(Solutions::new(DistinctIter {
            arg: Some(self.arg.evaluate(bindings, poison)?),
            seen: self.set_factory.make_set(),
            poison: poison.clone(),
        }))
    }
}

struct DistinctIter<'a> {
    arg: Option<Solutions<'a>>,
    seen: Box<dyn SolutionSet>,
    poison: Poison,
}

impl SolutionIter for DistinctIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        while let Some(row) = pull_from(&mut self.arg)? {
            self.poison.check()?;
            if self.seen.insert(row.clone())? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
    }
}

/// `REDUCED` only removes consecutive duplicates
pub(crate) struct ReducedStep {
    pub(crate) arg: EvalStep,
}

impl ReducedStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        Ok(Solutions::new(ReducedIter {
            arg: Some(self.arg.evaluate(bindings, poison)?),
            last: None,
            poison: poison.clone(),
        }))
    }
}

struct ReducedIter<'a> {
    arg: Option<Solutions<'a>>,
    last: Option<BindingSet>,
    poison: Poison,
}

impl SolutionIter for ReducedIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        while let Some(row) = pull_from(&mut self.arg)? {
            self.poison.check()?;
            if self.last.as_ref() != Some(&row) {
                self.last = Some(row.clone());
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::symb::Symbol;
    use crate::query::set_ops::InMemorySetFactory;
    use crate::query::values::ValuesStep;

    fn run(step: Result<Solutions<'_>>) -> Vec<BindingSet> {
        step.unwrap().into_vec().unwrap()
    }

    fn rows() -> EvalStep {
        EvalStep::Values(ValuesStep {
            rows: vec![
                BindingSet::singleton("x", 1).with("y", 1),
                BindingSet::singleton("x", 1).with("y", 2),
                BindingSet::singleton("x", 2).with("y", 2),
                BindingSet::singleton("x", 1).with("y", 3),
            ],
        })
    }

    fn project_x(subquery: bool) -> ProjectionStep {
        ProjectionStep {
            arg: rows(),
            elements: vec![ProjectionElem {
                source: Symbol::new("x"),
                target: Symbol::new("a"),
            }],
            subquery,
        }
    }

    #[test]
    fn projection_renames_and_keeps_context() {
        let res = project_x(false)
            .evaluate(&BindingSet::singleton("z", 0), &Poison::default())
            .unwrap()
            .into_vec()
            .unwrap();
        assert_eq!(res.len(), 4);
        assert_eq!(res[0], BindingSet::singleton("a", 1).with("z", 0));

        let res = project_x(true)
            .evaluate(&BindingSet::singleton("a", 2).with("y", 1), &Poison::default())
            .unwrap()
            .into_vec()
            .unwrap();
        // ?y of the outer scope is invisible to the subquery
        assert_eq!(res, vec![BindingSet::singleton("a", 2).with("y", 1)]);
    }

    #[test]
    fn distinct_and_reduced() {
        let distinct = DistinctStep {
            arg: EvalStep::Projection(Box::new(project_x(false))),
            set_factory: Arc::new(InMemorySetFactory),
        };
        let res = run(distinct.evaluate(&BindingSet::new(), &Poison::default()));
        assert_eq!(res.len(), 2);

        let reduced = ReducedStep {
            arg: EvalStep::Projection(Box::new(project_x(false))),
        };
        let res = run(reduced.evaluate(&BindingSet::new(), &Poison::default()));
        assert_eq!(res.len(), 3);
    }
}
