/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! `UNION`, `MINUS` and `INTERSECTION`.

use std::collections::HashSet;
use std::sync::Arc;

use log::trace;
use miette::Result;

use crate::data::binding::BindingSet;
use crate::query::compile::EvalStep;
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;

/// A set of binding sets used to materialize one side of an operator
pub trait SolutionSet {
    /// Adds a row, returns whether it was not yet present
    fn insert(&mut self, row: BindingSet) -> Result<bool>;
    /// Whether an equal row was added before
    fn contains(&self, row: &BindingSet) -> Result<bool>;
    /// Number of distinct rows held
    fn len(&self) -> usize;
    /// Whether no row was added
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Creates the sets used by `INTERSECTION` and `DISTINCT`.
/// Implementations may spill large sets to disk.
pub trait SetFactory: Send + Sync {
    /// A new, empty set
    fn make_set(&self) -> Box<dyn SolutionSet>;
}

/// Sets held in memory
#[derive(Default, Debug, Copy, Clone)]
pub struct InMemorySetFactory;

impl SetFactory for InMemorySetFactory {
    fn make_set(&self) -> Box<dyn SolutionSet> {
        Box::<InMemorySet>::default()
    }
}

#[derive(Default)]
struct InMemorySet(HashSet<BindingSet>);

impl SolutionSet for InMemorySet {
    fn insert(&mut self, row: BindingSet) -> Result<bool> {
        Ok(self.0.insert(row))
    }
    fn contains(&self, row: &BindingSet) -> Result<bool> {
        Ok(self.0.contains(row))
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}

pub(crate) struct UnionStep {
    pub(crate) left: EvalStep,
    pub(crate) right: EvalStep,
}

impl UnionStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        let left = self.left.evaluate(bindings, poison)?;
        Ok(Solutions::new(UnionIter {
            right_step: Some(&self.right),
            bindings: bindings.clone(),
            current: Some(left),
            poison: poison.clone(),
        }))
    }
}

struct UnionIter<'a> {
    /// taken when the right side is started
    right_step: Option<&'a EvalStep>,
    bindings: BindingSet,
    current: Option<Solutions<'a>>,
    poison: Poison,
}

impl SolutionIter for UnionIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        loop {
            if let Some(row) = pull_from(&mut self.current)? {
                return Ok(Some(row));
            }
            match self.right_step.take() {
                None => return Ok(None),
                Some(step) => self.current = Some(step.evaluate(&self.bindings, &self.poison)?),
            }
        }
    }
    fn release(&mut self) {
        close_child(&mut self.current);
    }
}

/// `MINUS`: drops left rows that are compatible with, and share a variable with, some right row
pub(crate) struct MinusStep {
    pub(crate) left: EvalStep,
    pub(crate) right: EvalStep,
}

impl MinusStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        let mut left = self.left.evaluate(bindings, poison)?;
        if !left.has_next()? {
            return Ok(Solutions::empty());
        }
        let mut right = self.right.evaluate(bindings, poison)?;
        let mut excluded = vec![];
        while let Some(row) = right.try_next()? {
            poison.check()?;
            excluded.push(row);
        }
        trace!("minus materialized {} right rows", excluded.len());
        Ok(Solutions::new(MinusIter {
            left: Some(left),
            excluded,
            bindings: bindings.clone(),
            poison: poison.clone(),
        }))
    }
}

struct MinusIter<'a> {
    left: Option<Solutions<'a>>,
    excluded: Vec<BindingSet>,
    /// variables both sides inherit from the context do not count as shared
    bindings: BindingSet,
    poison: Poison,
}

impl MinusIter<'_> {
    fn is_excluded(&self, row: &BindingSet) -> bool {
        self.excluded.iter().any(|ex| {
            row.is_compatible(ex)
                && row
                    .names()
                    .any(|v| !self.bindings.contains(v) && ex.contains(v))
        })
    }
}

impl SolutionIter for MinusIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        while let Some(row) = pull_from(&mut self.left)? {
            self.poison.check()?;
            if !self.is_excluded(&row) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
    fn release(&mut self) {
        close_child(&mut self.left);
    }
}

/// `INTERSECTION`: left rows, with their duplicates, that also occur on the right
pub(crate) struct IntersectionStep {
    pub(crate) left: EvalStep,
    pub(crate) right: EvalStep,
    pub(crate) set_factory: Arc<dyn SetFactory>,
}

impl IntersectionStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        let mut left = self.left.evaluate(bindings, poison)?;
        if !left.has_next()? {
            return Ok(Solutions::empty());
        }
        let mut right = self.right.evaluate(bindings, poison)?;
        let mut set = self.set_factory.make_set();
        while let Some(row) = right.try_next()? {
            poison.check()?;
            set.insert(row)?;
        }
        trace!("intersection materialized {} right rows", set.len());
        Ok(Solutions::new(IntersectionIter {
            left: Some(left),
            set,
            poison: poison.clone(),
        }))
    }
}

struct IntersectionIter<'a> {
    left: Option<Solutions<'a>>,
    set: Box<dyn SolutionSet>,
    poison: Poison,
}

impl SolutionIter for IntersectionIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        while let Some(row) = pull_from(&mut self.left)? {
            self.poison.check()?;
            if self.set.contains(&row)? {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }
    fn release(&mut self) {
        close_child(&mut self.left);
    }
}
