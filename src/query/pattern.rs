/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::sync::Arc;

use miette::Result;

use crate::data::binding::BindingSet;
use crate::data::value::Term;
use crate::query::algebra::{StatementPattern, VarOrTerm};
use crate::query::solutions::{SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;
use crate::runtime::source::{GraphScope, Statement, StatementIter, TripleSource};

/// Leaf step scanning the triple source
pub(crate) struct PatternStep {
    pub(crate) pattern: StatementPattern,
    pub(crate) source: Arc<dyn TripleSource>,
}

impl PatternStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        let sp = &self.pattern;
        let graph = match &sp.graph {
            None => GraphScope::Default,
            Some(g) => match g.resolve(bindings) {
                Some(t) => GraphScope::Named(t),
                None => GraphScope::AnyNamed,
            },
        };
        let statements = self.source.statements(
            sp.subject.resolve(bindings),
            sp.predicate.resolve(bindings),
            sp.object.resolve(bindings),
            graph,
        )?;
        Ok(Solutions::new(PatternIter {
            statements: Some(statements),
            pattern: sp,
            bindings: bindings.clone(),
            poison: poison.clone(),
        }))
    }
}

struct PatternIter<'a> {
    statements: Option<StatementIter<'a>>,
    pattern: &'a StatementPattern,
    bindings: BindingSet,
    poison: Poison,
}

impl PatternIter<'_> {
    /// Binds the pattern variables, `None` if a repeated variable does not match
    fn bind(&self, st: Statement) -> Option<BindingSet> {
        let mut ret = self.bindings.clone();
        bind_position(&mut ret, &self.pattern.subject, st.subject)?;
        bind_position(&mut ret, &self.pattern.predicate, st.predicate)?;
        bind_position(&mut ret, &self.pattern.object, st.object)?;
        if let (Some(pos), Some(g)) = (&self.pattern.graph, st.graph) {
            bind_position(&mut ret, pos, g)?;
        }
        Some(ret)
    }
}

fn bind_position(row: &mut BindingSet, pos: &VarOrTerm, val: Term) -> Option<()> {
    if let VarOrTerm::Var(v) = pos {
        match row.get(v) {
            Some(existing) if *existing != val => return None,
            Some(_) => {}
            None => {
                row.insert(v.clone(), val);
            }
        }
    }
    Some(())
}

impl SolutionIter for PatternIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        loop {
            self.poison.check()?;
            let st = match self.statements.as_mut().and_then(|it| it.next()) {
                None => return Ok(None),
                Some(st) => st?,
            };
            if let Some(row) = self.bind(st) {
                return Ok(Some(row));
            }
        }
    }
    fn release(&mut self) {
        self.statements = None;
    }
}
