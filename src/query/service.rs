/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! `SERVICE`, alone and as the right side of vectored joins.
//!
//! Vectored joins collect up to `batch_size` consecutive left rows resolving
//! to the same endpoint and ship them in one call. The endpoint tags each
//! result with the position of its context in the batch.

use std::sync::Arc;

use itertools::Itertools;
use log::{debug, trace};
use miette::{bail, Diagnostic, Result};
use thiserror::Error;

use crate::data::binding::BindingSet;
use crate::data::expr::Expr;
use crate::data::symb::ROW_INDEX_VAR;
use crate::data::value::{Num, Term};
use crate::query::algebra::{ServiceExpr, VarOrTerm};
use crate::query::compile::EvalStep;
use crate::query::left_join::passes;
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;
use crate::runtime::federation::{FederatedService, ServiceResolver};

#[derive(Debug, Error, Diagnostic)]
#[error("SERVICE reference {0} is not bound to an IRI")]
#[diagnostic(code(eval::bad_service_ref))]
struct BadServiceRef(String);

#[derive(Debug, Error, Diagnostic)]
#[error("SERVICE result carries an invalid row index {0:?}")]
#[diagnostic(code(eval::bad_row_index))]
#[diagnostic(help("Results of a batched call must bind '__rowIdx' to a position in the batch"))]
struct BadRowIndex(Option<Term>);

/// What every `SERVICE` step needs to reach the endpoint
pub(crate) struct ServiceCall {
    pub(crate) service: ServiceExpr,
    pub(crate) resolver: Arc<ServiceResolver>,
}

impl ServiceCall {
    /// The endpoint IRI the reference resolves to for `row`
    fn endpoint<'r>(&'r self, row: &'r BindingSet) -> Option<&'r str> {
        match self.service.service_ref.resolve(row) {
            Some(Term::Iri(iri)) => Some(iri.as_str()),
            _ => None,
        }
    }

    fn resolve(&self, endpoint: Option<&str>) -> Result<&dyn FederatedService> {
        match endpoint {
            Some(iri) => self.resolver.resolve(iri),
            None => bail!(BadServiceRef(format!("{:?}", self.service.service_ref))),
        }
    }

    /// Calls the endpoint for one batch, returning the rows matching each context
    fn call_batch(
        &self,
        endpoint: Option<&str>,
        batch: &[BindingSet],
    ) -> Result<Vec<Vec<BindingSet>>> {
        match self.try_call_batch(endpoint, batch) {
            Ok(groups) => Ok(groups),
            Err(err) if self.service.silent => {
                debug!("silent SERVICE failed, passing the input through: {}", err);
                Ok(batch.iter().map(|row| vec![row.clone()]).collect_vec())
            }
            Err(err) => Err(err),
        }
    }

    fn try_call_batch(
        &self,
        endpoint: Option<&str>,
        batch: &[BindingSet],
    ) -> Result<Vec<Vec<BindingSet>>> {
        let service = self.resolve(endpoint)?;
        let mut results = service.select_batch(&self.service, batch)?;
        let mut groups = vec![vec![]; batch.len()];
        while let Some(mut row) = results.try_next()? {
            let idx = match row.remove(ROW_INDEX_VAR) {
                Some(Term::Num(Num::Int(i))) if i >= 0 && (i as usize) < batch.len() => {
                    i as usize
                }
                other => bail!(BadRowIndex(other)),
            };
            if let Some(merged) = batch[idx].merge(&row) {
                groups[idx].push(merged);
            }
        }
        trace!(
            "SERVICE batch of {} contexts returned {} rows",
            batch.len(),
            groups.iter().map(|g| g.len()).sum::<usize>()
        );
        Ok(groups)
    }
}

/// Standalone `SERVICE`, one call per context
pub(crate) struct ServiceStep {
    pub(crate) call: ServiceCall,
}

impl ServiceStep {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        let service = &self.call.service;
        let found = self
            .call
            .resolve(self.call.endpoint(bindings))
            .and_then(|endpoint| endpoint.select(service, bindings));
        match found {
            Ok(found) => Ok(Solutions::new(ServiceIter {
                found: Some(found),
                bindings: bindings.clone(),
                silent: service.silent,
                poison: poison.clone(),
            })),
            Err(err) if service.silent => {
                debug!("silent SERVICE failed, passing the input through: {}", err);
                Ok(Solutions::singleton(bindings.clone()))
            }
            Err(err) => Err(err),
        }
    }
}

struct ServiceIter<'a> {
    found: Option<Solutions<'a>>,
    bindings: BindingSet,
    silent: bool,
    poison: Poison,
}

impl SolutionIter for ServiceIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        loop {
            // checked outside the silent error handling, a kill is never swallowed
            self.poison.check()?;
            let row = match pull_from(&mut self.found) {
                Ok(row) => row,
                Err(err) if self.silent => {
                    debug!("silent SERVICE failed while streaming: {}", err);
                    self.found = None;
                    None
                }
                Err(err) => return Err(err),
            };
            match row {
                None => return Ok(None),
                Some(row) => {
                    if let Some(merged) = self.bindings.merge(&row) {
                        return Ok(Some(merged));
                    }
                }
            }
        }
    }
    fn release(&mut self) {
        close_child(&mut self.found);
    }
}

/// Pulls the next batch of left rows that share an endpoint
fn next_batch(
    left: &mut Option<Solutions<'_>>,
    service_ref: &VarOrTerm,
    batch_size: usize,
    poison: &Poison,
) -> Result<(Option<Term>, Vec<BindingSet>)> {
    let mut batch = vec![];
    poison.check()?;
    let first = match pull_from(left)? {
        None => return Ok((None, batch)),
        Some(row) => row,
    };
    let endpoint = service_ref.resolve(&first).cloned();
    batch.push(first);
    while batch.len() < batch_size {
        let same_endpoint = match left.as_mut() {
            None => false,
            Some(it) => match it.peek()? {
                None => false,
                Some(row) => service_ref.resolve(row) == endpoint.as_ref(),
            },
        };
        if !same_endpoint {
            break;
        }
        poison.check()?;
        match pull_from(left)? {
            Some(row) => batch.push(row),
            None => break,
        }
    }
    Ok((endpoint, batch))
}

fn as_iri(term: &Option<Term>) -> Option<&str> {
    match term {
        Some(Term::Iri(iri)) => Some(iri.as_str()),
        _ => None,
    }
}

/// Join with a `SERVICE` on the right, shipping left rows in batches
pub(crate) struct ServiceJoin {
    pub(crate) left: EvalStep,
    pub(crate) call: ServiceCall,
    pub(crate) batch_size: usize,
}

impl ServiceJoin {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        let mut left = self.left.evaluate(bindings, poison)?;
        if !left.has_next()? {
            return Ok(Solutions::empty());
        }
        Ok(Solutions::new(ServiceJoinIter {
            call: &self.call,
            batch_size: self.batch_size,
            left: Some(left),
            pending: vec![].into_iter(),
            poison: poison.clone(),
        }))
    }
}

struct ServiceJoinIter<'a> {
    call: &'a ServiceCall,
    batch_size: usize,
    left: Option<Solutions<'a>>,
    pending: std::vec::IntoIter<BindingSet>,
    poison: Poison,
}

impl SolutionIter for ServiceJoinIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        loop {
            if let Some(row) = self.pending.next() {
                return Ok(Some(row));
            }
            let (endpoint, batch) = next_batch(
                &mut self.left,
                &self.call.service.service_ref,
                self.batch_size,
                &self.poison,
            )?;
            if batch.is_empty() {
                return Ok(None);
            }
            let groups = self.call.call_batch(as_iri(&endpoint), &batch)?;
            self.pending = groups.into_iter().flatten().collect_vec().into_iter();
        }
    }
    fn release(&mut self) {
        close_child(&mut self.left);
    }
}

/// Left join with a `SERVICE` on the right, shipping left rows in batches
pub(crate) struct ServiceLeftJoin {
    pub(crate) left: EvalStep,
    pub(crate) call: ServiceCall,
    pub(crate) batch_size: usize,
    pub(crate) condition: Option<Expr>,
}

impl ServiceLeftJoin {
    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        Ok(Solutions::new(ServiceLeftJoinIter {
            join: self,
            left: Some(self.left.evaluate(bindings, poison)?),
            pending: vec![].into_iter(),
            poison: poison.clone(),
        }))
    }
}

struct ServiceLeftJoinIter<'a> {
    join: &'a ServiceLeftJoin,
    left: Option<Solutions<'a>>,
    pending: std::vec::IntoIter<BindingSet>,
    poison: Poison,
}

impl SolutionIter for ServiceLeftJoinIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        loop {
            if let Some(row) = self.pending.next() {
                return Ok(Some(row));
            }
            let call = &self.join.call;
            let (endpoint, batch) = next_batch(
                &mut self.left,
                &call.service.service_ref,
                self.join.batch_size,
                &self.poison,
            )?;
            if batch.is_empty() {
                return Ok(None);
            }
            let groups = call.call_batch(as_iri(&endpoint), &batch)?;
            let mut out = vec![];
            for (left_row, matched) in batch.into_iter().zip(groups) {
                let before = out.len();
                out.extend(
                    matched
                        .into_iter()
                        .filter(|row| passes(&self.join.condition, row)),
                );
                if out.len() == before {
                    out.push(left_row);
                }
            }
            self.pending = out.into_iter();
        }
    }
    fn release(&mut self) {
        close_child(&mut self.left);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::query::algebra::TupleExpr;
    use crate::query::values::ValuesStep;

    /// Answers every context with one row and records the batch sizes
    #[derive(Default)]
    struct Echo {
        batches: Mutex<Vec<usize>>,
        bad_index: bool,
    }

    impl FederatedService for Echo {
        fn select<'a>(
            &'a self,
            _service: &'a ServiceExpr,
            bindings: &BindingSet,
        ) -> Result<Solutions<'a>> {
            Ok(Solutions::singleton(bindings.clone().with("seen", true)))
        }
        fn select_batch<'a>(
            &'a self,
            _service: &'a ServiceExpr,
            batch: &[BindingSet],
        ) -> Result<Solutions<'a>> {
            if let Ok(mut batches) = self.batches.lock() {
                batches.push(batch.len());
            }
            let offset = if self.bad_index { batch.len() } else { 0 };
            Ok(Solutions::from_vec(
                (0..batch.len())
                    .map(|i| BindingSet::singleton(ROW_INDEX_VAR, i + offset).with("seen", true))
                    .collect(),
            ))
        }
    }

    fn call(echo: Arc<Echo>, service_ref: VarOrTerm) -> ServiceCall {
        let mut resolver = ServiceResolver::default();
        resolver.register("http://a", echo.clone());
        resolver.register("http://b", echo);
        ServiceCall {
            service: ServiceExpr {
                service_ref,
                pattern: Box::new(TupleExpr::SingletonSet),
                silent: false,
            },
            resolver: Arc::new(resolver),
        }
    }

    fn endpoints(iris: &[&str]) -> EvalStep {
        EvalStep::Values(ValuesStep {
            rows: iris
                .iter()
                .enumerate()
                .map(|(i, iri)| BindingSet::singleton("ep", Term::iri(*iri)).with("i", i))
                .collect(),
        })
    }

    #[test]
    fn batches_break_on_endpoint_change() {
        let echo = Arc::new(Echo::default());
        let join = ServiceJoin {
            left: endpoints(&["http://a", "http://a", "http://a", "http://b", "http://a"]),
            call: call(echo.clone(), VarOrTerm::var("ep")),
            batch_size: 2,
        };
        let rows = join
            .evaluate(&BindingSet::new(), &Poison::default())
            .unwrap()
            .into_vec()
            .unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.get("seen") == Some(&Term::Bool(true))));
        assert_eq!(
            rows.iter().map(|r| r.get("i").cloned()).collect_vec(),
            (0..5).map(|i| Some(Term::from(i))).collect_vec()
        );
        assert_eq!(*echo.batches.lock().unwrap(), vec![2, 1, 1, 1]);
    }

    #[test]
    fn out_of_range_row_index_is_an_error() {
        let echo = Arc::new(Echo {
            bad_index: true,
            ..Default::default()
        });
        let join = ServiceJoin {
            left: endpoints(&["http://a"]),
            call: call(echo, VarOrTerm::iri("http://a")),
            batch_size: 4,
        };
        let err = join
            .evaluate(&BindingSet::new(), &Poison::default())
            .unwrap()
            .into_vec()
            .unwrap_err();
        assert!(err.to_string().contains("row index"));
    }

    #[test]
    fn unbound_service_variable_is_an_error() {
        let step = ServiceStep {
            call: call(Arc::new(Echo::default()), VarOrTerm::var("nowhere")),
        };
        assert!(step.evaluate(&BindingSet::new(), &Poison::default()).is_err());
        let step = ServiceStep {
            call: call(Arc::new(Echo::default()), VarOrTerm::var("ep")),
        };
        let rows = step
            .evaluate(
                &BindingSet::singleton("ep", Term::iri("http://b")),
                &Poison::default(),
            )
            .unwrap()
            .into_vec()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("seen"), Some(&Term::Bool(true)));
    }

    #[test]
    fn silent_service_does_not_hide_a_kill() {
        let mut call = call(Arc::new(Echo::default()), VarOrTerm::var("ep"));
        call.service.silent = true;
        let step = ServiceStep { call };
        let poison = Poison::default();
        let mut rows = step
            .evaluate(&BindingSet::singleton("ep", Term::iri("http://a")), &poison)
            .unwrap();
        poison.kill();
        assert!(rows.try_next().is_err());
    }
}
