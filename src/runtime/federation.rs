/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The federation collaborator answering `SERVICE` calls.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use miette::{bail, Diagnostic, Result};
use smartstring::{LazyCompact, SmartString};
use thiserror::Error;

use crate::data::binding::BindingSet;
use crate::data::symb::ROW_INDEX_VAR;
use crate::data::value::Term;
use crate::query::algebra::ServiceExpr;
use crate::query::compile::QueryCompiler;
use crate::query::solutions::Solutions;
use crate::runtime::evaluator::Poison;
use crate::runtime::options::EvalOptions;
use crate::runtime::source::TripleSource;

/// An endpoint that can evaluate the pattern of a `SERVICE` clause
pub trait FederatedService: Send + Sync {
    /// Evaluates the pattern with `bindings` as constraints.
    /// The returned rows must be compatible with `bindings`.
    fn select<'a>(
        &'a self,
        service: &'a ServiceExpr,
        bindings: &BindingSet,
    ) -> Result<Solutions<'a>>;

    /// Evaluates the pattern for a batch of contexts in one call.
    ///
    /// Every returned row carries the position of the context it belongs to,
    /// bound to [ROW_INDEX_VAR]. The default issues one [Self::select] per context.
    fn select_batch<'a>(
        &'a self,
        service: &'a ServiceExpr,
        batch: &[BindingSet],
    ) -> Result<Solutions<'a>> {
        let mut collected = vec![];
        for (i, bindings) in batch.iter().enumerate() {
            let mut found = self.select(service, bindings)?;
            while let Some(mut row) = found.try_next()? {
                row.insert(ROW_INDEX_VAR, Term::from(i));
                collected.push(row);
            }
        }
        Ok(Solutions::from_vec(collected))
    }
}

#[derive(Debug, Error, Diagnostic)]
#[error("No federated service is registered for <{0}>")]
#[diagnostic(code(eval::unknown_service))]
#[diagnostic(help("Register the endpoint with the evaluator before running the query"))]
pub(crate) struct UnknownService(pub(crate) String);

/// Maps endpoint IRIs to services
#[derive(Default, Clone)]
pub struct ServiceResolver {
    services: BTreeMap<SmartString<LazyCompact>, Arc<dyn FederatedService>>,
}

impl ServiceResolver {
    /// Registers `service` under `iri`, replacing any previous registration
    pub fn register(&mut self, iri: &str, service: Arc<dyn FederatedService>) {
        self.services.insert(SmartString::from(iri), service);
    }
    /// The service registered for `iri`
    pub fn resolve(&self, iri: &str) -> Result<&dyn FederatedService> {
        match self.services.get(iri) {
            Some(service) => Ok(service.as_ref()),
            None => bail!(UnknownService(iri.to_string())),
        }
    }
}

/// Evaluates `SERVICE` patterns against a local triple source
pub struct LocalFederatedService {
    compiler: QueryCompiler,
    requests: AtomicUsize,
}

impl LocalFederatedService {
    /// Serves patterns from `source`
    pub fn new(source: Arc<dyn TripleSource>) -> Self {
        Self {
            compiler: QueryCompiler::new(
                source,
                Arc::new(ServiceResolver::default()),
                EvalOptions::default(),
            ),
            requests: AtomicUsize::new(0),
        }
    }
    /// Number of calls received so far, a batch counting once
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl FederatedService for LocalFederatedService {
    fn select<'a>(
        &'a self,
        service: &'a ServiceExpr,
        bindings: &BindingSet,
    ) -> Result<Solutions<'a>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let step = self.compiler.compile(&service.pattern)?;
        // the endpoint runs independently of the caller's kill switch
        let rows = step.evaluate(bindings, &Poison::default())?.into_vec()?;
        Ok(Solutions::from_vec(rows))
    }

    fn select_batch<'a>(
        &'a self,
        service: &'a ServiceExpr,
        batch: &[BindingSet],
    ) -> Result<Solutions<'a>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let step = self.compiler.compile(&service.pattern)?;
        let mut collected = vec![];
        for (i, bindings) in batch.iter().enumerate() {
            for row in step.evaluate(bindings, &Poison::default())?.into_vec()? {
                collected.push(row.with(ROW_INDEX_VAR, Term::from(i)));
            }
        }
        Ok(Solutions::from_vec(collected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::algebra::{TupleExpr, VarOrTerm};
    use crate::runtime::source::{MemTripleSource, Statement};

    #[test]
    fn batch_results_carry_row_index() {
        let source = Arc::new(MemTripleSource::new([
            Statement::new(Term::iri("a"), Term::iri("p"), Term::from(1)),
            Statement::new(Term::iri("b"), Term::iri("p"), Term::from(2)),
            Statement::new(Term::iri("b"), Term::iri("p"), Term::from(3)),
        ]));
        let service = LocalFederatedService::new(source);
        let expr = ServiceExpr {
            service_ref: VarOrTerm::iri("http://remote"),
            pattern: Box::new(TupleExpr::pattern(
                VarOrTerm::var("s"),
                VarOrTerm::iri("p"),
                VarOrTerm::var("o"),
            )),
            silent: false,
        };
        let batch = vec![
            BindingSet::singleton("s", Term::iri("b")),
            BindingSet::singleton("s", Term::iri("c")),
            BindingSet::singleton("s", Term::iri("a")),
        ];
        let rows = service.select_batch(&expr, &batch).unwrap().into_vec().unwrap();
        let indices: Vec<_> = rows.iter().map(|r| r.get(ROW_INDEX_VAR).cloned()).collect();
        assert_eq!(
            indices,
            vec![
                Some(Term::from(0)),
                Some(Term::from(0)),
                Some(Term::from(2))
            ]
        );
        assert_eq!(service.requests(), 1);

        let mut resolver = ServiceResolver::default();
        assert!(resolver.resolve("http://remote").is_err());
        resolver.register("http://remote", Arc::new(service));
        assert!(resolver.resolve("http://remote").is_ok());
    }
}
