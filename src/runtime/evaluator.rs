/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use miette::{bail, Diagnostic, Result};
use thiserror::Error;

use crate::data::binding::BindingSet;
use crate::query::algebra::TupleExpr;
use crate::query::compile::{EvalStep, QueryCompiler, ResultSize};
use crate::query::set_ops::{InMemorySetFactory, SetFactory};
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::runtime::federation::{FederatedService, ServiceResolver};
use crate::runtime::options::EvalOptions;
use crate::runtime::source::TripleSource;

/// Evaluates algebra trees against a triple source.
///
/// ```
/// use std::sync::Arc;
/// use cozo_sparql::*;
///
/// let store = MemTripleSource::new([Statement::new(
///     Term::iri("http://example.org/alice"),
///     Term::iri("http://xmlns.com/foaf/0.1/name"),
///     Term::from("Alice"),
/// )]);
/// let evaluator = QueryEvaluator::new(Arc::new(store), "").unwrap();
/// let query = TupleExpr::pattern(
///     VarOrTerm::var("person"),
///     VarOrTerm::iri("http://xmlns.com/foaf/0.1/name"),
///     VarOrTerm::var("name"),
/// );
/// let rows = evaluator.evaluate(&query, &BindingSet::new()).unwrap();
/// assert_eq!(rows[0].get("name"), Some(&Term::from("Alice")));
/// ```
pub struct QueryEvaluator {
    source: Arc<dyn TripleSource>,
    services: ServiceResolver,
    options: EvalOptions,
    set_factory: Arc<dyn SetFactory>,
}

impl QueryEvaluator {
    /// Creates an evaluator. `options` is a JSON object, see [EvalOptions];
    /// the empty string means all defaults.
    pub fn new(source: Arc<dyn TripleSource>, options: &str) -> Result<Self> {
        Ok(Self {
            source,
            services: Default::default(),
            options: EvalOptions::from_json(options)?,
            set_factory: Arc::new(InMemorySetFactory),
        })
    }
    /// Makes `service` answer `SERVICE <iri>` clauses of queries compiled afterwards
    pub fn register_service(&mut self, iri: &str, service: Arc<dyn FederatedService>) {
        self.services.register(iri, service)
    }
    /// Replaces the factory of the sets materialized by `INTERSECTION` and `DISTINCT`
    pub fn set_set_factory(&mut self, set_factory: Arc<dyn SetFactory>) {
        self.set_factory = set_factory
    }
    /// The options in effect
    pub fn options(&self) -> &EvalOptions {
        &self.options
    }
    /// Compiles a query once, for any number of evaluations
    pub fn precompile(&self, expr: &TupleExpr) -> Result<CompiledQuery> {
        let mut compiler = QueryCompiler::new(
            self.source.clone(),
            Arc::new(self.services.clone()),
            self.options.clone(),
        );
        compiler.set_factory(self.set_factory.clone());
        let (root, result_sizes) = if self.options.track_result_size {
            compiler.compile_tracked(expr)?
        } else {
            (compiler.compile(expr)?, vec![])
        };
        Ok(CompiledQuery {
            root,
            result_sizes,
            timeout: self.options.timeout,
        })
    }
    /// Compiles and runs a query, collecting all solutions
    pub fn evaluate(&self, expr: &TupleExpr, bindings: &BindingSet) -> Result<Vec<BindingSet>> {
        let compiled = self.precompile(expr)?;
        let ret = compiled.evaluate(bindings)?.into_vec();
        ret
    }
}

/// A compiled query plan. Evaluating it twice yields two independent solution sequences.
pub struct CompiledQuery {
    root: EvalStep,
    result_sizes: Vec<ResultSize>,
    timeout: Option<f64>,
}

impl CompiledQuery {
    /// Starts an evaluation, killed after the configured timeout if any
    pub fn evaluate(&self, bindings: &BindingSet) -> Result<Solutions<'_>> {
        let poison = Poison::default();
        if let Some(secs) = self.timeout {
            poison.set_timeout(secs)?;
        }
        self.evaluate_with_poison(bindings, poison)
    }
    /// Starts an evaluation that stops with an error once `poison` is killed
    pub fn evaluate_with_poison(
        &self,
        bindings: &BindingSet,
        poison: Poison,
    ) -> Result<Solutions<'_>> {
        for size in &self.result_sizes {
            size.counter.store(0, Ordering::Relaxed);
        }
        poison.check()?;
        let inner = self.root.evaluate(bindings, &poison)?;
        Ok(Solutions::new(QueryRoot {
            inner: Some(inner),
            poison,
        }))
    }
    /// Rows produced by every step during the last evaluation, in plan pre-order.
    /// Empty unless `track_result_size` is set.
    ///
    /// The counters belong to the plan, not to an evaluation: concurrent
    /// evaluations of the same `CompiledQuery` add to the same counters, and
    /// each evaluation resets them when it starts.
    pub fn result_sizes(&self) -> &[ResultSize] {
        &self.result_sizes
    }
}

struct QueryRoot<'a> {
    inner: Option<Solutions<'a>>,
    poison: Poison,
}

impl SolutionIter for QueryRoot<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        self.poison.check()?;
        pull_from(&mut self.inner)
    }
    fn release(&mut self) {
        close_child(&mut self.inner);
    }
}

/// Kill switch shared between a running query and whoever may cancel it
#[derive(Clone, Debug, Default)]
pub struct Poison(pub(crate) Arc<AtomicBool>);

impl Poison {
    /// Will return `Err` if user has initiated termination.
    #[inline(always)]
    pub fn check(&self) -> Result<()> {
        #[derive(Debug, Error, Diagnostic)]
        #[error("Running query is killed before completion")]
        #[diagnostic(code(eval::killed))]
        #[diagnostic(help("A query may be killed by timeout, or explicit command"))]
        struct ProcessKilled;

        if self.0.load(Ordering::Relaxed) {
            bail!(ProcessKilled)
        }
        Ok(())
    }
    /// Requests termination of the query
    pub fn kill(&self) {
        debug!("query killed");
        self.0.store(true, Ordering::Relaxed);
    }
    pub(crate) fn set_timeout(&self, secs: f64) -> Result<()> {
        let pill = self.clone();
        thread::Builder::new()
            .name("query-timeout".to_string())
            .spawn(move || {
                thread::sleep(Duration::from_micros((secs * 1000000.) as u64));
                pill.0.store(true, Ordering::Relaxed);
            })
            .map_err(|err| miette::miette!("cannot start the timeout thread: {}", err))?;
        Ok(())
    }
}
