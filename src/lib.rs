/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! This crate evaluates optimized SPARQL algebra trees over binding sets.
//!
//! A query is compiled once into a tree of evaluation steps, each of which
//! turns an incoming context (a [BindingSet]) into a lazy, closeable
//! [Solutions] sequence. Joins, `OPTIONAL`, `UNION`, `MINUS`, `INTERSECTION`,
//! slices, sorting, grouping and `VALUES` compose uniformly; statement patterns read from a
//! [TripleSource] and `SERVICE` clauses go to a [FederatedService].
//!
//! ```
//! use std::sync::Arc;
//! use cozo_sparql::*;
//!
//! let store = MemTripleSource::new([
//!     Statement::new(Term::iri("ex:alice"), Term::iri("ex:name"), Term::from("Alice")),
//!     Statement::new(Term::iri("ex:bob"), Term::iri("ex:name"), Term::from("Bob")),
//!     Statement::new(Term::iri("ex:bob"), Term::iri("ex:mbox"), Term::iri("mailto:bob")),
//! ]);
//! let evaluator = QueryEvaluator::new(Arc::new(store), r#"{"service_batch_size": 10}"#).unwrap();
//! let query = TupleExpr::left_join(
//!     TupleExpr::pattern(VarOrTerm::var("p"), VarOrTerm::iri("ex:name"), VarOrTerm::var("name")),
//!     TupleExpr::pattern(VarOrTerm::var("p"), VarOrTerm::iri("ex:mbox"), VarOrTerm::var("mbox")),
//!     None,
//! );
//! let compiled = evaluator.precompile(&query).unwrap();
//! let rows = compiled.evaluate(&BindingSet::new()).unwrap().into_vec().unwrap();
//! assert_eq!(rows.len(), 2);
//! ```
#![warn(rust_2018_idioms, future_incompatible)]
#![warn(missing_docs)]
#![allow(clippy::type_complexity)]

pub use miette::Error;

pub use crate::data::aggr::{AggrOp, Aggregate};
pub use crate::data::binding::BindingSet;
pub use crate::data::expr::{effective_boolean_value, ArithOp, CmpOp, EvalError, Expr, RegexWrapper};
pub use crate::data::symb::{Symbol, ROW_INDEX_VAR};
pub use crate::data::value::{Num, Term};
pub use crate::query::algebra::{
    JoinAlgorithm, OrderElem, ProjectionElem, ServiceExpr, StatementPattern, TupleExpr, VarOrTerm,
};
pub use crate::query::compile::ResultSize;
pub use crate::query::set_ops::{InMemorySetFactory, SetFactory, SolutionSet};
pub use crate::query::solutions::{SolutionIter, Solutions};
pub use crate::runtime::evaluator::{CompiledQuery, Poison, QueryEvaluator};
pub use crate::runtime::federation::{FederatedService, LocalFederatedService, ServiceResolver};
pub use crate::runtime::options::EvalOptions;
pub use crate::runtime::source::{
    GraphScope, MemTripleSource, Statement, StatementIter, TripleSource,
};

pub(crate) mod data;
pub(crate) mod query;
pub(crate) mod runtime;
