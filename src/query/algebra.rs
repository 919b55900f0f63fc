/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The optimized algebra tree handed over by the planner, and the static
//! variable-scope analysis the compiler runs on it.

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};

use crate::data::aggr::Aggregate;
use crate::data::binding::BindingSet;
use crate::data::expr::Expr;
use crate::data::symb::Symbol;
use crate::data::value::Term;

/// A position of a statement pattern, or the target of a SERVICE
#[derive(Clone, PartialEq, Eq)]
pub enum VarOrTerm {
    /// variable
    Var(Symbol),
    /// constant
    Term(Term),
}

impl VarOrTerm {
    /// `?name`
    pub fn var(name: &str) -> Self {
        VarOrTerm::Var(Symbol::new(name))
    }
    /// A constant IRI
    pub fn iri(iri: &str) -> Self {
        VarOrTerm::Term(Term::iri(iri))
    }
    pub(crate) fn get_var(&self) -> Option<&Symbol> {
        match self {
            VarOrTerm::Var(v) => Some(v),
            VarOrTerm::Term(_) => None,
        }
    }
    /// The constant, or the value the context binds the variable to
    pub(crate) fn resolve<'a>(&'a self, bindings: &'a BindingSet) -> Option<&'a Term> {
        match self {
            VarOrTerm::Var(v) => bindings.get(v),
            VarOrTerm::Term(t) => Some(t),
        }
    }
}

impl Debug for VarOrTerm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VarOrTerm::Var(v) => write!(f, "{v}"),
            VarOrTerm::Term(t) => write!(f, "{t}"),
        }
    }
}

impl From<Term> for VarOrTerm {
    fn from(value: Term) -> Self {
        VarOrTerm::Term(value)
    }
}

/// A triple (or quad, with a graph) pattern
#[derive(Clone, Debug, PartialEq)]
pub struct StatementPattern {
    /// subject position
    pub subject: VarOrTerm,
    /// predicate position
    pub predicate: VarOrTerm,
    /// object position
    pub object: VarOrTerm,
    /// named graph, `None` for the default graph
    pub graph: Option<VarOrTerm>,
}

impl StatementPattern {
    /// A triple pattern over the default graph
    pub fn new(subject: VarOrTerm, predicate: VarOrTerm, object: VarOrTerm) -> Self {
        Self {
            subject,
            predicate,
            object,
            graph: None,
        }
    }
    pub(crate) fn positions(&self) -> impl Iterator<Item = &VarOrTerm> {
        [&self.subject, &self.predicate, &self.object]
            .into_iter()
            .chain(self.graph.as_ref())
    }
    pub(crate) fn vars(&self) -> BTreeSet<Symbol> {
        self.positions().filter_map(|p| p.get_var()).cloned().collect()
    }
}

/// Join algorithm chosen by the planner
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinAlgorithm {
    /// re-evaluate the right side for every left row
    NestedLoop,
    /// materialize the right side once and look rows up in it
    Hash,
    /// ship batches of left rows to a SERVICE
    Vectored,
}

/// `?source AS ?target` in a projection
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectionElem {
    /// variable in the argument
    pub source: Symbol,
    /// variable in the output
    pub target: Symbol,
}

impl ProjectionElem {
    /// Projects the variable under its own name
    pub fn same(name: &str) -> Self {
        Self {
            source: Symbol::new(name),
            target: Symbol::new(name),
        }
    }
}

/// One `ORDER BY` key
#[derive(Clone, Debug, PartialEq)]
pub struct OrderElem {
    /// sort key
    pub expr: Expr,
    /// `ASC` or `DESC`
    pub ascending: bool,
}

/// A `SERVICE` call
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceExpr {
    /// endpoint IRI, or a variable bound to it
    pub service_ref: VarOrTerm,
    /// the pattern evaluated remotely
    pub pattern: Box<TupleExpr>,
    /// `SERVICE SILENT`: failures produce the input row instead of an error
    pub silent: bool,
}

/// Algebra tree of a query, as produced by the optimizer
#[derive(Clone, Debug, PartialEq)]
pub enum TupleExpr {
    /// basic graph pattern leaf
    StatementPattern(StatementPattern),
    /// inner join
    Join {
        /// left argument
        left: Box<TupleExpr>,
        /// right argument
        right: Box<TupleExpr>,
        /// algorithm chosen by the planner, derived from the tree if absent
        algorithm: Option<JoinAlgorithm>,
        /// join variables computed by the planner, derived from the tree if absent
        join_vars: Option<BTreeSet<Symbol>>,
    },
    /// `OPTIONAL`
    LeftJoin {
        /// mandatory part
        left: Box<TupleExpr>,
        /// optional part
        right: Box<TupleExpr>,
        /// `FILTER` inside the `OPTIONAL`
        condition: Option<Expr>,
    },
    /// `UNION`
    Union(Box<TupleExpr>, Box<TupleExpr>),
    /// `MINUS`
    Difference(Box<TupleExpr>, Box<TupleExpr>),
    /// `INTERSECTION`
    Intersection(Box<TupleExpr>, Box<TupleExpr>),
    /// `OFFSET` and `LIMIT`
    Slice {
        /// argument
        arg: Box<TupleExpr>,
        /// rows to skip
        offset: Option<usize>,
        /// maximum rows to return
        limit: Option<usize>,
    },
    /// `VALUES`
    BindingSetAssignment {
        /// candidate rows
        rows: Vec<BindingSet>,
        /// all variables of the `VALUES` clause, including ones left `UNDEF` everywhere
        binding_names: BTreeSet<Symbol>,
    },
    /// `FILTER`
    Filter {
        /// argument
        arg: Box<TupleExpr>,
        /// condition
        condition: Expr,
    },
    /// `BIND`
    Extension {
        /// argument
        arg: Box<TupleExpr>,
        /// new variables and their expressions, evaluated in order
        elements: Vec<(Symbol, Expr)>,
    },
    /// `SELECT` projection
    Projection {
        /// argument
        arg: Box<TupleExpr>,
        /// projected variables
        elements: Vec<ProjectionElem>,
        /// whether this is a subquery, i.e. a variable scope boundary
        subquery: bool,
    },
    /// `DISTINCT`
    Distinct(Box<TupleExpr>),
    /// `REDUCED`
    Reduced(Box<TupleExpr>),
    /// `ORDER BY`
    Order {
        /// argument
        arg: Box<TupleExpr>,
        /// sort keys
        elements: Vec<OrderElem>,
    },
    /// `GROUP BY` and aggregates
    Group {
        /// argument
        arg: Box<TupleExpr>,
        /// grouping variables, none for a single group
        group_by: Vec<Symbol>,
        /// aggregates and the variables they bind
        aggregates: Vec<(Symbol, Aggregate)>,
    },
    /// `SERVICE`
    Service(ServiceExpr),
    /// no solutions
    EmptySet,
    /// the single empty solution
    SingletonSet,
}

impl TupleExpr {
    /// Triple pattern leaf
    pub fn pattern(subject: VarOrTerm, predicate: VarOrTerm, object: VarOrTerm) -> Self {
        TupleExpr::StatementPattern(StatementPattern::new(subject, predicate, object))
    }
    /// Join with the algorithm left to the compiler
    pub fn join(left: TupleExpr, right: TupleExpr) -> Self {
        TupleExpr::Join {
            left: Box::new(left),
            right: Box::new(right),
            algorithm: None,
            join_vars: None,
        }
    }
    /// `OPTIONAL`, with an optional condition
    pub fn left_join(left: TupleExpr, right: TupleExpr, condition: Option<Expr>) -> Self {
        TupleExpr::LeftJoin {
            left: Box::new(left),
            right: Box::new(right),
            condition,
        }
    }
    /// `UNION`
    pub fn union(left: TupleExpr, right: TupleExpr) -> Self {
        TupleExpr::Union(Box::new(left), Box::new(right))
    }
    /// `MINUS`
    pub fn minus(left: TupleExpr, right: TupleExpr) -> Self {
        TupleExpr::Difference(Box::new(left), Box::new(right))
    }
    /// `INTERSECTION`
    pub fn intersection(left: TupleExpr, right: TupleExpr) -> Self {
        TupleExpr::Intersection(Box::new(left), Box::new(right))
    }
    /// `OFFSET`/`LIMIT`
    pub fn slice(arg: TupleExpr, offset: Option<usize>, limit: Option<usize>) -> Self {
        TupleExpr::Slice {
            arg: Box::new(arg),
            offset,
            limit,
        }
    }
    /// `VALUES`, variables are collected from the rows
    pub fn values(rows: Vec<BindingSet>) -> Self {
        let binding_names = rows.iter().flat_map(|r| r.names().cloned()).collect();
        TupleExpr::BindingSetAssignment {
            rows,
            binding_names,
        }
    }
    /// `FILTER`
    pub fn filter(arg: TupleExpr, condition: Expr) -> Self {
        TupleExpr::Filter {
            arg: Box::new(arg),
            condition,
        }
    }
    /// `BIND(expr AS ?var)`
    pub fn extend(arg: TupleExpr, var: &str, expr: Expr) -> Self {
        TupleExpr::Extension {
            arg: Box::new(arg),
            elements: vec![(Symbol::new(var), expr)],
        }
    }
    /// Projection keeping the variable names
    pub fn project(arg: TupleExpr, vars: &[&str], subquery: bool) -> Self {
        TupleExpr::Projection {
            arg: Box::new(arg),
            elements: vars.iter().map(|v| ProjectionElem::same(v)).collect(),
            subquery,
        }
    }
    /// `ORDER BY`
    pub fn order(arg: TupleExpr, elements: Vec<OrderElem>) -> Self {
        TupleExpr::Order {
            arg: Box::new(arg),
            elements,
        }
    }
    /// `GROUP BY` with aggregates
    pub fn group(arg: TupleExpr, group_by: &[&str], aggregates: Vec<(&str, Aggregate)>) -> Self {
        TupleExpr::Group {
            arg: Box::new(arg),
            group_by: group_by.iter().map(Symbol::new).collect(),
            aggregates: aggregates
                .into_iter()
                .map(|(v, a)| (Symbol::new(v), a))
                .collect(),
        }
    }
    /// `SERVICE <iri> { pattern }`
    pub fn service(service_ref: VarOrTerm, pattern: TupleExpr, silent: bool) -> Self {
        TupleExpr::Service(ServiceExpr {
            service_ref,
            pattern: Box::new(pattern),
            silent,
        })
    }

    fn children(&self) -> Vec<&TupleExpr> {
        match self {
            TupleExpr::StatementPattern(_)
            | TupleExpr::BindingSetAssignment { .. }
            | TupleExpr::EmptySet
            | TupleExpr::SingletonSet => vec![],
            TupleExpr::Join { left, right, .. } | TupleExpr::LeftJoin { left, right, .. } => {
                vec![left, right]
            }
            TupleExpr::Union(l, r)
            | TupleExpr::Difference(l, r)
            | TupleExpr::Intersection(l, r) => vec![l, r],
            TupleExpr::Slice { arg, .. }
            | TupleExpr::Filter { arg, .. }
            | TupleExpr::Extension { arg, .. }
            | TupleExpr::Projection { arg, .. }
            | TupleExpr::Order { arg, .. }
            | TupleExpr::Group { arg, .. }
            | TupleExpr::Distinct(arg)
            | TupleExpr::Reduced(arg) => vec![arg],
            TupleExpr::Service(s) => vec![&s.pattern],
        }
    }

    /// Variables that may be bound by the solutions of this expression
    pub fn binding_names(&self) -> BTreeSet<Symbol> {
        match self {
            TupleExpr::StatementPattern(sp) => sp.vars(),
            TupleExpr::Join { left, right, .. }
            | TupleExpr::LeftJoin { left, right, .. }
            | TupleExpr::Union(left, right)
            | TupleExpr::Intersection(left, right) => {
                let mut ret = left.binding_names();
                ret.extend(right.binding_names());
                ret
            }
            TupleExpr::Difference(left, _) => left.binding_names(),
            TupleExpr::BindingSetAssignment { binding_names, .. } => binding_names.clone(),
            TupleExpr::Extension { arg, elements } => {
                let mut ret = arg.binding_names();
                ret.extend(elements.iter().map(|(v, _)| v.clone()));
                ret
            }
            TupleExpr::Projection { elements, .. } => {
                elements.iter().map(|e| e.target.clone()).collect()
            }
            TupleExpr::Group {
                group_by,
                aggregates,
                ..
            } => group_by
                .iter()
                .chain(aggregates.iter().map(|(v, _)| v))
                .cloned()
                .collect(),
            TupleExpr::Slice { arg, .. }
            | TupleExpr::Filter { arg, .. }
            | TupleExpr::Order { arg, .. }
            | TupleExpr::Distinct(arg)
            | TupleExpr::Reduced(arg) => arg.binding_names(),
            TupleExpr::Service(s) => s.pattern.binding_names(),
            TupleExpr::EmptySet | TupleExpr::SingletonSet => BTreeSet::new(),
        }
    }

    /// Variables bound in every solution of this expression
    pub fn assured_binding_names(&self) -> BTreeSet<Symbol> {
        match self {
            TupleExpr::StatementPattern(sp) => sp.vars(),
            TupleExpr::Join { left, right, .. } | TupleExpr::Intersection(left, right) => {
                let mut ret = left.assured_binding_names();
                ret.extend(right.assured_binding_names());
                ret
            }
            TupleExpr::LeftJoin { left, .. } | TupleExpr::Difference(left, _) => {
                left.assured_binding_names()
            }
            TupleExpr::Union(left, right) => left
                .assured_binding_names()
                .intersection(&right.assured_binding_names())
                .cloned()
                .collect(),
            TupleExpr::BindingSetAssignment {
                rows,
                binding_names,
            } => binding_names
                .iter()
                .filter(|v| rows.iter().all(|r| r.contains(v)))
                .cloned()
                .collect(),
            TupleExpr::Projection { arg, elements, .. } => {
                let assured = arg.assured_binding_names();
                elements
                    .iter()
                    .filter(|e| assured.contains(&e.source))
                    .map(|e| e.target.clone())
                    .collect()
            }
            // a failing aggregate leaves its variable unbound
            TupleExpr::Group { arg, group_by, .. } => {
                let assured = arg.assured_binding_names();
                group_by
                    .iter()
                    .filter(|v| assured.contains(*v))
                    .cloned()
                    .collect()
            }
            // a BIND whose expression fails leaves its variable unbound
            TupleExpr::Extension { arg, .. }
            | TupleExpr::Slice { arg, .. }
            | TupleExpr::Filter { arg, .. }
            | TupleExpr::Order { arg, .. }
            | TupleExpr::Distinct(arg)
            | TupleExpr::Reduced(arg) => arg.assured_binding_names(),
            TupleExpr::Service(s) => s.pattern.assured_binding_names(),
            TupleExpr::EmptySet | TupleExpr::SingletonSet => BTreeSet::new(),
        }
    }

    /// Whether the expression opens a new variable scope, i.e. is a subquery
    pub fn is_variable_scope_change(&self) -> bool {
        matches!(self, TupleExpr::Projection { subquery: true, .. })
    }

    /// Whether a subquery occurs anywhere in the expression
    pub fn contains_subquery(&self) -> bool {
        self.is_variable_scope_change()
            || self
                .children()
                .into_iter()
                .any(|c| c.contains_subquery())
    }

    /// Variables bound on both sides, the key of a hash join
    pub(crate) fn join_variables(left: &TupleExpr, right: &TupleExpr) -> BTreeSet<Symbol> {
        left.binding_names()
            .intersection(&right.binding_names())
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sp(s: &str, p: &str, o: &str) -> TupleExpr {
        TupleExpr::pattern(VarOrTerm::var(s), VarOrTerm::iri(p), VarOrTerm::var(o))
    }

    #[test]
    fn scope_analysis() {
        let lj = TupleExpr::left_join(
            sp("person", "http://xmlns.com/foaf/0.1/name", "name"),
            sp("person", "http://xmlns.com/foaf/0.1/mbox", "mbox"),
            None,
        );
        let names = lj.binding_names();
        assert!(names.contains("mbox"));
        let assured = lj.assured_binding_names();
        assert!(assured.contains("name"));
        assert!(!assured.contains("mbox"));

        let u = TupleExpr::union(sp("a", "http://p", "b"), sp("a", "http://q", "c"));
        assert_eq!(
            u.assured_binding_names(),
            BTreeSet::from([Symbol::new("a")])
        );
    }

    #[test]
    fn subquery_detection() {
        let sub = TupleExpr::project(sp("a", "http://p", "b"), &["a"], true);
        assert!(sub.is_variable_scope_change());
        assert_eq!(sub.binding_names(), BTreeSet::from([Symbol::new("a")]));
        let f = TupleExpr::filter(sub, Expr::val(true));
        assert!(!f.is_variable_scope_change());
        assert!(f.contains_subquery());
        assert!(!sp("a", "http://p", "b").contains_subquery());
    }

    #[test]
    fn values_assured_names() {
        let v = TupleExpr::values(vec![
            BindingSet::singleton("x", 1).with("y", 2),
            BindingSet::singleton("x", 3),
        ]);
        assert_eq!(v.binding_names().len(), 2);
        assert_eq!(
            v.assured_binding_names(),
            BTreeSet::from([Symbol::new("x")])
        );
    }
}
