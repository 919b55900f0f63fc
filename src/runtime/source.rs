/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! The storage collaborator: anything that can answer quad lookups.

use std::sync::RwLock;

use miette::{miette, Result};

use crate::data::value::Term;

/// A stored fact
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Statement {
    /// subject
    pub subject: Term,
    /// predicate
    pub predicate: Term,
    /// object
    pub object: Term,
    /// named graph, `None` for the default graph
    pub graph: Option<Term>,
}

impl Statement {
    /// A statement in the default graph
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
            graph: None,
        }
    }
    /// Moves the statement into a named graph
    pub fn in_graph(mut self, graph: Term) -> Self {
        self.graph = Some(graph);
        self
    }
}

/// Which graphs a lookup is restricted to
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GraphScope<'a> {
    /// the default graph only
    Default,
    /// any named graph
    AnyNamed,
    /// one named graph
    Named(&'a Term),
}

impl GraphScope<'_> {
    pub(crate) fn matches(&self, graph: &Option<Term>) -> bool {
        match (self, graph) {
            (GraphScope::Default, None) => true,
            (GraphScope::AnyNamed, Some(_)) => true,
            (GraphScope::Named(g), Some(h)) => *g == h,
            _ => false,
        }
    }
}

/// Stream of statements. Dropping it releases the underlying cursor.
///
/// Sources may produce matches lazily or copy them out up front, as [MemTripleSource] does.
pub type StatementIter<'a> = Box<dyn Iterator<Item = Result<Statement>> + 'a>;

/// Storage collaborator answering statement lookups
pub trait TripleSource: Send + Sync {
    /// Statements matching the given constants, `None` positions are wildcards
    fn statements<'a>(
        &'a self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        graph: GraphScope<'_>,
    ) -> Result<StatementIter<'a>>;
}

/// A triple source holding all statements in memory
#[derive(Default)]
pub struct MemTripleSource {
    statements: RwLock<Vec<Statement>>,
}

impl MemTripleSource {
    /// Creates a store from the given statements
    pub fn new(statements: impl IntoIterator<Item = Statement>) -> Self {
        Self {
            statements: RwLock::new(statements.into_iter().collect()),
        }
    }
    /// Adds a statement, returns false if it was already present
    pub fn insert(&self, statement: Statement) -> Result<bool> {
        let mut store = self
            .statements
            .write()
            .map_err(|_| miette!("triple store lock poisoned"))?;
        if store.contains(&statement) {
            return Ok(false);
        }
        store.push(statement);
        Ok(true)
    }
    /// Number of statements held
    pub fn len(&self) -> usize {
        self.statements.read().map(|s| s.len()).unwrap_or(0)
    }
    /// Whether the store holds no statements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TripleSource for MemTripleSource {
    fn statements<'a>(
        &'a self,
        subject: Option<&Term>,
        predicate: Option<&Term>,
        object: Option<&Term>,
        graph: GraphScope<'_>,
    ) -> Result<StatementIter<'a>> {
        // matches are copied out, open cursors hold no lock
        let store = self
            .statements
            .read()
            .map_err(|_| miette!("triple store lock poisoned"))?;
        let matched: Vec<_> = store
            .iter()
            .filter(|st| {
                subject.map_or(true, |s| *s == st.subject)
                    && predicate.map_or(true, |p| *p == st.predicate)
                    && object.map_or(true, |o| *o == st.object)
                    && graph.matches(&st.graph)
            })
            .cloned()
            .collect();
        Ok(Box::new(matched.into_iter().map(Ok)))
    }
}
