/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::collections::BTreeSet;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

use itertools::Itertools;
use smallvec::SmallVec;

use crate::data::symb::Symbol;
use crate::data::value::Term;

/// A partial assignment of variables to terms.
///
/// Bindings keep their insertion order so that results are reproducible,
/// but equality and hashing ignore the order.
/// A variable is either bound to exactly one term or absent.
#[derive(Clone, Default)]
pub struct BindingSet {
    bindings: SmallVec<[(Symbol, Term); 8]>,
}

impl BindingSet {
    /// The empty binding set
    pub fn new() -> Self {
        Self::default()
    }
    /// A binding set with a single binding
    pub fn singleton(var: impl Into<Symbol>, val: impl Into<Term>) -> Self {
        let mut ret = Self::new();
        ret.bindings.push((var.into(), val.into()));
        ret
    }
    /// Number of bound variables
    pub fn len(&self) -> usize {
        self.bindings.len()
    }
    /// Whether no variable is bound
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
    /// The value bound to `var`, if any
    pub fn get(&self, var: &str) -> Option<&Term> {
        self.bindings
            .iter()
            .find(|(k, _)| k.name == var)
            .map(|(_, v)| v)
    }
    /// Whether `var` is bound
    pub fn contains(&self, var: &str) -> bool {
        self.bindings.iter().any(|(k, _)| k.name == var)
    }
    /// Binds `var` unless it is already bound. Returns whether the binding was added.
    pub fn insert(&mut self, var: impl Into<Symbol>, val: impl Into<Term>) -> bool {
        let var = var.into();
        if self.contains(&var) {
            false
        } else {
            self.bindings.push((var, val.into()));
            true
        }
    }
    /// Builder form of [Self::insert]
    pub fn with(mut self, var: impl Into<Symbol>, val: impl Into<Term>) -> Self {
        self.insert(var, val);
        self
    }
    /// Removes the binding for `var`, returning its value
    pub fn remove(&mut self, var: &str) -> Option<Term> {
        let pos = self.bindings.iter().position(|(k, _)| k.name == var)?;
        Some(self.bindings.remove(pos).1)
    }
    /// Iterates over bindings in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &Term)> {
        self.bindings.iter().map(|(k, v)| (k, v))
    }
    /// Names of all bound variables, in insertion order
    pub fn names(&self) -> impl Iterator<Item = &Symbol> {
        self.bindings.iter().map(|(k, _)| k)
    }
    pub(crate) fn name_set(&self) -> BTreeSet<Symbol> {
        self.names().cloned().collect()
    }

    /// Two binding sets are compatible if every shared variable is bound to the same term
    pub fn is_compatible(&self, other: &BindingSet) -> bool {
        self.bindings
            .iter()
            .all(|(k, v)| other.get(k).map_or(true, |o| o == v))
    }

    /// Whether the two sets bind at least one common variable
    pub fn shares_variable_with(&self, other: &BindingSet) -> bool {
        self.bindings.iter().any(|(k, _)| other.contains(k))
    }

    /// Whether every binding of `self` is present, with the same term, in `other`
    pub fn is_subset_of(&self, other: &BindingSet) -> bool {
        self.bindings
            .iter()
            .all(|(k, v)| other.get(k).map_or(false, |o| o == v))
    }

    /// Copies the bindings of `other` that are absent from `self`.
    /// Existing bindings of `self` are never overwritten.
    pub fn extend_missing(&mut self, other: &BindingSet) {
        for (k, v) in other.bindings.iter() {
            if !self.contains(k) {
                self.bindings.push((k.clone(), v.clone()));
            }
        }
    }

    /// The union of two compatible binding sets, or `None` on conflict
    pub fn merge(&self, other: &BindingSet) -> Option<BindingSet> {
        if !self.is_compatible(other) {
            return None;
        }
        let mut ret = self.clone();
        ret.extend_missing(other);
        Some(ret)
    }

    /// Keeps only the bindings of the given variables
    pub fn project<'a>(&self, vars: impl IntoIterator<Item = &'a Symbol>) -> BindingSet {
        let mut ret = BindingSet::new();
        for var in vars {
            if let Some(v) = self.get(var) {
                ret.bindings.push((var.clone(), v.clone()));
            }
        }
        ret
    }

    /// Returns a copy without the given variables
    pub fn without<'a>(&self, vars: impl IntoIterator<Item = &'a Symbol>) -> BindingSet {
        let mut ret = self.clone();
        for var in vars {
            ret.remove(var);
        }
        ret
    }

    fn sorted(&self) -> Vec<&(Symbol, Term)> {
        self.bindings.iter().sorted_by(|a, b| a.0.cmp(&b.0)).collect_vec()
    }
}

impl PartialEq for BindingSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.is_subset_of(other)
    }
}

impl Eq for BindingSet {}

impl Hash for BindingSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (k, v) in self.sorted() {
            k.hash(state);
            v.hash(state);
        }
    }
}

impl Debug for BindingSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut writer = f.debug_map();
        for (k, v) in self.bindings.iter() {
            writer.entry(k, v);
        }
        writer.finish()
    }
}

impl<K: Into<Symbol>, V: Into<Term>> FromIterator<(K, V)> for BindingSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut ret = BindingSet::new();
        for (k, v) in iter {
            ret.insert(k, v);
        }
        ret
    }
}
