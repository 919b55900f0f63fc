/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::cmp::Ordering;
use std::fmt::{Debug, Display, Formatter};
use std::hash::{Hash, Hasher};

use ordered_float::OrderedFloat;
use smartstring::{LazyCompact, SmartString};

pub(crate) const XSD_STRING: &str = "http://www.w3.org/2001/XMLSchema#string";

/// An RDF term bound to a variable.
///
/// The variant order is the SPARQL `ORDER BY` order: blank nodes sort before IRIs,
/// which sort before literals.
#[derive(
    Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde_derive::Deserialize, serde_derive::Serialize,
)]
pub enum Term {
    /// blank node label
    BlankNode(SmartString<LazyCompact>),
    /// IRI
    Iri(SmartString<LazyCompact>),
    /// `xsd:boolean` literal
    Bool(bool),
    /// numeric literal, may be int or float
    Num(Num),
    /// simple literal
    Str(SmartString<LazyCompact>),
    /// language tagged literal
    LangStr {
        /// lexical form
        value: SmartString<LazyCompact>,
        /// language tag, lower case
        lang: SmartString<LazyCompact>,
    },
    /// literal of a datatype without native representation
    Typed {
        /// lexical form
        value: SmartString<LazyCompact>,
        /// datatype IRI
        datatype: SmartString<LazyCompact>,
    },
}

impl Term {
    /// `ORDER BY` comparison: numbers by value, everything else by variant order
    pub(crate) fn order_cmp(&self, other: &Term) -> Ordering {
        match (self, other) {
            (Term::Num(l), Term::Num(r)) => l.value_cmp(r).unwrap_or_else(|| l.cmp(r)),
            _ => self.cmp(other),
        }
    }
    /// Creates an IRI term
    pub fn iri(iri: impl Into<SmartString<LazyCompact>>) -> Self {
        Term::Iri(iri.into())
    }
    /// Creates a blank node
    pub fn blank(label: impl Into<SmartString<LazyCompact>>) -> Self {
        Term::BlankNode(label.into())
    }
    /// Creates a language tagged literal
    pub fn lang_str(
        value: impl Into<SmartString<LazyCompact>>,
        lang: impl AsRef<str>,
    ) -> Self {
        Term::LangStr {
            value: value.into(),
            lang: lang.as_ref().to_lowercase().into(),
        }
    }
    /// Creates a typed literal, `xsd:string` collapses into a simple literal
    pub fn typed(
        value: impl Into<SmartString<LazyCompact>>,
        datatype: impl Into<SmartString<LazyCompact>>,
    ) -> Self {
        let datatype = datatype.into();
        if datatype == XSD_STRING {
            Term::Str(value.into())
        } else {
            Term::Typed {
                value: value.into(),
                datatype,
            }
        }
    }
    pub(crate) fn get_bool(&self) -> Option<bool> {
        match self {
            Term::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub(crate) fn get_num(&self) -> Option<Num> {
        match self {
            Term::Num(n) => Some(*n),
            _ => None,
        }
    }
    /// Lexical form for literals, the IRI string for IRIs
    pub(crate) fn get_str(&self) -> Option<&str> {
        match self {
            Term::Str(s) | Term::Iri(s) => Some(s),
            Term::LangStr { value, .. } | Term::Typed { value, .. } => Some(value),
            _ => None,
        }
    }
    pub(crate) fn is_literal(&self) -> bool {
        !matches!(self, Term::Iri(_) | Term::BlankNode(_))
    }
}

impl From<bool> for Term {
    fn from(value: bool) -> Self {
        Term::Bool(value)
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Num(Num::Int(value))
    }
}

impl From<i32> for Term {
    fn from(value: i32) -> Self {
        Term::Num(Num::Int(value as i64))
    }
}

impl From<usize> for Term {
    fn from(value: usize) -> Self {
        Term::Num(Num::Int(value as i64))
    }
}

impl From<f64> for Term {
    fn from(value: f64) -> Self {
        Term::Num(Num::Float(value))
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::Str(value.into())
    }
}

impl Display for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Term::BlankNode(b) => write!(f, "_:{b}"),
            Term::Iri(i) => write!(f, "<{i}>"),
            Term::Bool(b) => write!(f, "{b}"),
            Term::Num(n) => write!(f, "{n}"),
            Term::Str(s) => write!(f, "{s:?}"),
            Term::LangStr { value, lang } => write!(f, "{value:?}@{lang}"),
            Term::Typed { value, datatype } => write!(f, "{value:?}^^<{datatype}>"),
        }
    }
}

impl Debug for Term {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Representing a number
#[derive(Copy, Clone, serde_derive::Deserialize, serde_derive::Serialize)]
pub enum Num {
    /// integer number
    Int(i64),
    /// float number
    Float(f64),
}

impl Hash for Num {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Num::Int(i) => i.hash(state),
            Num::Float(f) => OrderedFloat(*f).hash(state),
        }
    }
}

impl Num {
    pub(crate) fn get_float(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Float(f) => *f,
        }
    }
    /// Numeric comparison across int and float, as used by SPARQL operators
    pub(crate) fn value_cmp(&self, other: &Num) -> Option<Ordering> {
        match (self, other) {
            (Num::Int(l), Num::Int(r)) => Some(l.cmp(r)),
            (l, r) => l.get_float().partial_cmp(&r.get_float()),
        }
    }
}

impl PartialEq for Num {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Num {}

impl Display for Num {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Num::Int(i) => write!(f, "{i}"),
            Num::Float(n) => {
                if n.is_nan() {
                    write!(f, "NaN")
                } else if n.is_infinite() {
                    if n.is_sign_negative() {
                        write!(f, "-INF")
                    } else {
                        write!(f, "INF")
                    }
                } else {
                    write!(f, "{n:?}")
                }
            }
        }
    }
}

impl Debug for Num {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl PartialOrd for Num {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Num {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Num::Int(i), Num::Float(r)) => {
                let l = *i as f64;
                match l.total_cmp(r) {
                    Ordering::Less => Ordering::Less,
                    Ordering::Equal => Ordering::Less,
                    Ordering::Greater => Ordering::Greater,
                }
            }
            (Num::Float(l), Num::Int(i)) => {
                let r = *i as f64;
                match l.total_cmp(&r) {
                    Ordering::Less => Ordering::Less,
                    Ordering::Equal => Ordering::Greater,
                    Ordering::Greater => Ordering::Greater,
                }
            }
            (Num::Int(l), Num::Int(r)) => l.cmp(r),
            (Num::Float(l), Num::Float(r)) => l.total_cmp(r),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_identity_is_not_numeric_equality() {
        assert_ne!(Term::from(1), Term::from(1.0));
        assert_eq!(
            Num::Int(1).value_cmp(&Num::Float(1.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(Term::typed("abc", XSD_STRING), Term::from("abc"));
    }

    #[test]
    fn sparql_term_order() {
        let mut terms = vec![
            Term::from("lit"),
            Term::iri("http://example.org/a"),
            Term::blank("b0"),
        ];
        terms.sort();
        assert_eq!(
            terms,
            vec![
                Term::blank("b0"),
                Term::iri("http://example.org/a"),
                Term::from("lit")
            ]
        );
    }
}
