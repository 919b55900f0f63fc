/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt::{Debug, Display, Formatter};

use miette::{Diagnostic, IntoDiagnostic, Result};
use regex::{Regex, RegexBuilder};
use thiserror::Error;

use crate::data::binding::BindingSet;
use crate::data::symb::Symbol;
use crate::data::value::{Num, Term};

/// Per-row failure of an expression.
///
/// Conditions turn these into `false`; they never abort a query on their own.
#[derive(Debug, Error, Diagnostic, Clone, PartialEq)]
pub enum EvalError {
    /// variable has no value in the current row
    #[error("The variable '{0}' is unbound")]
    #[diagnostic(code(eval::unbound))]
    Unbound(Symbol),
    /// operand of the wrong kind
    #[error("Cannot apply '{op}' to {args}")]
    #[diagnostic(code(eval::type_error))]
    TypeError {
        /// operator name
        op: &'static str,
        /// rendering of the offending operands
        args: String,
    },
    /// term without an effective boolean value
    #[error("Found {0:?} where a boolean value is expected")]
    #[diagnostic(code(eval::predicate_not_bool))]
    NoEffectiveBoolean(Term),
    /// integer division by zero
    #[error("Division by zero")]
    #[diagnostic(code(eval::div_by_zero))]
    DivisionByZero,
    /// arithmetic overflow
    #[error("Integer overflow in '{0}'")]
    #[diagnostic(code(eval::overflow))]
    Overflow(&'static str),
    /// `MIN`, `MAX` or `SAMPLE` of a group without values
    #[error("Aggregate '{0}' has no value to return")]
    #[diagnostic(code(eval::empty_aggregate))]
    EmptyAggregate(&'static str),
}

/// Comparison operators
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CmpOp {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
}

/// Arithmetic operators
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

/// Regex compiled once per query, compared by its source
#[derive(Clone)]
pub struct RegexWrapper(pub Regex);

impl PartialEq for RegexWrapper {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_str() == other.0.as_str()
    }
}

/// Scalar expression used by FILTER, BIND, ORDER BY and left join conditions
#[derive(Clone, PartialEq)]
pub enum Expr {
    /// value of a variable
    Binding(Symbol),
    /// constant term
    Const(Term),
    /// `BOUND(?v)`
    Bound(Symbol),
    /// `!e`
    Not(Box<Expr>),
    /// `a && b`
    And(Box<Expr>, Box<Expr>),
    /// `a || b`
    Or(Box<Expr>, Box<Expr>),
    /// comparison
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    /// arithmetic
    Arith(ArithOp, Box<Expr>, Box<Expr>),
    /// `sameTerm(a, b)`
    SameTerm(Box<Expr>, Box<Expr>),
    /// `IF(c, a, b)`
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `COALESCE(...)`
    Coalesce(Vec<Expr>),
    /// `isIRI(e)`
    IsIri(Box<Expr>),
    /// `isBlank(e)`
    IsBlank(Box<Expr>),
    /// `isLiteral(e)`
    IsLiteral(Box<Expr>),
    /// `STR(e)`
    Str(Box<Expr>),
    /// `REGEX(e, pattern, flags)` with a precompiled pattern
    Regex(Box<Expr>, RegexWrapper),
}

impl Debug for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Binding(v) => write!(f, "{v}"),
            Expr::Const(c) => write!(f, "{c}"),
            Expr::Bound(v) => write!(f, "bound({v})"),
            Expr::Not(e) => write!(f, "!{e}"),
            Expr::And(a, b) => write!(f, "({a} && {b})"),
            Expr::Or(a, b) => write!(f, "({a} || {b})"),
            Expr::Compare(op, a, b) => {
                let op = match op {
                    CmpOp::Eq => "=",
                    CmpOp::Ne => "!=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                };
                write!(f, "({a} {op} {b})")
            }
            Expr::Arith(op, a, b) => {
                let op = match op {
                    ArithOp::Add => "+",
                    ArithOp::Sub => "-",
                    ArithOp::Mul => "*",
                    ArithOp::Div => "/",
                };
                write!(f, "({a} {op} {b})")
            }
            Expr::SameTerm(a, b) => write!(f, "sameTerm({a}, {b})"),
            Expr::If(c, a, b) => write!(f, "if({c}, {a}, {b})"),
            Expr::Coalesce(args) => {
                let mut writer = f.debug_tuple("coalesce");
                for arg in args {
                    writer.field(arg);
                }
                writer.finish()
            }
            Expr::IsIri(e) => write!(f, "isIRI({e})"),
            Expr::IsBlank(e) => write!(f, "isBlank({e})"),
            Expr::IsLiteral(e) => write!(f, "isLiteral({e})"),
            Expr::Str(e) => write!(f, "str({e})"),
            Expr::Regex(e, r) => write!(f, "regex({e}, {:?})", r.0.as_str()),
        }
    }
}

impl Expr {
    /// `?var`
    pub fn var(name: &str) -> Self {
        Expr::Binding(Symbol::new(name))
    }
    /// constant
    pub fn val(term: impl Into<Term>) -> Self {
        Expr::Const(term.into())
    }
    /// comparison of two expressions
    pub fn cmp(op: CmpOp, left: Expr, right: Expr) -> Self {
        Expr::Compare(op, Box::new(left), Box::new(right))
    }
    /// arithmetic on two expressions
    pub fn arith(op: ArithOp, left: Expr, right: Expr) -> Self {
        Expr::Arith(op, Box::new(left), Box::new(right))
    }
    /// logical negation
    pub fn negate(self) -> Self {
        Expr::Not(Box::new(self))
    }
    /// Compiles the pattern of `REGEX`; a malformed pattern is a query error, not a row error
    pub fn regex(arg: Expr, pattern: &str, flags: &str) -> Result<Self> {
        let mut builder = RegexBuilder::new(pattern);
        for flag in flags.chars() {
            match flag {
                'i' => builder.case_insensitive(true),
                's' => builder.dot_matches_new_line(true),
                'm' => builder.multi_line(true),
                'x' => builder.ignore_whitespace(true),
                f => {
                    #[derive(Debug, Error, Diagnostic)]
                    #[error("Unsupported regex flag '{0}'")]
                    #[diagnostic(code(eval::bad_regex_flag))]
                    #[diagnostic(help("Supported flags are 'i', 's', 'm' and 'x'"))]
                    struct BadRegexFlag(char);

                    return Err(BadRegexFlag(f).into());
                }
            };
        }
        let re = builder.build().into_diagnostic()?;
        Ok(Expr::Regex(Box::new(arg), RegexWrapper(re)))
    }
    /// Conjunction of the given expressions, `None` if empty
    pub fn build_and(exprs: Vec<Expr>) -> Option<Self> {
        exprs
            .into_iter()
            .reduce(|acc, e| Expr::And(Box::new(acc), Box::new(e)))
    }
    /// Splits top-level `&&` into its conjuncts
    pub fn to_conjunction(&self) -> Vec<Expr> {
        match self {
            Expr::And(a, b) => {
                let mut ret = a.to_conjunction();
                ret.extend(b.to_conjunction());
                ret
            }
            e => vec![e.clone()],
        }
    }

    /// All variables mentioned in the expression
    pub fn bindings(&self) -> BTreeSet<Symbol> {
        let mut coll = BTreeSet::new();
        self.collect_bindings(&mut coll);
        coll
    }
    fn collect_bindings(&self, coll: &mut BTreeSet<Symbol>) {
        match self {
            Expr::Binding(v) | Expr::Bound(v) => {
                coll.insert(v.clone());
            }
            Expr::Const(_) => {}
            Expr::Not(e)
            | Expr::IsIri(e)
            | Expr::IsBlank(e)
            | Expr::IsLiteral(e)
            | Expr::Str(e)
            | Expr::Regex(e, _) => e.collect_bindings(coll),
            Expr::And(a, b)
            | Expr::Or(a, b)
            | Expr::Compare(_, a, b)
            | Expr::Arith(_, a, b)
            | Expr::SameTerm(a, b) => {
                a.collect_bindings(coll);
                b.collect_bindings(coll);
            }
            Expr::If(c, a, b) => {
                c.collect_bindings(coll);
                a.collect_bindings(coll);
                b.collect_bindings(coll);
            }
            Expr::Coalesce(args) => {
                for arg in args {
                    arg.collect_bindings(coll);
                }
            }
        }
    }

    /// Effective boolean value of the expression for one row
    pub fn test(&self, bindings: &BindingSet) -> std::result::Result<bool, EvalError> {
        effective_boolean_value(&self.eval(bindings)?)
    }

    /// Evaluates the expression against one row
    pub fn eval(&self, bindings: &BindingSet) -> std::result::Result<Term, EvalError> {
        match self {
            Expr::Binding(v) => bindings
                .get(v)
                .cloned()
                .ok_or_else(|| EvalError::Unbound(v.clone())),
            Expr::Const(c) => Ok(c.clone()),
            Expr::Bound(v) => Ok(Term::Bool(bindings.contains(v))),
            Expr::Not(e) => Ok(Term::Bool(!e.test(bindings)?)),
            // three-valued logic: an error on one side is absorbed by a decisive other side
            Expr::And(a, b) => match (a.test(bindings), b.test(bindings)) {
                (Ok(false), _) | (_, Ok(false)) => Ok(Term::Bool(false)),
                (Ok(true), Ok(true)) => Ok(Term::Bool(true)),
                (Err(e), _) | (_, Err(e)) => Err(e),
            },
            Expr::Or(a, b) => match (a.test(bindings), b.test(bindings)) {
                (Ok(true), _) | (_, Ok(true)) => Ok(Term::Bool(true)),
                (Ok(false), Ok(false)) => Ok(Term::Bool(false)),
                (Err(e), _) | (_, Err(e)) => Err(e),
            },
            Expr::Compare(op, a, b) => {
                let a = a.eval(bindings)?;
                let b = b.eval(bindings)?;
                compare(*op, &a, &b).map(Term::Bool)
            }
            Expr::Arith(op, a, b) => {
                let a = a.eval(bindings)?;
                let b = b.eval(bindings)?;
                arith(*op, &a, &b)
            }
            Expr::SameTerm(a, b) => Ok(Term::Bool(a.eval(bindings)? == b.eval(bindings)?)),
            Expr::If(c, a, b) => {
                if c.test(bindings)? {
                    a.eval(bindings)
                } else {
                    b.eval(bindings)
                }
            }
            Expr::Coalesce(args) => {
                let mut last_err = None;
                for arg in args {
                    match arg.eval(bindings) {
                        Ok(v) => return Ok(v),
                        Err(e) => last_err = Some(e),
                    }
                }
                Err(last_err.unwrap_or(EvalError::TypeError {
                    op: "coalesce",
                    args: "no arguments".to_string(),
                }))
            }
            Expr::IsIri(e) => Ok(Term::Bool(matches!(e.eval(bindings)?, Term::Iri(_)))),
            Expr::IsBlank(e) => Ok(Term::Bool(matches!(
                e.eval(bindings)?,
                Term::BlankNode(_)
            ))),
            Expr::IsLiteral(e) => Ok(Term::Bool(e.eval(bindings)?.is_literal())),
            Expr::Str(e) => match e.eval(bindings)? {
                Term::BlankNode(b) => Err(EvalError::TypeError {
                    op: "str",
                    args: format!("_:{b}"),
                }),
                Term::Bool(b) => Ok(Term::Str(b.to_string().into())),
                Term::Num(n) => Ok(Term::Str(n.to_string().into())),
                t => Ok(Term::Str(t.get_str().unwrap_or_default().into())),
            },
            Expr::Regex(e, re) => {
                let v = e.eval(bindings)?;
                match &v {
                    Term::Str(s) | Term::LangStr { value: s, .. } => {
                        Ok(Term::Bool(re.0.is_match(s)))
                    }
                    _ => Err(EvalError::TypeError {
                        op: "regex",
                        args: format!("{v:?}"),
                    }),
                }
            }
        }
    }
}

/// Coerces a term to its effective boolean value
pub fn effective_boolean_value(term: &Term) -> std::result::Result<bool, EvalError> {
    match term {
        Term::Bool(b) => Ok(*b),
        Term::Num(Num::Int(i)) => Ok(*i != 0),
        Term::Num(Num::Float(f)) => Ok(*f != 0. && !f.is_nan()),
        Term::Str(s) => Ok(!s.is_empty()),
        Term::LangStr { value, .. } => Ok(!value.is_empty()),
        t => Err(EvalError::NoEffectiveBoolean(t.clone())),
    }
}

fn compare(op: CmpOp, a: &Term, b: &Term) -> std::result::Result<bool, EvalError> {
    let ordering = match (a, b) {
        (Term::Num(l), Term::Num(r)) => l.value_cmp(r),
        (Term::Str(l), Term::Str(r)) => Some(l.cmp(r)),
        (Term::Bool(l), Term::Bool(r)) => Some(l.cmp(r)),
        (
            Term::LangStr {
                value: lv,
                lang: ll,
            },
            Term::LangStr {
                value: rv,
                lang: rl,
            },
        ) if ll == rl => Some(lv.cmp(rv)),
        _ => {
            // outside of comparable literals only (in)equality is defined
            return match op {
                CmpOp::Eq if a == b => Ok(true),
                CmpOp::Ne if a == b => Ok(false),
                CmpOp::Eq | CmpOp::Ne if !a.is_literal() || !b.is_literal() => {
                    Ok(op == CmpOp::Ne)
                }
                _ => Err(EvalError::TypeError {
                    op: "compare",
                    args: format!("{a:?} and {b:?}"),
                }),
            };
        }
    };
    Ok(match ordering {
        // NaN compares false with everything
        None => op == CmpOp::Ne,
        Some(o) => match op {
            CmpOp::Eq => o == Ordering::Equal,
            CmpOp::Ne => o != Ordering::Equal,
            CmpOp::Lt => o == Ordering::Less,
            CmpOp::Le => o != Ordering::Greater,
            CmpOp::Gt => o == Ordering::Greater,
            CmpOp::Ge => o != Ordering::Less,
        },
    })
}

pub(crate) fn arith(op: ArithOp, a: &Term, b: &Term) -> std::result::Result<Term, EvalError> {
    let (l, r) = match (a.get_num(), b.get_num()) {
        (Some(l), Some(r)) => (l, r),
        _ => {
            return Err(EvalError::TypeError {
                op: "arithmetic",
                args: format!("{a:?} and {b:?}"),
            })
        }
    };
    let ret = match (op, l, r) {
        (ArithOp::Add, Num::Int(l), Num::Int(r)) => {
            Num::Int(l.checked_add(r).ok_or(EvalError::Overflow("+"))?)
        }
        (ArithOp::Sub, Num::Int(l), Num::Int(r)) => {
            Num::Int(l.checked_sub(r).ok_or(EvalError::Overflow("-"))?)
        }
        (ArithOp::Mul, Num::Int(l), Num::Int(r)) => {
            Num::Int(l.checked_mul(r).ok_or(EvalError::Overflow("*"))?)
        }
        (ArithOp::Div, _, Num::Int(0)) => return Err(EvalError::DivisionByZero),
        (ArithOp::Add, l, r) => Num::Float(l.get_float() + r.get_float()),
        (ArithOp::Sub, l, r) => Num::Float(l.get_float() - r.get_float()),
        (ArithOp::Mul, l, r) => Num::Float(l.get_float() * r.get_float()),
        (ArithOp::Div, l, r) => Num::Float(l.get_float() / r.get_float()),
    };
    Ok(Term::Num(ret))
}
