/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Aggregate functions of `GROUP BY`.

use std::collections::{BTreeSet, HashSet};
use std::fmt::{Debug, Display, Formatter};

use crate::data::binding::BindingSet;
use crate::data::expr::{arith, ArithOp, EvalError, Expr};
use crate::data::symb::Symbol;
use crate::data::value::{Num, Term};

type EvalResult<T> = std::result::Result<T, EvalError>;

/// Supported aggregate functions
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AggrOp {
    /// `COUNT`
    Count,
    /// `SUM`
    Sum,
    /// `MIN`
    Min,
    /// `MAX`
    Max,
    /// `AVG`
    Avg,
    /// `SAMPLE`
    Sample,
}

impl AggrOp {
    fn name(&self) -> &'static str {
        match self {
            AggrOp::Count => "count",
            AggrOp::Sum => "sum",
            AggrOp::Min => "min",
            AggrOp::Max => "max",
            AggrOp::Avg => "avg",
            AggrOp::Sample => "sample",
        }
    }
}

/// One aggregate of a group, e.g. `COUNT(DISTINCT ?x)`
#[derive(Clone, PartialEq)]
pub struct Aggregate {
    /// the function
    pub op: AggrOp,
    /// argument, `None` for `COUNT(*)`
    pub arg: Option<Expr>,
    /// whether duplicate arguments are fed only once
    pub distinct: bool,
}

impl Debug for Aggregate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

impl Display for Aggregate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let distinct = if self.distinct { "distinct " } else { "" };
        match &self.arg {
            None => write!(f, "{}({}*)", self.op.name(), distinct),
            Some(arg) => write!(f, "{}({}{})", self.op.name(), distinct, arg),
        }
    }
}

impl Aggregate {
    /// Aggregate over an expression
    pub fn new(op: AggrOp, arg: Expr) -> Self {
        Self {
            op,
            arg: Some(arg),
            distinct: false,
        }
    }
    /// `COUNT(*)`
    pub fn count_rows() -> Self {
        Self {
            op: AggrOp::Count,
            arg: None,
            distinct: false,
        }
    }
    /// The same aggregate over distinct arguments only
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub(crate) fn bindings(&self) -> BTreeSet<Symbol> {
        self.arg.as_ref().map(|a| a.bindings()).unwrap_or_default()
    }

    /// Fresh per-group state
    pub(crate) fn start(&self) -> AggrState {
        let obj: Box<dyn AggrObj> = match self.op {
            AggrOp::Count => Box::<AggrCount>::default(),
            AggrOp::Sum => Box::<AggrSum>::default(),
            AggrOp::Min => Box::new(AggrMinMax {
                max: false,
                found: None,
            }),
            AggrOp::Max => Box::new(AggrMinMax {
                max: true,
                found: None,
            }),
            AggrOp::Avg => Box::<AggrAvg>::default(),
            AggrOp::Sample => Box::<AggrSample>::default(),
        };
        AggrState {
            obj,
            seen_values: HashSet::new(),
            seen_rows: HashSet::new(),
            failed: None,
        }
    }
}

pub(crate) trait AggrObj: Send {
    fn set(&mut self, value: &Term) -> EvalResult<()>;
    fn get(&self) -> EvalResult<Term>;
}

/// State of one aggregate within one group
pub(crate) struct AggrState {
    obj: Box<dyn AggrObj>,
    seen_values: HashSet<Term>,
    seen_rows: HashSet<BindingSet>,
    /// a failed `set` poisons the aggregate for the whole group
    failed: Option<EvalError>,
}

impl AggrState {
    /// Feeds one row of the group. Rows where the argument errors are skipped.
    pub(crate) fn feed(&mut self, aggr: &Aggregate, row: &BindingSet) {
        if self.failed.is_some() {
            return;
        }
        let value = match &aggr.arg {
            None => {
                if aggr.distinct && !self.seen_rows.insert(row.clone()) {
                    return;
                }
                Term::Bool(true)
            }
            Some(arg) => match arg.eval(row) {
                Ok(v) => v,
                Err(_) => return,
            },
        };
        if aggr.arg.is_some() && aggr.distinct && !self.seen_values.insert(value.clone()) {
            return;
        }
        if let Err(err) = self.obj.set(&value) {
            self.failed = Some(err);
        }
    }

    pub(crate) fn result(&self) -> EvalResult<Term> {
        match &self.failed {
            Some(err) => Err(err.clone()),
            None => self.obj.get(),
        }
    }
}

#[derive(Default)]
struct AggrCount {
    count: i64,
}

impl AggrObj for AggrCount {
    fn set(&mut self, _value: &Term) -> EvalResult<()> {
        self.count += 1;
        Ok(())
    }
    fn get(&self) -> EvalResult<Term> {
        Ok(Term::from(self.count))
    }
}

fn numeric(op: &'static str, value: &Term) -> EvalResult<()> {
    match value {
        Term::Num(_) => Ok(()),
        v => Err(EvalError::TypeError {
            op,
            args: format!("{v:?}"),
        }),
    }
}

struct AggrSum {
    sum: Term,
}

impl Default for AggrSum {
    fn default() -> Self {
        Self {
            sum: Term::Num(Num::Int(0)),
        }
    }
}

impl AggrObj for AggrSum {
    fn set(&mut self, value: &Term) -> EvalResult<()> {
        numeric("sum", value)?;
        self.sum = arith(ArithOp::Add, &self.sum, value)?;
        Ok(())
    }
    fn get(&self) -> EvalResult<Term> {
        Ok(self.sum.clone())
    }
}

struct AggrAvg {
    sum: Term,
    count: i64,
}

impl Default for AggrAvg {
    fn default() -> Self {
        Self {
            sum: Term::Num(Num::Int(0)),
            count: 0,
        }
    }
}

impl AggrObj for AggrAvg {
    fn set(&mut self, value: &Term) -> EvalResult<()> {
        numeric("avg", value)?;
        self.sum = arith(ArithOp::Add, &self.sum, value)?;
        self.count += 1;
        Ok(())
    }
    fn get(&self) -> EvalResult<Term> {
        if self.count == 0 {
            return Ok(Term::from(0));
        }
        arith(ArithOp::Div, &self.sum, &Term::Num(Num::Float(self.count as f64)))
    }
}

/// `MIN` and `MAX` use the `ORDER BY` order, so they accept any term
struct AggrMinMax {
    max: bool,
    found: Option<Term>,
}

impl AggrObj for AggrMinMax {
    fn set(&mut self, value: &Term) -> EvalResult<()> {
        let replace = match &self.found {
            None => true,
            Some(found) => {
                let o = value.order_cmp(found);
                if self.max {
                    o.is_gt()
                } else {
                    o.is_lt()
                }
            }
        };
        if replace {
            self.found = Some(value.clone());
        }
        Ok(())
    }
    fn get(&self) -> EvalResult<Term> {
        let name = if self.max { "max" } else { "min" };
        self.found.clone().ok_or(EvalError::EmptyAggregate(name))
    }
}

#[derive(Default)]
struct AggrSample {
    found: Option<Term>,
}

impl AggrObj for AggrSample {
    fn set(&mut self, value: &Term) -> EvalResult<()> {
        if self.found.is_none() {
            self.found = Some(value.clone());
        }
        Ok(())
    }
    fn get(&self) -> EvalResult<Term> {
        self.found
            .clone()
            .ok_or(EvalError::EmptyAggregate("sample"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(aggr: &Aggregate, rows: &[BindingSet]) -> EvalResult<Term> {
        let mut state = aggr.start();
        for row in rows {
            state.feed(aggr, row);
        }
        state.result()
    }

    fn xs(vals: &[i64]) -> Vec<BindingSet> {
        vals.iter().map(|v| BindingSet::singleton("x", *v)).collect()
    }

    #[test]
    fn numeric_aggregates() {
        let rows = xs(&[3, 1, 3, 2]);
        let x = || Expr::var("x");
        assert_eq!(run(&Aggregate::new(AggrOp::Count, x()), &rows), Ok(Term::from(4)));
        assert_eq!(
            run(&Aggregate::new(AggrOp::Count, x()).distinct(), &rows),
            Ok(Term::from(3))
        );
        assert_eq!(run(&Aggregate::new(AggrOp::Sum, x()), &rows), Ok(Term::from(9)));
        assert_eq!(run(&Aggregate::new(AggrOp::Min, x()), &rows), Ok(Term::from(1)));
        assert_eq!(run(&Aggregate::new(AggrOp::Max, x()), &rows), Ok(Term::from(3)));
        assert_eq!(run(&Aggregate::new(AggrOp::Avg, x()), &rows), Ok(Term::from(2.25)));
        assert_eq!(run(&Aggregate::new(AggrOp::Sample, x()), &rows), Ok(Term::from(3)));
    }

    #[test]
    fn empty_and_failing_groups() {
        let x = || Expr::var("x");
        assert_eq!(run(&Aggregate::count_rows(), &[]), Ok(Term::from(0)));
        assert_eq!(run(&Aggregate::new(AggrOp::Sum, x()), &[]), Ok(Term::from(0)));
        assert_eq!(
            run(&Aggregate::new(AggrOp::Max, x()), &[]),
            Err(EvalError::EmptyAggregate("max"))
        );

        // unbound arguments are skipped, a non-number spoils the sum
        let mut rows = xs(&[1, 2]);
        rows.push(BindingSet::singleton("y", 0));
        assert_eq!(run(&Aggregate::new(AggrOp::Count, x()), &rows), Ok(Term::from(2)));
        assert_eq!(run(&Aggregate::count_rows(), &rows), Ok(Term::from(3)));
        rows.push(BindingSet::singleton("x", "text"));
        assert!(run(&Aggregate::new(AggrOp::Sum, x()), &rows).is_err());
        assert_eq!(run(&Aggregate::new(AggrOp::Max, x()), &rows), Ok(Term::from("text")));
    }
}
