/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! Lazy, forward-only, closeable sequences of solutions.
//!
//! Every operator produces a [Solutions] and consumes the [Solutions] of its
//! children. Operators only implement [SolutionIter]; the wrapper enforces the
//! life cycle:
//!
//! * `Ok(None)` is reported exactly once, at exhaustion, and the operator's
//!   resources are released at that moment;
//! * an error releases the operator's resources before it is returned;
//! * [Solutions::close] is idempotent and is also run on drop, so abandoning a
//!   sequence early (a satisfied LIMIT, a killed query, a panic) releases every
//!   upstream sequence exactly once;
//! * polling a sequence again after it has reported its end or been closed is
//!   a contract violation and panics.

use std::mem;

use miette::Result;

use crate::data::binding::BindingSet;

/// Producer side of a solution sequence.
pub trait SolutionIter {
    /// Produces the next solution, `Ok(None)` at the end.
    /// Never called again after it returned `Ok(None)` or an error.
    fn advance(&mut self) -> Result<Option<BindingSet>>;
    /// Releases owned upstream sequences and other resources.
    /// Called at most once, after the last `advance`.
    fn release(&mut self) {}
}

enum CursorState {
    Open,
    Peeked(BindingSet),
    /// the end was seen by `peek` but not yet reported by `next`
    Drained,
    Exhausted,
    Closed,
}

/// A single-owner cursor over the solutions of an operator
pub struct Solutions<'a> {
    inner: Box<dyn SolutionIter + 'a>,
    state: CursorState,
}

const POLLED_AFTER_END: &str = "solution sequence polled after it was exhausted or closed";

impl<'a> Solutions<'a> {
    /// Wraps an operator
    pub fn new(inner: impl SolutionIter + 'a) -> Self {
        Self {
            inner: Box::new(inner),
            state: CursorState::Open,
        }
    }
    /// A sequence without solutions
    pub fn empty() -> Self {
        Self::new(EmptyIter)
    }
    /// A sequence with exactly one solution
    pub fn singleton(bindings: BindingSet) -> Self {
        Self::from_vec(vec![bindings])
    }
    /// A sequence over already materialized solutions
    pub fn from_vec(rows: Vec<BindingSet>) -> Self {
        Self::new(VecIter {
            rows: rows.into_iter(),
        })
    }
    /// Adapts a plain iterator of results
    pub fn from_results(it: impl Iterator<Item = Result<BindingSet>> + 'a) -> Self {
        Self::new(ResultIter(it))
    }

    /// Pulls the next solution
    pub fn try_next(&mut self) -> Result<Option<BindingSet>> {
        match mem::replace(&mut self.state, CursorState::Open) {
            CursorState::Open => match self.inner.advance() {
                Ok(Some(row)) => Ok(Some(row)),
                Ok(None) => {
                    self.inner.release();
                    self.state = CursorState::Exhausted;
                    Ok(None)
                }
                Err(err) => {
                    self.inner.release();
                    self.state = CursorState::Closed;
                    Err(err)
                }
            },
            CursorState::Peeked(row) => Ok(Some(row)),
            CursorState::Drained => {
                self.state = CursorState::Exhausted;
                Ok(None)
            }
            s @ (CursorState::Exhausted | CursorState::Closed) => {
                self.state = s;
                panic!("{}", POLLED_AFTER_END)
            }
        }
    }

    /// Looks at the next solution without consuming it
    pub fn peek(&mut self) -> Result<Option<&BindingSet>> {
        if let CursorState::Open = self.state {
            match self.inner.advance() {
                Ok(Some(row)) => self.state = CursorState::Peeked(row),
                Ok(None) => {
                    self.inner.release();
                    self.state = CursorState::Drained;
                }
                Err(err) => {
                    self.inner.release();
                    self.state = CursorState::Closed;
                    return Err(err);
                }
            }
        }
        match &self.state {
            CursorState::Peeked(row) => Ok(Some(row)),
            CursorState::Drained => Ok(None),
            _ => panic!("{}", POLLED_AFTER_END),
        }
    }

    /// Whether another solution is available, without consuming it
    pub fn has_next(&mut self) -> Result<bool> {
        Ok(self.peek()?.is_some())
    }

    /// Releases all resources held by this sequence and its upstream sequences.
    /// Safe to call any number of times.
    pub fn close(&mut self) {
        match mem::replace(&mut self.state, CursorState::Closed) {
            CursorState::Open | CursorState::Peeked(_) => self.inner.release(),
            CursorState::Drained | CursorState::Exhausted | CursorState::Closed => {}
        }
    }

    /// Whether the sequence was closed, either explicitly or by a failure
    pub fn is_closed(&self) -> bool {
        matches!(self.state, CursorState::Closed)
    }

    /// Drains the sequence into a vector
    pub fn into_vec(mut self) -> Result<Vec<BindingSet>> {
        let mut ret = vec![];
        while let Some(row) = self.try_next()? {
            ret.push(row);
        }
        Ok(ret)
    }
}

impl Drop for Solutions<'_> {
    fn drop(&mut self) {
        self.close()
    }
}

impl Iterator for Solutions<'_> {
    type Item = Result<BindingSet>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

struct EmptyIter;

impl SolutionIter for EmptyIter {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        Ok(None)
    }
}

struct VecIter {
    rows: std::vec::IntoIter<BindingSet>,
}

impl SolutionIter for VecIter {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        Ok(self.rows.next())
    }
}

struct ResultIter<I>(I);

impl<I: Iterator<Item = Result<BindingSet>>> SolutionIter for ResultIter<I> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        self.0.next().transpose()
    }
}

/// Pulls from an optional child, dropping it once it is exhausted
pub(crate) fn pull_from(child: &mut Option<Solutions<'_>>) -> Result<Option<BindingSet>> {
    let row = match child {
        None => return Ok(None),
        Some(it) => it.try_next()?,
    };
    if row.is_none() {
        *child = None;
    }
    Ok(row)
}

/// Closes an optional child exactly once
pub(crate) fn close_child(child: &mut Option<Solutions<'_>>) {
    if let Some(mut it) = child.take() {
        it.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use miette::miette;

    use super::*;

    /// Counts how many sequences are currently open and how many were ever released
    #[derive(Default, Clone)]
    pub(crate) struct OpenCounter {
        pub(crate) open: Arc<AtomicUsize>,
        pub(crate) released: Arc<AtomicUsize>,
    }

    impl OpenCounter {
        pub(crate) fn open(&self) -> usize {
            self.open.load(Ordering::SeqCst)
        }
        pub(crate) fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
        pub(crate) fn track<'a>(&self, rows: Vec<BindingSet>) -> Solutions<'a> {
            self.open.fetch_add(1, Ordering::SeqCst);
            Solutions::new(Tracked {
                rows: rows.into_iter(),
                counter: self.clone(),
                fail_at: None,
            })
        }
        pub(crate) fn track_failing<'a>(
            &self,
            rows: Vec<BindingSet>,
            fail_at: usize,
        ) -> Solutions<'a> {
            self.open.fetch_add(1, Ordering::SeqCst);
            Solutions::new(Tracked {
                rows: rows.into_iter(),
                counter: self.clone(),
                fail_at: Some(fail_at),
            })
        }
    }

    struct Tracked {
        rows: std::vec::IntoIter<BindingSet>,
        counter: OpenCounter,
        fail_at: Option<usize>,
    }

    impl SolutionIter for Tracked {
        fn advance(&mut self) -> Result<Option<BindingSet>> {
            if let Some(n) = &mut self.fail_at {
                if *n == 0 {
                    return Err(miette!("source failure"));
                }
                *n -= 1;
            }
            Ok(self.rows.next())
        }
        fn release(&mut self) {
            self.counter.open.fetch_sub(1, Ordering::SeqCst);
            self.counter.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn rows(n: i64) -> Vec<BindingSet> {
        (0..n).map(|i| BindingSet::singleton("x", i)).collect()
    }

    #[test]
    fn end_reported_once_and_released() {
        let counter = OpenCounter::default();
        let mut it = counter.track(rows(2));
        assert!(it.try_next().unwrap().is_some());
        assert!(it.try_next().unwrap().is_some());
        assert_eq!(counter.open(), 1);
        assert!(it.try_next().unwrap().is_none());
        assert_eq!(counter.open(), 0);
        it.close();
        it.close();
        drop(it);
        assert_eq!(counter.released(), 1);
    }

    #[test]
    #[should_panic(expected = "polled after it was exhausted or closed")]
    fn polling_after_end_panics() {
        let mut it = Solutions::from_vec(rows(1));
        while it.try_next().unwrap().is_some() {}
        let _ = it.try_next();
    }

    #[test]
    #[should_panic(expected = "polled after it was exhausted or closed")]
    fn polling_after_close_panics() {
        let mut it = Solutions::from_vec(rows(3));
        it.close();
        let _ = it.try_next();
    }

    #[test]
    fn peek_does_not_consume() {
        let counter = OpenCounter::default();
        let mut it = counter.track(rows(1));
        assert_eq!(it.peek().unwrap(), Some(&BindingSet::singleton("x", 0)));
        assert!(it.has_next().unwrap());
        assert_eq!(it.try_next().unwrap(), Some(BindingSet::singleton("x", 0)));
        assert!(!it.has_next().unwrap());
        // the end was observed by peek, resources are already released
        assert_eq!(counter.open(), 0);
        assert_eq!(it.try_next().unwrap(), None);
        assert_eq!(counter.released(), 1);
    }

    #[test]
    fn drop_releases_abandoned_sequence() {
        let counter = OpenCounter::default();
        {
            let mut it = counter.track(rows(10));
            it.try_next().unwrap();
        }
        assert_eq!(counter.open(), 0);
        assert_eq!(counter.released(), 1);
    }

    #[test]
    fn failure_releases_and_closes() {
        let counter = OpenCounter::default();
        let mut it = counter.track_failing(rows(10), 1);
        assert!(it.try_next().unwrap().is_some());
        assert!(it.try_next().is_err());
        assert!(it.is_closed());
        assert_eq!(counter.open(), 0);
        drop(it);
        assert_eq!(counter.released(), 1);
    }
}
