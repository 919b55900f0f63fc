/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! `OFFSET` / `LIMIT`. A slice with neither is not compiled at all.

use miette::Result;

use crate::data::binding::BindingSet;
use crate::query::compile::EvalStep;
use crate::query::solutions::{close_child, pull_from, SolutionIter, Solutions};
use crate::runtime::evaluator::Poison;

pub(crate) enum SliceStep {
    Offset { arg: EvalStep, offset: usize },
    Limit { arg: EvalStep, limit: usize },
    OffsetLimit {
        arg: EvalStep,
        offset: usize,
        limit: usize,
    },
}

impl SliceStep {
    /// Hands the argument back when the slice selects everything
    pub(crate) fn new(
        arg: EvalStep,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Self, EvalStep> {
        match (offset.filter(|o| *o > 0), limit) {
            (None, None) => Err(arg),
            (Some(offset), None) => Ok(SliceStep::Offset { arg, offset }),
            (None, Some(limit)) => Ok(SliceStep::Limit { arg, limit }),
            (Some(offset), Some(limit)) => Ok(SliceStep::OffsetLimit { arg, offset, limit }),
        }
    }

    pub(crate) fn evaluate<'a>(
        &'a self,
        bindings: &BindingSet,
        poison: &Poison,
    ) -> Result<Solutions<'a>> {
        Ok(match self {
            SliceStep::Offset { arg, offset } => Solutions::new(OffsetIter {
                arg: Some(arg.evaluate(bindings, poison)?),
                to_skip: *offset,
                poison: poison.clone(),
            }),
            SliceStep::Limit { limit: 0, .. } | SliceStep::OffsetLimit { limit: 0, .. } => {
                Solutions::empty()
            }
            SliceStep::Limit { arg, limit } => Solutions::new(LimitIter {
                arg: Some(arg.evaluate(bindings, poison)?),
                remaining: *limit,
            }),
            SliceStep::OffsetLimit { arg, offset, limit } => Solutions::new(LimitIter {
                arg: Some(Solutions::new(OffsetIter {
                    arg: Some(arg.evaluate(bindings, poison)?),
                    to_skip: *offset,
                    poison: poison.clone(),
                })),
                remaining: *limit,
            }),
        })
    }

    pub(crate) fn slice_type(&self) -> &str {
        match self {
            SliceStep::Offset { .. } => "offset",
            SliceStep::Limit { .. } => "limit",
            SliceStep::OffsetLimit { .. } => "offset_limit",
        }
    }
}

struct OffsetIter<'a> {
    arg: Option<Solutions<'a>>,
    to_skip: usize,
    poison: Poison,
}

impl SolutionIter for OffsetIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        while self.to_skip > 0 {
            self.poison.check()?;
            self.to_skip -= 1;
            if pull_from(&mut self.arg)?.is_none() {
                return Ok(None);
            }
        }
        pull_from(&mut self.arg)
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
    }
}

struct LimitIter<'a> {
    arg: Option<Solutions<'a>>,
    remaining: usize,
}

impl SolutionIter for LimitIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        if self.remaining == 0 {
            // stop upstream work as soon as the limit is reached
            close_child(&mut self.arg);
            return Ok(None);
        }
        self.remaining -= 1;
        pull_from(&mut self.arg)
    }
    fn release(&mut self) {
        close_child(&mut self.arg);
    }
}
