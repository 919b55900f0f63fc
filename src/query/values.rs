/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use miette::Result;

use crate::data::binding::BindingSet;
use crate::query::solutions::{SolutionIter, Solutions};

/// `VALUES`: a constant table joined with the context
pub(crate) struct ValuesStep {
    pub(crate) rows: Vec<BindingSet>,
}

impl ValuesStep {
    pub(crate) fn evaluate<'a>(&'a self, bindings: &BindingSet) -> Result<Solutions<'a>> {
        let bindings = if bindings.is_empty() {
            None
        } else {
            Some(bindings.clone())
        };
        Ok(Solutions::new(ValuesIter {
            rows: self.rows.iter(),
            bindings,
        }))
    }
}

struct ValuesIter<'a> {
    rows: std::slice::Iter<'a, BindingSet>,
    bindings: Option<BindingSet>,
}

impl SolutionIter for ValuesIter<'_> {
    fn advance(&mut self) -> Result<Option<BindingSet>> {
        for candidate in self.rows.by_ref() {
            match &self.bindings {
                None => return Ok(Some(candidate.clone())),
                Some(bindings) => {
                    // a conflicting candidate contributes nothing for this context
                    if let Some(row) = bindings.merge(candidate) {
                        return Ok(Some(row));
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_never_overwrite_context() {
        let step = ValuesStep {
            rows: vec![
                BindingSet::singleton("x", 2),
                BindingSet::singleton("x", 1).with("y", 3),
                BindingSet::singleton("z", 4),
            ],
        };
        let all = step.evaluate(&BindingSet::new()).unwrap().into_vec().unwrap();
        assert_eq!(all, step.rows);

        let rows = step
            .evaluate(&BindingSet::singleton("x", 1))
            .unwrap()
            .into_vec()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                BindingSet::singleton("x", 1).with("y", 3),
                BindingSet::singleton("x", 1).with("z", 4),
            ]
        );
    }
}
