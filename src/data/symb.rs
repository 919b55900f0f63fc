/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::borrow::Borrow;
use std::fmt::{Debug, Display, Formatter};
use std::ops::Deref;

use serde_derive::{Deserialize, Serialize};
use smartstring::{LazyCompact, SmartString};

/// Name of a query variable, without the leading `?`
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct Symbol {
    pub(crate) name: SmartString<LazyCompact>,
}

impl Deref for Symbol {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.name
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.name
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "?{}", self.name)
    }
}

impl Debug for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "?{}", self.name)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

impl Symbol {
    /// Creates a variable name, a leading `?` or `$` is stripped
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        let name = name
            .strip_prefix('?')
            .or_else(|| name.strip_prefix('$'))
            .unwrap_or(name);
        Self { name: name.into() }
    }
}

/// Binding carrying the index of the originating row in a vectored SERVICE call
pub const ROW_INDEX_VAR: &str = "__rowIdx";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_sigils() {
        assert_eq!(Symbol::new("?x"), Symbol::new("x"));
        assert_eq!(Symbol::new("$x"), Symbol::new("x"));
        assert_eq!(Symbol::new("?x").to_string(), "?x");
    }
}
