/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub(crate) mod algebra;
pub(crate) mod compile;
pub(crate) mod filter;
pub(crate) mod group;
pub(crate) mod join;
pub(crate) mod left_join;
pub(crate) mod pattern;
pub(crate) mod project;
pub(crate) mod service;
pub(crate) mod set_ops;
pub(crate) mod slice;
pub(crate) mod solutions;
pub(crate) mod sort;
pub(crate) mod values;
