/*
 * Copyright 2022, The Cozo Project Authors.
 *
 * This Source Code Form is subject to the terms of the Mozilla Public License, v. 2.0.
 * If a copy of the MPL was not distributed with this file,
 * You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use miette::{bail, Diagnostic, IntoDiagnostic, Result};
use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Tunables of the evaluator, given as a JSON object
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct EvalOptions {
    /// Number of left rows shipped to a SERVICE in one vectored call
    pub service_batch_size: usize,
    /// Seconds after which a running query is killed
    pub timeout: Option<f64>,
    /// Count the rows produced by every compiled step
    pub track_result_size: bool,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self {
            service_batch_size: 15,
            timeout: None,
            track_result_size: false,
        }
    }
}

impl EvalOptions {
    /// Parses options, the empty string means all defaults
    pub fn from_json(options: &str) -> Result<Self> {
        #[derive(Debug, Error, Diagnostic)]
        #[error("Invalid evaluator option: {0}")]
        #[diagnostic(code(options::invalid_value))]
        struct InvalidOption(String);

        let options = if options.trim().is_empty() {
            "{}"
        } else {
            options
        };
        let ret: EvalOptions = serde_json::from_str(options).into_diagnostic()?;
        if ret.service_batch_size == 0 {
            bail!(InvalidOption(
                "'service_batch_size' must be positive".to_string()
            ))
        }
        if let Some(secs) = ret.timeout {
            if !(secs > 0.) {
                bail!(InvalidOption("'timeout' must be positive".to_string()))
            }
        }
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options() {
        assert_eq!(EvalOptions::from_json("").unwrap(), EvalOptions::default());
        let opts =
            EvalOptions::from_json(r#"{"service_batch_size": 4, "timeout": 1.5}"#).unwrap();
        assert_eq!(opts.service_batch_size, 4);
        assert_eq!(opts.timeout, Some(1.5));
        assert!(!opts.track_result_size);

        assert!(EvalOptions::from_json("{").is_err());
        assert!(EvalOptions::from_json(r#"{"service_batch_size": 0}"#).is_err());
        assert!(EvalOptions::from_json(r#"{"batch": 3}"#).is_err());
    }
}
