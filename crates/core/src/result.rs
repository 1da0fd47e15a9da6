// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Persisted build result descriptor.
//!
//! Every ready build carries a `build_info.json` describing its outcome.
//! The JSON field names are part of the on-disk format and must not change.

use crate::paths::BUILD_RESULT_FNAME;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Sentinel reported in place of a real exit code when a persisted
/// descriptor is unreadable or malformed.
pub const EXIT_CODE_UNKNOWN: i32 = -999;

/// Errors reading or writing the persisted descriptor.
#[derive(Debug, Error)]
pub enum ResultError {
    #[error("could not open build result file: {0}")]
    Io(#[from] io::Error),
    #[error("could not decode build result: {0}")]
    Json(#[from] serde_json::Error),
}

/// How the client should fetch the artifacts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMethod {
    #[default]
    Rsync,
}

crate::simple_display! {
    TransportMethod {
        Rsync => "rsync",
    }
}

/// Outcome descriptor for one build.
///
/// Persisted as JSON in the pending directory just before publication, so
/// a ready path always contains a complete descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildResult {
    /// Exit status of the build container. A non-zero value is a build
    /// outcome, not a server error.
    pub exit_code: i32,
    /// Absolute path to the artifacts directory.
    pub path: PathBuf,
    pub transport_method: TransportMethod,
    /// Echo of the job parameters.
    pub params: BTreeMap<String, String>,
    /// True iff the result was served from a pre-existing ready path.
    pub cached: bool,
    /// True iff the result was obtained by waiting on another in-flight
    /// build of the same fingerprint.
    pub coalesced: bool,
}

impl BuildResult {
    /// Load the descriptor persisted in a ready build directory.
    pub fn load(ready_path: &Path) -> Result<Self, ResultError> {
        let file = fs::File::open(ready_path.join(BUILD_RESULT_FNAME))?;
        Ok(serde_json::from_reader(file)?)
    }

    /// Serialize the descriptor for the pending result file.
    pub fn to_json(&self) -> Result<Vec<u8>, ResultError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Exit code recorded in a ready build's descriptor.
///
/// A missing or malformed descriptor reports [`EXIT_CODE_UNKNOWN`] paired
/// with the underlying error; the sentinel never appears without its cause.
pub fn persisted_exit_code(ready_path: &Path) -> (i32, Option<ResultError>) {
    match BuildResult::load(ready_path) {
        Ok(result) => (result.exit_code, None),
        Err(e) => (EXIT_CODE_UNKNOWN, Some(e)),
    }
}

#[cfg(test)]
#[path = "result_tests.rs"]
mod tests;
