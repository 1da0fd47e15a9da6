// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-job filesystem layout.
//!
//! The layout under the build path is:
//!
//! ```text
//! <build_path>/<project>/
//!   pending/<fingerprint>/    # staging, exclusive to one worker
//!   ready/<fingerprint>/      # published, immutable
//!     data/{artifacts,cache,params}
//!     build_info.json
//!     out.log
//!   latest         -> ready/<fp>   # ungrouped builds
//!   groups/<group> -> ready/<fp>   # grouped builds
//! ```

use crate::config::Config;
use crate::job::Job;
use std::path::{Path, PathBuf};

/// Staging area for in-flight builds, under the project root.
pub const PENDING_DIR: &str = "pending";
/// Published builds, under the project root.
pub const READY_DIR: &str = "ready";
/// Per-group latest symlinks, under the project root.
pub const GROUPS_DIR: &str = "groups";
/// Latest symlink name for ungrouped builds.
pub const LATEST_LINK: &str = "latest";

/// Data directory inside a build root.
pub const DATA_DIR: &str = "data";
/// Artifacts produced by the build; this is what clients fetch.
pub const ARTIFACTS_DIR: &str = "artifacts";
/// Build cache, carried across grouped builds by cloning.
pub const CACHE_DIR: &str = "cache";
/// One file per job parameter; file contents are the value.
pub const PARAMS_DIR: &str = "params";
/// Combined image-build and container output.
pub const BUILD_LOG_FNAME: &str = "out.log";
/// Persisted [`BuildResult`](crate::result::BuildResult) descriptor.
pub const BUILD_RESULT_FNAME: &str = "build_info.json";

/// Every path the pipeline touches for one job.
///
/// Derivation is total and never fails. Pending and ready share the
/// fingerprint and differ only in the top-level subdirectory, so
/// publication is a single rename within the same filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPaths {
    /// `<build_path>/<project>` — the project root.
    pub root: PathBuf,
    /// Staging directory, exclusively owned by one worker.
    pub pending: PathBuf,
    /// Published directory; once it exists it is complete and immutable.
    pub ready: PathBuf,
    /// Symlink to the most recently published build (per group when grouped).
    pub latest: PathBuf,
    /// Build log inside the pending directory.
    pub log: PathBuf,
    /// Descriptor file inside the pending directory.
    pub result_file: PathBuf,
}

impl BuildPaths {
    pub fn new(build_path: &Path, project: &str, fingerprint: &str, group: &str) -> Self {
        let root = build_path.join(project);
        let pending = root.join(PENDING_DIR).join(fingerprint);
        let ready = root.join(READY_DIR).join(fingerprint);
        let latest = if group.is_empty() {
            root.join(LATEST_LINK)
        } else {
            root.join(GROUPS_DIR).join(group)
        };
        let log = pending.join(BUILD_LOG_FNAME);
        let result_file = pending.join(BUILD_RESULT_FNAME);
        Self { root, pending, ready, latest, log, result_file }
    }

    pub fn of(cfg: &Config, job: &Job) -> Self {
        Self::new(&cfg.build_path, &job.project, job.fingerprint(), &job.group)
    }

    /// `data/` under the pending directory.
    pub fn pending_data(&self) -> PathBuf {
        self.pending.join(DATA_DIR)
    }

    /// `data/params/` under the pending directory.
    pub fn pending_params(&self) -> PathBuf {
        self.pending.join(DATA_DIR).join(PARAMS_DIR)
    }

    /// The directories every staged build root must contain.
    pub fn pending_skeleton(&self) -> [PathBuf; 4] {
        let data = self.pending.join(DATA_DIR);
        [data.clone(), data.join(CACHE_DIR), data.join(ARTIFACTS_DIR), data.join(PARAMS_DIR)]
    }

    /// Artifacts directory under the ready path — the path handed to clients.
    pub fn ready_artifacts(&self) -> PathBuf {
        self.ready.join(DATA_DIR).join(ARTIFACTS_DIR)
    }
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;
