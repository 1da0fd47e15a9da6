// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Build job description and fingerprinting.
//!
//! A job's fingerprint is its primary key: two jobs with the same project,
//! parameters, and group are the same job, and the server will never build
//! them twice.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// A build job submitted to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Project name; must correspond to a directory under the projects path.
    pub project: String,
    /// Build-time parameters. A sorted map, so the fingerprint does not
    /// depend on insertion order.
    pub params: BTreeMap<String, String>,
    /// Optional grouping key. When non-empty, the build may seed its
    /// workspace from the latest prior build in the same group.
    pub group: String,
    /// SHA-256 digest of (project, params, group). Immutable.
    fingerprint: String,
}

impl Job {
    /// Create a job, computing its fingerprint.
    pub fn new(
        project: impl Into<String>,
        params: BTreeMap<String, String>,
        group: impl Into<String>,
    ) -> Self {
        let project = project.into();
        let group = group.into();
        let fingerprint = fingerprint(&project, &params, &group);
        Self { project, params, group, fingerprint }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Abbreviated fingerprint for logs and container names.
    pub fn short_fingerprint(&self) -> &str {
        &self.fingerprint[..12.min(self.fingerprint.len())]
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.short_fingerprint())
    }
}

/// Deterministic digest over the job identity.
///
/// The identity is rendered as canonical JSON (object keys sorted) and the
/// bytes are hashed, so equal maps always produce equal digests.
fn fingerprint(project: &str, params: &BTreeMap<String, String>, group: &str) -> String {
    let canonical = serde_json::json!({
        "group": group,
        "params": params,
        "project": project,
    })
    .to_string();
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
