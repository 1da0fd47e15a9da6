// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory set of currently-running jobs, keyed by fingerprint.

use kiln_core::Job;
use parking_lot::Mutex;
use std::collections::HashSet;

/// Admission gate for the Work pipeline.
///
/// [`add`](JobQueue::add) is the sole gate: only the worker whose `add`
/// returned true may create the job's pending build path. Everyone else
/// polls the ready path instead. The lock is never held across I/O.
#[derive(Debug, Default)]
pub struct JobQueue {
    inner: Mutex<HashSet<String>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` as in flight. Returns true iff it was not already.
    pub fn add(&self, job: &Job) -> bool {
        self.inner.lock().insert(job.fingerprint().to_string())
    }

    /// Unregister `job`. No-op when absent.
    pub fn remove(&self, job: &Job) {
        self.inner.lock().remove(job.fingerprint());
    }

    /// Whether a build for `fingerprint` is currently in flight.
    pub fn contains(&self, fingerprint: &str) -> bool {
        self.inner.lock().contains(fingerprint)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
