// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-project mutual exclusion for idempotent project bootstrap.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Keyed mutex serializing project bootstrap.
///
/// Guards only the project-level directory skeleton; it does not serialize
/// builds of the same project. Fairness is unspecified and reentrancy is
/// not supported. Entries are created on first use and kept for the
/// lifetime of the server (the key space is the set of project names).
#[derive(Debug, Default)]
pub struct ProjectLock {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ProjectLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `project`, waiting while another bootstrap
    /// holds it. The lock is released when the guard drops.
    pub async fn acquire(&self, project: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock();
            Arc::clone(locks.entry(project.to_string()).or_default())
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
#[path = "project_lock_tests.rs"]
mod tests;
