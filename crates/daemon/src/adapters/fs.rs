// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Filesystem drivers for staging build roots.
//!
//! Drivers return argv rather than executing directly so a single
//! subprocess runner captures create and clone output uniformly. Both
//! commands must fail on a pre-existing destination; that failure is how
//! the pipeline detects pending directories orphaned by a crashed process.

use async_trait::async_trait;
use kiln_core::FileSystemKind;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::adapters::subprocess::{self, SubprocessError, DRIVER_COMMAND_TIMEOUT};

#[derive(Debug, Error)]
pub enum FsDriverError {
    #[error("could not remove build root {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Command(#[from] SubprocessError),
}

/// Creates and copy-on-write clones build roots.
#[async_trait]
pub trait FileSystemDriver: Send + Sync {
    /// Command that creates `path` as an empty build root.
    fn create_args(&self, path: &Path) -> Vec<String>;

    /// Command that copy-on-write clones `src` to `dst`.
    fn clone_args(&self, src: &Path, dst: &Path) -> Vec<String>;

    /// Remove a build root.
    async fn remove(&self, path: &Path) -> Result<(), FsDriverError>;
}

/// Plain directories. Cloning degrades to a recursive copy, with reflinks
/// where the underlying filesystem supports them.
pub struct PlainDriver;

#[async_trait]
impl FileSystemDriver for PlainDriver {
    fn create_args(&self, path: &Path) -> Vec<String> {
        vec!["mkdir".into(), path.display().to_string()]
    }

    fn clone_args(&self, src: &Path, dst: &Path) -> Vec<String> {
        vec![
            "cp".into(),
            "-r".into(),
            "--reflink=auto".into(),
            src.display().to_string(),
            dst.display().to_string(),
        ]
    }

    async fn remove(&self, path: &Path) -> Result<(), FsDriverError> {
        tokio::fs::remove_dir_all(path).await.map_err(|source| FsDriverError::Remove {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Btrfs subvolumes; cloning is a copy-on-write snapshot.
pub struct BtrfsDriver;

#[async_trait]
impl FileSystemDriver for BtrfsDriver {
    fn create_args(&self, path: &Path) -> Vec<String> {
        vec![
            "btrfs".into(),
            "subvolume".into(),
            "create".into(),
            path.display().to_string(),
        ]
    }

    fn clone_args(&self, src: &Path, dst: &Path) -> Vec<String> {
        vec![
            "btrfs".into(),
            "subvolume".into(),
            "snapshot".into(),
            src.display().to_string(),
            dst.display().to_string(),
        ]
    }

    async fn remove(&self, path: &Path) -> Result<(), FsDriverError> {
        let argv = vec![
            "btrfs".to_string(),
            "subvolume".to_string(),
            "delete".to_string(),
            path.display().to_string(),
        ];
        subprocess::run_argv(&argv, DRIVER_COMMAND_TIMEOUT, "btrfs subvolume delete").await?;
        Ok(())
    }
}

/// Select the driver for a configured filesystem kind.
pub fn driver_for(kind: FileSystemKind) -> Arc<dyn FileSystemDriver> {
    match kind {
        FileSystemKind::Plain => Arc::new(PlainDriver),
        FileSystemKind::Btrfs => Arc::new(BtrfsDriver),
    }
}

#[cfg(test)]
#[path = "fs_tests.rs"]
mod tests;
