// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Io(#[from] io::Error),
    #[error("could not parse config file: {0}")]
    Json(#[from] serde_json::Error),
}

/// A filesystem driver name that is neither `plain` nor `btrfs`.
#[derive(Debug, Error)]
#[error("unknown filesystem driver: {0}")]
pub struct UnknownFileSystem(pub String);

/// Which filesystem driver stages build directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemKind {
    /// Plain directories; cloning degrades to a recursive copy.
    #[default]
    Plain,
    /// Btrfs subvolumes; cloning is a copy-on-write snapshot.
    Btrfs,
}

crate::simple_display! {
    FileSystemKind {
        Plain => "plain",
        Btrfs => "btrfs",
    }
}

impl FromStr for FileSystemKind {
    type Err = UnknownFileSystem;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(FileSystemKind::Plain),
            "btrfs" => Ok(FileSystemKind::Btrfs),
            other => Err(UnknownFileSystem(other.to_string())),
        }
    }
}

/// Build server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory of per-project build definitions. Read-only to the server.
    pub projects_path: PathBuf,
    /// Root under which each project's pending/ready/latest tree is kept.
    pub build_path: PathBuf,
    /// Numeric uid handed to the sandbox for file ownership inside builds.
    /// Zero means the sandbox default.
    #[serde(default)]
    pub uid: u32,
    /// Filesystem driver selection.
    #[serde(default)]
    pub filesystem: FileSystemKind,
}

impl Config {
    pub fn new(projects_path: impl Into<PathBuf>, build_path: impl Into<PathBuf>) -> Self {
        Self {
            projects_path: projects_path.into(),
            build_path: build_path.into(),
            uid: 0,
            filesystem: FileSystemKind::default(),
        }
    }

    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
