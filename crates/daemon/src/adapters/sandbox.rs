// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Container sandbox for image builds and build runs.
//!
//! The sandbox is the seam between the Work pipeline and the container
//! engine. [`DockerSandbox`] drives the `docker` CLI; its child processes
//! write straight into the build log so the pipeline never buffers build
//! output.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::fs::File;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("could not build image {image}: {reason}")]
    ImageBuild { image: String, reason: String },
    #[error("could not start container {container}: {reason}")]
    ContainerStart { container: String, reason: String },
    #[error("build cancelled")]
    Cancelled,
    #[error("sandbox i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// What the sandbox needs to build a project image.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// Image tag, derived from the project name.
    pub image: String,
    /// Build context: the project definition directory.
    pub context: PathBuf,
    /// Uid baked into the image so build output is owned by the server.
    pub uid: u32,
}

/// What the sandbox needs to run one build container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    /// Container name, derived from the job fingerprint.
    pub name: String,
    /// Host data directory, bind-mounted at /data inside the container.
    pub data_dir: PathBuf,
    pub uid: u32,
}

/// Builds images and runs build containers.
///
/// A non-zero exit status from the build container is a build outcome,
/// reported through the exit code; errors mean the sandbox itself failed.
/// Both operations honor cancellation.
#[async_trait]
pub trait BuildSandbox: Send + Sync {
    async fn build_image(
        &self,
        cancel: &CancellationToken,
        spec: &ImageSpec,
        log: &File,
    ) -> Result<(), SandboxError>;

    async fn run_container(
        &self,
        cancel: &CancellationToken,
        spec: &ContainerSpec,
        log: &File,
    ) -> Result<i32, SandboxError>;
}

/// Sandbox backed by the `docker` CLI.
pub struct DockerSandbox;

impl DockerSandbox {
    /// Spawn a docker command with stdout/stderr wired to the build log,
    /// racing completion against cancellation.
    async fn run_logged(
        cancel: &CancellationToken,
        args: &[String],
        log: &File,
    ) -> Result<std::process::ExitStatus, SandboxError> {
        let stdout = log.try_clone().await?.into_std().await;
        let stderr = log.try_clone().await?.into_std().await;

        let mut child = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()?;

        tokio::select! {
            status = child.wait() => Ok(status?),
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(SandboxError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl BuildSandbox for DockerSandbox {
    async fn build_image(
        &self,
        cancel: &CancellationToken,
        spec: &ImageSpec,
        log: &File,
    ) -> Result<(), SandboxError> {
        let args = vec![
            "build".to_string(),
            "-t".to_string(),
            spec.image.clone(),
            "--build-arg".to_string(),
            format!("uid={}", spec.uid),
            spec.context.display().to_string(),
        ];

        info!(image = %spec.image, "building image");
        let status = Self::run_logged(cancel, &args, log).await?;
        if !status.success() {
            return Err(SandboxError::ImageBuild {
                image: spec.image.clone(),
                reason: format!("{status}; see build log"),
            });
        }
        Ok(())
    }

    async fn run_container(
        &self,
        cancel: &CancellationToken,
        spec: &ContainerSpec,
        log: &File,
    ) -> Result<i32, SandboxError> {
        let args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "-u".to_string(),
            spec.uid.to_string(),
            "-v".to_string(),
            format!("{}:/data", spec.data_dir.display()),
            spec.image.clone(),
        ];

        info!(container = %spec.name, image = %spec.image, "starting container");
        let status = Self::run_logged(cancel, &args, log).await?;
        match status.code() {
            Some(code) => Ok(code),
            // Killed by a signal: the container never reported an exit code.
            None => Err(SandboxError::ContainerStart {
                container: spec.name.clone(),
                reason: format!("{status}"),
            }),
        }
    }
}

/// Test sandbox: records calls, writes a marker artifact and cache entry,
/// optionally sleeps, and returns a configured exit code or failure.
#[cfg(test)]
pub struct FakeSandbox {
    pub exit_code: i32,
    pub delay: std::time::Duration,
    pub fail_image_build: bool,
    pub fail_container: bool,
    pub calls: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl Default for FakeSandbox {
    fn default() -> Self {
        Self {
            exit_code: 0,
            delay: std::time::Duration::ZERO,
            fail_image_build: false,
            fail_container: false,
            calls: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl BuildSandbox for FakeSandbox {
    async fn build_image(
        &self,
        _cancel: &CancellationToken,
        spec: &ImageSpec,
        log: &File,
    ) -> Result<(), SandboxError> {
        self.calls.lock().push(format!("build_image:{}", spec.image));
        if self.fail_image_build {
            return Err(SandboxError::ImageBuild {
                image: spec.image.clone(),
                reason: "forced failure".to_string(),
            });
        }
        write_log_line(log, "fake: image built\n").await
    }

    async fn run_container(
        &self,
        cancel: &CancellationToken,
        spec: &ContainerSpec,
        log: &File,
    ) -> Result<i32, SandboxError> {
        self.calls.lock().push(format!("run_container:{}", spec.name));
        if self.fail_container {
            return Err(SandboxError::ContainerStart {
                container: spec.name.clone(),
                reason: "forced failure".to_string(),
            });
        }
        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => return Err(SandboxError::Cancelled),
            }
        }
        tokio::fs::write(spec.data_dir.join("artifacts").join("out.txt"), b"artifact\n")
            .await?;
        tokio::fs::write(spec.data_dir.join("cache").join("seed"), b"cached\n").await?;
        write_log_line(log, "fake: container ran\n").await?;
        Ok(self.exit_code)
    }
}

#[cfg(test)]
async fn write_log_line(log: &File, line: &str) -> Result<(), SandboxError> {
    use tokio::io::AsyncWriteExt;
    let mut log = log.try_clone().await?;
    log.write_all(line.as_bytes()).await?;
    Ok(())
}
