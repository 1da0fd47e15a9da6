// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Work pipeline.
//!
//! [`Server::work`] decides, for one job, whether to serve a cached result,
//! wait on an in-flight twin, or perform a fresh build: stage a pending
//! directory (cloned copy-on-write from the group's latest build when one
//! exists), run the sandboxed build, then publish with a single rename so
//! readers of ready paths never observe partial state.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use kiln_core::{
    persisted_exit_code, BuildPaths, BuildResult, Config, Job, ResultError, GROUPS_DIR,
    PENDING_DIR, READY_DIR,
};

use crate::adapters::fs::{driver_for, FileSystemDriver, FsDriverError};
use crate::adapters::sandbox::{BuildSandbox, ContainerSpec, ImageSpec, SandboxError};
use crate::adapters::subprocess::{self, SubprocessError, DRIVER_COMMAND_TIMEOUT};
use crate::project_lock::ProjectLock;
use crate::queue::JobQueue;

/// How often a coalesced caller re-checks for the ready path.
///
/// Polling rather than in-process signaling keeps the wait correct when the
/// publication comes from outside this process (crash recovery, another
/// server instance on the same filesystem).
pub const POLL_READY_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum WorkError {
    /// The job names a project with no definition directory.
    #[error("work: Unknown project")]
    UnknownProject,
    /// The caller's token was cancelled while waiting on an in-flight twin.
    #[error("work: context cancelled while waiting for pending build")]
    WaitCancelled,
    /// Filesystem infrastructure failure. Not retried here; the caller may
    /// resubmit the job.
    #[error("work: {context}; {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
    /// The filesystem driver could not stage the pending directory. Also
    /// raised when a crashed process left the pending path behind: the
    /// driver refuses pre-existing destinations.
    #[error("work: could not create pending build path; {source}")]
    Stage {
        #[source]
        source: SubprocessError,
    },
    #[error("work: could not read build result; {source}")]
    ReadResult {
        #[source]
        source: ResultError,
    },
    #[error("work: could not serialize build result; {source}")]
    EncodeResult {
        #[source]
        source: ResultError,
    },
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    /// Removing the pending directory after a failure itself failed. Both
    /// causes are kept; the primary failure stays the source.
    #[error("work: could not clean hanging pending path; {cleanup} | {primary}")]
    CleanupFailed {
        cleanup: FsDriverError,
        #[source]
        primary: Box<WorkError>,
    },
}

impl WorkError {
    fn io(context: &'static str) -> impl FnOnce(io::Error) -> WorkError {
        move |source| WorkError::Io { context, source }
    }
}

/// Unregisters an admitted job from the queue when the worker exits,
/// successfully or not.
struct QueueGuard<'a> {
    queue: &'a JobQueue,
    job: &'a Job,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.queue.remove(self.job);
    }
}

/// The build server: the shared job queue, the per-project bootstrap locks,
/// and the configured adapters. [`work`](Server::work) may be called
/// concurrently from any number of tasks; the caller controls parallelism.
pub struct Server {
    cfg: Config,
    queue: JobQueue,
    project_locks: ProjectLock,
    fs: Arc<dyn FileSystemDriver>,
    sandbox: Arc<dyn BuildSandbox>,
}

impl Server {
    pub fn new(cfg: Config, sandbox: Arc<dyn BuildSandbox>) -> Self {
        let fs = driver_for(cfg.filesystem);
        Self { cfg, queue: JobQueue::new(), project_locks: ProjectLock::new(), fs, sandbox }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Whether a build for `fingerprint` is currently in flight.
    pub fn building(&self, fingerprint: &str) -> bool {
        self.queue.contains(fingerprint)
    }

    /// Perform the work denoted by `job` and return its result.
    ///
    /// Exactly one caller per fingerprint builds; identical callers are
    /// served from cache or coalesced onto the in-flight build.
    /// Cancellation is honored while waiting on a twin and inside the
    /// sandbox phases; once publication begins the call runs to completion.
    pub async fn work(
        &self,
        cancel: &CancellationToken,
        job: &Job,
    ) -> Result<BuildResult, WorkError> {
        let start = Instant::now();
        let paths = BuildPaths::of(&self.cfg, job);
        let mut result = BuildResult {
            path: paths.ready_artifacts(),
            params: job.params.clone(),
            ..BuildResult::default()
        };

        // CHECK_READY: a published twin is a cache hit.
        match tokio::fs::metadata(&paths.ready).await {
            Ok(_) => {
                let (code, err) = persisted_exit_code(&paths.ready);
                if let Some(source) = err {
                    return Err(WorkError::ReadResult { source });
                }
                result.cached = true;
                result.exit_code = code;
                info!(job = %job, exit_code = code, "served cached build");
                return Ok(result);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(WorkError::io("could not check for ready path")(e)),
        }

        // TRY_ADMIT: the queue is the sole admission gate. Losers wait for
        // the winner's publication.
        if !self.queue.add(job) {
            return self.wait_for_ready(cancel, job, &paths, result).await;
        }
        let _guard = QueueGuard { queue: &self.queue, job };

        // ENSURE_PROJECT
        match tokio::fs::metadata(self.cfg.projects_path.join(&job.project)).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WorkError::UnknownProject)
            }
            Err(e) => return Err(WorkError::io("could not check for project")(e)),
        }
        self.bootstrap_project(job, &paths)
            .await
            .map_err(WorkError::io("could not bootstrap project"))?;

        let clone_src = self.clone_source(job, &paths).await;

        info!(job = %job, cloned = clone_src.is_some(), "creating new build directory");
        let mut staged = false;
        let outcome = self.build(cancel, job, &paths, clone_src, &mut staged, result).await;

        // Cleanup-on-failure: once staging succeeded the pending path must
        // not outlive an error. Publication clears `staged`, so a published
        // build is never removed.
        match outcome {
            Ok(result) => {
                info!(
                    job = %job,
                    exit_code = result.exit_code,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "finished build"
                );
                Ok(result)
            }
            Err(primary) => {
                if staged {
                    if let Err(cleanup) = self.fs.remove(&paths.pending).await {
                        return Err(WorkError::CleanupFailed {
                            cleanup,
                            primary: Box::new(primary),
                        });
                    }
                }
                Err(primary)
            }
        }
    }

    /// Best-effort removal of pending directories orphaned by a crashed
    /// process. Call at startup, before accepting work: the in-memory queue
    /// restarts empty, so nothing under `pending/` is owned.
    pub async fn sweep_pending(&self) -> io::Result<()> {
        let mut projects = match tokio::fs::read_dir(&self.cfg.build_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        while let Some(project) = projects.next_entry().await? {
            let pending_root = project.path().join(PENDING_DIR);
            let mut orphans = match tokio::fs::read_dir(&pending_root).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(orphan) = orphans.next_entry().await? {
                warn!(path = %orphan.path().display(), "removing orphaned pending build");
                if let Err(e) = self.fs.remove(&orphan.path()).await {
                    warn!(
                        path = %orphan.path().display(),
                        error = %e,
                        "could not remove orphaned pending build"
                    );
                }
            }
        }
        Ok(())
    }

    /// POLL_READY: wait for another worker's publication of this
    /// fingerprint, re-checking every [`POLL_READY_INTERVAL`].
    async fn wait_for_ready(
        &self,
        cancel: &CancellationToken,
        job: &Job,
        paths: &BuildPaths,
        mut result: BuildResult,
    ) -> Result<BuildResult, WorkError> {
        info!(job = %job, pending = %paths.pending.display(), "waiting for pending build to complete");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(WorkError::WaitCancelled),
                _ = tokio::time::sleep(POLL_READY_INTERVAL) => {
                    match tokio::fs::metadata(&paths.ready).await {
                        Ok(_) => {
                            let (code, err) = persisted_exit_code(&paths.ready);
                            if let Some(source) = err {
                                return Err(WorkError::ReadResult { source });
                            }
                            result.exit_code = code;
                            result.coalesced = true;
                            info!(job = %job, exit_code = code, "coalesced onto finished build");
                            return Ok(result);
                        }
                        Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(WorkError::io("could not wait for ready build")(e)),
                    }
                }
            }
        }
    }

    /// Idempotently create the project's build directory skeleton.
    /// Serialized per project; builds themselves are not.
    async fn bootstrap_project(&self, job: &Job, paths: &BuildPaths) -> io::Result<()> {
        let _lock = self.project_locks.acquire(&job.project).await;
        tokio::fs::create_dir_all(&paths.root).await?;
        tokio::fs::create_dir_all(paths.root.join(PENDING_DIR)).await?;
        tokio::fs::create_dir_all(paths.root.join(READY_DIR)).await?;
        if !job.group.is_empty() {
            tokio::fs::create_dir_all(paths.root.join(GROUPS_DIR)).await?;
        }
        Ok(())
    }

    /// Resolve the latest-build symlink into a clone source for grouped
    /// jobs. Resolution errors are never fatal: the build degrades to a
    /// fresh root.
    async fn clone_source(&self, job: &Job, paths: &BuildPaths) -> Option<PathBuf> {
        if job.group.is_empty() {
            return None;
        }
        match tokio::fs::canonicalize(&paths.latest).await {
            Ok(target) => Some(target),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(job = %job, "no latest build found: {}", e);
                None
            }
            Err(e) => {
                warn!(job = %job, "could not read latest build link: {}", e);
                None
            }
        }
    }

    /// The committed phase: stage the pending directory, run the sandboxed
    /// build, persist the descriptor, and publish. Sets `staged` while the
    /// pending directory exists unpublished.
    async fn build(
        &self,
        cancel: &CancellationToken,
        job: &Job,
        paths: &BuildPaths,
        clone_src: Option<PathBuf>,
        staged: &mut bool,
        mut result: BuildResult,
    ) -> Result<BuildResult, WorkError> {
        // BOOTSTRAP_BUILD_DIR
        let argv = match &clone_src {
            Some(src) => self.fs.clone_args(src, &paths.pending),
            None => self.fs.create_args(&paths.pending),
        };
        let output = subprocess::run_argv(&argv, DRIVER_COMMAND_TIMEOUT, "stage build root")
            .await
            .map_err(|source| WorkError::Stage { source })?;
        if !output.is_empty() {
            info!(job = %job, "{}", output);
        }
        *staged = true;

        // A cloned root keeps the previous build's cache but must not keep
        // its params.
        if clone_src.is_some() {
            tokio::fs::remove_dir_all(paths.pending_params())
                .await
                .map_err(WorkError::io("could not remove params dir"))?;
        }
        for dir in paths.pending_skeleton() {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(WorkError::io("could not ensure directory exists"))?;
        }

        // WRITE_PARAMS
        self.write_params(job, paths).await?;

        // OPEN_LOG
        let mut log = tokio::fs::File::create(&paths.log)
            .await
            .map_err(WorkError::io("could not create build log file"))?;

        // BUILD_IMAGE / RUN_CONTAINER
        let image = ImageSpec {
            image: format!("kiln/{}", job.project),
            context: self.cfg.projects_path.join(&job.project),
            uid: self.cfg.uid,
        };
        self.sandbox.build_image(cancel, &image, &log).await?;

        let container = ContainerSpec {
            image: image.image,
            name: format!("kiln-{}", job.short_fingerprint()),
            data_dir: paths.pending_data(),
            uid: self.cfg.uid,
        };
        result.exit_code = self.sandbox.run_container(cancel, &container, &log).await?;

        // Close errors are composed into the returned error, not swallowed.
        log.shutdown().await.map_err(WorkError::io("could not close build log file"))?;

        // WRITE_RESULT
        let json = result.to_json().map_err(|source| WorkError::EncodeResult { source })?;
        tokio::fs::write(&paths.result_file, &json)
            .await
            .map_err(WorkError::io("could not write build result to file"))?;

        // PUBLISH: a single same-filesystem rename; the ready path never
        // partially exists. From here on the build is no longer pending.
        tokio::fs::rename(&paths.pending, &paths.ready)
            .await
            .map_err(WorkError::io("could not rename pending to ready path"))?;
        *staged = false;

        self.update_latest(paths).await?;

        Ok(result)
    }

    /// Write each parameter to its own file under `data/params`, mode 0644.
    /// Keys are taken as-is; the front-end rejects path separators.
    async fn write_params(&self, job: &Job, paths: &BuildPaths) -> Result<(), WorkError> {
        let params_dir = paths.pending_params();
        for (key, value) in &job.params {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o644)
                .open(params_dir.join(key))
                .await
                .map_err(WorkError::io("could not write param file"))?;
            file.write_all(value.as_bytes())
                .await
                .map_err(WorkError::io("could not write param file"))?;
        }
        Ok(())
    }

    /// Point the latest symlink at the just-published build.
    ///
    /// Not atomic with the publication rename: a reader in the gap sees the
    /// previous (still valid) build, and a crash here is repaired by the
    /// next successful publish.
    async fn update_latest(&self, paths: &BuildPaths) -> Result<(), WorkError> {
        if tokio::fs::symlink_metadata(&paths.latest).await.is_ok() {
            tokio::fs::remove_file(&paths.latest)
                .await
                .map_err(WorkError::io("could not remove latest build link"))?;
        }
        tokio::fs::symlink(&paths.ready, &paths.latest)
            .await
            .map_err(WorkError::io("could not create latest build link"))
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
