// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::adapters::sandbox::FakeSandbox;
use kiln_core::FileSystemKind;
use std::collections::BTreeMap;
use tempfile::TempDir;

struct Rig {
    // Held so the temp dir outlives the server.
    _dir: TempDir,
    server: Arc<Server>,
    sandbox: Arc<FakeSandbox>,
}

/// A server over a temp tree with a `web` project defined.
fn rig_with(sandbox: FakeSandbox) -> Rig {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("projects").join("web")).unwrap();
    let cfg = Config {
        projects_path: dir.path().join("projects"),
        build_path: dir.path().join("builds"),
        uid: 0,
        filesystem: FileSystemKind::Plain,
    };
    let sandbox = Arc::new(sandbox);
    let server = Arc::new(Server::new(cfg, sandbox.clone()));
    Rig { _dir: dir, server, sandbox }
}

fn rig() -> Rig {
    rig_with(FakeSandbox::default())
}

fn job(params: &[(&str, &str)], group: &str) -> Job {
    let params: BTreeMap<String, String> =
        params.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Job::new("web", params, group)
}

#[tokio::test]
async fn fresh_build_publishes_and_links_latest() {
    let rig = rig();
    let j = job(&[("VERSION", "1")], "");

    let result = rig.server.work(&CancellationToken::new(), &j).await.unwrap();

    assert_eq!(result.exit_code, 0);
    assert!(!result.cached);
    assert!(!result.coalesced);

    let paths = BuildPaths::of(rig.server.config(), &j);
    assert_eq!(result.path, paths.ready_artifacts());
    assert!(paths.ready.is_dir());
    assert!(!paths.pending.exists());
    assert!(paths.ready_artifacts().join("out.txt").is_file());
    assert_eq!(
        std::fs::read_to_string(paths.ready.join("data").join("params").join("VERSION"))
            .unwrap(),
        "1"
    );
    assert_eq!(std::fs::read_link(&paths.latest).unwrap(), paths.ready);

    let persisted = BuildResult::load(&paths.ready).unwrap();
    assert_eq!(persisted.exit_code, 0);
    assert!(!rig.server.building(j.fingerprint()));

    let log = std::fs::read_to_string(paths.ready.join("out.log")).unwrap();
    assert!(log.contains("fake: image built"));
    assert!(log.contains("fake: container ran"));
}

#[tokio::test]
async fn nonzero_container_exit_is_not_an_error() {
    let rig = rig_with(FakeSandbox { exit_code: 2, ..FakeSandbox::default() });
    let j = job(&[], "");

    let result = rig.server.work(&CancellationToken::new(), &j).await.unwrap();

    assert_eq!(result.exit_code, 2);
    let paths = BuildPaths::of(rig.server.config(), &j);
    assert_eq!(BuildResult::load(&paths.ready).unwrap().exit_code, 2);
}

#[tokio::test]
async fn identical_job_is_served_from_cache() {
    let rig = rig();
    let j = job(&[("VERSION", "1")], "");
    let cancel = CancellationToken::new();

    let first = rig.server.work(&cancel, &j).await.unwrap();
    assert!(!first.cached);
    let calls_after_first = rig.sandbox.calls.lock().len();

    let second = rig.server.work(&cancel, &j).await.unwrap();
    assert!(second.cached);
    assert!(!second.coalesced);
    assert_eq!(second.exit_code, first.exit_code);
    // The sandbox never ran again and nothing was staged.
    assert_eq!(rig.sandbox.calls.lock().len(), calls_after_first);
    assert!(!BuildPaths::of(rig.server.config(), &j).pending.exists());
}

#[tokio::test]
async fn concurrent_twin_coalesces_onto_one_build() {
    let rig = rig_with(FakeSandbox {
        delay: Duration::from_secs(3),
        ..FakeSandbox::default()
    });
    let j = job(&[("VERSION", "1")], "");
    let cancel = CancellationToken::new();

    let spawn_work = |server: Arc<Server>, j: Job, cancel: CancellationToken| {
        tokio::spawn(async move { server.work(&cancel, &j).await })
    };
    let a = spawn_work(Arc::clone(&rig.server), j.clone(), cancel.clone());
    let b = spawn_work(Arc::clone(&rig.server), j.clone(), cancel.clone());

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    // Exactly one admitted, the other coalesced; both carry the same code.
    assert_ne!(a.coalesced, b.coalesced);
    assert!(!a.cached && !b.cached);
    assert_eq!(a.exit_code, b.exit_code);

    // Only one build ever ran.
    let calls = rig.sandbox.calls.lock();
    assert_eq!(calls.iter().filter(|c| c.starts_with("build_image:")).count(), 1);
    assert_eq!(calls.iter().filter(|c| c.starts_with("run_container:")).count(), 1);
}

#[tokio::test]
async fn grouped_build_clones_from_the_latest_in_group() {
    let rig = rig();
    let cancel = CancellationToken::new();

    let first = job(&[("A", "1"), ("EXTRA", "z")], "nightly");
    rig.server.work(&cancel, &first).await.unwrap();
    let first_paths = BuildPaths::of(rig.server.config(), &first);
    assert_eq!(std::fs::read_link(&first_paths.latest).unwrap(), first_paths.ready);

    // Plant a marker in the first build's cache; only a clone of it can
    // carry the marker into the second build.
    std::fs::write(first_paths.ready.join("data").join("cache").join("marker"), b"seed")
        .unwrap();

    let second = job(&[("A", "2")], "nightly");
    let result = rig.server.work(&cancel, &second).await.unwrap();
    assert!(!result.cached && !result.coalesced);

    let second_paths = BuildPaths::of(rig.server.config(), &second);
    assert!(second_paths.ready.join("data").join("cache").join("marker").is_file());

    // The cloned params dir was emptied: only the new job's keys survive.
    let params_dir = second_paths.ready.join("data").join("params");
    let mut entries: Vec<String> = std::fs::read_dir(&params_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    entries.sort();
    assert_eq!(entries, ["A"]);
    assert_eq!(std::fs::read_to_string(params_dir.join("A")).unwrap(), "2");

    // The group link now names the second build.
    assert_eq!(std::fs::read_link(&second_paths.latest).unwrap(), second_paths.ready);
}

#[tokio::test]
async fn unknown_project_fails_without_touching_disk() {
    let rig = rig();
    let j = Job::new("zzz", BTreeMap::new(), "");

    let err = rig.server.work(&CancellationToken::new(), &j).await.unwrap_err();

    assert!(matches!(err, WorkError::UnknownProject));
    assert!(err.to_string().contains("Unknown project"));
    assert!(!rig.server.config().build_path.join("zzz").exists());
    assert!(!rig.server.building(j.fingerprint()));
}

#[tokio::test]
async fn cancelled_waiter_fails_while_the_build_completes() {
    let rig = rig_with(FakeSandbox {
        delay: Duration::from_secs(3),
        ..FakeSandbox::default()
    });
    let j = job(&[("VERSION", "1")], "");

    let build_cancel = CancellationToken::new();
    let builder = {
        let server = Arc::clone(&rig.server);
        let j = j.clone();
        let cancel = build_cancel.clone();
        tokio::spawn(async move { server.work(&cancel, &j).await })
    };

    // Give the builder time to admit, then submit a duplicate.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let wait_cancel = CancellationToken::new();
    let waiter = {
        let server = Arc::clone(&rig.server);
        let j = j.clone();
        let cancel = wait_cancel.clone();
        tokio::spawn(async move { server.work(&cancel, &j).await })
    };

    tokio::time::sleep(Duration::from_millis(500)).await;
    let cancelled_at = Instant::now();
    wait_cancel.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, WorkError::WaitCancelled));
    assert!(err.to_string().contains("context cancelled"));
    // Cancellation is observed within one poll tick.
    assert!(cancelled_at.elapsed() < POLL_READY_INTERVAL);

    // The admitted build is unaffected and publishes normally.
    let result = builder.await.unwrap().unwrap();
    assert!(!result.cached && !result.coalesced);
    assert!(BuildPaths::of(rig.server.config(), &j).ready.is_dir());
}

#[tokio::test]
async fn failed_container_removes_the_pending_path() {
    let rig = rig_with(FakeSandbox { fail_container: true, ..FakeSandbox::default() });
    let j = job(&[("VERSION", "1")], "");

    let err = rig.server.work(&CancellationToken::new(), &j).await.unwrap_err();
    assert!(err.to_string().contains("could not start container"));

    let paths = BuildPaths::of(rig.server.config(), &j);
    assert!(!paths.pending.exists());
    assert!(!paths.ready.exists());
    assert!(!rig.server.building(j.fingerprint()));
}

#[tokio::test]
async fn failed_image_build_removes_the_pending_path() {
    let rig = rig_with(FakeSandbox { fail_image_build: true, ..FakeSandbox::default() });
    let j = job(&[], "");

    let err = rig.server.work(&CancellationToken::new(), &j).await.unwrap_err();
    assert!(err.to_string().contains("could not build image"));
    assert!(!BuildPaths::of(rig.server.config(), &j).pending.exists());
}

#[tokio::test]
async fn cancelling_the_admitted_build_removes_the_pending_path() {
    let rig = rig_with(FakeSandbox {
        delay: Duration::from_secs(5),
        ..FakeSandbox::default()
    });
    let j = job(&[], "");
    let cancel = CancellationToken::new();

    let builder = {
        let server = Arc::clone(&rig.server);
        let j = j.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { server.work(&cancel, &j).await })
    };

    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();

    let err = builder.await.unwrap().unwrap_err();
    assert!(matches!(err, WorkError::Sandbox(SandboxError::Cancelled)));

    let paths = BuildPaths::of(rig.server.config(), &j);
    assert!(!paths.pending.exists());
    assert!(!paths.ready.exists());
}

#[tokio::test]
async fn orphaned_pending_path_surfaces_as_an_error() {
    let rig = rig();
    let j = job(&[], "");
    let paths = BuildPaths::of(rig.server.config(), &j);

    // A crashed process left the pending path behind; the in-memory queue
    // knows nothing about it.
    std::fs::create_dir_all(&paths.pending).unwrap();

    let err = rig.server.work(&CancellationToken::new(), &j).await.unwrap_err();
    assert!(err.to_string().contains("could not create pending build path"));
    // Recovery is the operator's call: the orphan is left in place.
    assert!(paths.pending.exists());
    assert!(!rig.server.building(j.fingerprint()));
}

#[tokio::test]
async fn bootstrap_project_is_idempotent() {
    let rig = rig();
    let j = job(&[], "nightly");
    let paths = BuildPaths::of(rig.server.config(), &j);

    rig.server.bootstrap_project(&j, &paths).await.unwrap();
    rig.server.bootstrap_project(&j, &paths).await.unwrap();

    assert!(paths.root.join("pending").is_dir());
    assert!(paths.root.join("ready").is_dir());
    assert!(paths.root.join("groups").is_dir());
}

#[tokio::test]
async fn sweep_pending_removes_only_orphans() {
    let rig = rig();
    let j = job(&[], "");
    let paths = BuildPaths::of(rig.server.config(), &j);

    std::fs::create_dir_all(paths.root.join("pending").join("orphan")).unwrap();
    std::fs::create_dir_all(paths.root.join("ready").join("kept")).unwrap();

    rig.server.sweep_pending().await.unwrap();

    assert!(!paths.root.join("pending").join("orphan").exists());
    assert!(paths.root.join("ready").join("kept").is_dir());
}

#[tokio::test]
async fn sweep_pending_tolerates_a_missing_build_path() {
    let rig = rig();
    rig.server.sweep_pending().await.unwrap();
}
