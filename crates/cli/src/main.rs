// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `kiln` — submit a build job to an in-process build server.
//!
//! The process exits with the build container's exit code, so scripts can
//! treat a kiln invocation like the build itself.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kiln_core::{Config, FileSystemKind, Job};
use kiln_daemon::{DockerSandbox, Server};

#[derive(Parser)]
#[command(name = "kiln", about = "Reproducible build server", version)]
struct Cli {
    /// JSON config file; when given, the path/uid/filesystem flags are ignored.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory of per-project build definitions.
    #[arg(long, global = true, default_value = "projects")]
    projects_path: PathBuf,

    /// Root directory for staged and published builds.
    #[arg(long, global = true, default_value = "builds")]
    build_path: PathBuf,

    /// Uid passed to the sandbox for build file ownership.
    #[arg(long, global = true, default_value_t = 0)]
    uid: u32,

    /// Filesystem driver: plain or btrfs.
    #[arg(long, global = true, default_value = "plain")]
    filesystem: FileSystemKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build a project and print the result descriptor.
    Build(BuildArgs),
}

#[derive(Args)]
struct BuildArgs {
    /// Project to build (a directory under the projects path).
    project: String,

    /// Build parameter, KEY=VALUE. Repeatable.
    #[arg(short = 'p', long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,

    /// Group key: seed the workspace from the group's latest build.
    #[arg(short, long, default_value = "")]
    group: String,
}

/// Parse and vet a KEY=VALUE parameter. Keys become file names under the
/// build's params directory, so path separators are rejected here.
fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() && !k.contains('/') => {
            Ok((k.to_string(), v.to_string()))
        }
        Some(_) => Err("parameter keys must be non-empty and must not contain '/'".to_string()),
        None => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config {
            projects_path: cli.projects_path.clone(),
            build_path: cli.build_path.clone(),
            uid: cli.uid,
            filesystem: cli.filesystem,
        },
    };

    match cli.command {
        Command::Build(args) => build(cfg, args).await,
    }
}

async fn build(cfg: Config, args: BuildArgs) -> Result<()> {
    let params: BTreeMap<String, String> = args.params.into_iter().collect();
    let job = Job::new(args.project, params, args.group);

    let server = Server::new(cfg, Arc::new(DockerSandbox));
    server.sweep_pending().await.context("sweeping orphaned pending builds")?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let result = server.work(&cancel, &job).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    std::process::exit(result.exit_code);
}
