//! Pull-request bot CLI.
//!
//! Turns a natural-language change request against a GitHub repository into
//! a pushed branch and pull request, streaming model output to stdout.

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use patchbot::exit_codes;
use patchbot::io::config::load_config;
use patchbot::io::github::GitHubClient;
use patchbot::io::model::CliModel;
use patchbot::io::sandbox::{LocalSandbox, Sandbox};
use patchbot::publish::ForkRetry;
use patchbot::session::{ChatRequest, Session, SessionOutcome};
use patchbot::workspace::{SystemClock, WorkspaceRegistry};

#[derive(Parser)]
#[command(
    name = "patchbot",
    version,
    about = "Turns natural-language change requests into pull requests"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one change request end to end and stream the result.
    Run {
        /// Upstream repository URL (https://github.com/<owner>/<repo>).
        #[arg(long)]
        repo_url: String,
        /// Natural-language change request.
        #[arg(long)]
        request: String,
        /// Reuse the workspace of a previous request.
        #[arg(long)]
        project_id: Option<String>,
        /// Path to config.toml.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
        /// Directory holding per-project workspaces.
        #[arg(long, default_value = ".patchbot")]
        workdir: PathBuf,
    },
}

fn main() {
    patchbot::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            repo_url,
            request,
            project_id,
            config,
            workdir,
        } => cmd_run(repo_url, request, project_id, &config, &workdir),
    }
}

fn cmd_run(
    repo_url: String,
    request: String,
    project_id: Option<String>,
    config_path: &PathBuf,
    workdir: &PathBuf,
) -> Result<i32> {
    let config = load_config(config_path)?;
    // Infrastructure preconditions come before any workspace work.
    let token = std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN is not set")?;
    let host = GitHubClient::new(token.clone())?;

    fs::create_dir_all(workdir)
        .with_context(|| format!("create workdir {}", workdir.display()))?;
    let workdir = workdir
        .canonicalize()
        .with_context(|| format!("canonicalize workdir {}", workdir.display()))?;
    let model = CliModel::new(
        config.model.command.clone(),
        workdir.join("model"),
        Duration::from_secs(config.model_timeout_secs),
        config.output_limit_bytes,
    )?;
    let registry = WorkspaceRegistry::new(
        Duration::from_secs(config.workspace_ttl_secs),
        Arc::new(SystemClock),
    );

    let output_limit = config.output_limit_bytes;
    let sandbox_root = workdir.clone();
    let sandbox_factory = move |project_id: &str| -> Result<Arc<dyn Sandbox>> {
        let sandbox = LocalSandbox::new(sandbox_root.join(project_id), output_limit)?;
        Ok(Arc::new(sandbox))
    };

    let session = Session {
        registry: &registry,
        model: &model,
        host: &host,
        config: &config,
        token: &token,
        fork_retry: ForkRetry {
            attempts: config.fork_poll_attempts,
            delay: Duration::from_secs(config.fork_poll_delay_secs),
        },
        sandbox_factory: &sandbox_factory,
    };

    let chat = ChatRequest {
        repo_url,
        user_request: request,
        project_id,
    };
    let mut stdout = std::io::stdout();
    let mut sink = |chunk: &str| {
        let _ = stdout.write_all(chunk.as_bytes());
        let _ = stdout.flush();
    };
    let outcome = session.handle(&chat, &mut sink)?;
    registry.sweep_expired();

    Ok(match outcome {
        SessionOutcome::Published(_) | SessionOutcome::NoChanges => exit_codes::OK,
        SessionOutcome::Failed { .. } => exit_codes::PUBLISH_FAILED,
    })
}
