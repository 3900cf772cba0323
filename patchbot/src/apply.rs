//! Applies generated file operations to the workspace.
//!
//! Operations run in the order supplied by the generation. Only filesystem
//! failures (and paths escaping the repository root) raise; a search/replace
//! pair that matches nothing is logged and skipped.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, instrument, warn};

use crate::core::ops::{FileOperation, PairOutcome, apply_search_replace};
use crate::io::sandbox::Sandbox;

/// Record of one applied operation, kept for the pull request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedOperation {
    pub kind: &'static str,
    /// Path relative to the repository root.
    pub path: String,
}

/// Apply operations in order; the first hard failure aborts the rest.
#[instrument(skip_all, fields(operations = operations.len()))]
pub fn apply_operations(
    sandbox: &dyn Sandbox,
    repo_path: &str,
    operations: &[FileOperation],
) -> Result<Vec<AppliedOperation>> {
    let mut applied = Vec::with_capacity(operations.len());
    for operation in operations {
        applied.push(apply_operation(sandbox, repo_path, operation)?);
    }
    Ok(applied)
}

/// Apply one operation against the sandbox filesystem.
pub fn apply_operation(
    sandbox: &dyn Sandbox,
    repo_path: &str,
    operation: &FileOperation,
) -> Result<AppliedOperation> {
    let path = resolve_under_root(repo_path, operation.path())?;
    match operation {
        FileOperation::CreateFile { content, .. } | FileOperation::RewriteFile { content, .. } => {
            sandbox.write_file(&path, content)?;
        }
        FileOperation::DeleteFile { .. } => {
            sandbox.delete_file(&path)?;
        }
        FileOperation::UpdateFile { search_replace, .. } => {
            let current = sandbox
                .read_file(&path)
                .with_context(|| format!("read {path} for update"))?;
            let (updated, outcomes) = apply_search_replace(&current, search_replace);
            for (index, outcome) in outcomes.iter().enumerate() {
                if *outcome == PairOutcome::NoMatch {
                    warn!(path = %path, pair = index, "search/replace pair matched nothing");
                }
            }
            // Unchanged content is still written back, never skipped.
            sandbox.write_file(&path, &updated)?;
        }
    }
    debug!(kind = operation.kind(), path = %path, "applied operation");
    Ok(AppliedOperation {
        kind: operation.kind(),
        path: relative_to_root(repo_path, &path),
    })
}

/// Run generated shell commands in the repository directory. A nonzero exit
/// is logged, not fatal; every command is attempted and reported.
#[instrument(skip_all, fields(commands = commands.len()))]
pub fn run_shell_commands(
    sandbox: &dyn Sandbox,
    repo_path: &str,
    commands: &[String],
    timeout: Duration,
) -> Vec<String> {
    let mut executed = Vec::with_capacity(commands.len());
    for command in commands {
        match sandbox.exec(repo_path, command, timeout) {
            Ok(output) if output.success() => {
                debug!(command, "shell command succeeded");
            }
            Ok(output) => {
                warn!(
                    command,
                    exit_code = output.exit_code,
                    timed_out = output.timed_out,
                    stderr = %output.stderr.trim(),
                    "shell command failed"
                );
            }
            Err(err) => {
                warn!(command, error = %err, "shell command could not run");
            }
        }
        executed.push(command.clone());
    }
    executed
}

/// Resolve a model-supplied path to an absolute path under the repo root.
///
/// Relative paths are joined onto the root; absolute paths must already be
/// under it. Paths escaping the root are a hard error.
fn resolve_under_root(root: &str, path: &str) -> Result<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        bail!("empty operation path");
    }
    let resolved = if trimmed == root || trimmed.starts_with(&format!("{root}/")) {
        trimmed.to_string()
    } else if trimmed.starts_with('/') {
        bail!("operation path '{trimmed}' escapes the repository root");
    } else {
        format!("{root}/{}", trimmed.trim_start_matches("./"))
    };
    if resolved.split('/').any(|segment| segment == "..") {
        bail!("operation path '{trimmed}' escapes the repository root");
    }
    Ok(resolved)
}

fn relative_to_root(root: &str, path: &str) -> String {
    path.strip_prefix(&format!("{root}/"))
        .unwrap_or(path)
        .to_string()
}
