//! End-to-end orchestration of one chat request.
//!
//! Phases run strictly sequentially: validate, workspace, fork + clone,
//! discovery, narrowing, generation (the one streaming phase), application,
//! shell commands, publish. After the textual stream, an out-of-band marker
//! plus a JSON payload reports the publish result.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::apply::{apply_operations, run_shell_commands};
use crate::core::repo::{RepoRef, parse_repo_url};
use crate::discover::DiscoveryController;
use crate::io::config::BotConfig;
use crate::io::github::CodeHost;
use crate::io::model::{ChunkSink, TextModel};
use crate::io::process::sh_quote;
use crate::io::prompt::PromptAssembler;
use crate::io::sandbox::Sandbox;
use crate::narrow::select_files_to_modify;
use crate::publish::{
    ForkInfo, ForkRetry, PublishOutcome, PublishReport, PublishRequest, PublishWorkflow,
    acquire_fork,
};
use crate::workspace::{Workspace, WorkspaceRegistry};

/// Marker appended to the stream before the success payload.
pub const PR_CREATED_MARKER: &str = "__PR_CREATED__";
/// Marker appended to the stream before the failure payload.
pub const PR_FAILED_MARKER: &str = "__PR_FAILED__";

/// One inbound change request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub repo_url: String,
    pub user_request: String,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl ChatRequest {
    /// Reject missing inputs before any side effect.
    pub fn validate(&self) -> Result<()> {
        if self.repo_url.trim().is_empty() {
            bail!("missing required field: repoUrl");
        }
        if self.user_request.trim().is_empty() {
            bail!("missing required field: userRequest");
        }
        Ok(())
    }
}

/// How one request ended, after the stream has been written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Edits were applied and a pull request was opened.
    Published(PublishReport),
    /// Narrowing selected nothing; no edits were made, nothing published.
    NoChanges,
    /// Edits were (possibly partially) applied but the request could not be
    /// published; they stay in the workspace for a retry.
    Failed { error: String },
}

/// Collaborators and knobs shared by requests.
pub struct Session<'a> {
    pub registry: &'a WorkspaceRegistry,
    pub model: &'a dyn TextModel,
    pub host: &'a dyn CodeHost,
    pub config: &'a BotConfig,
    pub token: &'a str,
    pub fork_retry: ForkRetry,
    pub sandbox_factory: &'a dyn Fn(&str) -> Result<Arc<dyn Sandbox>>,
}

impl Session<'_> {
    /// Handle one request, streaming text and terminal markers to `sink`.
    ///
    /// Errors returned here happened before any file edit; failures after
    /// edits are reported through the stream and [`SessionOutcome::Failed`].
    #[instrument(skip_all)]
    pub fn handle(&self, request: &ChatRequest, sink: ChunkSink<'_>) -> Result<SessionOutcome> {
        request.validate()?;
        let upstream = parse_repo_url(&request.repo_url)?;
        let project_id = request
            .project_id
            .clone()
            .unwrap_or_else(generated_project_id);
        info!(project_id, upstream = %upstream, "handling request");

        let workspace = self
            .registry
            .get_or_create(&project_id, || (self.sandbox_factory)(&project_id))?;
        let login = self
            .host
            .viewer_login()
            .context("resolve authenticated identity")?;
        let fork = acquire_fork(self.host, &upstream, &login, &self.fork_retry)?;
        let repo_path = self.ensure_clone(&workspace, &upstream, &fork)?;

        let prompts = PromptAssembler::new(
            self.config.file_content_limit_bytes,
            self.config.tree_max_entries,
        );
        let discovery = DiscoveryController::new(
            self.model,
            workspace.sandbox.as_ref(),
            &prompts,
            Duration::from_secs(self.config.search_timeout_secs),
        );
        let candidates = discovery.discover(&request.user_request, &repo_path);

        let selected = select_files_to_modify(
            self.model,
            workspace.sandbox.as_ref(),
            &prompts,
            &repo_path,
            &request.user_request,
            &candidates,
        )?;
        if selected.is_empty() {
            sink("No files in the repository matched this request; nothing to modify.\n");
            return Ok(SessionOutcome::NoChanges);
        }

        let mut files = Vec::with_capacity(selected.len());
        for path in &selected {
            let content = workspace
                .sandbox
                .read_file(path)
                .with_context(|| format!("read selected file {path}"))?;
            files.push(prompts.file_context(path, &content));
        }
        let tree = self.project_tree(workspace.sandbox.as_ref(), &repo_path);
        let prompt = prompts.build_generate(
            &request.user_request,
            &repo_path,
            &files,
            &selected,
            &tree,
        )?;

        let generation = self
            .model
            .generate(&prompt, sink)
            .context("generation model call")?;
        info!(
            operations = generation.file_operations.len(),
            commands = generation.shell_commands.len(),
            "generation complete"
        );

        let applied = match apply_operations(
            workspace.sandbox.as_ref(),
            &repo_path,
            &generation.file_operations,
        ) {
            Ok(applied) => applied,
            Err(err) => {
                // Edits before the failing operation are already on disk.
                let error = format!("{err:#}");
                write_failure(sink, &error);
                return Ok(SessionOutcome::Failed { error });
            }
        };
        let executed = run_shell_commands(
            workspace.sandbox.as_ref(),
            &repo_path,
            &generation.shell_commands,
            Duration::from_secs(self.config.shell_timeout_secs),
        );

        let publish_request = PublishRequest {
            repo_url: request.repo_url.clone(),
            request_text: request.user_request.clone(),
            explanation: generation.explanation.clone(),
            applied,
            executed_commands: executed,
            base_branch: None,
            author_name: self.config.author.name.clone(),
            author_email: self.config.author.email.clone(),
            timestamp: unix_now(),
        };
        let workflow = PublishWorkflow::new(
            self.host,
            workspace.sandbox.as_ref(),
            self.token,
            self.fork_retry.clone(),
            Duration::from_secs(self.config.git_timeout_secs),
            Duration::from_secs(self.config.push_timeout_secs),
        );
        match workflow.publish(&repo_path, &publish_request) {
            PublishOutcome::Created(report) => {
                write_created(sink, &report);
                Ok(SessionOutcome::Published(report))
            }
            PublishOutcome::Failed { error } => {
                write_failure(sink, &error);
                Ok(SessionOutcome::Failed { error })
            }
        }
    }

    /// Clone the fork into the workspace, or reuse an earlier clone.
    fn ensure_clone(
        &self,
        workspace: &Workspace,
        upstream: &RepoRef,
        fork: &ForkInfo,
    ) -> Result<String> {
        if let Some(path) = workspace.repo_path() {
            debug!(path, "reusing cloned workspace");
            return Ok(path);
        }
        let sandbox = workspace.sandbox.as_ref();
        sandbox.ensure_git()?;
        let base = sandbox.workdir();
        let repo_path = format!("{}/{}", base.trim_end_matches('/'), upstream.repo);
        let script = format!(
            "git clone {} {}",
            sh_quote(&fork.clone_url),
            sh_quote(&repo_path)
        );
        let output = sandbox.exec(
            &base,
            &script,
            Duration::from_secs(self.config.clone_timeout_secs),
        )?;
        if !output.success() {
            bail!("git clone failed: {}", output.stderr.trim());
        }
        workspace.set_repo_path(&repo_path);
        info!(repo_path, "cloned fork");
        Ok(repo_path)
    }

    /// Best-effort file listing for the generation prompt.
    fn project_tree(&self, sandbox: &dyn Sandbox, repo_path: &str) -> Vec<String> {
        let script = "find . -type f -not -path '*/node_modules/*' -not -path '*/.git/*' \
                      -not -path '*/dist/*' | sort";
        match sandbox.exec(
            repo_path,
            script,
            Duration::from_secs(self.config.search_timeout_secs),
        ) {
            Ok(output) if output.success() => output
                .stdout
                .lines()
                .map(|line| line.trim_start_matches("./").to_string())
                .filter(|line| !line.is_empty())
                .collect(),
            Ok(_) | Err(_) => {
                warn!("project tree listing failed");
                Vec::new()
            }
        }
    }
}

fn write_created(sink: ChunkSink<'_>, report: &PublishReport) {
    let payload = serde_json::to_string(report).unwrap_or_else(|_| "{}".to_string());
    sink(&format!("\n{PR_CREATED_MARKER}\n{payload}\n"));
}

fn write_failure(sink: ChunkSink<'_>, error: &str) {
    let payload = serde_json::json!({ "error": error }).to_string();
    sink(&format!("\n{PR_FAILED_MARKER}\n{payload}\n"));
}

fn generated_project_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("project-{millis}")
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_blank_fields() {
        let missing_request = ChatRequest {
            repo_url: "https://github.com/acme/widget".to_string(),
            user_request: "  ".to_string(),
            project_id: None,
        };
        assert!(missing_request.validate().is_err());

        let missing_url = ChatRequest {
            repo_url: String::new(),
            user_request: "do things".to_string(),
            project_id: None,
        };
        assert!(missing_url.validate().is_err());
    }

    #[test]
    fn chat_request_parses_camel_case_json() {
        let raw = r#"{"repoUrl": "https://github.com/acme/widget",
                      "userRequest": "add subtract", "projectId": "p1"}"#;
        let request: ChatRequest = serde_json::from_str(raw).expect("parse");
        assert_eq!(request.project_id.as_deref(), Some("p1"));
        assert_eq!(request.user_request, "add subtract");
    }
}
