//! Candidate narrowing: ask the model which candidates actually need edits.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::model::TextModel;
use crate::io::prompt::PromptAssembler;
use crate::io::sandbox::Sandbox;

/// Decide which candidate files must be modified for the request.
///
/// Every candidate is read best-effort: a read failure excludes that file
/// and is logged, never fatal to the batch. The model's reply is parsed by
/// keeping non-empty lines that start with the repository root; zero usable
/// lines means "nothing to modify", a valid terminal outcome.
#[instrument(skip_all, fields(candidates = candidates.len()))]
pub fn select_files_to_modify(
    model: &dyn TextModel,
    sandbox: &dyn Sandbox,
    prompts: &PromptAssembler,
    repo_path: &str,
    request: &str,
    candidates: &[String],
) -> Result<Vec<String>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let mut files = Vec::with_capacity(candidates.len());
    for path in candidates {
        match sandbox.read_file(path) {
            Ok(content) => files.push(prompts.file_context(path, &content)),
            Err(err) => warn!(path, error = %err, "skipping unreadable candidate"),
        }
    }
    if files.is_empty() {
        info!("no readable candidates");
        return Ok(Vec::new());
    }

    let prompt = prompts.build_narrow(request, repo_path, &files)?;
    let reply = model.complete(&prompt).context("narrowing model call")?;

    let mut selected = Vec::new();
    for line in reply.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with(repo_path) {
            continue;
        }
        if !selected.iter().any(|s| s == line) {
            selected.push(line.to_string());
        }
    }
    if selected.is_empty() {
        info!("model selected no files to modify");
    } else {
        debug!(selected = selected.len(), "narrowed candidates");
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedModel, ScriptedSandbox};

    fn prompts() -> PromptAssembler {
        PromptAssembler::new(10_000, 50)
    }

    #[test]
    fn keeps_only_lines_under_the_repo_root() {
        let model = ScriptedModel::new();
        model.push_completion(
            "Here you go:\n/ws/repo/math.ts\n/elsewhere/evil.ts\n\n/ws/repo/api.ts\n",
        );
        let sandbox = ScriptedSandbox::new("/ws");
        sandbox.insert_file("/ws/repo/math.ts", "add()");
        sandbox.insert_file("/ws/repo/api.ts", "route()");
        let prompts = prompts();

        let selected = select_files_to_modify(
            &model,
            &sandbox,
            &prompts,
            "/ws/repo",
            "add subtract",
            &["/ws/repo/math.ts".to_string(), "/ws/repo/api.ts".to_string()],
        )
        .expect("narrow");
        assert_eq!(selected, vec!["/ws/repo/math.ts", "/ws/repo/api.ts"]);
    }

    #[test]
    fn unreadable_candidates_are_skipped_not_fatal() {
        let model = ScriptedModel::new();
        model.push_completion("/ws/repo/math.ts\n");
        let sandbox = ScriptedSandbox::new("/ws");
        sandbox.insert_file("/ws/repo/math.ts", "add()");
        let prompts = prompts();

        let selected = select_files_to_modify(
            &model,
            &sandbox,
            &prompts,
            "/ws/repo",
            "add subtract",
            &[
                "/ws/repo/missing.ts".to_string(),
                "/ws/repo/math.ts".to_string(),
            ],
        )
        .expect("narrow");
        assert_eq!(selected, vec!["/ws/repo/math.ts"]);
    }

    #[test]
    fn empty_reply_means_nothing_to_modify() {
        let model = ScriptedModel::new();
        model.push_completion("nothing needs to change here");
        let sandbox = ScriptedSandbox::new("/ws");
        sandbox.insert_file("/ws/repo/math.ts", "add()");
        let prompts = prompts();

        let selected = select_files_to_modify(
            &model,
            &sandbox,
            &prompts,
            "/ws/repo",
            "add subtract",
            &["/ws/repo/math.ts".to_string()],
        )
        .expect("narrow");
        assert!(selected.is_empty());
    }

    #[test]
    fn no_candidates_is_a_no_op_without_model_calls() {
        let model = ScriptedModel::new();
        let sandbox = ScriptedSandbox::new("/ws");
        let prompts = prompts();

        let selected =
            select_files_to_modify(&model, &sandbox, &prompts, "/ws/repo", "req", &[])
                .expect("narrow");
        assert!(selected.is_empty());
        assert_eq!(model.completions_consumed(), 0);
    }
}
