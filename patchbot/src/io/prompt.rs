//! Prompt assembly for the three model calls.
//!
//! The generation prompt carries a contract: it must embed the request, the
//! full content of every selected file, the candidate list, and a truncated
//! project tree. Prose wording is free to change; the embedded data is not.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

const SELECT_TOOL_TEMPLATE: &str = include_str!("prompts/select_tool.md");
const NARROW_TEMPLATE: &str = include_str!("prompts/narrow.md");
const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("select_tool", SELECT_TOOL_TEMPLATE)
            .expect("select_tool template should be valid");
        env.add_template("narrow", NARROW_TEMPLATE)
            .expect("narrow template should be valid");
        env.add_template("generate", GENERATE_TEMPLATE)
            .expect("generate template should be valid");
        Self { env }
    }
}

/// One file embedded into a prompt.
#[derive(Debug, Clone, Serialize)]
pub struct FileContext {
    pub path: String,
    pub content: String,
    /// Whether the content was cut at the byte cap.
    pub truncated: bool,
}

/// Builds prompts with bounded file contents and a bounded project tree.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    file_content_limit: usize,
    tree_max_entries: usize,
}

impl PromptAssembler {
    pub fn new(file_content_limit: usize, tree_max_entries: usize) -> Self {
        Self {
            file_content_limit,
            tree_max_entries,
        }
    }

    /// Wrap a file's content for embedding, applying the byte cap.
    pub fn file_context(&self, path: &str, content: &str) -> FileContext {
        let (content, truncated) = truncate_at_boundary(content, self.file_content_limit);
        if truncated {
            debug!(path, "file content truncated for prompt");
        }
        FileContext {
            path: path.to_string(),
            content,
            truncated,
        }
    }

    pub fn build_select_tool(&self, request: &str, keywords: &BTreeSet<String>) -> Result<String> {
        let engine = PromptEngine::new();
        let template = engine.env.get_template("select_tool")?;
        let keywords: Vec<&str> = keywords.iter().map(String::as_str).collect();
        let rendered = template
            .render(context! {
                request => request.trim(),
                keywords => keywords,
            })
            .context("render select_tool prompt")?;
        Ok(rendered)
    }

    pub fn build_narrow(
        &self,
        request: &str,
        repo_path: &str,
        files: &[FileContext],
    ) -> Result<String> {
        let engine = PromptEngine::new();
        let template = engine.env.get_template("narrow")?;
        let rendered = template
            .render(context! {
                request => request.trim(),
                repo_path => repo_path,
                files => files,
            })
            .context("render narrow prompt")?;
        Ok(rendered)
    }

    pub fn build_generate(
        &self,
        request: &str,
        repo_path: &str,
        files: &[FileContext],
        candidates: &[String],
        tree: &[String],
    ) -> Result<String> {
        let engine = PromptEngine::new();
        let template = engine.env.get_template("generate")?;
        let tree_truncated = tree.len() > self.tree_max_entries;
        let bounded_tree = &tree[..tree.len().min(self.tree_max_entries)];
        let rendered = template
            .render(context! {
                request => request.trim(),
                repo_path => repo_path,
                files => files,
                candidates => candidates,
                tree => bounded_tree,
                tree_truncated => tree_truncated,
            })
            .context("render generate prompt")?;
        Ok(rendered)
    }
}

/// Truncate to at most `limit` bytes, cutting only at a char boundary.
fn truncate_at_boundary(content: &str, limit: usize) -> (String, bool) {
    if content.len() <= limit {
        return (content.to_string(), false);
    }
    let mut end = limit;
    while end > 0 && !content.is_char_boundary(end) {
        end -= 1;
    }
    (content[..end].to_string(), true)
}
